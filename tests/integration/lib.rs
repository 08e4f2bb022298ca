//! Helpers shared by the integration test binaries.

use std::fs;
use std::path::PathBuf;

/// Locate the compiled `runbound` binary in the workspace target directory.
///
/// Cargo sets `CARGO_MANIFEST_DIR` to the manifest directory of the package
/// being tested. We navigate up to the workspace root and look inside
/// `target/debug/`.
pub fn runbound_bin() -> PathBuf {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    // tests/integration -> workspace root
    let workspace_root = manifest_dir
        .parent()
        .expect("tests/ parent")
        .parent()
        .expect("workspace root");
    let bin = workspace_root.join("target").join("debug").join("runbound");
    assert!(
        bin.exists(),
        "runbound binary not found at {}; run `cargo build -p runbound-cli` first",
        bin.display()
    );
    bin
}

/// True when `pid` no longer runs. A zombie waiting for a reaper counts as
/// gone: it cannot execute anything.
pub fn process_is_gone(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Err(_) => true,
        Ok(stat) => {
            // The state follows the parenthesised command name.
            stat.rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
                .map_or(true, |state| state == 'Z' || state == 'X')
        }
    }
}

/// Current virtual address space size of this process in bytes.
pub fn address_space_bytes() -> u64 {
    let statm = fs::read_to_string("/proc/self/statm").expect("read /proc/self/statm");
    let pages: u64 = statm
        .split_whitespace()
        .next()
        .and_then(|field| field.parse().ok())
        .expect("statm size field");
    // SAFETY: sysconf has no preconditions
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
    pages * page_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_running() {
        assert!(!process_is_gone(std::process::id()));
    }

    #[test]
    fn test_address_space_is_measured() {
        assert!(address_space_bytes() > 0);
    }
}
