//! End-to-end behaviour of bounded calls.
//!
//! Every test forks a real child. Memory ceilings are only used where the
//! child is expected to fail: the test harness already has a large address
//! space, so a small `RLIMIT_AS` leaves no headroom for a successful call.

use nix::sys::resource::{getrlimit, Resource};
use runbound::{execute, AbortReason, ExecutionOutcome, ResourceLimits};
use runbound_integration_tests::{address_space_bytes, process_is_gone};
use std::fs;
use std::hint::black_box;
use std::io;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

fn busy_loop(_: ()) -> anyhow::Result<u64> {
    let mut counter: u64 = 0;
    loop {
        counter = black_box(counter.wrapping_add(1));
        if counter == u64::MAX {
            return Ok(counter);
        }
    }
}

#[test]
fn test_simple_value_is_returned() {
    let limits = ResourceLimits::new().with_wall_time(5);
    let outcome = execute(|(a, b): (i64, i64)| Ok::<_, anyhow::Error>(a * b), (6, 7), &limits)
        .unwrap();
    assert_eq!(outcome, ExecutionOutcome::Success(42));
}

#[test]
fn test_structured_value_is_returned() {
    let outcome = execute(
        |n: usize| Ok::<_, anyhow::Error>((0..n).map(|i| i * i).collect::<Vec<_>>()),
        5,
        &ResourceLimits::unlimited(),
    )
    .unwrap();
    assert_eq!(outcome.success(), Some(vec![0, 1, 4, 9, 16]));
}

#[test]
fn test_memory_exhaustion_is_aborted() {
    let limits = ResourceLimits::new().with_memory(50_000_000).with_wall_time(10);
    let outcome = execute(
        |size: usize| {
            let block = vec![1u8; size];
            Ok::<_, anyhow::Error>(black_box(block).len())
        },
        1_000_000_000,
        &limits,
    )
    .unwrap();
    assert_eq!(outcome, ExecutionOutcome::Aborted(AbortReason::MemoryLimit));
}

#[test]
fn test_reservation_failure_is_aborted() {
    let limits = ResourceLimits::new().with_memory(50_000_000).with_wall_time(10);
    let outcome = execute(
        |size: usize| {
            let mut block: Vec<u8> = Vec::new();
            block.try_reserve_exact(size)?;
            Ok::<_, anyhow::Error>(block.capacity())
        },
        1_000_000_000,
        &limits,
    )
    .unwrap();
    assert_eq!(outcome, ExecutionOutcome::Aborted(AbortReason::MemoryLimit));
}

#[test]
fn test_recovered_panic_does_not_mask_memory_abort() {
    // room for the panic machinery, none for the large block
    let headroom = 1 << 30;
    let limits = ResourceLimits::new()
        .with_memory(address_space_bytes() + headroom)
        .with_wall_time(10);
    let outcome = execute(
        |size: usize| {
            let recovered = std::panic::catch_unwind(|| panic!("handled inside the work"));
            assert!(recovered.is_err());
            let block = vec![1u8; size];
            Ok::<_, anyhow::Error>(black_box(block).len())
        },
        16_000_000_000,
        &limits,
    )
    .unwrap();
    assert_eq!(outcome, ExecutionOutcome::Aborted(AbortReason::MemoryLimit));
}

#[test]
fn test_cpu_exhaustion_is_aborted() {
    let limits = ResourceLimits::new().with_cpu_time(1).with_wall_time(20);
    let outcome = execute(busy_loop, (), &limits).unwrap();
    assert_eq!(outcome, ExecutionOutcome::Aborted(AbortReason::CpuTime));
}

#[test]
fn test_wall_clock_expiry_times_out() {
    let limits = ResourceLimits::new().with_wall_time(1).with_grace_period(1);
    let started = Instant::now();
    let outcome = execute(
        |secs: u64| {
            thread::sleep(Duration::from_secs(secs));
            Ok::<_, anyhow::Error>(())
        },
        10,
        &limits,
    )
    .unwrap();

    assert_eq!(outcome, ExecutionOutcome::TimedOut);
    assert!(
        started.elapsed() < Duration::from_secs(4),
        "timeout took {:?}",
        started.elapsed()
    );
}

#[test]
fn test_descendants_ignoring_sigterm_are_killed() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("grandchild.pid");

    let limits = ResourceLimits::new().with_wall_time(1).with_grace_period(1);
    let started = Instant::now();
    let outcome = execute(
        |pid_file: std::path::PathBuf| {
            let mut child = Command::new("sh")
                .arg("-c")
                .arg("trap '' TERM; sleep 30")
                .spawn()?;
            fs::write(&pid_file, child.id().to_string())?;
            child.wait()?;
            Ok::<_, anyhow::Error>(())
        },
        pid_file.clone(),
        &limits,
    )
    .unwrap();

    assert_eq!(outcome, ExecutionOutcome::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(6));

    let pid: u32 = fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while !process_is_gone(pid) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert!(process_is_gone(pid), "descendant {} survived the group kill", pid);
}

#[test]
fn test_forked_descendant_cannot_replace_outcome() {
    let limits = ResourceLimits::new().with_cpu_time(1).with_wall_time(20);
    let outcome = execute(
        |()| {
            // SAFETY: the forked process only spins until the CPU ceiling kills it
            let pid = unsafe { libc::fork() };
            if pid == 0 {
                let mut counter: u64 = 0;
                loop {
                    counter = black_box(counter.wrapping_add(1));
                }
            }
            anyhow::ensure!(pid > 0, "fork failed");

            thread::sleep(Duration::from_secs(3));
            let mut status = 0;
            // SAFETY: pid is our own child
            unsafe { libc::waitpid(pid, &mut status, 0) };
            Ok(7)
        },
        (),
        &limits,
    )
    .unwrap();
    assert_eq!(outcome, ExecutionOutcome::Success(7));
}

fn current_limit(resource: Resource) -> (u64, u64) {
    let (soft, hard) = getrlimit(resource).expect("getrlimit");
    (soft as u64, hard as u64)
}

#[test]
fn test_installed_ceilings_hold_requested_values() {
    let memory = 1u64 << 40;
    let limits = ResourceLimits::new()
        .with_max_processes(4096)
        .with_memory(memory)
        .with_cpu_time(30)
        .with_wall_time(10);

    let outcome = execute(
        |()| {
            Ok::<_, anyhow::Error>((
                current_limit(Resource::RLIMIT_NPROC),
                current_limit(Resource::RLIMIT_AS),
                current_limit(Resource::RLIMIT_CPU),
            ))
        },
        (),
        &limits,
    )
    .unwrap();

    let (_, inherited_cpu_hard) = current_limit(Resource::RLIMIT_CPU);
    let (nproc, address_space, cpu) = outcome.success().expect("limits reported");
    assert_eq!(nproc, (4096, 4096));
    assert_eq!(address_space, (memory, memory));
    assert_eq!(cpu, (30, 31.min(inherited_cpu_hard)));
}

#[test]
fn test_process_refusal_is_aborted() {
    let outcome = execute(
        |()| -> anyhow::Result<()> {
            Err(io::Error::from_raw_os_error(libc::EAGAIN).into())
        },
        (),
        &ResourceLimits::new().with_wall_time(5),
    )
    .unwrap();
    assert_eq!(outcome, ExecutionOutcome::Aborted(AbortReason::ProcessLimit));
}

#[test]
fn test_work_error_crashes_and_parent_stays_usable() {
    let limits = ResourceLimits::new().with_wall_time(5);
    let outcome = execute(
        |()| -> anyhow::Result<i32> { anyhow::bail!("the work failed") },
        (),
        &limits,
    )
    .unwrap();
    match outcome {
        ExecutionOutcome::CrashedExitCode(code) => assert_ne!(code, 0),
        other => panic!("Expected a crash, got {:?}", other),
    }

    let again = execute(|()| Ok::<_, anyhow::Error>(1), (), &limits).unwrap();
    assert_eq!(again, ExecutionOutcome::Success(1));
}

#[test]
fn test_panic_is_reported_as_crash() {
    let outcome = execute(
        |()| -> anyhow::Result<i32> { panic!("boom") },
        (),
        &ResourceLimits::new().with_wall_time(5),
    )
    .unwrap();
    assert_eq!(outcome, ExecutionOutcome::CrashedExitCode(1));
}

#[test]
fn test_repeated_calls_agree() {
    let limits = ResourceLimits::new().with_cpu_time(1).with_wall_time(20);
    let first = execute(busy_loop, (), &limits).unwrap();
    let second = execute(busy_loop, (), &limits).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_unlimited_call_matches_direct_call() {
    let work = |text: String| Ok::<_, anyhow::Error>(text.chars().rev().collect::<String>());
    let direct = work("runbound".to_string()).unwrap();
    let bounded = execute(work, "runbound".to_string(), &ResourceLimits::unlimited()).unwrap();
    assert_eq!(bounded, ExecutionOutcome::Success(direct));
}

#[test]
fn test_wrapped_function_is_reusable() {
    let square = ResourceLimits::new()
        .with_wall_time(5)
        .wrap(|n: u64| Ok::<_, anyhow::Error>(n * n));

    assert_eq!(square.call(3).unwrap(), ExecutionOutcome::Success(9));
    assert_eq!(square.call(4).unwrap(), ExecutionOutcome::Success(16));
}

#[tokio::test]
async fn test_async_calls_run_concurrently() {
    let limits = ResourceLimits::new().with_wall_time(5);
    let (a, b) = tokio::join!(
        runbound::execute_async(|n: u32| Ok::<_, anyhow::Error>(n + 1), 1, limits.clone()),
        runbound::execute_async(|n: u32| Ok::<_, anyhow::Error>(n + 2), 1, limits),
    );
    assert_eq!(a.unwrap(), ExecutionOutcome::Success(2));
    assert_eq!(b.unwrap(), ExecutionOutcome::Success(3));
}
