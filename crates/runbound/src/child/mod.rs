//! Child side of a bounded call.

pub mod abort;
pub mod installer;

use crate::channel::{abort_frame, no_payload_frame, success_frame, ChannelWriter};
use crate::limits::ResourceLimits;
use serde::Serialize;
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error, warn};

pub use abort::USER_FAILURE_EXIT;

/// Exit code of a child that could not install its limits.
pub const SETUP_FAILURE_EXIT: i32 = 71;

/// The work to run plus its arguments.
pub struct ExecutionRequest<F, A> {
    function: F,
    arguments: A,
}

impl<F, A> ExecutionRequest<F, A> {
    pub fn new(function: F, arguments: A) -> Self {
        Self {
            function,
            arguments,
        }
    }

    /// Call the function with its arguments.
    pub fn invoke<R, E>(self) -> anyhow::Result<R>
    where
        F: FnOnce(A) -> Result<R, E>,
        E: Into<anyhow::Error>,
    {
        (self.function)(self.arguments).map_err(Into::into)
    }
}

/// Run the work under the given limits and terminate the process.
///
/// Never returns: the child leaves through `_exit` so the parent's atexit
/// handlers and buffered stdio are not replayed. With `diagnostics` unset
/// the child never logs, reports panics or flushes stdio, since the locks
/// behind them may have been held by another parent thread at fork time.
pub(crate) fn run_child<F, A, R, E>(
    request: ExecutionRequest<F, A>,
    limits: &ResourceLimits,
    mut writer: ChannelWriter,
    diagnostics: bool,
) -> !
where
    F: FnOnce(A) -> Result<R, E>,
    R: Serialize,
    E: Into<anyhow::Error>,
{
    if let Err(e) = installer::install(limits, writer.as_raw_fd()) {
        if diagnostics {
            error!("refusing to run work with partially applied limits: {}", e);
        }
        exit_child(SETUP_FAILURE_EXIT, diagnostics);
    }
    abort::install_panic_hook(diagnostics);

    if diagnostics {
        debug!("limits installed, calling work");
    }
    let result = panic::catch_unwind(AssertUnwindSafe(|| request.invoke()));

    let (frame, code) = match result {
        Ok(Ok(value)) => match serde_json::to_vec(&value) {
            Ok(payload) => {
                if diagnostics {
                    debug!("work returned {} bytes of payload", payload.len());
                }
                (success_frame(&payload), 0)
            }
            Err(e) => {
                if diagnostics {
                    error!("failed to serialize work result: {}", e);
                }
                (no_payload_frame().to_vec(), USER_FAILURE_EXIT)
            }
        },
        Ok(Err(err)) => match abort::classify_error(&err) {
            Some(reason) => {
                if diagnostics {
                    warn!("work aborted: {} ({:#})", reason, err);
                }
                (abort_frame(reason).to_vec(), 0)
            }
            None => {
                if diagnostics {
                    error!("work failed: {:#}", err);
                }
                (no_payload_frame().to_vec(), USER_FAILURE_EXIT)
            }
        },
        Err(_) => {
            if diagnostics {
                error!("work panicked");
            }
            (no_payload_frame().to_vec(), USER_FAILURE_EXIT)
        }
    };

    if abort::claim_outcome() {
        writer.send(&frame);
    }
    drop(writer);
    exit_child(code, diagnostics)
}

fn exit_child(code: i32, flush: bool) -> ! {
    if flush {
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();
    }
    // SAFETY: terminates only this forked child
    unsafe { libc::_exit(code) }
}
