//! Async entry point for callers running inside tokio.

use crate::error::ExecError;
use crate::limits::ResourceLimits;
use crate::outcome::ExecutionOutcome;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Run [`execute`](crate::execute) on tokio's blocking pool.
///
/// The supervisor blocks in `poll(2)` for the whole call, so it must not
/// occupy an async worker thread.
pub async fn execute_async<F, A, R, E>(
    function: F,
    arguments: A,
    limits: ResourceLimits,
) -> Result<ExecutionOutcome<R>, ExecError>
where
    F: FnOnce(A) -> Result<R, E> + Send + 'static,
    A: Send + 'static,
    R: Serialize + DeserializeOwned + Send + 'static,
    E: Into<anyhow::Error> + 'static,
{
    tokio::task::spawn_blocking(move || crate::execute(function, arguments, &limits))
        .await
        .map_err(|e| ExecError::Join(e.to_string()))?
}
