//! Reusable wrapper binding a function to a set of limits.

use crate::error::ExecError;
use crate::limits::ResourceLimits;
use crate::outcome::ExecutionOutcome;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A function that always runs under the same [`ResourceLimits`].
///
/// ```rust,no_run
/// use runbound::ResourceLimits;
///
/// let square = ResourceLimits::new()
///     .with_wall_time(2)
///     .wrap(|n: u64| Ok::<_, std::io::Error>(n * n));
///
/// let outcome = square.call(12).unwrap();
/// assert_eq!(outcome.success(), Some(144));
/// ```
#[derive(Debug, Clone)]
pub struct LimitedFn<F> {
    limits: ResourceLimits,
    function: F,
}

impl<F> LimitedFn<F> {
    /// Bind `function` to `limits`.
    pub fn new(limits: ResourceLimits, function: F) -> Self {
        Self { limits, function }
    }

    /// The limits every call runs under.
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Run the function once in a bounded child.
    pub fn call<A, R, E>(&self, arguments: A) -> Result<ExecutionOutcome<R>, ExecError>
    where
        F: Fn(A) -> Result<R, E>,
        R: Serialize + DeserializeOwned,
        E: Into<anyhow::Error>,
    {
        crate::execute(|args| (self.function)(args), arguments, &self.limits)
    }
}

impl ResourceLimits {
    /// Bind a function to these limits.
    pub fn wrap<F>(self, function: F) -> LimitedFn<F> {
        LimitedFn::new(self, function)
    }
}
