use anyhow::Result;

/// Extension methods for results of operations that are followed by a
/// mandatory cleanup step.
pub trait ResultExt<T> {
    /// Combine this (primary) result with the result of a cleanup step.
    ///
    /// A cleanup failure never hides a primary failure: if both failed, the
    /// primary error is returned with the cleanup failure attached as context,
    /// so downcasting still finds the original error.  If only the cleanup
    /// failed, its error is returned.
    fn compose_cleanup(self, cleanup: Result<()>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn compose_cleanup(self, cleanup: Result<()>) -> Result<T> {
        match (self, cleanup) {
            (Ok(v), Ok(())) => Ok(v),
            (Ok(_), Err(cleanup)) => Err(cleanup),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup)) => {
                tracing::warn!("Cleanup failed after error: {cleanup:#}");
                Err(e.context(format!("additionally, cleanup failed: {cleanup:#}")))
            }
        }
    }
}
