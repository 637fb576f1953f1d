//! Timeout enforcement.
//!
//! Every provider call has a deadline; an elapsed deadline is a transient failure.

use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

use crate::geocode::{ResolveError, ResolveResult};

/// Run `fut` with a deadline.
pub async fn with_deadline<T, F>(limit: Duration, what: &str, fut: F) -> ResolveResult<T>
where
    F: Future<Output = ResolveResult<T>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ResolveError::Transient(format!(
            "{} timed out after {}s",
            what,
            limit.as_secs_f32()
        ))),
    }
}
