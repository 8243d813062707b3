//! Bounded polling
//!
//! A few remote effects are only eventually visible: credentials for a new
//! account, a freshly created role. [`until`] polls for them with a hard
//! deadline. It is never used for control record conflicts.

use crate::{OrgError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Poll `f` every `interval` until it returns `Ok(Some(_))`.
///
/// `Ok(None)` means "not yet"; an error stops polling immediately. Returns
/// [`OrgError::Timeout`] once `timeout` has elapsed without a value.
pub async fn until<T, F, Fut>(timeout: Duration, interval: Duration, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if let Some(v) = f().await? {
            if attempts > 1 {
                tracing::debug!(attempts, "condition met after retry");
            }
            return Ok(v);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(OrgError::Timeout(timeout));
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
