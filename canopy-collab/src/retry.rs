//! Local retry with backoff for transient storage failures.

use crate::config::RetryPolicy;
use crate::error::CollabError;
use crate::storage::StoreError;

/// Run a storage call, retrying transient failures per `policy`.
///
/// Non-transient failures (encoding, corruption) are surfaced on the
/// first attempt. Exhausted retries surface as `Unavailable`.
pub async fn with_retry<T, F>(policy: &RetryPolicy, label: &str, mut call: F) -> Result<T, CollabError>
where
    F: FnMut() -> Result<T, StoreError>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match call() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                log::warn!("{label} failed (attempt {attempt}/{max_attempts}): {e}; retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    log::error!("{label} failed after {attempt} attempts: {e}");
                }
                return Err(e.into());
            }
        }
    }
}
