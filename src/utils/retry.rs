use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::store::errors::StoreError;

/// Lock contention is retried this many times before it counts as fatal.
pub(crate) const DB_CONTENTION_RETRIES: u32 = 1;

const DB_CONTENTION_DELAY: Duration = Duration::from_millis(250);

/// Execute a database operation, repeating it while it fails with a
/// retryable [`StoreError`]. Other errors are returned immediately.
///
/// Every attempt must run in its own transaction so a failed attempt leaves
/// nothing behind.
pub(crate) async fn execute_with_retries<F, Fut, T>(
    operation: F,
    operation_name: &str,
) -> Result<T, StoreError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < DB_CONTENTION_RETRIES => {
                attempt += 1;
                warn!(
                    operation = operation_name,
                    attempt,
                    max_retries = DB_CONTENTION_RETRIES,
                    error = %e,
                    "Database contention, retrying..."
                );
                sleep(DB_CONTENTION_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
}
