//! Retry of catalog writes on transient SQLite lock contention
//!
//! WAL mode plus `busy_timeout` absorbs most contention. Under heavy
//! concurrent ingest a write can still see "database is locked"; such
//! writes are retried with exponential backoff (10 ms doubling to 1 s)
//! until `max_lock_wait_ms` has elapsed. Any other error returns at once.

use crate::error::ArchiveResult;
use std::future::Future;
use std::time::{Duration, Instant};

pub async fn retry_on_lock<F, Fut, T>(
    operation_name: &str,
    max_wait_ms: u64,
    mut operation: F,
) -> ArchiveResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ArchiveResult<T>>,
{
    let start = Instant::now();
    let max_duration = Duration::from_millis(max_wait_ms);
    let mut attempt = 0u32;
    let mut backoff_ms = 10u64;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Catalog write succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) if err.is_lock_contention() => {
                let elapsed = start.elapsed();
                if elapsed >= max_duration {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        max_wait_ms,
                        "Catalog still locked, giving up"
                    );
                    return Err(err);
                }

                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms,
                    "Catalog locked, retrying after backoff"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(1000);
            }
            Err(err) => return Err(err),
        }
    }
}
