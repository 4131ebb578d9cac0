//! Exponential backoff with jitter, shared by the embedding client and the
//! chat client (§4.6, §4.11: "retries transient failures with exponential
//! backoff + jitter; caps total attempts").

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{AppError, AppResult};

pub async fn with_backoff<T, F, Fut>(max_attempts: u32, mut op: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 >= max_attempts => return Err(err),
            Err(AppError::Upstream(_)) => {
                let backoff_ms = 100u64 * 2u64.pow(attempt);
                let jitter_ms = rand::thread_rng().gen_range(0..=50);
                tokio::time::sleep(Duration::from_millis(backoff_ms + jitter_ms)).await;
                attempt += 1;
            }
            Err(other) => return Err(other),
        }
    }
}
