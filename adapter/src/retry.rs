//! Bounded retry with exponential backoff for transient backend errors.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tonic::{Code, Status};
use tracing::warn;

#[derive(Clone, Copy, Debug)]
pub struct Retry {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

fn retryable(code: Code) -> bool {
    matches!(code, Code::Unavailable | Code::ResourceExhausted)
}

/// The backend occasionally reports a broken stream as `Internal`
/// instead of `Unavailable`. Reclassify it so the retry loop treats it
/// as transient.
pub fn fix_rbe_internal_error(status: Status) -> Status {
    if status.code() == Code::Internal
        && (status.message().contains("RST_STREAM")
            || status.message().contains("Received unexpected EOS"))
    {
        return Status::unavailable(status.message());
    }
    status
}

impl Retry {
    /// Runs `f` until it succeeds, fails with a non-transient status, or
    /// the attempt budget runs out.
    pub async fn call<T, F, Fut>(&self, mut f: F) -> Result<T, Status>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        let mut delay = self.base_delay;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(status) => {
                    if attempt >= self.max_attempts || !retryable(status.code()) {
                        return Err(status);
                    }
                    warn!(code = ?status.code(), attempt, "transient backend error, retrying");
                    let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
                    tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                    delay = (delay * 2).min(self.max_delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors() {
        let attempts = AtomicU32::new(0);
        let result = Retry::default()
            .call(|| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Status::unavailable("backend wobble"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_fast() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), Status> = Retry::default()
            .call(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(Status::invalid_argument("bad")) }
            })
            .await;
        assert_eq!(result.unwrap_err().code(), Code::InvalidArgument);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_budget_is_bounded() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), Status> = Retry::default()
            .call(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(Status::unavailable("still down")) }
            })
            .await;
        assert_eq!(result.unwrap_err().code(), Code::Unavailable);
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn internal_stream_breakage_is_reclassified() {
        let fixed = fix_rbe_internal_error(Status::internal("HTTP/2 Received RST_STREAM"));
        assert_eq!(fixed.code(), Code::Unavailable);

        let kept = fix_rbe_internal_error(Status::internal("genuinely broken"));
        assert_eq!(kept.code(), Code::Internal);

        let kept = fix_rbe_internal_error(Status::not_found("x"));
        assert_eq!(kept.code(), Code::NotFound);
    }
}
