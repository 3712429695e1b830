//! Retry with exponential backoff.
//!
//! Uses `backon` for the jittered delay sequence. The loop adds the pieces
//! the delay iterator does not cover: an overall deadline measured from the
//! first attempt, retryable-vs-fatal classification, the two observer hooks,
//! and prompt abort on scope cancellation.

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::Result;

/// Overall retry deadline applied when callers do not choose their own.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Fallback delay if the backoff iterator is ever exhausted.
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Standard backoff for database and stream-store operations.
///
/// - Min delay: 128ms
/// - Max delay: 1m
/// - Full jitter, unlimited attempts (the deadline bounds the loop)
pub fn default_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(128))
        .with_max_delay(Duration::from_secs(60))
        .with_jitter()
        .without_max_times()
}

/// Tight backoff for high-frequency statements such as cleanup rounds.
///
/// - Min delay: 1ms
/// - Max delay: 1s
pub fn quick_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_secs(1))
        .with_jitter()
        .without_max_times()
}

/// Called on every retryable error with the previous error's message, so the
/// hook can suppress repeated identical log lines.
pub type OnRetryable = Box<dyn FnMut(&Error, Option<&str>) + Send>;

/// Called once on eventual success with elapsed time and attempt count,
/// only when more than one attempt was needed.
pub type OnSuccess = Box<dyn FnMut(Duration, u64) + Send>;

/// Observer hooks and the overall deadline for a retried operation.
#[derive(Default)]
pub struct Settings {
    /// Deadline measured from the first attempt. `None` retries forever.
    pub timeout: Option<Duration>,
    pub on_retryable: Option<OnRetryable>,
    pub on_success: Option<OnSuccess>,
}

impl Settings {
    pub fn with_timeout(timeout: Duration) -> Self {
        Settings {
            timeout: Some(timeout),
            ..Default::default()
        }
    }

    pub fn on_retryable(mut self, hook: OnRetryable) -> Self {
        self.on_retryable = Some(hook);
        self
    }

    pub fn on_success(mut self, hook: OnSuccess) -> Self {
        self.on_success = Some(hook);
        self
    }
}

/// Repeatedly invoke `op` until it succeeds, fails with a non-retryable
/// error, the deadline elapses, or `token` is cancelled.
pub async fn with_backoff<T, F, Fut, C>(
    token: &CancellationToken,
    mut op: F,
    classify: C,
    backoff: ExponentialBuilder,
    mut settings: Settings,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    C: Fn(&Error) -> bool,
{
    let start = Instant::now();
    let deadline = settings.timeout.map(|t| start + t);
    let mut delays = backoff.build();
    let mut attempt: u64 = 0;
    let mut last_message: Option<String> = None;

    loop {
        attempt += 1;

        let result = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            result = op() => result,
        };

        let err = match result {
            Ok(value) => {
                if attempt > 1 {
                    if let Some(hook) = settings.on_success.as_mut() {
                        hook(start.elapsed(), attempt);
                    }
                }
                return Ok(value);
            }
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) if classify(&err) => err,
            Err(err) => return Err(err),
        };

        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Error::DeadlineExceeded {
                attempts: attempt,
                source: Box::new(err),
            });
        }

        if let Some(hook) = settings.on_retryable.as_mut() {
            hook(&err, last_message.as_deref());
        }
        last_message = Some(err.to_string());

        let mut delay = delays.next().unwrap_or(MAX_DELAY);
        if let Some(d) = deadline {
            delay = delay.min(d.saturating_duration_since(Instant::now()));
        }

        tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
