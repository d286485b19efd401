//! Bounded retry of transient failures.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use stevedore_common::constants::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE_DELAY};
use stevedore_common::context::Context;
use stevedore_common::error::Result;

/// How often and how long to wait before retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Fixed delay between attempts; `None` doubles from one second.
    pub delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl RetryPolicy {
    /// Builds a policy, applying defaults for unset values.
    #[must_use]
    pub fn new(max_retries: Option<u32>, delay: Option<Duration>) -> Self {
        Self {
            max_retries: max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            delay,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay.unwrap_or_else(|| {
            let exponent = attempt.saturating_sub(1).min(16);
            DEFAULT_RETRY_BASE_DELAY.saturating_mul(1 << exponent)
        })
    }
}

/// A retry about to happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEvent {
    /// Retry number, starting at 1.
    pub attempt: u32,
    /// Retries allowed in total.
    pub max_retries: u32,
    /// Wait before the retry.
    pub delay: Duration,
    /// The failure being retried.
    pub error: String,
}

impl RetryEvent {
    /// Operator-facing message, e.g. `Failed, retrying in 1s ... (1/5)`.
    #[must_use]
    pub fn message(&self) -> String {
        format!(
            "Failed, retrying in {} ... ({}/{})",
            format_duration(self.delay),
            self.attempt,
            self.max_retries
        )
    }
}

/// Callback receiving every [`RetryEvent`].
pub type RetryObserver = Arc<dyn Fn(&RetryEvent) + Send + Sync>;

/// Runs `op`, retrying transient failures according to `policy`.
///
/// The last error is returned unchanged once retries are exhausted;
/// non-transient errors are returned at once.
///
/// # Errors
///
/// Returns the error of the final attempt, or `Cancelled` if `ctx` is
/// cancelled while waiting.
pub fn retry<T>(
    ctx: &Context,
    policy: &RetryPolicy,
    observer: Option<&RetryObserver>,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let event = RetryEvent {
                    attempt,
                    max_retries: policy.max_retries,
                    delay: policy.delay_for(attempt),
                    error: e.to_string(),
                };
                tracing::warn!(
                    attempt,
                    max_retries = policy.max_retries,
                    delay = %format_duration(event.delay),
                    error = %e,
                    "{}",
                    event.message()
                );
                if let Some(observer) = observer {
                    observer(&event);
                }
                ctx.sleep(event.delay)?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Formats a duration the way Go's `time.Duration` prints: `1s`, `1.5s`,
/// `500ms`, `2m30s`, `1h0m0s`.
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000 {
        return format!("{nanos}ns");
    }
    if nanos < 1_000_000 {
        return format!("{}µs", decimal(nanos, 1_000));
    }
    if nanos < 1_000_000_000 {
        return format!("{}ms", decimal(nanos, 1_000_000));
    }
    let secs = d.as_secs();
    let (hours, minutes) = (secs / 3600, (secs % 3600) / 60);
    let seconds = decimal(u128::from(secs % 60) * 1_000_000_000 + u128::from(d.subsec_nanos()), 1_000_000_000);
    let mut out = String::new();
    if hours > 0 {
        let _ = write!(out, "{hours}h{minutes}m");
    } else if minutes > 0 {
        let _ = write!(out, "{minutes}m");
    }
    let _ = write!(out, "{seconds}s");
    out
}

/// `value / unit` with the remainder as trimmed decimal digits.
fn decimal(value: u128, unit: u128) -> String {
    let whole = value / unit;
    let fraction = value % unit;
    if fraction == 0 {
        return whole.to_string();
    }
    let width = unit.ilog10() as usize;
    let digits = format!("{fraction:0width$}");
    format!("{whole}.{}", digits.trim_end_matches('0'))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::sync::Mutex;

    use super::*;
    use stevedore_common::error::StevedoreError;

    fn transient() -> StevedoreError {
        StevedoreError::Push {
            reference: "docker://localhost/bogus/dest:latest".into(),
            message: "connection refused".into(),
            transient: true,
        }
    }

    #[test]
    fn durations_format_like_go() {
        assert_eq!(format_duration(Duration::from_secs(1)), "1s");
        assert_eq!(format_duration(Duration::from_secs(3)), "3s");
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_duration(Duration::from_secs(150)), "2m30s");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h0m0s");
        assert_eq!(format_duration(Duration::from_micros(2)), "2µs");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn message_matches_operator_format() {
        let event = RetryEvent {
            attempt: 1,
            max_retries: 5,
            delay: RetryPolicy::new(Some(5), None).delay_for(1),
            error: String::new(),
        };
        assert_eq!(event.message(), "Failed, retrying in 1s ... (1/5)");
        let fixed = RetryPolicy::new(Some(5), Some(Duration::from_secs(3)));
        assert_eq!(fixed.delay_for(1), Duration::from_secs(3));
        assert_eq!(fixed.delay_for(4), Duration::from_secs(3));
    }

    #[test]
    fn default_delay_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    }

    #[test]
    fn transient_failures_are_retried_until_success() {
        let calls = Cell::new(0);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let observer: RetryObserver = Arc::new(move |e: &RetryEvent| {
            sink.lock().expect("events").push(e.message());
        });
        let policy = RetryPolicy::new(Some(3), Some(Duration::from_millis(1)));

        let value = retry(&Context::new(), &policy, Some(&observer), || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 { Err(transient()) } else { Ok(7) }
        })
        .expect("third attempt succeeds");

        assert_eq!(value, 7);
        assert_eq!(
            *events.lock().expect("events"),
            vec![
                "Failed, retrying in 1ms ... (1/3)".to_string(),
                "Failed, retrying in 1ms ... (2/3)".to_string(),
            ]
        );
    }

    #[test]
    fn exhausted_retries_return_last_error() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::new(Some(2), Some(Duration::from_millis(1)));
        let err = retry::<()>(&Context::new(), &policy, None, || {
            calls.set(calls.get() + 1);
            Err(transient())
        })
        .expect_err("always fails");
        assert_eq!(calls.get(), 3);
        assert!(matches!(err, StevedoreError::Push { transient: true, .. }));
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        let calls = Cell::new(0);
        let err = retry::<()>(&Context::new(), &RetryPolicy::default(), None, || {
            calls.set(calls.get() + 1);
            Err(StevedoreError::InvalidReference {
                reference: "docker://".into(),
                message: "empty reference".into(),
            })
        })
        .expect_err("fails");
        assert_eq!(calls.get(), 1);
        assert!(matches!(err, StevedoreError::InvalidReference { .. }));
    }

    #[test]
    fn cancellation_interrupts_the_wait() {
        let ctx = Context::new();
        let cancel = ctx.clone();
        let observer: RetryObserver = Arc::new(move |_: &RetryEvent| cancel.cancel());
        let policy = RetryPolicy::new(Some(5), Some(Duration::from_secs(60)));
        let err = retry::<()>(&ctx, &policy, Some(&observer), || Err(transient()))
            .expect_err("cancelled");
        assert!(matches!(err, StevedoreError::Cancelled));
    }

    #[test]
    fn unbounded_delay_waits_for_cancellation() {
        let ctx = Context::new();
        let cancel = ctx.clone();
        let observer: RetryObserver = Arc::new(move |_: &RetryEvent| cancel.cancel());
        let policy = RetryPolicy::new(Some(1), Some(Duration::MAX));
        let err = retry::<()>(&ctx, &policy, Some(&observer), || Err(transient()))
            .expect_err("cancelled");
        assert!(matches!(err, StevedoreError::Cancelled));
    }
}
