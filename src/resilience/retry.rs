//! Retry policy: which failures are retried and how long to wait between attempts.

use rand::Rng;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

/// Transient failure classes the resiliency layer may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    ConnectTimeout,
    /// Connection refused or reset before a response arrived.
    Connection,
    /// Upstream answered 5xx.
    ServerError,
    /// Upstream answered 429.
    RateLimited,
}

impl FailureClass {
    pub const ALL: [FailureClass; 4] = [
        FailureClass::ConnectTimeout,
        FailureClass::Connection,
        FailureClass::ServerError,
        FailureClass::RateLimited,
    ];

    /// Classify an upstream HTTP status; `None` means not transient.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            429 => Some(FailureClass::RateLimited),
            500..=599 => Some(FailureClass::ServerError),
            _ => None,
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureClass::ConnectTimeout => "connect_timeout",
            FailureClass::Connection => "connection",
            FailureClass::ServerError => "server_error",
            FailureClass::RateLimited => "rate_limited",
        })
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
    pub retryable: HashSet<FailureClass>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(120),
            jitter: true,
            retryable: FailureClass::ALL.into_iter().collect(),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retryable(mut self, classes: impl IntoIterator<Item = FailureClass>) -> Self {
        self.retryable = classes.into_iter().collect();
        self
    }

    pub fn is_retryable(&self, class: FailureClass) -> bool {
        self.retryable.contains(&class)
    }

    /// Exponential backoff after the 1-based `attempt` failed.
    ///
    /// With jitter the delay is drawn from `[exp/2, exp]`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let exp = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = exp.min(self.max_delay.as_secs_f64());
        if !self.jitter || capped <= 0.0 {
            return Duration::from_secs_f64(capped);
        }
        let half = capped / 2.0;
        Duration::from_secs_f64(half + rand::thread_rng().gen_range(0.0..=half))
    }

    /// Wait before the next attempt; an upstream hint is a lower bound.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = self.backoff(attempt);
        match retry_after {
            Some(hint) => hint.max(backoff),
            None => backoff,
        }
    }
}

/// Extract the first matching header value from a list of header names.
pub(crate) fn header_first(headers: &HeaderMap, names: &[&str]) -> Option<String> {
    for name in names {
        if let Some(v) = headers.get(*name) {
            if let Ok(s) = v.to_str() {
                let s = s.trim();
                if !s.is_empty() {
                    return Some(s.to_string());
                }
            }
        }
    }
    None
}

/// Longest upstream wait hint honoured; larger hints are clamped to it.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(600);

/// Parse `retry-after-ms`, or `retry-after` as delta-seconds or an HTTP date.
///
/// Negative and non-finite values are ignored; long waits clamp to
/// [`MAX_RETRY_AFTER`].
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    if let Some(ms) = header_first(headers, &["retry-after-ms"]).and_then(|v| v.parse::<f64>().ok())
    {
        if let Some(d) = secs_to_duration(ms / 1000.0) {
            return Some(d);
        }
    }
    let raw = header_first(headers, &["retry-after"])?;
    if let Ok(secs) = raw.parse::<f64>() {
        return secs_to_duration(secs);
    }
    let when = chrono::DateTime::parse_from_rfc2822(&raw).ok()?;
    let delta = when.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO).min(MAX_RETRY_AFTER))
}

fn secs_to_duration(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    if secs >= MAX_RETRY_AFTER.as_secs_f64() {
        return Some(MAX_RETRY_AFTER);
    }
    Duration::try_from_secs_f64(secs).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_backoff_without_jitter_is_exponential_and_capped() {
        let policy = RetryPolicy::new()
            .with_base_delay(Duration::from_millis(100))
            .with_multiplier(2.0)
            .with_max_delay(Duration::from_millis(350))
            .with_jitter(false);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_within_half_window() {
        let policy = RetryPolicy::new()
            .with_base_delay(Duration::from_secs(1))
            .with_jitter(true);
        for _ in 0..50 {
            let d = policy.backoff(2);
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(2), "{:?}", d);
        }
    }

    #[test]
    fn test_retry_after_is_a_lower_bound() {
        let policy = RetryPolicy::new()
            .with_base_delay(Duration::from_millis(10))
            .with_jitter(false);
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(10));
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(FailureClass::from_status(429), Some(FailureClass::RateLimited));
        assert_eq!(FailureClass::from_status(503), Some(FailureClass::ServerError));
        assert_eq!(FailureClass::from_status(400), None);
        assert_eq!(FailureClass::from_status(404), None);
    }

    #[test]
    fn test_parse_retry_after_variants() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("2"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(2)));

        headers.insert("retry-after-ms", HeaderValue::from_static("1500"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_millis(1500)));

        let mut dated = HeaderMap::new();
        dated.insert(
            "retry-after",
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&dated), Some(Duration::ZERO));

        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn test_parse_retry_after_rejects_hostile_values() {
        for raw in ["inf", "-inf", "NaN", "-3"] {
            let mut headers = HeaderMap::new();
            headers.insert("retry-after", HeaderValue::from_static(raw));
            assert_eq!(parse_retry_after(&headers), None, "retry-after: {}", raw);
        }

        let mut huge = HeaderMap::new();
        huge.insert("retry-after", HeaderValue::from_static("1e300"));
        assert_eq!(parse_retry_after(&huge), Some(MAX_RETRY_AFTER));

        let mut huge_ms = HeaderMap::new();
        huge_ms.insert("retry-after-ms", HeaderValue::from_static("inf"));
        huge_ms.insert("retry-after", HeaderValue::from_static("4"));
        assert_eq!(parse_retry_after(&huge_ms), Some(Duration::from_secs(4)));

        let mut far = HeaderMap::new();
        far.insert(
            "retry-after",
            HeaderValue::from_static("Fri, 31 Dec 9999 23:59:59 GMT"),
        );
        assert_eq!(parse_retry_after(&far), Some(MAX_RETRY_AFTER));
    }
}
