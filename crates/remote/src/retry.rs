use ledgerlabel_core::Label;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::client::{ClassificationRequest, RemoteClassifier};
use crate::error::ClassificationError;

/// Exponential backoff: attempt `n` failing waits `base * 2^(n-1)`, capped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th (1-based) failure.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_cap_ms);
        Duration::from_millis(ms)
    }

    /// Like [`Self::delay_for`], but waits at least as long as a server
    /// `Retry-After` hint, still bounded by the cap.
    pub fn delay_after(&self, attempt: u32, error: &ClassificationError) -> Duration {
        let backoff = self.delay_for(attempt);
        match error {
            ClassificationError::RateLimited {
                retry_after: Some(hint),
            } => backoff
                .max(*hint)
                .min(Duration::from_millis(self.backoff_cap_ms)),
            _ => backoff,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attempted {
    pub result: Result<Label, ClassificationError>,
    pub attempts: u32,
}

/// Calls `classifier` until it succeeds, fails non-retryably, or the
/// policy's attempt budget is spent.
pub async fn classify_with_retry(
    classifier: &dyn RemoteClassifier,
    request: &ClassificationRequest,
    policy: &RetryPolicy,
) -> Attempted {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match classifier.classify(request).await {
            Ok(label) => {
                return Attempted {
                    result: Ok(label),
                    attempts: attempt,
                }
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_after(attempt, &e);
                tracing::warn!(
                    description = %request.description,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "remote classification failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Attempted {
                    result: Err(e),
                    attempts: attempt,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use ledgerlabel_core::Money;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<Vec<Result<Label, ClassificationError>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(mut replies: Vec<Result<Label, ClassificationError>>) -> Self {
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl RemoteClassifier for Scripted {
        async fn classify(&self, _: &ClassificationRequest) -> Result<Label, ClassificationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(ClassificationError::Timeout))
        }
    }

    fn request() -> ClassificationRequest {
        ClassificationRequest {
            description: "blue bottle coffee".to_string(),
            amount: Money::from_cents(-650),
            date: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
        }
    }

    fn label() -> Label {
        Label {
            category: "Dining".to_string(),
            vendor: Some("BLUE BOTTLE".to_string()),
            confidence: Some(0.9),
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_base_ms: 1,
            backoff_cap_ms: 5,
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let p = RetryPolicy {
            max_attempts: 10,
            backoff_base_ms: 100,
            backoff_cap_ms: 1_000,
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
        assert_eq!(p.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(200), Duration::from_millis(1_000));
    }

    #[test]
    fn retry_after_hint_is_respected_but_capped() {
        let p = RetryPolicy {
            max_attempts: 3,
            backoff_base_ms: 100,
            backoff_cap_ms: 2_000,
        };
        let hinted = ClassificationError::RateLimited {
            retry_after: Some(Duration::from_secs(1)),
        };
        assert_eq!(p.delay_after(1, &hinted), Duration::from_secs(1));
        let huge = ClassificationError::RateLimited {
            retry_after: Some(Duration::from_secs(60)),
        };
        assert_eq!(p.delay_after(1, &huge), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let c = Scripted::new(vec![
            Err(ClassificationError::Timeout),
            Err(ClassificationError::RateLimited { retry_after: None }),
            Ok(label()),
        ]);
        let out = classify_with_retry(&c, &request(), &fast()).await;
        assert_eq!(out.result, Ok(label()));
        assert_eq!(out.attempts, 3);
        assert_eq!(c.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let c = Scripted::new(vec![
            Err(ClassificationError::InvalidResponse("empty".into())),
            Err(ClassificationError::InvalidResponse("empty".into())),
            Err(ClassificationError::InvalidResponse("empty".into())),
            Ok(label()),
        ]);
        let out = classify_with_retry(&c, &request(), &fast()).await;
        assert!(matches!(out.result, Err(ClassificationError::InvalidResponse(_))));
        assert_eq!(out.attempts, 3);
        assert_eq!(c.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let c = Scripted::new(vec![
            Err(ClassificationError::AuthFailure("401".into())),
            Ok(label()),
        ]);
        let out = classify_with_retry(&c, &request(), &fast()).await;
        assert!(matches!(out.result, Err(ClassificationError::AuthFailure(_))));
        assert_eq!(out.attempts, 1);
    }
}
