pub mod format;
pub mod retry;
pub mod telegram;

use crate::error::{DispatchError, SendError};
use crate::parser::AppointmentRecord;
use async_trait::async_trait;
use log::{info, warn};
use retry::RetryPolicy;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Outbound notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_message(&self, chat_target: &str, html: &str) -> Result<(), SendError>;
}

/// Per-cycle ceiling on successful notifications.
///
/// A slot is reserved before the first attempt and handed back if the
/// delivery fails, so concurrent dispatchers can never overshoot.
#[derive(Debug)]
pub struct DispatchQuota {
    limit: u32,
    used: AtomicU32,
}

impl DispatchQuota {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            used: AtomicU32::new(0),
        }
    }

    pub fn try_reserve(&self) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < self.limit).then_some(used + 1)
            })
            .is_ok()
    }

    pub fn refund(&self) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| used.checked_sub(1));
    }

    pub fn reset(&self) {
        self.used.store(0, Ordering::Release);
    }

    pub fn used(&self) -> u32 {
        self.used.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sent {
    pub attempts: u32,
}

pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
    chat_target: String,
    quota: DispatchQuota,
    retry: RetryPolicy,
    attempt_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        chat_target: impl Into<String>,
        quota_limit: u32,
        retry: RetryPolicy,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            notifier,
            chat_target: chat_target.into(),
            quota: DispatchQuota::new(quota_limit),
            retry,
            attempt_timeout,
        }
    }

    pub fn quota(&self) -> &DispatchQuota {
        &self.quota
    }

    /// Called at the start of every cycle.
    pub fn reset_quota(&self) {
        self.quota.reset();
    }

    pub async fn dispatch(&self, record: &AppointmentRecord) -> Result<Sent, DispatchError> {
        if !self.quota.try_reserve() {
            return Err(DispatchError::QuotaExceeded);
        }

        let html = format::render_alert(record);
        match self.deliver(&html).await {
            Ok(sent) => {
                info!(
                    "Notified {} ({:?}) after {} attempt(s)",
                    record.message_id, record.confidence, sent.attempts
                );
                Ok(sent)
            }
            Err(e) => {
                self.quota.refund();
                Err(e)
            }
        }
    }

    /// Operator message outside the quota.
    pub async fn send_status(&self, html: &str) -> Result<Sent, DispatchError> {
        self.deliver(html).await
    }

    async fn deliver(&self, html: &str) -> Result<Sent, DispatchError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let outcome = match tokio::time::timeout(
                self.attempt_timeout,
                self.notifier.send_message(&self.chat_target, html),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(SendError::Transient(format!(
                    "attempt timed out after {:?}",
                    self.attempt_timeout
                ))),
            };

            let err = match outcome {
                Ok(()) => return Ok(Sent { attempts }),
                Err(SendError::Permanent(reason)) => {
                    warn!("Notification rejected permanently: {reason}");
                    return Err(DispatchError::Permanent(reason));
                }
                Err(err) => err,
            };

            if !self.retry.should_retry(attempts, &err) {
                warn!("Notification failed after {attempts} attempt(s): {err}");
                return Err(DispatchError::Exhausted {
                    attempts,
                    last_error: err,
                });
            }

            let delay = self.retry.delay_after(attempts, &err);
            warn!("Notification attempt {attempts} failed ({err}), retrying in {delay:?}");
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageId;
    use crate::parser::{Confidence, SourceContext};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Default)]
    struct ScriptedNotifier {
        script: Mutex<VecDeque<Result<(), SendError>>>,
        calls: Mutex<Vec<Instant>>,
        hang: bool,
    }

    impl ScriptedNotifier {
        fn with(script: Vec<Result<(), SendError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Notifier for ScriptedNotifier {
        async fn send_message(&self, _chat_target: &str, _html: &str) -> Result<(), SendError> {
            self.calls.lock().unwrap().push(Instant::now());
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(SendError::Transient("connection reset".into())))
        }
    }

    fn record(id: &str) -> AppointmentRecord {
        AppointmentRecord {
            date: None,
            location: None,
            link: Some("https://tlscontact.com/confirm/abc".to_string()),
            message_id: MessageId::new(id),
            confidence: Confidence::LowConfidence,
            context: SourceContext {
                sender: "noreply@tlscontact.com".to_string(),
                subject: "RDV".to_string(),
                labels: Vec::new(),
                excerpt: String::new(),
            },
        }
    }

    fn dispatcher(notifier: Arc<dyn Notifier>, quota: u32) -> Dispatcher {
        Dispatcher::new(
            notifier,
            "chat",
            quota,
            RetryPolicy::new(4, Duration::from_secs(1), Duration::from_secs(8)),
            Duration::from_secs(10),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_back_off_then_exhaust() {
        let notifier = ScriptedNotifier::with(Vec::new());
        let dispatcher = dispatcher(notifier.clone(), 3);

        let err = dispatcher.dispatch(&record("a")).await.unwrap_err();

        assert!(matches!(err, DispatchError::Exhausted { attempts: 4, .. }));
        let calls = notifier.calls.lock().unwrap().clone();
        let gaps: Vec<u64> = calls.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect();
        assert_eq!(gaps, vec![1, 2, 4]);
        // Failed delivery does not consume quota.
        assert_eq!(dispatcher.quota().used(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let notifier = ScriptedNotifier::with(vec![
            Err(SendError::Transient("503".into())),
            Ok(()),
        ]);
        let dispatcher = dispatcher(notifier.clone(), 3);

        let sent = dispatcher.dispatch(&record("a")).await.unwrap();

        assert_eq!(sent, Sent { attempts: 2 });
        assert_eq!(dispatcher.quota().used(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let notifier = ScriptedNotifier::with(vec![Err(SendError::Permanent("chat not found".into()))]);
        let dispatcher = dispatcher(notifier.clone(), 3);

        let err = dispatcher.dispatch(&record("a")).await.unwrap_err();

        assert!(matches!(err, DispatchError::Permanent(_)));
        assert_eq!(notifier.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_hint_sets_delay() {
        let notifier = ScriptedNotifier::with(vec![
            Err(SendError::RateLimited {
                retry_after: Some(Duration::from_secs(5)),
            }),
            Ok(()),
        ]);
        let dispatcher = dispatcher(notifier.clone(), 3);

        dispatcher.dispatch(&record("a")).await.unwrap();

        let calls = notifier.calls.lock().unwrap().clone();
        assert_eq!((calls[1] - calls[0]).as_secs(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_counts_as_transient() {
        let notifier = Arc::new(ScriptedNotifier {
            hang: true,
            ..Default::default()
        });
        let dispatcher = Dispatcher::new(
            notifier.clone(),
            "chat",
            1,
            RetryPolicy::new(2, Duration::from_secs(1), Duration::from_secs(1)),
            Duration::from_secs(3),
        );

        let err = dispatcher.dispatch(&record("a")).await.unwrap_err();

        match err {
            DispatchError::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 2);
                assert!(matches!(last_error, SendError::Transient(_)));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_quota_bounds_successful_sends() {
        let notifier = ScriptedNotifier::with(vec![Ok(()), Ok(()), Ok(()), Ok(())]);
        let dispatcher = dispatcher(notifier.clone(), 2);

        assert!(dispatcher.dispatch(&record("a")).await.is_ok());
        assert!(dispatcher.dispatch(&record("b")).await.is_ok());
        assert!(matches!(
            dispatcher.dispatch(&record("c")).await,
            Err(DispatchError::QuotaExceeded)
        ));
        assert_eq!(notifier.call_count(), 2);

        // Status messages bypass the quota.
        assert!(dispatcher.send_status("ok").await.is_ok());

        dispatcher.reset_quota();
        assert!(dispatcher.dispatch(&record("c")).await.is_ok());
    }

    #[test]
    fn test_quota_reserve_is_atomic_under_contention() {
        let quota = Arc::new(DispatchQuota::new(5));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let quota = quota.clone();
                std::thread::spawn(move || (0..10).filter(|_| quota.try_reserve()).count())
            })
            .collect();

        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 5);
        assert_eq!(quota.used(), 5);

        quota.refund();
        assert_eq!(quota.used(), 4);
        quota.reset();
        assert_eq!(quota.used(), 0);
        quota.refund();
        assert_eq!(quota.used(), 0);
    }
}
