use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backoff::BackoffPolicy;
use crate::dlq;
use crate::message::{DeliveredMessage, MessageHandler};

const METRIC_MESSAGES_SUCCEEDED: &str = "kafka_dispatch_messages_succeeded_total";
const METRIC_MESSAGES_DEAD_LETTERED: &str = "kafka_dispatch_messages_dead_lettered_total";
const METRIC_HANDLER_FAILURES: &str = "kafka_dispatch_handler_failures_total";
const METRIC_DISPATCHES_CANCELLED: &str = "kafka_dispatch_dispatches_cancelled_total";

/// Terminal state of a single message dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler returned Ok on the recorded attempt. The handler owns the
    /// offset commit on this path.
    Succeeded { attempts: u32 },
    /// Retries were exhausted and the message was routed to the dead-letter
    /// topic, followed by a forced commit of the original offset.
    DeadLettered { attempts: u32 },
    /// Shutdown arrived during a backoff wait. No commit, no dead-letter
    /// publish; the broker redelivers the offset after restart.
    Cancelled { attempts: u32 },
}

/// Run one fetched message through the retry state machine.
///
/// The handler is invoked up to `max_retries` times, with a cancellable
/// exponential-backoff wait between failures. Exhaustion is declared when the
/// attempt bound is reached or the policy's elapsed-time budget is spent,
/// whichever happens first; the message is then handed to the dead-letter
/// router. Handler errors never escape this function.
pub(crate) async fn dispatch<H: MessageHandler>(
    mut message: DeliveredMessage,
    handler: Arc<H>,
    policy: BackoffPolicy,
    max_retries: u32,
    shutdown: CancellationToken,
) -> DispatchOutcome {
    let started = Instant::now();

    loop {
        let error = match handler.handle(&shutdown, &message).await {
            Ok(()) => {
                metrics::counter!(METRIC_MESSAGES_SUCCEEDED).increment(1);
                return DispatchOutcome::Succeeded {
                    attempts: message.retry_count,
                };
            }
            Err(err) => format!("{err:#}"),
        };

        metrics::counter!(METRIC_HANDLER_FAILURES).increment(1);
        warn!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            attempt = message.retry_count,
            max_retries,
            error = %error,
            "failed to process message"
        );

        if message.retry_count >= max_retries || started.elapsed() >= policy.max_elapsed() {
            dlq::route_to_dead_letter(&mut message, &error).await;
            metrics::counter!(METRIC_MESSAGES_DEAD_LETTERED).increment(1);
            return DispatchOutcome::DeadLettered {
                attempts: message.retry_count,
            };
        }

        let delay = policy.next_delay(message.retry_count);
        tokio::select! {
            _ = shutdown.cancelled() => {
                metrics::counter!(METRIC_DISPATCHES_CANCELLED).increment(1);
                info!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "shutdown during backoff, abandoning retries"
                );
                return DispatchOutcome::Cancelled {
                    attempts: message.retry_count,
                };
            }
            _ = tokio::time::sleep(delay) => {}
        }

        message.retry_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{AckLog, CountingHandler};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(1),
            2,
            Duration::from_millis(5),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let log = Arc::new(AckLog::default());
        let message = log.message("orders", 0, 1, b"k", b"payload");
        let handler = Arc::new(CountingHandler::succeeding());

        let outcome = dispatch(
            message,
            handler.clone(),
            fast_policy(),
            3,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, DispatchOutcome::Succeeded { attempts: 1 });
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(log.dead_lettered().is_empty());
        // The handler committed on success.
        assert_eq!(log.committed(), vec![(0, 1)]);
    }

    #[tokio::test]
    async fn test_fails_twice_then_succeeds() {
        let log = Arc::new(AckLog::default());
        let message = log.message("orders", 0, 2, b"k", b"payload");
        let handler = Arc::new(CountingHandler::failing_first(2, "transient"));

        let outcome = dispatch(
            message,
            handler.clone(),
            fast_policy(),
            3,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, DispatchOutcome::Succeeded { attempts: 3 });
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(log.dead_lettered().is_empty());
        assert_eq!(log.committed(), vec![(0, 2)]);
    }

    #[tokio::test]
    async fn test_exhaustion_routes_to_dlq_with_error_header() {
        let log = Arc::new(AckLog::default());
        let message = log.message("orders", 1, 7, b"order-7", b"payload");
        let handler = Arc::new(CountingHandler::always_failing("boom"));

        let outcome = dispatch(
            message,
            handler.clone(),
            fast_policy(),
            3,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, DispatchOutcome::DeadLettered { attempts: 3 });
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        let published = log.dead_lettered();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key, b"order-7");
        assert_eq!(published[0].body, b"payload");
        assert_eq!(
            published[0].headers.last(),
            Some(&("error".to_owned(), "boom".to_owned()))
        );

        // Forced commit of the original offset after the publish.
        assert_eq!(log.committed(), vec![(1, 7)]);
    }

    #[tokio::test]
    async fn test_dlq_publish_failure_still_commits() {
        let log = Arc::new(AckLog::default());
        log.fail_dlq_publish();
        let message = log.message("orders", 0, 9, b"k", b"payload");
        let handler = Arc::new(CountingHandler::always_failing("boom"));

        let outcome = dispatch(
            message,
            handler,
            fast_policy(),
            2,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, DispatchOutcome::DeadLettered { attempts: 2 });
        assert!(log.dead_lettered().is_empty());
        assert_eq!(log.committed(), vec![(0, 9)]);
    }

    #[tokio::test]
    async fn test_cancellation_during_backoff_abandons_retries() {
        let log = Arc::new(AckLog::default());
        let message = log.message("orders", 0, 3, b"k", b"payload");
        let handler = Arc::new(CountingHandler::always_failing("boom"));

        // Long backoff so the cancelled branch is the only way out.
        let slow_policy = BackoffPolicy::new(
            Duration::from_secs(30),
            2,
            Duration::from_secs(60),
            Duration::from_secs(300),
        );
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let outcome = dispatch(message, handler.clone(), slow_policy, 5, shutdown).await;

        assert_eq!(outcome, DispatchOutcome::Cancelled { attempts: 1 });
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(log.committed().is_empty());
        assert!(log.dead_lettered().is_empty());
    }

    #[tokio::test]
    async fn test_spent_elapsed_budget_exhausts_before_attempt_bound() {
        let log = Arc::new(AckLog::default());
        let message = log.message("orders", 0, 4, b"k", b"payload");
        let handler = Arc::new(CountingHandler::always_failing("boom"));

        let no_budget = BackoffPolicy::new(
            Duration::from_millis(1),
            2,
            Duration::from_millis(5),
            Duration::ZERO,
        );

        let outcome = dispatch(
            message,
            handler.clone(),
            no_budget,
            5,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, DispatchOutcome::DeadLettered { attempts: 1 });
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(log.dead_lettered().len(), 1);
    }
}
