use tracing::{error, info_span, warn, Instrument};

use crate::message::DeliveredMessage;

/// Header carrying the last handler error text on dead-lettered messages.
pub(crate) const ERROR_HEADER: &str = "error";

const METRIC_DLQ_PUBLISHED: &str = "kafka_dispatch_dlq_published_total";
const METRIC_DLQ_PUBLISH_FAILURES: &str = "kafka_dispatch_dlq_publish_failures_total";
const METRIC_DLQ_COMMIT_FAILURES: &str = "kafka_dispatch_dlq_commit_failures_total";

/// Annotate an exhausted message with its last handler error and republish
/// it to the dead-letter topic, then commit the original offset.
///
/// The commit happens regardless of the publish outcome, so the message is
/// lost if the process dies between a failed publish and the commit. Publish
/// and commit failures are logged and swallowed; neither is retried and
/// neither blocks other messages.
pub(crate) async fn route_to_dead_letter(message: &mut DeliveredMessage, last_error: &str) {
    let span = info_span!(
        "dlq_publish",
        topic = %message.topic,
        partition = message.partition,
        offset = message.offset,
        key = %String::from_utf8_lossy(&message.key),
        retry_count = message.retry_count,
        otel.status_code = "ERROR",
        error = %last_error,
    );

    async {
        warn!("retries exhausted, moving message to dead-letter topic");
        message.push_header(ERROR_HEADER, last_error);

        match message.move_to_dlq().await {
            Ok(()) => {
                metrics::counter!(METRIC_DLQ_PUBLISHED).increment(1);
            }
            Err(err) => {
                metrics::counter!(METRIC_DLQ_PUBLISH_FAILURES).increment(1);
                error!(error = %err, "failed to publish to dead-letter topic");
            }
        }

        if let Err(err) = message.commit() {
            metrics::counter!(METRIC_DLQ_COMMIT_FAILURES).increment(1);
            error!(error = %err, "failed to commit offset after dead-letter routing");
        }
    }
    .instrument(span)
    .await;
}
