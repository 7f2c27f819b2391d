use std::sync::Arc;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use tokio_util::sync::CancellationToken;

use crate::producer::ProduceError;

/// Suffix appended to a source topic to derive its dead-letter topic.
const DLQ_TOPIC_SUFFIX: &str = "-dlq";

/// Dead-letter topic for a source topic. The mapping is deterministic and
/// not configurable per call.
pub fn dlq_topic(topic: &str) -> String {
    format!("{topic}{DLQ_TOPIC_SUFFIX}")
}

#[derive(Debug, thiserror::Error)]
pub enum OffsetError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Consumer gone")]
    Gone,
}

/// Completion actions bound to one physical fetch.
///
/// Constructed once per fetched record and never reused. The production
/// implementation holds a weak reference to the originating reader session
/// plus a producer handle for the dead-letter path; tests substitute a
/// recording fake.
#[async_trait]
pub trait AckHandle: Send + Sync {
    /// Record the fetched offset as processed on the originating reader.
    fn commit(&self) -> Result<(), OffsetError>;

    /// Republish the fetched record to the dead-letter topic derived from
    /// its source topic.
    async fn move_to_dlq(
        &self,
        key: &[u8],
        body: &[u8],
        headers: &[(String, String)],
    ) -> Result<(), ProduceError>;
}

/// A fetched record as handed to a [`MessageHandler`].
pub struct DeliveredMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Record key, empty when the producer did not set one.
    pub key: Vec<u8>,
    pub body: Vec<u8>,
    /// Producer-side send time, epoch milliseconds.
    pub timestamp: Option<i64>,
    /// Record headers in wire order.
    pub headers: Vec<(String, String)>,
    /// 1 on the first handler invocation, incremented on every failure.
    pub retry_count: u32,
    ack: Arc<dyn AckHandle>,
}

impl DeliveredMessage {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        topic: String,
        partition: i32,
        offset: i64,
        key: Vec<u8>,
        body: Vec<u8>,
        timestamp: Option<i64>,
        headers: Vec<(String, String)>,
        ack: Arc<dyn AckHandle>,
    ) -> Self {
        Self {
            topic,
            partition,
            offset,
            key,
            body,
            timestamp,
            headers,
            retry_count: 1,
            ack,
        }
    }

    /// Commit this message's offset on the reader session it was fetched
    /// from. Intended to be called at most once per fetched message, by the
    /// handler on success or by the dead-letter router on exhaustion.
    pub fn commit(&self) -> Result<(), OffsetError> {
        self.ack.commit()
    }

    /// Republish this message's key, body and headers to the dead-letter
    /// topic for its source topic.
    pub async fn move_to_dlq(&self) -> Result<(), ProduceError> {
        self.ack
            .move_to_dlq(&self.key, &self.body, &self.headers)
            .await
    }

    pub(crate) fn push_header(&mut self, key: &str, value: &str) {
        self.headers.push((key.to_owned(), value.to_owned()));
    }

    /// Last value for a header key, if present.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// User-supplied message handler.
///
/// On success the handler is responsible for committing the offset via
/// [`DeliveredMessage::commit`]; the engine only commits on the dead-letter
/// path. Errors are retried with backoff up to the configured attempt bound
/// and are never surfaced to the `listen` caller.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        shutdown: &CancellationToken,
        message: &DeliveredMessage,
    ) -> anyhow::Result<()>;
}
