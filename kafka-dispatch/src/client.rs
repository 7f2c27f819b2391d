use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Headers, Message};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::ClientConfig;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::backoff::BackoffPolicy;
use crate::config::Config;
use crate::dispatcher;
use crate::message::{dlq_topic, AckHandle, DeliveredMessage, MessageHandler, OffsetError};
use crate::producer::{ProduceError, Publisher};

const METRIC_MESSAGES_FETCHED: &str = "kafka_dispatch_messages_fetched_total";
const METRIC_FETCH_ERRORS: &str = "kafka_dispatch_fetch_errors_total";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("no topics configured")]
    NoTopics,
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
}

/// Fetch failure, as classified by the per-topic loop.
#[derive(Debug)]
pub(crate) enum FetchError {
    /// End of stream: the reader session hit a fatal consumer error and
    /// cannot recover. The loop for this topic exits permanently.
    StreamEnd,
    /// Any other fetch failure; logged and skipped.
    Fetch(KafkaError),
}

/// One fetchable stream of messages. The production implementation wraps an
/// rdkafka reader session; tests script one.
#[async_trait]
pub(crate) trait MessageSource: Send + Sync + 'static {
    async fn fetch(&self) -> Result<DeliveredMessage, FetchError>;
    fn topic(&self) -> &str;
}

/// A reader session ends only on a fatal consumer error. Caught-up
/// partitions and transient broker conditions keep the stream open, so the
/// fetch call simply blocks until more messages arrive.
fn is_stream_end(err: &KafkaError) -> bool {
    matches!(err, KafkaError::MessageConsumptionFatal(_))
        || err.rdkafka_error_code() == Some(RDKafkaErrorCode::Fatal)
}

/// One reader session, bound to a single topic for the client's lifetime.
struct TopicReader {
    consumer: StreamConsumer,
    topic: String,
    publisher: Publisher,
}

/// Completion actions for one fetched record. Commits go through a weak
/// reference so a torn-down client yields [`OffsetError::Gone`] instead of
/// keeping the reader session alive.
struct KafkaAckHandle {
    reader: Weak<TopicReader>,
    publisher: Publisher,
    dlq_topic: String,
    partition: i32,
    offset: i64,
}

#[async_trait]
impl AckHandle for KafkaAckHandle {
    fn commit(&self) -> Result<(), OffsetError> {
        let Some(reader) = self.reader.upgrade() else {
            return Err(OffsetError::Gone);
        };
        reader
            .consumer
            .store_offset(&reader.topic, self.partition, self.offset)?;
        Ok(())
    }

    async fn move_to_dlq(
        &self,
        key: &[u8],
        body: &[u8],
        headers: &[(String, String)],
    ) -> Result<(), ProduceError> {
        self.publisher
            .publish_raw(&self.dlq_topic, key, body, headers)
            .await
    }
}

struct KafkaSource {
    reader: Arc<TopicReader>,
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn fetch(&self) -> Result<DeliveredMessage, FetchError> {
        let fetched = match self.reader.consumer.recv().await {
            Ok(fetched) => fetched,
            Err(err) if is_stream_end(&err) => return Err(FetchError::StreamEnd),
            Err(err) => return Err(FetchError::Fetch(err)),
        };

        let headers: Vec<(String, String)> = fetched
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .filter_map(|header| {
                        header.value.map(|value| {
                            (
                                header.key.to_owned(),
                                String::from_utf8_lossy(value).into_owned(),
                            )
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let ack = Arc::new(KafkaAckHandle {
            reader: Arc::downgrade(&self.reader),
            publisher: self.reader.publisher.clone(),
            dlq_topic: dlq_topic(&self.reader.topic),
            partition: fetched.partition(),
            offset: fetched.offset(),
        });

        Ok(DeliveredMessage::new(
            fetched.topic().to_owned(),
            fetched.partition(),
            fetched.offset(),
            fetched.key().map(<[u8]>::to_vec).unwrap_or_default(),
            fetched.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            fetched.timestamp().to_millis(),
            headers,
            ack,
        ))
    }

    fn topic(&self) -> &str {
        &self.reader.topic
    }
}

struct ClientInner {
    readers: HashMap<String, Arc<TopicReader>>,
    publisher: Publisher,
    backoff: BackoffPolicy,
    max_retries: u32,
    workers: Arc<Semaphore>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    config: Config,
}

/// Process-wide broker client: one reader session per configured topic plus
/// a shared producer. The reader map is built once by [`open`] and never
/// mutated, so it is shared read-only across all fetch loops.
///
/// [`open`]: KafkaDispatchClient::open
#[derive(Clone)]
pub struct KafkaDispatchClient {
    inner: Arc<ClientInner>,
}

impl KafkaDispatchClient {
    pub async fn open(config: Config) -> Result<Self, ClientError> {
        let topics = config.topics();
        if topics.is_empty() {
            return Err(ClientError::NoTopics);
        }

        let publisher = Publisher::new(&config).await?;

        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(5)
            .map(char::from)
            .collect();
        let client_id = format!("kafka-dispatch-{suffix}");

        let mut readers = HashMap::with_capacity(topics.len());
        for topic in topics {
            let mut client_config = ClientConfig::new();
            client_config
                .set("bootstrap.servers", &config.kafka_hosts)
                .set("group.id", &config.kafka_consumer_group)
                .set("client.id", &client_id)
                .set("enable.auto.offset.store", "false")
                .set("enable.auto.commit", "true")
                .set("auto.offset.reset", "earliest")
                .set("fetch.max.bytes", config.kafka_fetch_max_bytes.to_string())
                .set(
                    "socket.connection.setup.timeout.ms",
                    config.kafka_dial_timeout.0.as_millis().to_string(),
                )
                .set(
                    "socket.keepalive.enable",
                    config.kafka_socket_keepalive.to_string(),
                );

            if config.kafka_tls {
                client_config
                    .set("security.protocol", "ssl")
                    .set("enable.ssl.certificate.verification", "false");
            };

            debug!(topic = %topic, "rdkafka reader configuration: {:?}", client_config);
            let consumer: StreamConsumer = client_config.create()?;
            consumer.subscribe(&[topic.as_str()])?;
            info!(topic = %topic, group = %config.kafka_consumer_group, "reader session created");

            readers.insert(
                topic.clone(),
                Arc::new(TopicReader {
                    consumer,
                    topic,
                    publisher: publisher.clone(),
                }),
            );
        }

        let inner = ClientInner {
            readers,
            publisher,
            backoff: BackoffPolicy::from_config(&config.backoff),
            max_retries: config.kafka_max_retries,
            workers: Arc::new(Semaphore::new(config.max_in_flight_messages)),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Start one fetch loop per configured topic. Returned handles resolve
    /// when the corresponding loop exits (stream end or [`close`]).
    ///
    /// [`close`]: KafkaDispatchClient::close
    pub fn listen<H: MessageHandler>(&self, handler: H) -> Vec<JoinHandle<()>> {
        let handler = Arc::new(handler);
        self.inner
            .readers
            .values()
            .map(|reader| self.spawn_fetch_loop(reader.clone(), handler.clone()))
            .collect()
    }

    /// Start a fetch loop for a single configured topic.
    pub fn listen_one<H: MessageHandler>(
        &self,
        topic: &str,
        handler: H,
    ) -> Result<JoinHandle<()>, ClientError> {
        let reader = self
            .inner
            .readers
            .get(topic)
            .ok_or_else(|| ClientError::UnknownTopic(topic.to_owned()))?;
        Ok(self.spawn_fetch_loop(reader.clone(), Arc::new(handler)))
    }

    /// The shared produce path, for ordinary event publishing.
    pub fn publisher(&self) -> &Publisher {
        &self.inner.publisher
    }

    /// Stop all fetch loops and release the reader sessions, leaving the
    /// consumer group. In-flight handling tasks run to their terminal state,
    /// except backoff waits, which are abandoned without commit so the
    /// broker redelivers those offsets. Safe to call more than once; calls
    /// after the first are no-ops.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing kafka dispatch client");
        self.inner.shutdown.cancel();
        for reader in self.inner.readers.values() {
            reader.consumer.unsubscribe();
            info!(topic = %reader.topic, "reader session released");
        }
    }

    /// Create a topic with the given partition count, ignoring
    /// already-exists responses.
    pub async fn create_topic(&self, topic: &str, num_partitions: i32) -> Result<(), ClientError> {
        let mut admin_config = ClientConfig::new();
        admin_config.set("bootstrap.servers", &self.inner.config.kafka_hosts);
        if self.inner.config.kafka_tls {
            admin_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let admin: AdminClient<DefaultClientContext> = admin_config.create()?;
        let new_topic = NewTopic::new(topic, num_partitions, TopicReplication::Fixed(1));
        let results = admin
            .create_topics(&[new_topic], &AdminOptions::new())
            .await?;

        for result in results {
            match result {
                Ok(created) => info!(topic = %created, "topic created"),
                Err((existing, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %existing, "topic already exists");
                }
                Err((_, code)) => return Err(ClientError::Kafka(KafkaError::AdminOp(code))),
            }
        }

        Ok(())
    }

    fn spawn_fetch_loop<H: MessageHandler>(
        &self,
        reader: Arc<TopicReader>,
        handler: Arc<H>,
    ) -> JoinHandle<()> {
        let source = KafkaSource { reader };
        let inner = &self.inner;
        tokio::spawn(run_fetch_loop(
            source,
            handler,
            inner.workers.clone(),
            inner.backoff,
            inner.max_retries,
            inner.shutdown.clone(),
        ))
    }
}

/// One long-lived loop per topic: fetch, then hand each message to an
/// independent handling task. The loop itself never waits on handler
/// completion; it only waits for a worker permit, which applies backpressure
/// once `max_in_flight_messages` handling tasks are running.
pub(crate) async fn run_fetch_loop<S: MessageSource, H: MessageHandler>(
    source: S,
    handler: Arc<H>,
    workers: Arc<Semaphore>,
    backoff: BackoffPolicy,
    max_retries: u32,
    shutdown: CancellationToken,
) {
    let topic = source.topic().to_owned();
    info!(topic = %topic, "fetch loop started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(topic = %topic, "shutdown, fetch loop stopping");
                break;
            }
            fetched = source.fetch() => match fetched {
                Err(FetchError::StreamEnd) => {
                    info!(topic = %topic, "end of stream, fetch loop exiting");
                    break;
                }
                Err(FetchError::Fetch(err)) => {
                    metrics::counter!(METRIC_FETCH_ERRORS).increment(1);
                    error!(topic = %topic, error = %err, "failed to fetch message");
                    continue;
                }
                Ok(message) => {
                    metrics::counter!(METRIC_MESSAGES_FETCHED).increment(1);
                    let Ok(permit) = workers.clone().acquire_owned().await else {
                        break;
                    };
                    let handler = handler.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        dispatcher::dispatch(message, handler, backoff, max_retries, shutdown)
                            .await;
                    });
                }
            }
        }
    }
}
