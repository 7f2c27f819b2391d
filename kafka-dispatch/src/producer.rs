use std::time::Duration;

use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, info_span, Instrument};

use crate::config::Config;

#[derive(Error, Debug)]
pub enum ProduceError {
    #[error("failed to serialize: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to produce to kafka: {0}")]
    Kafka(#[from] KafkaError),
    #[error("failed to produce to kafka (timeout)")]
    Canceled,
}

/// Shared produce path: ordinary event publishing and dead-letter
/// republishing both go through this handle.
#[derive(Clone)]
pub struct Publisher {
    producer: FutureProducer,
}

impl Publisher {
    pub async fn new(config: &Config) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            );

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka producer configuration: {:?}", client_config);
        let producer: FutureProducer = client_config.create()?;

        // "Ping" the Kafka brokers by requesting metadata
        match producer
            .client()
            .fetch_metadata(None, Duration::from_secs(15))
        {
            Ok(metadata) => {
                info!(
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    metadata.topics().len()
                );
            }
            Err(err) => {
                error!("Failed to fetch metadata from Kafka brokers: {:?}", err);
                return Err(err);
            }
        }

        Ok(Self { producer })
    }

    /// Producer handle that has not contacted any broker, for tests that
    /// never produce.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", "localhost:9092")
            .create()
            .expect("failed to create detached producer");
        Self { producer }
    }

    /// Serialize `event` as JSON and produce it to `topic`, awaiting
    /// delivery confirmation.
    pub async fn publish<T: Serialize>(&self, topic: &str, event: &T) -> Result<(), ProduceError> {
        let payload = serde_json::to_vec(event)?;
        self.send(topic, None, &payload, None).await
    }

    /// Like [`Publisher::publish`], wrapped in a tracing span; produce
    /// failures are recorded on the span before being returned.
    pub async fn publish_traced<T: Serialize>(
        &self,
        topic: &str,
        event: &T,
    ) -> Result<(), ProduceError> {
        let span = info_span!(
            "kafka_publish",
            topic = %topic,
            otel.kind = "producer",
        );
        async {
            match self.publish(topic, event).await {
                Ok(()) => Ok(()),
                Err(err) => {
                    error!(error = %err, "failed to publish event");
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Byte-level produce used by the dead-letter router, preserving the
    /// original key and headers.
    pub(crate) async fn publish_raw(
        &self,
        topic: &str,
        key: &[u8],
        payload: &[u8],
        headers: &[(String, String)],
    ) -> Result<(), ProduceError> {
        let mut owned_headers = OwnedHeaders::new();
        for (header_key, header_value) in headers {
            owned_headers = owned_headers.insert(Header {
                key: header_key,
                value: Some(header_value.as_bytes()),
            });
        }

        let key = if key.is_empty() { None } else { Some(key) };
        self.send(topic, key, payload, Some(owned_headers)).await
    }

    async fn send(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: &[u8],
        headers: Option<OwnedHeaders>,
    ) -> Result<(), ProduceError> {
        let record = FutureRecord::<[u8], [u8]> {
            topic,
            partition: None,
            payload: Some(payload),
            key,
            timestamp: None,
            headers,
        };

        let delivery = match self.producer.send_result(record) {
            Ok(delivery) => delivery,
            Err((err, _)) => return Err(ProduceError::Kafka(err)),
        };

        match delivery.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((err, _))) => Err(ProduceError::Kafka(err)),
            Err(_) => Err(ProduceError::Canceled),
        }
    }
}
