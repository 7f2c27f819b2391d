//! Broker-backed message consumption and dispatch engine.
//!
//! Pulls messages from one or more Kafka topics, hands each one to a
//! user-supplied [`MessageHandler`] with bounded retry and exponential
//! backoff, and on retry exhaustion reroutes the message to a dead-letter
//! topic derived from the source topic. Offset acknowledgement is manual:
//! handlers commit via [`DeliveredMessage::commit`] on success, and the
//! engine commits only on the dead-letter path.
//!
//! One fetch loop runs per topic; each fetched message is handled on its own
//! task, gated by a bounded worker pool. Fetch order within a topic follows
//! the broker's partition-offset order, but handling tasks complete
//! independently, so commits across messages carry no ordering guarantee: a
//! later offset can commit while an earlier one is still retrying.

pub mod backoff;
pub mod client;
pub mod config;
pub mod dispatcher;
mod dlq;
pub mod message;
pub mod producer;

#[cfg(test)]
mod test_utils;

pub use backoff::BackoffPolicy;
pub use client::{ClientError, KafkaDispatchClient};
pub use config::Config;
pub use dispatcher::DispatchOutcome;
pub use message::{dlq_topic, DeliveredMessage, MessageHandler, OffsetError};
pub use producer::{ProduceError, Publisher};
