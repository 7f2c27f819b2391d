use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    pub kafka_topics: String, // Comma-delimited topic names

    pub kafka_consumer_group: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    /// Number of handler attempts before a message is dead-lettered.
    #[envconfig(default = "3")]
    pub kafka_max_retries: u32,

    #[envconfig(default = "3000")]
    pub kafka_dial_timeout: EnvMsDuration,

    #[envconfig(default = "true")]
    pub kafka_socket_keepalive: bool,

    #[envconfig(default = "10000000")]
    pub kafka_fetch_max_bytes: u32,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    /// Maximum number of messages being handled concurrently across all topics.
    #[envconfig(default = "1024")]
    pub max_in_flight_messages: usize,

    #[envconfig(nested = true)]
    pub backoff: BackoffConfig,
}

impl Config {
    /// Topic names parsed out of the comma-delimited `KAFKA_TOPICS` value.
    pub fn topics(&self) -> Vec<String> {
        self.kafka_topics
            .split(',')
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

#[derive(Envconfig, Clone)]
pub struct BackoffConfig {
    #[envconfig(default = "500")]
    pub backoff_initial_interval: EnvMsDuration,

    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "60000")]
    pub backoff_maximum_interval: EnvMsDuration,

    /// Total time budget for one message's retry sequence.
    #[envconfig(default = "300000")]
    pub backoff_max_elapsed: EnvMsDuration,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
