use thiserror::Error;

/// Error type for broker interactions.
///
/// Retry and backoff are deployment concerns; nothing in this crate
/// retries internally, failures surface to the caller as-is.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("creating kafka client: {0}")]
    Client(#[source] rdkafka::error::KafkaError),

    #[error("subscribing to {topics}: {source}")]
    Subscribe {
        topics: String,
        #[source]
        source: rdkafka::error::KafkaError,
    },

    #[error("publishing to {topic}: {source}")]
    Publish {
        topic: String,
        #[source]
        source: rdkafka::error::KafkaError,
    },

    #[error("receiving from broker: {0}")]
    Receive(#[source] rdkafka::error::KafkaError),

    #[error("committing offset {offset} for {topic}/{partition}: {source}")]
    Commit {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: rdkafka::error::KafkaError,
    },
}
