use std::time::Duration;

use rdkafka::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use tracing::debug;

use crate::error::TransportError;

/// Broker acknowledgement for one published buffer.
#[derive(Debug, Clone, Copy)]
pub struct PublishReceipt {
    pub partition: i32,
    pub offset: i64,
}

/// Publishes wire buffers to a topic.
///
/// Messages sharing a key are routed to the same partition and keep their
/// publish order within it; without a key, routing is up to the broker.
/// Unacknowledged messages do not survive a process crash.
pub struct BatchPublisher {
    producer: FutureProducer,
    ack_timeout: Duration,
}

impl BatchPublisher {
    pub fn new(brokers: &str) -> Result<Self, TransportError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(TransportError::Client)?;
        Ok(Self {
            producer,
            ack_timeout: Duration::from_secs(5),
        })
    }

    /// Enqueues one buffer for delivery and waits for the broker ack.
    pub async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        key: Option<&[u8]>,
    ) -> Result<PublishReceipt, TransportError> {
        let mut record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }
        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.ack_timeout))
            .await
            .map_err(|(source, _message)| TransportError::Publish {
                topic: topic.to_owned(),
                source,
            })?;
        debug!("published {} bytes to {topic}/{partition}@{offset}", payload.len());
        Ok(PublishReceipt { partition, offset })
    }
}
