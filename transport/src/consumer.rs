use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use metricstream_telemetry::wire_format::{DecodeError, decode_batch};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::TransportError;

/// Configuration for the batch consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Kafka brokers, comma-separated.
    pub brokers: String,
    /// Consumer group ID. Members of one group split the topic's
    /// partitions between them.
    pub group_id: String,
    /// Topics to consume from.
    pub topics: Vec<String>,
    /// Where to start when the group has no committed offset
    /// ("earliest" or "latest").
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds.
    pub session_timeout_ms: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_owned(),
            group_id: "metricstream-sink".to_owned(),
            topics: vec![],
            auto_offset_reset: "earliest".to_owned(),
            session_timeout_ms: "6000".to_owned(),
        }
    }
}

/// A successfully decoded batch, with the coordinates needed to
/// acknowledge it after the sink accepted it.
#[derive(Debug, Clone)]
pub struct DecodedBatch {
    pub batch: RecordBatch,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
}

/// A message that failed to decode. The raw bytes are preserved for
/// diagnosis, never dropped silently.
#[derive(Debug)]
pub struct DecodeFailure {
    pub reason: DecodeError,
    pub raw: Vec<u8>,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Per-message decode result, consumed immediately by the routing stage.
#[derive(Debug)]
pub enum DeliveryOutcome {
    Ok(DecodedBatch),
    Err(DecodeFailure),
}

/// Decodes one pulled message into a routing outcome.
///
/// Pure with respect to its inputs; the consumer loop is a thin shell
/// around this.
pub fn split_message(
    raw: &[u8],
    topic: &str,
    partition: i32,
    offset: i64,
    key: Option<&[u8]>,
) -> DeliveryOutcome {
    match decode_batch(raw) {
        Ok(batch) => DeliveryOutcome::Ok(DecodedBatch {
            batch,
            topic: topic.to_owned(),
            partition,
            offset,
            key: key.map(<[u8]>::to_vec),
        }),
        Err(reason) => DeliveryOutcome::Err(DecodeFailure {
            reason,
            raw: raw.to_vec(),
            topic: topic.to_owned(),
            partition,
            offset,
        }),
    }
}

/// Consumes wire buffers from the log and splits them into an ok stream
/// and an error stream.
///
/// Offsets are committed manually through [`BatchConsumer::ack`]; the log
/// remains the durable record and a restart resumes from the last
/// acknowledged offset.
#[derive(Clone)]
pub struct BatchConsumer {
    consumer: Arc<StreamConsumer>,
}

impl BatchConsumer {
    /// Creates a consumer and subscribes it to the given topics.
    pub fn subscribe(config: &ConsumerConfig) -> Result<Self, TransportError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("session.timeout.ms", &config.session_timeout_ms)
            .set("enable.partition.eof", "false")
            .create()
            .map_err(TransportError::Client)?;
        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|source| TransportError::Subscribe {
                topics: config.topics.join(","),
                source,
            })?;
        Ok(Self {
            consumer: Arc::new(consumer),
        })
    }

    /// Pulls messages forever, routing each decode outcome to the matching
    /// channel. A decode failure never halts consumption of subsequent
    /// messages.
    ///
    /// Returns `Ok(())` once both receivers are gone (worker shutdown);
    /// broker-level receive errors propagate to the caller.
    pub async fn run(
        &self,
        ok_tx: mpsc::Sender<DecodedBatch>,
        err_tx: mpsc::Sender<DecodeFailure>,
    ) -> Result<(), TransportError> {
        loop {
            let message = self
                .consumer
                .recv()
                .await
                .map_err(TransportError::Receive)?;
            let outcome = split_message(
                message.payload().unwrap_or_default(),
                message.topic(),
                message.partition(),
                message.offset(),
                message.key(),
            );
            match outcome {
                DeliveryOutcome::Ok(decoded) => {
                    debug!(
                        "decoded {} rows from {}/{}@{}",
                        decoded.batch.num_rows(),
                        decoded.topic,
                        decoded.partition,
                        decoded.offset
                    );
                    if ok_tx.send(decoded).await.is_err() {
                        return Ok(());
                    }
                }
                DeliveryOutcome::Err(failure) => {
                    warn!(
                        "undecodable message at {}/{}@{}: {}",
                        failure.topic, failure.partition, failure.offset, failure.reason
                    );
                    if err_tx.send(failure).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Marks a delivered batch as consumed by committing the next offset
    /// for its partition. Call only after the batch reached the sink.
    pub fn ack(&self, delivered: &DecodedBatch) -> Result<(), TransportError> {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(
            &delivered.topic,
            delivered.partition,
            Offset::Offset(delivered.offset + 1),
        )
        .map_err(|source| TransportError::Commit {
            topic: delivered.topic.clone(),
            partition: delivered.partition,
            offset: delivered.offset,
            source,
        })?;
        self.consumer
            .commit(&list, CommitMode::Async)
            .map_err(|source| TransportError::Commit {
                topic: delivered.topic.clone(),
                partition: delivered.partition,
                offset: delivered.offset,
                source,
            })
    }
}
