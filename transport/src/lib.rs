//! Kafka transport for compressed metrics buffers.
//!
//! The publish side wraps a wire buffer as a keyed message; messages
//! sharing a key land in the same partition and keep their publish order
//! there. The consume side decodes every pulled message and splits the
//! stream into an ok channel of decoded batches and an error channel that
//! preserves the raw bytes of anything that failed to decode.
pub mod consumer;
pub mod error;
pub mod publisher;

pub use consumer::{BatchConsumer, ConsumerConfig, DecodeFailure, DecodedBatch, DeliveryOutcome};
pub use error::TransportError;
pub use publisher::{BatchPublisher, PublishReceipt};
