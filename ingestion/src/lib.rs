//! Sink side of the pipeline: one exclusively-owned store connection per
//! worker, batched append-only inserts, and the worker loop that
//! acknowledges a log offset only after its batch reached the store.
pub mod sink;
pub mod worker;

pub use sink::{SinkError, SinkFactory, SinkPartition, SqliteSinkFactory, SqliteSinkPartition};
pub use worker::run_sink_worker;
