use anyhow::{Context, Result};
use metricstream_transport::{DecodedBatch, TransportError};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::sink::{SinkFactory, SinkPartition};

/// Drains one worker's ok channel into its sink partition.
///
/// The factory is invoked exactly once, before the first append. Each
/// delivered batch is appended, then acknowledged through `ack`; a batch
/// whose append failed is never acknowledged, so it is redelivered after a
/// restart (at-least-once). The partition's connection is released on
/// every exit path, clean or not.
///
/// The worker stops when the channel closes (consumer shut down) or on the
/// first sink or acknowledge failure, which propagates to the caller.
pub async fn run_sink_worker<F, A>(
    worker_id: usize,
    worker_count: usize,
    factory: F,
    mut ok_rx: mpsc::Receiver<DecodedBatch>,
    ack: A,
) -> Result<()>
where
    F: SinkFactory,
    A: Fn(&DecodedBatch) -> Result<(), TransportError>,
{
    let mut partition = factory
        .build(worker_id, worker_count)
        .await
        .with_context(|| format!("building sink partition {worker_id}/{worker_count}"))?;

    let drained = drain(worker_id, &mut partition, &mut ok_rx, &ack).await;
    let closed = partition.close().await;

    if let Err(e) = &drained {
        error!("sink worker {worker_id} stopping on error: {e:#}");
    } else {
        info!("sink worker {worker_id} drained and shut down");
    }
    drained?;
    closed.with_context(|| format!("closing sink partition {worker_id}"))?;
    Ok(())
}

async fn drain<P, A>(
    worker_id: usize,
    partition: &mut P,
    ok_rx: &mut mpsc::Receiver<DecodedBatch>,
    ack: &A,
) -> Result<()>
where
    P: SinkPartition,
    A: Fn(&DecodedBatch) -> Result<(), TransportError>,
{
    while let Some(delivered) = ok_rx.recv().await {
        partition
            .append(&delivered.batch)
            .await
            .with_context(|| {
                format!(
                    "worker {worker_id} appending batch from {}/{}@{}",
                    delivered.topic, delivered.partition, delivered.offset
                )
            })?;
        // acknowledge only once the rows are in the store
        ack(&delivered).with_context(|| {
            format!(
                "worker {worker_id} acknowledging {}/{}@{}",
                delivered.topic, delivered.partition, delivered.offset
            )
        })?;
    }
    Ok(())
}
