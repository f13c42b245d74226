//! Metricstream Pipeline Server
//!
//! `produce` samples host metrics, packs them into compressed columnar
//! buffers and publishes them to the log. `consume` subscribes, decodes
//! each buffer and appends the rows into SQLite, one exclusively-owned
//! sink connection per worker. `analyze` reads the same topic without a
//! store and reports a per-batch aggregate.
//!
//! All delivery semantics are at-least-once: a batch is acknowledged to
//! the log only after its rows reached the store, and redelivery produces
//! duplicate rows by design.

use anyhow::{Context, Result};
use arrow::array::Float32Array;
use arrow::record_batch::RecordBatch;
use clap::{Parser, Subcommand};
use metricstream_ingestion::{SqliteSinkFactory, run_sink_worker};
use metricstream_telemetry::sampler::HostSampler;
use metricstream_telemetry::wire_format::encode_batch;
use metricstream_transport::{
    BatchConsumer, BatchPublisher, ConsumerConfig, DecodeFailure, DecodedBatch,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(name = "Metricstream Pipeline Server")]
#[clap(about = "Columnar host metrics over a partitioned log", version, author)]
#[clap(arg_required_else_help(true))]
struct Cli {
    /// Kafka brokers, comma-separated
    #[clap(long, env = "METRICSTREAM_BROKERS", default_value = "localhost:9092")]
    brokers: String,

    /// Topic carrying the wire buffers
    #[clap(long, env = "METRICSTREAM_TOPIC", default_value = "metrics")]
    topic: String,

    #[clap(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Sample host metrics and publish compressed columnar buffers
    Produce {
        /// Samples per batch
        #[clap(long, default_value_t = 1000)]
        batch_size: usize,

        /// Number of batches to publish before exiting
        #[clap(long, default_value_t = 10)]
        num_batches: usize,

        /// Routing key; batches sharing a key keep publish order within
        /// one partition
        #[clap(long)]
        key: Option<String>,

        /// Device name recorded in every sample
        #[clap(long, default_value = "localhost")]
        device: String,
    },
    /// Consume buffers, decode them and append the rows into SQLite
    Consume {
        /// Consumer group; group members split the topic's partitions
        #[clap(long, default_value = "metricstream-sink")]
        group_id: String,

        /// SQLite database receiving the rows
        #[clap(long, default_value = "sqlite://metrics.db?mode=rwc")]
        db_url: String,

        /// Destination table
        #[clap(long, default_value = "samples")]
        table: String,

        /// Number of sink workers, each with its own consumer and store
        /// connection
        #[clap(long, default_value_t = 1)]
        workers: usize,
    },
    /// Consume buffers and report the peak cpu_used per batch, no store
    Analyze {
        /// Consumer group for the analysis reader
        #[clap(long, default_value = "metricstream-analyze")]
        group_id: String,
    },
}

async fn produce(
    brokers: &str,
    topic: &str,
    batch_size: usize,
    num_batches: usize,
    key: Option<Vec<u8>>,
    device: &str,
) -> Result<()> {
    let publisher = BatchPublisher::new(brokers).context("creating publisher")?;
    let mut sampler = HostSampler::new(device);
    for i in 0..num_batches {
        let batch = sampler.generate_batch(batch_size)?;
        let buffer = encode_batch(&batch).context("encoding batch")?;
        let receipt = publisher.publish(topic, &buffer, key.as_deref()).await?;
        info!(
            "batch {i}: {} rows -> {} bytes -> {topic}/{}@{}",
            batch.num_rows(),
            buffer.len(),
            receipt.partition,
            receipt.offset
        );
    }
    Ok(())
}

async fn consume(
    brokers: &str,
    topic: &str,
    group_id: &str,
    db_url: &str,
    table: &str,
    workers: usize,
) -> Result<()> {
    let factory = SqliteSinkFactory::new(db_url, table);
    let mut consumer_tasks = Vec::new();
    let mut worker_tasks = Vec::new();

    for worker_id in 0..workers {
        let config = ConsumerConfig {
            brokers: brokers.to_owned(),
            group_id: group_id.to_owned(),
            topics: vec![topic.to_owned()],
            ..ConsumerConfig::default()
        };
        let consumer = BatchConsumer::subscribe(&config)
            .with_context(|| format!("subscribing worker {worker_id} to {topic}"))?;

        let (ok_tx, ok_rx) = mpsc::channel(8);
        let (err_tx, mut err_rx) = mpsc::channel::<DecodeFailure>(8);

        // malformed messages stay observable, they are logged and skipped
        tokio::spawn(async move {
            while let Some(failure) = err_rx.recv().await {
                warn!(
                    "skipping undecodable message at {}/{}@{} ({} raw bytes): {}",
                    failure.topic,
                    failure.partition,
                    failure.offset,
                    failure.raw.len(),
                    failure.reason
                );
            }
        });

        let pull = consumer.clone();
        consumer_tasks.push(tokio::spawn(async move {
            if let Err(e) = pull.run(ok_tx, err_tx).await {
                error!("consumer {worker_id} stopped: {e}");
            }
        }));

        let ack = consumer.clone();
        let worker_factory = factory.clone();
        worker_tasks.push(tokio::spawn(async move {
            run_sink_worker(worker_id, workers, worker_factory, ok_rx, move |d: &DecodedBatch| {
                ack.ack(d)
            })
            .await
        }));
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down, draining {workers} workers");
    for task in consumer_tasks {
        task.abort();
    }
    for (worker_id, task) in worker_tasks.into_iter().enumerate() {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("worker {worker_id} failed: {e:#}"),
            Err(e) if e.is_cancelled() => {}
            Err(e) => error!("worker {worker_id} panicked: {e}"),
        }
    }
    Ok(())
}

/// Highest `cpu_used` value in one decoded batch; `None` for an empty
/// batch or a batch without that column.
fn max_cpu_used(batch: &RecordBatch) -> Option<f32> {
    let column = batch.column_by_name("cpu_used")?;
    arrow::compute::max(column.as_any().downcast_ref::<Float32Array>()?)
}

async fn analyze(brokers: &str, topic: &str, group_id: &str) -> Result<()> {
    let config = ConsumerConfig {
        brokers: brokers.to_owned(),
        group_id: group_id.to_owned(),
        topics: vec![topic.to_owned()],
        ..ConsumerConfig::default()
    };
    let consumer = BatchConsumer::subscribe(&config)
        .with_context(|| format!("subscribing analyzer to {topic}"))?;

    let (ok_tx, mut ok_rx) = mpsc::channel(8);
    let (err_tx, mut err_rx) = mpsc::channel::<DecodeFailure>(8);

    tokio::spawn(async move {
        while let Some(failure) = err_rx.recv().await {
            warn!(
                "skipping undecodable message at {}/{}@{} ({} raw bytes): {}",
                failure.topic,
                failure.partition,
                failure.offset,
                failure.raw.len(),
                failure.reason
            );
        }
    });

    let pull = consumer.clone();
    let pull_task = tokio::spawn(async move {
        if let Err(e) = pull.run(ok_tx, err_tx).await {
            error!("analyzer consumer stopped: {e}");
        }
    });

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            delivered = ok_rx.recv() => match delivered {
                Some(delivered) => {
                    match max_cpu_used(&delivered.batch) {
                        Some(peak) => info!(
                            "batch {}/{}@{}: {} rows, max cpu_used {peak:.1}",
                            delivered.topic,
                            delivered.partition,
                            delivered.offset,
                            delivered.batch.num_rows()
                        ),
                        None => info!(
                            "batch {}/{}@{}: {} rows, no cpu_used values",
                            delivered.topic,
                            delivered.partition,
                            delivered.offset,
                            delivered.batch.num_rows()
                        ),
                    }
                    consumer
                        .ack(&delivered)
                        .context("acknowledging analyzed batch")?;
                }
                None => break,
            },
            _ = &mut shutdown => break,
        }
    }
    pull_task.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Cli::parse();
    match args.role {
        Role::Produce {
            batch_size,
            num_batches,
            key,
            device,
        } => {
            produce(
                &args.brokers,
                &args.topic,
                batch_size,
                num_batches,
                key.map(String::into_bytes),
                &device,
            )
            .await
        }
        Role::Consume {
            group_id,
            db_url,
            table,
            workers,
        } => consume(&args.brokers, &args.topic, &group_id, &db_url, &table, workers).await,
        Role::Analyze { group_id } => analyze(&args.brokers, &args.topic, &group_id).await,
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use metricstream_telemetry::metrics_table::{MetricSample, samples_to_batch};

    use super::max_cpu_used;

    fn sample(cpu_used: f32) -> MetricSample {
        MetricSample {
            device: "localhost".to_owned(),
            ts: DateTime::from_timestamp_micros(1_700_000_000_000_000).unwrap(),
            cpu_used,
            cpu_free: 100.0 - cpu_used,
            memory_used: 40.0,
            memory_free: 60.0,
            run_elapsed_ms: 0,
        }
    }

    #[test]
    fn max_cpu_used_finds_the_peak() {
        let batch =
            samples_to_batch(&[sample(12.5), sample(93.0), sample(41.0)]).unwrap();
        assert_eq!(max_cpu_used(&batch), Some(93.0));
    }

    #[test]
    fn max_cpu_used_is_none_for_empty_batches() {
        let batch = samples_to_batch(&[]).unwrap();
        assert_eq!(max_cpu_used(&batch), None);
    }
}
