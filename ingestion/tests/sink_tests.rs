use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::DateTime;
use metricstream_ingestion::{
    SinkError, SinkFactory, SinkPartition, SqliteSinkFactory, SqliteSinkPartition,
    run_sink_worker,
};
use metricstream_telemetry::metrics_table::{MetricSample, samples_to_batch};
use metricstream_transport::DecodedBatch;
use sqlx::{Connection, SqliteConnection};
use tokio::sync::mpsc;

fn samples(n: usize) -> Vec<MetricSample> {
    (0..n)
        .map(|i| MetricSample {
            device: "localhost".to_owned(),
            ts: DateTime::from_timestamp_micros(1_700_000_000_000_000 + i as i64).unwrap(),
            cpu_used: 25.0,
            cpu_free: 75.0,
            memory_used: 40.0,
            memory_free: 60.0,
            run_elapsed_ms: i as i32,
        })
        .collect()
}

fn delivered(batch: RecordBatch, offset: i64) -> DecodedBatch {
    DecodedBatch {
        batch,
        topic: "metrics".to_owned(),
        partition: 0,
        offset,
        key: None,
    }
}

struct TestDb {
    _dir: tempfile::TempDir,
    url: String,
}

fn test_db() -> TestDb {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("sink.db").display());
    TestDb { _dir: dir, url }
}

async fn count_rows(url: &str) -> i64 {
    let mut conn = SqliteConnection::connect(url).await.unwrap();
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM samples")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    conn.close().await.unwrap();
    count
}

#[tokio::test]
async fn appending_twice_duplicates_rows() {
    let db = test_db();
    let batch = samples_to_batch(&samples(50)).unwrap();
    let mut partition = SqliteSinkPartition::new(&db.url, "samples", 0).unwrap();

    partition.append(&batch).await.unwrap();
    partition.append(&batch).await.unwrap();
    partition.close().await.unwrap();

    // append-only, no dedup key: redelivery doubles the row count
    assert_eq!(count_rows(&db.url).await, 100);
}

#[tokio::test]
async fn append_after_close_fails() {
    let db = test_db();
    let batch = samples_to_batch(&samples(3)).unwrap();
    let mut partition = SqliteSinkPartition::new(&db.url, "samples", 0).unwrap();

    partition.append(&batch).await.unwrap();
    partition.close().await.unwrap();
    assert!(matches!(
        partition.append(&batch).await,
        Err(SinkError::Closed)
    ));
    // second close is a no-op
    partition.close().await.unwrap();
}

#[tokio::test]
async fn connection_is_acquired_lazily() {
    let db = test_db();
    let mut partition = SqliteSinkPartition::new(&db.url, "samples", 0).unwrap();
    // no append yet: closing a never-opened partition touches nothing
    partition.close().await.unwrap();

    let mut partition = SqliteSinkPartition::new(&db.url, "samples", 1).unwrap();
    partition
        .append(&samples_to_batch(&samples(2)).unwrap())
        .await
        .unwrap();
    partition.close().await.unwrap();
    assert_eq!(count_rows(&db.url).await, 2);
}

#[tokio::test]
async fn empty_batch_append_is_a_no_op() {
    let db = test_db();
    let mut partition = SqliteSinkPartition::new(&db.url, "samples", 0).unwrap();
    partition
        .append(&samples_to_batch(&[]).unwrap())
        .await
        .unwrap();
    partition.close().await.unwrap();
}

// 5000 rows is more bound parameters than sqlite allows in one prepared
// statement; the append must still land every row.
#[tokio::test]
async fn batches_beyond_one_statement_are_appended_whole() {
    let db = test_db();
    let batch = samples_to_batch(&samples(5000)).unwrap();
    let mut partition = SqliteSinkPartition::new(&db.url, "samples", 0).unwrap();

    partition.append(&batch).await.unwrap();
    partition.close().await.unwrap();

    assert_eq!(count_rows(&db.url).await, 5000);
}

#[tokio::test]
async fn table_name_must_be_a_plain_identifier() {
    let db = test_db();
    assert!(matches!(
        SqliteSinkPartition::new(&db.url, "samples; DROP TABLE samples", 0),
        Err(SinkError::InvalidTable(_))
    ));
    let factory = SqliteSinkFactory::new(&db.url, "bad-table");
    assert!(matches!(
        factory.build(0, 1).await,
        Err(SinkError::InvalidTable(_))
    ));
}

#[tokio::test]
async fn worker_drains_appends_and_acknowledges_in_order() {
    let db = test_db();
    let (tx, rx) = mpsc::channel(4);
    tx.send(delivered(samples_to_batch(&samples(10)).unwrap(), 5))
        .await
        .unwrap();
    tx.send(delivered(samples_to_batch(&samples(10)).unwrap(), 6))
        .await
        .unwrap();
    drop(tx); // channel closed = worker shutdown

    let acked = Arc::new(Mutex::new(Vec::new()));
    let ack_log = Arc::clone(&acked);
    run_sink_worker(
        0,
        1,
        SqliteSinkFactory::new(&db.url, "samples"),
        rx,
        move |d: &DecodedBatch| {
            ack_log.lock().unwrap().push(d.offset);
            Ok(())
        },
    )
    .await
    .unwrap();

    assert_eq!(count_rows(&db.url).await, 20);
    assert_eq!(*acked.lock().unwrap(), vec![5, 6]);
}

struct FailingPartition {
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl SinkPartition for FailingPartition {
    async fn append(&mut self, _batch: &RecordBatch) -> Result<(), SinkError> {
        Err(SinkError::InvalidBatch("store unavailable".to_owned()))
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct FailingFactory {
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl SinkFactory for FailingFactory {
    type Partition = FailingPartition;

    async fn build(
        &self,
        _worker_id: usize,
        _worker_count: usize,
    ) -> Result<Self::Partition, SinkError> {
        Ok(FailingPartition {
            closed: Arc::clone(&self.closed),
        })
    }
}

#[tokio::test]
async fn failed_append_is_never_acknowledged_and_still_releases_the_connection() {
    let (tx, rx) = mpsc::channel(1);
    tx.send(delivered(samples_to_batch(&samples(1)).unwrap(), 9))
        .await
        .unwrap();
    drop(tx);

    let closed = Arc::new(AtomicBool::new(false));
    let acked = Arc::new(Mutex::new(Vec::new()));
    let ack_log = Arc::clone(&acked);
    let result = run_sink_worker(
        0,
        1,
        FailingFactory {
            closed: Arc::clone(&closed),
        },
        rx,
        move |d: &DecodedBatch| {
            ack_log.lock().unwrap().push(d.offset);
            Ok(())
        },
    )
    .await;

    assert!(result.is_err());
    assert!(acked.lock().unwrap().is_empty());
    assert!(closed.load(Ordering::SeqCst));
}
