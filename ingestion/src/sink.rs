use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use metricstream_telemetry::metrics_table::samples_from_batch;
use sqlx::{Connection, QueryBuilder, Sqlite, SqliteConnection};
use thiserror::Error;
use tracing::{debug, info};

// sqlite caps bound variables per prepared statement
// (SQLITE_MAX_VARIABLE_NUMBER, 32766 in the bundled library); batches above
// that are chunked inside one transaction
const MAX_BIND_PARAMS: usize = 32_766;
const PARAMS_PER_ROW: usize = 7;
const ROWS_PER_INSERT: usize = MAX_BIND_PARAMS / PARAMS_PER_ROW;

/// Error type for sink operations.
///
/// No retry happens at this level: whether a failed batch counts as
/// consumed is the caller's call, so failures propagate as-is.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Acquiring the store connection failed. Fatal to the owning worker.
    #[error("connecting to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: sqlx::Error,
    },

    /// Creating the samples table failed.
    #[error("preparing table {table}: {source}")]
    Setup {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    /// The batched insert failed.
    #[error("appending {rows} rows to {table}: {source}")]
    Append {
        table: String,
        rows: usize,
        #[source]
        source: sqlx::Error,
    },

    /// The batch's columns could not be read back as samples.
    #[error("reading batch columns: {0}")]
    InvalidBatch(String),

    /// The destination table name is not a plain identifier, so it cannot
    /// be spliced into the DDL and INSERT statements.
    #[error("invalid table name {0:?}: expected a plain identifier")]
    InvalidTable(String),

    /// Releasing the connection failed.
    #[error("closing sink connection: {0}")]
    Close(#[source] sqlx::Error),

    /// Append was called on a partition whose connection was already
    /// released.
    #[error("sink partition is closed")]
    Closed,
}

/// A per-worker writer into the persistent store.
///
/// Exclusively owned by one worker; never shared, never multiplexed.
#[async_trait]
pub trait SinkPartition: Send {
    /// Appends all rows of the batch atomically: either every row lands
    /// or none do. Append-only: redelivery of the same batch produces
    /// duplicate rows by design.
    async fn append(&mut self, batch: &RecordBatch) -> Result<(), SinkError>;

    /// Releases the store connection. Safe to call on every exit path;
    /// only the first call closes anything.
    async fn close(&mut self) -> Result<(), SinkError>;
}

/// Builds one [`SinkPartition`] per worker, invoked exactly once per
/// worker before its first append.
#[async_trait]
pub trait SinkFactory: Send + Sync {
    type Partition: SinkPartition;

    async fn build(
        &self,
        worker_id: usize,
        worker_count: usize,
    ) -> Result<Self::Partition, SinkError>;
}

/// Creates the samples table if it does not exist yet.
pub async fn ensure_samples_table(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<(), sqlx::Error> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {table}(
                  device TEXT NOT NULL,
                  ts TIMESTAMP NOT NULL,
                  cpu_used REAL NOT NULL,
                  cpu_free REAL NOT NULL,
                  memory_used REAL NOT NULL,
                  memory_free REAL NOT NULL,
                  run_elapsed_ms INTEGER NOT NULL
                  );"
    );
    sqlx::query(&sql).execute(conn).await?;
    Ok(())
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

enum SinkConn {
    // connection is acquired lazily, on the first append
    Idle { url: String },
    Open(Box<SqliteConnection>),
    Closed,
}

/// [`SinkPartition`] backed by an exclusively-owned SQLite connection.
///
/// Lifecycle is explicit: idle until the first append, open while the
/// worker lives, closed exactly once afterwards.
pub struct SqliteSinkPartition {
    conn: SinkConn,
    table: String,
    worker_id: usize,
}

impl SqliteSinkPartition {
    pub fn new(db_url: &str, table: &str, worker_id: usize) -> Result<Self, SinkError> {
        if !is_plain_identifier(table) {
            return Err(SinkError::InvalidTable(table.to_owned()));
        }
        Ok(Self {
            conn: SinkConn::Idle {
                url: db_url.to_owned(),
            },
            table: table.to_owned(),
            worker_id,
        })
    }

    async fn connection(&mut self) -> Result<&mut SqliteConnection, SinkError> {
        if let SinkConn::Idle { url } = &self.conn {
            let url = url.clone();
            let mut conn =
                SqliteConnection::connect(&url)
                    .await
                    .map_err(|source| SinkError::Connect {
                        url: url.clone(),
                        source,
                    })?;
            ensure_samples_table(&mut conn, &self.table)
                .await
                .map_err(|source| SinkError::Setup {
                    table: self.table.clone(),
                    source,
                })?;
            info!(
                "worker {} opened sink connection to {url}",
                self.worker_id
            );
            self.conn = SinkConn::Open(Box::new(conn));
        }
        match &mut self.conn {
            SinkConn::Open(conn) => Ok(conn),
            _ => Err(SinkError::Closed),
        }
    }
}

#[async_trait]
impl SinkPartition for SqliteSinkPartition {
    async fn append(&mut self, batch: &RecordBatch) -> Result<(), SinkError> {
        let samples = samples_from_batch(batch).map_err(|e| SinkError::InvalidBatch(e.to_string()))?;
        if samples.is_empty() {
            return Ok(());
        }
        let table = self.table.clone();
        let rows = samples.len();
        let conn = self.connection().await?;
        let mut tx = conn.begin().await.map_err(|source| SinkError::Append {
            table: table.clone(),
            rows,
            source,
        })?;
        for chunk in samples.chunks(ROWS_PER_INSERT) {
            let mut query = QueryBuilder::<Sqlite>::new(format!(
                "INSERT INTO {table}(device, ts, cpu_used, cpu_free, memory_used, memory_free, run_elapsed_ms) "
            ));
            query.push_values(chunk, |mut row, sample| {
                row.push_bind(&sample.device)
                    .push_bind(sample.ts)
                    .push_bind(sample.cpu_used)
                    .push_bind(sample.cpu_free)
                    .push_bind(sample.memory_used)
                    .push_bind(sample.memory_free)
                    .push_bind(sample.run_elapsed_ms);
            });
            query
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|source| SinkError::Append {
                    table: table.clone(),
                    rows,
                    source,
                })?;
        }
        // dropped transactions roll back, so a failed chunk never leaves a
        // partial batch behind
        tx.commit().await.map_err(|source| SinkError::Append {
            table,
            rows,
            source,
        })?;
        debug!("appended {rows} rows to {}", self.table);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        match std::mem::replace(&mut self.conn, SinkConn::Closed) {
            SinkConn::Open(conn) => {
                info!("worker {} released its sink connection", self.worker_id);
                (*conn).close().await.map_err(SinkError::Close)
            }
            // never opened, or already closed
            _ => Ok(()),
        }
    }
}

/// Builds one [`SqliteSinkPartition`] per worker, all pointing at the same
/// database file but each owning its own connection.
#[derive(Clone)]
pub struct SqliteSinkFactory {
    pub db_url: String,
    pub table: String,
}

impl SqliteSinkFactory {
    pub fn new(db_url: &str, table: &str) -> Self {
        Self {
            db_url: db_url.to_owned(),
            table: table.to_owned(),
        }
    }
}

#[async_trait]
impl SinkFactory for SqliteSinkFactory {
    type Partition = SqliteSinkPartition;

    async fn build(
        &self,
        worker_id: usize,
        worker_count: usize,
    ) -> Result<Self::Partition, SinkError> {
        debug!("building sink partition {worker_id}/{worker_count}");
        SqliteSinkPartition::new(&self.db_url, &self.table, worker_id)
    }
}
