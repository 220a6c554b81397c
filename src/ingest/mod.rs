//! Databend ingester: serialize a row batch to CSV, upload it to the user
//! stage, and COPY it into the target table, retrying transient failures
//! with jittered exponential backoff.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::databend::{DatabendClient, DatabendError};
use crate::source::Value;
use crate::stats::StatsRecorder;

/// Upload + COPY attempts per batch.
const MAX_LOAD_ATTEMPTS: u32 = 5;
const BACKOFF_BASE_SECS: f64 = 1.0;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Databend(#[from] DatabendError),

    #[error("batch serialization failed: {0}")]
    Serialize(String),

    #[error("io error: {0}")]
    Io(String),
}

impl IngestError {
    fn is_transient(&self) -> bool {
        match self {
            IngestError::Databend(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Seam between the worker and the warehouse, mockable in tests.
#[async_trait]
pub trait Ingester: Send + Sync {
    /// Atomically load one batch into the target table.
    async fn ingest_data(&self, columns: &[String], rows: Vec<Vec<Value>>)
        -> Result<(), IngestError>;

    /// Rows loaded so far.
    fn load_rows_count(&self) -> u64;
}

pub struct DatabendIngester {
    cfg: Arc<Config>,
    client: DatabendClient,
    target_table: String,
    staging_dir: PathBuf,
    stats: StatsRecorder,
}

impl DatabendIngester {
    pub fn new(cfg: Arc<Config>) -> Result<Self, DatabendError> {
        let target_table = cfg.databend_table.clone();
        Self::with_target_table(cfg, target_table)
    }

    /// Multi-table mode points each ingester at a re-templated target.
    pub fn with_target_table(cfg: Arc<Config>, target_table: String) -> Result<Self, DatabendError> {
        let client = DatabendClient::from_dsn(&cfg.databend_dsn)?;
        Ok(Self {
            cfg,
            client,
            target_table,
            staging_dir: std::env::temp_dir(),
            stats: StatsRecorder::new(),
        })
    }

    /// Where batch files live before upload. Defaults to the system temp dir.
    pub fn staging_dir(mut self, dir: PathBuf) -> Self {
        self.staging_dir = dir;
        self
    }

    pub fn target_table(&self) -> &str {
        &self.target_table
    }

    async fn load_staged(&self, local_path: &Path, file_name: &str) -> Result<(), IngestError> {
        let stage = &self.cfg.user_stage;
        self.client
            .upload_to_stage(stage, file_name, local_path)
            .await?;
        let sql = copy_statement(
            &self.target_table,
            stage,
            file_name,
            self.cfg.copy_purge,
            self.cfg.copy_force,
            self.cfg.disable_variant_check,
        );
        self.client.exec(&sql).await?;
        Ok(())
    }
}

#[async_trait]
impl Ingester for DatabendIngester {
    async fn ingest_data(
        &self,
        columns: &[String],
        rows: Vec<Vec<Value>>,
    ) -> Result<(), IngestError> {
        if rows.is_empty() {
            return Ok(());
        }
        let row_count = rows.len() as u64;

        let file_name = format!("{}.csv", Uuid::new_v4());
        let local_path = self.staging_dir.join(&file_name);
        write_batch_csv(&local_path, columns, &rows)?;
        let staged_bytes = tokio::fs::metadata(&local_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            match self.load_staged(&local_path, &file_name).await {
                Ok(()) => break Ok(()),
                Err(e) if e.is_transient() && attempt < MAX_LOAD_ATTEMPTS => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        table = %self.target_table,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient load failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => break Err(e),
            }
        };

        // The temp file is done either way; the stage object survives a
        // terminal failure for inspection unless copyPurge cleaned it up.
        if let Err(e) = tokio::fs::remove_file(&local_path).await {
            warn!(path = %local_path.display(), error = %e, "failed to remove staged temp file");
        }

        result?;

        self.stats.record_rows(row_count);
        self.stats.record_bytes(staged_bytes);
        info!(
            table = %self.target_table,
            rows = row_count,
            bytes = staged_bytes,
            rows_per_sec = self.stats.rows_per_second(),
            "batch loaded"
        );
        Ok(())
    }

    fn load_rows_count(&self) -> u64 {
        self.stats.rows()
    }
}

/// Serialize one batch to an RFC-4180 CSV file with a header row. NULLs are
/// written as empty fields; the COPY options translate those back with
/// `NULL_IF = ('')`.
fn write_batch_csv(
    path: &Path,
    columns: &[String],
    rows: &[Vec<Value>],
) -> Result<(), IngestError> {
    let mut writer =
        csv::Writer::from_path(path).map_err(|e| IngestError::Io(e.to_string()))?;

    writer
        .write_record(columns)
        .map_err(|e| IngestError::Serialize(e.to_string()))?;
    for row in rows {
        writer
            .write_record(row.iter().map(|v| v.csv_field()))
            .map_err(|e| IngestError::Serialize(e.to_string()))?;
    }
    writer.flush().map_err(|e| IngestError::Io(e.to_string()))?;
    Ok(())
}

fn copy_statement(
    table: &str,
    stage: &str,
    file_name: &str,
    purge: bool,
    force: bool,
    disable_variant_check: bool,
) -> String {
    format!(
        "COPY INTO {table} FROM @{stage}/{file_name} \
         FILE_FORMAT = (TYPE = CSV, SKIP_HEADER = 1, FIELD_DELIMITER = ',', \
         RECORD_DELIMITER = '\\n', NULL_IF = ('')) \
         PURGE = {purge} FORCE = {force} DISABLE_VARIANT_CHECK = {disable_variant_check}"
    )
}

/// Exponential backoff with +/-25% jitter: 1 s, 2 s, 4 s, ... before jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_SECS * 2f64.powi(attempt.saturating_sub(1) as i32);
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_secs_f64(exp * jitter)
}

struct Buffered {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    first_row_at: Option<Instant>,
}

/// Coalesces incoming rows until `batchSize` rows accumulate or
/// `batchMaxInterval` elapses from the first buffered row, then delegates one
/// COPY. Not the worker path; callers own a final `flush()` on shutdown.
pub struct BufferedIngester {
    inner: Arc<dyn Ingester>,
    batch_size: usize,
    max_interval: Duration,
    buffer: Mutex<Buffered>,
}

impl BufferedIngester {
    pub fn new(inner: Arc<dyn Ingester>, batch_size: u64, max_interval: Duration) -> Self {
        Self {
            inner,
            batch_size: batch_size.max(1) as usize,
            max_interval,
            buffer: Mutex::new(Buffered {
                columns: Vec::new(),
                rows: Vec::new(),
                first_row_at: None,
            }),
        }
    }

    /// Drain whatever is buffered.
    pub async fn flush(&self) -> Result<(), IngestError> {
        let mut buffer = self.buffer.lock().await;
        self.flush_locked(&mut buffer).await
    }

    async fn flush_locked(&self, buffer: &mut Buffered) -> Result<(), IngestError> {
        if buffer.rows.is_empty() {
            return Ok(());
        }
        let columns = buffer.columns.clone();
        let rows = std::mem::take(&mut buffer.rows);
        buffer.first_row_at = None;
        debug!(rows = rows.len(), "flushing buffered batch");
        self.inner.ingest_data(&columns, rows).await
    }
}

#[async_trait]
impl Ingester for BufferedIngester {
    async fn ingest_data(
        &self,
        columns: &[String],
        rows: Vec<Vec<Value>>,
    ) -> Result<(), IngestError> {
        let mut buffer = self.buffer.lock().await;
        if buffer.columns.is_empty() {
            buffer.columns = columns.to_vec();
        }
        if buffer.first_row_at.is_none() && !rows.is_empty() {
            buffer.first_row_at = Some(Instant::now());
        }
        buffer.rows.extend(rows);

        let interval_hit = buffer
            .first_row_at
            .map(|t| t.elapsed() >= self.max_interval)
            .unwrap_or(false);
        if buffer.rows.len() >= self.batch_size || interval_hit {
            self.flush_locked(&mut buffer).await?;
        }
        Ok(())
    }

    fn load_rows_count(&self) -> u64 {
        self.inner.load_rows_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingIngester {
        batches: StdMutex<Vec<(Vec<String>, usize)>>,
        rows: AtomicU64,
    }

    #[async_trait]
    impl Ingester for RecordingIngester {
        async fn ingest_data(
            &self,
            columns: &[String],
            rows: Vec<Vec<Value>>,
        ) -> Result<(), IngestError> {
            self.rows.fetch_add(rows.len() as u64, Ordering::SeqCst);
            self.batches
                .lock()
                .unwrap()
                .push((columns.to_vec(), rows.len()));
            Ok(())
        }

        fn load_rows_count(&self) -> u64 {
            self.rows.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_csv_serialization_quotes_per_rfc4180() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.csv");
        let columns = vec!["id".to_string(), "note".to_string(), "score".to_string()];
        let rows = vec![
            vec![
                Value::Int(1),
                Value::Text("plain".to_string()),
                Value::Float(1.5),
            ],
            vec![
                Value::Int(2),
                Value::Text("has,comma and \"quote\"".to_string()),
                Value::Null,
            ],
            vec![
                Value::Int(3),
                Value::Text("line\nbreak".to_string()),
                Value::Bool(true),
            ],
        ];

        write_batch_csv(&path, &columns, &rows).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();

        let mut lines = content.split('\n');
        assert_eq!(lines.next().unwrap(), "id,note,score");
        assert_eq!(lines.next().unwrap(), "1,plain,1.5");
        // Comma and quote force quoting with doubled inner quotes; the NULL
        // renders as a bare empty field
        assert_eq!(lines.next().unwrap(), "2,\"has,comma and \"\"quote\"\"\",");
        // The embedded newline keeps the field quoted across lines
        assert_eq!(lines.next().unwrap(), "3,\"line");
        assert_eq!(lines.next().unwrap(), "break\",true");
    }

    #[test]
    fn test_copy_statement_rendering() {
        let sql = copy_statement("default.archive", "~", "abc.csv", true, false, true);
        assert_eq!(
            sql,
            "COPY INTO default.archive FROM @~/abc.csv \
             FILE_FORMAT = (TYPE = CSV, SKIP_HEADER = 1, FIELD_DELIMITER = ',', \
             RECORD_DELIMITER = '\\n', NULL_IF = ('')) \
             PURGE = true FORCE = false DISABLE_VARIANT_CHECK = true"
        );
    }

    #[test]
    fn test_backoff_delay_bounds() {
        for attempt in 1..=5u32 {
            let base = 2f64.powi(attempt as i32 - 1);
            for _ in 0..10 {
                let delay = backoff_delay(attempt).as_secs_f64();
                assert!(delay >= base * 0.75 - 1e-9, "attempt {attempt}: {delay}");
                assert!(delay <= base * 1.25 + 1e-9, "attempt {attempt}: {delay}");
            }
        }
    }

    fn row(id: i64) -> Vec<Value> {
        vec![Value::Int(id)]
    }

    #[tokio::test]
    async fn test_buffered_ingester_flushes_on_batch_size() {
        let inner = Arc::new(RecordingIngester::default());
        let buffered =
            BufferedIngester::new(inner.clone(), 3, Duration::from_secs(3600));

        let cols = vec!["id".to_string()];
        buffered.ingest_data(&cols, vec![row(1)]).await.unwrap();
        buffered.ingest_data(&cols, vec![row(2)]).await.unwrap();
        assert_eq!(inner.load_rows_count(), 0);

        buffered.ingest_data(&cols, vec![row(3)]).await.unwrap();
        assert_eq!(inner.load_rows_count(), 3);
        assert_eq!(inner.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_buffered_ingester_flushes_on_interval() {
        let inner = Arc::new(RecordingIngester::default());
        let buffered = BufferedIngester::new(inner.clone(), 1000, Duration::ZERO);

        let cols = vec!["id".to_string()];
        buffered.ingest_data(&cols, vec![row(1)]).await.unwrap();
        // Zero interval means the first call already exceeds it
        assert_eq!(inner.load_rows_count(), 1);
    }

    #[tokio::test]
    async fn test_buffered_ingester_explicit_flush() {
        let inner = Arc::new(RecordingIngester::default());
        let buffered =
            BufferedIngester::new(inner.clone(), 1000, Duration::from_secs(3600));

        let cols = vec!["id".to_string()];
        buffered
            .ingest_data(&cols, vec![row(1), row(2)])
            .await
            .unwrap();
        assert_eq!(inner.load_rows_count(), 0);

        buffered.flush().await.unwrap();
        assert_eq!(inner.load_rows_count(), 2);

        // Flushing an empty buffer is a no-op
        buffered.flush().await.unwrap();
        assert_eq!(inner.batches.lock().unwrap().len(), 1);
    }
}
