//! Source abstraction: every driver produces rows for a shard predicate and
//! answers the shape questions the worker needs for planning.

mod csv;
mod error;
mod mssql;
mod mysql;
mod postgres;
mod value;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{Config, DatabaseType};

pub use self::csv::{parse_row_condition, CsvSource};
pub use self::error::SourceError;
pub use self::mssql::MssqlSource;
pub use self::mysql::MysqlSource;
pub use self::postgres::PostgresSource;
pub use self::value::{RowBatch, Value};

/// When a table is very wide, shards are shrunk so one batch never exceeds
/// this many cells (rows x columns).
pub(crate) const MAX_CELLS_PER_BATCH: u64 = 1_000_000;

/// Contract every source driver honors. One instance is bound to a single
/// (database, table) pair; discovery methods ignore the binding.
#[async_trait]
pub trait Source: Send + Sync {
    /// Final shard width. SQL drivers downscale the configured batch for very
    /// wide tables; CSV returns the configured value unchanged.
    async fn adjust_batch_size(&self) -> Result<u64, SourceError>;

    /// Smallest and largest values of the integer split key under the user
    /// WHERE condition. An empty result yields `(0, 0)`.
    async fn min_max_split_key(&self) -> Result<(i64, i64), SourceError>;

    /// Same for a timestamp split key, formatted `YYYY-MM-DD HH:MM:SS`.
    async fn min_max_time_split_key(&self) -> Result<(String, String), SourceError>;

    /// Extract all rows matching the shard predicate (AND-composed with the
    /// user WHERE condition for SQL drivers).
    async fn query_table_data(
        &self,
        thread_id: usize,
        predicate: &str,
    ) -> Result<RowBatch, SourceError>;

    /// Remove archived rows (SQL) or source files (CSV) after a successful
    /// run. A no-op unless `deleteAfterSync` is set.
    async fn delete_after_sync(&self) -> Result<(), SourceError>;

    /// Databases whose names match the regex.
    async fn databases_matching(&self, db_pattern: &str) -> Result<Vec<String>, SourceError>;

    /// Per-database tables whose names match the regex.
    async fn tables_matching(
        &self,
        table_pattern: &str,
        databases: &[String],
    ) -> Result<BTreeMap<String, Vec<String>>, SourceError>;

    /// Resolve the configured `sourceDbTables` regex entries into concrete
    /// (database -> tables) pairs.
    async fn db_tables(&self) -> Result<BTreeMap<String, Vec<String>>, SourceError>;

    /// Rows extracted by this source so far.
    fn read_rows_count(&self) -> u64;
}

/// Build the driver selected by `databaseType`, bound to one (db, table).
pub fn new_source(
    cfg: Arc<Config>,
    db: &str,
    table: &str,
) -> Result<Arc<dyn Source>, SourceError> {
    match cfg.database_type {
        DatabaseType::Mysql | DatabaseType::Tidb => Ok(Arc::new(MysqlSource::new(cfg, db, table))),
        DatabaseType::Pg => Ok(Arc::new(PostgresSource::new(cfg, db, table))),
        DatabaseType::Mssql => Ok(Arc::new(MssqlSource::new(cfg, db, table))),
        DatabaseType::Csv => Ok(Arc::new(CsvSource::new(cfg)?)),
        DatabaseType::Oracle => Err(SourceError::Unsupported(
            "oracle sources are not implemented".to_string(),
        )),
    }
}

/// Shared `db_tables` resolution for the SQL drivers: each entry is
/// "dbRegex@tableRegex"; databases are enumerated first, then tables per
/// database.
pub(crate) async fn resolve_db_tables(
    source: &dyn Source,
    entries: &[String],
) -> Result<BTreeMap<String, Vec<String>>, SourceError> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for entry in entries {
        let (db_pattern, table_pattern) = entry.split_once('@').ok_or_else(|| {
            SourceError::Discovery(format!(
                "invalid sourceDbTables entry '{entry}', expected dbRegex@tableRegex"
            ))
        })?;
        let databases = source.databases_matching(db_pattern).await?;
        if databases.is_empty() {
            continue;
        }
        let tables = source.tables_matching(table_pattern, &databases).await?;
        for (db, mut names) in tables {
            let merged = out.entry(db).or_default();
            names.retain(|n| !merged.contains(n));
            merged.extend(names);
        }
    }
    Ok(out)
}
