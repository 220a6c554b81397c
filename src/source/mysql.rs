//! MySQL-family source driver (MySQL and TiDB) built on sqlx.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use regex::Regex;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Row, TypeInfo};
use tracing::{debug, info, warn};

use super::{resolve_db_tables, RowBatch, Source, SourceError, Value, MAX_CELLS_PER_BATCH};
use crate::config::{Config, DatabaseType};
use crate::planner::TIME_FORMAT;
use crate::stats::StatsRecorder;

pub struct MysqlSource {
    cfg: Arc<Config>,
    pool: MySqlPool,
    db: String,
    table: String,
    /// Split-key interval observed at plan time; bounds the delete-after-sync
    /// window so rows arriving during the sync survive.
    observed_key_range: Mutex<Option<(i64, i64)>>,
    observed_time_range: Mutex<Option<(String, String)>>,
    stats: StatsRecorder,
}

impl MysqlSource {
    pub fn new(cfg: Arc<Config>, db: &str, table: &str) -> Self {
        let port = if cfg.source_port != 0 {
            cfg.source_port
        } else if cfg.database_type == DatabaseType::Tidb {
            4000
        } else {
            3306
        };

        let mut options = MySqlConnectOptions::new()
            .host(&cfg.source_host)
            .port(port)
            .username(&cfg.source_user)
            .password(&cfg.source_pass);
        // Discovery probes come unbound; the server picks the default schema
        if !db.is_empty() {
            options = options.database(db);
        }

        let pool = MySqlPoolOptions::new()
            .max_connections(cfg.max_thread as u32 + 1)
            .connect_lazy_with(options);

        Self {
            cfg,
            pool,
            db: db.to_string(),
            table: table.to_string(),
            observed_key_range: Mutex::new(None),
            observed_time_range: Mutex::new(None),
            stats: StatsRecorder::new(),
        }
    }

    fn table_ref(&self) -> String {
        format!("{}.{}", quote_ident(&self.db), quote_ident(&self.table))
    }

    fn where_condition(&self) -> &str {
        self.cfg.source_where_condition.trim()
    }
}

fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Convert one cell into the row model, dispatched on the driver's reported
/// column type. TINYINT(1) surfaces from sqlx as BOOLEAN; wider TINYINTs stay
/// integers.
fn row_value(row: &MySqlRow, idx: usize, type_name: &str) -> Result<Value, SourceError> {
    let value = match type_name {
        "BOOLEAN" => row.try_get::<Option<bool>, _>(idx)?.map(Value::Bool),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            row.try_get::<Option<i64>, _>(idx)?.map(Value::Int)
        }
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" | "YEAR" | "BIT" => {
            row.try_get::<Option<u64>, _>(idx)?.map(|v| {
                if v <= i64::MAX as u64 {
                    Value::Int(v as i64)
                } else {
                    // Preserve full precision for out-of-range BIGINT UNSIGNED
                    Value::Text(v.to_string())
                }
            })
        }
        "FLOAT" => row
            .try_get::<Option<f32>, _>(idx)?
            .map(|v| Value::Float(v as f64)),
        "DOUBLE" => row.try_get::<Option<f64>, _>(idx)?.map(Value::Float),
        "DECIMAL" => row
            .try_get::<Option<sqlx::types::BigDecimal>, _>(idx)?
            .map(|v| Value::Text(v.to_string())),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(idx)?
            .map(|d| Value::Text(d.format("%Y-%m-%d").to_string())),
        "TIME" => row
            .try_get::<Option<NaiveTime>, _>(idx)?
            .map(|t| Value::Text(t.format("%H:%M:%S").to_string())),
        "DATETIME" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)?
            .map(|ts| Value::Text(ts.format(TIME_FORMAT).to_string())),
        "TIMESTAMP" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)?
            .map(|ts| Value::Text(ts.format(TIME_FORMAT).to_string())),
        "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" => row
            .try_get::<Option<Vec<u8>>, _>(idx)?
            .map(|b| Value::Text(String::from_utf8_lossy(&b).into_owned())),
        "JSON" => row
            .try_get::<Option<serde_json::Value>, _>(idx)?
            .map(|v| Value::Text(v.to_string())),
        _ => row.try_get::<Option<String>, _>(idx)?.map(Value::Text),
    };
    Ok(value.unwrap_or(Value::Null))
}

#[async_trait]
impl Source for MysqlSource {
    async fn adjust_batch_size(&self) -> Result<u64, SourceError> {
        let row = sqlx::query(
            "SELECT COUNT(*) FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?",
        )
        .bind(&self.db)
        .bind(&self.table)
        .fetch_one(&self.pool)
        .await?;

        let columns: i64 = row.try_get(0)?;
        let columns = columns.max(0) as u64;
        let batch = self.cfg.batch_size;

        if columns == 0 || batch.saturating_mul(columns) <= MAX_CELLS_PER_BATCH {
            return Ok(batch);
        }

        let adjusted = (MAX_CELLS_PER_BATCH / columns).max(1);
        info!(
            table = %self.table_ref(),
            columns,
            configured = batch,
            adjusted,
            "downscaled batch size for wide table"
        );
        Ok(adjusted)
    }

    async fn min_max_split_key(&self) -> Result<(i64, i64), SourceError> {
        let key = quote_ident(self.cfg.source_split_key.trim());
        let sql = format!(
            "SELECT CAST(MIN({key}) AS SIGNED), CAST(MAX({key}) AS SIGNED) FROM {} WHERE {}",
            self.table_ref(),
            self.where_condition()
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;

        let min: Option<i64> = row.try_get(0)?;
        let max: Option<i64> = row.try_get(1)?;
        let (min, max) = match (min, max) {
            (Some(min), Some(max)) => (min, max),
            _ => (0, 0),
        };

        if let Ok(mut observed) = self.observed_key_range.lock() {
            *observed = Some((min, max));
        }
        Ok((min, max))
    }

    async fn min_max_time_split_key(&self) -> Result<(String, String), SourceError> {
        let key = quote_ident(self.cfg.source_split_time_key.trim());
        let sql = format!(
            "SELECT CAST(MIN({key}) AS DATETIME), CAST(MAX({key}) AS DATETIME) FROM {} WHERE {}",
            self.table_ref(),
            self.where_condition()
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;

        let min: Option<NaiveDateTime> = row.try_get(0)?;
        let max: Option<NaiveDateTime> = row.try_get(1)?;
        let (min, max) = match (min, max) {
            (Some(min), Some(max)) => (
                min.format(TIME_FORMAT).to_string(),
                max.format(TIME_FORMAT).to_string(),
            ),
            _ => (String::new(), String::new()),
        };

        if let Ok(mut observed) = self.observed_time_range.lock() {
            *observed = Some((min.clone(), max.clone()));
        }
        Ok((min, max))
    }

    async fn query_table_data(
        &self,
        thread_id: usize,
        predicate: &str,
    ) -> Result<RowBatch, SourceError> {
        let sql = format!(
            "SELECT * FROM {} WHERE ({}) AND {}",
            self.table_ref(),
            self.where_condition(),
            predicate
        );
        debug!(thread = thread_id, shard = predicate, "extracting shard");

        let fetched = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut columns = Vec::new();
        let mut rows = Vec::with_capacity(fetched.len());
        for row in &fetched {
            if columns.is_empty() {
                columns = row.columns().iter().map(|c| c.name().to_string()).collect();
            }
            let mut values = Vec::with_capacity(row.columns().len());
            for (idx, col) in row.columns().iter().enumerate() {
                values.push(row_value(row, idx, col.type_info().name())?);
            }
            rows.push(values);
        }

        self.stats.record_rows(rows.len() as u64);
        debug!(thread = thread_id, rows = rows.len(), "extracted shard");

        Ok(RowBatch::new(columns, rows))
    }

    async fn delete_after_sync(&self) -> Result<(), SourceError> {
        if !self.cfg.delete_after_sync {
            return Ok(());
        }

        let key_range = self.observed_key_range.lock().ok().and_then(|g| *g);
        let time_range = self
            .observed_time_range
            .lock()
            .ok()
            .and_then(|g| g.clone());

        let bound = if let Some((min, max)) = key_range {
            format!(
                "{} BETWEEN {min} AND {max}",
                quote_ident(self.cfg.source_split_key.trim())
            )
        } else if let Some((min, max)) = time_range {
            if min.is_empty() {
                warn!(table = %self.table_ref(), "no rows were observed, skipping delete");
                return Ok(());
            }
            format!(
                "{} BETWEEN '{min}' AND '{max}'",
                quote_ident(self.cfg.source_split_time_key.trim())
            )
        } else {
            warn!(table = %self.table_ref(), "no split range observed, skipping delete");
            return Ok(());
        };

        let sql = format!(
            "DELETE FROM {} WHERE ({}) AND {bound}",
            self.table_ref(),
            self.where_condition()
        );
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        info!(
            table = %self.table_ref(),
            rows = result.rows_affected(),
            "deleted archived rows from source"
        );
        Ok(())
    }

    async fn databases_matching(&self, db_pattern: &str) -> Result<Vec<String>, SourceError> {
        let pattern = Regex::new(db_pattern)?;
        let rows = sqlx::query("SHOW DATABASES").fetch_all(&self.pool).await?;

        let mut databases = Vec::new();
        for row in rows {
            let name: String = row.try_get(0)?;
            if is_system_database(&name) {
                continue;
            }
            if pattern.is_match(&name) {
                databases.push(name);
            }
        }
        Ok(databases)
    }

    async fn tables_matching(
        &self,
        table_pattern: &str,
        databases: &[String],
    ) -> Result<BTreeMap<String, Vec<String>>, SourceError> {
        let pattern = Regex::new(table_pattern)?;
        let mut out = BTreeMap::new();
        for db in databases {
            let sql = format!("SHOW TABLES FROM {}", quote_ident(db));
            let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

            let mut tables = Vec::new();
            for row in rows {
                let name: String = row.try_get(0)?;
                if pattern.is_match(&name) {
                    tables.push(name);
                }
            }
            if !tables.is_empty() {
                out.insert(db.clone(), tables);
            }
        }
        Ok(out)
    }

    async fn db_tables(&self) -> Result<BTreeMap<String, Vec<String>>, SourceError> {
        resolve_db_tables(self, &self.cfg.source_db_tables).await
    }

    fn read_rows_count(&self) -> u64 {
        self.stats.rows()
    }
}

fn is_system_database(name: &str) -> bool {
    matches!(
        name,
        "information_schema" | "mysql" | "performance_schema" | "sys" | "metrics_schema"
    )
}
