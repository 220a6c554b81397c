//! PostgreSQL source driver built on sqlx. `sslMode` is applied to the
//! connect options; everything else mirrors the MySQL driver with PostgreSQL
//! identifier quoting and type names.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use regex::Regex;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode};
use sqlx::{Column, Row, TypeInfo};
use tracing::{debug, info, warn};

use super::{resolve_db_tables, RowBatch, Source, SourceError, Value, MAX_CELLS_PER_BATCH};
use crate::config::Config;
use crate::planner::TIME_FORMAT;
use crate::stats::StatsRecorder;

pub struct PostgresSource {
    cfg: Arc<Config>,
    options: PgConnectOptions,
    pool: PgPool,
    table: String,
    observed_key_range: Mutex<Option<(i64, i64)>>,
    observed_time_range: Mutex<Option<(String, String)>>,
    stats: StatsRecorder,
}

impl PostgresSource {
    pub fn new(cfg: Arc<Config>, db: &str, table: &str) -> Self {
        let port = if cfg.source_port != 0 {
            cfg.source_port
        } else {
            5432
        };
        let ssl_mode =
            PgSslMode::from_str(cfg.ssl_mode.trim()).unwrap_or(PgSslMode::Prefer);

        // Discovery probes come unbound; the maintenance database answers
        let db = if db.is_empty() { "postgres" } else { db };
        let options = PgConnectOptions::new()
            .host(&cfg.source_host)
            .port(port)
            .username(&cfg.source_user)
            .password(&cfg.source_pass)
            .database(db)
            .ssl_mode(ssl_mode);

        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_thread as u32 + 1)
            .connect_lazy_with(options.clone());

        Self {
            cfg,
            options,
            pool,
            table: table.to_string(),
            observed_key_range: Mutex::new(None),
            observed_time_range: Mutex::new(None),
            stats: StatsRecorder::new(),
        }
    }

    /// Table reference with each dot-separated segment quoted, so both
    /// "users" and "analytics.users" work.
    fn table_ref(&self) -> String {
        self.table
            .split('.')
            .map(quote_ident)
            .collect::<Vec<_>>()
            .join(".")
    }

    fn schema_and_name(&self) -> (String, String) {
        match self.table.split_once('.') {
            Some((schema, name)) => (schema.to_string(), name.to_string()),
            None => ("public".to_string(), self.table.clone()),
        }
    }

    fn where_condition(&self) -> &str {
        self.cfg.source_where_condition.trim()
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn row_value(row: &PgRow, idx: usize, type_name: &str) -> Result<Value, SourceError> {
    let value = match type_name {
        "BOOL" => row.try_get::<Option<bool>, _>(idx)?.map(Value::Bool),
        "INT2" => row
            .try_get::<Option<i16>, _>(idx)?
            .map(|v| Value::Int(v as i64)),
        "INT4" => row
            .try_get::<Option<i32>, _>(idx)?
            .map(|v| Value::Int(v as i64)),
        "INT8" => row.try_get::<Option<i64>, _>(idx)?.map(Value::Int),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(idx)?
            .map(|v| Value::Float(v as f64)),
        "FLOAT8" => row.try_get::<Option<f64>, _>(idx)?.map(Value::Float),
        "NUMERIC" => row
            .try_get::<Option<sqlx::types::BigDecimal>, _>(idx)?
            .map(|v| Value::Text(v.to_string())),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(idx)?
            .map(|d| Value::Text(d.format("%Y-%m-%d").to_string())),
        "TIME" => row
            .try_get::<Option<NaiveTime>, _>(idx)?
            .map(|t| Value::Text(t.format("%H:%M:%S").to_string())),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)?
            .map(|ts| Value::Text(ts.format(TIME_FORMAT).to_string())),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)?
            .map(|ts| Value::Text(ts.format(TIME_FORMAT).to_string())),
        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(idx)?
            .map(|b| Value::Text(String::from_utf8_lossy(&b).into_owned())),
        "UUID" => row
            .try_get::<Option<sqlx::types::Uuid>, _>(idx)?
            .map(|v| Value::Text(v.to_string())),
        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(idx)?
            .map(|v| Value::Text(v.to_string())),
        _ => row.try_get::<Option<String>, _>(idx)?.map(Value::Text),
    };
    Ok(value.unwrap_or(Value::Null))
}

#[async_trait]
impl Source for PostgresSource {
    async fn adjust_batch_size(&self) -> Result<u64, SourceError> {
        let (schema, name) = self.schema_and_name();
        let row = sqlx::query(
            "SELECT COUNT(*)::bigint FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2",
        )
        .bind(&schema)
        .bind(&name)
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
            "SELECT MIN({key})::bigint, MAX({key})::bigint FROM {} WHERE {}",
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
            "SELECT MIN({key})::timestamp, MAX({key})::timestamp FROM {} WHERE {}",
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
        let rows = sqlx::query(
            "SELECT datname::text FROM pg_database \
             WHERE datistemplate = false ORDER BY datname",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut databases = Vec::new();
        for row in rows {
            let name: String = row.try_get(0)?;
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

        // PostgreSQL cannot query across databases; each one gets its own
        // short-lived pool.
        for db in databases {
            let pool = PgPoolOptions::new()
                .max_connections(1)
                .connect_lazy_with(self.options.clone().database(db));

            let rows = sqlx::query(
                "SELECT table_name::text FROM information_schema.tables \
                 WHERE table_schema = 'public' AND table_type = 'BASE TABLE' \
                 ORDER BY table_name",
            )
            .fetch_all(&pool)
            .await?;

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
