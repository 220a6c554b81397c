//! SQL Server source driver built on tiberius. Connections are established
//! per operation; shard extraction therefore opens at most `maxThread`
//! concurrent connections.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use futures::TryStreamExt;
use regex::Regex;
use tiberius::{AuthMethod, Client, Config as MssqlConfig, QueryItem, Row as MssqlRow};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

use super::{resolve_db_tables, RowBatch, Source, SourceError, Value, MAX_CELLS_PER_BATCH};
use crate::config::Config;
use crate::planner::TIME_FORMAT;
use crate::stats::StatsRecorder;

pub struct MssqlSource {
    cfg: Arc<Config>,
    db: String,
    table: String,
    observed_key_range: Mutex<Option<(i64, i64)>>,
    observed_time_range: Mutex<Option<(String, String)>>,
    stats: StatsRecorder,
}

impl MssqlSource {
    pub fn new(cfg: Arc<Config>, db: &str, table: &str) -> Self {
        Self {
            cfg,
            db: db.to_string(),
            table: table.to_string(),
            observed_key_range: Mutex::new(None),
            observed_time_range: Mutex::new(None),
            stats: StatsRecorder::new(),
        }
    }

    async fn connect(&self) -> Result<Client<Compat<TcpStream>>, SourceError> {
        let mut config = MssqlConfig::new();
        config.host(&self.cfg.source_host);
        config.port(if self.cfg.source_port != 0 {
            self.cfg.source_port
        } else {
            1433
        });
        config.authentication(AuthMethod::sql_server(
            &self.cfg.source_user,
            &self.cfg.source_pass,
        ));
        if !self.db.is_empty() {
            config.database(&self.db);
        }
        config.trust_cert();

        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?;
        tcp.set_nodelay(true)
            .map_err(|e| SourceError::Connection(e.to_string()))?;

        let client = Client::connect(config, tcp.compat_write()).await?;
        Ok(client)
    }

    /// Run a query and collect column names plus raw rows.
    async fn query_rows(&self, sql: &str) -> Result<(Vec<String>, Vec<MssqlRow>), SourceError> {
        let mut client = self.connect().await?;
        let mut stream = client.query(sql, &[]).await?;

        let mut columns: Vec<String> = Vec::new();
        let mut rows = Vec::new();
        while let Some(item) = stream.try_next().await? {
            match item {
                QueryItem::Metadata(meta) => {
                    if columns.is_empty() {
                        columns = meta.columns().iter().map(|c| c.name().to_string()).collect();
                    }
                }
                QueryItem::Row(row) => {
                    if columns.is_empty() {
                        columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                    }
                    rows.push(row);
                }
            }
        }
        Ok((columns, rows))
    }

    async fn execute(&self, sql: &str) -> Result<u64, SourceError> {
        let mut client = self.connect().await?;
        let result = client.execute(sql, &[]).await?;
        Ok(result.total())
    }

    /// `[db].[schema].[table]`; an unqualified table name lands in dbo.
    fn table_ref(&self) -> String {
        let (schema, name) = self.schema_and_name();
        format!(
            "{}.{}.{}",
            quote_ident(&self.db),
            quote_ident(&schema),
            quote_ident(&name)
        )
    }

    fn schema_and_name(&self) -> (String, String) {
        match self.table.split_once('.') {
            Some((schema, name)) => (schema.to_string(), name.to_string()),
            None => ("dbo".to_string(), self.table.clone()),
        }
    }

    fn where_condition(&self) -> &str {
        self.cfg.source_where_condition.trim()
    }
}

fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Typed extraction ladder: each accessor succeeds only for its wire type, so
/// the first hit wins; a row value none of them match surfaces as NULL the
/// same way the column being NULL does.
fn row_value(row: &MssqlRow, idx: usize) -> Value {
    if let Ok(Some(v)) = row.try_get::<i64, _>(idx) {
        return Value::Int(v);
    }
    if let Ok(Some(v)) = row.try_get::<i32, _>(idx) {
        return Value::Int(v as i64);
    }
    if let Ok(Some(v)) = row.try_get::<i16, _>(idx) {
        return Value::Int(v as i64);
    }
    if let Ok(Some(v)) = row.try_get::<u8, _>(idx) {
        return Value::Int(v as i64);
    }
    if let Ok(Some(v)) = row.try_get::<f64, _>(idx) {
        return Value::Float(v);
    }
    if let Ok(Some(v)) = row.try_get::<f32, _>(idx) {
        return Value::Float(v as f64);
    }
    if let Ok(Some(v)) = row.try_get::<bool, _>(idx) {
        return Value::Bool(v);
    }
    if let Ok(Some(v)) = row.try_get::<tiberius::numeric::Numeric, _>(idx) {
        return Value::Text(v.to_string());
    }
    if let Ok(Some(v)) = row.try_get::<NaiveDateTime, _>(idx) {
        return Value::Text(v.format(TIME_FORMAT).to_string());
    }
    if let Ok(Some(v)) = row.try_get::<NaiveDate, _>(idx) {
        return Value::Text(v.format("%Y-%m-%d").to_string());
    }
    if let Ok(Some(v)) = row.try_get::<NaiveTime, _>(idx) {
        return Value::Text(v.format("%H:%M:%S").to_string());
    }
    if let Ok(Some(v)) = row.try_get::<&str, _>(idx) {
        return Value::Text(v.to_string());
    }
    if let Ok(Some(v)) = row.try_get::<&[u8], _>(idx) {
        return Value::Text(String::from_utf8_lossy(v).into_owned());
    }
    Value::Null
}

fn int_at(row: &MssqlRow, idx: usize) -> Option<i64> {
    match row_value(row, idx) {
        Value::Int(v) => Some(v),
        _ => None,
    }
}

#[async_trait]
impl Source for MssqlSource {
    async fn adjust_batch_size(&self) -> Result<u64, SourceError> {
        let (schema, name) = self.schema_and_name();
        let sql = format!(
            "SELECT COUNT(*) FROM {}.INFORMATION_SCHEMA.COLUMNS \
             WHERE TABLE_SCHEMA = '{}' AND TABLE_NAME = '{}'",
            quote_ident(&self.db),
            schema.replace('\'', "''"),
            name.replace('\'', "''")
        );
        let (_, rows) = self.query_rows(&sql).await?;

        let columns = rows
            .first()
            .and_then(|row| int_at(row, 0))
            .unwrap_or(0)
            .max(0) as u64;
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
            "SELECT CAST(MIN({key}) AS BIGINT), CAST(MAX({key}) AS BIGINT) FROM {} WHERE {}",
            self.table_ref(),
            self.where_condition()
        );
        let (_, rows) = self.query_rows(&sql).await?;

        let (min, max) = match rows.first() {
            Some(row) => match (int_at(row, 0), int_at(row, 1)) {
                (Some(min), Some(max)) => (min, max),
                _ => (0, 0),
            },
            None => (0, 0),
        };

        if let Ok(mut observed) = self.observed_key_range.lock() {
            *observed = Some((min, max));
        }
        Ok((min, max))
    }

    async fn min_max_time_split_key(&self) -> Result<(String, String), SourceError> {
        let key = quote_ident(self.cfg.source_split_time_key.trim());
        let sql = format!(
            "SELECT CAST(MIN({key}) AS DATETIME2), CAST(MAX({key}) AS DATETIME2) FROM {} WHERE {}",
            self.table_ref(),
            self.where_condition()
        );
        let (_, rows) = self.query_rows(&sql).await?;

        let bound_at = |row: &MssqlRow, idx: usize| -> Option<String> {
            row.try_get::<NaiveDateTime, _>(idx)
                .ok()
                .flatten()
                .map(|ts| ts.format(TIME_FORMAT).to_string())
        };
        let (min, max) = match rows.first() {
            Some(row) => match (bound_at(row, 0), bound_at(row, 1)) {
                (Some(min), Some(max)) => (min, max),
                _ => (String::new(), String::new()),
            },
            None => (String::new(), String::new()),
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

        let (columns, fetched) = self.query_rows(&sql).await?;

        let mut rows = Vec::with_capacity(fetched.len());
        for row in &fetched {
            let values = (0..columns.len()).map(|idx| row_value(row, idx)).collect();
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
        let deleted = self.execute(&sql).await?;
        info!(table = %self.table_ref(), rows = deleted, "deleted archived rows from source");
        Ok(())
    }

    async fn databases_matching(&self, db_pattern: &str) -> Result<Vec<String>, SourceError> {
        let pattern = Regex::new(db_pattern)?;
        let (_, rows) = self
            .query_rows("SELECT name FROM sys.databases WHERE database_id > 4 ORDER BY name")
            .await?;

        let mut databases = Vec::new();
        for row in &rows {
            if let Value::Text(name) = row_value(row, 0) {
                if pattern.is_match(&name) {
                    databases.push(name);
                }
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
            let sql = format!(
                "SELECT TABLE_NAME FROM {}.INFORMATION_SCHEMA.TABLES \
                 WHERE TABLE_TYPE = 'BASE TABLE' ORDER BY TABLE_NAME",
                quote_ident(db)
            );
            let (_, rows) = self.query_rows(&sql).await?;

            let mut tables = Vec::new();
            for row in &rows {
                if let Value::Text(name) = row_value(row, 0) {
                    if pattern.is_match(&name) {
                        tables.push(name);
                    }
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
    fn test_quote_ident_escapes_brackets() {
        assert_eq!(quote_ident("users"), "[users]");
        assert_eq!(quote_ident("odd]name"), "[odd]]name]");
    }
}
