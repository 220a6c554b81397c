//! Top-level driver: resolves the (database, table) pairs to archive and
//! runs one Worker per pair, sequentially. Shard parallelism lives inside
//! each Worker.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::config::Config;
use crate::ingest::{DatabendIngester, Ingester};
use crate::source::new_source;
use crate::worker::Worker;

#[derive(Debug, Default)]
pub struct ArchiveSummary {
    pub tables_succeeded: usize,
    pub tables_failed: usize,
    pub rows_loaded: u64,
    pub failed_tables: Vec<String>,
}

pub struct Archiver {
    cfg: Arc<Config>,
}

impl Archiver {
    pub fn new(cfg: Config) -> Self {
        Self { cfg: Arc::new(cfg) }
    }

    /// Archive every resolved table. Stops at the first failing table unless
    /// `continueOnTableError` is set; either way the first error is reported
    /// with its table name.
    pub async fn run(&self) -> Result<ArchiveSummary> {
        let pairs = self.resolve_pairs().await?;
        if pairs.is_empty() {
            anyhow::bail!("no source tables matched the configuration");
        }
        info!(tables = pairs.len(), "resolved source tables");

        let mut summary = ArchiveSummary::default();
        let mut first_error: Option<anyhow::Error> = None;

        for (db, table) in pairs {
            let source = new_source(self.cfg.clone(), &db, &table)
                .with_context(|| format!("failed to open source for {db}.{table}"))?;
            let target = self.target_table(&db, &table);
            let ingester = Arc::new(
                DatabendIngester::with_target_table(self.cfg.clone(), target)
                    .with_context(|| format!("failed to build ingester for {db}.{table}"))?,
            );

            let worker = Worker::new(self.cfg.clone(), &db, &table, source, ingester.clone());
            match worker.run().await {
                Ok(()) => {
                    summary.tables_succeeded += 1;
                    summary.rows_loaded += ingester.load_rows_count();
                }
                Err(e) => {
                    summary.tables_failed += 1;
                    summary.failed_tables.push(format!("{db}.{table}"));
                    error!(table = %format!("{db}.{table}"), error = %e, "table failed");
                    if !self.cfg.continue_on_table_error {
                        return Err(e);
                    }
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e.context(format!(
                "{} of {} tables failed (first failure: {})",
                summary.tables_failed,
                summary.tables_failed + summary.tables_succeeded,
                summary.failed_tables.join(", ")
            )));
        }

        Ok(summary)
    }

    /// The (database, table) pairs this run covers: the synthetic CSV pair,
    /// the resolved `sourceDbTables` regexes, or the single configured pair.
    async fn resolve_pairs(&self) -> Result<Vec<(String, String)>> {
        let multi_table = self.cfg.database_type.is_csv() || !self.cfg.source_db_tables.is_empty();
        if !multi_table {
            return Ok(vec![(
                self.cfg.source_db.clone(),
                self.cfg.source_table.clone(),
            )]);
        }

        let probe = new_source(self.cfg.clone(), &self.cfg.source_db, &self.cfg.source_table)
            .context("failed to open source for table discovery")?;
        let map = probe
            .db_tables()
            .await
            .context("failed to resolve sourceDbTables")?;

        let mut pairs = Vec::new();
        for (db, tables) in map {
            for table in tables {
                pairs.push((db.clone(), table));
            }
        }
        Ok(pairs)
    }

    /// Single-table runs load into `databendTable` as configured; multi-table
    /// runs re-template the target to `{targetSchema}.{db}_{table}`.
    fn target_table(&self, db: &str, table: &str) -> String {
        if self.cfg.source_db_tables.is_empty() {
            return self.cfg.databend_table.clone();
        }
        let schema = self
            .cfg
            .databend_table
            .split_once('.')
            .map(|(schema, _)| schema)
            .unwrap_or("default");
        format!("{schema}.{db}_{table}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archiver(source_db_tables: &str) -> Archiver {
        let json = format!(
            r#"{{
                "databaseType": "mysql",
                "sourceDB": "app",
                "sourceTable": "events",
                "sourceWhereCondition": "id > 0",
                "sourceSplitKey": "id",
                "sourceDbTables": {source_db_tables},
                "databendDSN": "http://u:p@localhost:8000",
                "databendTable": "warehouse.events_archive"
            }}"#
        );
        Archiver::new(serde_json::from_str(&json).unwrap())
    }

    #[test]
    fn test_single_table_target_is_unchanged() {
        let a = archiver("[]");
        assert_eq!(a.target_table("app", "events"), "warehouse.events_archive");
    }

    #[test]
    fn test_multi_table_target_is_retemplated() {
        let a = archiver(r#"["app.*@events.*"]"#);
        assert_eq!(a.target_table("app1", "events_eu"), "warehouse.app1_events_eu");
    }

    #[tokio::test]
    async fn test_single_pair_resolution() {
        let a = archiver("[]");
        let pairs = a.resolve_pairs().await.unwrap();
        assert_eq!(pairs, vec![("app".to_string(), "events".to_string())]);
    }
}
