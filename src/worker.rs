//! Per-table orchestration: size batches, plan shards, then extract and load
//! shards through a semaphore-bounded task pool. The first shard error
//! cancels the remaining shards and fails the table.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::ingest::Ingester;
use crate::planner;
use crate::source::Source;

pub struct Worker {
    cfg: Arc<Config>,
    db: String,
    table: String,
    source: Arc<dyn Source>,
    ingester: Arc<dyn Ingester>,
}

impl Worker {
    pub fn new(
        cfg: Arc<Config>,
        db: &str,
        table: &str,
        source: Arc<dyn Source>,
        ingester: Arc<dyn Ingester>,
    ) -> Self {
        Self {
            cfg,
            db: db.to_string(),
            table: table.to_string(),
            source,
            ingester,
        }
    }

    pub fn table_id(&self) -> String {
        format!("{}.{}", self.db, self.table)
    }

    /// Archive one table end to end.
    pub async fn run(&self) -> Result<()> {
        let table_id = self.table_id();

        let batch_size = self
            .source
            .adjust_batch_size()
            .await
            .with_context(|| format!("failed to size batches for {table_id}"))?;

        let plan = self.build_plan(batch_size).await?;
        if plan.is_empty() {
            info!(table = %table_id, "source interval is empty, nothing to archive");
            return Ok(());
        }
        info!(
            table = %table_id,
            shards = plan.len(),
            threads = self.cfg.max_thread,
            batch_size,
            "archiving table"
        );

        let semaphore = Arc::new(Semaphore::new(self.cfg.max_thread));
        let token = CancellationToken::new();
        let mut handles = Vec::with_capacity(plan.len());

        for (thread_id, predicate) in plan.into_iter().enumerate() {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("shard semaphore closed")?;
            let source = self.source.clone();
            let ingester = self.ingester.clone();
            let token = token.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                if token.is_cancelled() {
                    return Ok(());
                }

                let work = async {
                    let batch = source
                        .query_table_data(thread_id, &predicate)
                        .await
                        .map_err(|e| anyhow::anyhow!("shard {predicate}: extract failed: {e}"))?;
                    ingester
                        .ingest_data(&batch.columns, batch.rows)
                        .await
                        .map_err(|e| anyhow::anyhow!("shard {predicate}: load failed: {e}"))?;
                    Ok::<(), anyhow::Error>(())
                };

                tokio::select! {
                    _ = token.cancelled() => Ok(()),
                    result = work => {
                        if result.is_err() {
                            token.cancel();
                        }
                        result
                    }
                }
            }));
        }

        let mut first_error: Option<anyhow::Error> = None;
        for handle in handles {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("shard task panicked: {e}")),
            };
            if let Err(e) = outcome {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        if let Some(e) = first_error {
            error!(table = %table_id, error = %e, "archive failed");
            return Err(e.context(format!("archiving {table_id}")));
        }

        info!(
            table = %table_id,
            extracted = self.source.read_rows_count(),
            loaded = self.ingester.load_rows_count(),
            "table archived"
        );

        if self.cfg.delete_after_sync {
            self.source
                .delete_after_sync()
                .await
                .with_context(|| format!("delete after sync failed for {table_id}"))?;
        }

        Ok(())
    }

    async fn build_plan(&self, batch_size: u64) -> Result<Vec<String>> {
        let table_id = self.table_id();
        let column = self.cfg.split_column().to_string();

        if self.cfg.uses_time_split() {
            let (min, max) = self
                .source
                .min_max_time_split_key()
                .await
                .with_context(|| format!("failed to read time bounds of {table_id}"))?;
            if min.is_empty() || max.is_empty() {
                return Ok(Vec::new());
            }
            planner::split_time_ranges(&column, &min, &max, self.cfg.time_split_unit)
                .with_context(|| format!("failed to plan time shards for {table_id}"))
        } else {
            let (min, max) = self
                .source
                .min_max_split_key()
                .await
                .with_context(|| format!("failed to read key bounds of {table_id}"))?;
            if min == 0 && max == 0 {
                return Ok(Vec::new());
            }
            Ok(planner::split_key_ranges(&column, min, max, batch_size))
        }
    }
}
