#![allow(async_fn_in_trait)]

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use crate::schema::diff::Operation;
use crate::schema::model::{ElementId, LiveSchema};
use crate::schema::plan::Plan;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ddl step failed for {element}: {message}")]
    Ddl { element: ElementId, message: String },

    #[error("database error")]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Introspect(#[from] crate::schema::introspect::IntrospectError),

    #[error("another reconciliation holds the catalog lock for {0}")]
    LockUnavailable(String),
}

/// The executor's view of a schema store. One implementation talks to
/// Postgres, another applies operations to an in-memory snapshot for tests;
/// the executor cannot tell them apart.
pub trait SchemaStore {
    /// Introspect the current structure. Called at the start of a run and
    /// after a rolled-back unit.
    async fn snapshot(&mut self) -> Result<LiveSchema, StoreError>;

    /// Apply a single structural operation.
    async fn execute(&mut self, op: &Operation) -> Result<(), StoreError>;

    /// Whether DDL can run inside a transaction. When true the executor
    /// wraps each table's batch in begin/commit.
    fn supports_transactional_ddl(&self) -> bool {
        false
    }

    async fn begin_unit(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn commit_unit(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn rollback_unit(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Process-wide advisory lock on the target catalog. Fails fast when a
    /// concurrent reconciliation already holds it.
    async fn acquire_lock(&mut self) -> Result<(), StoreError>;

    async fn release_lock(&mut self) -> Result<(), StoreError>;

    /// Fingerprint of the last fully applied logical schema, if any.
    async fn read_fingerprint(&mut self) -> Result<Option<String>, StoreError>;

    async fn write_fingerprint(&mut self, fingerprint: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableStatus {
    Applied,
    NoChange,
    Failed { reason: String },
    Skipped { blocked_on: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct TableOutcome {
    pub table: String,
    #[serde(flatten)]
    pub status: TableStatus,
    pub operations_applied: usize,
}

/// Per-table result of an apply run. A partial result is normal operation,
/// not an error: committed tables stay committed and the run is safe to
/// repeat after remediation.
#[derive(Debug, Default, Serialize)]
pub struct ApplyReport {
    pub tables: Vec<TableOutcome>,
}

impl ApplyReport {
    pub fn fully_applied(&self) -> bool {
        self.tables
            .iter()
            .all(|t| matches!(t.status, TableStatus::Applied | TableStatus::NoChange))
    }

    pub fn changed(&self) -> bool {
        self.tables
            .iter()
            .any(|t| t.operations_applied > 0)
    }
}

pub struct Executor<'a, S: SchemaStore> {
    store: &'a mut S,
}

impl<'a, S: SchemaStore> Executor<'a, S> {
    pub fn new(store: &'a mut S) -> Self {
        Self { store }
    }

    /// Walk the plan batch by batch. Before every operation the live
    /// snapshot is consulted, so steps a crashed earlier run already
    /// performed are skipped instead of re-applied.
    /// A failing operation aborts the rest of its batch and every batch
    /// depending on it; earlier batches stay committed.
    pub async fn apply(&mut self, plan: &Plan) -> Result<ApplyReport, StoreError> {
        let mut live = self.store.snapshot().await?;
        let mut report = ApplyReport::default();
        let mut blocked: BTreeMap<usize, String> = BTreeMap::new();

        for (index, batch) in plan.batches().iter().enumerate() {
            if let Some(blocked_on) = blocked.get(&index) {
                tracing::warn!(table = %batch.table, blocked_on = %blocked_on, "skipping dependent batch");
                report.tables.push(TableOutcome {
                    table: batch.table.clone(),
                    status: TableStatus::Skipped {
                        blocked_on: blocked_on.clone(),
                    },
                    operations_applied: 0,
                });
                continue;
            }

            if batch.operations.iter().all(|op| op.is_applied(&live)) {
                report.tables.push(TableOutcome {
                    table: batch.table.clone(),
                    status: TableStatus::NoChange,
                    operations_applied: 0,
                });
                continue;
            }

            let transactional = self.store.supports_transactional_ddl();
            if transactional {
                self.store.begin_unit().await?;
            }

            let mut applied = 0;
            let mut failure: Option<String> = None;
            for op in &batch.operations {
                // Checked per step against the updated snapshot: a drop
                // earlier in the batch can make a later add necessary that
                // looked applied when the batch started.
                if op.is_applied(&live) {
                    continue;
                }
                tracing::debug!(table = %batch.table, operation = %op, "applying");
                match self.store.execute(op).await {
                    Ok(()) => {
                        op.apply_to(&mut live);
                        applied += 1;
                    }
                    Err(err) => {
                        tracing::error!(table = %batch.table, operation = %op, error = %err, "operation failed");
                        failure = Some(err.to_string());
                        break;
                    }
                }
            }

            match failure {
                None => {
                    if transactional {
                        self.store.commit_unit().await?;
                    }
                    report.tables.push(TableOutcome {
                        table: batch.table.clone(),
                        status: TableStatus::Applied,
                        operations_applied: applied,
                    });
                }
                Some(reason) => {
                    if transactional {
                        self.store.rollback_unit().await?;
                        // The unit was undone; resync our progress tracking.
                        live = self.store.snapshot().await?;
                    }
                    for dependent in plan.dependents_of(index) {
                        blocked
                            .entry(dependent)
                            .or_insert_with(|| batch.table.clone());
                    }
                    report.tables.push(TableOutcome {
                        table: batch.table.clone(),
                        status: TableStatus::Failed { reason },
                        operations_applied: if transactional { 0 } else { applied },
                    });
                }
            }
        }

        Ok(report)
    }
}
