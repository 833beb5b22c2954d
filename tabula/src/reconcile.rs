use std::collections::BTreeSet;

use crate::errors::ReconcileError;
use crate::schema::diff::diff;
use crate::schema::exec::{ApplyReport, Executor, SchemaStore, TableStatus};
use crate::schema::ledger::Ledger;
use crate::schema::merge::merge;
use crate::schema::model::{ElementId, LogicalSchema, ModuleContribution};
use crate::schema::plan::Plan;

/// Outcome of a dry run: the merged target, the ordered plan and the live
/// elements that were left untouched for lack of a whitelist reference.
pub struct PlanOutcome {
    pub logical: LogicalSchema,
    pub plan: Plan,
    pub untracked: Vec<ElementId>,
}

pub enum ApplyOutcome {
    /// The stored fingerprint matched the merged schema; nothing to do.
    UpToDate,
    Applied {
        report: ApplyReport,
        untracked: Vec<ElementId>,
    },
}

/// Wires one reconciliation run together: contributions and whitelist in,
/// operation plan out. For `apply`, execution happens under the catalog
/// lock and the ledger is refreshed afterwards.
pub struct Reconciler<S: SchemaStore> {
    store: S,
    contributions: Vec<ModuleContribution>,
    ledger: Ledger,
}

impl<S: SchemaStore> Reconciler<S> {
    pub fn new(store: S, contributions: Vec<ModuleContribution>, ledger: Ledger) -> Self {
        Self {
            store,
            contributions,
            ledger,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn into_parts(self) -> (S, Ledger) {
        (self.store, self.ledger)
    }

    /// Dry run: pure computation plus read-only introspection, no lock.
    pub async fn plan(&mut self) -> Result<PlanOutcome, ReconcileError> {
        let logical = merge(&self.contributions)?;
        let live = self.store.snapshot().await?;
        let report = diff(&logical, &live, &self.ledger)?;
        let plan = Plan::build(report.operations)?;
        Ok(PlanOutcome {
            logical,
            plan,
            untracked: report.untracked,
        })
    }

    /// Full run under the advisory lock. All fatal checks (merge conflicts,
    /// referential integrity, cycles) happen before the first DDL statement;
    /// after that, failures degrade to a partial result that is safe to
    /// retry.
    pub async fn apply(&mut self) -> Result<ApplyOutcome, ReconcileError> {
        self.store.acquire_lock().await?;
        let outcome = self.apply_locked().await;
        if let Err(err) = self.store.release_lock().await {
            tracing::warn!(error = %err, "failed to release catalog lock");
        }
        outcome
    }

    async fn apply_locked(&mut self) -> Result<ApplyOutcome, ReconcileError> {
        let logical = merge(&self.contributions)?;
        let fingerprint = logical.fingerprint();

        if self.store.read_fingerprint().await?.as_deref() == Some(fingerprint.as_str()) {
            tracing::info!("stored fingerprint matches, nothing to apply");
            // Ownership can move without a structural delta; the ledger is
            // refreshed even on a short-circuited run.
            self.refresh_ledger(&logical, None);
            return Ok(ApplyOutcome::UpToDate);
        }

        let live = self.store.snapshot().await?;
        let report = diff(&logical, &live, &self.ledger)?;
        let plan = Plan::build(report.operations)?;

        let apply_report = Executor::new(&mut self.store).apply(&plan).await?;
        self.refresh_ledger(&logical, Some(&apply_report));

        if apply_report.fully_applied() {
            self.store.write_fingerprint(&fingerprint).await?;
        }

        Ok(ApplyOutcome::Applied {
            report: apply_report,
            untracked: report.untracked,
        })
    }

    /// Re-record every contributing module's whitelist entry from the merged
    /// schema's ownership map. Tables whose batches failed or were skipped
    /// keep their previous records, so a retry still sees the old installed
    /// set. Modules absent from the contributions keep their entries; only
    /// an explicit forget removes them.
    fn refresh_ledger(&mut self, logical: &LogicalSchema, report: Option<&ApplyReport>) {
        let unapplied: BTreeSet<&str> = report
            .map(|r| {
                r.tables
                    .iter()
                    .filter(|t| {
                        matches!(
                            t.status,
                            TableStatus::Failed { .. } | TableStatus::Skipped { .. }
                        )
                    })
                    .map(|t| t.table.as_str())
                    .collect()
            })
            .unwrap_or_default();

        for contribution in &self.contributions {
            let module = contribution.module_id.as_str();
            let mut installed: BTreeSet<ElementId> = logical
                .ownership
                .iter()
                .filter(|(id, owners)| {
                    owners.contains(module) && !unapplied.contains(id.table.as_str())
                })
                .map(|(id, _)| id.clone())
                .collect();

            if let Some(previous) = self.ledger.get(module) {
                installed.extend(
                    previous
                        .installed
                        .iter()
                        .filter(|id| unapplied.contains(id.table.as_str()))
                        .cloned(),
                );
            }

            self.ledger
                .record(module, &contribution.schema_version, installed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::model::{ColumnDecl, ColumnType, TableDecl};
    use crate::testing::MemoryStore;

    fn contribution(module: &str, tables: Vec<TableDecl>) -> ModuleContribution {
        ModuleContribution {
            module_id: module.to_string(),
            schema_version: "1.0.0".to_string(),
            tables,
        }
    }

    fn orders() -> TableDecl {
        let mut t = TableDecl::new("orders");
        t.columns
            .insert("id".into(), ColumnDecl::new("id", ColumnType::Int));
        let mut status = ColumnDecl::new("status", ColumnType::Varchar { length: 32 });
        status.nullable = true;
        t.columns.insert("status".into(), status);
        t
    }

    #[tokio::test]
    async fn test_apply_records_ownership() {
        let store = MemoryStore::default();
        let mut reconciler = Reconciler::new(
            store,
            vec![contribution("Acme_Sales", vec![orders()])],
            Ledger::new(),
        );

        let outcome = reconciler.apply().await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied { ref report, .. } if report.fully_applied()));
        assert!(
            reconciler
                .ledger()
                .is_tracked(&ElementId::column("orders", "status"))
        );
    }

    #[tokio::test]
    async fn test_second_apply_short_circuits() {
        let store = MemoryStore::default();
        let mut reconciler = Reconciler::new(
            store,
            vec![contribution("Acme_Sales", vec![orders()])],
            Ledger::new(),
        );

        reconciler.apply().await.unwrap();
        let second = reconciler.apply().await.unwrap();
        assert!(matches!(second, ApplyOutcome::UpToDate));
    }

    #[tokio::test]
    async fn test_failed_table_keeps_previous_whitelist() {
        let mut store = MemoryStore::default();
        store.fail_on(ElementId::table("orders"));

        // Ledger carries the previous version's record including a column
        // that v2 no longer declares.
        let mut previous = BTreeSet::new();
        previous.insert(ElementId::table("orders"));
        previous.insert(ElementId::column("orders", "retired"));
        let mut ledger = Ledger::new();
        ledger.record("Acme_Sales", "0.9.0", previous);

        let mut reconciler = Reconciler::new(
            store,
            vec![contribution("Acme_Sales", vec![orders()])],
            ledger,
        );

        let outcome = reconciler.apply().await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied { ref report, .. } if !report.fully_applied()));
        // The failed table's old record survives so a retry can still drop
        // the retired column.
        assert!(
            reconciler
                .ledger()
                .is_tracked(&ElementId::column("orders", "retired"))
        );
    }

    #[tokio::test]
    async fn test_plan_does_not_touch_ledger_or_fingerprint() {
        let store = MemoryStore::default();
        let mut reconciler = Reconciler::new(
            store,
            vec![contribution("Acme_Sales", vec![orders()])],
            Ledger::new(),
        );

        let outcome = reconciler.plan().await.unwrap();
        assert!(!outcome.plan.is_empty());
        assert!(reconciler.ledger().is_empty());

        // Planning twice yields the same plan; nothing was applied.
        let again = reconciler.plan().await.unwrap();
        assert_eq!(
            outcome.plan.operations().count(),
            again.plan.operations().count()
        );
    }
}
