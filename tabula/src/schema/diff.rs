use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::ledger::Ledger;
use crate::schema::model::{
    ColumnDecl, ConstraintDecl, ElementId, IndexDecl, LiveSchema, LogicalSchema, TableDecl,
};

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("{constraint} references {referenced_table}.{referenced_column}, which the resulting schema does not contain")]
    ReferentialIntegrity {
        constraint: ElementId,
        referenced_table: String,
        referenced_column: String,
    },
}

/// One structural change. Drop operations carry the live definition they
/// remove so the orderer can see which table a dropped foreign key pointed
/// at without consulting the live schema again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    CreateTable {
        table: TableDecl,
    },
    DropTable {
        table: String,
    },
    AddColumn {
        table: String,
        column: ColumnDecl,
    },
    ModifyColumn {
        table: String,
        column: ColumnDecl,
    },
    DropColumn {
        table: String,
        name: String,
    },
    AddIndex {
        table: String,
        index: IndexDecl,
    },
    DropIndex {
        table: String,
        name: String,
    },
    AddConstraint {
        table: String,
        name: String,
        constraint: ConstraintDecl,
    },
    DropConstraint {
        table: String,
        name: String,
        constraint: ConstraintDecl,
    },
}

impl Operation {
    pub fn table(&self) -> &str {
        match self {
            Operation::CreateTable { table } => &table.name,
            Operation::DropTable { table } => table,
            Operation::AddColumn { table, .. }
            | Operation::ModifyColumn { table, .. }
            | Operation::DropColumn { table, .. }
            | Operation::AddIndex { table, .. }
            | Operation::DropIndex { table, .. }
            | Operation::AddConstraint { table, .. }
            | Operation::DropConstraint { table, .. } => table,
        }
    }

    pub fn element_id(&self) -> ElementId {
        match self {
            Operation::CreateTable { table } => ElementId::table(&table.name),
            Operation::DropTable { table } => ElementId::table(table),
            Operation::AddColumn { table, column } | Operation::ModifyColumn { table, column } => {
                ElementId::column(table, &column.name)
            }
            Operation::DropColumn { table, name } => ElementId::column(table, name),
            Operation::AddIndex { table, index } => ElementId::index(table, &index.name),
            Operation::DropIndex { table, name } => ElementId::index(table, name),
            Operation::AddConstraint { table, name, .. }
            | Operation::DropConstraint { table, name, .. } => ElementId::constraint(table, name),
        }
    }

    /// Idempotent checkpoint: whether the live schema already reflects this
    /// operation. The executor re-checks this before every step so a
    /// crashed-and-resumed run never double-applies.
    pub fn is_applied(&self, live: &LiveSchema) -> bool {
        match self {
            Operation::CreateTable { table } => live.tables.contains_key(&table.name),
            Operation::DropTable { table } => !live.tables.contains_key(table),
            Operation::AddColumn { table, column } => live.column(table, &column.name).is_some(),
            Operation::ModifyColumn { table, column } => {
                live.column(table, &column.name) == Some(column)
            }
            Operation::DropColumn { table, name } => live.column(table, name).is_none(),
            Operation::AddIndex { table, index } => live.index(table, &index.name).is_some(),
            Operation::DropIndex { table, name } => live.index(table, name).is_none(),
            Operation::AddConstraint { table, name, .. } => {
                live.constraint(table, name).is_some()
            }
            Operation::DropConstraint { table, name, .. } => {
                live.constraint(table, name).is_none()
            }
        }
    }

    /// Replay the operation onto an in-memory live snapshot. The executor
    /// uses this to track progress; the in-memory store uses it as its whole
    /// implementation.
    pub fn apply_to(&self, live: &mut LiveSchema) {
        match self {
            Operation::CreateTable { table } => {
                live.tables.insert(table.name.clone(), table.clone());
            }
            Operation::DropTable { table } => {
                live.tables.remove(table);
            }
            Operation::AddColumn { table, column } | Operation::ModifyColumn { table, column } => {
                if let Some(t) = live.tables.get_mut(table) {
                    t.columns.insert(column.name.clone(), column.clone());
                }
            }
            Operation::DropColumn { table, name } => {
                if let Some(t) = live.tables.get_mut(table) {
                    t.columns.shift_remove(name);
                }
            }
            Operation::AddIndex { table, index } => {
                if let Some(t) = live.tables.get_mut(table) {
                    t.indexes.insert(index.name.clone(), index.clone());
                }
            }
            Operation::DropIndex { table, name } => {
                if let Some(t) = live.tables.get_mut(table) {
                    t.indexes.shift_remove(name);
                }
            }
            Operation::AddConstraint {
                table,
                name,
                constraint,
            } => {
                if let Some(t) = live.tables.get_mut(table) {
                    t.constraints.insert(name.clone(), constraint.clone());
                }
            }
            Operation::DropConstraint { table, name, .. } => {
                if let Some(t) = live.tables.get_mut(table) {
                    t.constraints.shift_remove(name);
                }
            }
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateTable { table } => {
                write!(f, "create table {} ({} columns)", table.name, table.columns.len())
            }
            Operation::DropTable { table } => write!(f, "drop table {table}"),
            Operation::AddColumn { table, column } => {
                write!(f, "add column {}.{} {}", table, column.name, column.ty)
            }
            Operation::ModifyColumn { table, column } => {
                write!(f, "modify column {}.{} {}", table, column.name, column.ty)
            }
            Operation::DropColumn { table, name } => write!(f, "drop column {table}.{name}"),
            Operation::AddIndex { table, index } => write!(
                f,
                "add index {}.{} ({})",
                table,
                index.name,
                index.columns.join(", ")
            ),
            Operation::DropIndex { table, name } => write!(f, "drop index {table}.{name}"),
            Operation::AddConstraint {
                table,
                name,
                constraint,
            } => write!(
                f,
                "add {} constraint {}.{}",
                constraint.kind_name(),
                table,
                name
            ),
            Operation::DropConstraint {
                table,
                name,
                constraint,
            } => write!(
                f,
                "drop {} constraint {}.{}",
                constraint.kind_name(),
                table,
                name
            ),
        }
    }
}

/// The unordered outcome of a diff run. `untracked` lists live elements that
/// would be drop candidates but lack any whitelist reference; they are left
/// untouched and surfaced as warnings, never as operations.
#[derive(Debug, Default)]
pub struct DiffReport {
    pub operations: Vec<Operation>,
    pub untracked: Vec<ElementId>,
}

impl DiffReport {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Compare the merged target against the live structure, filtered through
/// the ownership ledger.
///
/// Both inputs are assumed normalized: the introspector is responsible for
/// collapsing store-specific spellings before the live schema gets here, so
/// every comparison below is exact equality.
pub fn diff(
    logical: &LogicalSchema,
    live: &LiveSchema,
    ledger: &Ledger,
) -> Result<DiffReport, DiffError> {
    check_references(logical)?;

    let mut report = DiffReport::default();

    for (name, target) in &logical.tables {
        match live.tables.get(name) {
            None => report.operations.push(Operation::CreateTable {
                table: target.clone(),
            }),
            Some(current) => diff_table(target, current, ledger, &mut report),
        }
    }

    for (name, current) in &live.tables {
        if logical.tables.contains_key(name) {
            continue;
        }
        let id = ElementId::table(name);
        if ledger.is_tracked(&id) {
            // Decompose: the table's own foreign keys are dropped explicitly
            // so the orderer can sequence the drop against other tables.
            for (constraint_name, constraint) in current.foreign_keys() {
                report.operations.push(Operation::DropConstraint {
                    table: name.clone(),
                    name: constraint_name.clone(),
                    constraint: constraint.clone(),
                });
            }
            report
                .operations
                .push(Operation::DropTable { table: name.clone() });
        } else {
            tracing::warn!(table = %name, "live table is not declared and not whitelisted, leaving untouched");
            report.untracked.push(id);
        }
    }

    Ok(report)
}

/// Every foreign constraint must resolve inside the resulting schema itself;
/// this runs before any operation is computed so no referentially broken
/// plan ever reaches the store.
fn check_references(logical: &LogicalSchema) -> Result<(), DiffError> {
    for table in logical.tables.values() {
        for (name, constraint) in table.foreign_keys() {
            let ConstraintDecl::Foreign {
                column,
                referenced_table,
                referenced_column,
                ..
            } = constraint
            else {
                continue;
            };
            let id = ElementId::constraint(&table.name, name);
            let target_ok = logical
                .tables
                .get(referenced_table)
                .is_some_and(|t| t.columns.contains_key(referenced_column));
            if !target_ok || !table.columns.contains_key(column) {
                return Err(DiffError::ReferentialIntegrity {
                    constraint: id,
                    referenced_table: referenced_table.clone(),
                    referenced_column: referenced_column.clone(),
                });
            }
        }
    }
    Ok(())
}

fn diff_table(target: &TableDecl, current: &TableDecl, ledger: &Ledger, report: &mut DiffReport) {
    let table = &target.name;

    for (name, column) in &target.columns {
        match current.columns.get(name) {
            None => report.operations.push(Operation::AddColumn {
                table: table.clone(),
                column: column.clone(),
            }),
            Some(live_column) if live_column != column => {
                report.operations.push(Operation::ModifyColumn {
                    table: table.clone(),
                    column: column.clone(),
                })
            }
            Some(_) => {}
        }
    }
    for name in current.columns.keys() {
        if target.columns.contains_key(name) {
            continue;
        }
        let id = ElementId::column(table, name);
        if ledger.is_tracked(&id) {
            report.operations.push(Operation::DropColumn {
                table: table.clone(),
                name: name.clone(),
            });
        } else {
            tracing::warn!(element = %id, "live column is not declared and not whitelisted, leaving untouched");
            report.untracked.push(id);
        }
    }

    for (name, index) in &target.indexes {
        match current.indexes.get(name) {
            None => report.operations.push(Operation::AddIndex {
                table: table.clone(),
                index: index.clone(),
            }),
            Some(live_index) if live_index != index => {
                // No alter-index: a changed definition is a drop plus a
                // create, and the drop half is still whitelist-gated.
                let id = ElementId::index(table, name);
                if ledger.is_tracked(&id) {
                    report.operations.push(Operation::DropIndex {
                        table: table.clone(),
                        name: name.clone(),
                    });
                    report.operations.push(Operation::AddIndex {
                        table: table.clone(),
                        index: index.clone(),
                    });
                } else {
                    tracing::warn!(element = %id, "index definition drifted but is not whitelisted, leaving untouched");
                    report.untracked.push(id);
                }
            }
            Some(_) => {}
        }
    }
    for name in current.indexes.keys() {
        if target.indexes.contains_key(name) {
            continue;
        }
        let id = ElementId::index(table, name);
        if ledger.is_tracked(&id) {
            report.operations.push(Operation::DropIndex {
                table: table.clone(),
                name: name.clone(),
            });
        } else {
            tracing::warn!(element = %id, "live index is not declared and not whitelisted, leaving untouched");
            report.untracked.push(id);
        }
    }

    for (name, constraint) in &target.constraints {
        match current.constraints.get(name) {
            None => report.operations.push(Operation::AddConstraint {
                table: table.clone(),
                name: name.clone(),
                constraint: constraint.clone(),
            }),
            Some(live_constraint) if live_constraint != constraint => {
                let id = ElementId::constraint(table, name);
                if ledger.is_tracked(&id) {
                    report.operations.push(Operation::DropConstraint {
                        table: table.clone(),
                        name: name.clone(),
                        constraint: live_constraint.clone(),
                    });
                    report.operations.push(Operation::AddConstraint {
                        table: table.clone(),
                        name: name.clone(),
                        constraint: constraint.clone(),
                    });
                } else {
                    tracing::warn!(element = %id, "constraint definition drifted but is not whitelisted, leaving untouched");
                    report.untracked.push(id);
                }
            }
            Some(_) => {}
        }
    }
    for (name, constraint) in &current.constraints {
        if target.constraints.contains_key(name) {
            continue;
        }
        let id = ElementId::constraint(table, name);
        if ledger.is_tracked(&id) {
            report.operations.push(Operation::DropConstraint {
                table: table.clone(),
                name: name.clone(),
                constraint: constraint.clone(),
            });
        } else {
            tracing::warn!(element = %id, "live constraint is not declared and not whitelisted, leaving untouched");
            report.untracked.push(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::merge::merge;
    use crate::schema::model::{ColumnType, IndexKind, ModuleContribution, ReferenceAction};
    use std::collections::BTreeSet;

    fn contribution(module: &str, tables: Vec<TableDecl>) -> ModuleContribution {
        ModuleContribution {
            module_id: module.to_string(),
            schema_version: "1.0.0".to_string(),
            tables,
        }
    }

    fn orders_table() -> TableDecl {
        let mut t = TableDecl::new("orders");
        let mut id = ColumnDecl::new("id", ColumnType::Int);
        id.auto_increment = true;
        t.columns.insert("id".into(), id);
        let mut status = ColumnDecl::new("status", ColumnType::Varchar { length: 32 });
        status.nullable = true;
        t.columns.insert("status".into(), status);
        t.constraints.insert(
            "pk_orders".into(),
            ConstraintDecl::Primary {
                columns: vec!["id".into()],
            },
        );
        t
    }

    fn logical_with(tables: Vec<TableDecl>) -> LogicalSchema {
        merge(&[contribution("Acme_Sales", tables)]).unwrap()
    }

    fn tracking(elements: Vec<ElementId>) -> Ledger {
        let mut ledger = Ledger::new();
        ledger.record("Acme_Sales", "1.0.0", BTreeSet::from_iter(elements));
        ledger
    }

    #[test]
    fn test_empty_live_creates_table() {
        let logical = logical_with(vec![orders_table()]);
        let live = LiveSchema::default();
        let report = diff(&logical, &live, &Ledger::new()).unwrap();

        assert_eq!(report.operations.len(), 1);
        assert!(matches!(
            &report.operations[0],
            Operation::CreateTable { table } if table.name == "orders"
        ));
    }

    #[test]
    fn test_identical_schemas_yield_empty_report() {
        let logical = logical_with(vec![orders_table()]);
        let live = LiveSchema {
            tables: logical.tables.clone(),
        };
        let report = diff(&logical, &live, &Ledger::new()).unwrap();
        assert!(report.is_empty());
        assert!(report.untracked.is_empty());
    }

    #[test]
    fn test_missing_column_is_added() {
        let logical = logical_with(vec![orders_table()]);
        let mut live_table = orders_table();
        live_table.columns.shift_remove("status");
        let live = LiveSchema {
            tables: [("orders".to_string(), live_table)].into(),
        };

        let report = diff(&logical, &live, &Ledger::new()).unwrap();
        assert_eq!(report.operations.len(), 1);
        assert!(matches!(
            &report.operations[0],
            Operation::AddColumn { table, column } if table == "orders" && column.name == "status"
        ));
    }

    #[test]
    fn test_changed_column_is_modified() {
        let logical = logical_with(vec![orders_table()]);
        let mut live_table = orders_table();
        live_table.columns.get_mut("status").unwrap().ty = ColumnType::Varchar { length: 16 };
        let live = LiveSchema {
            tables: [("orders".to_string(), live_table)].into(),
        };

        let report = diff(&logical, &live, &Ledger::new()).unwrap();
        assert_eq!(report.operations.len(), 1);
        match &report.operations[0] {
            Operation::ModifyColumn { column, .. } => {
                assert_eq!(column.ty, ColumnType::Varchar { length: 32 });
            }
            other => panic!("expected modify, got {other:?}"),
        }
    }

    #[test]
    fn test_retired_column_dropped_only_when_tracked() {
        // Module's v2 declarations no longer carry the status column.
        let mut target = orders_table();
        target.columns.shift_remove("status");
        let logical = logical_with(vec![target]);
        let live = LiveSchema {
            tables: [("orders".to_string(), orders_table())].into(),
        };

        // Untracked: column must be left alone and surfaced.
        let report = diff(&logical, &live, &Ledger::new()).unwrap();
        assert!(report.operations.is_empty());
        assert_eq!(report.untracked, vec![ElementId::column("orders", "status")]);

        // Tracked: column becomes a drop.
        let ledger = tracking(vec![ElementId::column("orders", "status")]);
        let report = diff(&logical, &live, &ledger).unwrap();
        assert_eq!(report.operations.len(), 1);
        assert!(matches!(
            &report.operations[0],
            Operation::DropColumn { name, .. } if name == "status"
        ));
    }

    // A manually created live column never declared by any module must never
    // be dropped, whatever the logical schema looks like.
    #[test]
    fn test_untracked_live_column_is_immutable() {
        let logical = logical_with(vec![orders_table()]);
        let mut live_table = orders_table();
        live_table.columns.insert(
            "legacy_flag".into(),
            ColumnDecl::new("legacy_flag", ColumnType::Boolean),
        );
        let live = LiveSchema {
            tables: [("orders".to_string(), live_table)].into(),
        };

        let ledger = tracking(vec![
            ElementId::table("orders"),
            ElementId::column("orders", "id"),
            ElementId::column("orders", "status"),
        ]);
        let report = diff(&logical, &live, &ledger).unwrap();
        assert!(
            !report
                .operations
                .iter()
                .any(|op| op.element_id() == ElementId::column("orders", "legacy_flag"))
        );
        assert!(report.untracked.contains(&ElementId::column("orders", "legacy_flag")));
    }

    #[test]
    fn test_live_only_table_requires_whitelist_for_drop() {
        let logical = LogicalSchema::default();
        let live = LiveSchema {
            tables: [("orders".to_string(), orders_table())].into(),
        };

        let report = diff(&logical, &live, &Ledger::new()).unwrap();
        assert!(report.operations.is_empty());
        assert_eq!(report.untracked, vec![ElementId::table("orders")]);

        let ledger = tracking(vec![ElementId::table("orders")]);
        let report = diff(&logical, &live, &ledger).unwrap();
        assert_eq!(report.operations.len(), 1);
        assert!(matches!(
            &report.operations[0],
            Operation::DropTable { table } if table == "orders"
        ));
    }

    #[test]
    fn test_drifted_index_is_dropped_and_recreated() {
        let mut target = orders_table();
        target.indexes.insert(
            "idx_status".into(),
            IndexDecl {
                name: "idx_status".into(),
                kind: IndexKind::BTree,
                columns: vec!["status".into(), "id".into()],
            },
        );
        let logical = logical_with(vec![target]);

        let mut live_table = orders_table();
        live_table.indexes.insert(
            "idx_status".into(),
            IndexDecl {
                name: "idx_status".into(),
                kind: IndexKind::BTree,
                columns: vec!["status".into()],
            },
        );
        let live = LiveSchema {
            tables: [("orders".to_string(), live_table)].into(),
        };

        let ledger = tracking(vec![ElementId::index("orders", "idx_status")]);
        let report = diff(&logical, &live, &ledger).unwrap();
        assert_eq!(report.operations.len(), 2);
        assert!(matches!(&report.operations[0], Operation::DropIndex { .. }));
        assert!(matches!(&report.operations[1], Operation::AddIndex { .. }));
    }

    #[test]
    fn test_foreign_key_must_resolve_in_logical_schema() {
        let mut orders = orders_table();
        orders.columns.insert(
            "customer_id".into(),
            ColumnDecl::new("customer_id", ColumnType::Int),
        );
        orders.constraints.insert(
            "fk_orders_customer".into(),
            ConstraintDecl::Foreign {
                column: "customer_id".into(),
                referenced_table: "customers".into(),
                referenced_column: "id".into(),
                on_delete: ReferenceAction::Cascade,
            },
        );
        let logical = logical_with(vec![orders]);

        let err = diff(&logical, &LiveSchema::default(), &Ledger::new()).unwrap_err();
        match err {
            DiffError::ReferentialIntegrity {
                constraint,
                referenced_table,
                ..
            } => {
                assert_eq!(constraint, ElementId::constraint("orders", "fk_orders_customer"));
                assert_eq!(referenced_table, "customers");
            }
        }
    }

    // The referenced table only has to exist in the resulting schema, not in
    // the live one: creating both tables in the same run is legal.
    #[test]
    fn test_foreign_key_target_created_in_same_run() {
        let mut customers = TableDecl::new("customers");
        customers
            .columns
            .insert("id".into(), ColumnDecl::new("id", ColumnType::Int));

        let mut orders = orders_table();
        orders.columns.insert(
            "customer_id".into(),
            ColumnDecl::new("customer_id", ColumnType::Int),
        );
        orders.constraints.insert(
            "fk_orders_customer".into(),
            ConstraintDecl::Foreign {
                column: "customer_id".into(),
                referenced_table: "customers".into(),
                referenced_column: "id".into(),
                on_delete: ReferenceAction::NoAction,
            },
        );

        let logical = logical_with(vec![customers, orders]);
        let report = diff(&logical, &LiveSchema::default(), &Ledger::new()).unwrap();
        assert_eq!(report.operations.len(), 2);
    }

    #[test]
    fn test_is_applied_round_trip() {
        let logical = logical_with(vec![orders_table()]);
        let mut live = LiveSchema::default();
        let report = diff(&logical, &live, &Ledger::new()).unwrap();

        for op in &report.operations {
            assert!(!op.is_applied(&live));
            op.apply_to(&mut live);
            assert!(op.is_applied(&live));
        }

        // After replaying every operation the diff is empty.
        let after = diff(&logical, &live, &Ledger::new()).unwrap();
        assert!(after.is_empty());
    }
}
