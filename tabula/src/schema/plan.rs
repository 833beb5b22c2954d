use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::Serialize;
use thiserror::Error;

use crate::schema::diff::Operation;
use crate::schema::model::ConstraintDecl;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("unresolvable dependency cycle between tables: {}", tables.join(", "))]
    CyclicDependency { tables: Vec<String> },
}

/// Operations against one table, applied as one logical unit.
#[derive(Debug, Clone, Serialize)]
pub struct TableBatch {
    pub table: String,
    pub operations: Vec<Operation>,
}

/// An ordered operation plan: per-table batches in dependency order, plus
/// the inter-batch dependency edges the executor uses to skip everything
/// downstream of a failed batch.
#[derive(Debug, Serialize)]
pub struct Plan {
    batches: Vec<TableBatch>,
    #[serde(skip)]
    edges: BTreeMap<usize, BTreeSet<usize>>,
}

impl Plan {
    /// Group and order the given operations into an executable plan,
    /// splitting constraint work out when foreign keys form a cycle.
    pub fn build(operations: Vec<Operation>) -> Result<Plan, PlanError> {
        let mut batches = group_by_table(operations);

        let (mut early, mut deferred) = (Vec::new(), Vec::new());
        let order = match toposort(&batches) {
            Ok(order) => order,
            Err(cycle) => {
                // Mutual foreign keys: pull constraint work out of the
                // cycling batches so tables can be created (or dropped)
                // first and constraints handled in their own pass.
                let split = split_constraints(&mut batches, &cycle, &mut early, &mut deferred);
                if !split {
                    return Err(PlanError::CyclicDependency { tables: cycle });
                }
                toposort(&batches)
                    .map_err(|tables| PlanError::CyclicDependency { tables })?
            }
        };

        let mut ordered = Vec::new();
        ordered.extend(early);
        for table in order {
            if let Some(batch) = batches.remove(&table) {
                if !batch.operations.is_empty() {
                    ordered.push(batch);
                }
            }
        }
        ordered.extend(deferred);

        let edges = index_edges(&ordered);
        Ok(Plan {
            batches: ordered,
            edges,
        })
    }

    pub fn batches(&self) -> &[TableBatch] {
        &self.batches
    }

    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.batches.iter().flat_map(|b| b.operations.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Every batch transitively depending on the given one.
    pub fn dependents_of(&self, index: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([index]);
        while let Some(current) = queue.pop_front() {
            if let Some(next) = self.edges.get(&current) {
                for &to in next {
                    if seen.insert(to) {
                        queue.push_back(to);
                    }
                }
            }
        }
        seen
    }
}

/// Execution rank inside one table's batch: clear the ground first, then
/// build. `CreateTable` leads and `DropTable` trails by construction.
fn rank(op: &Operation) -> u8 {
    match op {
        Operation::CreateTable { .. } => 0,
        Operation::DropConstraint { .. } => 1,
        Operation::DropIndex { .. } => 2,
        Operation::DropColumn { .. } => 3,
        Operation::ModifyColumn { .. } => 4,
        Operation::AddColumn { .. } => 5,
        Operation::AddIndex { .. } => 6,
        Operation::AddConstraint { .. } => 7,
        Operation::DropTable { .. } => 8,
    }
}

fn group_by_table(operations: Vec<Operation>) -> BTreeMap<String, TableBatch> {
    let mut batches: BTreeMap<String, TableBatch> = BTreeMap::new();
    for op in operations {
        let table = op.table().to_string();
        batches
            .entry(table.clone())
            .or_insert_with(|| TableBatch {
                table,
                operations: Vec::new(),
            })
            .operations
            .push(op);
    }
    for batch in batches.values_mut() {
        batch.operations.sort_by_key(rank);
    }
    batches
}

/// Foreign tables this operation introduces a reference to, together with
/// the referenced column. Includes constraints still embedded in a
/// `CreateTable`.
fn added_references(op: &Operation) -> Vec<(String, String)> {
    match op {
        Operation::CreateTable { table } => table
            .foreign_keys()
            .filter_map(|(_, c)| c.reference())
            .map(|(t, c)| (t.to_string(), c.to_string()))
            .collect(),
        Operation::AddConstraint { constraint, .. } => constraint
            .reference()
            .map(|(t, c)| vec![(t.to_string(), c.to_string())])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn dropped_references(op: &Operation) -> Option<(String, String)> {
    match op {
        Operation::DropConstraint { constraint, .. } => constraint
            .reference()
            .map(|(t, c)| (t.to_string(), c.to_string())),
        _ => None,
    }
}

fn creates_table(batch: &TableBatch) -> bool {
    batch
        .operations
        .iter()
        .any(|op| matches!(op, Operation::CreateTable { .. }))
}

fn touches_column(batch: &TableBatch, column: &str) -> bool {
    batch.operations.iter().any(|op| match op {
        Operation::AddColumn { column: c, .. } | Operation::ModifyColumn { column: c, .. } => {
            c.name == column
        }
        _ => false,
    })
}

fn removes_target(batch: &TableBatch, column: &str) -> bool {
    batch.operations.iter().any(|op| match op {
        Operation::DropTable { .. } => true,
        Operation::DropColumn { name, .. } => name == column,
        _ => false,
    })
}

/// Edges between table batches as (before, after) pairs:
/// a referenced table is set up before the batch that adds a reference to
/// it, and a batch that drops a reference runs before the batch that drops
/// the referenced table or column.
fn name_edges(batches: &BTreeMap<String, TableBatch>) -> BTreeSet<(String, String)> {
    let mut edges = BTreeSet::new();
    for (table, batch) in batches {
        for op in &batch.operations {
            for (target, target_column) in added_references(op) {
                if target == *table {
                    continue;
                }
                if let Some(other) = batches.get(&target) {
                    if creates_table(other) || touches_column(other, &target_column) {
                        edges.insert((target.clone(), table.clone()));
                    }
                }
            }
            if let Some((target, target_column)) = dropped_references(op) {
                if target == *table {
                    continue;
                }
                if let Some(other) = batches.get(&target) {
                    if removes_target(other, &target_column) {
                        edges.insert((table.clone(), target.clone()));
                    }
                }
            }
        }
    }
    edges
}

/// Kahn's algorithm over table names; ties break lexicographically so the
/// plan is stable across runs. On a cycle, returns the tables left over.
fn toposort(batches: &BTreeMap<String, TableBatch>) -> Result<Vec<String>, Vec<String>> {
    let edges = name_edges(batches);

    let mut in_degree: BTreeMap<&str, usize> =
        batches.keys().map(|name| (name.as_str(), 0)).collect();
    let mut successors: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (before, after) in &edges {
        *in_degree.entry(after.as_str()).or_default() += 1;
        successors
            .entry(before.as_str())
            .or_default()
            .push(after.as_str());
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|&(_, &degree)| degree == 0)
        .map(|(&name, _)| name)
        .collect();

    let mut order = Vec::with_capacity(batches.len());
    while let Some(&name) = ready.iter().next() {
        ready.remove(name);
        order.push(name.to_string());
        if let Some(next) = successors.get(name) {
            for &after in next {
                let degree = in_degree.get_mut(after).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(after);
                }
            }
        }
    }

    if order.len() != batches.len() {
        let remaining: Vec<String> = batches
            .keys()
            .filter(|name| !order.contains(name))
            .cloned()
            .collect();
        return Err(remaining);
    }
    Ok(order)
}

/// Pull foreign-key work out of the cycling batches: embedded constraints
/// leave their `CreateTable` for a deferred add pass, and foreign-key drops
/// move to an early pass that runs before every table batch. Returns whether
/// anything moved.
fn split_constraints(
    batches: &mut BTreeMap<String, TableBatch>,
    cycle: &[String],
    early: &mut Vec<TableBatch>,
    deferred: &mut Vec<TableBatch>,
) -> bool {
    let mut split = false;

    for table in cycle {
        let Some(batch) = batches.get_mut(table) else {
            continue;
        };

        let mut early_ops = Vec::new();
        batch.operations.retain(|op| {
            let is_fk_drop = matches!(
                op,
                Operation::DropConstraint {
                    constraint: ConstraintDecl::Foreign { .. },
                    ..
                }
            );
            if is_fk_drop {
                early_ops.push(op.clone());
            }
            !is_fk_drop
        });

        let mut deferred_ops = Vec::new();
        for op in &mut batch.operations {
            if let Operation::CreateTable { table: decl } = op {
                let fk_names: Vec<String> = decl
                    .foreign_keys()
                    .map(|(name, _)| name.clone())
                    .collect();
                for name in fk_names {
                    let constraint = decl.constraints.shift_remove(&name).unwrap();
                    deferred_ops.push(Operation::AddConstraint {
                        table: table.clone(),
                        name,
                        constraint,
                    });
                }
            }
        }

        if !early_ops.is_empty() {
            split = true;
            early.push(TableBatch {
                table: table.clone(),
                operations: early_ops,
            });
        }
        if !deferred_ops.is_empty() {
            split = true;
            deferred.push(TableBatch {
                table: table.clone(),
                operations: deferred_ops,
            });
        }
    }

    split
}

/// Dependency edges between final batch indexes, used for failure
/// propagation: a later batch for the same table depends on the earlier one,
/// reference-adding batches depend on the batch creating the target, and
/// removal batches depend on the batches dropping references to them.
fn index_edges(batches: &[TableBatch]) -> BTreeMap<usize, BTreeSet<usize>> {
    let mut edges: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    let mut last_for_table: BTreeMap<&str, usize> = BTreeMap::new();

    for (index, batch) in batches.iter().enumerate() {
        if let Some(&previous) = last_for_table.get(batch.table.as_str()) {
            edges.entry(previous).or_default().insert(index);
        }
        last_for_table.insert(batch.table.as_str(), index);
    }

    for (index, batch) in batches.iter().enumerate() {
        for op in &batch.operations {
            for (target, target_column) in added_references(op) {
                for (other_index, other) in batches.iter().enumerate() {
                    if other_index == index || other.table != target {
                        continue;
                    }
                    if creates_table(other) || touches_column(other, &target_column) {
                        edges.entry(other_index).or_default().insert(index);
                    }
                }
            }
            if let Some((target, target_column)) = dropped_references(op) {
                for (other_index, other) in batches.iter().enumerate() {
                    if other_index == index || other.table != target {
                        continue;
                    }
                    if removes_target(other, &target_column) {
                        edges.entry(index).or_default().insert(other_index);
                    }
                }
            }
        }
    }

    edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::model::{ColumnDecl, ColumnType, ReferenceAction, TableDecl};

    fn fk(column: &str, table: &str, referenced: &str) -> ConstraintDecl {
        ConstraintDecl::Foreign {
            column: column.to_string(),
            referenced_table: table.to_string(),
            referenced_column: referenced.to_string(),
            on_delete: ReferenceAction::NoAction,
        }
    }

    fn table_with_fk(name: &str, constraint_name: &str, target: &str) -> TableDecl {
        let mut t = TableDecl::new(name);
        t.columns
            .insert("id".into(), ColumnDecl::new("id", ColumnType::Int));
        t.columns.insert(
            "target_id".into(),
            ColumnDecl::new("target_id", ColumnType::Int),
        );
        t.constraints
            .insert(constraint_name.into(), fk("target_id", target, "id"));
        t
    }

    fn plain_table(name: &str) -> TableDecl {
        let mut t = TableDecl::new(name);
        t.columns
            .insert("id".into(), ColumnDecl::new("id", ColumnType::Int));
        t
    }

    fn position(plan: &Plan, predicate: impl Fn(&Operation) -> bool) -> usize {
        plan.operations().position(predicate).expect("operation present")
    }

    #[test]
    fn test_referenced_table_created_first() {
        let plan = Plan::build(vec![
            Operation::CreateTable {
                table: table_with_fk("orders", "fk_orders_customer", "customers"),
            },
            Operation::CreateTable {
                table: plain_table("customers"),
            },
        ])
        .unwrap();

        let customers = position(&plan, |op| {
            matches!(op, Operation::CreateTable { table } if table.name == "customers")
        });
        let orders = position(&plan, |op| {
            matches!(op, Operation::CreateTable { table } if table.name == "orders")
        });
        assert!(customers < orders);
    }

    #[test]
    fn test_constraint_dropped_before_referenced_table() {
        let plan = Plan::build(vec![
            Operation::DropTable {
                table: "customers".into(),
            },
            Operation::DropConstraint {
                table: "orders".into(),
                name: "fk_orders_customer".into(),
                constraint: fk("customer_id", "customers", "id"),
            },
        ])
        .unwrap();

        let drop_constraint = position(&plan, |op| {
            matches!(op, Operation::DropConstraint { .. })
        });
        let drop_table = position(&plan, |op| matches!(op, Operation::DropTable { .. }));
        assert!(drop_constraint < drop_table);
    }

    #[test]
    fn test_constraint_dropped_before_referenced_column() {
        let plan = Plan::build(vec![
            Operation::DropColumn {
                table: "customers".into(),
                name: "external_ref".into(),
            },
            Operation::DropConstraint {
                table: "orders".into(),
                name: "fk_orders_external".into(),
                constraint: fk("external_id", "customers", "external_ref"),
            },
        ])
        .unwrap();

        let drop_constraint = position(&plan, |op| {
            matches!(op, Operation::DropConstraint { .. })
        });
        let drop_column = position(&plan, |op| matches!(op, Operation::DropColumn { .. }));
        assert!(drop_constraint < drop_column);
    }

    #[test]
    fn test_constraint_added_after_referenced_column() {
        let plan = Plan::build(vec![
            Operation::AddConstraint {
                table: "orders".into(),
                name: "fk_orders_customer".into(),
                constraint: fk("customer_id", "customers", "external_ref"),
            },
            Operation::AddColumn {
                table: "customers".into(),
                column: ColumnDecl::new("external_ref", ColumnType::Int),
            },
        ])
        .unwrap();

        let add_column = position(&plan, |op| matches!(op, Operation::AddColumn { .. }));
        let add_constraint = position(&plan, |op| {
            matches!(op, Operation::AddConstraint { .. })
        });
        assert!(add_column < add_constraint);
    }

    // Mutual foreign keys: both creates run first, stripped of their
    // embedded constraints, which land in a deferred pass.
    #[test]
    fn test_create_cycle_is_split() {
        let plan = Plan::build(vec![
            Operation::CreateTable {
                table: table_with_fk("chickens", "fk_chicken_egg", "eggs"),
            },
            Operation::CreateTable {
                table: table_with_fk("eggs", "fk_egg_chicken", "chickens"),
            },
        ])
        .unwrap();

        let ops: Vec<&Operation> = plan.operations().collect();
        assert_eq!(ops.len(), 4);

        for op in &ops {
            if let Operation::CreateTable { table } = op {
                assert_eq!(table.foreign_keys().count(), 0);
            }
        }
        let last_create = ops
            .iter()
            .rposition(|op| matches!(op, Operation::CreateTable { .. }))
            .unwrap();
        let first_constraint = ops
            .iter()
            .position(|op| matches!(op, Operation::AddConstraint { .. }))
            .unwrap();
        assert!(last_create < first_constraint);
    }

    // Dropping two mutually referencing tables: the foreign-key drops move
    // to an early pass so both table drops can proceed.
    #[test]
    fn test_drop_cycle_is_split() {
        let plan = Plan::build(vec![
            Operation::DropConstraint {
                table: "chickens".into(),
                name: "fk_chicken_egg".into(),
                constraint: fk("egg_id", "eggs", "id"),
            },
            Operation::DropTable {
                table: "chickens".into(),
            },
            Operation::DropConstraint {
                table: "eggs".into(),
                name: "fk_egg_chicken".into(),
                constraint: fk("chicken_id", "chickens", "id"),
            },
            Operation::DropTable {
                table: "eggs".into(),
            },
        ])
        .unwrap();

        let ops: Vec<&Operation> = plan.operations().collect();
        let last_fk_drop = ops
            .iter()
            .rposition(|op| matches!(op, Operation::DropConstraint { .. }))
            .unwrap();
        let first_table_drop = ops
            .iter()
            .position(|op| matches!(op, Operation::DropTable { .. }))
            .unwrap();
        assert!(last_fk_drop < first_table_drop);
    }

    #[test]
    fn test_batch_groups_one_table() {
        let plan = Plan::build(vec![
            Operation::AddColumn {
                table: "orders".into(),
                column: ColumnDecl::new("note", ColumnType::Text),
            },
            Operation::DropColumn {
                table: "orders".into(),
                name: "legacy".into(),
            },
            Operation::AddColumn {
                table: "customers".into(),
                column: ColumnDecl::new("email", ColumnType::Varchar { length: 255 }),
            },
        ])
        .unwrap();

        assert_eq!(plan.batches().len(), 2);
        let orders = plan
            .batches()
            .iter()
            .find(|b| b.table == "orders")
            .unwrap();
        // Drops run before adds inside a batch.
        assert!(matches!(orders.operations[0], Operation::DropColumn { .. }));
        assert!(matches!(orders.operations[1], Operation::AddColumn { .. }));
    }

    #[test]
    fn test_dependents_are_transitive() {
        let plan = Plan::build(vec![
            Operation::CreateTable {
                table: plain_table("customers"),
            },
            Operation::CreateTable {
                table: table_with_fk("orders", "fk_orders_customer", "customers"),
            },
            Operation::CreateTable {
                table: table_with_fk("shipments", "fk_shipment_order", "orders"),
            },
        ])
        .unwrap();

        let customers_index = plan
            .batches()
            .iter()
            .position(|b| b.table == "customers")
            .unwrap();
        let dependents = plan.dependents_of(customers_index);
        let tables: BTreeSet<&str> = dependents
            .iter()
            .map(|&i| plan.batches()[i].table.as_str())
            .collect();
        assert!(tables.contains("orders"));
        assert!(tables.contains("shipments"));
    }

    #[test]
    fn test_stable_order_without_dependencies() {
        let plan = Plan::build(vec![
            Operation::CreateTable {
                table: plain_table("zebras"),
            },
            Operation::CreateTable {
                table: plain_table("apples"),
            },
        ])
        .unwrap();
        let tables: Vec<&str> = plan.batches().iter().map(|b| b.table.as_str()).collect();
        assert_eq!(tables, vec!["apples", "zebras"]);
    }
}
