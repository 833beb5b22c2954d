use std::collections::BTreeMap;

use thiserror::Error;

use crate::schema::model::{ElementId, LogicalSchema, ModuleContribution, TableDecl};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("{element} is declared by {first_module} and redeclared differently by {conflicting_module}")]
    Conflict {
        element: ElementId,
        first_module: String,
        conflicting_module: String,
    },
}

/// Fold an ordered list of module contributions into one logical schema.
///
/// The first declaration of an element installs it and records ownership.
/// A structurally identical re-declaration adds the declaring module to the
/// ownership set. Any mismatch is a fatal conflict: the check is symmetric
/// equality, so contribution order decides who is reported "first" but never
/// whether a conflict exists.
pub fn merge(contributions: &[ModuleContribution]) -> Result<LogicalSchema, MergeError> {
    let mut merger = Merger::default();
    for contribution in contributions {
        for declared in &contribution.tables {
            merger.merge_table(&contribution.module_id, declared)?;
        }
    }
    Ok(merger.schema)
}

#[derive(Default)]
struct Merger {
    schema: LogicalSchema,
    // Module that installed each element, kept apart from the ownership sets
    // so conflict reports name the actual first declarer.
    first_declarer: BTreeMap<ElementId, String>,
}

impl Merger {
    fn merge_table(&mut self, module: &str, declared: &TableDecl) -> Result<(), MergeError> {
        let table_id = ElementId::table(&declared.name);

        if !self.schema.tables.contains_key(&declared.name) {
            self.schema
                .tables
                .insert(declared.name.clone(), declared.clone());
            for id in declared.element_ids() {
                self.claim(id, module);
            }
            return Ok(());
        }

        // Table-level attributes follow the identical-or-conflict rule, where
        // "identical" applies to declared values: an attribute a partial
        // contribution leaves unset adopts whatever is already merged.
        let existing = self.schema.tables.get_mut(&declared.name).unwrap();
        let attrs_ok = merge_attr(&mut existing.engine, &declared.engine)
            && merge_attr(&mut existing.comment, &declared.comment);
        if !attrs_ok {
            return Err(self.conflict(table_id, module));
        }
        self.claim(table_id, module);

        for (name, column) in &declared.columns {
            let id = ElementId::column(&declared.name, name);
            let existing = self.schema.tables.get_mut(&declared.name).unwrap();
            match existing.columns.get(name) {
                None => {
                    existing.columns.insert(name.clone(), column.clone());
                }
                Some(current) if current == column => {}
                Some(_) => return Err(self.conflict(id, module)),
            }
            self.claim(id, module);
        }

        for (name, index) in &declared.indexes {
            let id = ElementId::index(&declared.name, name);
            let existing = self.schema.tables.get_mut(&declared.name).unwrap();
            match existing.indexes.get(name) {
                None => {
                    existing.indexes.insert(name.clone(), index.clone());
                }
                Some(current) if current == index => {}
                Some(_) => return Err(self.conflict(id, module)),
            }
            self.claim(id, module);
        }

        for (name, constraint) in &declared.constraints {
            let id = ElementId::constraint(&declared.name, name);
            let existing = self.schema.tables.get_mut(&declared.name).unwrap();
            match existing.constraints.get(name) {
                None => {
                    existing.constraints.insert(name.clone(), constraint.clone());
                }
                Some(current) if current == constraint => {}
                Some(_) => return Err(self.conflict(id, module)),
            }
            self.claim(id, module);
        }

        Ok(())
    }

    fn claim(&mut self, id: ElementId, module: &str) {
        self.first_declarer
            .entry(id.clone())
            .or_insert_with(|| module.to_string());
        self.schema
            .ownership
            .entry(id)
            .or_default()
            .insert(module.to_string());
    }

    fn conflict(&self, element: ElementId, module: &str) -> MergeError {
        let first_module = self
            .first_declarer
            .get(&element)
            .cloned()
            .unwrap_or_default();
        MergeError::Conflict {
            element,
            first_module,
            conflicting_module: module.to_string(),
        }
    }
}

/// Returns false when both sides declare a value and the values differ.
fn merge_attr(existing: &mut Option<String>, declared: &Option<String>) -> bool {
    match (existing.as_ref(), declared) {
        (_, None) => true,
        (None, Some(value)) => {
            *existing = Some(value.clone());
            true
        }
        (Some(current), Some(value)) => current == value,
    }
}
