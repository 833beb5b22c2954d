use std::collections::BTreeSet;

use crate::schema::diff::Operation;
use crate::schema::exec::{SchemaStore, StoreError};
use crate::schema::model::{ElementId, LiveSchema};

/// In-process schema store: operations mutate an in-memory snapshot instead
/// of a database. Failures can be injected per element to exercise the
/// executor's partial-apply paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    live: LiveSchema,
    fingerprint: Option<String>,
    locked: bool,
    failing: BTreeSet<ElementId>,
}

impl MemoryStore {
    pub fn with_live(live: LiveSchema) -> Self {
        Self {
            live,
            ..Default::default()
        }
    }

    /// Make every operation touching the element fail until cleared.
    pub fn fail_on(&mut self, element: ElementId) {
        self.failing.insert(element);
    }

    pub fn clear_failures(&mut self) {
        self.failing.clear();
    }

    pub fn live(&self) -> &LiveSchema {
        &self.live
    }
}

impl SchemaStore for MemoryStore {
    async fn snapshot(&mut self) -> Result<LiveSchema, StoreError> {
        Ok(self.live.clone())
    }

    async fn execute(&mut self, op: &Operation) -> Result<(), StoreError> {
        let element = op.element_id();
        if self.failing.contains(&element) {
            return Err(StoreError::Ddl {
                element,
                message: "injected failure".to_string(),
            });
        }
        op.apply_to(&mut self.live);
        Ok(())
    }

    async fn acquire_lock(&mut self) -> Result<(), StoreError> {
        if self.locked {
            return Err(StoreError::LockUnavailable("memory".to_string()));
        }
        self.locked = true;
        Ok(())
    }

    async fn release_lock(&mut self) -> Result<(), StoreError> {
        self.locked = false;
        Ok(())
    }

    async fn read_fingerprint(&mut self) -> Result<Option<String>, StoreError> {
        Ok(self.fingerprint.clone())
    }

    async fn write_fingerprint(&mut self, fingerprint: &str) -> Result<(), StoreError> {
        self.fingerprint = Some(fingerprint.to_string());
        Ok(())
    }
}
