use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::model::ElementId;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("cannot read whitelist document {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write whitelist document {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("whitelist document {path} is not valid")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Durable record of what one module has caused to exist, across every
/// version it has ever installed. Gates drops: an element the ledger does not
/// reference is invisible to the diff engine's drop logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub module_id: String,
    pub schema_version: String,
    pub installed: BTreeSet<ElementId>,
    pub recorded_at: DateTime<Utc>,
}

/// The ownership ledger: one whitelist entry per module, persisted as one
/// JSON document per module so entries travel with the module's declarations.
/// Two modules' histories are never merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    entries: BTreeMap<String, WhitelistEntry>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the module's record with the given element set.
    pub fn record(&mut self, module_id: &str, schema_version: &str, elements: BTreeSet<ElementId>) {
        self.entries.insert(
            module_id.to_string(),
            WhitelistEntry {
                module_id: module_id.to_string(),
                schema_version: schema_version.to_string(),
                installed: elements,
                recorded_at: Utc::now(),
            },
        );
    }

    /// Whether any module's entry references the element.
    pub fn is_tracked(&self, id: &ElementId) -> bool {
        self.entries.values().any(|e| e.installed.contains(id))
    }

    pub fn owning_modules(&self, id: &ElementId) -> BTreeSet<String> {
        self.entries
            .values()
            .filter(|e| e.installed.contains(id))
            .map(|e| e.module_id.clone())
            .collect()
    }

    /// Drop the module's entry. Its elements become drop candidates only once
    /// no surviving entry references them.
    pub fn forget(&mut self, module_id: &str) -> Option<WhitelistEntry> {
        self.entries.remove(module_id)
    }

    pub fn get(&self, module_id: &str) -> Option<&WhitelistEntry> {
        self.entries.get(module_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &WhitelistEntry> {
        self.entries.values()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load every `*.json` document in the directory. A missing directory is
    /// an empty ledger (first run). Files that are not whitelist documents
    /// are skipped with a warning rather than failing the run.
    pub fn load_dir(dir: &Path) -> Result<Self, LedgerError> {
        let mut ledger = Ledger::new();
        if !dir.exists() {
            return Ok(ledger);
        }

        let names = fs::read_dir(dir).map_err(|source| LedgerError::Read {
            path: dir.to_path_buf(),
            source,
        })?;

        for entry in names {
            let entry = entry.map_err(|source| LedgerError::Read {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read_to_string(&path).map_err(|source| LedgerError::Read {
                path: path.clone(),
                source,
            })?;
            match serde_json::from_str::<WhitelistEntry>(&raw) {
                Ok(parsed) => {
                    ledger.entries.insert(parsed.module_id.clone(), parsed);
                }
                Err(source) => {
                    tracing::warn!(path = %path.display(), error = %source, "skipping unreadable whitelist document");
                }
            }
        }

        Ok(ledger)
    }

    /// Write one document per entry and remove documents for modules no
    /// longer present, so `forget` survives the round-trip.
    pub fn save_dir(&self, dir: &Path) -> Result<(), LedgerError> {
        fs::create_dir_all(dir).map_err(|source| LedgerError::Write {
            path: dir.to_path_buf(),
            source,
        })?;

        for entry in self.entries.values() {
            let path = dir.join(format!("{}.json", entry.module_id));
            let body = serde_json::to_string_pretty(entry).map_err(|source| LedgerError::Parse {
                path: path.clone(),
                source,
            })?;
            fs::write(&path, body).map_err(|source| LedgerError::Write { path, source })?;
        }

        let names = fs::read_dir(dir).map_err(|source| LedgerError::Read {
            path: dir.to_path_buf(),
            source,
        })?;
        for entry in names.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // Only documents that parse as whitelist entries are eligible for
            // cleanup; a stray file in the directory is not ours to delete.
            let Ok(raw) = fs::read_to_string(&path) else {
                continue;
            };
            let Ok(parsed) = serde_json::from_str::<WhitelistEntry>(&raw) else {
                continue;
            };
            if !self.entries.contains_key(&parsed.module_id) {
                fs::remove_file(&path).map_err(|source| LedgerError::Write { path, source })?;
            }
        }

        Ok(())
    }
}
