use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::schema::model::ModuleContribution;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot read declarations from {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("declaration document {path} is not valid")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Load per-module declaration documents from a directory.
///
/// Each `*.json` file holds one already-parsed [`ModuleContribution`]. Files
/// are loaded in lexicographic name order; that order is the inter-module
/// dependency sequence (prefix file names to control it, e.g.
/// `010_acme_core.json`).
pub fn load_contributions(dir: &Path) -> Result<Vec<ModuleContribution>, SourceError> {
    let names = fs::read_dir(dir).map_err(|source| SourceError::Read {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = names
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    paths.sort();

    let mut contributions = Vec::with_capacity(paths.len());
    for path in paths {
        let raw = fs::read_to_string(&path).map_err(|source| SourceError::Read {
            path: path.clone(),
            source,
        })?;
        let parsed: ModuleContribution =
            serde_json::from_str(&raw).map_err(|source| SourceError::Parse {
                path: path.clone(),
                source,
            })?;
        tracing::debug!(module = %parsed.module_id, path = %path.display(), "loaded contribution");
        contributions.push(parsed);
    }

    Ok(contributions)
}
