use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Conf {
    pub database_url: String,

    /// Directory of per-module declaration documents, loaded in name order.
    pub declarations_dir: PathBuf,

    /// Directory of per-module whitelist documents.
    pub whitelist_dir: PathBuf,

    /// Name scoping the catalog advisory lock. Two deploys targeting the
    /// same scope cannot apply concurrently.
    pub lock_scope: String,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            database_url: "postgres:///tabula".to_string(),
            declarations_dir: PathBuf::from("schema/declarations"),
            whitelist_dir: PathBuf::from("schema/whitelist"),
            lock_scope: "tabula".to_string(),
        }
    }
}

impl Conf {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        #[cfg(test)]
        {
            dotenvy::from_filename_override(".env.test").ok();
        }

        #[cfg(all(debug_assertions, not(test)))]
        {
            dotenvy::from_filename_override(".env.dev").ok();
        }

        #[cfg(not(any(debug_assertions, test)))]
        {
            dotenvy::from_filename_override(".env.prod").ok();
        }

        let defaults = Conf::default();
        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| defaults.database_url.clone());
        let declarations_dir = std::env::var("TABULA_DECLARATIONS")
            .map(PathBuf::from)
            .unwrap_or(defaults.declarations_dir);
        let whitelist_dir = std::env::var("TABULA_WHITELIST")
            .map(PathBuf::from)
            .unwrap_or(defaults.whitelist_dir);
        let lock_scope =
            std::env::var("TABULA_LOCK_SCOPE").unwrap_or_else(|_| database_url.clone());

        Self {
            database_url,
            declarations_dir,
            whitelist_dir,
            lock_scope,
        }
    }
}
