use thiserror::Error;

use crate::schema::diff::DiffError;
use crate::schema::exec::StoreError;
use crate::schema::ledger::LedgerError;
use crate::schema::merge::MergeError;
use crate::schema::plan::PlanError;
use crate::schema::source::SourceError;

/// Everything a reconciliation run can fail with, mapped onto the CLI's
/// exit codes. Partial application is not an error; the CLI derives its
/// exit code from the apply report.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Diff(#[from] DiffError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Source(#[from] SourceError),
}

pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFLICT: i32 = 1;
pub const EXIT_INVALID_PLAN: i32 = 2;
pub const EXIT_PARTIAL: i32 = 3;
pub const EXIT_OPERATIONAL: i32 = 4;

impl ReconcileError {
    pub const fn exit_code(&self) -> i32 {
        match self {
            ReconcileError::Merge(_) => EXIT_CONFLICT,
            ReconcileError::Diff(_) | ReconcileError::Plan(_) => EXIT_INVALID_PLAN,
            ReconcileError::Store(_) | ReconcileError::Ledger(_) | ReconcileError::Source(_) => {
                EXIT_OPERATIONAL
            }
        }
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
