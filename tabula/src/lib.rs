mod conf;
mod errors;
pub mod cmd;
pub mod db;
pub mod reconcile;
pub mod schema;
pub mod testing;

pub use conf::Conf;
pub use errors::{
    EXIT_CONFLICT, EXIT_INVALID_PLAN, EXIT_OK, EXIT_OPERATIONAL, EXIT_PARTIAL, ReconcileError,
    ReconcileResult,
};
pub use reconcile::{ApplyOutcome, PlanOutcome, Reconciler};
