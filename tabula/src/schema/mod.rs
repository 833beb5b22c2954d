pub mod diff;
pub mod exec;
pub mod introspect;
pub mod ledger;
pub mod merge;
pub mod model;
pub mod plan;
pub mod source;

pub use diff::{DiffError, DiffReport, Operation, diff};
pub use exec::{ApplyReport, Executor, SchemaStore, StoreError, TableOutcome, TableStatus};
pub use introspect::{IntrospectError, Introspector, PgIntrospector};
pub use ledger::{Ledger, LedgerError, WhitelistEntry};
pub use merge::{MergeError, merge};
pub use model::*;
pub use plan::{Plan, PlanError, TableBatch};
pub use source::{SourceError, load_contributions};
