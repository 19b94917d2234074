// Ledger Bridge - Migration Reconciliation Engine
// Exposes all modules for use in the CLI and tests

pub mod config;
pub mod connector;
pub mod error;
pub mod matcher;
pub mod materialize;
pub mod pipeline;
pub mod reconcile;
pub mod refmap;
pub mod schema;
pub mod tracking;

// Re-export commonly used types
pub use config::MigrationConfig;
pub use connector::{Filter, MemoryConnector, Op, Order, ReadOnly, Record, RecordConnector};
pub use error::{MigrationError, Result, SkipReason, UnresolvedReference};
pub use matcher::{
    LineBinding, LineMatcher, MatchOutcome, MatchVerdict, SourceLine, TargetLine, AMOUNT_TOLERANCE,
};
pub use materialize::{materialize_missing_journals, MaterializeReport};
pub use pipeline::{MigrationPipeline, RecordKind, RunReport};
pub use reconcile::{ReconcileReport, ReconciliationMigrator, ReconciliationPair};
pub use refmap::{
    AmbiguousMatch, ReferenceKind, ReferenceMap, ReferenceMapper, ReferencePairing, UnmatchedEntry,
};
pub use schema::{kind, SourceSchema, TargetSchema};
pub use tracking::{MappingRecord, MappingStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
