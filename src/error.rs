// Error taxonomy for the migration engine.
//
// Two tiers: MigrationError variants are fatal or store-level failures that
// propagate up and terminate the run; SkipReason values are per-record
// outcomes that the pipeline converts into error-list entries and continues.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of an underlying error message kept in a skip entry.
pub const ERROR_MESSAGE_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum MigrationError {
    /// Bad credentials against either system. Aborts the run.
    #[error("authentication failed against {system}: {reason}")]
    Authentication { system: String, reason: String },

    /// A write reached a connector wired as read-only. This is a wiring
    /// error, not a data error, so it also aborts the run.
    #[error("operation '{operation}' rejected: connector is read-only")]
    ReadOnlyViolation { operation: String },

    /// An existing mapping for (kind, source_id) points at a different
    /// target. Re-inserting the identical pair is not an error.
    #[error(
        "conflicting mapping for {kind} source {source_id}: \
         already mapped to {existing}, attempted {attempted}"
    )]
    DuplicateMapping {
        kind: String,
        source_id: i64,
        existing: i64,
        attempted: i64,
    },

    /// Transport-level failure surfaced by a connector.
    #[error("connector error: {0}")]
    Connector(String),

    /// Durable mapping store failure.
    #[error("mapping store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Audit export failure.
    #[error("audit export error: {0}")]
    Export(#[from] csv::Error),

    /// Reference-equivalence side file could not be read or written.
    #[error("reference side file error: {0}")]
    SideFile(String),
}

impl MigrationError {
    /// Whether this error must terminate the run instead of being converted
    /// into a per-record skip.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MigrationError::Authentication { .. } | MigrationError::ReadOnlyViolation { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, MigrationError>;

// ============================================================================
// PER-RECORD SKIP REASONS
// ============================================================================

/// Why a single record could not be translated or submitted.
///
/// None of these terminate the batch loop; each one becomes an
/// UnresolvedReference appended to the run's error list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SkipReason {
    /// The record's party has no entry in the mapping store.
    PartnerNotMigrated { partner_id: i64 },

    /// The journal is absent from the reference table and the name-based
    /// fallback found nothing on the target.
    JournalNotMapped { journal_id: i64, name: String },

    /// An account on one of the lines could not be resolved.
    AccountNotMapped { account_id: i64, name: String },

    /// A line tax has no equivalent on the target.
    TaxNotMapped { tax_id: i64 },

    /// The target rejected the creation call.
    CreateRejected { message: String },
}

impl SkipReason {
    /// Target rejection with the underlying message truncated for reporting.
    pub fn create_rejected(message: impl AsRef<str>) -> Self {
        SkipReason::CreateRejected {
            message: truncate_message(message.as_ref()),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            SkipReason::PartnerNotMigrated { partner_id } => {
                format!("partner {} not migrated", partner_id)
            }
            SkipReason::JournalNotMapped { journal_id, name } => {
                format!("journal {} ({}) not mapped", journal_id, name)
            }
            SkipReason::AccountNotMapped { account_id, name } => {
                format!("account {} ({}) not mapped", account_id, name)
            }
            SkipReason::TaxNotMapped { tax_id } => format!("tax {} not mapped", tax_id),
            SkipReason::CreateRejected { message } => format!("create rejected: {}", message),
        }
    }
}

/// A translation or submission failure for one source record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnresolvedReference {
    pub source_id: i64,
    pub name: String,
    pub reason: SkipReason,
}

impl UnresolvedReference {
    pub fn new(source_id: i64, name: impl Into<String>, reason: SkipReason) -> Self {
        UnresolvedReference {
            source_id,
            name: name.into(),
            reason,
        }
    }

    pub fn describe(&self) -> String {
        format!("[{}] {}: {}", self.source_id, self.name, self.reason.describe())
    }
}

pub fn truncate_message(message: &str) -> String {
    if message.chars().count() <= ERROR_MESSAGE_LIMIT {
        message.to_string()
    } else {
        message.chars().take(ERROR_MESSAGE_LIMIT).collect()
    }
}

/// Detect the target's "already settled" rejection, which counts as a
/// benign skip rather than an error. The target phrases it differently
/// across versions and locales.
pub fn already_settled(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("already reconciled")
        || lower.contains("already created")
        || lower.contains("ya conciliado")
        || lower.contains("ya han sido conciliados")
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_rejected_truncates_long_messages() {
        let long = "x".repeat(300);
        let reason = SkipReason::create_rejected(&long);

        match reason {
            SkipReason::CreateRejected { message } => {
                assert_eq!(message.len(), ERROR_MESSAGE_LIMIT);
            }
            other => panic!("unexpected reason: {:?}", other),
        }
    }

    #[test]
    fn test_already_settled_detection() {
        assert!(already_settled("Error: lines already reconciled together"));
        assert!(already_settled("Los apuntes ya han sido conciliados"));
        assert!(!already_settled("balance does not match"));
    }

    #[test]
    fn test_unresolved_reference_describe() {
        let entry = UnresolvedReference::new(
            42,
            "INV/2026/0042",
            SkipReason::PartnerNotMigrated { partner_id: 7 },
        );

        assert_eq!(entry.describe(), "[42] INV/2026/0042: partner 7 not migrated");
    }
}
