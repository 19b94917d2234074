// Line Reconciliation Matcher - binds target-generated automatic lines to
// their source counterparts.
//
// The target computes its own tax and receivable/payable lines at creation
// time, so those lines arrive without a back-reference. This matcher pairs
// each of them against exactly one source non-principal line using account
// equivalence, amount tolerance, and tax equivalence, greedily and without
// double-assignment: a consumed source line leaves the pool and can never
// satisfy a second target line.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::connector::{num_field, record_id, ref_id, Record};
use crate::refmap::ReferenceMap;

/// Amount drift absorbed between the two systems' independent tax
/// computations, in currency units. Differences strictly beyond this
/// reject the pairing.
pub const AMOUNT_TOLERANCE: f64 = 0.01;

/// A true one-cent difference computed through f64 can land a few ulps
/// past 0.01 (1.26 - 1.25 > 0.01); this slack keeps it inside the
/// tolerance without letting a two-cent difference through.
const TOLERANCE_SLACK: f64 = 1e-9;

// ============================================================================
// LINE VIEWS
// ============================================================================

/// A source non-principal line, the matching oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceLine {
    pub id: i64,
    pub account_id: i64,
    pub debit: f64,
    pub credit: f64,
    /// Source tax this line was generated for, when it is a tax line.
    pub tax_line_id: Option<i64>,
}

impl SourceLine {
    /// Build from a connector record (`account_id` as a reference pair,
    /// `tax_line_id` optional).
    pub fn from_record(record: &Record) -> Self {
        SourceLine {
            id: record_id(record),
            account_id: ref_id(record, "account_id").unwrap_or(0),
            debit: num_field(record, "debit"),
            credit: num_field(record, "credit"),
            tax_line_id: ref_id(record, "tax_line_id"),
        }
    }
}

/// A target automatic line awaiting a back-reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetLine {
    pub id: i64,
    pub account_id: i64,
    pub debit: f64,
    pub credit: f64,
    pub tax_line_id: Option<i64>,
}

impl TargetLine {
    pub fn from_record(record: &Record) -> Self {
        TargetLine {
            id: record_id(record),
            account_id: ref_id(record, "account_id").unwrap_or(0),
            debit: num_field(record, "debit"),
            credit: num_field(record, "credit"),
            tax_line_id: ref_id(record, "tax_line_id"),
        }
    }
}

/// An established target-line -> source-line pairing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineBinding {
    pub target_line_id: i64,
    pub source_line_id: i64,
}

/// First failing predicate for one candidate pair, for operator debugging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MatchVerdict {
    Matched,
    AccountMismatch {
        mapped_source_account: Option<i64>,
        target_account: i64,
    },
    DebitOutOfTolerance {
        difference: f64,
    },
    CreditOutOfTolerance {
        difference: f64,
    },
    /// Target line is a tax line but the candidate is not.
    TaxReferenceMissing,
    TaxMismatch {
        mapped_source_tax: Option<i64>,
        target_tax: i64,
    },
}

impl MatchVerdict {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchVerdict::Matched)
    }
}

/// Result of one matching pass over a transaction's lines.
#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    pub bindings: Vec<LineBinding>,
    /// Target lines no remaining source line satisfied. Reported, not fatal.
    pub unbound_targets: Vec<i64>,
    /// Source lines left unconsumed.
    pub remaining_sources: Vec<SourceLine>,
}

// ============================================================================
// MATCHER
// ============================================================================

pub struct LineMatcher {
    pub tolerance: f64,
}

impl LineMatcher {
    pub fn new() -> Self {
        LineMatcher {
            tolerance: AMOUNT_TOLERANCE,
        }
    }

    pub fn with_tolerance(tolerance: f64) -> Self {
        LineMatcher { tolerance }
    }

    /// Greedily pair target lines (in target read order) against the source
    /// pool. First satisfying source line in enumeration order wins; a
    /// matched source line is moved out of the pool.
    pub fn match_lines(
        &self,
        target_lines: &[TargetLine],
        source_lines: Vec<SourceLine>,
        refmap: &ReferenceMap,
    ) -> MatchOutcome {
        let mut remaining = source_lines;
        let mut outcome = MatchOutcome::default();

        for target in target_lines {
            let position = remaining
                .iter()
                .position(|source| self.explain(source, target, refmap).is_match());

            match position {
                Some(index) => {
                    let consumed = remaining.remove(index);
                    outcome.bindings.push(LineBinding {
                        target_line_id: target.id,
                        source_line_id: consumed.id,
                    });
                }
                None => {
                    warn!(
                        target_line = target.id,
                        account = target.account_id,
                        debit = target.debit,
                        credit = target.credit,
                        "no source line matched this automatic line"
                    );
                    outcome.unbound_targets.push(target.id);
                }
            }
        }

        outcome.remaining_sources = remaining;
        outcome
    }

    /// Evaluate one candidate pair and return the first failing predicate,
    /// in the order the matching loop applies them. Usable standalone as a
    /// diagnostic.
    pub fn explain(
        &self,
        source: &SourceLine,
        target: &TargetLine,
        refmap: &ReferenceMap,
    ) -> MatchVerdict {
        let mapped_account = refmap.target_account(source.account_id);
        if mapped_account != Some(target.account_id) {
            return MatchVerdict::AccountMismatch {
                mapped_source_account: mapped_account,
                target_account: target.account_id,
            };
        }

        let debit_difference = (source.debit - target.debit).abs();
        if debit_difference > self.tolerance + TOLERANCE_SLACK {
            return MatchVerdict::DebitOutOfTolerance {
                difference: debit_difference,
            };
        }

        let credit_difference = (source.credit - target.credit).abs();
        if credit_difference > self.tolerance + TOLERANCE_SLACK {
            return MatchVerdict::CreditOutOfTolerance {
                difference: credit_difference,
            };
        }

        if let Some(target_tax) = target.tax_line_id {
            let source_tax = match source.tax_line_id {
                Some(tax) => tax,
                None => return MatchVerdict::TaxReferenceMissing,
            };
            let mapped_tax = refmap.target_tax(source_tax);
            if mapped_tax != Some(target_tax) {
                return MatchVerdict::TaxMismatch {
                    mapped_source_tax: mapped_tax,
                    target_tax,
                };
            }
        }

        MatchVerdict::Matched
    }
}

impl Default for LineMatcher {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
