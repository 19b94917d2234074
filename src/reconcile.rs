// Reconciliation Migrator - replays source debit/credit settlements onto
// the migrated target lines.
//
// Each source pairing names one debit and one credit line. Both sides are
// resolved to target line ids, preferably by the stamped back-reference,
// otherwise by a three-tier candidate search scoped to the mapped target
// transaction. Tier three can bind an unrelated line when several residuals
// share the sign; it is kept because the alternative is leaving the pair
// unsettled, and every use is logged.

use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::config::MigrationConfig;
use crate::connector::{num_field, record_id, ref_id, Filter, Order, RecordConnector};
use crate::error::{already_settled, Result};
use crate::schema::{kind as entity, SourceSchema, TargetSchema};
use crate::tracking::MappingStore;

/// One source settlement: a debit line offset against a credit line.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationPair {
    pub debit_line_id: i64,
    pub credit_line_id: i64,
    pub amount: f64,
}

/// End-of-run settlement counts.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub settled: usize,
    /// Unresolvable or already settled on the target.
    pub skipped: usize,
    pub errored: usize,
    pub errors: Vec<String>,
}

impl ReconcileReport {
    pub fn summary(&self) -> String {
        format!(
            "settlements: {} settled, {} skipped, {} errored",
            self.settled, self.skipped, self.errored
        )
    }

    pub fn error_detail(&self, limit: usize) -> Vec<String> {
        self.errors.iter().take(limit).cloned().collect()
    }
}

enum SettleOutcome {
    Settled,
    Skipped(&'static str),
}

// ============================================================================
// MIGRATOR
// ============================================================================

pub struct ReconciliationMigrator<'a> {
    source: &'a dyn RecordConnector,
    target: &'a dyn RecordConnector,
    store: &'a MappingStore,
    config: &'a MigrationConfig,
    source_schema: SourceSchema,
    target_schema: TargetSchema,
}

impl<'a> ReconciliationMigrator<'a> {
    pub fn new(
        source: &'a dyn RecordConnector,
        target: &'a dyn RecordConnector,
        store: &'a MappingStore,
        config: &'a MigrationConfig,
        source_schema: SourceSchema,
        target_schema: TargetSchema,
    ) -> Self {
        ReconciliationMigrator {
            source,
            target,
            store,
            config,
            source_schema,
            target_schema,
        }
    }

    /// Replay every source settlement in scope. Each pair is attempted
    /// once; failures on one pair never stop the run.
    pub fn run(&self) -> Result<ReconcileReport> {
        let pairs = self.discover_pairs()?;
        let move_map = self.build_move_map()?;
        let mut line_cache: HashMap<i64, Option<i64>> = HashMap::new();

        let mut report = ReconcileReport::default();
        for pair in &pairs {
            match self.settle_pair(pair, &mut line_cache, &move_map) {
                Ok(SettleOutcome::Settled) => report.settled += 1,
                Ok(SettleOutcome::Skipped(reason)) => {
                    debug!(
                        debit = pair.debit_line_id,
                        credit = pair.credit_line_id,
                        reason,
                        "settlement skipped"
                    );
                    report.skipped += 1;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    report.errored += 1;
                    report.errors.push(format!(
                        "pair {}/{}: {}",
                        pair.debit_line_id, pair.credit_line_id, e
                    ));
                }
            }
        }

        info!(summary = %report.summary(), "settlement run finished");
        for detail in report.error_detail(self.config.error_report_limit) {
            warn!(%detail, "settlement failed");
        }

        Ok(report)
    }

    /// Source settlements inside the migration scope, id ascending.
    fn discover_pairs(&self) -> Result<Vec<ReconciliationPair>> {
        let filter = Filter::new()
            .eq("company_id", self.config.company_id)
            .ge("max_date", self.config.start_date_str());
        let rows = self.source.find(
            &self.source_schema.settlement_entity,
            &filter,
            &["debit_move_id", "credit_move_id", "amount"],
            0,
            None,
            Order::IdAsc,
        )?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(ReconciliationPair {
                    debit_line_id: ref_id(row, "debit_move_id")?,
                    credit_line_id: ref_id(row, "credit_move_id")?,
                    amount: num_field(row, "amount"),
                })
            })
            .collect())
    }

    /// Source transaction id -> target transaction id, for scoping the
    /// fallback candidate search.
    ///
    /// Invoices and ledger entries map directly. Payments map through an
    /// indirection on both sides: the target payment names its move, the
    /// source payment's move is found on its lines.
    fn build_move_map(&self) -> Result<HashMap<i64, i64>> {
        let mut map = HashMap::new();
        for kind in [entity::INVOICE, entity::LEDGER_ENTRY] {
            for record in self.store.records(kind)? {
                map.insert(record.source_id, record.target_id);
            }
        }

        let payments = self.store.records(entity::PAYMENT)?;
        for batch in payments.chunks(self.config.batch_size.max(1)) {
            let source_ids: Vec<i64> = batch.iter().map(|r| r.source_id).collect();
            let target_ids: Vec<i64> = batch.iter().map(|r| r.target_id).collect();

            // Target payment -> target move.
            let mut target_moves: HashMap<i64, i64> = HashMap::new();
            let target_payments = self.target.read_by_id(
                &self.target_schema.payment_entity,
                &target_ids,
                &[self.target_schema.payment_move_field.as_str()],
            )?;
            for payment in &target_payments {
                if let Some(move_id) = ref_id(payment, &self.target_schema.payment_move_field) {
                    target_moves.insert(record_id(payment), move_id);
                }
            }

            // Source payment -> source move, via the payment's lines.
            let id_values: Vec<Value> = source_ids.iter().map(|id| Value::from(*id)).collect();
            let lines = self.source.find(
                &self.source_schema.line_entity,
                &Filter::new().is_in("payment_id", id_values),
                &["move_id", "payment_id"],
                0,
                None,
                Order::IdAsc,
            )?;

            for line in &lines {
                let (Some(payment_id), Some(source_move)) =
                    (ref_id(line, "payment_id"), ref_id(line, "move_id"))
                else {
                    continue;
                };
                let target_payment = batch
                    .iter()
                    .find(|r| r.source_id == payment_id)
                    .map(|r| r.target_id);
                if let Some(target_move) =
                    target_payment.and_then(|tp| target_moves.get(&tp).copied())
                {
                    map.insert(source_move, target_move);
                }
            }
        }

        Ok(map)
    }

    fn settle_pair(
        &self,
        pair: &ReconciliationPair,
        cache: &mut HashMap<i64, Option<i64>>,
        move_map: &HashMap<i64, i64>,
    ) -> Result<SettleOutcome> {
        let debit = self.resolve_line(pair.debit_line_id, true, cache, move_map)?;
        let credit = self.resolve_line(pair.credit_line_id, false, cache, move_map)?;

        let (Some(debit), Some(credit)) = (debit, credit) else {
            return Ok(SettleOutcome::Skipped("line not resolved"));
        };

        match self.target.invoke(
            &self.target_schema.line_entity,
            &self.target_schema.settle_operation,
            &[json!([debit, credit])],
        ) {
            Ok(_) => Ok(SettleOutcome::Settled),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) if already_settled(&e.to_string()) => {
                Ok(SettleOutcome::Skipped("already settled"))
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve one source line to its target line, cached per run.
    fn resolve_line(
        &self,
        source_line_id: i64,
        is_debit: bool,
        cache: &mut HashMap<i64, Option<i64>>,
        move_map: &HashMap<i64, i64>,
    ) -> Result<Option<i64>> {
        if let Some(cached) = cache.get(&source_line_id) {
            return Ok(*cached);
        }

        // Direct: the back-reference stamped at migration time.
        let mut resolved = self
            .target
            .find_one(
                &self.target_schema.line_entity,
                &Filter::new().eq(&self.target_schema.back_reference_field, source_line_id),
                &[],
            )?
            .map(|r| record_id(&r));

        if resolved.is_none() {
            resolved = self.fallback_resolve(source_line_id, is_debit, move_map)?;
        }

        cache.insert(source_line_id, resolved);
        Ok(resolved)
    }

    /// Candidate search scoped to the mapped target transaction, tiers:
    /// exact amount + partner on an unsettled receivable/payable line,
    /// the same without the partner condition, then any receivable or
    /// payable line whose residual has the correct sign.
    fn fallback_resolve(
        &self,
        source_line_id: i64,
        is_debit: bool,
        move_map: &HashMap<i64, i64>,
    ) -> Result<Option<i64>> {
        let lines = self.source.read_by_id(
            &self.source_schema.line_entity,
            &[source_line_id],
            &["move_id", "partner_id", "debit", "credit"],
        )?;
        let Some(line) = lines.first() else {
            return Ok(None);
        };
        let Some(source_move) = ref_id(line, "move_id") else {
            return Ok(None);
        };
        let Some(&target_move) = move_map.get(&source_move) else {
            return Ok(None);
        };

        let amount_field = if is_debit { "debit" } else { "credit" };
        let amount = num_field(line, amount_field);
        let settlement_accounts = vec![
            Value::from(self.target_schema.receivable_account_type.as_str()),
            Value::from(self.target_schema.payable_account_type.as_str()),
        ];

        // Tier 1: exact amount, same partner, unsettled settlement line.
        if let Some(partner_id) = ref_id(line, "partner_id") {
            if let Some(partner) = self.store.target_for(entity::PARTNER, partner_id)? {
                let filter = Filter::new()
                    .eq("move_id", target_move)
                    .eq(amount_field, amount)
                    .eq("partner_id", partner)
                    .eq(&self.target_schema.settled_flag, false)
                    .is_in(
                        &self.target_schema.account_type_field,
                        settlement_accounts.clone(),
                    );
                if let Some(found) =
                    self.target
                        .find_one(&self.target_schema.line_entity, &filter, &[])?
                {
                    return Ok(Some(record_id(&found)));
                }
            }
        }

        // Tier 2: exact amount on an unsettled settlement line, any
        // partner. Revenue/expense lines carrying the same amount are
        // never candidates.
        let filter = Filter::new()
            .eq("move_id", target_move)
            .eq(amount_field, amount)
            .eq(&self.target_schema.settled_flag, false)
            .is_in(
                &self.target_schema.account_type_field,
                settlement_accounts.clone(),
            );
        if let Some(found) = self
            .target
            .find_one(&self.target_schema.line_entity, &filter, &[])?
        {
            return Ok(Some(record_id(&found)));
        }

        // Tier 3: any unsettled line with the correct residual sign. May
        // pick an unrelated line when several qualify.
        let filter = Filter::new()
            .eq("move_id", target_move)
            .is_in(&self.target_schema.account_type_field, settlement_accounts);
        let filter = if is_debit {
            filter.gt(&self.target_schema.residual_field, 0.0)
        } else {
            filter.lt(&self.target_schema.residual_field, 0.0)
        };
        let found = self
            .target
            .find_one(&self.target_schema.line_entity, &filter, &[])?
            .map(|r| record_id(&r));
        if let Some(line_id) = found {
            warn!(
                source_line_id,
                target_move,
                line_id,
                "settlement line resolved by residual sign only"
            );
        }
        Ok(found)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{MemoryConnector, Record};
    use crate::error::MigrationError;

    fn record(pairs: &[(&str, Value)]) -> Record {
        let mut r = Record::new();
        for (k, v) in pairs {
            r.insert(k.to_string(), v.clone());
        }
        r
    }

    fn seed_pair(source: &MemoryConnector, id: i64, debit_line: i64, credit_line: i64, amount: f64) {
        source.seed(
            "account.partial.reconcile",
            id,
            record(&[
                ("company_id", json!(1)),
                ("max_date", json!("2026-03-15")),
                ("debit_move_id", json!([debit_line, "line"])),
                ("credit_move_id", json!([credit_line, "line"])),
                ("amount", json!(amount)),
            ]),
        );
    }

    fn stamped_line(target: &MemoryConnector, id: i64, source_line: i64) {
        target.seed(
            "account.move.line",
            id,
            record(&[("x_v13_id", json!(source_line))]),
        );
    }

    struct Fixture {
        source: MemoryConnector,
        target: MemoryConnector,
        store: MappingStore,
        config: MigrationConfig,
    }

    impl Fixture {
        fn new(target: MemoryConnector) -> Self {
            Fixture {
                source: MemoryConnector::new(),
                target,
                store: MappingStore::open_in_memory().unwrap(),
                config: MigrationConfig::default(),
            }
        }

        fn migrator(&self) -> ReconciliationMigrator<'_> {
            ReconciliationMigrator::new(
                &self.source,
                &self.target,
                &self.store,
                &self.config,
                SourceSchema::default(),
                TargetSchema::default(),
            )
        }
    }

    #[test]
    fn test_settles_back_referenced_pair() {
        let fx = Fixture::new(MemoryConnector::new());
        seed_pair(&fx.source, 1, 1003, 2002, 121.0);
        stamped_line(&fx.target, 5002, 1003);
        stamped_line(&fx.target, 6002, 2002);

        let report = fx.migrator().run().unwrap();
        assert_eq!(report.settled, 1);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.errored, 0);

        let settles: Vec<_> = fx
            .target
            .invocations()
            .into_iter()
            .filter(|(_, op, _)| op == "reconcile")
            .collect();
        assert_eq!(settles.len(), 1);
        assert_eq!(settles[0].2[0], json!([5002, 6002]));
    }

    #[test]
    fn test_already_settled_is_a_skip_not_an_error() {
        let target = MemoryConnector::new().with_invoke_hook(|_, operation, _| {
            if operation == "reconcile" {
                Err(MigrationError::Connector(
                    "Los apuntes ya han sido conciliados".to_string(),
                ))
            } else {
                Ok(Value::Null)
            }
        });
        stamped_line(&target, 5002, 1003);
        stamped_line(&target, 6002, 2002);

        let fx = Fixture::new(target);
        seed_pair(&fx.source, 1, 1003, 2002, 121.0);

        let report = fx.migrator().run().unwrap();
        assert_eq!(report.settled, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.errored, 0);
    }

    #[test]
    fn test_unresolvable_pair_is_skipped() {
        let fx = Fixture::new(MemoryConnector::new());
        seed_pair(&fx.source, 1, 1003, 2002, 121.0);

        let report = fx.migrator().run().unwrap();
        assert_eq!(report.settled, 0);
        assert_eq!(report.skipped, 1);
        assert!(fx.target.invocations().is_empty());
    }

    #[test]
    fn test_fallback_exact_amount_and_partner() {
        let fx = Fixture::new(MemoryConnector::new());
        seed_pair(&fx.source, 1, 1003, 2002, 121.0);
        // Debit side resolves directly; credit side has no back-reference.
        stamped_line(&fx.target, 5002, 1003);

        fx.source.seed(
            "account.move.line",
            2002,
            record(&[
                ("move_id", json!([300, "PAY/001"])),
                ("partner_id", json!([7, "ACME"])),
                ("debit", json!(0.0)),
                ("credit", json!(121.0)),
            ]),
        );
        fx.store.put(entity::PARTNER, 7, 70, None).unwrap();
        fx.store.put(entity::LEDGER_ENTRY, 300, 900, None).unwrap();

        // Two lines on the target move; only one carries the partner and
        // settlement account type.
        fx.target.seed(
            "account.move.line",
            9001,
            record(&[
                ("move_id", json!([900, "PAY/900"])),
                ("credit", json!(121.0)),
                ("partner_id", json!([71, "Other"])),
                ("reconciled", json!(false)),
                ("account_type", json!("asset_receivable")),
            ]),
        );
        fx.target.seed(
            "account.move.line",
            9002,
            record(&[
                ("move_id", json!([900, "PAY/900"])),
                ("credit", json!(121.0)),
                ("partner_id", json!([70, "ACME"])),
                ("reconciled", json!(false)),
                ("account_type", json!("asset_receivable")),
            ]),
        );

        let report = fx.migrator().run().unwrap();
        assert_eq!(report.settled, 1);

        let settles: Vec<_> = fx
            .target
            .invocations()
            .into_iter()
            .filter(|(_, op, _)| op == "reconcile")
            .collect();
        assert_eq!(settles[0].2[0], json!([5002, 9002]));
    }

    #[test]
    fn test_fallback_exact_amount_never_binds_revenue_lines() {
        let fx = Fixture::new(MemoryConnector::new());
        seed_pair(&fx.source, 1, 1003, 2002, 121.0);
        stamped_line(&fx.target, 5002, 1003);

        // No partner on the source line, so tier one is out.
        fx.source.seed(
            "account.move.line",
            2002,
            record(&[
                ("move_id", json!([300, "INV/001"])),
                ("debit", json!(0.0)),
                ("credit", json!(121.0)),
            ]),
        );
        fx.store.put(entity::LEDGER_ENTRY, 300, 900, None).unwrap();

        // The revenue counterpart carries the same amount and a lower id,
        // but it is not a settlement line.
        fx.target.seed(
            "account.move.line",
            9001,
            record(&[
                ("move_id", json!([900, "INV/900"])),
                ("credit", json!(121.0)),
                ("account_type", json!("income")),
            ]),
        );
        fx.target.seed(
            "account.move.line",
            9002,
            record(&[
                ("move_id", json!([900, "INV/900"])),
                ("credit", json!(121.0)),
                ("reconciled", json!(false)),
                ("account_type", json!("asset_receivable")),
            ]),
        );

        let report = fx.migrator().run().unwrap();
        assert_eq!(report.settled, 1);

        let settles: Vec<_> = fx
            .target
            .invocations()
            .into_iter()
            .filter(|(_, op, _)| op == "reconcile")
            .collect();
        assert_eq!(settles[0].2[0], json!([5002, 9002]));
    }

    #[test]
    fn test_fallback_residual_sign_tier() {
        let fx = Fixture::new(MemoryConnector::new());
        seed_pair(&fx.source, 1, 1003, 2002, 50.0);
        stamped_line(&fx.target, 5002, 1003);

        // Credit-side source line with an amount nothing on the target
        // matches exactly.
        fx.source.seed(
            "account.move.line",
            2002,
            record(&[
                ("move_id", json!([300, "PAY/001"])),
                ("debit", json!(0.0)),
                ("credit", json!(50.0)),
            ]),
        );
        fx.store.put(entity::LEDGER_ENTRY, 300, 900, None).unwrap();

        // Partial settlement left a negative residual on the credit line.
        fx.target.seed(
            "account.move.line",
            9001,
            record(&[
                ("move_id", json!([900, "PAY/900"])),
                ("credit", json!(120.0)),
                ("account_type", json!("liability_payable")),
                ("amount_residual", json!(-50.0)),
            ]),
        );

        let report = fx.migrator().run().unwrap();
        assert_eq!(report.settled, 1);

        let settles: Vec<_> = fx
            .target
            .invocations()
            .into_iter()
            .filter(|(_, op, _)| op == "reconcile")
            .collect();
        assert_eq!(settles[0].2[0], json!([5002, 9001]));
    }

    #[test]
    fn test_payment_move_indirection() {
        let fx = Fixture::new(MemoryConnector::new());
        seed_pair(&fx.source, 1, 1003, 4001, 75.0);
        stamped_line(&fx.target, 5002, 1003);

        // Source line 4001 belongs to payment 9's move 400.
        fx.source.seed(
            "account.move.line",
            4001,
            record(&[
                ("move_id", json!([400, "PAY/009"])),
                ("payment_id", json!([9, "PAY/009"])),
                ("debit", json!(0.0)),
                ("credit", json!(75.0)),
            ]),
        );
        fx.store.put(entity::PAYMENT, 9, 90, None).unwrap();
        // Target payment 90 names its move.
        fx.target.seed(
            "account.payment",
            90,
            record(&[("move_id", json!([950, "PAY/950"]))]),
        );
        fx.target.seed(
            "account.move.line",
            9501,
            record(&[
                ("move_id", json!([950, "PAY/950"])),
                ("credit", json!(75.0)),
                ("reconciled", json!(false)),
                ("account_type", json!("asset_receivable")),
            ]),
        );

        let report = fx.migrator().run().unwrap();
        assert_eq!(report.settled, 1);

        let settles: Vec<_> = fx
            .target
            .invocations()
            .into_iter()
            .filter(|(_, op, _)| op == "reconcile")
            .collect();
        assert_eq!(settles[0].2[0], json!([5002, 9501]));
    }

    #[test]
    fn test_pairs_outside_scope_are_ignored() {
        let fx = Fixture::new(MemoryConnector::new());
        fx.source.seed(
            "account.partial.reconcile",
            1,
            record(&[
                ("company_id", json!(1)),
                ("max_date", json!("2025-06-01")),
                ("debit_move_id", json!([1003, "line"])),
                ("credit_move_id", json!([2002, "line"])),
                ("amount", json!(10.0)),
            ]),
        );

        let report = fx.migrator().run().unwrap();
        assert_eq!(report.settled + report.skipped + report.errored, 0);
    }
}
