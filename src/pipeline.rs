// Entity Migration Pipeline - moves transactional records across systems.
//
// Per record kind: discover posted source records inside the migration
// scope, subtract what the mapping store already holds, translate the rest
// into target vocabulary through the reference tables, submit, and track.
// Any failure on one record skips that record only; the run always finishes
// and reports what it could not move.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MigrationConfig;
use crate::connector::{
    bool_field, ids_field, num_field, record_id, ref_id, ref_label, str_field, Filter, Order,
    Record, RecordConnector,
};
use crate::error::{Result, SkipReason, UnresolvedReference};
use crate::matcher::{LineMatcher, SourceLine, TargetLine};
use crate::refmap::ReferenceMap;
use crate::schema::{kind as entity, SourceSchema, TargetSchema};
use crate::tracking::MappingStore;

type Outcome<T> = std::result::Result<T, SkipReason>;

/// Transactional record kinds the pipeline moves.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum RecordKind {
    Invoice,
    LedgerEntry,
    Payment,
}

impl RecordKind {
    /// Mapping-store kind key.
    pub fn store_kind(&self) -> &'static str {
        match self {
            RecordKind::Invoice => entity::INVOICE,
            RecordKind::LedgerEntry => entity::LEDGER_ENTRY,
            RecordKind::Payment => entity::PAYMENT,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RecordKind::Invoice => "invoices",
            RecordKind::LedgerEntry => "ledger entries",
            RecordKind::Payment => "payments",
        }
    }

    /// Document-type values selecting this kind on the source transaction
    /// entity. Payments live on their own entity and carry no type set.
    fn type_set(&self) -> &'static [&'static str] {
        match self {
            RecordKind::Invoice => &["out_invoice", "in_invoice", "out_refund", "in_refund"],
            RecordKind::LedgerEntry => &["entry"],
            RecordKind::Payment => &[],
        }
    }
}

/// Per-run lookup caches. The same journals, accounts, and currencies repeat
/// across a run; the fallback queries behind them only fire once per key.
/// Owned by one run, dropped with it.
#[derive(Default)]
pub struct RunCaches {
    journal_by_name: HashMap<String, Option<i64>>,
    account_by_source: HashMap<i64, Option<i64>>,
    currency_by_name: HashMap<String, Option<i64>>,
}

/// End-of-run summary for one kind.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub kind: RecordKind,
    pub started_at: DateTime<Utc>,
    /// Records discovered in scope, including already-migrated ones.
    pub total: usize,
    pub migrated: usize,
    pub skipped: usize,
    pub errors: Vec<UnresolvedReference>,
}

impl RunReport {
    pub fn summary(&self) -> String {
        format!(
            "{}: {} in scope, {} migrated, {} skipped",
            self.kind.label(),
            self.total,
            self.migrated,
            self.skipped
        )
    }

    /// First `limit` error details, one per line.
    pub fn error_detail(&self, limit: usize) -> Vec<String> {
        self.errors.iter().take(limit).map(|e| e.describe()).collect()
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct MigrationPipeline<'a> {
    source: &'a dyn RecordConnector,
    target: &'a dyn RecordConnector,
    store: &'a MappingStore,
    refmap: &'a ReferenceMap,
    config: &'a MigrationConfig,
    source_schema: SourceSchema,
    target_schema: TargetSchema,
    matcher: LineMatcher,
}

impl<'a> MigrationPipeline<'a> {
    pub fn new(
        source: &'a dyn RecordConnector,
        target: &'a dyn RecordConnector,
        store: &'a MappingStore,
        refmap: &'a ReferenceMap,
        config: &'a MigrationConfig,
        source_schema: SourceSchema,
        target_schema: TargetSchema,
    ) -> Self {
        MigrationPipeline {
            source,
            target,
            store,
            refmap,
            config,
            source_schema,
            target_schema,
            matcher: LineMatcher::new(),
        }
    }

    /// Migrate every unprocessed record of one kind. Re-runs resume from
    /// the mapping store's frontier and migrate nothing twice.
    pub fn run(&self, kind: RecordKind) -> Result<RunReport> {
        let started_at = Utc::now();
        let discovered = self.discover(kind)?;
        let already_migrated = self.store.migrated_set(kind.store_kind())?;

        let total = discovered.len();
        let pending: Vec<Record> = discovered
            .into_iter()
            .filter(|r| !already_migrated.contains(&record_id(r)))
            .collect();

        info!(
            kind = kind.label(),
            total,
            pending = pending.len(),
            "migration run starting"
        );

        let mut caches = RunCaches::default();
        let mut report = RunReport {
            run_id: Uuid::new_v4(),
            kind,
            started_at,
            total,
            migrated: 0,
            skipped: 0,
            errors: Vec::new(),
        };

        for batch in pending.chunks(self.config.batch_size.max(1)) {
            for record in batch {
                let source_id = record_id(record);
                let name = str_field(record, "name").unwrap_or("").to_string();

                match self.process_record(kind, record, &mut caches) {
                    Ok(Ok(target_id)) => {
                        self.store
                            .put(kind.store_kind(), source_id, target_id, Some(&name))?;
                        report.migrated += 1;
                    }
                    Ok(Err(reason)) => {
                        debug!(source_id, reason = %reason.describe(), "record skipped");
                        report.errors.push(UnresolvedReference::new(source_id, name, reason));
                        report.skipped += 1;
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        report.errors.push(UnresolvedReference::new(
                            source_id,
                            name,
                            SkipReason::create_rejected(e.to_string()),
                        ));
                        report.skipped += 1;
                    }
                }
            }
        }

        info!(kind = kind.label(), summary = %report.summary(), "migration run finished");
        for detail in report.error_detail(self.config.error_report_limit) {
            warn!(kind = kind.label(), %detail, "record not migrated");
        }
        Ok(report)
    }

    /// All posted source records of this kind inside the migration scope,
    /// id ascending so re-runs walk the same stable frontier.
    fn discover(&self, kind: RecordKind) -> Result<Vec<Record>> {
        if kind == RecordKind::Payment {
            let filter = Filter::new()
                .eq("company_id", self.config.company_id)
                .eq("state", "posted")
                .ge(&self.source_schema.payment_date_field, self.config.start_date_str());
            let fields = [
                "name",
                "payment_type",
                "partner_type",
                "partner_id",
                "journal_id",
                "amount",
                "currency_id",
                self.source_schema.payment_date_field.as_str(),
            ];
            return self.source.find(
                &self.source_schema.payment_entity,
                &filter,
                &fields,
                0,
                None,
                Order::IdAsc,
            );
        }

        let types: Vec<Value> = kind.type_set().iter().map(|t| Value::from(*t)).collect();
        let filter = Filter::new()
            .eq("company_id", self.config.company_id)
            .eq("state", "posted")
            .ge("date", self.config.start_date_str())
            .is_in(&self.source_schema.type_field, types);
        let fields = [
            "name",
            self.source_schema.type_field.as_str(),
            "partner_id",
            "journal_id",
            "currency_id",
            "invoice_date",
            "date",
            "ref",
            "narration",
        ];
        self.source.find(
            &self.source_schema.transaction_entity,
            &filter,
            &fields,
            0,
            None,
            Order::IdAsc,
        )
    }

    fn process_record(
        &self,
        kind: RecordKind,
        record: &Record,
        caches: &mut RunCaches,
    ) -> Result<Outcome<i64>> {
        match kind {
            RecordKind::Payment => self.migrate_payment(record, caches),
            _ => self.migrate_transaction(kind, record, caches),
        }
    }

    // ------------------------------------------------------------------
    // Transaction documents (invoices, ledger entries)
    // ------------------------------------------------------------------

    fn migrate_transaction(
        &self,
        kind: RecordKind,
        record: &Record,
        caches: &mut RunCaches,
    ) -> Result<Outcome<i64>> {
        let source_id = record_id(record);
        let mut draft = Record::new();

        // Party. Mandatory for invoices, optional on plain entries.
        match ref_id(record, "partner_id") {
            Some(partner_id) => match self.store.target_for(entity::PARTNER, partner_id)? {
                Some(mapped) => {
                    draft.insert("partner_id".to_string(), Value::from(mapped));
                }
                None if kind == RecordKind::Invoice => {
                    return Ok(Err(SkipReason::PartnerNotMigrated { partner_id }));
                }
                None => {}
            },
            None if kind == RecordKind::Invoice => {
                return Ok(Err(SkipReason::PartnerNotMigrated { partner_id: 0 }));
            }
            None => {}
        }

        let journal = match self.resolve_journal(record, caches)? {
            Ok(journal) => journal,
            Err(reason) => return Ok(Err(reason)),
        };
        draft.insert("journal_id".to_string(), Value::from(journal));

        if let Some(currency) = self.resolve_currency(record, caches)? {
            draft.insert("currency_id".to_string(), Value::from(currency));
        }

        if let Some(doc_type) = str_field(record, &self.source_schema.type_field) {
            draft.insert(
                self.target_schema.type_field.clone(),
                Value::from(doc_type),
            );
        }
        for field in ["invoice_date", "date", "ref", "narration"] {
            if let Some(value) = str_field(record, field) {
                draft.insert(field.to_string(), Value::from(value));
            }
        }
        draft.insert(
            self.target_schema.back_reference_field.clone(),
            Value::from(source_id),
        );

        // Lines. Invoices submit principal lines only; the target computes
        // its own tax and receivable lines. Entries submit everything.
        let lines = self.source.find(
            &self.source_schema.line_entity,
            &Filter::new().eq("move_id", source_id),
            &[],
            0,
            None,
            Order::IdAsc,
        )?;

        let mut drafts: Vec<Value> = Vec::new();
        for line in &lines {
            if kind == RecordKind::Invoice && bool_field(line, &self.source_schema.invoice_tab_flag)
            {
                continue;
            }
            match self.translate_line(kind, line, caches)? {
                Ok(line_draft) => drafts.push(json!([0, 0, line_draft])),
                Err(reason) => return Ok(Err(reason)),
            }
        }

        let line_key = match kind {
            RecordKind::Invoice => "invoice_line_ids",
            _ => "line_ids",
        };
        draft.insert(line_key.to_string(), Value::Array(drafts));

        // Single atomic creation through the target's helper operation.
        let target_id = match self.target.invoke(
            &self.target_schema.creation_helper_entity,
            &self.target_schema.creation_helper_operation,
            &[Value::Object(draft)],
        ) {
            Ok(response) => match response.as_i64() {
                Some(id) => id,
                None => {
                    return Ok(Err(SkipReason::create_rejected(format!(
                        "creation helper returned {}",
                        response
                    ))))
                }
            },
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => return Ok(Err(SkipReason::create_rejected(e.to_string()))),
        };

        self.post(&self.target_schema.transaction_entity, target_id)?;

        // The target generated its own automatic lines; bind them back to
        // the source lines they replicate.
        if kind == RecordKind::Invoice {
            self.bind_automatic_lines(source_id, target_id)?;
        }

        Ok(Ok(target_id))
    }

    fn translate_line(
        &self,
        kind: RecordKind,
        line: &Record,
        caches: &mut RunCaches,
    ) -> Result<Outcome<Record>> {
        let line_id = record_id(line);
        let mut draft = Record::new();

        if let Some(name) = str_field(line, "name") {
            draft.insert("name".to_string(), Value::from(name));
        }

        let account = match self.resolve_account(line, caches)? {
            Ok(account) => account,
            Err(reason) => return Ok(Err(reason)),
        };
        draft.insert("account_id".to_string(), Value::from(account));

        match kind {
            RecordKind::Invoice => {
                if line.contains_key("quantity") {
                    draft.insert("quantity".to_string(), Value::from(num_field(line, "quantity")));
                }
                if line.contains_key("price_unit") {
                    draft.insert(
                        "price_unit".to_string(),
                        Value::from(num_field(line, "price_unit")),
                    );
                }

                let mut taxes: Vec<i64> = Vec::new();
                for tax_id in ids_field(line, "tax_ids") {
                    match self.refmap.target_tax(tax_id) {
                        Some(mapped) => taxes.push(mapped),
                        None => return Ok(Err(SkipReason::TaxNotMapped { tax_id })),
                    }
                }
                if !taxes.is_empty() {
                    draft.insert("tax_ids".to_string(), json!([[6, 0, taxes]]));
                }

                if let Some(product_id) = ref_id(line, "product_id") {
                    match self.store.target_for(entity::PRODUCT, product_id)? {
                        Some(mapped) => {
                            draft.insert("product_id".to_string(), Value::from(mapped));
                        }
                        None => debug!(line_id, product_id, "product not migrated, dropped"),
                    }
                }

                // Custom party-role field, distinct from the document party.
                // Unmapped roles are dropped, the document still migrates.
                if let Some(role_id) = ref_id(line, &self.source_schema.party_role_field) {
                    match self.store.target_for(entity::PARTNER, role_id)? {
                        Some(mapped) => {
                            draft.insert(
                                self.target_schema.party_role_field.clone(),
                                Value::from(mapped),
                            );
                        }
                        None => debug!(line_id, role_id, "party role not migrated, dropped"),
                    }
                }
            }
            _ => {
                draft.insert("debit".to_string(), Value::from(num_field(line, "debit")));
                draft.insert("credit".to_string(), Value::from(num_field(line, "credit")));
                if let Some(partner_id) = ref_id(line, "partner_id") {
                    if let Some(mapped) = self.store.target_for(entity::PARTNER, partner_id)? {
                        draft.insert("partner_id".to_string(), Value::from(mapped));
                    }
                }
            }
        }

        // Supplied lines carry their back-reference from the start.
        draft.insert(
            self.target_schema.back_reference_field.clone(),
            Value::from(line_id),
        );

        Ok(Ok(draft))
    }

    /// Run the line matcher over the created transaction's automatic lines
    /// and stamp the winning back-references.
    fn bind_automatic_lines(&self, source_id: i64, target_id: i64) -> Result<()> {
        let oracle: Vec<SourceLine> = self
            .source
            .find(
                &self.source_schema.line_entity,
                &Filter::new()
                    .eq("move_id", source_id)
                    .eq(&self.source_schema.invoice_tab_flag, true),
                &[],
                0,
                None,
                Order::IdAsc,
            )?
            .iter()
            .map(SourceLine::from_record)
            .collect();

        let created = self.target.find(
            &self.target_schema.line_entity,
            &Filter::new().eq("move_id", target_id),
            &[],
            0,
            None,
            Order::IdAsc,
        )?;
        let automatic: Vec<TargetLine> = created
            .iter()
            .filter(|line| ref_id(line, &self.target_schema.back_reference_field).is_none())
            .map(TargetLine::from_record)
            .collect();

        let outcome = self.matcher.match_lines(&automatic, oracle, self.refmap);
        for binding in &outcome.bindings {
            let mut values = Record::new();
            values.insert(
                self.target_schema.back_reference_field.clone(),
                Value::from(binding.source_line_id),
            );
            self.target
                .update(&self.target_schema.line_entity, &[binding.target_line_id], &values)?;
        }

        if !outcome.unbound_targets.is_empty() {
            warn!(
                source_id,
                target_id,
                unbound = ?outcome.unbound_targets,
                "automatic lines left without back-reference"
            );
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Payments
    // ------------------------------------------------------------------

    fn migrate_payment(&self, record: &Record, caches: &mut RunCaches) -> Result<Outcome<i64>> {
        let source_id = record_id(record);

        let partner = match ref_id(record, "partner_id") {
            Some(partner_id) => match self.store.target_for(entity::PARTNER, partner_id)? {
                Some(mapped) => mapped,
                None => return Ok(Err(SkipReason::PartnerNotMigrated { partner_id })),
            },
            None => return Ok(Err(SkipReason::PartnerNotMigrated { partner_id: 0 })),
        };

        let journal = match self.resolve_journal(record, caches)? {
            Ok(journal) => journal,
            Err(reason) => return Ok(Err(reason)),
        };

        let mut draft = Record::new();
        draft.insert("partner_id".to_string(), Value::from(partner));
        draft.insert("journal_id".to_string(), Value::from(journal));
        draft.insert("amount".to_string(), Value::from(num_field(record, "amount")));
        for field in ["payment_type", "partner_type"] {
            if let Some(value) = str_field(record, field) {
                draft.insert(field.to_string(), Value::from(value));
            }
        }
        // The payment date field was renamed on the target.
        if let Some(date) = str_field(record, &self.source_schema.payment_date_field) {
            draft.insert(
                self.target_schema.payment_date_field.clone(),
                Value::from(date),
            );
        }
        draft.insert(
            self.target_schema.back_reference_field.clone(),
            Value::from(source_id),
        );

        let target_id = match self.target.create(&self.target_schema.payment_entity, &draft) {
            Ok(id) => id,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => return Ok(Err(SkipReason::create_rejected(e.to_string()))),
        };

        self.post(&self.target_schema.payment_entity, target_id)?;

        Ok(Ok(target_id))
    }

    // ------------------------------------------------------------------
    // Reference resolution with per-run caches
    // ------------------------------------------------------------------

    /// Post/confirm the created record. Some targets return nothing usable
    /// here even on success, so failures are logged and tolerated.
    fn post(&self, target_entity: &str, target_id: i64) -> Result<()> {
        match self.target.invoke(
            target_entity,
            &self.target_schema.post_operation,
            &[json!([target_id])],
        ) {
            Ok(_) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(target_id, error = %e, "post transition failed, continuing");
                Ok(())
            }
        }
    }

    fn resolve_journal(&self, record: &Record, caches: &mut RunCaches) -> Result<Outcome<i64>> {
        let journal_id = match ref_id(record, "journal_id") {
            Some(id) => id,
            None => {
                return Ok(Err(SkipReason::JournalNotMapped {
                    journal_id: 0,
                    name: String::new(),
                }))
            }
        };

        if let Some(mapped) = self.refmap.target_journal(journal_id) {
            return Ok(Ok(mapped));
        }

        // Name fallback straight against the target, cached per run.
        let name = ref_label(record, "journal_id").unwrap_or("").to_string();
        let miss = SkipReason::JournalNotMapped {
            journal_id,
            name: name.clone(),
        };
        if name.is_empty() {
            return Ok(Err(miss));
        }

        if let Some(cached) = caches.journal_by_name.get(&name) {
            return Ok((*cached).ok_or(miss));
        }

        let found = self
            .target
            .find_one(
                &self.target_schema.journal_entity,
                &Filter::new().like("name", &name),
                &["name"],
            )?
            .map(|r| record_id(&r));
        caches.journal_by_name.insert(name, found);
        Ok(found.ok_or(miss))
    }

    /// Currency by display name against the target. A miss drops the field
    /// and lets the target apply its company default.
    fn resolve_currency(&self, record: &Record, caches: &mut RunCaches) -> Result<Option<i64>> {
        let name = match ref_label(record, "currency_id") {
            Some(name) => name.to_string(),
            None => return Ok(None),
        };

        if let Some(cached) = caches.currency_by_name.get(&name) {
            return Ok(*cached);
        }

        let found = self
            .target
            .find_one(
                &self.target_schema.currency_entity,
                &Filter::new().eq("name", name.as_str()),
                &["name"],
            )?
            .map(|r| record_id(&r));
        if found.is_none() {
            debug!(currency = %name, "currency not found on target, field dropped");
        }
        caches.currency_by_name.insert(name, found);
        Ok(found)
    }

    fn resolve_account(&self, line: &Record, caches: &mut RunCaches) -> Result<Outcome<i64>> {
        let account_id = match ref_id(line, "account_id") {
            Some(id) => id,
            None => {
                return Ok(Err(SkipReason::AccountNotMapped {
                    account_id: 0,
                    name: String::new(),
                }))
            }
        };

        if let Some(mapped) = self.refmap.target_account(account_id) {
            return Ok(Ok(mapped));
        }

        let name = ref_label(line, "account_id").unwrap_or("").to_string();
        let miss = SkipReason::AccountNotMapped {
            account_id,
            name: name.clone(),
        };

        if let Some(cached) = caches.account_by_source.get(&account_id) {
            return Ok((*cached).ok_or(miss));
        }

        // Fallback: the source account's display name first, its code
        // second, both straight against the target.
        let mut found = None;
        let accounts = self.source.read_by_id(
            &self.source_schema.account_entity,
            &[account_id],
            &["name", "code"],
        )?;
        if let Some(account) = accounts.first() {
            if let Some(account_name) = str_field(account, "name") {
                found = self
                    .target
                    .find_one(
                        &self.target_schema.account_entity,
                        &Filter::new().eq("name", account_name),
                        &["name"],
                    )?
                    .map(|r| record_id(&r));
            }
            if found.is_none() {
                if let Some(code) = str_field(account, "code") {
                    found = self
                        .target
                        .find_one(
                            &self.target_schema.account_entity,
                            &Filter::new().eq("code", code),
                            &["code"],
                        )?
                        .map(|r| record_id(&r));
                }
            }
        }

        caches.account_by_source.insert(account_id, found);
        Ok(found.ok_or(miss))
    }
}

// ============================================================================
// TESTS
// ============================================================================
