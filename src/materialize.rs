// Missing-Entity Materializer - creates target configuration entities that
// the reference mapper reported as absent.
//
// In practice only journals need this; taxes and accounts that are missing
// require an accountant's decision, not an automatic create. A journal that
// fails to create is reported and skipped so the rest of the batch still
// lands.

use serde_json::Value;
use tracing::warn;

use crate::config::MigrationConfig;
use crate::connector::{record_id, ref_id, str_field, Filter, Record, RecordConnector};
use crate::error::{truncate_message, Result};
use crate::refmap::{ReferenceKind, ReferenceMap, ReferencePairing};
use crate::schema::{kind, SourceSchema, TargetSchema};
use crate::tracking::MappingStore;

/// Outcome of one materialization pass.
#[derive(Debug, Default)]
pub struct MaterializeReport {
    pub created: Vec<ReferencePairing>,
    pub failed: Vec<(i64, String, String)>,
}

impl MaterializeReport {
    pub fn summary(&self) -> String {
        format!(
            "journals created: {}, failed: {}",
            self.created.len(),
            self.failed.len()
        )
    }
}

/// Create every source journal the mapper could not pair, then record the
/// new pairings in both the reference map and the mapping store.
pub fn materialize_missing_journals(
    source: &dyn RecordConnector,
    target: &dyn RecordConnector,
    store: &MappingStore,
    refmap: &mut ReferenceMap,
    config: &MigrationConfig,
    source_schema: &SourceSchema,
    target_schema: &TargetSchema,
) -> Result<MaterializeReport> {
    let missing: Vec<i64> = refmap
        .unmatched_of(ReferenceKind::Journal)
        .iter()
        .map(|u| u.source_id)
        .collect();

    let mut report = MaterializeReport::default();
    if missing.is_empty() {
        return Ok(report);
    }

    let journals = source.read_by_id(
        &source_schema.journal_entity,
        &missing,
        &[
            "name",
            "code",
            "type",
            &source_schema.default_debit_account_field,
            &source_schema.default_credit_account_field,
        ],
    )?;

    for journal in &journals {
        let source_id = record_id(journal);
        let name = str_field(journal, "name").unwrap_or("").to_string();
        let code = str_field(journal, "code").unwrap_or("").to_string();

        let mut values = Record::new();
        values.insert("name".to_string(), Value::from(name.clone()));
        values.insert("code".to_string(), Value::from(code.clone()));
        if let Some(journal_type) = str_field(journal, "type") {
            values.insert("type".to_string(), Value::from(journal_type));
        }
        values.insert("company_id".to_string(), Value::from(config.company_id));

        // The source keeps separate debit/credit defaults; the target has a
        // single default-account field. Debit side preferred.
        if let Some(account_id) =
            resolve_default_account(source, target, refmap, journal, source_schema, target_schema)?
        {
            values.insert(
                target_schema.default_account_field.clone(),
                Value::from(account_id),
            );
        }

        match target.create(&target_schema.journal_entity, &values) {
            Ok(new_id) => {
                let pairing = ReferencePairing {
                    source_id,
                    target_id: new_id,
                    source_name: name,
                    target_name: str_field(journal, "name").unwrap_or("").to_string(),
                    match_key: code.clone(),
                };
                refmap.insert(ReferenceKind::Journal, pairing.clone());
                store.put(kind::JOURNAL, source_id, new_id, Some(&code))?;
                report.created.push(pairing);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(source_id, journal = %name, error = %e, "journal creation failed");
                report
                    .failed
                    .push((source_id, name, truncate_message(&e.to_string())));
            }
        }
    }

    // Created journals are no longer unmatched.
    let created_ids: Vec<i64> = report.created.iter().map(|p| p.source_id).collect();
    refmap
        .unmatched
        .retain(|u| u.kind != ReferenceKind::Journal || !created_ids.contains(&u.source_id));

    Ok(report)
}

/// Pick the target default account: mapped debit-side account if present,
/// else credit-side, else a code lookup straight against the target.
fn resolve_default_account(
    source: &dyn RecordConnector,
    target: &dyn RecordConnector,
    refmap: &ReferenceMap,
    journal: &Record,
    source_schema: &SourceSchema,
    target_schema: &TargetSchema,
) -> Result<Option<i64>> {
    let debit = ref_id(journal, &source_schema.default_debit_account_field);
    let credit = ref_id(journal, &source_schema.default_credit_account_field);

    for source_account in [debit, credit].into_iter().flatten() {
        if let Some(mapped) = refmap.target_account(source_account) {
            return Ok(Some(mapped));
        }

        // Fallback: fetch the source account's code and look it up on the
        // target directly. Costly, but only runs for a handful of journals.
        let accounts =
            source.read_by_id(&source_schema.account_entity, &[source_account], &["code"])?;
        if let Some(code) = accounts.first().and_then(|a| str_field(a, "code")) {
            if let Some(found) = target.find_one(
                &target_schema.account_entity,
                &Filter::new().eq("code", code),
                &["code"],
            )? {
                return Ok(Some(record_id(&found)));
            }
        }
    }

    Ok(None)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::MemoryConnector;
    use crate::refmap::UnmatchedEntry;
    use serde_json::json;

    fn record(pairs: &[(&str, serde_json::Value)]) -> Record {
        let mut r = Record::new();
        for (k, v) in pairs {
            r.insert(k.to_string(), v.clone());
        }
        r
    }

    fn unmatched_journal(source_id: i64, code: &str) -> UnmatchedEntry {
        UnmatchedEntry {
            kind: ReferenceKind::Journal,
            source_id,
            name: format!("Journal {}", code),
            match_key: code.to_string(),
        }
    }

    #[test]
    fn test_creates_missing_journal_with_debit_default() {
        let source = MemoryConnector::new();
        let target = MemoryConnector::new();
        let store = MappingStore::open_in_memory().unwrap();

        source.seed(
            "account.journal",
            4,
            record(&[
                ("name", json!("Bank Secondary")),
                ("code", json!("BNK2")),
                ("type", json!("bank")),
                ("default_debit_account_id", json!([70, "572 Bank"])),
                ("default_credit_account_id", json!([71, "572 Bank out"])),
            ]),
        );

        let mut refmap = ReferenceMap::default();
        refmap.unmatched.push(unmatched_journal(4, "BNK2"));
        refmap.insert(
            ReferenceKind::Account,
            ReferencePairing {
                source_id: 70,
                target_id: 700,
                source_name: "572 Bank".to_string(),
                target_name: "572 Bank".to_string(),
                match_key: "572".to_string(),
            },
        );

        let report = materialize_missing_journals(
            &source,
            &target,
            &store,
            &mut refmap,
            &MigrationConfig::default(),
            &SourceSchema::default(),
            &TargetSchema::default(),
        )
        .unwrap();

        assert_eq!(report.created.len(), 1);
        let new_id = report.created[0].target_id;
        assert_eq!(refmap.target_journal(4), Some(new_id));
        assert_eq!(store.target_for(kind::JOURNAL, 4).unwrap(), Some(new_id));
        assert!(refmap.unmatched_of(ReferenceKind::Journal).is_empty());

        // The created journal carries the debit-side default account.
        let created = target
            .read_by_id("account.journal", &[new_id], &[])
            .unwrap();
        assert_eq!(created[0]["default_account_id"], json!(700));
    }

    #[test]
    fn test_falls_back_to_credit_then_code_lookup() {
        let source = MemoryConnector::new();
        let target = MemoryConnector::new();
        let store = MappingStore::open_in_memory().unwrap();

        source.seed(
            "account.journal",
            4,
            record(&[
                ("name", json!("Cash")),
                ("code", json!("CSH1")),
                ("type", json!("cash")),
                ("default_debit_account_id", json!(false)),
                ("default_credit_account_id", json!([80, "570 Cash"])),
            ]),
        );
        source.seed("account.account", 80, record(&[("code", json!("570"))]));
        target.seed("account.account", 800, record(&[("code", json!("570"))]));

        let mut refmap = ReferenceMap::default();
        refmap.unmatched.push(unmatched_journal(4, "CSH1"));

        let report = materialize_missing_journals(
            &source,
            &target,
            &store,
            &mut refmap,
            &MigrationConfig::default(),
            &SourceSchema::default(),
            &TargetSchema::default(),
        )
        .unwrap();

        assert_eq!(report.created.len(), 1);
        let created = target
            .read_by_id("account.journal", &[report.created[0].target_id], &[])
            .unwrap();
        assert_eq!(created[0]["default_account_id"], json!(800));
    }

    #[test]
    fn test_nothing_to_do() {
        let source = MemoryConnector::new();
        let target = MemoryConnector::new();
        let store = MappingStore::open_in_memory().unwrap();
        let mut refmap = ReferenceMap::default();

        let report = materialize_missing_journals(
            &source,
            &target,
            &store,
            &mut refmap,
            &MigrationConfig::default(),
            &SourceSchema::default(),
            &TargetSchema::default(),
        )
        .unwrap();

        assert!(report.created.is_empty());
        assert!(report.failed.is_empty());
    }
}
