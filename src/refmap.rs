// Reference Data Mapper - equivalence tables between source and target
// configuration entities.
//
// Taxes pair on (rate, usage), accounts and journals on code. The mapper is
// read-only: it reports what matched, what is ambiguous, and what is missing;
// creating missing entities is the materializer's job. Recomputed each
// session from live reads, optionally persisted to a JSON side file keyed by
// string-encoded source id for reuse and manual auditing.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::warn;

use crate::config::MigrationConfig;
use crate::connector::{num_field, record_id, str_field, Filter, Order, Record, RecordConnector};
use crate::error::{MigrationError, Result};
use crate::schema::{SourceSchema, TargetSchema};

/// Entity kinds the mapper covers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ReferenceKind {
    Tax,
    Account,
    Journal,
}

impl ReferenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceKind::Tax => "tax",
            ReferenceKind::Account => "account",
            ReferenceKind::Journal => "journal",
        }
    }
}

/// One established source/target equivalence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferencePairing {
    pub source_id: i64,
    pub target_id: i64,
    pub source_name: String,
    pub target_name: String,
    pub match_key: String,
}

/// A source entity with no equivalent on the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmatchedEntry {
    pub kind: ReferenceKind,
    pub source_id: i64,
    pub name: String,
    pub match_key: String,
}

/// A match key with several target candidates. The first in read order was
/// chosen; the full candidate list is kept so an operator override can
/// resolve the collision explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbiguousMatch {
    pub kind: ReferenceKind,
    pub source_id: i64,
    pub name: String,
    pub match_key: String,
    pub candidates: Vec<i64>,
    pub chosen: i64,
}

// ============================================================================
// REFERENCE MAP
// ============================================================================

/// Per-kind equivalence tables plus diagnostics. Keys are string-encoded
/// source ids, matching the side-file format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferenceMap {
    pub taxes: BTreeMap<String, ReferencePairing>,
    pub accounts: BTreeMap<String, ReferencePairing>,
    pub journals: BTreeMap<String, ReferencePairing>,

    #[serde(default)]
    pub unmatched: Vec<UnmatchedEntry>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ambiguous: Vec<AmbiguousMatch>,
}

impl ReferenceMap {
    pub fn target_tax(&self, source_id: i64) -> Option<i64> {
        self.taxes.get(&source_id.to_string()).map(|p| p.target_id)
    }

    pub fn target_account(&self, source_id: i64) -> Option<i64> {
        self.accounts.get(&source_id.to_string()).map(|p| p.target_id)
    }

    pub fn target_journal(&self, source_id: i64) -> Option<i64> {
        self.journals.get(&source_id.to_string()).map(|p| p.target_id)
    }

    pub fn insert(&mut self, kind: ReferenceKind, pairing: ReferencePairing) {
        let key = pairing.source_id.to_string();
        match kind {
            ReferenceKind::Tax => self.taxes.insert(key, pairing),
            ReferenceKind::Account => self.accounts.insert(key, pairing),
            ReferenceKind::Journal => self.journals.insert(key, pairing),
        };
    }

    pub fn unmatched_of(&self, kind: ReferenceKind) -> Vec<&UnmatchedEntry> {
        self.unmatched.iter().filter(|u| u.kind == kind).collect()
    }

    /// Persist to a JSON side file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| MigrationError::SideFile(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| MigrationError::SideFile(e.to_string()))
    }

    /// Load a previously saved side file.
    pub fn load(path: &Path) -> Result<Self> {
        let json =
            std::fs::read_to_string(path).map_err(|e| MigrationError::SideFile(e.to_string()))?;
        serde_json::from_str(&json).map_err(|e| MigrationError::SideFile(e.to_string()))
    }

    pub fn summary(&self) -> String {
        format!(
            "taxes: {}, accounts: {}, journals: {}, unmatched: {}, ambiguous: {}",
            self.taxes.len(),
            self.accounts.len(),
            self.journals.len(),
            self.unmatched.len(),
            self.ambiguous.len()
        )
    }
}

// ============================================================================
// MAPPER
// ============================================================================

/// Builds a ReferenceMap from live source/target reads.
pub struct ReferenceMapper {
    company_id: i64,
    source_schema: SourceSchema,
    target_schema: TargetSchema,
}

impl ReferenceMapper {
    pub fn new(config: &MigrationConfig, source_schema: SourceSchema, target_schema: TargetSchema) -> Self {
        ReferenceMapper {
            company_id: config.company_id,
            source_schema,
            target_schema,
        }
    }

    /// Build equivalence tables for all three kinds.
    ///
    /// `overrides` (typically a loaded side file) wins over the heuristics:
    /// a source entity already paired there keeps that pairing untouched.
    pub fn build(
        &self,
        source: &dyn RecordConnector,
        target: &dyn RecordConnector,
        overrides: Option<&ReferenceMap>,
    ) -> Result<ReferenceMap> {
        let mut map = ReferenceMap::default();
        self.map_taxes(source, target, overrides, &mut map)?;
        self.map_accounts(source, target, overrides, &mut map)?;
        self.map_journals(source, target, overrides, &mut map)?;
        Ok(map)
    }

    /// Tax key: rate at fixed precision plus usage type. Several taxes may
    /// legitimately share a key; the first target candidate in read order
    /// wins and the collision is reported.
    fn tax_key(record: &Record) -> String {
        let amount = num_field(record, "amount");
        let usage = str_field(record, "type_tax_use").unwrap_or("");
        format!("{:.4}|{}", amount, usage)
    }

    fn map_taxes(
        &self,
        source: &dyn RecordConnector,
        target: &dyn RecordConnector,
        overrides: Option<&ReferenceMap>,
        map: &mut ReferenceMap,
    ) -> Result<()> {
        let company = Filter::new().eq("company_id", self.company_id);
        let fields = ["name", "type_tax_use", "amount"];

        let source_taxes = source.find(
            &self.source_schema.tax_entity,
            &company,
            &fields,
            0,
            None,
            Order::IdAsc,
        )?;
        let target_taxes = target.find(
            &self.target_schema.tax_entity,
            &company,
            &fields,
            0,
            None,
            Order::IdAsc,
        )?;

        // Bucket target taxes by key, preserving read order within a bucket.
        let mut buckets: HashMap<String, Vec<&Record>> = HashMap::new();
        for tax in &target_taxes {
            buckets.entry(Self::tax_key(tax)).or_default().push(tax);
        }

        for tax in &source_taxes {
            let source_id = record_id(tax);
            let name = str_field(tax, "name").unwrap_or("").to_string();
            let key = Self::tax_key(tax);

            if let Some(kept) = lookup_override(overrides, ReferenceKind::Tax, source_id) {
                map.insert(ReferenceKind::Tax, kept);
                continue;
            }

            match buckets.get(&key) {
                Some(candidates) if !candidates.is_empty() => {
                    let chosen = candidates[0];
                    if candidates.len() > 1 {
                        let candidate_ids: Vec<i64> =
                            candidates.iter().map(|c| record_id(c)).collect();
                        warn!(
                            source_id,
                            match_key = %key,
                            ?candidate_ids,
                            "ambiguous tax match, first candidate chosen"
                        );
                        map.ambiguous.push(AmbiguousMatch {
                            kind: ReferenceKind::Tax,
                            source_id,
                            name: name.clone(),
                            match_key: key.clone(),
                            candidates: candidate_ids,
                            chosen: record_id(chosen),
                        });
                    }
                    map.insert(
                        ReferenceKind::Tax,
                        ReferencePairing {
                            source_id,
                            target_id: record_id(chosen),
                            source_name: name,
                            target_name: str_field(chosen, "name").unwrap_or("").to_string(),
                            match_key: key,
                        },
                    );
                }
                _ => map.unmatched.push(UnmatchedEntry {
                    kind: ReferenceKind::Tax,
                    source_id,
                    name,
                    match_key: key,
                }),
            }
        }

        Ok(())
    }

    fn map_accounts(
        &self,
        source: &dyn RecordConnector,
        target: &dyn RecordConnector,
        overrides: Option<&ReferenceMap>,
        map: &mut ReferenceMap,
    ) -> Result<()> {
        let fields = ["code", "name"];

        let source_accounts = source.find(
            &self.source_schema.account_entity,
            &Filter::new().eq("company_id", self.company_id),
            &fields,
            0,
            None,
            Order::IdAsc,
        )?;

        // Target accounts lost company scoping in the newer schema; read
        // unfiltered unless the profile says otherwise.
        let target_filter = if self.target_schema.company_scoped_accounts {
            Filter::new().eq("company_id", self.company_id)
        } else {
            Filter::new()
        };
        let target_accounts = target.find(
            &self.target_schema.account_entity,
            &target_filter,
            &fields,
            0,
            None,
            Order::IdAsc,
        )?;

        let mut by_code: HashMap<&str, &Record> = HashMap::new();
        for account in target_accounts.iter().rev() {
            // rev() so the first in read order wins on duplicate codes
            if let Some(code) = str_field(account, "code") {
                by_code.insert(code, account);
            }
        }

        self.map_by_code(
            ReferenceKind::Account,
            &source_accounts,
            &by_code,
            overrides,
            map,
        );
        Ok(())
    }

    fn map_journals(
        &self,
        source: &dyn RecordConnector,
        target: &dyn RecordConnector,
        overrides: Option<&ReferenceMap>,
        map: &mut ReferenceMap,
    ) -> Result<()> {
        let company = Filter::new().eq("company_id", self.company_id);
        let fields = ["code", "name", "type"];

        let source_journals = source.find(
            &self.source_schema.journal_entity,
            &company,
            &fields,
            0,
            None,
            Order::IdAsc,
        )?;
        let target_journals = target.find(
            &self.target_schema.journal_entity,
            &company,
            &fields,
            0,
            None,
            Order::IdAsc,
        )?;

        let mut by_code: HashMap<&str, &Record> = HashMap::new();
        for journal in target_journals.iter().rev() {
            if let Some(code) = str_field(journal, "code") {
                by_code.insert(code, journal);
            }
        }

        self.map_by_code(
            ReferenceKind::Journal,
            &source_journals,
            &by_code,
            overrides,
            map,
        );
        Ok(())
    }

    /// Shared code-keyed pairing for accounts and journals. Names may differ
    /// across systems; only the code discriminates.
    fn map_by_code(
        &self,
        kind: ReferenceKind,
        source_records: &[Record],
        target_by_code: &HashMap<&str, &Record>,
        overrides: Option<&ReferenceMap>,
        map: &mut ReferenceMap,
    ) {
        for record in source_records {
            let source_id = record_id(record);
            let name = str_field(record, "name").unwrap_or("").to_string();
            let code = str_field(record, "code").unwrap_or("").to_string();

            if let Some(kept) = lookup_override(overrides, kind, source_id) {
                map.insert(kind, kept);
                continue;
            }

            match target_by_code.get(code.as_str()) {
                Some(found) => map.insert(
                    kind,
                    ReferencePairing {
                        source_id,
                        target_id: record_id(found),
                        source_name: name,
                        target_name: str_field(found, "name").unwrap_or("").to_string(),
                        match_key: code,
                    },
                ),
                None => map.unmatched.push(UnmatchedEntry {
                    kind,
                    source_id,
                    name,
                    match_key: code,
                }),
            }
        }
    }
}

fn lookup_override(
    overrides: Option<&ReferenceMap>,
    kind: ReferenceKind,
    source_id: i64,
) -> Option<ReferencePairing> {
    let overrides = overrides?;
    let key = source_id.to_string();
    let table = match kind {
        ReferenceKind::Tax => &overrides.taxes,
        ReferenceKind::Account => &overrides.accounts,
        ReferenceKind::Journal => &overrides.journals,
    };
    table.get(&key).cloned()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::MemoryConnector;
    use serde_json::json;

    fn record(pairs: &[(&str, serde_json::Value)]) -> Record {
        let mut r = Record::new();
        for (k, v) in pairs {
            r.insert(k.to_string(), v.clone());
        }
        r
    }

    fn mapper() -> ReferenceMapper {
        ReferenceMapper::new(
            &MigrationConfig::default(),
            SourceSchema::default(),
            TargetSchema::default(),
        )
    }

    fn seed_tax(conn: &MemoryConnector, id: i64, name: &str, usage: &str, amount: f64) {
        conn.seed(
            "account.tax",
            id,
            record(&[
                ("name", json!(name)),
                ("type_tax_use", json!(usage)),
                ("amount", json!(amount)),
                ("company_id", json!(1)),
            ]),
        );
    }

    #[test]
    fn test_account_mapped_by_code_name_mismatch_ignored() {
        let source = MemoryConnector::new();
        let target = MemoryConnector::new();
        source.seed(
            "account.account",
            1,
            record(&[("code", json!("570")), ("name", json!("Cash")), ("company_id", json!(1))]),
        );
        // Target account carries no company field at all.
        target.seed(
            "account.account",
            9,
            record(&[("code", json!("570")), ("name", json!("Caja"))]),
        );

        let map = mapper().build(&source, &target, None).unwrap();

        assert_eq!(map.target_account(1), Some(9));
        assert!(map.unmatched.is_empty());
    }

    #[test]
    fn test_ambiguous_tax_picks_first_and_reports() {
        let source = MemoryConnector::new();
        let target = MemoryConnector::new();
        seed_tax(&source, 1, "VAT 21%", "sale", 21.0);
        seed_tax(&target, 5, "VAT 21% (new)", "sale", 21.0);
        seed_tax(&target, 6, "VAT 21% (legacy)", "sale", 21.0);

        let map = mapper().build(&source, &target, None).unwrap();

        assert_eq!(map.target_tax(1), Some(5));
        assert_eq!(map.ambiguous.len(), 1);
        assert_eq!(map.ambiguous[0].candidates, vec![5, 6]);
        assert_eq!(map.ambiguous[0].chosen, 5);
    }

    #[test]
    fn test_unmatched_tax_reported_not_fatal() {
        let source = MemoryConnector::new();
        let target = MemoryConnector::new();
        seed_tax(&source, 1, "VAT 10%", "sale", 10.0);
        seed_tax(&target, 5, "VAT 21%", "sale", 21.0);

        let map = mapper().build(&source, &target, None).unwrap();

        assert_eq!(map.target_tax(1), None);
        assert_eq!(map.unmatched_of(ReferenceKind::Tax).len(), 1);
    }

    #[test]
    fn test_tax_usage_discriminates() {
        let source = MemoryConnector::new();
        let target = MemoryConnector::new();
        seed_tax(&source, 1, "VAT 21% sale", "sale", 21.0);
        seed_tax(&target, 5, "VAT 21% purchase", "purchase", 21.0);

        let map = mapper().build(&source, &target, None).unwrap();

        assert_eq!(map.target_tax(1), None);
    }

    #[test]
    fn test_mapping_is_deterministic() {
        let source = MemoryConnector::new();
        let target = MemoryConnector::new();
        seed_tax(&source, 1, "VAT", "sale", 21.0);
        seed_tax(&target, 5, "VAT a", "sale", 21.0);
        seed_tax(&target, 6, "VAT b", "sale", 21.0);

        let m = mapper();
        let first = m.build(&source, &target, None).unwrap();
        let second = m.build(&source, &target, None).unwrap();

        assert_eq!(first.target_tax(1), second.target_tax(1));
        assert_eq!(first.ambiguous, second.ambiguous);
    }

    #[test]
    fn test_override_wins_over_heuristic() {
        let source = MemoryConnector::new();
        let target = MemoryConnector::new();
        seed_tax(&source, 1, "VAT", "sale", 21.0);
        seed_tax(&target, 5, "VAT a", "sale", 21.0);
        seed_tax(&target, 6, "VAT b", "sale", 21.0);

        let mut overrides = ReferenceMap::default();
        overrides.insert(
            ReferenceKind::Tax,
            ReferencePairing {
                source_id: 1,
                target_id: 6,
                source_name: "VAT".to_string(),
                target_name: "VAT b".to_string(),
                match_key: "operator".to_string(),
            },
        );

        let map = mapper().build(&source, &target, Some(&overrides)).unwrap();
        assert_eq!(map.target_tax(1), Some(6));
    }

    #[test]
    fn test_side_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mappings.json");

        let mut map = ReferenceMap::default();
        map.insert(
            ReferenceKind::Journal,
            ReferencePairing {
                source_id: 3,
                target_id: 30,
                source_name: "Bank".to_string(),
                target_name: "Bank".to_string(),
                match_key: "BNK".to_string(),
            },
        );
        map.save(&path).unwrap();

        let loaded = ReferenceMap::load(&path).unwrap();
        assert_eq!(loaded.target_journal(3), Some(30));
    }
}
