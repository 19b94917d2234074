// Identity Mapping Store - durable record of which source record became
// which target record.
//
// This table is the engine's only cross-run state: re-runs resume by
// subtracting the already-migrated set, and a crash between batches loses
// nothing that was committed. Rows are append-only; nothing mutates or
// deletes them during normal operation.

use rusqlite::{params, Connection, OptionalExtension};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::{MigrationError, Result};

/// One (entity kind, source id, target id) triple.
#[derive(Debug, Clone, PartialEq)]
pub struct MappingRecord {
    pub entity_kind: String,
    pub source_id: i64,
    pub target_id: i64,
    pub label: Option<String>,
}

/// Durable two-way mapping table with an in-process cache.
///
/// The pipeline resolves partners and products per record, and the same
/// keys repeat heavily across a run; the cache keeps those lookups off
/// the database after the first hit.
pub struct MappingStore {
    conn: Connection,
    forward: RefCell<HashMap<(String, i64), i64>>,
    reverse: RefCell<HashMap<(String, i64), i64>>,
}

impl MappingStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        // WAL mode for crash recovery between batches.
        conn.pragma_update(None, "journal_mode", "WAL")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS mapping_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_kind TEXT NOT NULL,
                source_id INTEGER NOT NULL,
                target_id INTEGER NOT NULL,
                label TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(entity_kind, source_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_mapping_target
             ON mapping_records(entity_kind, target_id)",
            [],
        )?;

        Ok(MappingStore {
            conn,
            forward: RefCell::new(HashMap::new()),
            reverse: RefCell::new(HashMap::new()),
        })
    }

    /// Record a mapping. Re-inserting an identical pair succeeds silently;
    /// a pair conflicting with an existing mapping fails.
    pub fn put(
        &self,
        kind: &str,
        source_id: i64,
        target_id: i64,
        label: Option<&str>,
    ) -> Result<()> {
        if let Some(existing) = self.target_for(kind, source_id)? {
            if existing == target_id {
                return Ok(());
            }
            return Err(MigrationError::DuplicateMapping {
                kind: kind.to_string(),
                source_id,
                existing,
                attempted: target_id,
            });
        }

        self.conn.execute(
            "INSERT INTO mapping_records (entity_kind, source_id, target_id, label)
             VALUES (?1, ?2, ?3, ?4)",
            params![kind, source_id, target_id, label],
        )?;

        self.forward
            .borrow_mut()
            .insert((kind.to_string(), source_id), target_id);
        self.reverse
            .borrow_mut()
            .insert((kind.to_string(), target_id), source_id);

        Ok(())
    }

    /// Target id for a source record, if migrated.
    pub fn target_for(&self, kind: &str, source_id: i64) -> Result<Option<i64>> {
        let key = (kind.to_string(), source_id);
        if let Some(target) = self.forward.borrow().get(&key) {
            return Ok(Some(*target));
        }

        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT target_id FROM mapping_records
                 WHERE entity_kind = ?1 AND source_id = ?2",
                params![kind, source_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(target) = found {
            self.forward.borrow_mut().insert(key.clone(), target);
            self.reverse
                .borrow_mut()
                .insert((kind.to_string(), target), source_id);
        }

        Ok(found)
    }

    /// Source id behind a target record, if the target was migrated.
    pub fn source_for(&self, kind: &str, target_id: i64) -> Result<Option<i64>> {
        let key = (kind.to_string(), target_id);
        if let Some(source) = self.reverse.borrow().get(&key) {
            return Ok(Some(*source));
        }

        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT source_id FROM mapping_records
                 WHERE entity_kind = ?1 AND target_id = ?2",
                params![kind, target_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(source) = found {
            self.reverse.borrow_mut().insert(key, source);
            self.forward
                .borrow_mut()
                .insert((kind.to_string(), source), target_id);
        }

        Ok(found)
    }

    pub fn is_migrated(&self, kind: &str, source_id: i64) -> Result<bool> {
        Ok(self.target_for(kind, source_id)?.is_some())
    }

    /// All migrated source ids of a kind - the resume frontier.
    pub fn migrated_set(&self, kind: &str) -> Result<HashSet<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT source_id FROM mapping_records WHERE entity_kind = ?1")?;
        let ids = stmt
            .query_map(params![kind], |row| row.get(0))?
            .collect::<std::result::Result<HashSet<i64>, _>>()?;
        Ok(ids)
    }

    pub fn count(&self, kind: &str) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM mapping_records WHERE entity_kind = ?1",
            params![kind],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Mapping counts per kind, for status reporting.
    pub fn counts_by_kind(&self) -> Result<Vec<(String, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_kind, COUNT(*) FROM mapping_records
             GROUP BY entity_kind ORDER BY entity_kind",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All records of a kind, source-id ascending.
    pub fn records(&self, kind: &str) -> Result<Vec<MappingRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_kind, source_id, target_id, label FROM mapping_records
             WHERE entity_kind = ?1 ORDER BY source_id ASC",
        )?;
        let rows = stmt
            .query_map(params![kind], |row| {
                Ok(MappingRecord {
                    entity_kind: row.get(0)?,
                    source_id: row.get(1)?,
                    target_id: row.get(2)?,
                    label: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Dump the whole store to CSV for manual auditing between runs.
    pub fn export_csv(&self, path: &Path) -> Result<usize> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_kind, source_id, target_id, label FROM mapping_records
             ORDER BY entity_kind, source_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(MappingRecord {
                    entity_kind: row.get(0)?,
                    source_id: row.get(1)?,
                    target_id: row.get(2)?,
                    label: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut writer = csv::Writer::from_path(path).map_err(MigrationError::Export)?;
        writer.write_record(["entity_kind", "source_id", "target_id", "label"])?;
        for record in &rows {
            writer.write_record([
                record.entity_kind.as_str(),
                &record.source_id.to_string(),
                &record.target_id.to_string(),
                record.label.as_deref().unwrap_or(""),
            ])?;
        }
        writer.flush().map_err(|e| MigrationError::Connector(e.to_string()))?;

        Ok(rows.len())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::kind;

    #[test]
    fn test_put_and_lookup_both_directions() {
        let store = MappingStore::open_in_memory().unwrap();
        store.put(kind::PARTNER, 123, 456, Some("ACME")).unwrap();

        assert_eq!(store.target_for(kind::PARTNER, 123).unwrap(), Some(456));
        assert_eq!(store.source_for(kind::PARTNER, 456).unwrap(), Some(123));
        assert!(store.is_migrated(kind::PARTNER, 123).unwrap());
        assert!(!store.is_migrated(kind::PARTNER, 999).unwrap());
    }

    #[test]
    fn test_idempotent_reinsert_succeeds() {
        let store = MappingStore::open_in_memory().unwrap();
        store.put(kind::INVOICE, 10, 20, None).unwrap();
        store.put(kind::INVOICE, 10, 20, None).unwrap();

        assert_eq!(store.count(kind::INVOICE).unwrap(), 1);
    }

    #[test]
    fn test_conflicting_target_is_rejected() {
        let store = MappingStore::open_in_memory().unwrap();
        store.put(kind::INVOICE, 10, 20, None).unwrap();

        let err = store.put(kind::INVOICE, 10, 21, None).unwrap_err();
        match err {
            MigrationError::DuplicateMapping {
                source_id,
                existing,
                attempted,
                ..
            } => {
                assert_eq!(source_id, 10);
                assert_eq!(existing, 20);
                assert_eq!(attempted, 21);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // The original mapping is untouched.
        assert_eq!(store.target_for(kind::INVOICE, 10).unwrap(), Some(20));
    }

    #[test]
    fn test_kinds_are_independent() {
        let store = MappingStore::open_in_memory().unwrap();
        store.put(kind::INVOICE, 10, 20, None).unwrap();
        store.put(kind::PAYMENT, 10, 77, None).unwrap();

        assert_eq!(store.target_for(kind::INVOICE, 10).unwrap(), Some(20));
        assert_eq!(store.target_for(kind::PAYMENT, 10).unwrap(), Some(77));
    }

    #[test]
    fn test_migrated_set() {
        let store = MappingStore::open_in_memory().unwrap();
        store.put(kind::INVOICE, 1, 11, None).unwrap();
        store.put(kind::INVOICE, 2, 12, None).unwrap();
        store.put(kind::PAYMENT, 3, 13, None).unwrap();

        let set = store.migrated_set(kind::INVOICE).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&1));
        assert!(set.contains(&2));
        assert!(!set.contains(&3));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracking.db");

        {
            let store = MappingStore::open(&path).unwrap();
            store.put(kind::PARTNER, 5, 50, Some("reopened")).unwrap();
        }

        let store = MappingStore::open(&path).unwrap();
        assert_eq!(store.target_for(kind::PARTNER, 5).unwrap(), Some(50));
    }

    #[test]
    fn test_export_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.csv");

        let store = MappingStore::open_in_memory().unwrap();
        store.put(kind::TAX, 1, 2, Some("VAT 21%")).unwrap();
        store.put(kind::JOURNAL, 3, 4, None).unwrap();

        let exported = store.export_csv(&path).unwrap();
        assert_eq!(exported, 2);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("VAT 21%"));
        assert!(contents.starts_with("entity_kind,source_id,target_id,label"));
    }
}
