// Record Connector - the capability boundary to an external ERP instance.
//
// The engine never speaks a wire protocol; it calls this trait. Source and
// target systems expose the same surface, the source wrapped in ReadOnly so
// it can never be mutated. MemoryConnector is the in-process reference
// implementation used by every engine test.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::{MigrationError, Result};

/// A record as exchanged with a connector: a dynamic field map.
///
/// Reference fields follow the `[id, "display name"]` pair convention of the
/// underlying RPC model; absent optional fields are `false` on the wire.
pub type Record = serde_json::Map<String, Value>;

// ============================================================================
// RECORD FIELD HELPERS
// ============================================================================

/// Extract the id of a reference field.
///
/// Accepts `[id, "label"]` pairs, bare integers, and treats `false`/`null`
/// as absent.
pub fn ref_id(record: &Record, field: &str) -> Option<i64> {
    match record.get(field) {
        Some(Value::Array(pair)) => pair.first().and_then(Value::as_i64),
        Some(Value::Number(n)) => n.as_i64(),
        _ => None,
    }
}

/// Extract the display label of a `[id, "label"]` reference field.
pub fn ref_label<'a>(record: &'a Record, field: &str) -> Option<&'a str> {
    match record.get(field) {
        Some(Value::Array(pair)) => pair.get(1).and_then(Value::as_str),
        _ => None,
    }
}

pub fn int_field(record: &Record, field: &str) -> Option<i64> {
    record.get(field).and_then(Value::as_i64)
}

pub fn num_field(record: &Record, field: &str) -> f64 {
    record.get(field).and_then(Value::as_f64).unwrap_or(0.0)
}

pub fn str_field<'a>(record: &'a Record, field: &str) -> Option<&'a str> {
    record.get(field).and_then(Value::as_str)
}

/// Boolean flag; absent and `false` are both false.
pub fn bool_field(record: &Record, field: &str) -> bool {
    record.get(field).and_then(Value::as_bool).unwrap_or(false)
}

/// Id list of a multi-reference field (wire form: array of ids).
pub fn ids_field(record: &Record, field: &str) -> Vec<i64> {
    match record.get(field) {
        Some(Value::Array(ids)) => ids.iter().filter_map(Value::as_i64).collect(),
        _ => Vec::new(),
    }
}

/// The id the connector assigned to this record.
pub fn record_id(record: &Record) -> i64 {
    int_field(record, "id").unwrap_or(0)
}

// ============================================================================
// FILTERS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
    In,
    /// Case-insensitive substring match.
    Like,
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub field: String,
    pub op: Op,
    pub value: Value,
}

/// Ordered conjunction of field conditions.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Filter::default()
    }

    fn push(mut self, field: &str, op: Op, value: Value) -> Self {
        self.conditions.push(Condition {
            field: field.to_string(),
            op,
            value,
        });
        self
    }

    pub fn eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.push(field, Op::Eq, value.into())
    }

    pub fn ne(self, field: &str, value: impl Into<Value>) -> Self {
        self.push(field, Op::Ne, value.into())
    }

    pub fn ge(self, field: &str, value: impl Into<Value>) -> Self {
        self.push(field, Op::Ge, value.into())
    }

    pub fn le(self, field: &str, value: impl Into<Value>) -> Self {
        self.push(field, Op::Le, value.into())
    }

    pub fn gt(self, field: &str, value: impl Into<Value>) -> Self {
        self.push(field, Op::Gt, value.into())
    }

    pub fn lt(self, field: &str, value: impl Into<Value>) -> Self {
        self.push(field, Op::Lt, value.into())
    }

    pub fn is_in(self, field: &str, values: Vec<Value>) -> Self {
        self.push(field, Op::In, Value::Array(values))
    }

    pub fn like(self, field: &str, value: &str) -> Self {
        self.push(field, Op::Like, Value::String(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Order {
    IdAsc,
    IdDesc,
}

// ============================================================================
// CONNECTOR TRAIT
// ============================================================================

/// Blocking capability surface over one ERP instance.
///
/// `entity` names a category of business object in that system's own
/// vocabulary; the engine obtains the names from a schema profile rather
/// than hardcoding them.
pub trait RecordConnector {
    /// Authenticate and return the session handle (user id).
    fn authenticate(&self) -> Result<i64>;

    fn count(&self, entity: &str, filter: &Filter) -> Result<usize>;

    fn find(
        &self,
        entity: &str,
        filter: &Filter,
        fields: &[&str],
        offset: usize,
        limit: Option<usize>,
        order: Order,
    ) -> Result<Vec<Record>>;

    fn read_by_id(&self, entity: &str, ids: &[i64], fields: &[&str]) -> Result<Vec<Record>>;

    fn create(&self, entity: &str, values: &Record) -> Result<i64>;

    fn update(&self, entity: &str, ids: &[i64], values: &Record) -> Result<bool>;

    fn delete(&self, entity: &str, ids: &[i64]) -> Result<bool>;

    /// Escape hatch for system-specific operations ("post", "settle", ...).
    fn invoke(&self, entity: &str, operation: &str, args: &[Value]) -> Result<Value>;

    /// `find` with a single-result limit, unwrapped.
    fn find_one(&self, entity: &str, filter: &Filter, fields: &[&str]) -> Result<Option<Record>> {
        let rows = self.find(entity, filter, fields, 0, Some(1), Order::IdAsc)?;
        Ok(rows.into_iter().next())
    }
}

// ============================================================================
// READ-ONLY WRAPPER
// ============================================================================

/// Generic mutating operation names rejected by `invoke` on a read-only
/// connector, in addition to `create`/`update`/`delete` themselves.
const WRITE_OPERATIONS: &[&str] = &["create", "write", "unlink", "copy"];

/// Wraps a connector and rejects every write, guaranteeing the wrapped
/// system is never mutated. Used for the source side of a migration.
pub struct ReadOnly<C> {
    inner: C,
    denied_operations: Vec<String>,
}

impl<C: RecordConnector> ReadOnly<C> {
    pub fn new(inner: C) -> Self {
        ReadOnly {
            inner,
            denied_operations: WRITE_OPERATIONS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Extend the invoke deny-list with system-specific mutating operations
    /// (state transitions, settlements).
    pub fn deny_operation(mut self, operation: &str) -> Self {
        self.denied_operations.push(operation.to_string());
        self
    }

    fn rejected(operation: &str) -> MigrationError {
        MigrationError::ReadOnlyViolation {
            operation: operation.to_string(),
        }
    }
}

impl<C: RecordConnector> RecordConnector for ReadOnly<C> {
    fn authenticate(&self) -> Result<i64> {
        self.inner.authenticate()
    }

    fn count(&self, entity: &str, filter: &Filter) -> Result<usize> {
        self.inner.count(entity, filter)
    }

    fn find(
        &self,
        entity: &str,
        filter: &Filter,
        fields: &[&str],
        offset: usize,
        limit: Option<usize>,
        order: Order,
    ) -> Result<Vec<Record>> {
        self.inner.find(entity, filter, fields, offset, limit, order)
    }

    fn read_by_id(&self, entity: &str, ids: &[i64], fields: &[&str]) -> Result<Vec<Record>> {
        self.inner.read_by_id(entity, ids, fields)
    }

    fn create(&self, _entity: &str, _values: &Record) -> Result<i64> {
        Err(Self::rejected("create"))
    }

    fn update(&self, _entity: &str, _ids: &[i64], _values: &Record) -> Result<bool> {
        Err(Self::rejected("update"))
    }

    fn delete(&self, _entity: &str, _ids: &[i64]) -> Result<bool> {
        Err(Self::rejected("delete"))
    }

    fn invoke(&self, entity: &str, operation: &str, args: &[Value]) -> Result<Value> {
        if self.denied_operations.iter().any(|op| op == operation) {
            return Err(Self::rejected(operation));
        }
        self.inner.invoke(entity, operation, args)
    }
}

// ============================================================================
// IN-MEMORY CONNECTOR
// ============================================================================

type InvokeHook = Box<dyn Fn(&str, &str, &[Value]) -> Result<Value> + Send>;

/// In-process connector backed by per-entity ordered maps.
///
/// Reference implementation of the connector semantics and the test double
/// for the whole engine. Records are kept in id order so read-order
/// determinism matches a real system's `order by id` behavior.
pub struct MemoryConnector {
    state: Mutex<MemoryState>,
    invoke_hook: Option<InvokeHook>,
    fail_auth: bool,
}

#[derive(Default)]
struct MemoryState {
    entities: BTreeMap<String, BTreeMap<i64, Record>>,
    next_ids: BTreeMap<String, i64>,
    invocations: Vec<(String, String, Vec<Value>)>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        MemoryConnector {
            state: Mutex::new(MemoryState::default()),
            invoke_hook: None,
            fail_auth: false,
        }
    }

    /// Script the behavior of `invoke` (e.g. a creation helper returning
    /// new ids, or a settle operation that rejects re-settlement).
    pub fn with_invoke_hook(
        mut self,
        hook: impl Fn(&str, &str, &[Value]) -> Result<Value> + Send + 'static,
    ) -> Self {
        self.invoke_hook = Some(Box::new(hook));
        self
    }

    pub fn failing_auth() -> Self {
        MemoryConnector {
            fail_auth: true,
            ..MemoryConnector::new()
        }
    }

    /// Insert a record with an explicit id (fixture setup).
    pub fn seed(&self, entity: &str, id: i64, mut record: Record) {
        record.insert("id".to_string(), Value::from(id));
        let mut state = self.state.lock().unwrap();
        state
            .entities
            .entry(entity.to_string())
            .or_default()
            .insert(id, record);
        let next = state.next_ids.entry(entity.to_string()).or_insert(1);
        if *next <= id {
            *next = id + 1;
        }
    }

    /// Every `invoke` call recorded so far, oldest first.
    pub fn invocations(&self) -> Vec<(String, String, Vec<Value>)> {
        self.state.lock().unwrap().invocations.clone()
    }

    fn matches(record: &Record, condition: &Condition) -> bool {
        let actual = match record.get(&condition.field) {
            Some(v) => v,
            None => return matches!(condition.op, Op::Ne),
        };

        // Reference pairs compare on their id component.
        let actual = match actual {
            Value::Array(pair) if pair.len() == 2 && pair[0].is_i64() => &pair[0],
            other => other,
        };

        match condition.op {
            Op::Eq => Self::value_eq(actual, &condition.value),
            Op::Ne => !Self::value_eq(actual, &condition.value),
            Op::Ge => Self::compare(actual, &condition.value).map_or(false, |c| c >= 0),
            Op::Le => Self::compare(actual, &condition.value).map_or(false, |c| c <= 0),
            Op::Gt => Self::compare(actual, &condition.value).map_or(false, |c| c > 0),
            Op::Lt => Self::compare(actual, &condition.value).map_or(false, |c| c < 0),
            Op::In => match &condition.value {
                Value::Array(options) => options.iter().any(|v| Self::value_eq(actual, v)),
                _ => false,
            },
            Op::Like => match (actual.as_str(), condition.value.as_str()) {
                (Some(a), Some(b)) => a.to_lowercase().contains(&b.to_lowercase()),
                _ => false,
            },
        }
    }

    fn value_eq(a: &Value, b: &Value) -> bool {
        match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        }
    }

    fn compare(a: &Value, b: &Value) -> Option<i32> {
        if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
            return x.partial_cmp(&y).map(|o| o as i32);
        }
        if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
            return Some(x.cmp(y) as i32);
        }
        None
    }

    fn project(record: &Record, fields: &[&str]) -> Record {
        if fields.is_empty() {
            return record.clone();
        }
        let mut out = Record::new();
        if let Some(id) = record.get("id") {
            out.insert("id".to_string(), id.clone());
        }
        for field in fields {
            if let Some(value) = record.get(*field) {
                out.insert(field.to_string(), value.clone());
            }
        }
        out
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordConnector for MemoryConnector {
    fn authenticate(&self) -> Result<i64> {
        if self.fail_auth {
            return Err(MigrationError::Authentication {
                system: "memory".to_string(),
                reason: "invalid credentials".to_string(),
            });
        }
        Ok(1)
    }

    fn count(&self, entity: &str, filter: &Filter) -> Result<usize> {
        let state = self.state.lock().unwrap();
        let records = match state.entities.get(entity) {
            Some(r) => r,
            None => return Ok(0),
        };
        Ok(records
            .values()
            .filter(|r| filter.conditions.iter().all(|c| Self::matches(r, c)))
            .count())
    }

    fn find(
        &self,
        entity: &str,
        filter: &Filter,
        fields: &[&str],
        offset: usize,
        limit: Option<usize>,
        order: Order,
    ) -> Result<Vec<Record>> {
        let state = self.state.lock().unwrap();
        let records = match state.entities.get(entity) {
            Some(r) => r,
            None => return Ok(Vec::new()),
        };

        let mut rows: Vec<&Record> = records
            .values()
            .filter(|r| filter.conditions.iter().all(|c| Self::matches(r, c)))
            .collect();
        if order == Order::IdDesc {
            rows.reverse();
        }

        let limit = limit.unwrap_or(usize::MAX);
        Ok(rows
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|r| Self::project(r, fields))
            .collect())
    }

    fn read_by_id(&self, entity: &str, ids: &[i64], fields: &[&str]) -> Result<Vec<Record>> {
        let state = self.state.lock().unwrap();
        let records = match state.entities.get(entity) {
            Some(r) => r,
            None => return Ok(Vec::new()),
        };
        Ok(ids
            .iter()
            .filter_map(|id| records.get(id))
            .map(|r| Self::project(r, fields))
            .collect())
    }

    fn create(&self, entity: &str, values: &Record) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        let id = {
            let next = state.next_ids.entry(entity.to_string()).or_insert(1);
            let id = *next;
            *next += 1;
            id
        };
        let mut record = values.clone();
        record.insert("id".to_string(), Value::from(id));
        state
            .entities
            .entry(entity.to_string())
            .or_default()
            .insert(id, record);
        Ok(id)
    }

    fn update(&self, entity: &str, ids: &[i64], values: &Record) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let records = state
            .entities
            .entry(entity.to_string())
            .or_default();
        for id in ids {
            if let Some(record) = records.get_mut(id) {
                for (field, value) in values {
                    record.insert(field.clone(), value.clone());
                }
            }
        }
        Ok(true)
    }

    fn delete(&self, entity: &str, ids: &[i64]) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if let Some(records) = state.entities.get_mut(entity) {
            for id in ids {
                records.remove(id);
            }
        }
        Ok(true)
    }

    fn invoke(&self, entity: &str, operation: &str, args: &[Value]) -> Result<Value> {
        self.state.lock().unwrap().invocations.push((
            entity.to_string(),
            operation.to_string(),
            args.to_vec(),
        ));
        match &self.invoke_hook {
            Some(hook) => hook(entity, operation, args),
            None => Ok(Value::Null),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
