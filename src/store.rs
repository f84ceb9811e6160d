// 🏪 Store interfaces - key-value tables and search indices
//
// The reconciliation pipeline only talks to these traits. `db` provides the
// SQLite-backed implementations used by the CLI; the in-memory ones here back
// tests and dry runs.

use crate::error::{Error, Result};
use crate::record::{value_at_path, VersionedRecord};
use crate::schema::{coerce, Coerced, Shaped};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::debug;

// ============================================================================
// KEY-VALUE STORE
// ============================================================================

/// Named projection of one (possibly nested) field to primary keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryIndex {
    pub name: String,
    pub field: String,
}

impl SecondaryIndex {
    pub fn new(name: impl Into<String>, field: impl Into<String>) -> Self {
        SecondaryIndex {
            name: name.into(),
            field: field.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken(pub String);

#[derive(Debug, Clone)]
pub struct ScanPage {
    pub records: Vec<VersionedRecord>,
    pub next: Option<PageToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    /// Overwrite whatever is stored
    Unconditional,
    /// Only write if the stored version still equals this value
    VersionIs(Option<i64>),
}

pub trait KeyValueStore {
    fn name(&self) -> &str;

    /// `Ok(None)` when the key is absent
    fn get(&self, key: &str) -> Result<Option<VersionedRecord>>;

    fn put(&self, record: &VersionedRecord, condition: WriteCondition) -> Result<()>;

    /// Exact-match lookup through a secondary index. Zero matches is not an error.
    fn query(&self, index: &SecondaryIndex, value: &str) -> Result<Vec<VersionedRecord>>;

    fn scan(&self, page: Option<&PageToken>) -> Result<ScanPage>;
}

/// Enforce a write condition against whatever is currently stored
pub(crate) fn check_condition(
    store: &str,
    key: &str,
    current: Option<Option<i64>>,
    condition: WriteCondition,
) -> Result<()> {
    match condition {
        WriteCondition::Unconditional => Ok(()),
        WriteCondition::VersionIs(expected) => {
            let found = current.flatten();
            if current.is_some() && found == expected {
                Ok(())
            } else if current.is_none() && expected.is_none() {
                // New record: nothing to collide with
                Ok(())
            } else {
                Err(Error::VersionConflict {
                    store: store.to_string(),
                    key: key.to_string(),
                    expected,
                    found,
                })
            }
        }
    }
}

// ============================================================================
// SECONDARY-INDEX LOOKUP + RECORD LOADER
// ============================================================================

pub fn lookup<S: KeyValueStore + ?Sized>(
    store: &S,
    index: &SecondaryIndex,
    value: &str,
) -> Result<Vec<VersionedRecord>> {
    let records = store.query(index, value)?;
    debug!(
        "{}.{} = {} -> {} record(s)",
        store.name(),
        index.name,
        value,
        records.len()
    );
    Ok(records)
}

/// Outcome of a lookup that is expected to hit exactly one record
#[derive(Debug, Clone)]
pub enum IndexMatch {
    Missing,
    Unique(VersionedRecord),
    Ambiguous(Vec<VersionedRecord>),
}

impl IndexMatch {
    pub fn from_records(mut records: Vec<VersionedRecord>) -> Self {
        match records.len() {
            0 => IndexMatch::Missing,
            1 => IndexMatch::Unique(records.remove(0)),
            _ => IndexMatch::Ambiguous(records),
        }
    }

    /// Missing → NotFound, Ambiguous → AmbiguousMatch. Never picks the first of many.
    pub fn into_unique(self, index: &SecondaryIndex, value: &str) -> Result<VersionedRecord> {
        match self {
            IndexMatch::Unique(record) => Ok(record),
            IndexMatch::Missing => Err(Error::not_found(index.name.clone(), value)),
            IndexMatch::Ambiguous(records) => Err(Error::AmbiguousMatch {
                index: index.name.clone(),
                value: value.to_string(),
                count: records.len(),
            }),
        }
    }
}

pub fn lookup_unique<S: KeyValueStore + ?Sized>(
    store: &S,
    index: &SecondaryIndex,
    value: &str,
) -> Result<IndexMatch> {
    Ok(IndexMatch::from_records(lookup(store, index, value)?))
}

/// Single-key load. `NotFound` is an outcome, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Loaded<T> {
    Found(T),
    NotFound { store: String, key: String },
}

impl<T> Loaded<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Loaded::Found(value) => Some(value),
            Loaded::NotFound { .. } => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Loaded::Found(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Loaded<U> {
        match self {
            Loaded::Found(value) => Loaded::Found(f(value)),
            Loaded::NotFound { store, key } => Loaded::NotFound { store, key },
        }
    }

    /// Escalate to an error for callers that cannot continue without the record
    pub fn require(self) -> Result<T> {
        match self {
            Loaded::Found(value) => Ok(value),
            Loaded::NotFound { store, key } => Err(Error::NotFound { store, key }),
        }
    }
}

pub struct RecordLoader<'a, S: KeyValueStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: KeyValueStore + ?Sized> RecordLoader<'a, S> {
    pub fn new(store: &'a S) -> Self {
        RecordLoader { store }
    }

    pub fn load(&self, key: &str) -> Result<Loaded<VersionedRecord>> {
        Ok(match self.store.get(key)? {
            Some(record) => Loaded::Found(record),
            None => Loaded::NotFound {
                store: self.store.name().to_string(),
                key: key.to_string(),
            },
        })
    }

    /// Load and coerce into a typed record
    pub fn load_as<T: Shaped>(&self, key: &str) -> Result<Loaded<Coerced<T>>> {
        match self.load(key)? {
            Loaded::Found(record) => Ok(Loaded::Found(coerce::<T>(&record.to_item())?)),
            Loaded::NotFound { store, key } => Ok(Loaded::NotFound { store, key }),
        }
    }
}

/// Follow scan pagination to the end, handing each page to `visit`
pub fn scan_all<S, F>(store: &S, mut visit: F) -> Result<usize>
where
    S: KeyValueStore + ?Sized,
    F: FnMut(&[VersionedRecord]) -> Result<()>,
{
    let mut token: Option<PageToken> = None;
    let mut scanned = 0;
    loop {
        let page = store.scan(token.as_ref())?;
        scanned += page.records.len();
        visit(&page.records)?;
        match page.next {
            Some(next) => {
                debug!("Scanned {} items from {} - last key: {}", scanned, store.name(), next.0);
                token = Some(next);
            }
            None => break,
        }
    }
    Ok(scanned)
}

// ============================================================================
// DOCUMENT (SEARCH) STORE
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum SearchQuery {
    /// Exact match on a dotted path, compared as text
    Term { field: String, value: String },
    /// Case-insensitive substring over every string value in the document
    Text(String),
}

impl SearchQuery {
    pub fn term(field: impl Into<String>, value: impl Into<String>) -> Self {
        SearchQuery::Term {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, document: &Value) -> bool {
        match self {
            SearchQuery::Term { field, value } => match value_at_path(document, field) {
                Some(Value::String(s)) => s == value,
                Some(Value::Number(n)) => n.to_string() == *value,
                Some(Value::Bool(b)) => b.to_string() == *value,
                _ => false,
            },
            SearchQuery::Text(text) => contains_text(document, &text.to_lowercase()),
        }
    }
}

fn contains_text(value: &Value, needle: &str) -> bool {
    match value {
        Value::String(s) => s.to_lowercase().contains(needle),
        Value::Array(items) => items.iter().any(|v| contains_text(v, needle)),
        Value::Object(map) => map.values().any(|v| contains_text(v, needle)),
        _ => false,
    }
}

pub trait DocumentStore {
    fn index_name(&self) -> &str;

    fn get(&self, doc_id: &str) -> Result<Option<Value>>;

    /// Create or replace a whole document
    fn index(&self, doc_id: &str, body: &Value) -> Result<()>;

    /// Partial update merged into an existing document
    fn update(&self, doc_id: &str, partial: &Map<String, Value>) -> Result<()>;

    fn search(&self, query: &SearchQuery) -> Result<Vec<Value>>;
}

/// Recursive merge, the way a search engine applies a partial `doc` update
pub fn merge_document(target: &mut Map<String, Value>, partial: &Map<String, Value>) {
    for (key, value) in partial {
        if let (Some(Value::Object(existing)), Value::Object(incoming)) =
            (target.get_mut(key), value)
        {
            merge_document(existing, incoming);
            continue;
        }
        target.insert(key.clone(), value.clone());
    }
}

// ============================================================================
// IN-MEMORY IMPLEMENTATIONS
// ============================================================================

/// In-process table keyed by primary key, ordered for deterministic scans
pub struct MemoryTable {
    name: String,
    indexes: HashMap<String, String>,
    page_size: usize,
    records: Arc<RwLock<BTreeMap<String, VersionedRecord>>>,
}

impl MemoryTable {
    pub fn new(name: impl Into<String>) -> Self {
        MemoryTable {
            name: name.into(),
            indexes: HashMap::new(),
            page_size: 100,
            records: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Builder: register a secondary index
    pub fn with_index(mut self, index: &SecondaryIndex) -> Self {
        self.indexes.insert(index.name.clone(), index.field.clone());
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Seed without version checks
    pub fn insert(&self, record: VersionedRecord) {
        self.write().insert(record.id.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, VersionedRecord>> {
        self.records.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, VersionedRecord>> {
        self.records.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyValueStore for MemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Result<Option<VersionedRecord>> {
        Ok(self.read().get(key).cloned())
    }

    fn put(&self, record: &VersionedRecord, condition: WriteCondition) -> Result<()> {
        let mut records = self.write();
        let current = records.get(&record.id).map(|r| r.version_number);
        check_condition(&self.name, &record.id, current, condition)?;
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn query(&self, index: &SecondaryIndex, value: &str) -> Result<Vec<VersionedRecord>> {
        let field = self
            .indexes
            .get(&index.name)
            .ok_or_else(|| Error::UnknownIndex {
                store: self.name.clone(),
                index: index.name.clone(),
            })?;

        Ok(self
            .read()
            .values()
            .filter(|record| matches!(record.get_path(field), Some(Value::String(s)) if s == value))
            .cloned()
            .collect())
    }

    fn scan(&self, page: Option<&PageToken>) -> Result<ScanPage> {
        let records = self.read();
        let mut batch: Vec<VersionedRecord> = match page {
            Some(PageToken(after)) => records
                .range::<String, _>((
                    std::ops::Bound::Excluded(after.clone()),
                    std::ops::Bound::Unbounded,
                ))
                .take(self.page_size + 1)
                .map(|(_, r)| r.clone())
                .collect(),
            None => records.values().take(self.page_size + 1).cloned().collect(),
        };

        let next = if batch.len() > self.page_size {
            batch.truncate(self.page_size);
            batch.last().map(|r| PageToken(r.id.clone()))
        } else {
            None
        };

        Ok(ScanPage {
            records: batch,
            next,
        })
    }
}

/// In-process search index
pub struct MemoryIndex {
    name: String,
    documents: Arc<RwLock<BTreeMap<String, Value>>>,
}

impl MemoryIndex {
    pub fn new(name: impl Into<String>) -> Self {
        MemoryIndex {
            name: name.into(),
            documents: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl DocumentStore for MemoryIndex {
    fn index_name(&self) -> &str {
        &self.name
    }

    fn get(&self, doc_id: &str) -> Result<Option<Value>> {
        let documents = self.documents.read().unwrap_or_else(|p| p.into_inner());
        Ok(documents.get(doc_id).cloned())
    }

    fn index(&self, doc_id: &str, body: &Value) -> Result<()> {
        let mut documents = self.documents.write().unwrap_or_else(|p| p.into_inner());
        documents.insert(doc_id.to_string(), body.clone());
        Ok(())
    }

    fn update(&self, doc_id: &str, partial: &Map<String, Value>) -> Result<()> {
        let mut documents = self.documents.write().unwrap_or_else(|p| p.into_inner());
        match documents.get_mut(doc_id) {
            Some(Value::Object(existing)) => {
                merge_document(existing, partial);
                Ok(())
            }
            Some(other) => {
                *other = Value::Object(partial.clone());
                Ok(())
            }
            None => Err(Error::not_found(self.name.clone(), doc_id)),
        }
    }

    fn search(&self, query: &SearchQuery) -> Result<Vec<Value>> {
        let documents = self.documents.read().unwrap_or_else(|p| p.into_inner());
        Ok(documents
            .values()
            .filter(|doc| query.matches(doc))
            .cloned()
            .collect())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn asset_index() -> SecondaryIndex {
        SecondaryIndex::new("AssetId", "assetId")
    }

    fn asset(id: &str, prop_ref: &str) -> VersionedRecord {
        VersionedRecord::new(id).with_field("assetId", json!(prop_ref))
    }

    #[test]
    fn test_lookup_returns_zero_one_or_many() {
        let table = MemoryTable::new("Assets").with_index(&asset_index());
        table.insert(asset("a1", "00000001"));
        table.insert(asset("a2", "00000002"));
        table.insert(asset("a3", "00000002"));

        assert!(lookup(&table, &asset_index(), "00000009").unwrap().is_empty());
        assert_eq!(lookup(&table, &asset_index(), "00000001").unwrap().len(), 1);
        assert_eq!(lookup(&table, &asset_index(), "00000002").unwrap().len(), 2);
    }

    #[test]
    fn test_lookup_unique_never_picks_first_of_many() {
        let table = MemoryTable::new("Assets").with_index(&asset_index());
        table.insert(asset("a2", "00000002"));
        table.insert(asset("a3", "00000002"));

        let matched = lookup_unique(&table, &asset_index(), "00000002").unwrap();
        assert!(matches!(matched, IndexMatch::Ambiguous(ref r) if r.len() == 2));

        let err = matched.into_unique(&asset_index(), "00000002").unwrap_err();
        assert!(matches!(err, Error::AmbiguousMatch { count: 2, .. }));

        let missing = lookup_unique(&table, &asset_index(), "404").unwrap();
        assert!(matches!(
            missing.into_unique(&asset_index(), "404"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_unregistered_index_is_an_error() {
        let table = MemoryTable::new("Assets");
        let err = table.query(&asset_index(), "1").unwrap_err();
        assert!(matches!(err, Error::UnknownIndex { .. }));
    }

    #[test]
    fn test_loader_reports_not_found_as_outcome() {
        let table = MemoryTable::new("Persons");
        table.insert(VersionedRecord::new("p1"));
        let loader = RecordLoader::new(&table);

        assert!(loader.load("p1").unwrap().is_found());
        match loader.load("p2").unwrap() {
            Loaded::NotFound { store, key } => {
                assert_eq!(store, "Persons");
                assert_eq!(key, "p2");
            }
            Loaded::Found(_) => panic!("p2 should be missing"),
        }
    }

    #[test]
    fn test_scan_all_visits_each_record_once() {
        let table = MemoryTable::new("Assets").with_page_size(3);
        for i in 0..10 {
            table.insert(asset(&format!("a{:02}", i), "x"));
        }

        let mut seen = Vec::new();
        let total = scan_all(&table, |page| {
            assert!(page.len() <= 3);
            seen.extend(page.iter().map(|r| r.id.clone()));
            Ok(())
        })
        .unwrap();

        assert_eq!(total, 10);
        let unique: std::collections::BTreeSet<_> = seen.iter().collect();
        assert_eq!(seen.len(), 10);
        assert_eq!(unique.len(), 10);
    }

    #[test]
    fn test_conditional_put_detects_moved_version() {
        let table = MemoryTable::new("Assets");
        table.insert(asset("a1", "1").with_version(2));

        let stale = asset("a1", "1").with_version(2);
        let err = table
            .put(&stale.clone().with_version(3), WriteCondition::VersionIs(Some(1)))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::VersionConflict { expected: Some(1), found: Some(2), .. }
        ));
        assert_eq!(table.get("a1").unwrap().unwrap().version_number, Some(2));

        table
            .put(&stale.with_version(3), WriteCondition::VersionIs(Some(2)))
            .unwrap();
        assert_eq!(table.get("a1").unwrap().unwrap().version_number, Some(3));
    }

    #[test]
    fn test_conditional_put_of_new_record_expects_no_version() {
        let table = MemoryTable::new("Assets");
        table
            .put(&asset("new", "1").with_version(0), WriteCondition::VersionIs(None))
            .unwrap();
        assert!(table.get("new").unwrap().is_some());
    }

    #[test]
    fn test_document_update_merges_nested_objects() {
        let index = MemoryIndex::new("assets");
        index
            .index("a1", &json!({"id": "a1", "tenure": {"id": "t1", "type": "Secure"}}))
            .unwrap();

        let mut partial = Map::new();
        partial.insert("tenure".to_string(), json!({"id": "t2"}));
        index.update("a1", &partial).unwrap();

        let doc = index.get("a1").unwrap().unwrap();
        assert_eq!(doc["tenure"], json!({"id": "t2", "type": "Secure"}));

        assert!(matches!(
            index.update("missing", &partial),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_search_term_and_text() {
        let index = MemoryIndex::new("tenures");
        index
            .index("t1", &json!({"id": "t1", "tenuredAsset": {"id": "a1", "fullAddress": "1 Mare Street"}}))
            .unwrap();
        index
            .index("t2", &json!({"id": "t2", "tenuredAsset": {"id": "a2", "fullAddress": "2 Mare Street"}}))
            .unwrap();

        let hits = index.search(&SearchQuery::term("tenuredAsset.id", "a1")).unwrap();
        assert_eq!(hits.len(), 1);

        let hits = index.search(&SearchQuery::Text("mare street".to_string())).unwrap();
        assert_eq!(hits.len(), 2);
    }
}
