// 🗄️ SQLite-backed stores
//
// One database file per stage holds every table, every search index and the
// patch journal. Record bodies are stored as JSON and secondary indexes are
// answered with json_extract.

use crate::error::{Error, Result};
use crate::patch::{FieldUpdates, PatchEvent};
use crate::record::VersionedRecord;
use crate::store::{
    check_condition, merge_document, DocumentStore, KeyValueStore, PageToken, ScanPage,
    SearchQuery, SecondaryIndex, WriteCondition,
};
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Params};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Open (creating if needed) a stage database and make sure the schema exists
pub fn open_database(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    setup_database(&conn)?;
    debug!("Opened database {}", path.display());
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Key-value tables (one row per item, keyed by table name + id)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS records (
            store TEXT NOT NULL,
            id TEXT NOT NULL,
            version_number INTEGER,
            body TEXT NOT NULL,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (store, id)
        )",
        [],
    )?;

    // ==========================================================================
    // Search index documents
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS documents (
            index_name TEXT NOT NULL,
            doc_id TEXT NOT NULL,
            body TEXT NOT NULL,
            PRIMARY KEY (index_name, doc_id)
        )",
        [],
    )?;

    // ==========================================================================
    // Patch journal
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS patch_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            store TEXT NOT NULL,
            record_id TEXT NOT NULL,
            previous_version INTEGER,
            new_version INTEGER,
            updates TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            actor TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_patch_events_record ON patch_events(store, record_id)",
        [],
    )?;

    Ok(())
}

fn parse_body(body: &str) -> Result<Value> {
    Ok(serde_json::from_str(body)?)
}

// ============================================================================
// KEY-VALUE TABLE
// ============================================================================

pub struct SqliteTable<'c> {
    conn: &'c Connection,
    name: String,
    indexes: HashMap<String, String>,
    page_size: usize,
}

impl<'c> SqliteTable<'c> {
    pub fn new(conn: &'c Connection, name: impl Into<String>) -> Self {
        SqliteTable {
            conn,
            name: name.into(),
            indexes: HashMap::new(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_index(mut self, index: &SecondaryIndex) -> Self {
        self.indexes.insert(index.name.clone(), index.field.clone());
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM records WHERE store = ?1",
            params![self.name],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn read_bodies<P: Params>(&self, sql: &str, params: P) -> Result<Vec<VersionedRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let bodies = stmt
            .query_map(params, |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        bodies
            .iter()
            .map(|body| VersionedRecord::from_item(parse_body(body)?))
            .collect()
    }
}

impl KeyValueStore for SqliteTable<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Result<Option<VersionedRecord>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM records WHERE store = ?1 AND id = ?2",
                params![self.name, key],
                |row| row.get(0),
            )
            .optional()?;

        body.map(|b| VersionedRecord::from_item(parse_body(&b)?))
            .transpose()
    }

    fn put(&self, record: &VersionedRecord, condition: WriteCondition) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        let current: Option<Option<i64>> = tx
            .query_row(
                "SELECT version_number FROM records WHERE store = ?1 AND id = ?2",
                params![self.name, record.id],
                |row| row.get(0),
            )
            .optional()?;
        check_condition(&self.name, &record.id, current, condition)?;

        let body = serde_json::to_string(&record.to_item())?;
        tx.execute(
            "INSERT INTO records (store, id, version_number, body, updated_at)
             VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)
             ON CONFLICT(store, id) DO UPDATE SET
                version_number = excluded.version_number,
                body = excluded.body,
                updated_at = excluded.updated_at",
            params![self.name, record.id, record.version_number, body],
        )?;
        tx.commit()?;
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

        self.read_bodies(
            "SELECT body FROM records
             WHERE store = ?1 AND json_extract(body, ?2) = ?3
             ORDER BY id",
            params![self.name, format!("$.{}", field), value],
        )
    }

    fn scan(&self, page: Option<&PageToken>) -> Result<ScanPage> {
        let after = page.map(|t| t.0.as_str()).unwrap_or("");
        let mut records = self.read_bodies(
            "SELECT body FROM records
             WHERE store = ?1 AND id > ?2
             ORDER BY id
             LIMIT ?3",
            params![self.name, after, (self.page_size + 1) as i64],
        )?;

        let next = if records.len() > self.page_size {
            records.truncate(self.page_size);
            records.last().map(|r| PageToken(r.id.clone()))
        } else {
            None
        };

        Ok(ScanPage { records, next })
    }
}

// ============================================================================
// SEARCH INDEX
// ============================================================================

pub struct SqliteIndex<'c> {
    conn: &'c Connection,
    name: String,
}

impl<'c> SqliteIndex<'c> {
    pub fn new(conn: &'c Connection, name: impl Into<String>) -> Self {
        SqliteIndex {
            conn,
            name: name.into(),
        }
    }
}

impl DocumentStore for SqliteIndex<'_> {
    fn index_name(&self) -> &str {
        &self.name
    }

    fn get(&self, doc_id: &str) -> Result<Option<Value>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM documents WHERE index_name = ?1 AND doc_id = ?2",
                params![self.name, doc_id],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| parse_body(&b)).transpose()
    }

    fn index(&self, doc_id: &str, body: &Value) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO documents (index_name, doc_id, body) VALUES (?1, ?2, ?3)",
            params![self.name, doc_id, serde_json::to_string(body)?],
        )?;
        Ok(())
    }

    fn update(&self, doc_id: &str, partial: &Map<String, Value>) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        let body: String = tx
            .query_row(
                "SELECT body FROM documents WHERE index_name = ?1 AND doc_id = ?2",
                params![self.name, doc_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::not_found(self.name.clone(), doc_id))?;

        let merged = match parse_body(&body)? {
            Value::Object(mut existing) => {
                merge_document(&mut existing, partial);
                Value::Object(existing)
            }
            _ => Value::Object(partial.clone()),
        };

        tx.execute(
            "UPDATE documents SET body = ?3 WHERE index_name = ?1 AND doc_id = ?2",
            params![self.name, doc_id, serde_json::to_string(&merged)?],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn search(&self, query: &SearchQuery) -> Result<Vec<Value>> {
        let mut stmt = self
            .conn
            .prepare("SELECT body FROM documents WHERE index_name = ?1 ORDER BY doc_id")?;
        let bodies = stmt
            .query_map(params![self.name], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut hits = Vec::new();
        for body in bodies {
            let doc = parse_body(&body)?;
            if query.matches(&doc) {
                hits.push(doc);
            }
        }
        Ok(hits)
    }
}

// ============================================================================
// RELATIONAL READS
// ============================================================================

/// Run an ad-hoc query and return each row as a JSON object keyed by column name
pub fn query_records<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Map<String, Value>>> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

    let rows = stmt
        .query_map(params, |row| {
            let mut map = Map::new();
            for (i, column) in columns.iter().enumerate() {
                let value = match row.get_ref(i)? {
                    ValueRef::Null => Value::Null,
                    ValueRef::Integer(n) => Value::from(n),
                    ValueRef::Real(f) => Value::from(f),
                    ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
                    ValueRef::Blob(b) => Value::String(
                        b.iter().map(|byte| format!("{:02x}", byte)).collect(),
                    ),
                };
                map.insert(column.clone(), value);
            }
            Ok(map)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

// ============================================================================
// PATCH JOURNAL
// ============================================================================

/// Insert event into the patch journal
pub fn insert_event(conn: &Connection, event: &PatchEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO patch_events (
            event_id, timestamp, store, record_id, previous_version,
            new_version, updates, fingerprint, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.store,
            event.record_id,
            event.previous_version,
            event.new_version,
            serde_json::to_string(&event.updates)?,
            event.fingerprint,
            event.actor,
        ],
    )?;
    Ok(())
}

/// Events for one record, oldest first
pub fn get_events_for_record(conn: &Connection, store: &str, record_id: &str) -> Result<Vec<PatchEvent>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, store, record_id, previous_version,
                new_version, updates, fingerprint, actor
         FROM patch_events
         WHERE store = ?1 AND record_id = ?2
         ORDER BY id",
    )?;

    let events = stmt
        .query_map(params![store, record_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let updates_json: String = row.get(6)?;

            Ok(PatchEvent {
                event_id: row.get(0)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?
                    .with_timezone(&Utc),
                store: row.get(2)?,
                record_id: row.get(3)?,
                previous_version: row.get(4)?,
                new_version: row.get(5)?,
                updates: serde_json::from_str::<FieldUpdates>(&updates_json)
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?,
                fingerprint: row.get(7)?,
                actor: row.get(8)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(events)
}

/// Ids in `store` the journal already holds a patch for
pub fn patched_record_ids(conn: &Connection, store: &str) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT DISTINCT record_id FROM patch_events WHERE store = ?1")?;
    let ids = stmt
        .query_map(params![store], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<HashSet<_>, _>>()?;
    Ok(ids)
}

// ============================================================================
// IMPORT
// ============================================================================

/// Read a JSON array of items from disk
pub fn load_json_items(path: &Path) -> Result<Vec<Value>> {
    let text = std::fs::read_to_string(path)?;
    match serde_json::from_str::<Value>(&text)? {
        Value::Array(items) => Ok(items),
        _ => Err(Error::Config(format!(
            "{} does not contain a JSON array",
            path.display()
        ))),
    }
}

/// Seed a table, overwriting existing items
pub fn import_into_table<S: KeyValueStore + ?Sized>(store: &S, items: Vec<Value>) -> Result<usize> {
    let mut imported = 0;
    for item in items {
        let record = VersionedRecord::from_item(item)?;
        store.put(&record, WriteCondition::Unconditional)?;
        imported += 1;
    }
    info!("Imported {} item(s) into {}", imported, store.name());
    Ok(imported)
}

/// Seed a search index; each document is keyed by its `id`
pub fn import_into_index<D: DocumentStore + ?Sized>(index: &D, items: Vec<Value>) -> Result<usize> {
    let mut imported = 0;
    for item in items {
        let doc_id = match item.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(Error::coercion("document", "id", "missing document id")),
        };
        index.index(&doc_id, &item)?;
        imported += 1;
    }
    info!("Imported {} document(s) into {}", imported, index.index_name());
    Ok(imported)
}
