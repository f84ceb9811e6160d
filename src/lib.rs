// Housing Reconcile - Core Library
// Cross-store consistency checks and confirmed fixups for housing records.
// Exposes all modules for use in the CLI and tests.

pub mod error;
pub mod record;
pub mod schema;         // Shape Layer - field coercion with defaults
pub mod store;          // Store traits + in-memory stores
pub mod db;             // SQLite stores + patch journal
pub mod entities;       // Tenure / Asset / Person
pub mod reconciliation; // Mismatch detection + tenure cross-check
pub mod patch;          // Confirmed patch applier
pub mod backfill;       // Paged scan-and-patch passes
pub mod progress;
pub mod tabular;        // CSV / TSV + table export
pub mod alerts;         // Alert-to-person resolution
pub mod crossref;       // Relational alert rows vs person records
pub mod fixups;         // Asset-tenure fixups
pub mod config;

// Re-export commonly used types
pub use error::{Error, Result};
pub use record::VersionedRecord;
pub use schema::{coerce, Coerced, CoercionReport, FieldKind, FieldOrigin, Shape, Shaped};
pub use store::{
    lookup, lookup_unique, scan_all, DocumentStore, IndexMatch, KeyValueStore, Loaded,
    MemoryIndex, MemoryTable, PageToken, RecordLoader, ScanPage, SearchQuery, SecondaryIndex,
    WriteCondition,
};
pub use db::{
    get_events_for_record, import_into_index, import_into_table, insert_event, load_json_items,
    open_database, patched_record_ids, query_records, setup_database, SqliteIndex, SqliteTable,
};
pub use entities::{Asset, AssetTenure, HouseholdMember, Person, PersonTenure, Tenure};
pub use reconciliation::{
    detect, CrossCheckReport, Dependent, FieldMap, Mismatch, MismatchDetector, TenureCrossCheck,
};
pub use patch::{
    ApplyOutcome, ApplyReport, AssumeYes, Confirm, ConsolePrompt, FieldUpdates, PatchApplier,
    PatchEvent, WriteMode,
};
pub use backfill::{Assignment, Backfill, FieldRule};
pub use progress::{PassTally, ProgressReporter};
pub use config::{Settings, Stage};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
