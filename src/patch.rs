// ✍️ Confirmed Patch Applier
//
// apply = stage the change (bump versionNumber) → ask the operator → write once.
// A declined confirmation never touches the store. Writes are conditional on
// the version that was read unless the caller opts out.

use crate::error::{Error, Result};
use crate::progress::PassTally;
use crate::record::{set_path, VersionedRecord, VERSION_FIELD};
use crate::store::{DocumentStore, KeyValueStore, WriteCondition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::io::{BufRead, Write};
use tracing::{info, warn};

// ============================================================================
// CONFIRMATION
// ============================================================================

/// Human-in-the-loop gate. Implemented for plain closures so tests can inject answers.
pub trait Confirm {
    fn confirm(&mut self, prompt: &str) -> bool;
}

impl<F: FnMut(&str) -> bool> Confirm for F {
    fn confirm(&mut self, prompt: &str) -> bool {
        self(prompt)
    }
}

/// y/n prompt on a terminal (or any reader/writer pair)
pub struct ConsolePrompt<R: BufRead, W: Write> {
    input: R,
    output: W,
}

impl ConsolePrompt<std::io::StdinLock<'static>, std::io::Stdout> {
    pub fn stdio() -> Self {
        ConsolePrompt {
            input: std::io::stdin().lock(),
            output: std::io::stdout(),
        }
    }
}

impl<R: BufRead, W: Write> ConsolePrompt<R, W> {
    pub fn new(input: R, output: W) -> Self {
        ConsolePrompt { input, output }
    }
}

impl<R: BufRead, W: Write> Confirm for ConsolePrompt<R, W> {
    fn confirm(&mut self, prompt: &str) -> bool {
        loop {
            if write!(self.output, "{} (y/n): ", prompt)
                .and_then(|_| self.output.flush())
                .is_err()
            {
                return false;
            }

            let mut line = String::new();
            match self.input.read_line(&mut line) {
                // Closed input counts as a refusal
                Ok(0) | Err(_) => return false,
                Ok(_) => {}
            }

            match line.trim().to_lowercase().as_str() {
                "y" | "yes" => return true,
                "n" | "no" => return false,
                _ => {
                    let _ = writeln!(self.output, "Invalid response. Please enter y or n.");
                }
            }
        }
    }
}

/// Non-interactive approval for `--yes` runs
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&mut self, prompt: &str) -> bool {
        info!("Auto-confirmed: {}", prompt.lines().next().unwrap_or(prompt));
        true
    }
}

// ============================================================================
// FIELD UPDATES + EVENTS
// ============================================================================

/// Field changes keyed by dotted path
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldUpdates(Map<String, Value>);

impl FieldUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set one field
    pub fn set(mut self, path: &str, value: Value) -> Self {
        self.0.insert(path.to_string(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Nested object form, as sent to a search index partial update
    pub fn to_partial(&self) -> Map<String, Value> {
        let mut partial = Map::new();
        for (path, value) in &self.0 {
            set_path(&mut partial, path, value.clone());
        }
        partial
    }

    fn apply_to(&self, fields: &mut Map<String, Value>) {
        for (path, value) in &self.0 {
            set_path(fields, path, value.clone());
        }
    }
}

/// Audit entry for one applied write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub store: String,
    pub record_id: String,
    pub previous_version: Option<i64>,
    pub new_version: Option<i64>,
    pub updates: FieldUpdates,
    /// SHA-256 over store, record id, new version and updates
    pub fingerprint: String,
    pub actor: String,
}

impl PatchEvent {
    pub fn new(
        store: &str,
        record_id: &str,
        previous_version: Option<i64>,
        new_version: Option<i64>,
        updates: &FieldUpdates,
        actor: &str,
    ) -> Self {
        PatchEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            store: store.to_string(),
            record_id: record_id.to_string(),
            previous_version,
            new_version,
            updates: updates.clone(),
            fingerprint: fingerprint(store, record_id, new_version, updates),
            actor: actor.to_string(),
        }
    }
}

pub fn fingerprint(store: &str, record_id: &str, version: Option<i64>, updates: &FieldUpdates) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{}|{}|{}|{}",
        store,
        record_id,
        version.map(|v| v.to_string()).unwrap_or_default(),
        serde_json::to_string(&updates.0).unwrap_or_default()
    ));
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Written; carries the record as stored and the audit event
    Applied {
        record: VersionedRecord,
        event: PatchEvent,
    },
    Declined,
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }

    pub fn event(&self) -> Option<&PatchEvent> {
        match self {
            ApplyOutcome::Applied { event, .. } => Some(event),
            ApplyOutcome::Declined => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentOutcome {
    pub applied: bool,
    pub event: Option<PatchEvent>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultiStoreOutcome {
    pub primary: ApplyOutcome,
    /// None when the primary write was declined and the secondary was not attempted
    pub secondary: Option<DocumentOutcome>,
}

/// Tally and audit events from a batch of applies
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub tally: PassTally,
    pub events: Vec<PatchEvent>,
}

/// Count a per-record failure and carry on; store failures stop the pass
pub(crate) fn count_failure(tally: &mut PassTally, record_id: &str, err: Error) -> Result<()> {
    match err {
        Error::VersionConflict { .. } => {
            warn!("Record {} changed since it was read: {}", record_id, err);
            tally.failed += 1;
            Ok(())
        }
        e if e.is_record_level() => {
            warn!("Record {}: {}", record_id, e);
            tally.failed += 1;
            Ok(())
        }
        e => Err(e),
    }
}

// ============================================================================
// PATCH APPLIER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Compare-and-swap on the version that was read
    Conditional,
    /// Overwrite regardless of concurrent writers
    Unconditional,
}

pub struct PatchApplier {
    mode: WriteMode,
    actor: String,
}

impl PatchApplier {
    pub fn new(actor: impl Into<String>) -> Self {
        PatchApplier {
            mode: WriteMode::Conditional,
            actor: actor.into(),
        }
    }

    pub fn with_mode(mut self, mode: WriteMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    /// Patch one key-value record
    pub fn apply<S, C>(
        &self,
        store: &S,
        record: &VersionedRecord,
        updates: &FieldUpdates,
        confirm: &mut C,
    ) -> Result<ApplyOutcome>
    where
        S: KeyValueStore + ?Sized,
        C: Confirm + ?Sized,
    {
        let mut staged = record.clone();
        staged.version_number = Some(record.next_version()?);
        updates.apply_to(&mut staged.fields);

        let prompt = format!(
            "Update {} {} (version {} -> {}) with\n{}?",
            store.name(),
            record.id,
            show_version(record.version_number),
            show_version(staged.version_number),
            serde_json::to_string_pretty(&updates.0)?
        );

        if !confirm.confirm(&prompt) {
            info!("Skipping {} {}", store.name(), record.id);
            return Ok(ApplyOutcome::Declined);
        }

        let condition = match self.mode {
            WriteMode::Conditional => WriteCondition::VersionIs(record.version_number),
            WriteMode::Unconditional => WriteCondition::Unconditional,
        };
        store.put(&staged, condition)?;

        info!(
            "Updated {} {} to version {}",
            store.name(),
            record.id,
            show_version(staged.version_number)
        );
        let event = PatchEvent::new(
            store.name(),
            &record.id,
            record.version_number,
            staged.version_number,
            updates,
            &self.actor,
        );
        Ok(ApplyOutcome::Applied {
            record: staged,
            event,
        })
    }

    /// Patch one search document. A document that carries `versionNumber`
    /// has it bumped alongside the update.
    pub fn apply_document<D, C>(
        &self,
        store: &D,
        doc_id: &str,
        updates: &FieldUpdates,
        confirm: &mut C,
    ) -> Result<DocumentOutcome>
    where
        D: DocumentStore + ?Sized,
        C: Confirm + ?Sized,
    {
        let current = store
            .get(doc_id)?
            .ok_or_else(|| Error::not_found(store.index_name(), doc_id))?;

        let previous_version = current.get(VERSION_FIELD).and_then(Value::as_i64);
        let tracks_version = current.get(VERSION_FIELD).is_some();
        let new_version = tracks_version.then(|| previous_version.map_or(0, |v| v + 1));

        let mut partial = updates.to_partial();
        if let Some(version) = new_version {
            partial.insert(VERSION_FIELD.to_string(), Value::from(version));
        }

        let prompt = format!(
            "Update search index {} document {} with\n{}?",
            store.index_name(),
            doc_id,
            serde_json::to_string_pretty(&partial)?
        );
        if !confirm.confirm(&prompt) {
            info!("Skipping {} document {}", store.index_name(), doc_id);
            return Ok(DocumentOutcome {
                applied: false,
                event: None,
            });
        }

        store.update(doc_id, &partial)?;
        info!("Updated {} document {}", store.index_name(), doc_id);

        Ok(DocumentOutcome {
            applied: true,
            event: Some(PatchEvent::new(
                store.index_name(),
                doc_id,
                previous_version,
                new_version,
                updates,
                &self.actor,
            )),
        })
    }

    /// Patch a record held in a table and mirrored in a search index.
    /// No cross-store transaction: if the index write fails after the table
    /// write succeeded, the error is `PartialMultiStoreWrite`.
    pub fn apply_across<S, D, C>(
        &self,
        table: &S,
        index: &D,
        record: &VersionedRecord,
        updates: &FieldUpdates,
        confirm: &mut C,
    ) -> Result<MultiStoreOutcome>
    where
        S: KeyValueStore + ?Sized,
        D: DocumentStore + ?Sized,
        C: Confirm + ?Sized,
    {
        let primary = self.apply(table, record, updates, confirm)?;
        if !primary.is_applied() {
            return Ok(MultiStoreOutcome {
                primary,
                secondary: None,
            });
        }

        match self.apply_document(index, &record.id, updates, confirm) {
            Ok(secondary) => Ok(MultiStoreOutcome {
                primary,
                secondary: Some(secondary),
            }),
            Err(e) => {
                warn!(
                    "{} {} was patched but {} was not: {}",
                    table.name(),
                    record.id,
                    index.index_name(),
                    e
                );
                Err(Error::PartialMultiStoreWrite {
                    completed: table.name().to_string(),
                    failed: index.index_name().to_string(),
                    source: Box::new(e),
                })
            }
        }
    }
}

fn show_version(version: Option<i64>) -> String {
    version.map(|v| v.to_string()).unwrap_or_else(|| "null".to_string())
}

// ============================================================================
// TESTS
// ============================================================================
