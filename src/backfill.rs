// 🔁 Backfill - page through a whole table and patch what a rule selects
//
// The rule sees each record once and returns the updates to make, or None to
// leave the record alone. Record-level rule errors fail that record only.
// Ids already journaled can be excluded so an interrupted pass resumes.

use crate::error::{Error, Result};
use crate::patch::{count_failure, ApplyOutcome, ApplyReport, Confirm, FieldUpdates, PatchApplier};
use crate::progress::ProgressReporter;
use crate::reconciliation::{parse_calendar_date, values_match};
use crate::record::{value_at_path, VersionedRecord};
use crate::store::{scan_all, KeyValueStore};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::Value;
use std::collections::HashSet;
use std::str::FromStr;
use tracing::{debug, info, warn};

pub struct Backfill<'a> {
    patcher: &'a PatchApplier,
    done: HashSet<String>,
    journal: Option<&'a Connection>,
}

impl<'a> Backfill<'a> {
    pub fn new(patcher: &'a PatchApplier) -> Self {
        Backfill {
            patcher,
            done: HashSet::new(),
            journal: None,
        }
    }

    /// Skip these ids without consulting the rule
    pub fn resume_after(mut self, done: HashSet<String>) -> Self {
        self.done = done;
        self
    }

    /// Append each event to the patch journal as soon as its write lands
    pub fn with_journal(mut self, conn: &'a Connection) -> Self {
        self.journal = Some(conn);
        self
    }

    pub fn run<S, R, C>(
        &self,
        store: &S,
        mut rule: R,
        confirm: &mut C,
        reporter: Option<&ProgressReporter>,
    ) -> Result<ApplyReport>
    where
        S: KeyValueStore + ?Sized,
        R: FnMut(&VersionedRecord) -> Result<Option<FieldUpdates>>,
        C: Confirm + ?Sized,
    {
        if !self.done.is_empty() {
            info!("Resuming {}: {} record(s) already patched", store.name(), self.done.len());
        }

        let mut report = ApplyReport::default();
        scan_all(store, |page| {
            for record in page {
                report.tally.scanned += 1;
                self.visit(store, record, &mut rule, confirm, &mut report)?;
                if let Some(reporter) = reporter {
                    reporter.tick(report.tally.scanned, &format!("{} updated", report.tally.updated));
                }
            }
            Ok(())
        })?;

        info!("{}: {}", store.name(), report.tally.summary());
        Ok(report)
    }

    fn visit<S, R, C>(
        &self,
        store: &S,
        record: &VersionedRecord,
        rule: &mut R,
        confirm: &mut C,
        report: &mut ApplyReport,
    ) -> Result<()>
    where
        S: KeyValueStore + ?Sized,
        R: FnMut(&VersionedRecord) -> Result<Option<FieldUpdates>>,
        C: Confirm + ?Sized,
    {
        if self.done.contains(&record.id) {
            debug!("{} already patched", record.id);
            report.tally.skipped += 1;
            return Ok(());
        }

        let updates = match rule(record) {
            Ok(Some(updates)) if !updates.is_empty() => updates,
            Ok(_) => {
                report.tally.skipped += 1;
                return Ok(());
            }
            Err(e) => return count_failure(&mut report.tally, &record.id, e),
        };
        report.tally.matched += 1;

        match self.patcher.apply(store, record, &updates, confirm) {
            Ok(ApplyOutcome::Applied { event, .. }) => {
                if let Some(conn) = self.journal {
                    crate::db::insert_event(conn, &event)?;
                }
                report.tally.updated += 1;
                report.events.push(event);
                Ok(())
            }
            Ok(ApplyOutcome::Declined) => {
                report.tally.declined += 1;
                Ok(())
            }
            Err(e) => count_failure(&mut report.tally, &record.id, e),
        }
    }
}

// ============================================================================
// RULES
// ============================================================================

/// `path=value` from the command line. The value is read as JSON when it
/// parses, otherwise as a plain string.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub path: String,
    pub value: Value,
}

impl FromStr for Assignment {
    type Err = String;

    fn from_str(text: &str) -> std::result::Result<Self, Self::Err> {
        let (path, raw) = text
            .split_once('=')
            .ok_or_else(|| format!("expected path=value, got `{}`", text))?;
        let path = path.trim();
        if path.is_empty() {
            return Err(format!("missing field path in `{}`", text));
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        Ok(Assignment {
            path: path.to_string(),
            value,
        })
    }
}

/// Set fields on every record matching all filters
#[derive(Debug, Clone, Default)]
pub struct FieldRule {
    pub set: Vec<Assignment>,
    pub filters: Vec<Assignment>,
}

impl FieldRule {
    /// Only assignments that would change the record; None when nothing would
    pub fn updates_for(&self, record: &VersionedRecord) -> Option<FieldUpdates> {
        let item = record.to_item();
        let holds = |a: &Assignment| values_match(value_at_path(&item, &a.path), Some(&a.value));

        if !self.filters.iter().all(holds) {
            return None;
        }
        let updates = self
            .set
            .iter()
            .filter(|a| !holds(*a))
            .fold(FieldUpdates::new(), |updates, a| updates.set(&a.path, a.value.clone()));
        (!updates.is_empty()).then_some(updates)
    }
}

/// `isActive` for an asset whose flag exists but was never filled in.
///
/// No tenure → inactive; open-ended tenure → active; otherwise active until
/// the tenure end date has passed.
pub fn is_active_update(record: &VersionedRecord, today: NaiveDate) -> Result<Option<FieldUpdates>> {
    match record.fields.get("isActive") {
        None => {
            debug!("{} has no isActive property", record.id);
            return Ok(None);
        }
        Some(Value::Null) => {}
        Some(Value::String(s)) if s.is_empty() => {}
        Some(_) => return Ok(None),
    }

    let has_root = match record.fields.get("rootAsset") {
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Null) | None => false,
        Some(_) => true,
    };
    if !has_root {
        return Err(Error::coercion("Asset", "rootAsset", "required field is missing"));
    }

    let active = match record.get_path("tenure") {
        None | Some(Value::Null) => false,
        Some(_) => match record.get_path("tenure.endOfTenureDate") {
            None | Some(Value::Null) => true,
            Some(Value::String(end)) => {
                let end = parse_calendar_date(end).ok_or_else(|| {
                    Error::coercion("Asset", "tenure.endOfTenureDate", format!("unreadable date `{}`", end))
                })?;
                end >= today
            }
            Some(other) => {
                warn!("{} has a non-text tenure end date", record.id);
                return Err(Error::coercion(
                    "Asset",
                    "tenure.endOfTenureDate",
                    format!("expected text, found {}", other),
                ));
            }
        },
    };

    Ok(Some(FieldUpdates::new().set("isActive", Value::Bool(active))))
}
