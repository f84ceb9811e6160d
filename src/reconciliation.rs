// ⚖️ Reconciliation Engine - detect drift between a record and its copies
//
// An authoritative record (a tenure) is duplicated field-by-field into
// dependent records (the asset's `tenure`, each person's `tenures[]` entry).
// Every field pair that disagrees becomes one `Mismatch`.
//
// Comparison rules:
//   date-like strings  → compared by calendar date, time and zone ignored
//   everything else    → exact equality (numbers compared numerically)

use crate::entities::{Asset, Person, Tenure};
use crate::error::Result;
use crate::record::value_at_path;
use crate::schema::Shaped;
use crate::store::{KeyValueStore, Loaded, RecordLoader};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::{info, warn};

// ============================================================================
// MISMATCH
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mismatch {
    pub source_record_id: String,
    pub source_field: String,
    pub source_value: Option<String>,
    pub target_record_id: Option<String>,
    pub target_record_type: String,
    /// None when the dependent's link to the source is missing altogether
    pub target_field: Option<String>,
    pub target_value: Option<String>,
}

impl Mismatch {
    pub fn is_missing_link(&self) -> bool {
        self.target_field.is_none()
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "<none>".to_string());
        match &self.target_field {
            Some(target_field) => write!(
                f,
                "{} {}={} != {} {} {}={}",
                self.source_record_id,
                self.source_field,
                show(&self.source_value),
                self.target_record_type,
                self.target_record_id.as_deref().unwrap_or("<unknown>"),
                target_field,
                show(&self.target_value),
            ),
            None => write!(
                f,
                "{} {}={} has no {} on {}",
                self.source_record_id,
                self.source_field,
                show(&self.source_value),
                self.target_record_type,
                self.target_record_id.as_deref().unwrap_or("<unknown>"),
            ),
        }
    }
}

// ============================================================================
// FIELD MAP + DEPENDENTS
// ============================================================================

/// Ordered authoritative-field → dependent-field pairs (dotted paths)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMap {
    pairs: Vec<(String, String)>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add one pair
    pub fn map(mut self, source: &str, target: &str) -> Self {
        self.pairs.push((source.to_string(), target.to_string()));
        self
    }

    /// Same field name on both sides
    pub fn identity(fields: &[&str]) -> Self {
        fields.iter().fold(Self::new(), |m, f| m.map(f, f))
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(s, t)| (s.as_str(), t.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Field pair that identifies which source record a dependent copy refers to
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub source_field: String,
    pub target_field: String,
}

/// One dependent copy to compare against the authoritative record
#[derive(Debug, Clone)]
pub struct Dependent {
    pub record_id: Option<String>,
    pub record_type: String,
    /// The embedded copy; None when it could not be found at all
    pub body: Option<Value>,
    pub link: Option<Link>,
    pub field_map: FieldMap,
}

impl Dependent {
    pub fn new(record_type: &str, record_id: Option<String>, body: Value, field_map: FieldMap) -> Self {
        Dependent {
            record_id,
            record_type: record_type.to_string(),
            body: Some(body),
            link: None,
            field_map,
        }
    }

    /// A dependent whose embedded copy is absent
    pub fn unlinked(record_type: &str, record_id: Option<String>, link: Link) -> Self {
        Dependent {
            record_id,
            record_type: record_type.to_string(),
            body: None,
            link: Some(link),
            field_map: FieldMap::new(),
        }
    }

    /// Builder: the link pair checked before any field comparison
    pub fn linked_by(mut self, source_field: &str, target_field: &str) -> Self {
        self.link = Some(Link {
            source_field: source_field.to_string(),
            target_field: target_field.to_string(),
        });
        self
    }
}

// ============================================================================
// TYPE-AWARE EQUALITY
// ============================================================================

/// Parse a date-like string down to its calendar date.
/// Accepts `YYYY-MM-DD`, RFC 3339 and naive `YYYY-MM-DD[T ]HH:MM:SS[.f]`.
pub fn parse_calendar_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        // The date as written, not shifted into UTC
        return Some(dt.naive_local().date());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.fZ"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|dt| dt.date())
}

pub fn values_match(left: Option<&Value>, right: Option<&Value>) -> bool {
    let left = left.filter(|v| !v.is_null());
    let right = right.filter(|v| !v.is_null());

    match (left, right) {
        (None, None) => true,
        (None, _) | (_, None) => false,
        (Some(Value::String(a)), Some(Value::String(b))) => {
            match (parse_calendar_date(a), parse_calendar_date(b)) {
                (Some(da), Some(db)) => da == db,
                _ => a == b,
            }
        }
        (Some(Value::Number(a)), Some(Value::Number(b))) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        (Some(a), Some(b)) => a == b,
    }
}

/// Render a value for a report. Dates are shown as their calendar date.
pub fn render_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(
            parse_calendar_date(s)
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| s.clone()),
        ),
        other => Some(other.to_string()),
    }
}

// ============================================================================
// MISMATCH DETECTOR
// ============================================================================

pub struct MismatchDetector {
    source_record_id: String,
}

impl MismatchDetector {
    pub fn new(source_record_id: impl Into<String>) -> Self {
        MismatchDetector {
            source_record_id: source_record_id.into(),
        }
    }

    /// Compare every dependent against the authoritative record
    pub fn detect(&self, authoritative: &Value, dependents: &[Dependent]) -> Vec<Mismatch> {
        dependents
            .iter()
            .flat_map(|dependent| self.detect_one(authoritative, dependent))
            .collect()
    }

    fn detect_one(&self, authoritative: &Value, dependent: &Dependent) -> Vec<Mismatch> {
        let mut mismatches = Vec::new();

        let body = match &dependent.body {
            Some(body) => body,
            None => {
                // The missing copy is itself the defect
                let source_field = dependent
                    .link
                    .as_ref()
                    .map(|l| l.source_field.clone())
                    .unwrap_or_else(|| "id".to_string());
                mismatches.push(self.missing_link(authoritative, dependent, &source_field));
                return mismatches;
            }
        };

        if let Some(link) = &dependent.link {
            let target = value_at_path(body, &link.target_field).filter(|v| !v.is_null());
            match target {
                None => {
                    mismatches.push(self.missing_link(authoritative, dependent, &link.source_field));
                    return mismatches;
                }
                Some(target) => {
                    let source = value_at_path(authoritative, &link.source_field);
                    if !values_match(source, Some(target)) {
                        mismatches.push(self.mismatch(
                            dependent,
                            &link.source_field,
                            source,
                            &link.target_field,
                            Some(target),
                        ));
                    }
                }
            }
        }

        for (source_field, target_field) in dependent.field_map.pairs() {
            let source = value_at_path(authoritative, source_field);
            let target = value_at_path(body, target_field);
            if !values_match(source, target) {
                mismatches.push(self.mismatch(dependent, source_field, source, target_field, target));
            }
        }

        mismatches
    }

    fn mismatch(
        &self,
        dependent: &Dependent,
        source_field: &str,
        source: Option<&Value>,
        target_field: &str,
        target: Option<&Value>,
    ) -> Mismatch {
        Mismatch {
            source_record_id: self.source_record_id.clone(),
            source_field: source_field.to_string(),
            source_value: render_value(source),
            target_record_id: dependent.record_id.clone(),
            target_record_type: dependent.record_type.clone(),
            target_field: Some(target_field.to_string()),
            target_value: render_value(target),
        }
    }

    fn missing_link(&self, authoritative: &Value, dependent: &Dependent, source_field: &str) -> Mismatch {
        Mismatch {
            source_record_id: self.source_record_id.clone(),
            source_field: source_field.to_string(),
            source_value: render_value(value_at_path(authoritative, source_field)),
            target_record_id: dependent.record_id.clone(),
            target_record_type: dependent.record_type.clone(),
            target_field: None,
            target_value: None,
        }
    }
}

/// Convenience: detect against a single authoritative record
pub fn detect(
    source_record_id: &str,
    authoritative: &Value,
    dependents: &[Dependent],
) -> Vec<Mismatch> {
    MismatchDetector::new(source_record_id).detect(authoritative, dependents)
}

// ============================================================================
// TENURE CROSS-CHECK
// ============================================================================

/// Tenure fields duplicated onto `asset.tenure`
pub fn asset_tenure_field_map() -> FieldMap {
    FieldMap::new()
        .map("tenureType.description", "tenure.type")
        .map("startOfTenureDate", "tenure.startOfTenureDate")
        .map("endOfTenureDate", "tenure.endOfTenureDate")
        .map("paymentReference", "tenure.paymentReference")
}

/// Tenure fields duplicated onto a person's `tenures[]` entry
pub fn person_tenure_field_map() -> FieldMap {
    FieldMap::new()
        .map("tenureType.description", "type")
        .map("startOfTenureDate", "startDate")
        .map("endOfTenureDate", "endDate")
        .map("paymentReference", "paymentReference")
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossCheckReport {
    pub tenure_id: String,
    pub mismatches: Vec<Mismatch>,
    /// Related records that could not be loaded or coerced
    pub unresolved: Vec<String>,
}

impl CrossCheckReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty() && self.unresolved.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Tenure {}: {} mismatch(es), {} unresolved record(s)",
            self.tenure_id,
            self.mismatches.len(),
            self.unresolved.len()
        )
    }
}

/// Checks 2-way integrity between a tenure, its asset and its household members
pub struct TenureCrossCheck<'a> {
    pub tenures: &'a dyn KeyValueStore,
    pub assets: &'a dyn KeyValueStore,
    pub persons: &'a dyn KeyValueStore,
}

impl<'a> TenureCrossCheck<'a> {
    pub fn run(&self, tenure_id: &str) -> Result<CrossCheckReport> {
        let tenure = RecordLoader::new(self.tenures)
            .load_as::<Tenure>(tenure_id)?
            .require()?
            .value;

        let mut report = CrossCheckReport {
            tenure_id: tenure.id.clone(),
            ..Default::default()
        };
        let authoritative = serde_json::to_value(&tenure)?;

        let mut dependents = Vec::new();
        self.asset_dependent(&tenure, &mut dependents, &mut report)?;
        self.person_dependents(&tenure, &mut dependents, &mut report)?;

        report.mismatches = detect(&tenure.id, &authoritative, &dependents);
        info!("{}", report.summary());
        Ok(report)
    }

    fn asset_dependent(
        &self,
        tenure: &Tenure,
        dependents: &mut Vec<Dependent>,
        report: &mut CrossCheckReport,
    ) -> Result<()> {
        let Some(asset_id) = tenure.asset_id() else {
            warn!("Tenure {} has no tenured asset", tenure.id);
            report.unresolved.push(format!("tenure {} has no tenuredAsset.id", tenure.id));
            return Ok(());
        };

        let Some(asset) = self.load_typed::<Asset>(self.assets, asset_id, report)? else {
            return Ok(());
        };

        dependents.push(
            Dependent::new(
                "assetTenure",
                Some(asset.id.clone()),
                serde_json::to_value(&asset)?,
                asset_tenure_field_map(),
            )
            .linked_by("id", "tenure.id"),
        );
        Ok(())
    }

    fn person_dependents(
        &self,
        tenure: &Tenure,
        dependents: &mut Vec<Dependent>,
        report: &mut CrossCheckReport,
    ) -> Result<()> {
        for member in &tenure.household_members {
            let Some(person_id) = member.id.as_deref() else {
                report.unresolved.push(format!(
                    "household member {} has no id",
                    member.full_name.as_deref().unwrap_or("<unnamed>")
                ));
                continue;
            };

            let Some(person) = self.load_typed::<Person>(self.persons, person_id, report)? else {
                continue;
            };

            let link = Link {
                source_field: "id".to_string(),
                target_field: "id".to_string(),
            };
            match person.tenure(&tenure.id) {
                Some(copy) => dependents.push(
                    Dependent::new(
                        "personTenure",
                        Some(person.id.clone()),
                        serde_json::to_value(copy)?,
                        person_tenure_field_map(),
                    )
                    .linked_by(&link.source_field, &link.target_field),
                ),
                None => dependents.push(Dependent::unlinked(
                    "personTenure",
                    Some(person.id.clone()),
                    link,
                )),
            }
        }
        Ok(())
    }

    /// NotFound and coercion failures are noted and skipped
    fn load_typed<T: Shaped>(
        &self,
        store: &dyn KeyValueStore,
        key: &str,
        report: &mut CrossCheckReport,
    ) -> Result<Option<T>> {
        match RecordLoader::new(store).load_as::<T>(key) {
            Ok(Loaded::Found(coerced)) => Ok(Some(coerced.value)),
            Ok(Loaded::NotFound { store, key }) => {
                warn!("{} not found in {}", key, store);
                report.unresolved.push(format!("{} not found in {}", key, store));
                Ok(None)
            }
            Err(e) if e.is_record_level() => {
                warn!("Skipping {}: {}", key, e);
                report.unresolved.push(format!("{}: {}", key, e));
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::VersionedRecord;
    use crate::store::MemoryTable;
    use serde_json::json;

    fn tenure_body() -> Value {
        json!({
            "id": "T1",
            "startOfTenureDate": "2020-01-01T00:00:00Z",
            "householdMembers": [{"id": "P1", "startDate": "2020-01-01"}]
        })
    }

    #[test]
    fn test_equal_dates_in_different_formats_match() {
        let tenure = tenure_body();
        let member = tenure["householdMembers"][0].clone();
        let dependents = vec![Dependent::new(
            "householdMember",
            Some("P1".to_string()),
            member,
            FieldMap::new().map("startOfTenureDate", "startDate"),
        )];

        assert!(detect("T1", &tenure, &dependents).is_empty());
    }

    #[test]
    fn test_different_calendar_date_is_reported() {
        let tenure = tenure_body();
        let dependents = vec![Dependent::new(
            "householdMember",
            Some("P1".to_string()),
            json!({"id": "P1", "startDate": "2020-01-02"}),
            FieldMap::new().map("startOfTenureDate", "startDate"),
        )];

        let mismatches = detect("T1", &tenure, &dependents);
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].source_value.as_deref(), Some("2020-01-01"));
        assert_eq!(mismatches[0].target_value.as_deref(), Some("2020-01-02"));
        assert_eq!(mismatches[0].target_field.as_deref(), Some("startDate"));
        assert_eq!(mismatches[0].target_record_id.as_deref(), Some("P1"));
    }

    #[test]
    fn test_identical_copy_has_no_mismatches() {
        let record = json!({"id": "T1", "paymentReference": "1234", "charges": 12.5, "flag": true});
        let dependents = vec![Dependent::new(
            "copy",
            Some("C1".to_string()),
            record.clone(),
            FieldMap::identity(&["id", "paymentReference", "charges", "flag"]),
        )];
        assert!(detect("T1", &record, &dependents).is_empty());
    }

    #[test]
    fn test_date_tolerance_ignores_time_and_zone() {
        let a = json!("2021-03-04T23:15:00Z");
        let b = json!("2021-03-04");
        let c = json!("2021-03-04T00:00:00");
        let d = json!("2021-03-05T00:00:00Z");
        assert!(values_match(Some(&a), Some(&b)));
        assert!(values_match(Some(&b), Some(&c)));
        assert!(!values_match(Some(&a), Some(&d)));
    }

    #[test]
    fn test_null_handling() {
        assert!(values_match(None, Some(&Value::Null)));
        assert!(!values_match(Some(&json!("2020-01-01")), None));
        assert!(values_match(Some(&json!(1)), Some(&json!(1.0))));
        assert!(!values_match(Some(&json!("1")), Some(&json!(1))));
    }

    #[test]
    fn test_absent_link_reports_null_target() {
        let tenure = tenure_body();
        let dependents = vec![Dependent::new(
            "assetTenure",
            Some("A1".to_string()),
            json!({"id": "A1", "tenure": null}),
            asset_tenure_field_map(),
        )
        .linked_by("id", "tenure.id")];

        let mismatches = detect("T1", &tenure, &dependents);
        assert_eq!(mismatches.len(), 1);
        assert!(mismatches[0].is_missing_link());
        assert_eq!(mismatches[0].target_value, None);
        assert_eq!(mismatches[0].source_value.as_deref(), Some("T1"));
    }

    #[test]
    fn test_unlinked_dependent_is_reported() {
        let link = Link {
            source_field: "id".to_string(),
            target_field: "id".to_string(),
        };
        let dependents = vec![Dependent::unlinked("personTenure", Some("P9".to_string()), link)];
        let mismatches = detect("T1", &tenure_body(), &dependents);
        assert_eq!(mismatches.len(), 1);
        assert!(mismatches[0].to_string().contains("has no personTenure on P9"));
    }

    fn seeded_stores() -> (MemoryTable, MemoryTable, MemoryTable) {
        let tenures = MemoryTable::new("TenureInformation");
        let assets = MemoryTable::new("Assets");
        let persons = MemoryTable::new("Persons");

        tenures.insert(
            VersionedRecord::from_item(json!({
                "id": "T1",
                "paymentReference": "228001234",
                "startOfTenureDate": "2020-01-01T00:00:00",
                "endOfTenureDate": null,
                "tenureType": {"code": "SEC", "description": "Secure"},
                "tenuredAsset": {"id": "A1"},
                "householdMembers": [
                    {"id": "P1", "fullName": "Jo Bloggs"},
                    {"id": "P2", "fullName": "Sam Bloggs"},
                    {"id": "P3", "fullName": "Ghost Bloggs"}
                ]
            }))
            .unwrap(),
        );
        assets.insert(
            VersionedRecord::from_item(json!({
                "id": "A1",
                "assetId": "00012345",
                "tenure": {
                    "id": "T1",
                    "type": "Secure",
                    "paymentReference": "228001234",
                    "startOfTenureDate": "2020-01-01"
                }
            }))
            .unwrap(),
        );
        persons.insert(
            VersionedRecord::from_item(json!({
                "id": "P1",
                "tenures": [{
                    "id": "T1",
                    "type": "Introductory",
                    "paymentReference": "228001234",
                    "startDate": "2020-01-01T00:00:00Z"
                }]
            }))
            .unwrap(),
        );
        persons.insert(
            VersionedRecord::from_item(json!({"id": "P2", "tenures": []})).unwrap(),
        );
        (tenures, assets, persons)
    }

    #[test]
    fn test_tenure_cross_check_pass() {
        let (tenures, assets, persons) = seeded_stores();
        let check = TenureCrossCheck {
            tenures: &tenures,
            assets: &assets,
            persons: &persons,
        };

        let report = check.run("T1").unwrap();

        // P1 has the wrong type, P2 has no entry, P3 does not exist
        assert_eq!(report.mismatches.len(), 2);
        assert_eq!(report.mismatches[0].target_record_id.as_deref(), Some("P1"));
        assert_eq!(report.mismatches[0].target_field.as_deref(), Some("type"));
        assert_eq!(report.mismatches[0].source_value.as_deref(), Some("Secure"));
        assert!(report.mismatches[1].is_missing_link());
        assert_eq!(report.mismatches[1].target_record_id.as_deref(), Some("P2"));
        assert_eq!(report.unresolved.len(), 1);
        assert!(report.unresolved[0].contains("P3"));
        assert!(!report.is_consistent());
    }

    #[test]
    fn test_tenure_cross_check_missing_tenure_is_error() {
        let (tenures, assets, persons) = seeded_stores();
        let check = TenureCrossCheck {
            tenures: &tenures,
            assets: &assets,
            persons: &persons,
        };
        assert!(check.run("T404").is_err());
    }

    #[test]
    fn test_uncoercible_person_is_unresolved_not_fatal() {
        let (tenures, assets, persons) = seeded_stores();
        persons.insert(VersionedRecord::new("P3").with_field("tenures", json!("T1")));
        let check = TenureCrossCheck {
            tenures: &tenures,
            assets: &assets,
            persons: &persons,
        };

        let report = check.run("T1").unwrap();

        assert_eq!(report.mismatches.len(), 2);
        assert_eq!(report.unresolved.len(), 1);
        assert!(report.unresolved[0].starts_with("P3: Cannot coerce Person.tenures"));
    }
}
