// 🔗 Alert cross-reference - relational alert rows against person records
//
// Rows come from the alerts database, one per cautionary alert, naming the
// person (mmh_id) and the property the alert was raised on. That person's
// active tenure should be on the same property.

use crate::alerts::normalize_property_reference;
use crate::entities::{Person, PersonTenure};
use crate::error::{Error, Result};
use crate::progress::{PassTally, ProgressReporter};
use crate::reconciliation::{detect, parse_calendar_date, Dependent, FieldMap, Link, Mismatch};
use crate::schema::{coerce, FieldKind, Shape, Shaped};
use crate::store::{KeyValueStore, RecordLoader};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

pub const DEFAULT_ALERT_QUERY: &str =
    "SELECT alert_id, mmh_id, property_reference, person_name, code FROM cautionary_alerts";

/// One row of the cautionary alerts table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRow {
    pub alert_id: String,
    pub mmh_id: Option<String>,
    pub property_reference: Option<String>,
    pub person_name: Option<String>,
    pub code: Option<String>,
}

impl Shaped for AlertRow {
    fn shape() -> Shape {
        Shape::new("AlertRow")
            .field("alert_id", FieldKind::Text)
            .field("mmh_id", FieldKind::Text)
            .field("property_reference", FieldKind::Text)
            .field("person_name", FieldKind::Text)
            .field("code", FieldKind::Text)
    }
}

/// Open-ended, ending today or later, or carrying the 1900 placeholder end date
pub fn is_tenure_active(tenure: &PersonTenure, today: NaiveDate) -> bool {
    let Some(end) = tenure.end_date.as_deref().filter(|e| !e.is_empty()) else {
        return true;
    };
    if end.contains("1900") {
        return true;
    }
    match parse_calendar_date(end) {
        Some(end) => end >= today,
        None => {
            warn!("Unreadable tenure end date {} on {:?}", end, tenure.id);
            false
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct CrossRefReport {
    pub mismatches: Vec<Mismatch>,
    /// Rows that could not be checked, with the reason
    pub unresolved: Vec<String>,
    pub tally: PassTally,
}

pub struct AlertCrossRef<'a> {
    pub persons: &'a dyn KeyValueStore,
    pub today: NaiveDate,
}

impl<'a> AlertCrossRef<'a> {
    pub fn check(&self, rows: &[Map<String, Value>], reporter: Option<&ProgressReporter>) -> Result<CrossRefReport> {
        let mut report = CrossRefReport::default();

        for (i, row) in rows.iter().enumerate() {
            report.tally.scanned += 1;
            match self.check_row(row) {
                Ok(mismatches) if mismatches.is_empty() => report.tally.matched += 1,
                Ok(mismatches) => {
                    report.tally.failed += 1;
                    report.mismatches.extend(mismatches);
                }
                Err(e) if e.is_record_level() => {
                    let alert = row.get("alert_id").map(Value::to_string).unwrap_or_default();
                    warn!("Alert {}: {}", alert, e);
                    report.unresolved.push(format!("alert {}: {}", alert, e));
                    report.tally.skipped += 1;
                }
                Err(e) => return Err(e),
            }
            if let Some(reporter) = reporter {
                reporter.tick(i + 1, &format!("{} mismatched", report.tally.failed));
            }
        }

        info!(
            "Cross-referenced {} alert(s): {} mismatch(es), {} unresolved",
            report.tally.scanned,
            report.mismatches.len(),
            report.unresolved.len()
        );
        Ok(report)
    }

    fn check_row(&self, row: &Map<String, Value>) -> Result<Vec<Mismatch>> {
        let alert = coerce::<AlertRow>(&Value::Object(row.clone()))?.value;
        let person_id = alert
            .mmh_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::coercion("AlertRow", "mmh_id", "no person id"))?;

        let person = RecordLoader::new(self.persons)
            .load_as::<Person>(person_id)?
            .require()?
            .value;

        let active: Vec<&PersonTenure> = person
            .tenures
            .iter()
            .filter(|t| is_tenure_active(t, self.today))
            .collect();
        if active.len() > 1 {
            warn!("More than one active tenure for person {}", person.id);
        }

        let reference = |raw: Option<&str>| {
            raw.map(|r| normalize_property_reference(r).unwrap_or_else(|| r.to_string()))
        };
        let authoritative = json!({
            "alertId": alert.alert_id,
            "propertyReference": reference(alert.property_reference.as_deref()),
        });

        let dependent = match active.first() {
            Some(tenure) => {
                let mut body = serde_json::to_value(tenure)?;
                body["propertyReference"] = json!(reference(tenure.property_reference.as_deref()));
                Dependent::new(
                    "personTenure",
                    Some(person.id.clone()),
                    body,
                    FieldMap::identity(&["propertyReference"]),
                )
            }
            None => {
                warn!("No active tenure for person {}", person.id);
                Dependent::unlinked(
                    "personTenure",
                    Some(person.id.clone()),
                    Link {
                        source_field: "propertyReference".to_string(),
                        target_field: "propertyReference".to_string(),
                    },
                )
            }
        };

        Ok(detect(&alert.alert_id, &authoritative, &[dependent]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{query_records, setup_database};
    use crate::record::VersionedRecord;
    use crate::store::MemoryTable;
    use rusqlite::Connection;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn tenure(property_reference: &str, end: Option<&str>) -> PersonTenure {
        PersonTenure {
            id: Some(format!("t-{}", property_reference)),
            asset_id: None,
            property_reference: Some(property_reference.to_string()),
            uprn: None,
            asset_full_address: None,
            payment_reference: None,
            start_date: None,
            end_date: end.map(str::to_string),
            tenure_type: None,
        }
    }

    #[test]
    fn test_active_tenure_rules() {
        assert!(is_tenure_active(&tenure("1", None), today()));
        assert!(is_tenure_active(&tenure("1", Some("2024-03-01T00:00:00")), today()));
        assert!(is_tenure_active(&tenure("1", Some("1900-01-01")), today()));
        assert!(!is_tenure_active(&tenure("1", Some("2023-12-31")), today()));
        assert!(!is_tenure_active(&tenure("1", Some("soon")), today()));
    }

    #[test]
    fn test_alert_rows_from_sql_against_persons() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn.execute_batch(
            "CREATE TABLE cautionary_alerts (
                 alert_id INTEGER, mmh_id TEXT, property_reference TEXT, person_name TEXT, code TEXT
             );
             INSERT INTO cautionary_alerts VALUES (1, 'p1', '1234', 'Jo Bloggs', 'VA');
             INSERT INTO cautionary_alerts VALUES (2, 'p2', '00005555', 'Sam Bloggs', 'VA');
             INSERT INTO cautionary_alerts VALUES (3, 'p3', '00007777', 'Alex Smith', 'DA');
             INSERT INTO cautionary_alerts VALUES (4, 'p404', '00001111', 'Nobody', 'VA');
             INSERT INTO cautionary_alerts VALUES (5, NULL, '00001111', 'Unlinked', 'VA');",
        )
        .unwrap();

        let persons = MemoryTable::new("Persons");
        let with_tenures = |id: &str, tenures: Vec<PersonTenure>| {
            VersionedRecord::new(id).with_field("tenures", serde_json::to_value(tenures).unwrap())
        };
        persons.insert(with_tenures(
            "p1",
            vec![tenure("00009999", Some("2010-01-01")), tenure("00001234", None)],
        ));
        persons.insert(with_tenures("p2", vec![tenure("00006666", None)]));
        persons.insert(with_tenures("p3", vec![tenure("00007777", Some("2020-01-01"))]));

        let rows = query_records(&conn, DEFAULT_ALERT_QUERY, []).unwrap();
        let report = AlertCrossRef {
            persons: &persons,
            today: today(),
        }
        .check(&rows, None)
        .unwrap();

        assert_eq!(report.tally.scanned, 5);
        assert_eq!(report.tally.matched, 1);
        assert_eq!(report.tally.failed, 2);
        assert_eq!(report.tally.skipped, 2);

        let wrong_property = &report.mismatches[0];
        assert_eq!(wrong_property.source_record_id, "2");
        assert_eq!(wrong_property.source_value.as_deref(), Some("00005555"));
        assert_eq!(wrong_property.target_value.as_deref(), Some("00006666"));

        let no_active_tenure = &report.mismatches[1];
        assert_eq!(no_active_tenure.target_record_id.as_deref(), Some("p3"));
        assert!(no_active_tenure.is_missing_link());

        assert!(report.unresolved[0].contains("p404"));
        assert!(report.unresolved[1].contains("no person id"));
    }
}
