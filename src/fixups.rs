// 🔧 Asset-tenure fixups
//
// Three passes over a list of properties whose asset still points at an old
// tenure:
//   plan   = tenancy sheet → asset (by property ref) → tenures at the asset
//            (newest first) → Fixup, written to JSON for human review
//   apply  = set asset.tenure to the newest tenure, in the table and then
//            the search index, each write confirmed separately
//   verify = re-read both stores and report anything that did not land

use crate::alerts::normalize_property_reference;
use crate::entities::{Asset, AssetTenure, Tenure};
use crate::error::{Error, Result};
use crate::patch::{count_failure, ApplyOutcome, ApplyReport, Confirm, FieldUpdates, PatchApplier};
use crate::progress::ProgressReporter;
use crate::reconciliation::parse_calendar_date;
use crate::record::value_at_path;
use crate::schema::coerce;
use crate::store::{
    lookup_unique, DocumentStore, KeyValueStore, RecordLoader, SearchQuery, SecondaryIndex,
};
use crate::tabular::{read_typed, TextFormat};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::io::Read;
use std::path::Path;
use tracing::{info, warn};

/// One line of the tenancies-to-fix sheet
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TenancyRow {
    pub property_ref: String,
    #[serde(default)]
    pub tenure_description: String,
    #[serde(default)]
    pub payment_ref: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub full_address: String,
    #[serde(default)]
    pub start_date: String,
    #[serde(default)]
    pub end_date: String,
    #[serde(default)]
    pub buy_back_date: String,
}

pub fn read_tenancy_rows<R: Read>(reader: R) -> Result<Vec<TenancyRow>> {
    read_typed(reader, TextFormat::Tsv)
}

/// Proposed change to one asset's embedded tenure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fixup {
    pub prop_id: String,
    pub prop_ref: String,
    pub address: String,
    pub current_tenure: Option<AssetTenure>,
    /// Newest first; the first entry is the one applied
    pub new_tenures: Vec<AssetTenure>,
}

impl Fixup {
    pub fn proposed(&self) -> Option<&AssetTenure> {
        self.new_tenures.first()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedRow {
    pub prop_ref: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FixupPlan {
    pub fixups: Vec<Fixup>,
    pub skipped: Vec<SkippedRow>,
}

pub fn write_plan(path: &Path, fixups: &[Fixup]) -> Result<()> {
    let json = serde_json::to_string_pretty(fixups)?;
    std::fs::write(path, json)?;
    info!("Wrote {} fixup(s) to {}", fixups.len(), path.display());
    Ok(())
}

pub fn read_plan(path: &Path) -> Result<Vec<Fixup>> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

// ============================================================================
// PLAN
// ============================================================================

pub struct FixupPlanner<'a> {
    pub assets: &'a dyn KeyValueStore,
    pub tenures: &'a dyn KeyValueStore,
    pub tenure_search: &'a dyn DocumentStore,
    pub asset_index: SecondaryIndex,
}

impl<'a> FixupPlanner<'a> {
    pub fn plan(&self, rows: &[TenancyRow], reporter: Option<&ProgressReporter>) -> Result<FixupPlan> {
        let mut plan = FixupPlan::default();

        for (i, row) in rows.iter().enumerate() {
            info!("Getting tenancy for property: {}", row.property_ref);
            match self.plan_row(row) {
                Ok(fixup) => plan.fixups.push(fixup),
                Err(e) if e.is_record_level() => {
                    warn!("Skipping property {}: {}", row.property_ref, e);
                    plan.skipped.push(SkippedRow {
                        prop_ref: row.property_ref.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
            if let Some(reporter) = reporter {
                reporter.tick(i + 1, &row.property_ref);
            }
        }

        info!(
            "Planned {} fixup(s), skipped {} row(s)",
            plan.fixups.len(),
            plan.skipped.len()
        );
        Ok(plan)
    }

    fn plan_row(&self, row: &TenancyRow) -> Result<Fixup> {
        let reference = normalize_property_reference(&row.property_ref).ok_or_else(|| {
            Error::coercion("TenancyRow", "property_ref", format!("invalid reference {}", row.property_ref))
        })?;

        let asset_record =
            lookup_unique(self.assets, &self.asset_index, &reference)?.into_unique(&self.asset_index, &reference)?;
        let asset = coerce::<Asset>(&asset_record.to_item())?.value;
        let current_tenure = asset.tenure.clone();
        if current_tenure.is_none() {
            warn!("Asset {} has no current tenure", asset.id);
        }

        let mut new_tenures = Vec::new();
        for hit in self.tenures_at_asset(&asset.id)? {
            let Some(tenure_id) = hit.get("id").and_then(Value::as_str) else {
                continue;
            };
            // Search documents can lag; the tenure table is authoritative
            let tenure = RecordLoader::new(self.tenures)
                .load_as::<Tenure>(tenure_id)?
                .require()?
                .value;
            info!("Found new tenure {} for asset {}", tenure.id, asset.id);
            new_tenures.push(AssetTenure::from_tenure(&tenure));
        }

        if new_tenures.is_empty() {
            return Err(Error::not_found(self.tenure_search.index_name(), format!("tenuredAsset.id={}", asset.id)));
        }

        Ok(Fixup {
            prop_id: asset.id,
            prop_ref: reference,
            address: row.full_address.clone(),
            current_tenure,
            new_tenures,
        })
    }

    /// Tenures held on an asset, newest start date first
    fn tenures_at_asset(&self, asset_id: &str) -> Result<Vec<Value>> {
        let mut hits = self
            .tenure_search
            .search(&SearchQuery::term("tenuredAsset.id", asset_id))?;

        let start = |doc: &Value| {
            doc.get("startOfTenureDate")
                .and_then(Value::as_str)
                .and_then(parse_calendar_date)
        };
        hits.sort_by(|a, b| start(b).cmp(&start(a)));
        Ok(hits)
    }
}

// ============================================================================
// APPLY
// ============================================================================

fn current_tenure_id(body: &Value) -> Option<&str> {
    value_at_path(body, "tenure.id").and_then(Value::as_str)
}

fn tenure_update(proposed: &AssetTenure) -> Result<FieldUpdates> {
    Ok(FieldUpdates::new().set("tenure", serde_json::to_value(proposed)?))
}

pub struct FixupApplier<'a> {
    pub patcher: &'a PatchApplier,
}

impl<'a> FixupApplier<'a> {
    pub fn apply_to_table<S, C>(&self, assets: &S, fixups: &[Fixup], confirm: &mut C) -> Result<ApplyReport>
    where
        S: KeyValueStore + ?Sized,
        C: Confirm + ?Sized,
    {
        let mut report = ApplyReport::default();
        for fixup in fixups {
            report.tally.scanned += 1;
            let Some(proposed) = fixup.proposed() else {
                warn!("Fixup for {} proposes no tenure", fixup.prop_id);
                report.tally.skipped += 1;
                continue;
            };
            let Some(proposed_id) = proposed.id.as_deref() else {
                warn!("Fixup for {} proposes a tenure with no id", fixup.prop_id);
                report.tally.failed += 1;
                continue;
            };

            let record = match RecordLoader::new(assets).load(&fixup.prop_id)?.require() {
                Ok(record) => record,
                Err(e) => {
                    count_failure(&mut report.tally, &fixup.prop_id, e)?;
                    continue;
                }
            };
            report.tally.matched += 1;

            if current_tenure_id(&record.to_item()) == Some(proposed_id) {
                info!("Property {} already has the correct tenure assigned", fixup.prop_id);
                report.tally.skipped += 1;
                continue;
            }

            match self.patcher.apply(assets, &record, &tenure_update(proposed)?, confirm) {
                Ok(ApplyOutcome::Applied { event, .. }) => {
                    report.tally.updated += 1;
                    report.events.push(event);
                }
                Ok(ApplyOutcome::Declined) => report.tally.declined += 1,
                Err(e) => count_failure(&mut report.tally, &fixup.prop_id, e)?,
            }
        }

        info!("Asset table: {}", report.tally.summary());
        Ok(report)
    }

    pub fn apply_to_index<D, C>(&self, index: &D, fixups: &[Fixup], confirm: &mut C) -> Result<ApplyReport>
    where
        D: DocumentStore + ?Sized,
        C: Confirm + ?Sized,
    {
        let mut report = ApplyReport::default();
        for fixup in fixups {
            report.tally.scanned += 1;
            let Some(proposed) = fixup.proposed() else {
                report.tally.skipped += 1;
                continue;
            };
            let Some(proposed_id) = proposed.id.as_deref() else {
                warn!("Fixup for {} proposes a tenure with no id", fixup.prop_id);
                report.tally.failed += 1;
                continue;
            };

            let Some(document) = index.get(&fixup.prop_id)? else {
                count_failure(
                    &mut report.tally,
                    &fixup.prop_id,
                    Error::not_found(index.index_name(), &fixup.prop_id),
                )?;
                continue;
            };
            report.tally.matched += 1;

            if current_tenure_id(&document) == Some(proposed_id) {
                info!("Property {} already has the correct tenure assigned", fixup.prop_id);
                report.tally.skipped += 1;
                continue;
            }

            match self
                .patcher
                .apply_document(index, &fixup.prop_id, &tenure_update(proposed)?, confirm)
            {
                Ok(outcome) if outcome.applied => {
                    report.tally.updated += 1;
                    report.events.extend(outcome.event);
                }
                Ok(_) => report.tally.declined += 1,
                Err(e) => count_failure(&mut report.tally, &fixup.prop_id, e)?,
            }
        }

        info!("Asset search index: {}", report.tally.summary());
        Ok(report)
    }
}

// ============================================================================
// VERIFY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyFinding {
    Missing {
        store: String,
        prop_id: String,
    },
    TenureDiffers {
        store: String,
        prop_id: String,
        expected: String,
        found: Option<String>,
    },
    TypeDiffers {
        store: String,
        prop_id: String,
        expected: String,
        found: Option<String>,
    },
    Leasehold {
        store: String,
        prop_id: String,
        prop_ref: String,
    },
}

impl fmt::Display for VerifyFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyFinding::Missing { store, prop_id } => write!(f, "{} has no record {}", store, prop_id),
            VerifyFinding::TenureDiffers { store, prop_id, expected, found } => write!(
                f,
                "{} {}: tenure.id is {} but should be {}",
                store,
                prop_id,
                found.as_deref().unwrap_or("null"),
                expected
            ),
            VerifyFinding::TypeDiffers { store, prop_id, expected, found } => write!(
                f,
                "{} {}: tenure.type is {} but should contain {}",
                store,
                prop_id,
                found.as_deref().unwrap_or("null"),
                expected
            ),
            VerifyFinding::Leasehold { store, prop_id, prop_ref } => {
                write!(f, "WARNING: {} {} - {} has a leasehold", store, prop_id, prop_ref)
            }
        }
    }
}

impl VerifyFinding {
    /// Leaseholds are reported but are not a failed fixup
    pub fn is_warning(&self) -> bool {
        matches!(self, VerifyFinding::Leasehold { .. })
    }
}

fn verify_body(store: &str, fixup: &Fixup, expected: &AssetTenure, body: &Value, findings: &mut Vec<VerifyFinding>) {
    let found_id = current_tenure_id(body).map(str::to_string);
    let expected_id = expected.id.clone().unwrap_or_default();
    if found_id.as_deref() != Some(expected_id.as_str()) {
        findings.push(VerifyFinding::TenureDiffers {
            store: store.to_string(),
            prop_id: fixup.prop_id.clone(),
            expected: expected_id,
            found: found_id,
        });
        return;
    }

    let found_type = value_at_path(body, "tenure.type").and_then(Value::as_str);
    let expected_type = expected.tenure_type.as_deref().unwrap_or("");
    if !found_type.is_some_and(|t| t.contains(expected_type)) {
        findings.push(VerifyFinding::TypeDiffers {
            store: store.to_string(),
            prop_id: fixup.prop_id.clone(),
            expected: expected_type.to_string(),
            found: found_type.map(str::to_string),
        });
    }
    if found_type.is_some_and(|t| t.to_lowercase().contains("leasehold")) {
        findings.push(VerifyFinding::Leasehold {
            store: store.to_string(),
            prop_id: fixup.prop_id.clone(),
            prop_ref: fixup.prop_ref.clone(),
        });
    }
}

/// Re-read the table and (optionally) the search index for every fixup
pub fn verify(
    assets: &dyn KeyValueStore,
    index: Option<&dyn DocumentStore>,
    fixups: &[Fixup],
) -> Result<Vec<VerifyFinding>> {
    let mut findings = Vec::new();

    for fixup in fixups.iter().rev() {
        info!("Verifying property {}", fixup.prop_id);
        let Some(expected) = fixup.proposed() else {
            continue;
        };
        let before = findings.len();

        match assets.get(&fixup.prop_id)? {
            Some(record) => verify_body(assets.name(), fixup, expected, &record.to_item(), &mut findings),
            None => findings.push(VerifyFinding::Missing {
                store: assets.name().to_string(),
                prop_id: fixup.prop_id.clone(),
            }),
        }

        if let Some(index) = index {
            match index.get(&fixup.prop_id)? {
                Some(doc) => verify_body(index.index_name(), fixup, expected, &doc, &mut findings),
                None => findings.push(VerifyFinding::Missing {
                    store: index.index_name().to_string(),
                    prop_id: fixup.prop_id.clone(),
                }),
            }
        }

        let new = &findings[before..];
        if new.iter().any(|f| f.is_warning()) {
            warn!("WARNING: Property {} - {} has a leasehold", fixup.prop_id, fixup.prop_ref);
        }
        if new.iter().all(|f| f.is_warning()) {
            info!("Property {} has been updated correctly", fixup.prop_id);
        }
    }

    Ok(findings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::VersionedRecord;
    use crate::store::{MemoryIndex, MemoryTable};
    use serde_json::json;

    fn asset_index() -> SecondaryIndex {
        SecondaryIndex::new("AssetId", "assetId")
    }

    fn old_tenure() -> Value {
        json!({"id": "t-old", "paymentReference": "111", "type": "Secure",
               "startOfTenureDate": "2001-04-02", "endOfTenureDate": "2019-01-01"})
    }

    struct Fixture {
        assets: MemoryTable,
        tenures: MemoryTable,
        tenure_search: MemoryIndex,
        asset_search: MemoryIndex,
    }

    fn fixture() -> Fixture {
        let assets = MemoryTable::new("Assets").with_index(&asset_index());
        let asset = VersionedRecord::new("a1")
            .with_version(2)
            .with_field("assetId", json!("00012345"))
            .with_field("tenure", old_tenure());
        assets.insert(asset.clone());

        let tenures = MemoryTable::new("TenureInformation");
        let tenure_search = MemoryIndex::new("tenures");
        for (id, start, description) in [
            ("t-old", "2001-04-02T00:00:00", "Secure"),
            ("t-new", "2020-06-01T00:00:00", "Introductory"),
        ] {
            let tenure = json!({
                "id": id,
                "paymentReference": format!("pay-{}", id),
                "startOfTenureDate": start,
                "tenureType": {"code": "X", "description": description},
                "tenuredAsset": {"id": "a1"}
            });
            tenures.insert(VersionedRecord::from_item(tenure.clone()).unwrap());
            tenure_search.index(id, &tenure).unwrap();
        }
        // Search document with a stale type; the table copy wins
        tenure_search
            .update("t-new", &json!({"tenureType": {"description": "Stale"}}).as_object().unwrap().clone())
            .unwrap();

        let asset_search = MemoryIndex::new("assets");
        asset_search.index("a1", &asset.to_item()).unwrap();

        Fixture {
            assets,
            tenures,
            tenure_search,
            asset_search,
        }
    }

    fn planner(f: &Fixture) -> FixupPlanner<'_> {
        FixupPlanner {
            assets: &f.assets,
            tenures: &f.tenures,
            tenure_search: &f.tenure_search,
            asset_index: asset_index(),
        }
    }

    fn row(property_ref: &str) -> TenancyRow {
        TenancyRow {
            property_ref: property_ref.to_string(),
            full_address: "1 Mare Street".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_read_tenancy_rows() {
        let input = "property_ref\ttenure_description\tpayment_ref\tfull_name\tfull_address\tstart_date\tend_date\tbuy_back_date\n\
                     12345\tIntroductory\t228001\tJo Bloggs\t1 Mare Street\t2020-06-01\t\t\n";
        let rows = read_tenancy_rows(input.as_bytes()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].property_ref, "12345");
        assert_eq!(rows[0].full_address, "1 Mare Street");
        assert_eq!(rows[0].end_date, "");
    }

    #[test]
    fn test_plan_orders_newest_first_from_authoritative_table() {
        let f = fixture();
        let plan = planner(&f).plan(&[row("12345"), row("999")], None).unwrap();

        assert_eq!(plan.fixups.len(), 1);
        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.skipped[0].prop_ref, "999");

        let fixup = &plan.fixups[0];
        assert_eq!(fixup.prop_id, "a1");
        assert_eq!(fixup.prop_ref, "00012345");
        assert_eq!(fixup.current_tenure.as_ref().and_then(|t| t.id.as_deref()), Some("t-old"));
        let ids: Vec<_> = fixup.new_tenures.iter().filter_map(|t| t.id.as_deref()).collect();
        assert_eq!(ids, vec!["t-new", "t-old"]);
        assert_eq!(fixup.new_tenures[0].tenure_type.as_deref(), Some("Introductory"));
    }

    #[test]
    fn test_plan_round_trips_through_json_file() {
        let f = fixture();
        let plan = planner(&f).plan(&[row("12345")], None).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixups.json");
        write_plan(&path, &plan.fixups).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("\n    "));
        assert_eq!(read_plan(&path).unwrap(), plan.fixups);
    }

    #[test]
    fn test_apply_then_verify() {
        let f = fixture();
        let fixups = planner(&f).plan(&[row("12345")], None).unwrap().fixups;
        let patcher = PatchApplier::new("test");
        let applier = FixupApplier { patcher: &patcher };

        let table = applier.apply_to_table(&f.assets, &fixups, &mut |_: &str| true).unwrap();
        assert_eq!(table.tally.updated, 1);
        assert_eq!(table.events.len(), 1);

        let stored = f.assets.get("a1").unwrap().unwrap();
        assert_eq!(stored.version_number, Some(3));
        assert_eq!(stored.get_path("tenure.id"), Some(&json!("t-new")));

        // Index not yet patched
        let findings = verify(&f.assets, Some(&f.asset_search), &fixups).unwrap();
        assert!(matches!(&findings[..], [VerifyFinding::TenureDiffers { store, .. }] if store == "assets"));

        let index = applier.apply_to_index(&f.asset_search, &fixups, &mut |_: &str| true).unwrap();
        assert_eq!(index.tally.updated, 1);
        assert!(verify(&f.assets, Some(&f.asset_search), &fixups).unwrap().is_empty());
    }

    #[test]
    fn test_second_apply_is_a_no_op() {
        let f = fixture();
        let fixups = planner(&f).plan(&[row("12345")], None).unwrap().fixups;
        let patcher = PatchApplier::new("test");
        let applier = FixupApplier { patcher: &patcher };

        let first = applier.apply_to_table(&f.assets, &fixups, &mut |_: &str| true).unwrap();
        let mut asked = 0;
        let second = applier
            .apply_to_table(&f.assets, &fixups, &mut |_: &str| {
                asked += 1;
                true
            })
            .unwrap();

        assert_eq!(first.tally.updated, 1);
        assert_eq!(second.tally.updated, 0);
        assert_eq!(second.tally.skipped, 1);
        assert_eq!(asked, 0);
        assert_eq!(f.assets.get("a1").unwrap().unwrap().version_number, Some(3));
    }

    #[test]
    fn test_declined_fixup_leaves_asset_alone() {
        let f = fixture();
        let fixups = planner(&f).plan(&[row("12345")], None).unwrap().fixups;
        let patcher = PatchApplier::new("test");
        let report = FixupApplier { patcher: &patcher }
            .apply_to_table(&f.assets, &fixups, &mut |_: &str| false)
            .unwrap();

        assert_eq!(report.tally.declined, 1);
        assert!(report.events.is_empty());
        assert_eq!(f.assets.get("a1").unwrap().unwrap().get_path("tenure.id"), Some(&json!("t-old")));
    }

    #[test]
    fn test_uncoercible_asset_skips_only_its_row() {
        let f = fixture();
        f.assets.insert(
            VersionedRecord::new("a2")
                .with_field("assetId", json!("00022222"))
                .with_field("tenure", json!("oops")),
        );

        let plan = planner(&f).plan(&[row("22222"), row("12345")], None).unwrap();

        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.skipped[0].prop_ref, "22222");
        assert!(plan.skipped[0].reason.starts_with("Cannot coerce Asset.tenure"));
        assert_eq!(plan.fixups.len(), 1);
        assert_eq!(plan.fixups[0].prop_id, "a1");
    }

    #[test]
    fn test_tenure_without_id_is_a_failure_not_a_match() {
        let f = fixture();
        f.assets.insert(VersionedRecord::new("a9").with_field("tenure", json!({"type": "Secure"})));
        f.asset_search.index("a9", &json!({"id": "a9", "tenure": {"type": "Secure"}})).unwrap();
        let fixups = vec![Fixup {
            prop_id: "a9".to_string(),
            prop_ref: "00099999".to_string(),
            address: String::new(),
            current_tenure: None,
            new_tenures: vec![AssetTenure {
                id: None,
                payment_reference: None,
                tenure_type: Some("Secure".to_string()),
                start_of_tenure_date: None,
                end_of_tenure_date: None,
            }],
        }];
        let patcher = PatchApplier::new("test");
        let applier = FixupApplier { patcher: &patcher };

        let table = applier.apply_to_table(&f.assets, &fixups, &mut |_: &str| true).unwrap();
        assert_eq!(table.tally.failed, 1);
        assert_eq!(table.tally.skipped, 0);
        assert!(table.events.is_empty());

        let index = applier.apply_to_index(&f.asset_search, &fixups, &mut |_: &str| true).unwrap();
        assert_eq!(index.tally.failed, 1);
        assert_eq!(index.tally.skipped, 0);
    }

    #[test]
    fn test_verify_flags_leasehold() {
        let f = fixture();
        let fixups = vec![Fixup {
            prop_id: "a1".to_string(),
            prop_ref: "00012345".to_string(),
            address: String::new(),
            current_tenure: None,
            new_tenures: vec![AssetTenure {
                id: Some("t-old".to_string()),
                payment_reference: None,
                tenure_type: Some("Secure".to_string()),
                start_of_tenure_date: None,
                end_of_tenure_date: None,
            }],
        }];
        f.assets.insert(
            f.assets
                .get("a1")
                .unwrap()
                .unwrap()
                .with_field("tenure", json!({"id": "t-old", "type": "Secure (Leasehold)"})),
        );

        let findings = verify(&f.assets, None, &fixups).unwrap();
        assert_eq!(findings.len(), 1);
        assert!(findings[0].is_warning());
    }
}
