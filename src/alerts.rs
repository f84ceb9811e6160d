// 🚨 Alert-to-person resolution
//
// Cautionary alerts arrive as a spreadsheet keyed by property reference and a
// free-text name. Each row is walked property → asset → tenure → household
// member to find the person id. Rows that cannot be resolved keep a
// `failed_reason` instead of aborting the pass.

use crate::entities::{Asset, HouseholdMember, Tenure};
use crate::error::{Error, Result};
use crate::progress::{PassTally, ProgressReporter};
use crate::store::{lookup_unique, IndexMatch, KeyValueStore, Loaded, RecordLoader, SecondaryIndex};
use crate::tabular::{Row, Sheet};
use regex::Regex;
use tracing::{debug, warn};

pub const PERSON_ID_COLUMN: &str = "mmh_id";
pub const ASSURE_REF_COLUMN: &str = "assure_ref";
pub const FAILED_REASON_COLUMN: &str = "failed_reason";

/// Property references are 8 digits, zero padded
pub fn normalize_property_reference(raw: &str) -> Option<String> {
    let compact: String = raw.chars().filter(|c| *c != ' ').collect();
    if compact.is_empty() || compact.len() > 8 || !compact.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("{:0>8}", compact))
}

/// Input column names
#[derive(Debug, Clone)]
pub struct AlertColumns {
    pub name: String,
    pub property_reference: String,
    pub action: String,
    pub outcome: String,
    pub lookup: String,
}

impl Default for AlertColumns {
    fn default() -> Self {
        AlertColumns {
            name: "Name".to_string(),
            property_reference: "Property Reference".to_string(),
            action: "Action on Assure".to_string(),
            outcome: "OUTCOME".to_string(),
            lookup: "Lookup".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved { person_id: String },
    Failed(String),
}

pub struct AlertResolver<'a> {
    assets: &'a dyn KeyValueStore,
    tenures: &'a dyn KeyValueStore,
    asset_index: SecondaryIndex,
    columns: AlertColumns,
    assure_ref: Regex,
    non_word: Regex,
}

impl<'a> AlertResolver<'a> {
    pub fn new(
        assets: &'a dyn KeyValueStore,
        tenures: &'a dyn KeyValueStore,
        asset_index: SecondaryIndex,
    ) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| Error::Config(format!("Invalid pattern {}: {}", pattern, e)))
        };
        Ok(AlertResolver {
            assets,
            tenures,
            asset_index,
            columns: AlertColumns::default(),
            assure_ref: compile(r"[0-9]{3,}")?,
            non_word: compile(r"\W+")?,
        })
    }

    pub fn with_columns(mut self, columns: AlertColumns) -> Self {
        self.columns = columns;
        self
    }

    /// First run of 3+ digits, unless the text mentions 2020 (dated notes, not refs)
    pub fn extract_assure_ref(&self, action: &str) -> Option<String> {
        if action.is_empty() || action.contains("2020") {
            return None;
        }
        self.assure_ref.find(action).map(|m| m.as_str().to_string())
    }

    fn clean_name(&self, name: &str) -> String {
        self.non_word.replace_all(name, " ").trim().to_lowercase()
    }

    /// Household member whose cleaned name appears in the cleaned alert name
    pub fn match_member<'m>(&self, alert_name: &str, members: &'m [HouseholdMember]) -> Option<&'m HouseholdMember> {
        let alert_name = self.clean_name(alert_name);
        members.iter().find(|member| {
            let member_name = self.clean_name(member.full_name.as_deref().unwrap_or(""));
            !member_name.is_empty() && alert_name.contains(&member_name)
        })
    }

    /// Resolve one alert. Store failures propagate; everything else is a `Failed` outcome.
    pub fn resolve(&self, raw_reference: &str, alert_name: &str) -> Result<Resolution> {
        let failed = |reason: String| Ok(Resolution::Failed(reason));

        let Some(reference) = normalize_property_reference(raw_reference) else {
            return failed(format!(
                "Invalid assetId: {}. Alert name: {}",
                raw_reference, alert_name
            ));
        };

        let asset = match lookup_unique(self.assets, &self.asset_index, &reference)? {
            IndexMatch::Unique(asset) => asset,
            IndexMatch::Missing => {
                return failed(format!(
                    "No assets found for assetId {}. Alert name: {}",
                    raw_reference, alert_name
                ))
            }
            IndexMatch::Ambiguous(assets) => {
                return failed(format!(
                    "Multiple assets found for assetId {} ({} matches). Alert name: {}",
                    raw_reference,
                    assets.len(),
                    alert_name
                ))
            }
        };

        let asset = match crate::schema::coerce::<Asset>(&asset.to_item()) {
            Ok(coerced) => coerced.value,
            Err(e) if e.is_record_level() => return failed(e.to_string()),
            Err(e) => return Err(e),
        };
        let Some(tenure_id) = asset.tenure_id() else {
            return failed(format!("No tenure ID for asset {}", reference));
        };

        let tenure = match RecordLoader::new(self.tenures).load_as::<Tenure>(tenure_id) {
            Ok(Loaded::Found(coerced)) => coerced.value,
            Ok(Loaded::NotFound { .. }) => {
                return failed(format!("Could not get tenure for assetId {}", reference))
            }
            Err(e) if e.is_record_level() => return failed(e.to_string()),
            Err(e) => return Err(e),
        };

        let members = &tenure.household_members;
        if members.is_empty() {
            return failed(format!("No HouseholdMembers found for tenure {}", tenure.id));
        }

        match self.match_member(alert_name, members) {
            Some(HouseholdMember { id: Some(id), .. }) => Ok(Resolution::Resolved {
                person_id: id.clone(),
            }),
            Some(_) => failed(format!(
                "Couldn't get PersonID from HouseholdMembers for tenure {}",
                tenure.id
            )),
            None => {
                let listed: Vec<String> = members
                    .iter()
                    .map(|m| {
                        format!(
                            "({}, {})",
                            m.full_name.as_deref().unwrap_or(""),
                            m.id.as_deref().unwrap_or("")
                        )
                    })
                    .collect();
                failed(format!(
                    "PERSON IS NOT IN TENURE MEMBERS {} in tenure {}: [{}]",
                    alert_name,
                    tenure.id,
                    listed.join(", ")
                ))
            }
        }
    }

    fn resolve_row(&self, row: &mut Row) -> Result<Resolution> {
        let cell = |row: &Row, column: &str| row.get(column).cloned().unwrap_or_default();

        if cell(row, &self.columns.outcome).is_empty() && cell(row, &self.columns.lookup).is_empty() {
            return Ok(Resolution::Failed("No Outcome and no Lookup".to_string()));
        }

        if let Some(reference) = self.extract_assure_ref(&cell(row, &self.columns.action)) {
            row.insert(ASSURE_REF_COLUMN.to_string(), reference);
        }

        self.resolve(
            &cell(row, &self.columns.property_reference),
            &cell(row, &self.columns.name),
        )
    }

    /// Fill `mmh_id`, `assure_ref` and `failed_reason` on every row of the sheet
    pub fn resolve_sheet(&self, sheet: &mut Sheet, reporter: Option<&ProgressReporter>) -> Result<PassTally> {
        for column in [PERSON_ID_COLUMN, ASSURE_REF_COLUMN, FAILED_REASON_COLUMN] {
            sheet.add_column(column);
        }

        let mut tally = PassTally::default();
        let total = sheet.rows.len();
        for (i, row) in sheet.rows.iter_mut().enumerate() {
            tally.scanned += 1;
            match self.resolve_row(row)? {
                Resolution::Resolved { person_id } => {
                    debug!("Resolved alert row {} to person {}", i + 1, person_id);
                    row.insert(PERSON_ID_COLUMN.to_string(), person_id);
                    tally.matched += 1;
                }
                Resolution::Failed(reason) => {
                    warn!("Alert row {}: {}", i + 1, reason);
                    row.insert(FAILED_REASON_COLUMN.to_string(), reason.replace('\'', ""));
                    tally.failed += 1;
                }
            }
            if let Some(reporter) = reporter {
                reporter.tick(i + 1, &format!("{} resolved", tally.matched));
            }
        }

        debug!("Resolved {} of {} alert rows", tally.matched, total);
        Ok(tally)
    }
}
