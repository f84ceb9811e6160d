// 🏢 Asset - a property, carrying a copy of its current tenure

use crate::entities::tenure::Tenure;
use crate::schema::{FieldKind, Shape, Shaped};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Summary of the current tenure as duplicated inside an asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetTenure {
    pub id: Option<String>,
    pub payment_reference: Option<String>,
    #[serde(rename = "type")]
    pub tenure_type: Option<String>,
    pub start_of_tenure_date: Option<String>,
    pub end_of_tenure_date: Option<String>,
}

impl AssetTenure {
    pub fn shape() -> Shape {
        Shape::new("AssetTenure")
            .field("id", FieldKind::Text)
            .field("paymentReference", FieldKind::Text)
            .field("type", FieldKind::Text)
            .field("startOfTenureDate", FieldKind::Text)
            .field("endOfTenureDate", FieldKind::Text)
    }

    /// Build the embedded copy from the authoritative tenure
    pub fn from_tenure(tenure: &Tenure) -> Self {
        AssetTenure {
            id: Some(tenure.id.clone()),
            payment_reference: tenure.payment_reference.clone(),
            tenure_type: tenure.type_description().map(str::to_string),
            start_of_tenure_date: tenure.start_of_tenure_date.clone(),
            end_of_tenure_date: tenure.end_of_tenure_date.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: String,
    /// External property reference (8-digit, zero padded)
    pub asset_id: Option<String>,
    pub asset_type: Option<String>,
    pub asset_address: Option<Value>,
    pub root_asset: Option<String>,
    pub tenure: Option<AssetTenure>,
    pub version_number: Option<i64>,
}

impl Asset {
    pub fn tenure_id(&self) -> Option<&str> {
        self.tenure.as_ref()?.id.as_deref()
    }
}

impl Shaped for Asset {
    fn shape() -> Shape {
        Shape::new("Asset")
            .field("id", FieldKind::Text)
            .field("assetId", FieldKind::Text)
            .field("assetType", FieldKind::Text)
            .field("assetAddress", FieldKind::Object)
            .field("rootAsset", FieldKind::Text)
            .field("tenure", FieldKind::Nested(AssetTenure::shape()))
            .field("versionNumber", FieldKind::Integer)
    }
}
