// 🏠 Tenure - authoritative source for the tenure copies embedded in
// asset and person records

use crate::schema::{null_as_default, FieldKind, Shape, Shaped};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenureType {
    pub code: Option<String>,
    pub description: Option<String>,
}

impl TenureType {
    pub fn shape() -> Shape {
        Shape::new("TenureType")
            .field("code", FieldKind::Text)
            .field("description", FieldKind::Text)
    }
}

/// The asset a tenure is held on, as copied into the tenure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenuredAsset {
    pub id: Option<String>,
    pub full_address: Option<String>,
    pub property_reference: Option<String>,
    pub uprn: Option<String>,
    #[serde(rename = "type")]
    pub asset_type: Option<String>,
}

impl TenuredAsset {
    pub fn shape() -> Shape {
        Shape::new("TenuredAsset")
            .field("id", FieldKind::Text)
            .field("fullAddress", FieldKind::Text)
            .field("propertyReference", FieldKind::Text)
            .field("uprn", FieldKind::Text)
            .field("type", FieldKind::Text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HouseholdMember {
    pub id: Option<String>,
    pub full_name: Option<String>,
    pub is_responsible: Option<bool>,
    pub date_of_birth: Option<String>,
    pub person_tenure_type: Option<String>,
    #[serde(rename = "type")]
    pub member_type: Option<String>,
}

impl HouseholdMember {
    pub fn shape() -> Shape {
        Shape::new("HouseholdMember")
            .field("id", FieldKind::Text)
            .field("fullName", FieldKind::Text)
            .field("isResponsible", FieldKind::Boolean)
            .field("dateOfBirth", FieldKind::Text)
            .field("personTenureType", FieldKind::Text)
            .field("type", FieldKind::Text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenure {
    pub id: String,
    pub payment_reference: Option<String>,
    pub start_of_tenure_date: Option<String>,
    pub end_of_tenure_date: Option<String>,
    pub tenure_type: Option<TenureType>,
    pub tenured_asset: Option<TenuredAsset>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub household_members: Vec<HouseholdMember>,
    pub version_number: Option<i64>,
}

impl Tenure {
    pub fn type_description(&self) -> Option<&str> {
        self.tenure_type.as_ref()?.description.as_deref()
    }

    pub fn asset_id(&self) -> Option<&str> {
        self.tenured_asset.as_ref()?.id.as_deref()
    }
}

impl Shaped for Tenure {
    fn shape() -> Shape {
        Shape::new("Tenure")
            .field("id", FieldKind::Text)
            .field("paymentReference", FieldKind::Text)
            .field("startOfTenureDate", FieldKind::Text)
            .field("endOfTenureDate", FieldKind::Text)
            .field("tenureType", FieldKind::Nested(TenureType::shape()))
            .field("tenuredAsset", FieldKind::Nested(TenuredAsset::shape()))
            .field_or(
                "householdMembers",
                FieldKind::list_of(FieldKind::Nested(HouseholdMember::shape())),
                json!([]),
            )
            .field("versionNumber", FieldKind::Integer)
    }
}
