// 👤 Person - carries one tenure summary per tenure they belong to

use crate::schema::{null_as_default, FieldKind, Shape, Shaped};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonTenure {
    pub id: Option<String>,
    pub asset_id: Option<String>,
    pub property_reference: Option<String>,
    pub uprn: Option<String>,
    pub asset_full_address: Option<String>,
    pub payment_reference: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    #[serde(rename = "type")]
    pub tenure_type: Option<String>,
}

impl PersonTenure {
    pub fn shape() -> Shape {
        Shape::new("PersonTenure")
            .field("id", FieldKind::Text)
            .field("assetId", FieldKind::Text)
            .field("propertyReference", FieldKind::Text)
            .field("uprn", FieldKind::Text)
            .field("assetFullAddress", FieldKind::Text)
            .field("paymentReference", FieldKind::Text)
            .field("startDate", FieldKind::Text)
            .field("endDate", FieldKind::Text)
            .field("type", FieldKind::Text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    pub id: String,
    pub title: Option<String>,
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    pub surname: Option<String>,
    pub date_of_birth: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub person_types: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tenures: Vec<PersonTenure>,
    pub version_number: Option<i64>,
}

impl Person {
    /// The summary this person holds for a given tenure, if any
    pub fn tenure(&self, tenure_id: &str) -> Option<&PersonTenure> {
        self.tenures
            .iter()
            .find(|t| t.id.as_deref() == Some(tenure_id))
    }

    pub fn display_name(&self) -> String {
        [&self.first_name, &self.middle_name, &self.surname]
            .iter()
            .filter_map(|part| part.as_deref())
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Shaped for Person {
    fn shape() -> Shape {
        Shape::new("Person")
            .field("id", FieldKind::Text)
            .field("title", FieldKind::Text)
            .field("firstName", FieldKind::Text)
            .field("middleName", FieldKind::Text)
            .field("surname", FieldKind::Text)
            .field("dateOfBirth", FieldKind::Text)
            .field_or("personTypes", FieldKind::list_of(FieldKind::Text), json!([]))
            .field_or(
                "tenures",
                FieldKind::list_of(FieldKind::Nested(PersonTenure::shape())),
                json!([]),
            )
            .field("versionNumber", FieldKind::Integer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::coerce;

    #[test]
    fn test_person_tenure_lookup() {
        let person = coerce::<Person>(&json!({
            "id": "p1",
            "firstName": "Jo",
            "surname": "Bloggs",
            "tenures": [
                {"id": "t1", "startDate": "2020-01-01", "type": "Secure"},
                {"id": "t2", "startDate": "2015-06-01", "type": "Introductory"}
            ]
        }))
        .unwrap()
        .value;

        assert_eq!(person.tenure("t2").and_then(|t| t.tenure_type.as_deref()), Some("Introductory"));
        assert!(person.tenure("t3").is_none());
        assert_eq!(person.display_name(), "Jo Bloggs");
    }
}
