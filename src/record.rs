// 🗂️ VersionedRecord - loosely typed item owned by a backing store
//
// Items travel as JSON objects: a string `id`, an optional integer
// `versionNumber`, and whatever other fields the upstream schema carries.

use crate::error::{Error, Result};
use crate::schema::integral;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const ID_FIELD: &str = "id";
pub const VERSION_FIELD: &str = "versionNumber";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRecord {
    pub id: String,

    /// Optimistic-concurrency counter; absent on items never written by a patch
    #[serde(
        rename = "versionNumber",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub version_number: Option<i64>,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl VersionedRecord {
    pub fn new(id: impl Into<String>) -> Self {
        VersionedRecord {
            id: id.into(),
            version_number: None,
            fields: Map::new(),
        }
    }

    /// Builder: set a top-level field
    pub fn with_field(mut self, name: &str, value: Value) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version_number = Some(version);
        self
    }

    /// Parse a raw store item. The item must be an object with a string `id`.
    pub fn from_item(item: Value) -> Result<Self> {
        let Value::Object(mut map) = item else {
            return Err(Error::coercion("item", ID_FIELD, "item is not an object"));
        };

        let id = match map.remove(ID_FIELD) {
            Some(Value::String(id)) if !id.is_empty() => id,
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(Error::coercion("item", ID_FIELD, "missing primary key")),
        };

        let version_number = match map.remove(VERSION_FIELD) {
            None | Some(Value::Null) => None,
            Some(v) => Some(parse_version(&v)?),
        };

        Ok(VersionedRecord {
            id,
            version_number,
            fields: map,
        })
    }

    /// Flatten back into the store item shape
    pub fn to_item(&self) -> Value {
        let mut map = self.fields.clone();
        map.insert(ID_FIELD.to_string(), Value::String(self.id.clone()));
        if let Some(version) = self.version_number {
            map.insert(VERSION_FIELD.to_string(), Value::from(version));
        }
        Value::Object(map)
    }

    /// Value at a dotted path among the non-key fields, e.g. `tenure.id`
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let (head, rest) = split_path(path);
        let first = self.fields.get(head)?;
        match rest {
            Some(rest) => value_at_path(first, rest),
            None => Some(first),
        }
    }

    /// Version the next write will carry: null counts as 0, otherwise +1
    pub fn next_version(&self) -> Result<i64> {
        match self.version_number {
            None => Ok(0),
            Some(v) => v.checked_add(1).ok_or_else(|| {
                Error::coercion("item", VERSION_FIELD, format!("version {} cannot be incremented", v))
            }),
        }
    }
}

fn parse_version(value: &Value) -> Result<i64> {
    match value {
        Value::Number(n) => integral(n).ok_or_else(|| Error::coercion("item", VERSION_FIELD, format!("not an integer: {}", n))),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| Error::coercion("item", VERSION_FIELD, format!("not an integer: {}", s))),
        other => Err(Error::coercion(
            "item",
            VERSION_FIELD,
            format!("not an integer: {}", other),
        )),
    }
}

fn split_path(path: &str) -> (&str, Option<&str>) {
    match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    }
}

/// Walk a dotted path through nested objects
pub fn value_at_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.as_object()?.get(segment))
}

/// Set a dotted path, creating intermediate objects as needed.
/// Non-object intermediates are replaced.
pub fn set_path(target: &mut Map<String, Value>, path: &str, value: Value) {
    let (head, rest) = split_path(path);
    match rest {
        None => {
            target.insert(head.to_string(), value);
        }
        Some(rest) => {
            let slot = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            if let Value::Object(inner) = slot {
                set_path(inner, rest, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_item_splits_key_and_version() {
        let record = VersionedRecord::from_item(json!({
            "id": "a1",
            "versionNumber": 3,
            "assetId": "00012345",
            "tenure": {"id": "t1"}
        }))
        .unwrap();

        assert_eq!(record.id, "a1");
        assert_eq!(record.version_number, Some(3));
        assert_eq!(record.get_path("tenure.id"), Some(&json!("t1")));
        assert!(!record.fields.contains_key("versionNumber"));
    }

    #[test]
    fn test_from_item_accepts_decimal_style_versions() {
        let record =
            VersionedRecord::from_item(json!({"id": "a1", "versionNumber": 2.0})).unwrap();
        assert_eq!(record.version_number, Some(2));

        let record =
            VersionedRecord::from_item(json!({"id": "a1", "versionNumber": null})).unwrap();
        assert_eq!(record.version_number, None);
    }

    #[test]
    fn test_from_item_rejects_missing_id() {
        let err = VersionedRecord::from_item(json!({"assetId": "1"})).unwrap_err();
        assert!(matches!(err, Error::SchemaCoercion { .. }));
    }

    #[test]
    fn test_to_item_round_trips_fields() {
        let record = VersionedRecord::new("p1")
            .with_version(4)
            .with_field("surname", json!("Smith"));
        let item = record.to_item();

        assert_eq!(item["id"], json!("p1"));
        assert_eq!(item["versionNumber"], json!(4));
        assert_eq!(VersionedRecord::from_item(item).unwrap(), record);
    }

    #[test]
    fn test_next_version_treats_null_as_zero() {
        assert_eq!(VersionedRecord::new("x").next_version().unwrap(), 0);
        assert_eq!(VersionedRecord::new("x").with_version(7).next_version().unwrap(), 8);
    }

    #[test]
    fn test_out_of_range_versions_are_rejected() {
        for version in [json!(1e300), json!(-1e300), json!(18446744073709551615u64), json!(2.5)] {
            let err = VersionedRecord::from_item(json!({"id": "a", "versionNumber": version}))
                .unwrap_err();
            assert!(matches!(err, Error::SchemaCoercion { .. }), "{}", err);
        }

        let at_limit = VersionedRecord::new("a").with_version(i64::MAX);
        assert!(matches!(at_limit.next_version(), Err(Error::SchemaCoercion { .. })));
    }

    #[test]
    fn test_set_path_creates_intermediate_objects() {
        let mut map = Map::new();
        set_path(&mut map, "tenure.type", json!("Secure"));
        set_path(&mut map, "tenure.id", json!("t9"));
        assert_eq!(Value::Object(map), json!({"tenure": {"type": "Secure", "id": "t9"}}));
    }
}
