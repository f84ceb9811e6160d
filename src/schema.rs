// 📐 Shape Layer - permissive schema coercion
//
// Upstream items are inconsistent: fields go missing, extra fields appear.
// A `Shape` declares which fields a record type cares about. Coercion keeps
// exactly those fields, defaults the missing ones, drops the rest, and only
// fails when a present value cannot be read as its declared type.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

// ============================================================================
// SHAPE DECLARATIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Text,
    Number,
    Integer,
    Boolean,
    /// Free-form object, kept as-is
    Object,
    /// Object coerced through its own shape
    Nested(Shape),
    ListOf(Box<FieldKind>),
    Any,
}

impl FieldKind {
    pub fn list_of(kind: FieldKind) -> Self {
        FieldKind::ListOf(Box::new(kind))
    }

    fn name(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Number => "number",
            FieldKind::Integer => "integer",
            FieldKind::Boolean => "boolean",
            FieldKind::Object | FieldKind::Nested(_) => "object",
            FieldKind::ListOf(_) => "list",
            FieldKind::Any => "any",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    /// Value used when the field is absent from the raw item
    pub default: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Shape {
    pub name: &'static str,
    pub fields: Vec<FieldSpec>,
}

impl Shape {
    pub fn new(name: &'static str) -> Self {
        Shape {
            name,
            fields: Vec::new(),
        }
    }

    /// Builder: declare a field that defaults to null
    pub fn field(self, name: &'static str, kind: FieldKind) -> Self {
        self.field_or(name, kind, Value::Null)
    }

    /// Builder: declare a field with an explicit default
    pub fn field_or(mut self, name: &'static str, kind: FieldKind, default: Value) -> Self {
        self.fields.push(FieldSpec {
            name,
            kind,
            default,
        });
        self
    }

    pub fn declares(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }
}

/// A record type with a declared shape
pub trait Shaped: Serialize + DeserializeOwned {
    fn shape() -> Shape;
}

// ============================================================================
// COERCION RESULT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FieldOrigin {
    /// Read from the raw item (possibly converted)
    Present,
    /// Absent upstream, filled from the declared default
    Defaulted,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoercionReport {
    /// Dotted path → origin, for every declared field visited
    pub origins: BTreeMap<String, FieldOrigin>,
    /// Dotted paths of raw fields that no shape declared
    pub dropped: Vec<String>,
}

impl CoercionReport {
    pub fn origin(&self, path: &str) -> Option<FieldOrigin> {
        self.origins.get(path).copied()
    }

    pub fn defaulted(&self) -> impl Iterator<Item = &str> {
        self.origins
            .iter()
            .filter(|(_, origin)| **origin == FieldOrigin::Defaulted)
            .map(|(path, _)| path.as_str())
    }

    pub fn is_complete(&self) -> bool {
        self.defaulted().next().is_none()
    }
}

#[derive(Debug, Clone)]
pub struct Coerced<T> {
    pub value: T,
    pub report: CoercionReport,
}

// ============================================================================
// COERCION
// ============================================================================

/// Coerce a raw item into `T` through `T::shape()`
pub fn coerce<T: Shaped>(raw: &Value) -> Result<Coerced<T>> {
    let shape = T::shape();
    let (normalized, report) = coerce_value(raw, &shape)?;
    let value = serde_json::from_value(Value::Object(normalized))
        .map_err(|e| Error::coercion(shape.name, "<record>", e.to_string()))?;
    Ok(Coerced { value, report })
}

/// Shape-driven normalisation without a target type
pub fn coerce_value(raw: &Value, shape: &Shape) -> Result<(Map<String, Value>, CoercionReport)> {
    let Value::Object(map) = raw else {
        return Err(Error::coercion(
            shape.name,
            "<record>",
            format!("expected an object, found {}", json_type(raw)),
        ));
    };
    let mut report = CoercionReport::default();
    let normalized = coerce_object(map, shape, "", &mut report)?;
    Ok((normalized, report))
}

fn coerce_object(
    raw: &Map<String, Value>,
    shape: &Shape,
    prefix: &str,
    report: &mut CoercionReport,
) -> Result<Map<String, Value>> {
    let mut out = Map::new();

    for key in raw.keys() {
        if !shape.declares(key) {
            report.dropped.push(join(prefix, key));
        }
    }

    for spec in &shape.fields {
        let path = join(prefix, spec.name);
        let value = match raw.get(spec.name) {
            Some(value) => {
                report.origins.insert(path.clone(), FieldOrigin::Present);
                coerce_field(value, &spec.kind, shape.name, &path, report)?
            }
            None => {
                report.origins.insert(path.clone(), FieldOrigin::Defaulted);
                spec.default.clone()
            }
        };
        out.insert(spec.name.to_string(), value);
    }

    Ok(out)
}

fn coerce_field(
    value: &Value,
    kind: &FieldKind,
    shape: &str,
    path: &str,
    report: &mut CoercionReport,
) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }

    let mismatch = || {
        Error::coercion(
            shape,
            path,
            format!("expected {}, found {}", kind.name(), json_type(value)),
        )
    };

    match kind {
        FieldKind::Any => Ok(value.clone()),

        FieldKind::Text => match value {
            Value::String(_) => Ok(value.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err(mismatch()),
        },

        FieldKind::Number => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) => parse_number(s.trim())
                .map(Value::Number)
                .ok_or_else(|| Error::coercion(shape, path, format!("non-numeric text `{}`", s))),
            _ => Err(mismatch()),
        },

        FieldKind::Integer => {
            let parsed = match value {
                Value::Number(n) => integral(n),
                Value::String(s) => parse_number(s.trim()).and_then(|n| integral(&n)),
                _ => return Err(mismatch()),
            };
            parsed
                .map(Value::from)
                .ok_or_else(|| Error::coercion(shape, path, format!("not an integer: {}", value)))
        }

        FieldKind::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
            Value::Number(n) if n.as_f64() == Some(1.0) => Ok(Value::Bool(true)),
            Value::Number(n) if n.as_f64() == Some(0.0) => Ok(Value::Bool(false)),
            _ => Err(mismatch()),
        },

        FieldKind::Object => match value {
            Value::Object(_) => Ok(value.clone()),
            _ => Err(mismatch()),
        },

        FieldKind::Nested(inner) => match value {
            Value::Object(map) => Ok(Value::Object(coerce_object(map, inner, path, report)?)),
            _ => Err(mismatch()),
        },

        FieldKind::ListOf(item_kind) => match value {
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    coerce_field(item, item_kind, shape, &format!("{}[{}]", path, i), report)
                })
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            _ => Err(mismatch()),
        },
    }
}

fn parse_number(text: &str) -> Option<Number> {
    if let Ok(i) = text.parse::<i64>() {
        return Some(Number::from(i));
    }
    text.parse::<f64>().ok().and_then(Number::from_f64)
}

/// Whole numbers only; floats outside the i64 range are rejected, not clamped
pub(crate) fn integral(n: &Number) -> Option<i64> {
    n.as_i64().or_else(|| {
        n.as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64)
            .map(|f| f as i64)
    })
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "text",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// serde helper: read `null` as the type's default (e.g. empty list)
pub fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn member_shape() -> Shape {
        Shape::new("HouseholdMember")
            .field("id", FieldKind::Text)
            .field("fullName", FieldKind::Text)
            .field("isResponsible", FieldKind::Boolean)
    }

    fn tenure_shape() -> Shape {
        Shape::new("Tenure")
            .field("id", FieldKind::Text)
            .field("paymentReference", FieldKind::Text)
            .field("startOfTenureDate", FieldKind::Text)
            .field("charges", FieldKind::Number)
            .field_or(
                "householdMembers",
                FieldKind::list_of(FieldKind::Nested(member_shape())),
                json!([]),
            )
    }

    #[test]
    fn test_missing_fields_default_and_extra_fields_drop() {
        let raw = json!({"id": "t1", "legacyReferences": [], "notices": null});
        let (map, report) = coerce_value(&raw, &tenure_shape()).unwrap();

        assert_eq!(map["id"], json!("t1"));
        assert_eq!(map["paymentReference"], Value::Null);
        assert_eq!(map["householdMembers"], json!([]));
        assert!(!map.contains_key("legacyReferences"));
        assert!(!map.contains_key("notices"));

        assert_eq!(report.origin("id"), Some(FieldOrigin::Present));
        assert_eq!(report.origin("paymentReference"), Some(FieldOrigin::Defaulted));
        assert_eq!(report.dropped, vec!["legacyReferences", "notices"]);
        assert!(!report.is_complete());
    }

    #[test]
    fn test_nested_fields_recurse() {
        let raw = json!({
            "id": "t1",
            "householdMembers": [
                {"id": "p1", "fullName": "FAKE_First FAKE_Last", "personTenureType": "Tenant"}
            ]
        });
        let (map, report) = coerce_value(&raw, &tenure_shape()).unwrap();

        assert_eq!(
            map["householdMembers"][0],
            json!({"id": "p1", "fullName": "FAKE_First FAKE_Last", "isResponsible": null})
        );
        assert_eq!(
            report.origin("householdMembers[0].isResponsible"),
            Some(FieldOrigin::Defaulted)
        );
        assert!(report
            .dropped
            .contains(&"householdMembers[0].personTenureType".to_string()));
    }

    #[test]
    fn test_coercion_is_idempotent() {
        let raw = json!({
            "id": 42,
            "charges": "12.50",
            "extra": {"x": 1},
            "householdMembers": [{"id": "p1", "isResponsible": "true", "junk": 1}]
        });
        let (once, _) = coerce_value(&raw, &tenure_shape()).unwrap();
        let (twice, report) = coerce_value(&Value::Object(once.clone()), &tenure_shape()).unwrap();

        assert_eq!(once, twice);
        assert!(report.dropped.is_empty());
        assert_eq!(once["id"], json!("42"));
        assert_eq!(once["charges"], json!(12.5));
        assert_eq!(once["householdMembers"][0]["isResponsible"], json!(true));
    }

    #[test]
    fn test_non_numeric_text_is_an_error() {
        let raw = json!({"id": "t1", "charges": "twelve"});
        let err = coerce_value(&raw, &tenure_shape()).unwrap_err();
        match err {
            Error::SchemaCoercion { shape, field, message } => {
                assert_eq!(shape, "Tenure");
                assert_eq!(field, "charges");
                assert!(message.contains("twelve"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_structural_mismatch_is_an_error() {
        let raw = json!({"id": {"nested": true}});
        assert!(coerce_value(&raw, &tenure_shape()).is_err());

        let raw = json!({"id": "t1", "householdMembers": "p1"});
        assert!(coerce_value(&raw, &tenure_shape()).is_err());

        assert!(coerce_value(&json!("not an object"), &tenure_shape()).is_err());
    }

    #[test]
    fn test_integer_kind_accepts_decimal_encodings() {
        let shape = Shape::new("Versioned").field("versionNumber", FieldKind::Integer);
        let (map, _) = coerce_value(&json!({"versionNumber": 3.0}), &shape).unwrap();
        assert_eq!(map["versionNumber"], json!(3));

        let (map, _) = coerce_value(&json!({"versionNumber": "7"}), &shape).unwrap();
        assert_eq!(map["versionNumber"], json!(7));

        assert!(coerce_value(&json!({"versionNumber": 2.5}), &shape).is_err());
    }

    #[test]
    fn test_integer_kind_rejects_values_beyond_i64() {
        let shape = Shape::new("Versioned").field("versionNumber", FieldKind::Integer);
        for raw in [json!(1e300), json!("1e300"), json!(9223372036854775808u64)] {
            let err = coerce_value(&json!({"versionNumber": raw}), &shape).unwrap_err();
            assert!(matches!(err, Error::SchemaCoercion { .. }));
        }
    }
}
