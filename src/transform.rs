use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;

use crate::hash::normalize_and_hash;
use crate::schema::{OutputPath, SchemaMapping};
use crate::RawRecord;

/// A single-root object carrying exactly one transformed field.
///
/// Fragments from the same record are never merged; each serializes on its
/// own as either `{"key": value}` or `{"parent": {"key": value}}`.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Field { key: String, value: Value },
    Nested { parent: String, key: String, value: Value },
}

impl Fragment {
    pub fn at(path: &OutputPath, value: Value) -> Self {
        match path {
            OutputPath::Top(key) => Fragment::Field {
                key: key.clone(),
                value,
            },
            OutputPath::Nested { parent, key } => Fragment::Nested {
                parent: parent.clone(),
                key: key.clone(),
                value,
            },
        }
    }

    pub fn value(&self) -> &Value {
        match self {
            Fragment::Field { value, .. } | Fragment::Nested { value, .. } => value,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Fragment::Field { key, value } => {
                Value::Object([(key.clone(), value.clone())].into_iter().collect())
            }
            Fragment::Nested { parent, key, value } => {
                let inner = Value::Object([(key.clone(), value.clone())].into_iter().collect());
                Value::Object([(parent.clone(), inner)].into_iter().collect())
            }
        }
    }
}

struct Single<'a>(&'a str, &'a Value);

impl Serialize for Single<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(self.0, self.1)?;
        map.end()
    }
}

impl Serialize for Fragment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        match self {
            Fragment::Field { key, value } => map.serialize_entry(key, value)?,
            Fragment::Nested { parent, key, value } => {
                map.serialize_entry(parent, &Single(key, value))?
            }
        }
        map.end()
    }
}

/// Applies a frozen schema to records, hashing sensitive fields when enabled.
#[derive(Debug, Clone)]
pub struct RowTransformer {
    hashing_enabled: bool,
    hash_marker: String,
}

impl RowTransformer {
    pub fn new(hashing_enabled: bool, hash_marker: impl Into<String>) -> Self {
        Self {
            hashing_enabled,
            hash_marker: hash_marker.into(),
        }
    }

    /// A path is sensitive when its leaf name contains the marker (`hashed_email`).
    pub fn is_sensitive(&self, path: &OutputPath) -> bool {
        !self.hash_marker.is_empty() && path.leaf().contains(self.hash_marker.as_str())
    }

    /// One fragment per schema entry, in schema order. Missing columns are
    /// still written, as `null`.
    pub fn transform(&self, record: &RawRecord, schema: &SchemaMapping) -> Vec<Fragment> {
        schema
            .iter()
            .map(|(label, path)| {
                let raw = record.get(label).cloned().unwrap_or(Value::Null);
                let value = if self.hashing_enabled && self.is_sensitive(path) {
                    hash_value(raw)
                } else {
                    raw
                };
                Fragment::at(path, value)
            })
            .collect()
    }
}

// Scalars are hashed through their text form; null and containers pass through.
fn hash_value(raw: Value) -> Value {
    match raw {
        Value::String(s) => Value::String(normalize_and_hash(&s)),
        Value::Number(n) => Value::String(normalize_and_hash(&number_text(&n))),
        Value::Bool(b) => Value::String(normalize_and_hash(&b.to_string())),
        other => other,
    }
}

// Whole-number floats print without a fraction, so `1.0` and `1` hash alike.
fn number_text(n: &serde_json::Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 => {
            format!("{}", f as i64)
        }
        _ => n.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{PatternRule, RuleSet};
    use serde_json::json;

    fn record(value: Value) -> RawRecord {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn rules() -> RuleSet {
        RuleSet::new(vec![
            PatternRule::new("email", "hashed_email").unwrap(),
            PatternRule::new("zip|postal", "address_info.postal_code").unwrap(),
            PatternRule::new("phone", "hashed_phone_number").unwrap(),
        ])
    }

    #[test]
    fn one_fragment_per_matched_column() {
        let rec = record(json!({ "Email": "A@B.com", "Zip": "90210", "Notes": "x" }));
        let schema = SchemaMapping::infer(&rec, &rules());
        let fragments = RowTransformer::new(true, "hashed").transform(&rec, &schema);

        let as_json: Vec<Value> = fragments.iter().map(Fragment::to_json).collect();
        assert_eq!(
            as_json,
            vec![
                json!({ "hashed_email": normalize_and_hash("a@b.com") }),
                json!({ "address_info": { "postal_code": "90210" } }),
            ]
        );
    }

    #[test]
    fn hashing_disabled_writes_raw_values() {
        let rec = record(json!({ "Email": "A@B.com" }));
        let schema = SchemaMapping::infer(&rec, &rules());
        let fragments = RowTransformer::new(false, "hashed").transform(&rec, &schema);
        assert_eq!(fragments[0].value(), &json!("A@B.com"));
    }

    #[test]
    fn whole_number_floats_hash_like_integers() {
        let rec = record(json!({ "Phone": 1.0, "Zip": 2.5 }));
        let rules = RuleSet::new(vec![
            PatternRule::new("phone", "hashed_phone_number").unwrap(),
            PatternRule::new("zip", "hashed_zip").unwrap(),
        ]);
        let schema = SchemaMapping::infer(&rec, &rules);
        let fragments = RowTransformer::new(true, "hashed").transform(&rec, &schema);
        assert_eq!(fragments[0].value(), &json!(normalize_and_hash("1")));
        assert_eq!(fragments[1].value(), &json!(normalize_and_hash("2.5")));
    }

    #[test]
    fn numeric_sensitive_values_hash_their_text() {
        let rec = record(json!({ "Phone": 5551234 }));
        let schema = SchemaMapping::infer(&rec, &rules());
        let fragments = RowTransformer::new(true, "hashed").transform(&rec, &schema);
        assert_eq!(fragments[0].value(), &json!(normalize_and_hash("5551234")));
    }

    #[test]
    fn missing_column_is_written_as_null() {
        let first = record(json!({ "Email": "a@b.com", "Zip": "1" }));
        let schema = SchemaMapping::infer(&first, &rules());
        let later = record(json!({ "Zip": "2" }));
        let fragments = RowTransformer::new(true, "hashed").transform(&later, &schema);
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].to_json(), json!({ "hashed_email": null }));
        assert_eq!(
            fragments[1].to_json(),
            json!({ "address_info": { "postal_code": "2" } })
        );
    }

    #[test]
    fn serialize_matches_to_json() {
        let fragment = Fragment::Nested {
            parent: "address_info".into(),
            key: "postal_code".into(),
            value: json!("90210"),
        };
        let text = serde_json::to_string(&fragment).unwrap();
        assert_eq!(text, r#"{"address_info":{"postal_code":"90210"}}"#);
        assert_eq!(serde_json::from_str::<Value>(&text).unwrap(), fragment.to_json());
    }

    #[test]
    fn sensitivity_is_decided_by_leaf_name() {
        let t = RowTransformer::new(true, "hashed");
        assert!(t.is_sensitive(&"address_info.hashed_first_name".parse().unwrap()));
        assert!(!t.is_sensitive(&"hashed_info.postal_code".parse().unwrap()));
    }
}
