// SPDX-License-Identifier: MIT

//! Runtime state storage for workflow runs

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::schema::StateSchema;

/// Typed key/value record of one run
///
/// Keys are kept in name order so that two equal records always serialize to
/// the same bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateRecord {
    fields: BTreeMap<String, Value>,
}

impl StateRecord {
    /// Create an empty record
    pub fn empty() -> Self {
        Self::default()
    }

    /// Seed a record with the schema defaults, then the caller's values
    pub fn seeded(schema: &StateSchema, initial: StateRecord) -> Self {
        let mut fields: BTreeMap<String, Value> = schema
            .defaults()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        fields.extend(initial.fields);
        Self { fields }
    }

    /// Build a record from a JSON object; anything else yields an empty record
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(map) => Self {
                fields: map.into_iter().collect(),
            },
            _ => Self::empty(),
        }
    }

    /// Get a field value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Field as a string slice
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Truthiness of a field: missing, null, false, 0, "" and [] are false
    pub fn flag(&self, key: &str) -> bool {
        match self.get(key) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
        }
    }

    /// Write a field directly, bypassing reducers
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    pub fn entry(&mut self, key: &str) -> std::collections::btree_map::Entry<'_, String, Value> {
        self.fields.entry(key.to_string())
    }

    /// Get all field names
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromIterator<(String, Value)> for StateRecord {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Partial update produced by one step invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartialUpdate {
    values: BTreeMap<String, Value>,
}

impl PartialUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter
    pub fn set(mut self, key: &str, value: Value) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Build an update from a JSON object; other values become an empty update
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(map) => Self {
                values: map.into_iter().collect(),
            },
            _ => Self::new(),
        }
    }
}

impl FromIterator<(String, Value)> for PartialUpdate {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_state() {
        let state = StateRecord::empty();
        assert!(state.get("anything").is_none());
        assert!(state.is_empty());
    }

    #[test]
    fn test_seeded_caller_values_win() {
        let schema = StateSchema::new()
            .append("sources")
            .with_default("max_research_loops", json!(2));
        let initial = StateRecord::from_json(json!({"max_research_loops": 5, "topic": "A"}));

        let state = StateRecord::seeded(&schema, initial);
        assert_eq!(state.get("sources"), Some(&json!([])));
        assert_eq!(state.get("max_research_loops"), Some(&json!(5)));
        assert_eq!(state.get_str("topic"), Some("A"));
    }

    #[test]
    fn test_flag_truthiness() {
        let state = StateRecord::from_json(json!({
            "yes": true,
            "no": false,
            "zero": 0,
            "empty_list": [],
            "images": ["a.png"],
            "nothing": null,
        }));

        assert!(state.flag("yes"));
        assert!(!state.flag("no"));
        assert!(!state.flag("zero"));
        assert!(!state.flag("empty_list"));
        assert!(state.flag("images"));
        assert!(!state.flag("nothing"));
        assert!(!state.flag("missing"));
    }

    #[test]
    fn test_serialization_is_key_ordered() {
        let mut a = StateRecord::empty();
        a.insert("zeta", json!(1));
        a.insert("alpha", json!(2));

        let mut b = StateRecord::empty();
        b.insert("alpha", json!(2));
        b.insert("zeta", json!(1));

        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            r#"{"alpha":2,"zeta":1}"#
        );
    }

    #[test]
    fn test_partial_update_from_json() {
        let update = PartialUpdate::from_json(json!({"sources": ["x"]}));
        assert_eq!(update.get("sources"), Some(&json!(["x"])));

        assert!(PartialUpdate::from_json(json!("not an object")).is_empty());
    }
}
