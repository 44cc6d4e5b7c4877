// SPDX-License-Identifier: MIT

//! Per-field merge policy table

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Policy table declaring how every state field is merged
///
/// Owned by the transition table, so a field's policy cannot change while a
/// run is in flight. Undeclared fields fall back to `Overwrite`.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct StateSchema {
    /// Field definitions
    #[serde(flatten)]
    pub fields: BTreeMap<String, StateFieldDef>,
}

/// Definition of a single state field
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StateFieldDef {
    /// Type of the field
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    /// Reducer for merging values
    #[serde(default)]
    pub reducer: ReducerType,
    /// Value seeded into a new run when the caller omits the field
    pub default: Option<Value>,
}

/// Supported field types
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    Any,
    String,
    Number,
    Boolean,
    Array,
    Object,
}

/// Reducer types for merging values into state
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReducerType {
    /// Newest write wins (default)
    #[default]
    Overwrite,
    /// Contributions concatenated in branch order
    #[serde(alias = "ordered-append", alias = "ordered_append")]
    Append,
    /// Shallow object merge, later keys win
    Merge,
}

impl FieldType {
    /// Whether `value` may be stored in a field of this type; null always may
    pub fn admits(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Any, _) | (_, Value::Null) => true,
            (Self::String, Value::String(_)) => true,
            (Self::Number, Value::Number(_)) => true,
            (Self::Boolean, Value::Bool(_)) => true,
            (Self::Array, Value::Array(_)) => true,
            (Self::Object, Value::Object(_)) => true,
            _ => false,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::Any => "any value",
            Self::String => "a string",
            Self::Number => "a number",
            Self::Boolean => "a boolean",
            Self::Array => "an array",
            Self::Object => "an object",
        }
    }
}

impl StateSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a field with a reducer and no default
    pub fn field(mut self, name: &str, reducer: ReducerType) -> Self {
        let field_type = match reducer {
            ReducerType::Append => FieldType::Array,
            ReducerType::Merge => FieldType::Object,
            ReducerType::Overwrite => FieldType::Any,
        };
        self.fields.insert(
            name.to_string(),
            StateFieldDef {
                field_type,
                reducer,
                default: None,
            },
        );
        self
    }

    /// Declare an ordered-append field that starts as `[]`
    pub fn append(mut self, name: &str) -> Self {
        self.fields.insert(
            name.to_string(),
            StateFieldDef {
                field_type: FieldType::Array,
                reducer: ReducerType::Append,
                default: Some(Value::Array(vec![])),
            },
        );
        self
    }

    /// Declare an overwrite field with a default value
    pub fn with_default(mut self, name: &str, default: Value) -> Self {
        let def = self
            .fields
            .entry(name.to_string())
            .or_insert(StateFieldDef {
                field_type: FieldType::Any,
                reducer: ReducerType::Overwrite,
                default: None,
            });
        def.default = Some(default);
        self
    }

    /// Reducer for a field, `Overwrite` when undeclared
    pub fn reducer(&self, name: &str) -> ReducerType {
        self.fields
            .get(name)
            .map(|def| def.reducer)
            .unwrap_or_default()
    }

    pub fn field_type(&self, name: &str) -> FieldType {
        self.fields
            .get(name)
            .map(|def| def.field_type)
            .unwrap_or_default()
    }

    /// Declared defaults, in field-name order
    pub fn defaults(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields
            .iter()
            .filter_map(|(name, def)| def.default.as_ref().map(|v| (name, v)))
    }

    /// Add the declarations of `other` for fields this schema does not declare
    pub fn extend(mut self, other: StateSchema) -> Self {
        for (name, def) in other.fields {
            self.fields.entry(name).or_insert(def);
        }
        self
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }
}
