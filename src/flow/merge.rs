// SPDX-License-Identifier: MIT

//! Merge/reducer engine
//!
//! The only place state is folded. Pure: the same `(current, updates, order)`
//! always yields the same record, which checkpoint replay relies on.

use serde_json::{Map, Value};

use super::error::MergeError;
use super::state::{PartialUpdate, ReducerType, StateRecord, StateSchema};
use super::types::is_reserved;

/// Fold `updates` into `current` following the schema's per-field reducers
///
/// `order[i]` ranks `updates[i]`. Updates are applied in ascending rank; ties
/// keep list position, so for overwrite fields the highest rank wins and the
/// last branch of a fan-out wins a tie. Ordered-append fields concatenate the
/// contributions in the same sequence after the existing value. An update that
/// does not mention a field leaves it alone. Overwrite fields declared with a
/// concrete type only accept values of that type (or null).
pub fn merge(
    current: &StateRecord,
    updates: &[PartialUpdate],
    order: &[usize],
    schema: &StateSchema,
) -> Result<StateRecord, MergeError> {
    if updates.len() != order.len() {
        return Err(MergeError::OrderLength {
            updates: updates.len(),
            order: order.len(),
        });
    }

    if let Some(field) = updates
        .iter()
        .flat_map(|u| u.keys())
        .find(|k| is_reserved(k))
    {
        return Err(MergeError::ReservedField(field.clone()));
    }

    let mut ranked: Vec<(usize, usize)> = order.iter().copied().zip(0..).collect();
    ranked.sort_unstable();

    let mut next = current.clone();
    for (_, position) in ranked {
        for (field, value) in updates[position].iter() {
            apply(&mut next, schema, field, value.clone())?;
        }
    }
    Ok(next)
}

/// Merge a single update (ranked first) into `current`
pub fn merge_one(
    current: &StateRecord,
    update: PartialUpdate,
    schema: &StateSchema,
) -> Result<StateRecord, MergeError> {
    merge(current, &[update], &[0], schema)
}

fn apply(
    state: &mut StateRecord,
    schema: &StateSchema,
    field: &str,
    value: Value,
) -> Result<(), MergeError> {
    match schema.reducer(field) {
        ReducerType::Overwrite => {
            let declared = schema.field_type(field);
            if !declared.admits(&value) {
                return Err(mismatch(field, declared.describe(), &value));
            }
            state.insert(field, value);
        }
        ReducerType::Append => {
            let slot = state.entry(field).or_insert(Value::Array(vec![]));
            if slot.is_null() {
                *slot = Value::Array(vec![]);
            }
            match slot {
                Value::Array(items) => match value {
                    Value::Array(new_items) => items.extend(new_items),
                    other => items.push(other),
                },
                other => return Err(mismatch(field, "an array", other)),
            }
        }
        ReducerType::Merge => {
            let slot = state.entry(field).or_insert(Value::Object(Map::new()));
            if slot.is_null() {
                *slot = Value::Object(Map::new());
            }
            match (slot, value) {
                (Value::Object(current), Value::Object(new)) => {
                    for (k, v) in new {
                        current.insert(k, v);
                    }
                }
                (Value::Object(_), other) => return Err(mismatch(field, "an object", &other)),
                (other, _) => return Err(mismatch(field, "an object", other)),
            }
        }
    }
    Ok(())
}

fn mismatch(field: &str, expected: &'static str, found: &Value) -> MergeError {
    let found = match found {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    };
    MergeError::TypeMismatch {
        field: field.to_string(),
        expected,
        found: found.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> StateSchema {
        StateSchema::new()
            .append("sources")
            .field("meta", ReducerType::Merge)
    }

    fn typed_schema() -> StateSchema {
        StateSchema::from_yaml(
            r#"
            quality_score: { type: number }
            topic: { type: string }
            "#,
        )
        .unwrap()
    }

    fn update(v: Value) -> PartialUpdate {
        PartialUpdate::from_json(v)
    }

    #[test]
    fn test_ordered_append_follows_order_not_list_position() {
        let current = StateRecord::seeded(&schema(), StateRecord::empty());
        // Completion order c, a, b; order keys restore branch order.
        let updates = vec![
            update(json!({"sources": ["c"]})),
            update(json!({"sources": ["a"]})),
            update(json!({"sources": ["b"]})),
        ];

        let merged = merge(&current, &updates, &[2, 0, 1], &schema()).unwrap();
        assert_eq!(merged.get("sources"), Some(&json!(["a", "b", "c"])));
    }

    #[test]
    fn test_append_extends_existing_value() {
        let mut current = StateRecord::empty();
        current.insert("sources", json!(["x", "y"]));

        let merged = merge_one(&current, update(json!({"sources": "z"})), &schema()).unwrap();
        assert_eq!(merged.get("sources"), Some(&json!(["x", "y", "z"])));
    }

    #[test]
    fn test_missing_field_is_not_an_erasure() {
        let mut current = StateRecord::empty();
        current.insert("sources", json!(["x"]));
        current.insert("topic", json!("A"));

        let updates = vec![update(json!({"sources": ["y"]})), update(json!({}))];
        let merged = merge(&current, &updates, &[0, 1], &schema()).unwrap();

        assert_eq!(merged.get("sources"), Some(&json!(["x", "y"])));
        assert_eq!(merged.get("topic"), Some(&json!("A")));
    }

    #[test]
    fn test_overwrite_highest_order_wins() {
        let current = StateRecord::empty();
        let updates = vec![
            update(json!({"summary": "late"})),
            update(json!({"summary": "early"})),
        ];

        let merged = merge(&current, &updates, &[5, 1], &schema()).unwrap();
        assert_eq!(merged.get("summary"), Some(&json!("late")));
    }

    #[test]
    fn test_overwrite_tie_goes_to_last_registered() {
        let current = StateRecord::empty();
        let updates = vec![
            update(json!({"summary": "first"})),
            update(json!({"summary": "second"})),
        ];

        let merged = merge(&current, &updates, &[0, 0], &schema()).unwrap();
        assert_eq!(merged.get("summary"), Some(&json!("second")));
    }

    #[test]
    fn test_merge_reducer() {
        let mut current = StateRecord::empty();
        current.insert("meta", json!({"a": 1}));

        let merged = merge_one(&current, update(json!({"meta": {"b": 2}})), &schema()).unwrap();
        assert_eq!(merged.get("meta"), Some(&json!({"a": 1, "b": 2})));
    }

    #[test]
    fn test_merge_is_deterministic() {
        let mut current = StateRecord::empty();
        current.insert("sources", json!(["seed"]));
        current.insert("topic", json!("A"));
        let updates = vec![
            update(json!({"sources": ["b"], "meta": {"k": 1}, "summary": "b"})),
            update(json!({"sources": ["a"], "meta": {"k": 2}, "summary": "a"})),
        ];

        let first = merge(&current, &updates, &[1, 0], &schema()).unwrap();
        for _ in 0..10 {
            let again = merge(&current, &updates, &[1, 0], &schema()).unwrap();
            assert_eq!(
                serde_json::to_vec(&first).unwrap(),
                serde_json::to_vec(&again).unwrap()
            );
        }
        assert_eq!(first.get("sources"), Some(&json!(["seed", "a", "b"])));
        assert_eq!(first.get("summary"), Some(&json!("b")));
    }

    #[test]
    fn test_order_length_mismatch() {
        let err = merge(&StateRecord::empty(), &[update(json!({}))], &[], &schema()).unwrap_err();
        assert_eq!(
            err,
            MergeError::OrderLength {
                updates: 1,
                order: 0
            }
        );
    }

    #[test]
    fn test_reserved_field_rejected() {
        let err = merge_one(
            &StateRecord::empty(),
            update(json!({"_error": "nope"})),
            &schema(),
        )
        .unwrap_err();
        assert_eq!(err, MergeError::ReservedField("_error".to_string()));
    }

    #[test]
    fn test_append_onto_scalar_is_a_type_mismatch() {
        let mut current = StateRecord::empty();
        current.insert("sources", json!("oops"));

        let err = merge_one(&current, update(json!({"sources": ["x"]})), &schema()).unwrap_err();
        assert!(matches!(err, MergeError::TypeMismatch { ref field, .. } if field == "sources"));
    }

    #[test]
    fn test_overwrite_checks_declared_type() {
        let current = StateRecord::empty();

        let merged = merge_one(
            &current,
            update(json!({"quality_score": 0.8, "topic": null, "extra": "free"})),
            &typed_schema(),
        )
        .unwrap();
        assert_eq!(merged.get("quality_score"), Some(&json!(0.8)));
        assert_eq!(merged.get("extra"), Some(&json!("free")));

        let err = merge_one(
            &current,
            update(json!({"quality_score": "high"})),
            &typed_schema(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            MergeError::TypeMismatch {
                field: "quality_score".to_string(),
                expected: "a number",
                found: "a string".to_string(),
            }
        );
    }
}
