// Record rewriting
// Progress and session records are opaque JSON trees; every string leaf that is a known
// old id is swapped for its new id, everything else passes through untouched.

use serde_json::Value;
use std::collections::HashMap;

/// Flat old id -> new id table
pub type SubstitutionTable = HashMap<String, String>;

/// Sentinel some records carry instead of a JSON null; never substituted
const NULL_SENTINEL: &str = "null";

fn usable(part: Option<&str>) -> Option<&str> {
    part.filter(|p| !p.is_empty() && *p != NULL_SENTINEL)
}

/// Expand composite entries (`"a;b" -> "x;y"`) into one entry per position.
///
/// Positions where either side is missing, empty or `"null"` are dropped, so
/// `"item;null" -> "new;null"` only yields `item -> new`. Later entries win.
pub fn expand_mapping<K, V, I>(mapping: I) -> SubstitutionTable
where
    K: AsRef<str>,
    V: AsRef<str>,
    I: IntoIterator<Item = (K, Option<V>)>,
{
    let mut expanded = SubstitutionTable::new();

    for (key, value) in mapping {
        let key: &str = key.as_ref();
        let values: Vec<&str> = match &value {
            Some(v) => <V as AsRef<str>>::as_ref(v).split(';').collect(),
            None => Vec::new(),
        };

        for (i, key_part) in key.split(';').enumerate() {
            let (Some(old), Some(new)) = (usable(Some(key_part)), usable(values.get(i).copied()))
            else {
                continue;
            };
            expanded.insert(old.to_string(), new.to_string());
        }
    }

    expanded
}

/// Copy of `value` with every mapped string leaf replaced. Object keys are kept as is.
pub fn deep_replace(value: &Value, table: &SubstitutionTable) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(|v| deep_replace(v, table)).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), deep_replace(v, table)))
                .collect(),
        ),
        Value::String(s) if s == NULL_SENTINEL => value.clone(),
        Value::String(s) => match table.get(s) {
            Some(replacement) if !replacement.is_empty() => Value::String(replacement.clone()),
            _ => value.clone(),
        },
        _ => value.clone(),
    }
}
