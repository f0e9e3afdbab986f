//! Nested record → flat CSV row.
//!
//! - object keys join with `_` (`properties.state.abbr` → `properties_state_abbr`)
//! - arrays stay in one column as compact JSON text
//! - `null` → empty cell
//! - a non-object record becomes a single `value` column
//! - joined names that collide (`{"a_b": 1, "a": {"b": 2}}`) get `_2`, `_3`, ... in visit order
//!
//! Key order follows `serde_json::Map` iteration, so it is stable for equal input.

use std::collections::HashSet;

use serde_json::Value;

pub const SEPARATOR: char = '_';
pub const SCALAR_COLUMN: &str = "value";

pub fn flatten(record: &Value) -> Vec<(String, String)> {
    let mut out = Vec::new();
    match record {
        Value::Object(_) => flatten_into(String::new(), record, &mut out),
        other => out.push((SCALAR_COLUMN.to_string(), cell(other))),
    }
    disambiguate(&mut out);
    out
}

fn disambiguate(row: &mut [(String, String)]) {
    let mut seen: HashSet<String> = HashSet::with_capacity(row.len());
    for (column, _) in row.iter_mut() {
        if seen.insert(column.clone()) {
            continue;
        }
        let mut n = 2u32;
        let renamed = loop {
            let candidate = format!("{column}{SEPARATOR}{n}");
            if !seen.contains(&candidate) {
                break candidate;
            }
            n += 1;
        };
        seen.insert(renamed.clone());
        *column = renamed;
    }
}

fn flatten_into(prefix: String, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let column = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}{SEPARATOR}{key}")
                };
                flatten_into(column, child, out);
            }
        }
        // `{}` at the top level has no columns at all
        Value::Object(_) if prefix.is_empty() => {}
        other => out.push((prefix, cell(other))),
    }
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}
