// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dotted-path access into JSON values.
//!
//! Used for `output.select` extraction, `merge_path` page slicing, and
//! `next_page` payload mutations. Paths are dot-separated object keys with
//! numeric segments indexing arrays (`data.items.0.id`).

use crate::retry::MergeStrategy;
use serde_json::Value;

/// Resolve a dotted path. Returns `None` when any segment is missing.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Set a dotted path, creating intermediate objects as needed.
///
/// Existing non-object intermediates are replaced; array segments are not
/// created (only traversed when they already exist).
pub fn set_path(value: &mut Value, path: &str, new_value: Value) {
    let mut current = value;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;
        if last {
            match current {
                Value::Object(map) => {
                    map.insert(segment.to_string(), new_value);
                }
                Value::Array(items) => {
                    if let Ok(index) = segment.parse::<usize>() {
                        if index < items.len() {
                            items[index] = new_value;
                        }
                    }
                }
                other => {
                    let mut map = serde_json::Map::new();
                    map.insert(segment.to_string(), new_value);
                    *other = Value::Object(map);
                }
            }
            return;
        }

        current = match current {
            Value::Array(items) => {
                let Some(index) = segment.parse::<usize>().ok().filter(|i| *i < items.len())
                else {
                    return;
                };
                &mut items[index]
            }
            Value::Object(_) => {
                let map = match current {
                    Value::Object(map) => map,
                    _ => return,
                };
                map.entry(segment.to_string()).or_insert_with(|| Value::Object(Default::default()))
            }
            other => {
                *other = Value::Object(Default::default());
                match other {
                    Value::Object(map) => map
                        .entry(segment.to_string())
                        .or_insert_with(|| Value::Object(Default::default())),
                    _ => return,
                }
            }
        };
    }
}

/// Fold one page into the accumulator per the merge strategy.
///
/// `merge_path` selects the slice of the page to merge (whole page when
/// absent). The accumulator is always an array except under `Replace`.
pub fn merge_pages(
    accumulator: Option<Value>,
    page: &Value,
    strategy: MergeStrategy,
    merge_path: Option<&str>,
) -> Value {
    let slice = match merge_path {
        Some(path) => get_path(page, path).cloned().unwrap_or(Value::Null),
        None => page.clone(),
    };

    match strategy {
        MergeStrategy::Replace => slice,
        MergeStrategy::Collect => {
            let mut items = as_array(accumulator);
            items.push(slice);
            Value::Array(items)
        }
        MergeStrategy::Append => {
            let mut items = as_array(accumulator);
            match slice {
                Value::Array(page_items) => items.extend(page_items),
                Value::Null => {}
                other => items.push(other),
            }
            Value::Array(items)
        }
        MergeStrategy::Extend => {
            let mut items = as_array(accumulator);
            match slice {
                Value::Array(page_items) => {
                    for item in page_items {
                        match item {
                            Value::Array(nested) => items.extend(nested),
                            other => items.push(other),
                        }
                    }
                }
                Value::Null => {}
                other => items.push(other),
            }
            Value::Array(items)
        }
    }
}

fn as_array(value: Option<Value>) -> Vec<Value> {
    match value {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => Vec::new(),
        Some(other) => vec![other],
    }
}

#[cfg(test)]
#[path = "json_path_tests.rs"]
mod tests;
