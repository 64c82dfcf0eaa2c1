// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Conversion between nested metric trees and flat, delimiter-joined keys.
//!
//! ```text
//! { "cpu": { "system": { "load": { "1m": 0.5 } } } }   <->   { "cpu.system.load.1m": 0.5 }
//! ```
//!
//! A leaf is any scalar, or an empty mapping/array. A leaf at the root is
//! stored under the empty key, so `flatten(v)` of a scalar is `{ "": v }`.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::util::is_truthy;

pub const DEFAULT_DELIMITER: &str = ".";

/// Array indices above this are treated as mapping keys when unflattening.
const MAX_ARRAY_INDEX: usize = 4096;

/// Flat view of a metric tree, ordered by key.
pub type FlatMetrics = BTreeMap<String, Value>;

pub fn flatten(tree: &Value, delimiter: &str) -> FlatMetrics {
    let mut flat = FlatMetrics::new();
    flatten_into(tree, delimiter, String::new(), &mut flat);
    flat
}

fn flatten_into(node: &Value, delimiter: &str, path: String, flat: &mut FlatMetrics) {
    match node {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                flatten_into(child, delimiter, join(&path, key, delimiter), flat);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (index, child) in items.iter().enumerate() {
                flatten_into(
                    child,
                    delimiter,
                    join(&path, &index.to_string(), delimiter),
                    flat,
                );
            }
        }
        leaf => {
            flat.insert(path, leaf.clone());
        }
    }
}

fn join(path: &str, key: &str, delimiter: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}{delimiter}{key}")
    }
}

/// Inverse of [`flatten`].
///
/// Each segment decides the container it lives in: an all-digit segment is an
/// array index, anything else a mapping key. Gaps in arrays are filled with `null`.
pub fn unflatten(flat: &FlatMetrics, delimiter: &str) -> Value {
    if flat.len() == 1 {
        if let Some(root) = flat.get("") {
            return root.clone();
        }
    }

    let mut root = Value::Null;
    for (key, value) in flat {
        let segments: Vec<&str> = key.split(delimiter).collect();
        insert_path(&mut root, &segments, value.clone());
    }
    root
}

fn insert_path(slot: &mut Value, segments: &[&str], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *slot = value;
        return;
    };

    match array_index(head) {
        Some(index) => {
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            if let Value::Array(items) = slot {
                if items.len() <= index {
                    items.resize(index + 1, Value::Null);
                }
                insert_path(&mut items[index], rest, value);
            }
        }
        None => {
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            if let Value::Object(map) = slot {
                let child = map.entry(head.to_string()).or_insert(Value::Null);
                insert_path(child, rest, value);
            }
        }
    }
}

fn array_index(segment: &str) -> Option<usize> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment
        .parse::<usize>()
        .ok()
        .filter(|index| *index <= MAX_ARRAY_INDEX)
}

/// Keeps the metrics selected by an `instrument` selector.
///
/// `true` keeps everything and `false` (or any falsy value) keeps nothing. A
/// tree keeps a metric when one of its enabled leaf paths equals the metric
/// path or is a prefix of it ending on a segment boundary.
pub fn filter_instrumented(metrics: FlatMetrics, instrument: &Value, delimiter: &str) -> FlatMetrics {
    match instrument {
        Value::Object(_) => {
            let enabled: Vec<String> = flatten(instrument, delimiter)
                .into_iter()
                .filter(|(_, flag)| is_truthy(flag) && !flag.is_object() && !flag.is_array())
                .map(|(path, _)| path)
                .collect();
            metrics
                .into_iter()
                .filter(|(path, _)| {
                    enabled
                        .iter()
                        .any(|prefix| is_path_prefix(prefix, path, delimiter))
                })
                .collect()
        }
        other if is_truthy(other) => metrics,
        _ => FlatMetrics::new(),
    }
}

fn is_path_prefix(prefix: &str, path: &str, delimiter: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with(delimiter),
        None => false,
    }
}
