// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Value helpers shared by config resolution and metric reporting.

use serde_json::{Map, Number, Value};

/// Rounds a number to `precision` digits after the decimal point.
///
/// # Examples
///
/// ```
/// use vitals_core::util::round;
///
/// assert_eq!(round(0.123456, 4), 0.1235);
/// assert_eq!(round(2.5, 0), 3.0);
/// ```
pub fn round(number: f64, precision: u32) -> f64 {
    let factor = 10_f64.powi(precision as i32);
    (number * factor).round() / factor
}

/// A string value from an env-style config file, coerced to the primitive it spells.
#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    Bool(bool),
    Null,
    /// The `undefined` literal: the key is treated as absent.
    Undefined,
    Number(Number),
    String(String),
}

impl Primitive {
    /// Coerces a raw string. The checks run in a fixed order: boolean literals,
    /// `null`, `undefined`, numbers, and finally the string itself.
    ///
    /// # Examples
    ///
    /// ```
    /// use vitals_core::util::Primitive;
    ///
    /// assert_eq!(Primitive::parse("false"), Primitive::Bool(false));
    /// assert_eq!(Primitive::parse("05"), Primitive::Number(5.into()));
    /// assert_eq!(Primitive::parse("0.5.0"), Primitive::String("0.5.0".to_string()));
    /// ```
    pub fn parse(raw: &str) -> Self {
        match raw {
            "true" => Primitive::Bool(true),
            "false" => Primitive::Bool(false),
            "null" => Primitive::Null,
            "undefined" => Primitive::Undefined,
            _ => match parse_number(raw) {
                Some(number) => Primitive::Number(number),
                None => Primitive::String(raw.to_string()),
            },
        }
    }

    /// `None` for [`Primitive::Undefined`].
    pub fn into_value(self) -> Option<Value> {
        match self {
            Primitive::Bool(b) => Some(Value::Bool(b)),
            Primitive::Null => Some(Value::Null),
            Primitive::Undefined => None,
            Primitive::Number(n) => Some(Value::Number(n)),
            Primitive::String(s) => Some(Value::String(s)),
        }
    }
}

fn parse_number(raw: &str) -> Option<Number> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return Some(int.into());
    }
    // f64 parsing also accepts "inf" and "NaN", which are not config numbers
    if !trimmed
        .bytes()
        .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'+' | b'e' | b'E'))
    {
        return None;
    }
    trimmed.parse::<f64>().ok().and_then(Number::from_f64)
}

/// Applies [`Primitive::parse`] to every string leaf of a tree.
///
/// Object entries whose value is `undefined` are removed; inside arrays they
/// become `null` so indices are preserved.
pub fn to_primitive(value: Value) -> Value {
    match value {
        Value::String(raw) => Primitive::parse(&raw).into_value().unwrap_or(Value::Null),
        Value::Array(items) => Value::Array(items.into_iter().map(to_primitive).collect()),
        Value::Object(map) => {
            let mut coerced = Map::new();
            for (key, child) in map {
                let child = match child {
                    Value::String(raw) => match Primitive::parse(&raw).into_value() {
                        Some(v) => v,
                        None => continue,
                    },
                    other => to_primitive(other),
                };
                coerced.insert(key, child);
            }
            Value::Object(coerced)
        }
        other => other,
    }
}

/// Truthiness of a config value: `null`, `false`, `0` and `""` are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Deep-merges `overlay` into `base`.
///
/// Mappings are merged key by key; any other value in `overlay` (arrays
/// included) replaces the one in `base` wholesale.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_child) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(base_child) => deep_merge(base_child, overlay_child),
                    None => {
                        base_map.insert(key, overlay_child);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
