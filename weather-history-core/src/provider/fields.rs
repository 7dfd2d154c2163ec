//! Per-field extraction from provider JSON.
//!
//! Every helper returns `None` instead of failing: a missing parent object, a
//! wrong type or an empty series only costs that one field.

use serde_json::Value;

/// A JSON number, or a string holding one. Non-finite values are rejected.
pub fn number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Numeric value at a JSON pointer such as `/daily/data/0/temperatureHigh`.
pub fn number_at(body: &Value, pointer: &str) -> Option<f64> {
    body.pointer(pointer).and_then(number)
}

/// Numeric samples of `field` across the array at `series`; entries where the
/// field is missing or non-numeric are skipped.
pub fn samples(body: &Value, series: &str, field: &str) -> Vec<f64> {
    body.pointer(series)
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.get(field).and_then(number))
                .collect()
        })
        .unwrap_or_default()
}

pub fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        None
    } else {
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }
}

pub fn total(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        None
    } else {
        Some(samples.iter().sum())
    }
}
