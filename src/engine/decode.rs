//! Row decoding for `JSONCompactEachRowWithNamesAndTypes` responses
//!
//! The first two lines carry column names and types; every following line is
//! one row as a JSON array. Values are converted to [`Value`] using the
//! declared column type so that e.g. `DateTime` strings become timestamps.

use crate::core::record::Vars;
use crate::core::value::Value;
use crate::engine::EngineError;
use chrono::NaiveDate;

/// Decode a full response body into rows
pub fn decode_rows(body: &str) -> Result<Vec<Vars>, EngineError> {
    let mut lines = body.lines().filter(|l| !l.trim().is_empty());

    let names: Vec<String> = match lines.next() {
        Some(line) => parse_line(line)?,
        None => return Ok(Vec::new()),
    };
    let types: Vec<String> = match lines.next() {
        Some(line) => parse_line(line)?,
        None => return Err(EngineError::Decode("missing column types line".to_string())),
    };

    if names.len() != types.len() {
        return Err(EngineError::Decode(format!(
            "{} column names but {} column types",
            names.len(),
            types.len()
        )));
    }

    let mut rows = Vec::new();
    for line in lines {
        let values: Vec<serde_json::Value> = parse_line(line)?;
        if values.len() != names.len() {
            return Err(EngineError::Decode(format!(
                "row has {} values, expected {}",
                values.len(),
                names.len()
            )));
        }

        let row: Vars = names
            .iter()
            .zip(types.iter())
            .zip(values.iter())
            .map(|((name, ty), value)| (name.clone(), decode_value(ty, value)))
            .collect();
        rows.push(row);
    }

    Ok(rows)
}

fn parse_line<T: serde::de::DeserializeOwned>(line: &str) -> Result<Vec<T>, EngineError> {
    serde_json::from_str(line).map_err(|e| EngineError::Decode(format!("{}: {}", e, line)))
}

/// Convert one JSON value according to its ClickHouse column type
pub fn decode_value(ty: &str, value: &serde_json::Value) -> Value {
    let ty = ty.trim();

    if let Some(inner) = unwrap_type(ty, "LowCardinality") {
        return decode_value(inner, value);
    }
    if let Some(inner) = unwrap_type(ty, "Nullable") {
        return decode_value(inner, value);
    }
    if value.is_null() {
        return Value::Null;
    }

    if let Some(inner) = unwrap_type(ty, "Array") {
        return match value {
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(|v| decode_value(inner, v)).collect())
            }
            other => Value::from_json(other),
        };
    }

    if let Some(inner) = unwrap_type(ty, "Map") {
        let value_type = split_top_level(inner).get(1).copied().unwrap_or("String");
        return match value {
            serde_json::Value::Object(m) => Value::Map(
                m.iter()
                    .map(|(k, v)| (k.clone(), decode_value(value_type, v)))
                    .collect(),
            ),
            other => Value::from_json(other),
        };
    }

    let base = ty.split('(').next().unwrap_or(ty);
    match base {
        "DateTime" | "DateTime64" => value
            .as_str()
            .and_then(Value::parse_datetime)
            .unwrap_or_else(|| Value::from_json(value)),
        "Date" | "Date32" => value
            .as_str()
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| Value::DateTime(dt.and_utc()))
            .unwrap_or_else(|| Value::from_json(value)),
        "UInt8" | "UInt16" | "UInt32" | "UInt64" => number_or_string(value, |s| {
            s.parse::<u64>().ok().map(Value::UInt)
        })
        .unwrap_or_else(|| Value::from_json(value)),
        "Int8" | "Int16" | "Int32" | "Int64" => value
            .as_i64()
            .map(Value::Int)
            .or_else(|| value.as_str().and_then(|s| s.parse::<i64>().ok()).map(Value::Int))
            .unwrap_or_else(|| Value::from_json(value)),
        "Float32" | "Float64" => value
            .as_f64()
            .map(Value::Float)
            .or_else(|| value.as_str().and_then(parse_special_float).map(Value::Float))
            .unwrap_or_else(|| Value::from_json(value)),
        "Bool" => value
            .as_bool()
            .map(Value::Bool)
            .unwrap_or_else(|| Value::from_json(value)),
        _ => Value::from_json(value),
    }
}

fn number_or_string(
    value: &serde_json::Value,
    parse: impl Fn(&str) -> Option<Value>,
) -> Option<Value> {
    value
        .as_u64()
        .map(Value::UInt)
        .or_else(|| value.as_str().and_then(parse))
}

fn parse_special_float(s: &str) -> Option<f64> {
    match s {
        "nan" => Some(f64::NAN),
        "inf" | "+inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        other => other.parse().ok(),
    }
}

/// `Wrapper(Inner)` -> `Inner`
fn unwrap_type<'a>(ty: &'a str, wrapper: &str) -> Option<&'a str> {
    ty.strip_prefix(wrapper)
        .and_then(|rest| rest.strip_prefix('('))
        .and_then(|rest| rest.strip_suffix(')'))
}

/// Split type arguments on commas that are not nested in parentheses
fn split_top_level(args: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in args.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(args[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(args[start..].trim());
    parts
}
