//! Dataset helpers bound as `utils` inside transformation snippets.

use serde_json::{Map, Value};

use crate::dates::{parse_range_end, parse_timestamp};
use crate::error::ScriptError;
use crate::query::value::{as_num, float_value, py_str, repr, type_name};

type Result<T> = std::result::Result<T, ScriptError>;

/// Group key used for records lacking the field.
pub const MISSING_GROUP: &str = "undefined";

/// Names callable as `utils.<name>(...)`, camelCase aliases included.
pub const UTILS_FUNCTIONS: [&str; 12] = [
    "group_by",
    "groupBy",
    "count_by",
    "countBy",
    "sum_by",
    "sumBy",
    "unique",
    "aggregate",
    "filter_by_date_range",
    "filterByDateRange",
    "in_date_range",
    "inDateRange",
];

/// Aggregation applied per group by [`aggregate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Sum,
    Avg,
    Count,
    Min,
    Max,
}

impl Aggregation {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "sum" => Ok(Aggregation::Sum),
            "avg" => Ok(Aggregation::Avg),
            "count" => Ok(Aggregation::Count),
            "min" => Ok(Aggregation::Min),
            "max" => Ok(Aggregation::Max),
            other => Err(ScriptError::Value(format!(
                "unknown aggregation '{}', expected one of sum, avg, count, min, max",
                other
            ))),
        }
    }
}

fn records<'a>(value: &'a Value, function: &str) -> Result<&'a Vec<Value>> {
    value.as_array().ok_or_else(|| {
        ScriptError::Type(format!(
            "utils.{}() expects a list of records, got {}",
            function,
            type_name(value)
        ))
    })
}

fn group_key(record: &Value, key: &str) -> String {
    match record.get(key) {
        Some(value) => py_str(value),
        None => MISSING_GROUP.to_string(),
    }
}

/// Numeric value of a field: numbers, booleans and numeric strings.
fn field_number(record: &Value, key: &str) -> Option<f64> {
    match record.get(key)? {
        Value::String(s) => s.trim().parse().ok(),
        other => as_num(other).map(|n| n.as_f64()),
    }
}

// == Grouping ==
/// Buckets records by the string form of `key`.
pub fn group_by(data: &Value, key: &str) -> Result<Value> {
    let mut groups: Map<String, Value> = Map::new();
    for record in records(data, "group_by")? {
        let bucket = groups
            .entry(group_key(record, key))
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = bucket {
            items.push(record.clone());
        }
    }
    Ok(Value::Object(groups))
}

/// Number of records per distinct value of `key`.
pub fn count_by(data: &Value, key: &str) -> Result<Value> {
    let mut counts: Map<String, Value> = Map::new();
    for record in records(data, "count_by")? {
        let slot = counts.entry(group_key(record, key)).or_insert(Value::from(0));
        let next = slot.as_i64().unwrap_or(0) + 1;
        *slot = Value::from(next);
    }
    Ok(Value::Object(counts))
}

/// Sum of the numeric values of `key`; non-numeric values are skipped.
pub fn sum_by(data: &Value, key: &str) -> Result<Value> {
    let total: f64 = records(data, "sum_by")?
        .iter()
        .filter_map(|record| field_number(record, key))
        .sum();
    Ok(float_value(total))
}

/// Distinct records, or distinct values of `key`, in first-seen order.
pub fn unique(data: &Value, key: Option<&str>) -> Result<Value> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for record in records(data, "unique")? {
        let candidate = match key {
            Some(key) => match record.get(key) {
                Some(value) => value.clone(),
                None => continue,
            },
            None => record.clone(),
        };
        if seen.insert(repr(&candidate)) {
            out.push(candidate);
        }
    }
    Ok(Value::Array(out))
}

/// Per-group aggregation of `value_key`.
///
/// Missing values count as 0; present non-numeric values are an error.
pub fn aggregate(data: &Value, group_key_name: &str, value_key: &str, op: Aggregation) -> Result<Value> {
    let mut groups: Vec<(String, Vec<f64>)> = Vec::new();
    for record in records(data, "aggregate")? {
        let value = match record.get(value_key) {
            None | Some(Value::Null) => 0.0,
            Some(_) => field_number(record, value_key).ok_or_else(|| {
                ScriptError::Value(format!(
                    "could not convert {} to float",
                    repr(&record[value_key])
                ))
            })?,
        };
        let name = group_key(record, group_key_name);
        match groups.iter_mut().find(|(g, _)| *g == name) {
            Some((_, values)) => values.push(value),
            None => groups.push((name, vec![value])),
        }
    }

    let mut out = Map::new();
    for (name, values) in groups {
        let result = match op {
            Aggregation::Sum => float_value(values.iter().sum()),
            Aggregation::Avg => float_value(values.iter().sum::<f64>() / values.len() as f64),
            Aggregation::Count => Value::from(values.len()),
            Aggregation::Min => float_value(values.iter().cloned().fold(f64::INFINITY, f64::min)),
            Aggregation::Max => float_value(values.iter().cloned().fold(f64::NEG_INFINITY, f64::max)),
        };
        out.insert(name, result);
    }
    Ok(Value::Object(out))
}

// == Dates ==
/// True when `value` parses as a timestamp inside `[start, end]`.
pub fn in_date_range(value: &Value, start: &str, end: &str) -> Result<bool> {
    let (start, end) = date_bounds(start, end)?;
    Ok(value
        .as_str()
        .and_then(parse_timestamp)
        .is_some_and(|date| start <= date && date <= end))
}

/// Records whose `field` lies inside `[start, end]`.
pub fn filter_by_date_range(data: &Value, field: &str, start: &str, end: &str) -> Result<Value> {
    let (start, end) = date_bounds(start, end)?;
    let kept = records(data, "filter_by_date_range")?
        .iter()
        .filter(|record| {
            record
                .get(field)
                .and_then(Value::as_str)
                .and_then(parse_timestamp)
                .is_some_and(|date| start <= date && date <= end)
        })
        .cloned()
        .collect();
    Ok(Value::Array(kept))
}

fn date_bounds(
    start: &str,
    end: &str,
) -> Result<(chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>)> {
    let parsed_start = parse_timestamp(start)
        .ok_or_else(|| ScriptError::Value(format!("invalid start date '{}'", start)))?;
    let parsed_end =
        parse_range_end(end).ok_or_else(|| ScriptError::Value(format!("invalid end date '{}'", end)))?;
    Ok((parsed_start, parsed_end))
}
