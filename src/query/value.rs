//! Operations on snippet values.
//!
//! Snippets compute directly over `serde_json::Value`: tuples become arrays,
//! dict keys are always strings, and ints stay `i64` until they overflow.

use std::cmp::Ordering;

use serde_json::{Number, Value};

use crate::error::ScriptError;
use crate::query::ast::BinOp;

/// Upper bound on lists and strings built by repetition or `range`.
pub const MAX_SEQUENCE_LEN: usize = 64 * 1024 * 1024;

/// String bytes that weigh as much as one value node.
const TEXT_BYTES_PER_UNIT: usize = 16;

type Result<T> = std::result::Result<T, ScriptError>;

// == Numbers ==
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    pub fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Num::Int(i) => Value::from(i),
            Num::Float(f) => float_value(f),
        }
    }
}

/// Float as JSON; NaN and infinities have no JSON form and become null.
pub fn float_value(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

/// Numeric view of a value. Booleans count as 0 and 1.
pub fn as_num(value: &Value) -> Option<Num> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(Num::Int(i)),
            None => n.as_f64().map(Num::Float),
        },
        Value::Bool(b) => Some(Num::Int(*b as i64)),
        _ => None,
    }
}

pub fn as_int(value: &Value) -> Option<i64> {
    match as_num(value)? {
        Num::Int(i) => Some(i),
        Num::Float(_) => None,
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "NoneType",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

// == Text Forms ==
pub fn float_str(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        f.to_string()
    }
}

/// `str(value)`
pub fn py_str(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => match (n.as_i64(), n.as_u64()) {
            (Some(i), _) => i.to_string(),
            (None, Some(u)) => u.to_string(),
            _ => float_str(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => s.clone(),
        other => repr(other),
    }
}

/// `repr(value)`
pub fn repr(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(repr).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Object(map) => {
            let inner: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", repr(&Value::String(k.clone())), repr(v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
        other => py_str(other),
    }
}

/// Dict key for a value. Scalars are stringified, containers are rejected.
pub fn key_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Array(_) | Value::Object(_) => Err(ScriptError::Type(format!(
            "unhashable type: '{}'",
            type_name(value)
        ))),
        scalar => Ok(py_str(scalar)),
    }
}

// == Equality & Ordering ==
pub fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (as_num(a), as_num(b)) {
        return match (x, y) {
            (Num::Int(x), Num::Int(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        };
    }
    match (a, b) {
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => a == b,
    }
}

fn num_cmp(x: Num, y: Num) -> Ordering {
    match (x, y) {
        (Num::Int(x), Num::Int(y)) => x.cmp(&y),
        (Num::Int(i), Num::Float(f)) => int_float_cmp(i, f),
        (Num::Float(f), Num::Int(i)) => int_float_cmp(i, f).reverse(),
        // JSON numbers are never NaN
        (Num::Float(x), Num::Float(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
    }
}

/// Exact int/float ordering; `i as f64` would round above 2^53.
fn int_float_cmp(i: i64, f: f64) -> Ordering {
    const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
    if f >= TWO_POW_63 {
        return Ordering::Less;
    }
    if f < -TWO_POW_63 {
        return Ordering::Greater;
    }
    let whole = f.floor();
    match i.cmp(&(whole as i64)) {
        Ordering::Equal if f > whole => Ordering::Less,
        other => other,
    }
}

pub fn compare(a: &Value, b: &Value) -> Result<Ordering> {
    if let (Some(x), Some(y)) = (as_num(a), as_num(b)) {
        return Ok(num_cmp(x, y));
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y) {
                let ordering = compare(l, r)?;
                if ordering != Ordering::Equal {
                    return Ok(ordering);
                }
            }
            Ok(x.len().cmp(&y.len()))
        }
        _ => Err(ScriptError::Type(format!(
            "'<' not supported between instances of '{}' and '{}'",
            type_name(a),
            type_name(b)
        ))),
    }
}

/// `item in container`
pub fn contains(container: &Value, item: &Value) -> Result<bool> {
    match container {
        Value::Array(items) => Ok(items.iter().any(|candidate| values_equal(candidate, item))),
        Value::Object(map) => Ok(map.contains_key(&key_string(item)?)),
        Value::String(s) => match item {
            Value::String(needle) => Ok(s.contains(needle.as_str())),
            other => Err(ScriptError::Type(format!(
                "'in <string>' requires string as left operand, not {}",
                type_name(other)
            ))),
        },
        other => Err(ScriptError::Type(format!(
            "argument of type '{}' is not iterable",
            type_name(other)
        ))),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) | Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Array(_) => 3,
        Value::Object(_) => 4,
    }
}

/// Ordering over every value that agrees with [`compare`] wherever that
/// succeeds and ranks mismatched types by kind.
pub fn total_order(a: &Value, b: &Value) -> Ordering {
    if let (Some(x), Some(y)) = (as_num(a), as_num(b)) {
        return num_cmp(x, y);
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y)
            .map(|(l, r)| total_order(l, r))
            .find(|ordering| *ordering != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Stable sort of `items` by the parallel `keys`.
///
/// Keys that do not compare (mixed types, dicts, None) fail with a
/// TypeError once the sorted neighbours are checked.
pub fn sort_by_keys(items: Vec<Value>, keys: Vec<Value>, reverse: bool) -> Result<Vec<Value>> {
    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by(|&a, &b| {
        let ordering = total_order(&keys[a], &keys[b]);
        if reverse {
            ordering.reverse()
        } else {
            ordering
        }
    });
    for pair in order.windows(2) {
        compare(&keys[pair[0]], &keys[pair[1]])?;
    }

    let mut slots: Vec<Option<Value>> = items.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}

// == Size Accounting ==
/// Node count and nesting depth of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    /// One per value, strings weighted by length
    pub units: u64,
    pub depth: usize,
}

fn text_units(bytes: usize) -> u64 {
    (1 + bytes / TEXT_BYTES_PER_UNIT) as u64
}

/// Walks a value without recursion, so arbitrarily deep values are safe.
pub fn shape(value: &Value) -> Shape {
    let mut units = 0u64;
    let mut depth = 0;
    let mut pending = vec![(value, 1usize)];
    while let Some((value, level)) = pending.pop() {
        depth = depth.max(level);
        units = units.saturating_add(match value {
            Value::String(s) => text_units(s.len()),
            _ => 1,
        });
        match value {
            Value::Array(items) => pending.extend(items.iter().map(|item| (item, level + 1))),
            Value::Object(map) => pending.extend(map.values().map(|item| (item, level + 1))),
            _ => {}
        }
    }
    Shape { units, depth }
}

/// Units a binary operation is about to allocate, known before it runs.
pub fn produced_units(op: BinOp, left: &Value, right: &Value) -> u64 {
    let times = |count: &Value| as_int(count).map_or(0, |n| n.max(0) as u64);
    match (op, left, right) {
        (BinOp::Add, Value::String(a), Value::String(b)) => text_units(a.len() + b.len()),
        (BinOp::Add, Value::Array(_), Value::Array(_)) => {
            shape(left).units.saturating_add(shape(right).units)
        }
        (BinOp::Mul, Value::String(s), count) | (BinOp::Mul, count, Value::String(s)) => {
            text_units(s.len().saturating_mul(times(count) as usize))
        }
        (BinOp::Mul, seq @ Value::Array(_), count) | (BinOp::Mul, count, seq @ Value::Array(_)) => {
            shape(seq).units.saturating_mul(times(count))
        }
        _ => 0,
    }
}

// == Iteration & Indexing ==
/// Items produced by `for x in value`.
pub fn iterate(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(map) => Ok(map.into_iter().map(|(k, _)| Value::String(k)).collect()),
        Value::String(s) => Ok(s.chars().map(|c| Value::String(c.to_string())).collect()),
        other => Err(ScriptError::Type(format!(
            "'{}' object is not iterable",
            type_name(&other)
        ))),
    }
}

/// Resolves a possibly negative index against `len`.
pub fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let resolved = if index < 0 {
        (len as i64).checked_add(index)?
    } else {
        index
    };
    usize::try_from(resolved).ok().filter(|i| *i < len)
}

fn list_index(index: &Value, kind: &str) -> Result<i64> {
    as_int(index).ok_or_else(|| {
        ScriptError::Type(format!(
            "{} indices must be integers, not {}",
            kind,
            type_name(index)
        ))
    })
}

fn not_subscriptable(target: &Value) -> ScriptError {
    ScriptError::Type(format!(
        "'{}' object is not subscriptable",
        type_name(target)
    ))
}

/// `target[index]` by reference, for lists and dicts.
pub fn item_ref<'v>(target: &'v Value, index: &Value) -> Result<&'v Value> {
    match target {
        Value::Array(items) => {
            let i = list_index(index, "list")?;
            normalize_index(i, items.len())
                .map(|i| &items[i])
                .ok_or_else(|| ScriptError::Index("list index out of range".into()))
        }
        Value::Object(map) => map
            .get(&key_string(index)?)
            .ok_or_else(|| ScriptError::Key(repr(index))),
        other => Err(not_subscriptable(other)),
    }
}

/// Mutable `target[index]` for an existing list slot or dict key.
pub fn item_mut<'v>(target: &'v mut Value, index: &Value) -> Result<&'v mut Value> {
    match target {
        Value::Array(items) => {
            let i = list_index(index, "list")?;
            match normalize_index(i, items.len()) {
                Some(i) => Ok(&mut items[i]),
                None => Err(ScriptError::Index("list index out of range".into())),
            }
        }
        Value::Object(map) => map
            .get_mut(&key_string(index)?)
            .ok_or_else(|| ScriptError::Key(repr(index))),
        other => Err(not_subscriptable(other)),
    }
}

/// `target[index] = value`
pub fn set_item(target: &mut Value, index: &Value, value: Value) -> Result<()> {
    match target {
        Value::Array(items) => {
            let i = list_index(index, "list")?;
            let slot = normalize_index(i, items.len())
                .ok_or_else(|| ScriptError::Index("list assignment index out of range".into()))?;
            items[slot] = value;
            Ok(())
        }
        Value::Object(map) => {
            map.insert(key_string(index)?, value);
            Ok(())
        }
        other => Err(ScriptError::Type(format!(
            "'{}' object does not support item assignment",
            type_name(other)
        ))),
    }
}

/// `target[index]`
pub fn get_item(target: &Value, index: &Value) -> Result<Value> {
    match target {
        Value::String(s) => {
            let i = list_index(index, "string")?;
            let chars: Vec<char> = s.chars().collect();
            normalize_index(i, chars.len())
                .map(|i| Value::String(chars[i].to_string()))
                .ok_or_else(|| ScriptError::Index("string index out of range".into()))
        }
        other => item_ref(other, index).cloned(),
    }
}

/// `target[lower:upper]`
pub fn slice(target: &Value, lower: Option<i64>, upper: Option<i64>) -> Result<Value> {
    let bounds = |len: usize| {
        let clamp = |i: i64| -> usize {
            if i < 0 {
                (len as i64 + i).max(0) as usize
            } else {
                (i as usize).min(len)
            }
        };
        let lo = lower.map(clamp).unwrap_or(0);
        let hi = upper.map(clamp).unwrap_or(len);
        (lo, hi.max(lo))
    };

    match target {
        Value::Array(items) => {
            let (lo, hi) = bounds(items.len());
            Ok(Value::Array(items[lo..hi].to_vec()))
        }
        Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            let (lo, hi) = bounds(chars.len());
            Ok(Value::String(chars[lo..hi].iter().collect()))
        }
        other => Err(ScriptError::Type(format!(
            "'{}' object is not sliceable",
            type_name(other)
        ))),
    }
}

// == Arithmetic ==
pub fn unary_minus(value: &Value) -> Result<Value> {
    match as_num(value) {
        Some(Num::Int(i)) => Ok(i
            .checked_neg()
            .map(Value::from)
            .unwrap_or_else(|| float_value(-(i as f64)))),
        Some(Num::Float(f)) => Ok(float_value(-f)),
        None => Err(ScriptError::Type(format!(
            "bad operand type for unary -: '{}'",
            type_name(value)
        ))),
    }
}

pub fn binary(op: BinOp, left: &Value, right: &Value) -> Result<Value> {
    match (op, left, right) {
        (BinOp::Add, Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
        (BinOp::Add, Value::Array(a), Value::Array(b)) => {
            Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
        }
        (BinOp::Mul, Value::String(s), count) | (BinOp::Mul, count, Value::String(s))
            if !count.is_string() =>
        {
            let times = repeat_count(count)?;
            check_len(s.len().saturating_mul(times))?;
            Ok(Value::String(s.repeat(times)))
        }
        (BinOp::Mul, Value::Array(items), count) | (BinOp::Mul, count, Value::Array(items))
            if !count.is_array() =>
        {
            let times = repeat_count(count)?;
            check_len(items.len().saturating_mul(times))?;
            let mut repeated = Vec::with_capacity(items.len() * times);
            for _ in 0..times {
                repeated.extend(items.iter().cloned());
            }
            Ok(Value::Array(repeated))
        }
        _ => numeric(op, left, right),
    }
}

fn repeat_count(count: &Value) -> Result<usize> {
    let n = as_int(count).ok_or_else(|| {
        ScriptError::Type(format!(
            "can't multiply sequence by non-int of type '{}'",
            type_name(count)
        ))
    })?;
    Ok(n.max(0) as usize)
}

fn check_len(len: usize) -> Result<()> {
    if len > MAX_SEQUENCE_LEN {
        return Err(ScriptError::Value(format!(
            "sequence of {} items exceeds the maximum of {}",
            len, MAX_SEQUENCE_LEN
        )));
    }
    Ok(())
}

fn numeric(op: BinOp, left: &Value, right: &Value) -> Result<Value> {
    let (a, b) = match (as_num(left), as_num(right)) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(ScriptError::Type(format!(
                "unsupported operand type(s) for {}: '{}' and '{}'",
                op.symbol(),
                type_name(left),
                type_name(right)
            )))
        }
    };

    let result = match (a, b) {
        (Num::Int(x), Num::Int(y)) => int_op(op, x, y)?,
        _ => float_op(op, a.as_f64(), b.as_f64())?,
    };
    Ok(result.into_value())
}

fn int_op(op: BinOp, x: i64, y: i64) -> Result<Num> {
    // overflow falls back to float arithmetic
    let widen = |f: fn(f64, f64) -> f64| Num::Float(f(x as f64, y as f64));
    Ok(match op {
        BinOp::Add => x.checked_add(y).map(Num::Int).unwrap_or_else(|| widen(|a, b| a + b)),
        BinOp::Sub => x.checked_sub(y).map(Num::Int).unwrap_or_else(|| widen(|a, b| a - b)),
        BinOp::Mul => x.checked_mul(y).map(Num::Int).unwrap_or_else(|| widen(|a, b| a * b)),
        BinOp::Div => {
            if y == 0 {
                return Err(ScriptError::ZeroDivision);
            }
            Num::Float(x as f64 / y as f64)
        }
        BinOp::FloorDiv => {
            if y == 0 {
                return Err(ScriptError::ZeroDivision);
            }
            match (x.checked_div(y), x.checked_rem(y)) {
                (Some(q), Some(r)) if r != 0 && ((r < 0) != (y < 0)) => Num::Int(q - 1),
                (Some(q), Some(_)) => Num::Int(q),
                _ => widen(|a, b| (a / b).floor()),
            }
        }
        BinOp::Mod => {
            if y == 0 {
                return Err(ScriptError::ZeroDivision);
            }
            match x.checked_rem(y) {
                Some(r) if r != 0 && ((r < 0) != (y < 0)) => Num::Int(r + y),
                Some(r) => Num::Int(r),
                None => Num::Int(0),
            }
        }
        BinOp::Pow => {
            if y >= 0 {
                u32::try_from(y)
                    .ok()
                    .and_then(|exp| x.checked_pow(exp))
                    .map(Num::Int)
                    .unwrap_or_else(|| widen(f64::powf))
            } else {
                widen(f64::powf)
            }
        }
    })
}

fn float_op(op: BinOp, a: f64, b: f64) -> Result<Num> {
    let needs_divisor = matches!(op, BinOp::Div | BinOp::FloorDiv | BinOp::Mod);
    if needs_divisor && b == 0.0 {
        return Err(ScriptError::ZeroDivision);
    }
    Ok(Num::Float(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        BinOp::FloorDiv => (a / b).floor(),
        BinOp::Mod => a - b * (a / b).floor(),
        BinOp::Pow => a.powf(b),
    }))
}
