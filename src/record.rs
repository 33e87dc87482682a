use {
    crate::{ShardError, ShardResult},
    rusqlite::types::{Value as SqlValue, ValueRef},
    serde_json::{Map, Number, Value},
    std::cmp::Ordering,
};

/// Ordered mapping of field name to scalar value.
///
/// Records written through the single-record path must contain the
/// [`KEY_FIELD`](crate::KEY_FIELD).
pub type Record = Map<String, Value>;

/// Ordered mapping of field name to equality value.
pub type Criteria = Map<String, Value>;

/// Interprets an operand as a mapping.
///
/// Fails with [`ShardError::Sharding`] for anything but a JSON object.
pub fn as_mapping<'a>(value: &'a Value, what: &str) -> ShardResult<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| ShardError::sharding(format!("{what} must be a mapping, got {value}")))
}

/// Interprets an operand as a list of mappings.
pub fn as_mapping_list<'a>(value: &'a Value, what: &str) -> ShardResult<Vec<&'a Map<String, Value>>> {
    let items = value
        .as_array()
        .ok_or_else(|| ShardError::sharding(format!("{what} must be a list, got {value}")))?;
    items.iter().map(|item| as_mapping(item, what)).collect()
}

/// Converts a JSON scalar into an SQLite parameter.
pub(crate) fn to_sql(value: &Value) -> ShardResult<SqlValue> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => {
            return Err(ShardError::sharding(format!(
                "only scalar values can be stored, got {value}"
            )));
        }
    })
}

/// Converts an SQLite column value into a JSON scalar.
pub(crate) fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(t) => Value::from(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Array(b.iter().map(|byte| Value::from(*byte)).collect()),
    }
}

/// Total order over JSON scalars, used to sort merged result sets.
///
/// Nulls first, then booleans, numbers, strings; composites last.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .unwrap_or(f64::NAN)
                .total_cmp(&y.as_f64().unwrap_or(f64::NAN)),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a)
            .cmp(&rank(b))
            .then_with(|| a.to_string().cmp(&b.to_string())),
    }
}
