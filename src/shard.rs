use {
    crate::{ShardError, ShardResult},
    serde::{Deserialize, Serialize},
    serde_json::Value,
    std::{borrow::Borrow, fmt},
};

/// Name of the record field used as the routing key.
pub const KEY_FIELD: &str = "id";

/// Shard identifier.
///
/// Opaque string, unique within a strategy's shard set. The identifier also
/// names the backing file of the shard (`{shard_base_path}/{id}.db`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    /// Creates a new shard identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier can name a file inside the shard directory.
    ///
    /// Empty ids, path separators and `..` are rejected.
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && !self.0.contains(['/', '\\', '\0'])
            && !self.0.contains("..")
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ShardId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for ShardId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for ShardId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for ShardId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Routing key.
///
/// Only integers and non-empty strings can route. Integers order before
/// strings, which matters for the range strategy only when both kinds are
/// mixed in one range map.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShardKey {
    Int(i64),
    Text(String),
}

impl ShardKey {
    /// Validates a JSON scalar and converts it into a routing key.
    ///
    /// Fails with [`ShardError::InvalidKey`] for null, empty strings,
    /// floats, booleans and composite values.
    pub fn from_value(value: &Value) -> ShardResult<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(ShardKey::Int).ok_or_else(|| {
                invalid_key(value, "sharding key must be an integer or string")
            }),
            Value::String(s) if s.is_empty() => {
                Err(invalid_key(value, "sharding key cannot be empty"))
            }
            Value::String(s) => Ok(ShardKey::Text(s.clone())),
            Value::Null => Err(invalid_key(value, "sharding key cannot be null")),
            _ => Err(invalid_key(
                value,
                "sharding key must be an integer or string",
            )),
        }
    }

    /// Converts the key back into a JSON scalar.
    pub fn to_value(&self) -> Value {
        match self {
            ShardKey::Int(i) => Value::from(*i),
            ShardKey::Text(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for ShardKey {
    /// Canonical rendering, used for hashing and as directory key.
    ///
    /// `1` and `"1"` render identically, hence route identically.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardKey::Int(i) => write!(f, "{i}"),
            ShardKey::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ShardKey {
    fn from(key: i64) -> Self {
        ShardKey::Int(key)
    }
}

impl From<i32> for ShardKey {
    fn from(key: i32) -> Self {
        ShardKey::Int(key.into())
    }
}

impl From<u32> for ShardKey {
    fn from(key: u32) -> Self {
        ShardKey::Int(key.into())
    }
}

impl From<&str> for ShardKey {
    fn from(key: &str) -> Self {
        ShardKey::Text(key.to_string())
    }
}

fn invalid_key(value: &Value, reason: &str) -> ShardError {
    ShardError::InvalidKey {
        key: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn key_validation() {
        assert_eq!(ShardKey::from_value(&json!(42)).unwrap(), ShardKey::Int(42));
        assert_eq!(ShardKey::from_value(&json!(0)).unwrap(), ShardKey::Int(0));
        assert_eq!(
            ShardKey::from_value(&json!("user-1")).unwrap(),
            ShardKey::Text("user-1".to_string())
        );

        for bad in [json!(null), json!(""), json!(1.5), json!(true), json!([1]), json!({})] {
            let err = ShardKey::from_value(&bad).unwrap_err();
            assert_eq!(err.code(), 1310, "expected invalid key for {bad}");
        }
    }

    #[test]
    fn canonical_rendering() {
        assert_eq!(ShardKey::Int(7).to_string(), "7");
        assert_eq!(ShardKey::from("7").to_string(), "7");
        assert_eq!(ShardKey::Int(7).to_value(), json!(7));
        assert!(ShardKey::Int(i64::MAX) < ShardKey::from("a"));
    }

    #[test]
    fn shard_id_serde() {
        let id = ShardId::from("shard_1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"shard_1\"");
        assert_eq!(id, "shard_1");
        assert_eq!(id.as_str(), "shard_1");
    }

    #[test]
    fn path_safety() {
        for ok in ["shard_1", "eu-west.2", "a b"] {
            assert!(ShardId::from(ok).is_path_safe(), "{ok} should be accepted");
        }
        for bad in ["", "..", "../x", "a/b", "a\\b", "x..y"] {
            assert!(!ShardId::from(bad).is_path_safe(), "{bad} should be rejected");
        }
    }
}
