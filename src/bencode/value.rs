use bytes::Bytes;
use std::collections::BTreeMap;

/// A decoded bencode tree.
///
/// Byte strings are kept as raw [`Bytes`]; text is never converted
/// implicitly. Use [`Value::string`] or [`Value::bytes`] to build string
/// nodes and [`Value::as_str`] / [`Value::as_bytes`] to read them back.
///
/// # Examples
///
/// ```
/// use rdht::bencode::{decode, Value};
///
/// let value = decode(b"d1:q4:ping1:t2:aae").unwrap();
/// assert_eq!(value.get(b"q").and_then(Value::as_str), Some("ping"));
/// assert_eq!(value.get(b"t").and_then(Value::as_bytes).map(|b| b.len()), Some(2));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A signed 64-bit integer.
    Integer(i64),
    /// A byte string, not necessarily UTF-8.
    Bytes(Bytes),
    /// An ordered list.
    List(Vec<Value>),
    /// A dictionary with unique byte-string keys, iterated in key order.
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    /// Builds a byte-string node from UTF-8 text.
    pub fn string(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// Builds a byte-string node from raw bytes.
    pub fn bytes(b: impl Into<Bytes>) -> Self {
        Value::Bytes(b.into())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the byte string as text when it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up `key` when this node is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}

impl From<BTreeMap<Bytes, Value>> for Value {
    fn from(d: BTreeMap<Bytes, Value>) -> Self {
        Value::Dict(d)
    }
}

/// Incremental builder for dictionary nodes with static keys.
#[derive(Debug, Default)]
pub struct DictBuilder {
    entries: BTreeMap<Bytes, Value>,
}

impl DictBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, key: &'static [u8], value: Value) -> Self {
        self.entries.insert(Bytes::from_static(key), value);
        self
    }

    pub fn insert_opt(self, key: &'static [u8], value: Option<Value>) -> Self {
        match value {
            Some(value) => self.insert(key, value),
            None => self,
        }
    }

    pub fn build(self) -> Value {
        Value::Dict(self.entries)
    }
}
