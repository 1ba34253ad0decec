use bytes::Bytes;
use std::collections::BTreeMap;

/// A decoded bencode value.
///
/// Bencode has four data types: integers, byte strings, lists, and
/// dictionaries. Dictionary keys are byte strings and arrive sorted, so a
/// `BTreeMap` preserves the source ordering.
///
/// # Examples
///
/// ```
/// use urtorrent::bencode::decode;
///
/// let value = decode(b"d3:fooi7ee").unwrap();
/// assert_eq!(value.get(b"foo").and_then(|v| v.as_integer()), Some(7));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A signed 64-bit integer.
    Integer(i64),
    /// A byte string, not necessarily valid UTF-8.
    Bytes(Bytes),
    /// An ordered list of values.
    List(Vec<Value>),
    /// A dictionary keyed by byte strings.
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    /// Returns the value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the value as a byte string, if it is one.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the value as a UTF-8 string, if it is a valid UTF-8 byte string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Returns the value as a list, if it is one.
    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Returns the value as a dictionary, if it is one.
    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a key if this value is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }
}
