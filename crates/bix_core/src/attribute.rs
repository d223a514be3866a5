//! Attributes (indexable fields) and the typed values stored under them.
//!
//! Value encoding (catalog and reverse files):
//!   bool:   [1][0|1]
//!   number: [2][i64 big-endian with the sign bit flipped]
//!   string: [3][utf-8 bytes]
//!
//! The tag orders the types (bool < number < string) and the number payload
//! keeps numeric order, so encoded values sort the same as `Value`.

use crate::consts::{MAX_ATTRIBUTE_LEN, TAG_BOOL, TAG_NUM, TAG_STR};
use crate::errors::{BixError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// An indexable field. Cheap to clone; compared by name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Attribute(Arc<str>);

impl Attribute {
    pub const AUTHOR: &'static str = "author";
    pub const BOUT: &'static str = "bout";
    /// Synthetic grouping marker maintained by the writer.
    pub const BUNDLE: &'static str = "bundle";
    pub const TEXT: &'static str = "text";

    /// Names double as file names, so they are restricted to `[a-z0-9_-]`.
    pub fn new(name: &str) -> Result<Self> {
        let ok = !name.is_empty()
            && name.len() <= MAX_ATTRIBUTE_LEN
            && name.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
        if !ok {
            return Err(BixError::InvalidInput(format!("bad attribute name '{name}'")));
        }
        Ok(Self(Arc::from(name)))
    }

    pub fn author() -> Self { Self(Arc::from(Self::AUTHOR)) }
    pub fn bout() -> Self { Self(Arc::from(Self::BOUT)) }
    pub fn bundle() -> Self { Self(Arc::from(Self::BUNDLE)) }
    pub fn text() -> Self { Self(Arc::from(Self::TEXT)) }

    pub fn name(&self) -> &str { &self.0 }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl TryFrom<String> for Attribute {
    type Error = BixError;
    fn try_from(s: String) -> Result<Self> { Self::new(&s) }
}

impl From<Attribute> for String {
    fn from(a: Attribute) -> String { a.0.to_string() }
}

/// Typed literal used as a catalog key. Ordering: bools, then numbers, then strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Num(i64),
    Str(String),
}

impl Value {
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Value::Bool(b) => { out.push(TAG_BOOL); out.push(*b as u8); }
            Value::Num(n) => {
                out.push(TAG_NUM);
                out.extend_from_slice(&((*n as u64) ^ (1 << 63)).to_be_bytes());
            }
            Value::Str(s) => { out.push(TAG_STR); out.extend_from_slice(s.as_bytes()); }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let bad = |d: &str| BixError::decode("value", d.to_string());
        let (&tag, body) = buf.split_first().ok_or_else(|| bad("empty"))?;
        match tag {
            TAG_BOOL => match body {
                [0] => Ok(Value::Bool(false)),
                [1] => Ok(Value::Bool(true)),
                _ => Err(bad("bool payload")),
            },
            TAG_NUM => {
                let raw: [u8; 8] = body.try_into().map_err(|_| bad("number payload"))?;
                Ok(Value::Num((u64::from_be_bytes(raw) ^ (1 << 63)) as i64))
            }
            TAG_STR => std::str::from_utf8(body)
                .map(|s| Value::Str(s.to_string()))
                .map_err(|_| bad("string is not utf-8")),
            t => Err(bad(&format!("unknown tag {t}"))),
        }
    }

    /// Truthiness used for custom predicate results and literals.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0,
            Value::Str(s) => !s.is_empty(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self { Value::Str(s) => Some(s), _ => None }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Num(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<&str> for Value { fn from(s: &str) -> Self { Value::Str(s.to_string()) } }
impl From<String> for Value { fn from(s: String) -> Self { Value::Str(s) } }
impl From<i64> for Value { fn from(n: i64) -> Self { Value::Num(n) } }
impl From<i32> for Value { fn from(n: i32) -> Self { Value::Num(n.into()) } }
impl From<bool> for Value { fn from(b: bool) -> Self { Value::Bool(b) } }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_names_are_validated() {
        assert!(Attribute::new("author").is_ok());
        assert!(Attribute::new("x-1_y").is_ok());
        assert!(Attribute::new("").is_err());
        assert!(Attribute::new("../etc").is_err());
        assert!(Attribute::new("Author").is_err());
    }

    #[test]
    fn encoded_values_sort_like_values() {
        let mut vals = vec![
            Value::from("b"), Value::from(-5), Value::from(true), Value::from(""),
            Value::from(i64::MIN), Value::from(7), Value::from(false), Value::from("a"),
        ];
        let mut by_bytes = vals.clone();
        vals.sort();
        by_bytes.sort_by_key(|v| v.to_bytes());
        assert_eq!(vals, by_bytes);
        for v in &vals {
            assert_eq!(&Value::decode(&v.to_bytes()).unwrap(), v);
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Value::decode(&[]).is_err());
        assert!(Value::decode(&[9, 1]).is_err());
        assert!(Value::decode(&[TAG_NUM, 1, 2]).is_err());
    }
}
