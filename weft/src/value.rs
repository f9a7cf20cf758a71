// Copyright (c) 2020-present, UMD Database Group.
//
// This program is free software: you can use, redistribute, and/or modify
// it under the terms of the GNU Affero General Public License, version 3
// or later ("AGPL"), as published by the Free Software Foundation.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

//! The transport value model shared by resolvers, the result index and the
//! cache payloads.
//!
//! Resolvers produce [`Value`]s, the index stores them, proxies hand them
//! back out. [`Ident`] is the hashable subset of [`Value`] that can address
//! a row in the index.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use blake2::Digest;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};
use crate::result::Reference;

/// A dynamically-typed value moving through the engine.
///
/// `Nothing` is a distinct absence marker: it is what a `Maybe` link
/// resolver returns for a missing edge and what a defaultless option
/// declares as its default. It is not equal to `Null`, which is a regular
/// stored value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Absence marker, see above.
    Nothing,
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// String value.
    String(String),
    /// Ordered sequence of values.
    Seq(Vec<Value>),
    /// Record value with string keys.
    Map(BTreeMap<String, Value>),
    /// Symbolic edge into the result index.
    Ref(Reference),
}

impl Value {
    /// Builds a `Seq` value from anything convertible to values.
    pub fn seq<I, T>(items: I) -> Value
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Value::Seq(items.into_iter().map(Into::into).collect())
    }

    /// Builds a `Map` value from string keyed entries.
    pub fn map<I, K, T>(entries: I) -> Value
    where
        I: IntoIterator<Item = (K, T)>,
        K: Into<String>,
        T: Into<Value>,
    {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Short, human readable shape description used by error messages.
    pub fn describe(&self) -> String {
        match self {
            Value::Nothing => "Nothing".to_owned(),
            Value::Null => "null".to_owned(),
            Value::Bool(_) => "boolean".to_owned(),
            Value::Int(_) => "integer".to_owned(),
            Value::Float(_) => "float".to_owned(),
            Value::String(_) => "string".to_owned(),
            Value::Seq(items) => format!("sequence (len: {})", items.len()),
            Value::Map(entries) => format!("map (len: {})", entries.len()),
            Value::Ref(r) => format!("reference to {}", r),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Ident> for Value {
    fn from(v: Ident) -> Self {
        match v {
            Ident::Bool(b) => Value::Bool(b),
            Ident::Int(i) => Value::Int(i),
            Ident::Str(s) => Value::String(s),
        }
    }
}

impl From<Reference> for Value {
    fn from(v: Reference) -> Self {
        Value::Ref(v)
    }
}

/// The hashable subset of [`Value`] usable as a node ident.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Ident {
    /// Boolean ident.
    Bool(bool),
    /// Integer ident.
    Int(i64),
    /// String ident.
    Str(String),
}

impl Display for Ident {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Ident::Bool(b) => write!(f, "{}", b),
            Ident::Int(i) => write!(f, "{}", i),
            Ident::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for Ident {
    fn from(v: i64) -> Self {
        Ident::Int(v)
    }
}

impl From<i32> for Ident {
    fn from(v: i32) -> Self {
        Ident::Int(v as i64)
    }
}

impl From<&str> for Ident {
    fn from(v: &str) -> Self {
        Ident::Str(v.to_owned())
    }
}

impl From<String> for Ident {
    fn from(v: String) -> Self {
        Ident::Str(v)
    }
}

const IDENT_HINT: &str =
    "use an integer, string or boolean ident, or map record idents to a scalar key";

/// Converts a resolver-produced value into an ident.
pub fn ident_of(value: &Value) -> Result<Ident> {
    match value {
        Value::Bool(b) => Ok(Ident::Bool(*b)),
        Value::Int(i) => Ok(Ident::Int(*i)),
        Value::String(s) => Ok(Ident::Str(s.clone())),
        other => Err(WeftError::UnhashableIdent(format!(
            "{} cannot address an index row.\nHint: {}",
            other.describe(),
            IDENT_HINT
        ))),
    }
}

/// Feeds a stable byte encoding of `value` into a digest.
///
/// Every variant contributes a tag byte, variable-length payloads a length
/// prefix, so distinct values never produce colliding byte streams.
pub fn hash_value<D: Digest>(value: &Value, hasher: &mut D) {
    match value {
        Value::Nothing => hasher.update([0u8]),
        Value::Null => hasher.update([1u8]),
        Value::Bool(b) => {
            hasher.update([2u8]);
            hasher.update([*b as u8]);
        }
        Value::Int(i) => {
            hasher.update([3u8]);
            hasher.update(i.to_le_bytes());
        }
        Value::Float(f) => {
            hasher.update([4u8]);
            hasher.update(f.to_bits().to_le_bytes());
        }
        Value::String(s) => {
            hasher.update([5u8]);
            hasher.update((s.len() as u64).to_le_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Seq(items) => {
            hasher.update([6u8]);
            hasher.update((items.len() as u64).to_le_bytes());
            for item in items {
                hash_value(item, hasher);
            }
        }
        Value::Map(entries) => {
            hasher.update([7u8]);
            hasher.update((entries.len() as u64).to_le_bytes());
            for (key, item) in entries {
                hasher.update((key.len() as u64).to_le_bytes());
                hasher.update(key.as_bytes());
                hash_value(item, hasher);
            }
        }
        Value::Ref(r) => {
            hasher.update([8u8]);
            hasher.update(r.node.as_bytes());
            hash_value(&Value::from(r.ident.clone()), hasher);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blake2::Blake2b;

    fn digest(value: &Value) -> Vec<u8> {
        let mut hasher = Blake2b::new();
        hash_value(value, &mut hasher);
        hasher.finalize().to_vec()
    }

    #[test]
    fn stable_hash_is_deterministic() {
        let a = Value::map([("id", Value::Int(1)), ("name", Value::from("iphone"))]);
        let b = Value::map([("name", Value::from("iphone")), ("id", Value::Int(1))]);
        // map entries are sorted, insertion order is irrelevant
        assert_eq!(digest(&a), digest(&b));
    }

    #[test]
    fn stable_hash_distinguishes_values() {
        assert_ne!(digest(&Value::Null), digest(&Value::Nothing));
        assert_ne!(digest(&Value::Int(1)), digest(&Value::Bool(true)));
        assert_ne!(
            digest(&Value::seq([1i64, 2])),
            digest(&Value::seq([2i64, 1]))
        );
        assert_ne!(
            digest(&Value::from("ab")),
            digest(&Value::seq(["a", "b"]))
        );
    }

    #[test]
    fn ident_conversion() {
        assert_eq!(ident_of(&Value::Int(5)).unwrap(), Ident::Int(5));
        assert_eq!(
            ident_of(&Value::from("key")).unwrap(),
            Ident::Str("key".to_owned())
        );
        let err = ident_of(&Value::Float(1.5)).unwrap_err();
        assert!(matches!(err, WeftError::UnhashableIdent(_)));
        assert!(err.to_string().contains("Hint"));
    }
}
