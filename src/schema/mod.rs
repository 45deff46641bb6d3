//! Key-part schemas and comparators.
//!
//! Each database has an ordered schema of one or more key parts, each typed
//! `string`, `u32`, `u32_rev`, `u64`, or `u64_rev`. A key is compared
//! part-by-part with the part's comparator; the `_rev` variants reverse
//! order.
//!
//! Rather than threading a part-aware comparator through every layer of the
//! node store, a [`Schema`] encodes a tuple of typed part values into a
//! single byte string whose lexicographic order matches the schema's
//! comparator exactly. The node store below (memtable/branch/merge layers)
//! stays byte-ordered and untouched; only encode/decode at the schema
//! boundary needs to know about part types.

use thiserror::Error;

use crate::encoding::{Decode, Encode, EncodingError};

/// Errors raised while building or interpreting a keyed schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// The schema has no key parts; at least one is required.
    #[error("schema must declare at least one key part")]
    Empty,

    /// A `value`/`key` call supplied a different number of parts than the
    /// schema declares.
    #[error("expected {expected} key parts, got {actual}")]
    PartCountMismatch { expected: usize, actual: usize },

    /// A key-part value's type did not match the schema's declared type
    /// for that position.
    #[error("key part {index} ({name}) expected type {expected:?}, got a value of a different type")]
    TypeMismatch {
        index: usize,
        name: String,
        expected: KeyPartType,
    },

    /// Prefix comparison was requested on a schema whose first part is not
    /// `string`.
    #[error("prefix comparison requires the first key part to be of type string")]
    PrefixRequiresStringFirstPart,

    /// Wire-format decode failure of an encoded key.
    #[error("failed to decode key: {0}")]
    Encoding(#[from] EncodingError),
}

/// The type of a single key part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyPartType {
    /// Raw bytes, compared lexicographically.
    String,
    /// Unsigned 32-bit integer, ascending order.
    U32,
    /// Unsigned 32-bit integer, descending order.
    U32Rev,
    /// Unsigned 64-bit integer, ascending order.
    U64,
    /// Unsigned 64-bit integer, descending order.
    U64Rev,
}

impl Encode for KeyPartType {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let tag: u32 = match self {
            KeyPartType::String => 0,
            KeyPartType::U32 => 1,
            KeyPartType::U32Rev => 2,
            KeyPartType::U64 => 3,
            KeyPartType::U64Rev => 4,
        };
        tag.encode_to(buf)
    }
}

impl Decode for KeyPartType {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, consumed) = u32::decode_from(buf)?;
        let ty = match tag {
            0 => KeyPartType::String,
            1 => KeyPartType::U32,
            2 => KeyPartType::U32Rev,
            3 => KeyPartType::U64,
            4 => KeyPartType::U64Rev,
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: other,
                    type_name: "KeyPartType",
                });
            }
        };
        Ok((ty, consumed))
    }
}

/// One value for one key part, supplied by the caller when constructing a
/// key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPartValue {
    String(Vec<u8>),
    U32(u32),
    U64(u64),
}

impl KeyPartValue {
    fn matches(&self, ty: KeyPartType) -> bool {
        matches!(
            (self, ty),
            (KeyPartValue::String(_), KeyPartType::String)
                | (KeyPartValue::U32(_), KeyPartType::U32 | KeyPartType::U32Rev)
                | (KeyPartValue::U64(_), KeyPartType::U64 | KeyPartType::U64Rev)
        )
    }
}

/// A named, typed key part within a [`Schema`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPart {
    pub name: String,
    pub ty: KeyPartType,
}

impl KeyPart {
    pub fn new(name: impl Into<String>, ty: KeyPartType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// The ordered schema of key parts for one database.
///
/// Construction builds a composite, order-preserving byte key from a
/// scatter list of typed part values; the comparator for a multi-part key
/// compares part by part until a non-zero result, which is exactly the
/// ordering the byte encoding below reproduces lexicographically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    parts: Vec<KeyPart>,
}

impl Schema {
    /// Builds a schema from an ordered list of key parts. At least one part
    /// is required.
    pub fn new(parts: Vec<KeyPart>) -> Result<Self, SchemaError> {
        if parts.is_empty() {
            return Err(SchemaError::Empty);
        }
        Ok(Self { parts })
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    /// Encodes a scatter list of key-part values into the single byte
    /// string the node store indexes by.
    ///
    /// String parts are length-prefixed so that a shorter string part can
    /// never be misread as a prefix of a following part; integer parts are
    /// encoded big-endian (optionally bit-complemented for `_rev` types) so
    /// that byte-lexicographic order matches numeric order.
    pub fn encode_key(&self, values: &[KeyPartValue]) -> Result<Vec<u8>, SchemaError> {
        if values.len() != self.parts.len() {
            return Err(SchemaError::PartCountMismatch {
                expected: self.parts.len(),
                actual: values.len(),
            });
        }

        let mut out = Vec::new();
        for (index, (part, value)) in self.parts.iter().zip(values.iter()).enumerate() {
            if !value.matches(part.ty) {
                return Err(SchemaError::TypeMismatch {
                    index,
                    name: part.name.clone(),
                    expected: part.ty,
                });
            }
            encode_part(part.ty, value, &mut out);
        }
        Ok(out)
    }

    /// Returns `true` if `prefix` (the caller's encoded first-part prefix
    /// bytes) is a prefix of `first_part_bytes` (the first part's encoded
    /// bytes taken from a full key). Only defined when the first part is
    /// `string`, matching the source semantics.
    pub fn is_prefix_of(
        &self,
        prefix: &[u8],
        first_part_bytes: &[u8],
    ) -> Result<bool, SchemaError> {
        match self.parts.first() {
            Some(part) if part.ty == KeyPartType::String => {
                Ok(first_part_bytes.starts_with(prefix))
            }
            _ => Err(SchemaError::PrefixRequiresStringFirstPart),
        }
    }
}

fn encode_part(ty: KeyPartType, value: &KeyPartValue, out: &mut Vec<u8>) {
    match (ty, value) {
        (KeyPartType::String, KeyPartValue::String(bytes)) => {
            // Length-prefixed so adjacent string parts never alias.
            let len = bytes.len() as u32;
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(bytes);
        }
        (KeyPartType::U32, KeyPartValue::U32(v)) => {
            out.extend_from_slice(&v.to_be_bytes());
        }
        (KeyPartType::U32Rev, KeyPartValue::U32(v)) => {
            out.extend_from_slice(&(!v).to_be_bytes());
        }
        (KeyPartType::U64, KeyPartValue::U64(v)) => {
            out.extend_from_slice(&v.to_be_bytes());
        }
        (KeyPartType::U64Rev, KeyPartValue::U64(v)) => {
            out.extend_from_slice(&(!v).to_be_bytes());
        }
        _ => unreachable!("type checked by Schema::encode_key before calling encode_part"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_schema() -> Schema {
        Schema::new(vec![KeyPart::new("k", KeyPartType::String)]).unwrap()
    }

    #[test]
    fn string_keys_sort_lexicographically() {
        let schema = string_schema();
        let a = schema
            .encode_key(&[KeyPartValue::String(b"a".to_vec())])
            .unwrap();
        let b = schema
            .encode_key(&[KeyPartValue::String(b"b".to_vec())])
            .unwrap();
        assert!(a < b);
    }

    #[test]
    fn u32_rev_reverses_numeric_order() {
        let schema = Schema::new(vec![KeyPart::new("n", KeyPartType::U32Rev)]).unwrap();
        let small = schema.encode_key(&[KeyPartValue::U32(1)]).unwrap();
        let large = schema.encode_key(&[KeyPartValue::U32(2)]).unwrap();
        assert!(large < small, "u32_rev must sort 2 before 1");
    }

    #[test]
    fn multi_part_compares_part_by_part() {
        let schema = Schema::new(vec![
            KeyPart::new("a", KeyPartType::String),
            KeyPart::new("b", KeyPartType::U64),
        ])
        .unwrap();
        let k1 = schema
            .encode_key(&[KeyPartValue::String(b"x".to_vec()), KeyPartValue::U64(5)])
            .unwrap();
        let k2 = schema
            .encode_key(&[KeyPartValue::String(b"x".to_vec()), KeyPartValue::U64(9)])
            .unwrap();
        let k3 = schema
            .encode_key(&[KeyPartValue::String(b"y".to_vec()), KeyPartValue::U64(0)])
            .unwrap();
        assert!(k1 < k2);
        assert!(k2 < k3);
    }

    #[test]
    fn prefix_compare_requires_string_first_part() {
        let int_schema = Schema::new(vec![KeyPart::new("n", KeyPartType::U32)]).unwrap();
        assert!(matches!(
            int_schema.is_prefix_of(b"x", b"xyz"),
            Err(SchemaError::PrefixRequiresStringFirstPart)
        ));

        let schema = string_schema();
        assert!(schema.is_prefix_of(b"ab", b"abcdef").unwrap());
        assert!(!schema.is_prefix_of(b"zz", b"abcdef").unwrap());
    }

    #[test]
    fn wrong_part_count_is_rejected() {
        let schema = string_schema();
        let err = schema.encode_key(&[]).unwrap_err();
        assert!(matches!(err, SchemaError::PartCountMismatch { .. }));
    }
}
