//! Key encoding for rows and index entries.
//!
//! Every tree (global or partition) uses the same layout:
//!
//! - rows: `[b'r'][entity_tag:1][id:8 BE]`
//! - sorted index entries: `[b'x'][index_name][0x00][values...][id:8 BE]`
//! - unique index entries: `[b'u'][index_name][0x00][values...]` -> `id`
//! - inverted path entries: `[b'p'][index_name][0x00][path][value][id:8 BE]`
//! - inverted token entries: `[b't'][index_name][0x00][token][0x00][id:8 BE]`
//! - dependency stamps: `[b's'][entity_tag:1][id:8 BE]` -> opaque version
//!
//! Values use an order-preserving encoding so that byte order matches value
//! order and a prefix of encoded values is a valid scan prefix.

use std::cmp::Ordering;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::catalog::EntityKind;

/// Size of an encoded id.
pub const ID_SIZE: usize = 8;

/// Key family markers.
pub const ROW_FAMILY: u8 = b'r';
pub const INDEX_FAMILY: u8 = b'x';
pub const UNIQUE_FAMILY: u8 = b'u';
pub const PATH_FAMILY: u8 = b'p';
pub const TOKEN_FAMILY: u8 = b't';
pub const STAMP_FAMILY: u8 = b's';

/// A scalar value as it appears in an index key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
}

impl IndexValue {
    /// Encode in sortable form, appending to `buf`.
    ///
    /// - Integers: big-endian with the sign bit flipped
    /// - Floats: IEEE 754 bits adjusted so negative values sort first
    /// - Dates: days from the common era, encoded like integers
    /// - Text: bytes with `0x00` escaped as `0x00 0xFF`, terminated by `0x00 0x01`
    pub fn encode_sortable_into(&self, buf: &mut Vec<u8>) {
        match self {
            IndexValue::Null => buf.push(0x00),
            IndexValue::Bool(b) => {
                buf.push(0x01);
                buf.push(u8::from(*b));
            }
            IndexValue::Int(n) => {
                buf.push(0x02);
                let sortable = (*n as u64) ^ 0x8000_0000_0000_0000;
                buf.extend_from_slice(&sortable.to_be_bytes());
            }
            IndexValue::Float(n) => {
                buf.push(0x03);
                let bits = n.to_bits();
                let sortable = if (bits & 0x8000_0000_0000_0000) != 0 {
                    !bits
                } else {
                    bits ^ 0x8000_0000_0000_0000
                };
                buf.extend_from_slice(&sortable.to_be_bytes());
            }
            IndexValue::Text(s) => {
                buf.push(0x04);
                encode_text_into(s, buf);
            }
            IndexValue::Date(d) => {
                buf.push(0x05);
                let days = d.num_days_from_ce() as u32 ^ 0x8000_0000;
                buf.extend_from_slice(&days.to_be_bytes());
            }
        }
    }

    pub fn encode_sortable(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_sortable_into(&mut buf);
        buf
    }

    /// Human readable rendering for error messages and explain output.
    pub fn display(&self) -> String {
        match self {
            IndexValue::Null => "null".to_string(),
            IndexValue::Bool(b) => b.to_string(),
            IndexValue::Int(n) => n.to_string(),
            IndexValue::Float(n) => n.to_string(),
            IndexValue::Text(s) => format!("'{}'", s),
            IndexValue::Date(d) => d.to_string(),
        }
    }
}

impl PartialOrd for IndexValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.encode_sortable().cmp(&other.encode_sortable()))
    }
}

/// Escape and terminate a string so that it sorts correctly as a key prefix.
pub fn encode_text_into(s: &str, buf: &mut Vec<u8>) {
    for &b in s.as_bytes() {
        if b == 0x00 {
            buf.push(0x00);
            buf.push(0xFF);
        } else {
            buf.push(b);
        }
    }
    buf.push(0x00);
    buf.push(0x01);
}

/// Key of a stored row.
pub fn row_key(kind: EntityKind, id: u64) -> Vec<u8> {
    let mut key = row_prefix(kind);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

/// Prefix covering every row of a kind.
pub fn row_prefix(kind: EntityKind) -> Vec<u8> {
    vec![ROW_FAMILY, kind.tag()]
}

/// Key of the dependency stamp of a row.
///
/// Writers that add or re-point a reference bump the parent's stamp, so a
/// delete planned against an older stamp can detect new dependents.
pub fn stamp_key(kind: EntityKind, id: u64) -> Vec<u8> {
    let mut key = vec![STAMP_FAMILY, kind.tag()];
    key.extend_from_slice(&id.to_be_bytes());
    key
}

/// Prefix covering every entry of one index within a key family.
pub fn index_prefix(family: u8, index_name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(index_name.len() + 2);
    key.push(family);
    key.extend_from_slice(index_name.as_bytes());
    key.push(0x00);
    key
}

/// Prefix for an index family plus leading encoded values.
pub fn values_prefix(family: u8, index_name: &str, values: &[IndexValue]) -> Vec<u8> {
    let mut key = index_prefix(family, index_name);
    for value in values {
        value.encode_sortable_into(&mut key);
    }
    key
}

/// Read the trailing id of an index entry key.
pub fn trailing_id(key: &[u8]) -> Option<u64> {
    if key.len() < ID_SIZE {
        return None;
    }
    decode_id(&key[key.len() - ID_SIZE..])
}

/// Decode an 8-byte big-endian id.
pub fn decode_id(bytes: &[u8]) -> Option<u64> {
    let arr: [u8; ID_SIZE] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(arr))
}

/// Smallest key strictly greater than every key starting with `prefix`.
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xFF {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(v: IndexValue) -> Vec<u8> {
        v.encode_sortable()
    }

    #[test]
    fn test_int_ordering() {
        assert!(enc(IndexValue::Int(-5)) < enc(IndexValue::Int(0)));
        assert!(enc(IndexValue::Int(0)) < enc(IndexValue::Int(7)));
        assert!(enc(IndexValue::Int(7)) < enc(IndexValue::Int(i64::MAX)));
    }

    #[test]
    fn test_float_ordering() {
        assert!(enc(IndexValue::Float(-1.5)) < enc(IndexValue::Float(-0.5)));
        assert!(enc(IndexValue::Float(-0.5)) < enc(IndexValue::Float(0.25)));
        assert!(enc(IndexValue::Float(0.25)) < enc(IndexValue::Float(10.0)));
    }

    #[test]
    fn test_text_ordering_and_prefix_safety() {
        assert!(enc(IndexValue::Text("Ada".into())) < enc(IndexValue::Text("Adam".into())));
        assert!(enc(IndexValue::Text("Adam".into())) < enc(IndexValue::Text("Bea".into())));

        // "ab" followed by another column must not be confused with "abc".
        let mut ab = values_prefix(INDEX_FAMILY, "i", &[IndexValue::Text("ab".into())]);
        ab.extend_from_slice(&IndexValue::Int(1).encode_sortable());
        let abc = values_prefix(INDEX_FAMILY, "i", &[IndexValue::Text("abc".into())]);
        assert!(!ab.starts_with(&abc));
        assert!(!abc.starts_with(&ab));
    }

    #[test]
    fn test_date_ordering() {
        let early = NaiveDate::from_ymd_opt(1999, 12, 31).unwrap();
        let late = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap();
        assert!(enc(IndexValue::Date(early)) < enc(IndexValue::Date(late)));
        assert!(IndexValue::Date(early) < IndexValue::Date(late));
    }

    #[test]
    fn test_row_keys() {
        let key = row_key(EntityKind::Course, 42);
        assert!(key.starts_with(&row_prefix(EntityKind::Course)));
        assert_eq!(trailing_id(&key), Some(42));
        assert!(row_key(EntityKind::Course, 1) < row_key(EntityKind::Course, 2));
    }

    #[test]
    fn test_stamp_keys_are_separate_from_rows() {
        let stamp = stamp_key(EntityKind::Person, 7);
        assert_ne!(stamp, row_key(EntityKind::Person, 7));
        assert_eq!(trailing_id(&stamp), Some(7));
    }

    #[test]
    fn test_index_names_do_not_overlap() {
        let short = index_prefix(INDEX_FAMILY, "course_tenant");
        let long = index_prefix(INDEX_FAMILY, "course_tenant_institution");
        assert!(!long.starts_with(&short));
    }

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(&[1, 2]), Some(vec![1, 3]));
        assert_eq!(prefix_successor(&[1, 0xFF]), Some(vec![2]));
        assert_eq!(prefix_successor(&[0xFF]), None);
    }
}
