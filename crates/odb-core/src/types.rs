//! Value types stored in the database
//!
//! Type ids are the classic online-database numbering (1..=18). A key of type
//! `Key` is a directory, a key of type `Link` holds a path string. All other
//! ids are leaf payloads: fixed-size numeric items or fixed-width strings.

use std::fmt;

use crate::error::{OdbError, OdbResult};

/// Type id of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TypeId {
    Uint8 = 1,
    Int8 = 2,
    Char = 3,
    Uint16 = 4,
    Int16 = 5,
    Uint32 = 6,
    Int32 = 7,
    Bool = 8,
    Float = 9,
    Double = 10,
    Bitfield = 11,
    String = 12,
    Array = 13,
    Struct = 14,
    Key = 15,
    Link = 16,
    Int64 = 17,
    Uint64 = 18,
}

/// One past the highest valid type id.
pub const TID_LAST: u32 = 19;

const ALL_TYPES: [TypeId; 18] = [
    TypeId::Uint8,
    TypeId::Int8,
    TypeId::Char,
    TypeId::Uint16,
    TypeId::Int16,
    TypeId::Uint32,
    TypeId::Int32,
    TypeId::Bool,
    TypeId::Float,
    TypeId::Double,
    TypeId::Bitfield,
    TypeId::String,
    TypeId::Array,
    TypeId::Struct,
    TypeId::Key,
    TypeId::Link,
    TypeId::Int64,
    TypeId::Uint64,
];

impl TypeId {
    /// Decode a raw type id; `None` when outside `1..TID_LAST`.
    pub fn from_u32(raw: u32) -> Option<Self> {
        if raw == 0 || raw >= TID_LAST {
            return None;
        }
        Some(ALL_TYPES[raw as usize - 1])
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Fixed item size in bytes; 0 for variable-width types.
    pub fn item_size(self) -> u32 {
        match self {
            TypeId::Uint8 | TypeId::Int8 | TypeId::Char => 1,
            TypeId::Uint16 | TypeId::Int16 => 2,
            TypeId::Uint32 | TypeId::Int32 | TypeId::Bool | TypeId::Float | TypeId::Bitfield => 4,
            TypeId::Double | TypeId::Int64 | TypeId::Uint64 => 8,
            TypeId::String | TypeId::Array | TypeId::Struct | TypeId::Key | TypeId::Link => 0,
        }
    }

    /// Alignment of one item when marshalled into a record block.
    pub fn alignment(self) -> usize {
        match self.item_size() {
            0 => 1,
            n => n as usize,
        }
    }

    /// Canonical name used by the text codecs.
    pub fn name(self) -> &'static str {
        match self {
            TypeId::Uint8 => "BYTE",
            TypeId::Int8 => "SBYTE",
            TypeId::Char => "CHAR",
            TypeId::Uint16 => "WORD",
            TypeId::Int16 => "SHORT",
            TypeId::Uint32 => "DWORD",
            TypeId::Int32 => "INT",
            TypeId::Bool => "BOOL",
            TypeId::Float => "FLOAT",
            TypeId::Double => "DOUBLE",
            TypeId::Bitfield => "BITFIELD",
            TypeId::String => "STRING",
            TypeId::Array => "ARRAY",
            TypeId::Struct => "STRUCT",
            TypeId::Key => "KEY",
            TypeId::Link => "LINK",
            TypeId::Int64 => "INT64",
            TypeId::Uint64 => "UINT64",
        }
    }

    /// Parse a type name; both the classic and the sized spellings are accepted.
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.trim().to_ascii_uppercase();
        let tid = match upper.as_str() {
            "BYTE" | "UINT8" => TypeId::Uint8,
            "SBYTE" | "INT8" => TypeId::Int8,
            "CHAR" => TypeId::Char,
            "WORD" | "UINT16" => TypeId::Uint16,
            "SHORT" | "INT16" => TypeId::Int16,
            "DWORD" | "UINT32" => TypeId::Uint32,
            "INT" | "INT32" => TypeId::Int32,
            "BOOL" => TypeId::Bool,
            "FLOAT" | "FLOAT32" => TypeId::Float,
            "DOUBLE" | "FLOAT64" => TypeId::Double,
            "BITFIELD" => TypeId::Bitfield,
            "STRING" => TypeId::String,
            "ARRAY" => TypeId::Array,
            "STRUCT" => TypeId::Struct,
            "KEY" | "DIR" => TypeId::Key,
            "LINK" => TypeId::Link,
            "INT64" => TypeId::Int64,
            "UINT64" | "QWORD" => TypeId::Uint64,
            _ => return None,
        };
        Some(tid)
    }

    pub fn is_dir(self) -> bool {
        self == TypeId::Key
    }

    /// Types whose payload is text (fixed-width, NUL padded).
    pub fn is_text(self) -> bool {
        matches!(self, TypeId::String | TypeId::Link)
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Access mode bits of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AccessMode(pub u16);

impl AccessMode {
    pub const READ: AccessMode = AccessMode(0x01);
    pub const WRITE: AccessMode = AccessMode(0x02);
    pub const DELETE: AccessMode = AccessMode(0x04);
    pub const EXCLUSIVE: AccessMode = AccessMode(0x08);
    pub const ALLOC: AccessMode = AccessMode(0x40);
    /// Marks an open record that only watches (no struct mapping).
    pub const WATCH: AccessMode = AccessMode(0x80);

    /// Mode given to freshly created keys.
    pub const DEFAULT: AccessMode = AccessMode(0x01 | 0x02 | 0x04);
    /// Every bit a key may legally carry.
    pub const KEY_MASK: u16 = 0x01 | 0x02 | 0x04 | 0x08 | 0x40;

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, other: AccessMode) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: AccessMode) -> AccessMode {
        AccessMode(self.0 | other.0)
    }

    pub fn without(self, other: AccessMode) -> AccessMode {
        AccessMode(self.0 & !other.0)
    }

    pub fn is_valid_key_mode(self) -> bool {
        self.0 & !Self::KEY_MASK == 0
    }
}

impl std::ops::BitOr for AccessMode {
    type Output = AccessMode;
    fn bitor(self, rhs: AccessMode) -> AccessMode {
        self.union(rhs)
    }
}

/// A single dynamically typed item.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Uint8(u8),
    Int8(i8),
    Char(u8),
    Uint16(u16),
    Int16(i16),
    Uint32(u32),
    Int32(i32),
    Bool(bool),
    Float(f32),
    Double(f64),
    Bitfield(u32),
    Str(String),
    Int64(i64),
    Uint64(u64),
}

impl Value {
    pub fn type_id(&self) -> TypeId {
        match self {
            Value::Uint8(_) => TypeId::Uint8,
            Value::Int8(_) => TypeId::Int8,
            Value::Char(_) => TypeId::Char,
            Value::Uint16(_) => TypeId::Uint16,
            Value::Int16(_) => TypeId::Int16,
            Value::Uint32(_) => TypeId::Uint32,
            Value::Int32(_) => TypeId::Int32,
            Value::Bool(_) => TypeId::Bool,
            Value::Float(_) => TypeId::Float,
            Value::Double(_) => TypeId::Double,
            Value::Bitfield(_) => TypeId::Bitfield,
            Value::Str(_) => TypeId::String,
            Value::Int64(_) => TypeId::Int64,
            Value::Uint64(_) => TypeId::Uint64,
        }
    }

    /// Decode one item of type `tid` from its little-endian payload bytes.
    pub fn from_bytes(tid: TypeId, bytes: &[u8]) -> OdbResult<Value> {
        let need = tid.item_size() as usize;
        if need > 0 && bytes.len() < need {
            return Err(OdbError::OutOfRange {
                what: "item bytes".into(),
                value: bytes.len() as u64,
                limit: need as u64,
            });
        }
        let value = match tid {
            TypeId::Uint8 => Value::Uint8(bytes[0]),
            TypeId::Int8 => Value::Int8(bytes[0] as i8),
            TypeId::Char => Value::Char(bytes[0]),
            TypeId::Uint16 => Value::Uint16(u16::from_le_bytes([bytes[0], bytes[1]])),
            TypeId::Int16 => Value::Int16(i16::from_le_bytes([bytes[0], bytes[1]])),
            TypeId::Uint32 => Value::Uint32(u32::from_le_bytes(read_4(bytes))),
            TypeId::Int32 => Value::Int32(i32::from_le_bytes(read_4(bytes))),
            TypeId::Bool => Value::Bool(u32::from_le_bytes(read_4(bytes)) != 0),
            TypeId::Float => Value::Float(f32::from_le_bytes(read_4(bytes))),
            TypeId::Double => Value::Double(f64::from_le_bytes(read_8(bytes))),
            TypeId::Bitfield => Value::Bitfield(u32::from_le_bytes(read_4(bytes))),
            TypeId::Int64 => Value::Int64(i64::from_le_bytes(read_8(bytes))),
            TypeId::Uint64 => Value::Uint64(u64::from_le_bytes(read_8(bytes))),
            TypeId::String | TypeId::Link => Value::Str(decode_text(bytes)),
            TypeId::Array | TypeId::Struct | TypeId::Key => {
                return Err(OdbError::TypeMismatch {
                    path: String::new(),
                    expected: "leaf value".into(),
                    found: tid.name().into(),
                })
            }
        };
        Ok(value)
    }

    /// Encode into exactly `item_size` bytes (strings are NUL padded/truncated).
    pub fn write_bytes(&self, item_size: usize, out: &mut Vec<u8>) {
        match self {
            Value::Uint8(v) | Value::Char(v) => out.push(*v),
            Value::Int8(v) => out.push(*v as u8),
            Value::Uint16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Int16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Uint32(v) | Value::Bitfield(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Bool(v) => out.extend_from_slice(&(*v as u32).to_le_bytes()),
            Value::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Int64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Uint64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Str(s) => encode_text(s, item_size, out),
        }
    }

    /// Parse the textual form used by the codecs.
    pub fn parse(tid: TypeId, text: &str) -> OdbResult<Value> {
        let t = text.trim();
        let bad = || OdbError::InvalidName {
            name: text.to_string(),
            reason: format!("not a valid {} value", tid.name()),
        };
        let value = match tid {
            TypeId::Uint8 => Value::Uint8(parse_int(t).and_then(|v| u8::try_from(v).ok()).ok_or_else(bad)?),
            TypeId::Int8 => Value::Int8(parse_int(t).and_then(|v| i8::try_from(v).ok()).ok_or_else(bad)?),
            TypeId::Char => Value::Char(t.bytes().next().unwrap_or(0)),
            TypeId::Uint16 => Value::Uint16(parse_int(t).and_then(|v| u16::try_from(v).ok()).ok_or_else(bad)?),
            TypeId::Int16 => Value::Int16(parse_int(t).and_then(|v| i16::try_from(v).ok()).ok_or_else(bad)?),
            TypeId::Uint32 => Value::Uint32(parse_int(t).and_then(|v| u32::try_from(v).ok()).ok_or_else(bad)?),
            TypeId::Int32 => Value::Int32(parse_int(t).and_then(|v| i32::try_from(v).ok()).ok_or_else(bad)?),
            TypeId::Bitfield => Value::Bitfield(parse_int(t).and_then(|v| u32::try_from(v).ok()).ok_or_else(bad)?),
            TypeId::Int64 => Value::Int64(parse_int(t).and_then(|v| i64::try_from(v).ok()).ok_or_else(bad)?),
            TypeId::Uint64 => Value::Uint64(parse_int(t).and_then(|v| u64::try_from(v).ok()).ok_or_else(bad)?),
            TypeId::Bool => match t.to_ascii_lowercase().as_str() {
                "y" | "yes" | "true" | "1" => Value::Bool(true),
                "n" | "no" | "false" | "0" => Value::Bool(false),
                _ => return Err(bad()),
            },
            TypeId::Float => Value::Float(t.parse().map_err(|_| bad())?),
            TypeId::Double => Value::Double(t.parse().map_err(|_| bad())?),
            TypeId::String | TypeId::Link => Value::Str(text.to_string()),
            TypeId::Array | TypeId::Struct | TypeId::Key => return Err(bad()),
        };
        Ok(value)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Uint8(v) => write!(f, "{}", v),
            Value::Int8(v) => write!(f, "{}", v),
            Value::Char(v) => write!(f, "{}", *v as char),
            Value::Uint16(v) => write!(f, "{}", v),
            Value::Int16(v) => write!(f, "{}", v),
            Value::Uint32(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Bool(v) => f.write_str(if *v { "y" } else { "n" }),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Bitfield(v) => write!(f, "0x{:08x}", v),
            Value::Str(s) => f.write_str(s),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Uint64(v) => write!(f, "{}", v),
        }
    }
}

fn parse_int(text: &str) -> Option<i128> {
    let (neg, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let magnitude = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        i128::from_str_radix(hex, 16).ok()?
    } else {
        digits.parse::<i128>().ok()?
    };
    Some(if neg { -magnitude } else { magnitude })
}

fn read_4(b: &[u8]) -> [u8; 4] {
    [b[0], b[1], b[2], b[3]]
}

fn read_8(b: &[u8]) -> [u8; 8] {
    [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]
}

/// Text payloads are NUL terminated inside a fixed-width slot.
pub fn decode_text(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Write `text` into a slot of `width` bytes, always leaving a terminating NUL.
/// Truncation never splits a character.
pub fn encode_text(text: &str, width: usize, out: &mut Vec<u8>) {
    if width == 0 {
        return;
    }
    let mut n = text.len().min(width - 1);
    while !text.is_char_boundary(n) {
        n -= 1;
    }
    out.extend_from_slice(&text.as_bytes()[..n]);
    out.resize(out.len() + (width - n), 0);
}

/// Rust types that map onto a stored type id.
///
/// Implemented for the numeric primitives, `bool` and `String`. Typed
/// get/set calls check `TID` against the stored type before touching bytes.
pub trait OdbType: Sized {
    const TID: TypeId;

    /// Width of one stored item for this value.
    fn item_size(&self) -> usize {
        Self::TID.item_size() as usize
    }

    fn to_value(&self) -> Value;

    fn from_value(value: Value) -> Option<Self>;
}

macro_rules! odb_type {
    ($t:ty, $tid:expr, $variant:ident) => {
        impl OdbType for $t {
            const TID: TypeId = $tid;

            fn to_value(&self) -> Value {
                Value::$variant(*self)
            }

            fn from_value(value: Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

odb_type!(u8, TypeId::Uint8, Uint8);
odb_type!(i8, TypeId::Int8, Int8);
odb_type!(u16, TypeId::Uint16, Uint16);
odb_type!(i16, TypeId::Int16, Int16);
odb_type!(u32, TypeId::Uint32, Uint32);
odb_type!(i32, TypeId::Int32, Int32);
odb_type!(bool, TypeId::Bool, Bool);
odb_type!(f32, TypeId::Float, Float);
odb_type!(f64, TypeId::Double, Double);
odb_type!(i64, TypeId::Int64, Int64);
odb_type!(u64, TypeId::Uint64, Uint64);

impl OdbType for String {
    const TID: TypeId = TypeId::String;

    fn item_size(&self) -> usize {
        self.len() + 1
    }

    fn to_value(&self) -> Value {
        Value::Str(self.clone())
    }

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_id_range() {
        assert_eq!(TypeId::from_u32(0), None);
        assert_eq!(TypeId::from_u32(TID_LAST), None);
        assert_eq!(TypeId::from_u32(4), Some(TypeId::Uint16));
        assert_eq!(TypeId::from_u32(15), Some(TypeId::Key));
        for raw in 1..TID_LAST {
            assert_eq!(TypeId::from_u32(raw).unwrap().as_u32(), raw);
        }
    }

    #[test]
    fn test_type_names_and_aliases() {
        assert_eq!(TypeId::Uint16.name(), "WORD");
        assert_eq!(TypeId::from_name("UINT16"), Some(TypeId::Uint16));
        assert_eq!(TypeId::from_name("word"), Some(TypeId::Uint16));
        assert_eq!(TypeId::from_name("INT32"), Some(TypeId::Int32));
        assert_eq!(TypeId::from_name("nonsense"), None);
    }

    #[test]
    fn test_value_bytes() {
        let mut buf = Vec::new();
        Value::Uint16(7).write_bytes(2, &mut buf);
        assert_eq!(buf, vec![7, 0]);
        assert_eq!(Value::from_bytes(TypeId::Uint16, &buf).unwrap(), Value::Uint16(7));

        let mut buf = Vec::new();
        Value::Bool(true).write_bytes(4, &mut buf);
        assert_eq!(buf, vec![1, 0, 0, 0]);
    }

    #[test]
    fn test_text_is_truncated_with_terminator() {
        let mut buf = Vec::new();
        encode_text("abcdef", 4, &mut buf);
        assert_eq!(buf, b"abc\0");
        assert_eq!(decode_text(&buf), "abc");

        let mut buf = Vec::new();
        encode_text("ab", 6, &mut buf);
        assert_eq!(buf.len(), 6);
        assert_eq!(decode_text(&buf), "ab");

        let mut buf = Vec::new();
        encode_text("aé", 3, &mut buf);
        assert_eq!(buf, b"a\0\0");
        assert_eq!(decode_text(&buf), "a");
    }

    #[test]
    fn test_value_parse() {
        assert_eq!(Value::parse(TypeId::Uint16, "7").unwrap(), Value::Uint16(7));
        assert_eq!(Value::parse(TypeId::Int32, "-12").unwrap(), Value::Int32(-12));
        assert_eq!(Value::parse(TypeId::Uint32, "0x10").unwrap(), Value::Uint32(16));
        assert_eq!(Value::parse(TypeId::Bool, "y").unwrap(), Value::Bool(true));
        assert!(Value::parse(TypeId::Uint8, "300").is_err());
        assert!(Value::parse(TypeId::Float, "abc").is_err());
    }

    #[test]
    fn test_access_mode_bits() {
        let mode = AccessMode::READ | AccessMode::WRITE;
        assert!(mode.contains(AccessMode::READ));
        assert!(!mode.contains(AccessMode::DELETE));
        assert!(mode.is_valid_key_mode());
        assert!(!AccessMode(0x100).is_valid_key_mode());
        assert_eq!(mode.without(AccessMode::WRITE), AccessMode::READ);
    }
}
