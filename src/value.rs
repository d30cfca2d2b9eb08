//! The closed set of scalar values the standard protocol can carry, and the
//! wire tag that identifies each one.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md>-style
//! framing, but little-endian and tag-per-record rather than one fixed
//! struct per message.
use std::fmt;
use std::io;

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// A point on the system clock, nanosecond resolution, non-negative.
///
/// The wire has no separate "empty" tag for timestamps (unlike the `Opt*`
/// family): by convention an all-zero encoding means absent, matching
/// `Timestamp::EMPTY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The sentinel representing "no timestamp" (nanosecond 0, the Unix epoch).
    pub const EMPTY: Timestamp = Timestamp(0);

    /// Build a timestamp from a nanosecond count since the Unix epoch.
    pub fn from_nanos(nanos: u64) -> Self {
        Timestamp(nanos)
    }

    /// Nanoseconds since the Unix epoch.
    pub fn nanos(&self) -> u64 {
        self.0
    }

    /// True for the all-zero sentinel.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            write!(f, "<empty>")
        } else {
            write!(f, "{}ns", self.0)
        }
    }
}

/// A signed duration in nanoseconds.
///
/// As with `Timestamp`, the wire has no separate empty tag; zero is the
/// "empty" sentinel used at the parameter-constraint layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration(i64);

impl Duration {
    /// The sentinel representing "no duration".
    pub const EMPTY: Duration = Duration(0);

    /// Build a duration from a signed nanosecond count.
    pub fn from_nanos(nanos: i64) -> Self {
        Duration(nanos)
    }

    /// Signed nanoseconds.
    pub fn nanos(&self) -> i64 {
        self.0
    }

    /// True for the zero sentinel.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

/// Unit used to render a `Duration` in parameter metadata (spec `durationType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl DurationUnit {
    /// The name used in the metadata JSON `durationType` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            DurationUnit::Nanoseconds => "Nanoseconds",
            DurationUnit::Microseconds => "Microseconds",
            DurationUnit::Milliseconds => "Milliseconds",
            DurationUnit::Seconds => "Seconds",
            DurationUnit::Minutes => "Minutes",
            DurationUnit::Hours => "Hours",
            DurationUnit::Days => "Days",
        }
    }
}

/// The one-byte wire tag identifying a record's kind, always followed in a
/// frame body by an 8-byte key and then the value bytes for that kind.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum TypeTag {
    I8 = 1,
    I16 = 2,
    I32 = 3,
    I64 = 4,
    U8 = 5,
    U16 = 6,
    U32 = 7,
    U64 = 8,
    F32 = 9,
    F64 = 10,
    Bool = 11,
    OptI8 = 12,
    OptI16 = 13,
    OptI32 = 14,
    OptI64 = 15,
    OptU8 = 16,
    OptU16 = 17,
    OptU32 = 18,
    OptU64 = 19,
    OptI8Empty = 20,
    OptI16Empty = 21,
    OptI32Empty = 22,
    OptI64Empty = 23,
    OptU8Empty = 24,
    OptU16Empty = 25,
    OptU32Empty = 26,
    OptU64Empty = 27,
    OptF32 = 28,
    OptF64 = 29,
    OptF32Empty = 30,
    OptF64Empty = 31,
    Str = 32,
    StrEmpty = 33,
    Timestamp = 34,
    Duration = 35,
    TableBlob = 36,
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A transportable scalar (or table blob) value in the standard protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Str(String),
    Timestamp(Timestamp),
    Duration(Duration),
    OptI8(Option<i8>),
    OptI16(Option<i16>),
    OptI32(Option<i32>),
    OptI64(Option<i64>),
    OptU8(Option<u8>),
    OptU16(Option<u16>),
    OptU32(Option<u32>),
    OptU64(Option<u64>),
    OptF32(Option<f32>),
    OptF64(Option<f64>),
    TableBlob(crate::table::TableBlob),
}

/// Errors that can occur while decoding a value from a byte buffer.
#[derive(Debug)]
pub enum DecodeError {
    /// A read would have consumed bytes past the end of the buffer.
    TruncatedRecord,
    /// The tag byte did not correspond to a known `TypeTag`.
    UnknownTag(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecodeError::TruncatedRecord => write!(f, "truncated record"),
            DecodeError::UnknownTag(tag) => write!(f, "unknown type tag {tag}"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<io::Error> for DecodeError {
    fn from(_: io::Error) -> Self {
        // every io::Error reading from an in-memory slice is an unexpected EOF
        DecodeError::TruncatedRecord
    }
}

/// Compare two `f32` with the epsilon the parameter registry uses for
/// constraint checks. `NaN` is always unequal to anything, including itself.
pub fn f32_eq(a: f32, b: f32) -> bool {
    if a.is_nan() || b.is_nan() {
        return false;
    }
    (a - b).abs() < 1e-6
}

/// Compare two `f64` with the epsilon the parameter registry uses for
/// constraint checks. `NaN` is always unequal to anything, including itself.
pub fn f64_eq(a: f64, b: f64) -> bool {
    if a.is_nan() || b.is_nan() {
        return false;
    }
    (a - b).abs() < 1e-10
}

impl Value {
    /// The wire tag this value serializes as.
    pub fn tag(&self) -> TypeTag {
        match self {
            Value::I8(_) => TypeTag::I8,
            Value::I16(_) => TypeTag::I16,
            Value::I32(_) => TypeTag::I32,
            Value::I64(_) => TypeTag::I64,
            Value::U8(_) => TypeTag::U8,
            Value::U16(_) => TypeTag::U16,
            Value::U32(_) => TypeTag::U32,
            Value::U64(_) => TypeTag::U64,
            Value::F32(_) => TypeTag::F32,
            Value::F64(_) => TypeTag::F64,
            Value::Bool(_) => TypeTag::Bool,
            Value::Str(s) => {
                if s.is_empty() {
                    TypeTag::StrEmpty
                } else {
                    TypeTag::Str
                }
            }
            Value::Timestamp(_) => TypeTag::Timestamp,
            Value::Duration(_) => TypeTag::Duration,
            Value::OptI8(v) => opt_tag(v, TypeTag::OptI8, TypeTag::OptI8Empty),
            Value::OptI16(v) => opt_tag(v, TypeTag::OptI16, TypeTag::OptI16Empty),
            Value::OptI32(v) => opt_tag(v, TypeTag::OptI32, TypeTag::OptI32Empty),
            Value::OptI64(v) => opt_tag(v, TypeTag::OptI64, TypeTag::OptI64Empty),
            Value::OptU8(v) => opt_tag(v, TypeTag::OptU8, TypeTag::OptU8Empty),
            Value::OptU16(v) => opt_tag(v, TypeTag::OptU16, TypeTag::OptU16Empty),
            Value::OptU32(v) => opt_tag(v, TypeTag::OptU32, TypeTag::OptU32Empty),
            Value::OptU64(v) => opt_tag(v, TypeTag::OptU64, TypeTag::OptU64Empty),
            Value::OptF32(v) => opt_tag(v, TypeTag::OptF32, TypeTag::OptF32Empty),
            Value::OptF64(v) => opt_tag(v, TypeTag::OptF64, TypeTag::OptF64Empty),
            Value::TableBlob(_) => TypeTag::TableBlob,
        }
    }

    /// Length in bytes of the value portion of a frame record (excludes the
    /// 1-byte tag and 8-byte key that precede it in a frame body).
    pub fn frame_encoded_len(&self) -> usize {
        match self {
            Value::I8(_) | Value::U8(_) | Value::Bool(_) => 1,
            Value::I16(_) | Value::U16(_) => 2,
            Value::I32(_) | Value::U32(_) | Value::F32(_) => 4,
            Value::I64(_) | Value::U64(_) | Value::F64(_) => 8,
            Value::Timestamp(_) | Value::Duration(_) => 8,
            Value::Str(s) => {
                if s.is_empty() {
                    0
                } else {
                    8 + s.len()
                }
            }
            Value::OptI8(v) => opt_len(v, 1),
            Value::OptI16(v) => opt_len(v, 2),
            Value::OptI32(v) => opt_len(v, 4),
            Value::OptI64(v) => opt_len(v, 8),
            Value::OptU8(v) => opt_len(v, 1),
            Value::OptU16(v) => opt_len(v, 2),
            Value::OptU32(v) => opt_len(v, 4),
            Value::OptU64(v) => opt_len(v, 8),
            Value::OptF32(v) => opt_len(v, 4),
            Value::OptF64(v) => opt_len(v, 8),
            // self-delimiting: a table blob's own leading `total_length`
            // already counts every byte of it, so no extra frame-level
            // length prefix is written around it.
            Value::TableBlob(blob) => blob.len(),
        }
    }

    /// Write just the value bytes (no tag, no key) for a frame record.
    pub fn write_frame_value(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        match self {
            Value::I8(v) => buf.write_i8(*v),
            Value::I16(v) => buf.write_i16::<LE>(*v),
            Value::I32(v) => buf.write_i32::<LE>(*v),
            Value::I64(v) => buf.write_i64::<LE>(*v),
            Value::U8(v) => buf.write_u8(*v),
            Value::U16(v) => buf.write_u16::<LE>(*v),
            Value::U32(v) => buf.write_u32::<LE>(*v),
            Value::U64(v) => buf.write_u64::<LE>(*v),
            Value::F32(v) => buf.write_f32::<LE>(*v),
            Value::F64(v) => buf.write_f64::<LE>(*v),
            Value::Bool(v) => buf.write_u8(*v as u8),
            Value::Timestamp(t) => buf.write_u64::<LE>(t.nanos()),
            Value::Duration(d) => buf.write_i64::<LE>(d.nanos()),
            Value::Str(s) => {
                if s.is_empty() {
                    Ok(())
                } else {
                    buf.write_u64::<LE>(s.len() as u64)?;
                    buf.extend_from_slice(s.as_bytes());
                    Ok(())
                }
            }
            Value::OptI8(v) => write_opt(buf, v, |b, x| b.write_i8(x)),
            Value::OptI16(v) => write_opt(buf, v, |b, x| b.write_i16::<LE>(x)),
            Value::OptI32(v) => write_opt(buf, v, |b, x| b.write_i32::<LE>(x)),
            Value::OptI64(v) => write_opt(buf, v, |b, x| b.write_i64::<LE>(x)),
            Value::OptU8(v) => write_opt(buf, v, |b, x| b.write_u8(x)),
            Value::OptU16(v) => write_opt(buf, v, |b, x| b.write_u16::<LE>(x)),
            Value::OptU32(v) => write_opt(buf, v, |b, x| b.write_u32::<LE>(x)),
            Value::OptU64(v) => write_opt(buf, v, |b, x| b.write_u64::<LE>(x)),
            Value::OptF32(v) => write_opt(buf, v, |b, x| b.write_f32::<LE>(x)),
            Value::OptF64(v) => write_opt(buf, v, |b, x| b.write_f64::<LE>(x)),
            Value::TableBlob(blob) => {
                buf.extend_from_slice(blob.as_bytes());
                Ok(())
            }
        }
    }

    /// Read a value given its already-parsed tag. `cursor` is advanced past
    /// the bytes consumed.
    pub fn read_frame_value(
        tag: TypeTag,
        cursor: &mut io::Cursor<&[u8]>,
    ) -> Result<Value, DecodeError> {
        Ok(match tag {
            TypeTag::I8 => Value::I8(cursor.read_i8()?),
            TypeTag::I16 => Value::I16(cursor.read_i16::<LE>()?),
            TypeTag::I32 => Value::I32(cursor.read_i32::<LE>()?),
            TypeTag::I64 => Value::I64(cursor.read_i64::<LE>()?),
            TypeTag::U8 => Value::U8(cursor.read_u8()?),
            TypeTag::U16 => Value::U16(cursor.read_u16::<LE>()?),
            TypeTag::U32 => Value::U32(cursor.read_u32::<LE>()?),
            TypeTag::U64 => Value::U64(cursor.read_u64::<LE>()?),
            TypeTag::F32 => Value::F32(cursor.read_f32::<LE>()?),
            TypeTag::F64 => Value::F64(cursor.read_f64::<LE>()?),
            TypeTag::Bool => Value::Bool(cursor.read_u8()? != 0),
            TypeTag::Timestamp => Value::Timestamp(Timestamp::from_nanos(cursor.read_u64::<LE>()?)),
            TypeTag::Duration => Value::Duration(Duration::from_nanos(cursor.read_i64::<LE>()?)),
            TypeTag::Str => {
                let len = cursor.read_u64::<LE>()? as usize;
                Value::Str(read_utf8(cursor, len)?)
            }
            TypeTag::StrEmpty => Value::Str(String::new()),
            TypeTag::OptI8 => Value::OptI8(Some(cursor.read_i8()?)),
            TypeTag::OptI8Empty => Value::OptI8(None),
            TypeTag::OptI16 => Value::OptI16(Some(cursor.read_i16::<LE>()?)),
            TypeTag::OptI16Empty => Value::OptI16(None),
            TypeTag::OptI32 => Value::OptI32(Some(cursor.read_i32::<LE>()?)),
            TypeTag::OptI32Empty => Value::OptI32(None),
            TypeTag::OptI64 => Value::OptI64(Some(cursor.read_i64::<LE>()?)),
            TypeTag::OptI64Empty => Value::OptI64(None),
            TypeTag::OptU8 => Value::OptU8(Some(cursor.read_u8()?)),
            TypeTag::OptU8Empty => Value::OptU8(None),
            TypeTag::OptU16 => Value::OptU16(Some(cursor.read_u16::<LE>()?)),
            TypeTag::OptU16Empty => Value::OptU16(None),
            TypeTag::OptU32 => Value::OptU32(Some(cursor.read_u32::<LE>()?)),
            TypeTag::OptU32Empty => Value::OptU32(None),
            TypeTag::OptU64 => Value::OptU64(Some(cursor.read_u64::<LE>()?)),
            TypeTag::OptU64Empty => Value::OptU64(None),
            TypeTag::OptF32 => Value::OptF32(Some(cursor.read_f32::<LE>()?)),
            TypeTag::OptF32Empty => Value::OptF32(None),
            TypeTag::OptF64 => Value::OptF64(Some(cursor.read_f64::<LE>()?)),
            TypeTag::OptF64Empty => Value::OptF64(None),
            TypeTag::TableBlob => {
                let blob = crate::table::TableBlob::read_self_delimited(cursor)?;
                Value::TableBlob(blob)
            }
        })
    }

    /// Structural equality that treats `NaN` floats as unequal, per the
    /// registry's merge-idempotence rule.
    pub fn value_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::F32(a), Value::F32(b)) => f32_eq(*a, *b),
            (Value::F64(a), Value::F64(b)) => f64_eq(*a, *b),
            (Value::OptF32(a), Value::OptF32(b)) => match (a, b) {
                (Some(a), Some(b)) => f32_eq(*a, *b),
                (None, None) => true,
                _ => false,
            },
            (Value::OptF64(a), Value::OptF64(b)) => match (a, b) {
                (Some(a), Some(b)) => f64_eq(*a, *b),
                (None, None) => true,
                _ => false,
            },
            (Value::TableBlob(a), Value::TableBlob(b)) => a.as_bytes() == b.as_bytes(),
            _ => self == other,
        }
    }
}

fn opt_tag<T>(v: &Option<T>, present: TypeTag, empty: TypeTag) -> TypeTag {
    if v.is_some() {
        present
    } else {
        empty
    }
}

fn opt_len<T>(v: &Option<T>, inner: usize) -> usize {
    if v.is_some() {
        inner
    } else {
        0
    }
}

fn write_opt<T: Copy>(
    buf: &mut Vec<u8>,
    v: &Option<T>,
    write: impl FnOnce(&mut Vec<u8>, T) -> io::Result<()>,
) -> io::Result<()> {
    match v {
        Some(x) => write(buf, *x),
        None => Ok(()),
    }
}

fn read_utf8(cursor: &mut io::Cursor<&[u8]>, len: usize) -> Result<String, DecodeError> {
    let pos = cursor.position() as usize;
    let slice = cursor.get_ref();
    if pos + len > slice.len() {
        return Err(DecodeError::TruncatedRecord);
    }
    let bytes = &slice[pos..pos + len];
    let s = std::str::from_utf8(bytes)
        .map_err(|_| DecodeError::TruncatedRecord)?
        .to_string();
    cursor.set_position((pos + len) as u64);
    Ok(s)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::I8(v) => write!(f, "{v}"),
            Value::I16(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::U8(v) => write!(f, "{v}"),
            Value::U16(v) => write!(f, "{v}"),
            Value::U32(v) => write!(f, "{v}"),
            Value::U64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v:?}"),
            Value::Timestamp(v) => write!(f, "{v}"),
            Value::Duration(v) => write!(f, "{v}"),
            Value::OptI8(v) => write_opt_display(f, v),
            Value::OptI16(v) => write_opt_display(f, v),
            Value::OptI32(v) => write_opt_display(f, v),
            Value::OptI64(v) => write_opt_display(f, v),
            Value::OptU8(v) => write_opt_display(f, v),
            Value::OptU16(v) => write_opt_display(f, v),
            Value::OptU32(v) => write_opt_display(f, v),
            Value::OptU64(v) => write_opt_display(f, v),
            Value::OptF32(v) => write_opt_display(f, v),
            Value::OptF64(v) => write_opt_display(f, v),
            Value::TableBlob(blob) => write!(f, "<table blob, {} bytes>", blob.len()),
        }
    }
}

fn write_opt_display<T: fmt::Display>(f: &mut fmt::Formatter, v: &Option<T>) -> fmt::Result {
    match v {
        Some(x) => write!(f, "{x}"),
        None => write!(f, "<empty>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trips_for_scalars() {
        let cases = vec![
            Value::I8(-1),
            Value::U64(u64::MAX),
            Value::F64(std::f64::consts::PI),
            Value::Bool(true),
            Value::Str("héllo".to_string()),
            Value::OptI32(None),
            Value::Duration(Duration::from_nanos(-1_000_000_000)),
            Value::Timestamp(Timestamp::from_nanos(1_700_000_000_000_000_000)),
        ];

        for value in cases {
            let tag = value.tag();
            let mut buf = Vec::new();
            value.write_frame_value(&mut buf).unwrap();
            assert_eq!(buf.len(), value.frame_encoded_len());

            let mut cursor = io::Cursor::new(buf.as_slice());
            let decoded = Value::read_frame_value(tag, &mut cursor).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn empty_string_uses_empty_tag_and_zero_length() {
        let value = Value::Str(String::new());
        assert_eq!(value.tag(), TypeTag::StrEmpty);
        assert_eq!(value.frame_encoded_len(), 0);
    }

    #[test]
    fn truncated_buffer_is_an_error() {
        let mut cursor = io::Cursor::new(&b""[..]);
        let result = Value::read_frame_value(TypeTag::I32, &mut cursor);
        assert!(matches!(result, Err(DecodeError::TruncatedRecord)));
    }

    #[test]
    fn nan_float_is_never_equal() {
        assert!(!f64_eq(f64::NAN, f64::NAN));
        assert!(!f32_eq(f32::NAN, 1.0));
    }
}
