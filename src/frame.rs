//! The wire frame: a 16-byte header followed by a body of `(tag, key,
//! value)` records.
//!
//! Mirrors the way `tchajed-rust-nbd`'s `Opt`/`Request`/`SimpleReply` read a
//! fixed header, sanity-check its declared length, then read exactly that
//! many more bytes — except here the body is a variable number of typed,
//! keyed records rather than one fixed payload.
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Cursor};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};

use crate::value::{DecodeError, TypeTag, Value};

/// Size in bytes of the fixed frame header (`cipher`, `total_length`).
pub const HEADER_LEN: usize = 16;

/// First cipher in the band reserved for control messages the
/// [`crate::app::Application`] dispatches itself rather than handing to
/// user code.
pub const RESERVED_CIPHER_START: u64 = 934_875_930;
/// Last cipher in the reserved band (inclusive).
pub const RESERVED_CIPHER_END: u64 = 934_875_938;

pub const CIPHER_HELLO: u64 = 934_875_930;
pub const CIPHER_METADATA_RESPONSE: u64 = 934_875_931;
pub const CIPHER_PARAMETERS_RESPONSE: u64 = 934_875_932;
pub const CIPHER_METADATA_REQUEST: u64 = 934_875_933;
pub const CIPHER_PARAMETERS_REQUEST: u64 = 934_875_934;
pub const CIPHER_PAUSE: u64 = 934_875_935;
pub const CIPHER_RUN: u64 = 934_875_936;
pub const CIPHER_DELETE: u64 = 934_875_937;
pub const CIPHER_MODIFY: u64 = 934_875_938;

/// True if `cipher` falls in the band the application layer reserves for
/// its own control protocol.
pub fn is_reserved_cipher(cipher: u64) -> bool {
    (RESERVED_CIPHER_START..=RESERVED_CIPHER_END).contains(&cipher)
}

/// Errors raised while decoding a frame.
#[derive(Debug)]
pub enum FrameError {
    Decode(DecodeError),
    /// A key appeared twice in one frame body.
    DuplicateKey(u64),
    /// The header's declared `total_length` didn't match the bytes actually
    /// present.
    LengthMismatch { declared: u64, actual: u64 },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameError::Decode(e) => write!(f, "{e}"),
            FrameError::DuplicateKey(k) => write!(f, "duplicate key {k} in frame body"),
            FrameError::LengthMismatch { declared, actual } => write!(
                f,
                "frame declared total_length {declared} but body was {actual} bytes"
            ),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<DecodeError> for FrameError {
    fn from(e: DecodeError) -> Self {
        FrameError::Decode(e)
    }
}

/// An ordered set of `(tag, value)` records keyed by `u64`, identified by
/// its `cipher`.
///
/// Keys are kept in a `BTreeMap` so both wire encoding and any
/// debug-printing of a frame iterate keys in ascending order, which is
/// required for the byte-identical metadata output the parameter registry
/// promises.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub cipher: u64,
    fields: BTreeMap<u64, (TypeTag, Value)>,
}

impl Frame {
    pub fn new(cipher: u64) -> Self {
        Frame {
            cipher,
            fields: BTreeMap::new(),
        }
    }

    /// Insert or replace a field. Returns the previous value, if any.
    pub fn set(&mut self, key: u64, value: Value) -> Option<(TypeTag, Value)> {
        let tag = value.tag();
        self.fields.insert(key, (tag, value))
    }

    pub fn get(&self, key: u64) -> Option<&Value> {
        self.fields.get(&key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: u64) -> bool {
        self.fields.contains_key(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &(TypeTag, Value))> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn body_len(&self) -> usize {
        self.fields
            .values()
            .map(|(_, v)| 1 + 8 + v.frame_encoded_len())
            .sum()
    }

    /// Encode the full frame (header + body) as bytes ready to write to a
    /// socket. `total_length` (the header's second field) counts the
    /// 16-byte header itself, so a peer reads it and subtracts `HEADER_LEN`
    /// to learn how many more bytes of body follow.
    pub fn encode(&self) -> Vec<u8> {
        let body_len = self.body_len();
        let total_length = HEADER_LEN + body_len;
        let mut buf = Vec::with_capacity(total_length);
        buf.write_u64::<LE>(self.cipher).unwrap();
        buf.write_u64::<LE>(total_length as u64).unwrap();
        for (key, (tag, value)) in &self.fields {
            buf.write_u8((*tag).into()).unwrap();
            buf.write_u64::<LE>(*key).unwrap();
            value
                .write_frame_value(&mut buf)
                .expect("writing to a Vec<u8> cannot fail");
        }
        buf
    }

    /// Parse just the 16-byte header, returning `(cipher, declared
    /// total_length, including the header itself)`. Used by the server to
    /// learn how many more bytes to read before calling
    /// [`Frame::decode_body`].
    pub fn decode_header(header: &[u8; HEADER_LEN]) -> (u64, u64) {
        let mut cursor = Cursor::new(&header[..]);
        let cipher = cursor.read_u64::<LE>().unwrap();
        let total_length = cursor.read_u64::<LE>().unwrap();
        (cipher, total_length)
    }

    /// Decode a frame body given the header's declared `total_length`
    /// (header-inclusive); `body` must already be exactly
    /// `total_length - HEADER_LEN` bytes.
    pub fn decode_body(cipher: u64, total_length: u64, body: &[u8]) -> Result<Frame, FrameError> {
        let declared_body_len = total_length.saturating_sub(HEADER_LEN as u64);
        if body.len() as u64 != declared_body_len {
            return Err(FrameError::LengthMismatch {
                declared: total_length,
                actual: HEADER_LEN as u64 + body.len() as u64,
            });
        }
        let mut frame = Frame::new(cipher);
        let mut cursor = Cursor::new(body);
        while (cursor.position() as usize) < body.len() {
            let tag_byte = cursor.read_u8().map_err(|_| DecodeError::TruncatedRecord)?;
            let tag = TypeTag::try_from(tag_byte).map_err(|_| DecodeError::UnknownTag(tag_byte))?;
            let key = cursor.read_u64::<LE>().map_err(|_| DecodeError::TruncatedRecord)?;
            let value = Value::read_frame_value(tag, &mut cursor)?;
            if frame.fields.insert(key, (tag, value)).is_some() {
                return Err(FrameError::DuplicateKey(key));
            }
        }
        Ok(frame)
    }

    /// Decode a complete frame (header + body) from one contiguous buffer,
    /// for tests and for callers that already have the whole thing in
    /// memory.
    pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::Decode(DecodeError::TruncatedRecord));
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&bytes[..HEADER_LEN]);
        let (cipher, declared_len) = Frame::decode_header(&header);
        Frame::decode_body(cipher, declared_len, &bytes[HEADER_LEN..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Duration, Timestamp};

    #[test]
    fn encode_decode_round_trip() {
        let mut frame = Frame::new(CIPHER_HELLO);
        frame.set(1, Value::U32(42));
        frame.set(2, Value::Str("hello".to_string()));
        frame.set(3, Value::OptF64(None));
        frame.set(4, Value::Timestamp(Timestamp::from_nanos(123)));
        frame.set(5, Value::Duration(Duration::from_nanos(-7)));

        let bytes = frame.encode();
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn duplicate_keys_rejected() {
        let mut frame = Frame::new(1);
        frame.set(1, Value::U8(1));
        let mut bytes = frame.encode();
        // append a second record reusing key 1
        let mut extra = Vec::new();
        extra.push(TypeTag::U8.into());
        extra.extend_from_slice(&1u64.to_le_bytes());
        extra.push(9u8);
        let new_total_length = bytes.len() + extra.len();
        bytes[8..16].copy_from_slice(&(new_total_length as u64).to_le_bytes());
        bytes.extend_from_slice(&extra);

        let result = Frame::decode(&bytes);
        assert!(matches!(result, Err(FrameError::DuplicateKey(1))));
    }

    #[test]
    fn declared_length_mismatch_rejected() {
        let frame_bytes = {
            let mut f = Frame::new(1);
            f.set(1, Value::U8(9));
            f.encode()
        };
        let mut bad = frame_bytes.clone();
        bad[8..16].copy_from_slice(&999u64.to_le_bytes());
        let result = Frame::decode(&bad);
        assert!(matches!(result, Err(FrameError::LengthMismatch { .. })));
    }

    #[test]
    fn reserved_cipher_band_covers_nine_control_messages() {
        let all = [
            CIPHER_HELLO,
            CIPHER_RUN,
            CIPHER_PAUSE,
            CIPHER_MODIFY,
            CIPHER_DELETE,
            CIPHER_METADATA_REQUEST,
            CIPHER_METADATA_RESPONSE,
            CIPHER_PARAMETERS_REQUEST,
            CIPHER_PARAMETERS_RESPONSE,
        ];
        assert_eq!(all.len(), 9);
        for cipher in all {
            assert!(is_reserved_cipher(cipher));
        }
        assert!(!is_reserved_cipher(RESERVED_CIPHER_START - 1));
        assert!(!is_reserved_cipher(RESERVED_CIPHER_END + 1));
    }
}
