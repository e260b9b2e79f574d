//! Serialization codecs.
//!
//! Values cross the backend seam as bytes. Two codecs are available:
//!
//! - [`CodecKind::Native`]: `bincode`, exact type fidelity, prefixed with a
//!   one-byte marker so it can never be confused with a bare counter.
//! - [`CodecKind::Json`]: `serde_json`, readable by other processes and
//!   languages.
//!
//! Integer scalars bypass both codecs and are stored as plain decimal text.
//! That is the representation native counters (`INCRBY`, `$inc`, ...) use, so
//! `set(k, 5)` followed by `increment(k, 1)` works on every backend.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::ser::{self, Impossible, Serializer};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Marker in front of native-encoded payloads. Never a decimal digit or '-'.
const NATIVE_MARKER: u8 = 0x01;

/// Available codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// Binary encoding preserving exact types
    #[default]
    Native,
    /// JSON text for cross-process interoperability
    Json,
}

impl CodecKind {
    /// Codec name used in errors and status output
    pub fn name(&self) -> &'static str {
        match self {
            CodecKind::Native => "native",
            CodecKind::Json => "json",
        }
    }
}

/// Encoder/decoder for one codec kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Codec {
    kind: CodecKind,
}

impl Codec {
    /// Create a codec of the given kind
    pub fn new(kind: CodecKind) -> Self {
        Self { kind }
    }

    /// Codec kind
    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    /// Encode a value into its transportable form
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self.kind {
            CodecKind::Json => Ok(serde_json::to_vec(value)?),
            CodecKind::Native => {
                if let Some(n) = integer_scalar(value) {
                    return Ok(encode_counter(n));
                }
                let body = bincode::serialize(value)?;
                let mut out = Vec::with_capacity(body.len() + 1);
                out.push(NATIVE_MARKER);
                out.extend_from_slice(&body);
                Ok(out)
            }
        }
    }

    /// Decode a value previously produced by [`Codec::encode`] or by a native
    /// counter operation
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match bytes.first() {
            Some(&NATIVE_MARKER) => match self.kind {
                CodecKind::Native => Ok(bincode::deserialize(&bytes[1..])?),
                CodecKind::Json => Err(Error::Serialization {
                    codec: "json",
                    reason: "payload was written by the native codec".to_string(),
                }),
            },
            // JSON text and bare decimal counters are both valid JSON
            _ => serde_json::from_slice(bytes).map_err(|e| Error::Serialization {
                codec: self.kind.name(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Decimal representation shared by every counter
pub fn encode_counter(value: i64) -> Vec<u8> {
    value.to_string().into_bytes()
}

/// Parse a stored counter, `None` when the payload is not a bare integer
pub fn decode_counter(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}

fn integer_scalar<T: Serialize + ?Sized>(value: &T) -> Option<i64> {
    value.serialize(IntegerOnly).ok()
}

// =============================================================================
// Integer detection
// =============================================================================

/// Serializer that only accepts a bare integer (optionally wrapped in
/// `Some` or a newtype) and bails out on the first anything else.
struct IntegerOnly;

#[derive(Debug)]
struct NotInteger;

impl fmt::Display for NotInteger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("not an integer")
    }
}

impl std::error::Error for NotInteger {}

impl ser::Error for NotInteger {
    fn custom<M: fmt::Display>(_msg: M) -> Self {
        NotInteger
    }
}

type Reject = Impossible<i64, NotInteger>;

impl Serializer for IntegerOnly {
    type Ok = i64;
    type Error = NotInteger;
    type SerializeSeq = Reject;
    type SerializeTuple = Reject;
    type SerializeTupleStruct = Reject;
    type SerializeTupleVariant = Reject;
    type SerializeMap = Reject;
    type SerializeStruct = Reject;
    type SerializeStructVariant = Reject;

    fn serialize_i8(self, v: i8) -> std::result::Result<i64, NotInteger> {
        Ok(v.into())
    }
    fn serialize_i16(self, v: i16) -> std::result::Result<i64, NotInteger> {
        Ok(v.into())
    }
    fn serialize_i32(self, v: i32) -> std::result::Result<i64, NotInteger> {
        Ok(v.into())
    }
    fn serialize_i64(self, v: i64) -> std::result::Result<i64, NotInteger> {
        Ok(v)
    }
    fn serialize_u8(self, v: u8) -> std::result::Result<i64, NotInteger> {
        Ok(v.into())
    }
    fn serialize_u16(self, v: u16) -> std::result::Result<i64, NotInteger> {
        Ok(v.into())
    }
    fn serialize_u32(self, v: u32) -> std::result::Result<i64, NotInteger> {
        Ok(v.into())
    }
    fn serialize_u64(self, v: u64) -> std::result::Result<i64, NotInteger> {
        i64::try_from(v).map_err(|_| NotInteger)
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> std::result::Result<i64, NotInteger> {
        value.serialize(self)
    }
    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> std::result::Result<i64, NotInteger> {
        value.serialize(self)
    }

    fn serialize_bool(self, _v: bool) -> std::result::Result<i64, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_f32(self, _v: f32) -> std::result::Result<i64, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_f64(self, _v: f64) -> std::result::Result<i64, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_char(self, _v: char) -> std::result::Result<i64, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_str(self, _v: &str) -> std::result::Result<i64, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_bytes(self, _v: &[u8]) -> std::result::Result<i64, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_none(self) -> std::result::Result<i64, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_unit(self) -> std::result::Result<i64, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_unit_struct(self, _name: &'static str) -> std::result::Result<i64, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
    ) -> std::result::Result<i64, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> std::result::Result<i64, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_seq(self, _len: Option<usize>) -> std::result::Result<Reject, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_tuple(self, _len: usize) -> std::result::Result<Reject, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> std::result::Result<Reject, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> std::result::Result<Reject, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_map(self, _len: Option<usize>) -> std::result::Result<Reject, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> std::result::Result<Reject, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> std::result::Result<Reject, NotInteger> {
        Err(NotInteger)
    }
}

// =============================================================================
// Tests
// =============================================================================
