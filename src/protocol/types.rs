//! Tagged Wire Values
//!
//! Every response body is a single tagged value. The first byte is the tag,
//! the rest depends on it. All integers are little-endian.
//!
//! ## Encoding
//!
//! ```text
//! NIL  [0]
//! ERR  [1] [code: u32] [len: u32] [message bytes]
//! STR  [2] [len: u32] [bytes]
//! INT  [3] [i64]
//! DBL  [4] [f64]
//! ARR  [5] [n: u32] [value] * n
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// One-byte value tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Nil = 0,
    Err = 1,
    Str = 2,
    Int = 3,
    Dbl = 4,
    Arr = 5,
}

impl TryFrom<u8> for Tag {
    type Error = DecodeError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            0 => Tag::Nil,
            1 => Tag::Err,
            2 => Tag::Str,
            3 => Tag::Int,
            4 => Tag::Dbl,
            5 => Tag::Arr,
            other => return Err(DecodeError::UnknownTag(other)),
        })
    }
}

/// Error codes carried by `ERR` values.
pub mod err_code {
    /// Unknown command.
    pub const UNKNOWN: u32 = 1;
    /// Response would exceed the frame limit.
    pub const TOO_BIG: u32 = 2;
    /// Operation against a value of the wrong type.
    pub const TYPE: u32 = 3;
    /// Bad argument count or format.
    pub const ARG: u32 = 4;
}

/// Errors decoding a tagged value.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    #[error("unknown value tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("invalid UTF-8 in error message")]
    InvalidUtf8,

    #[error("array nesting deeper than {0}")]
    TooDeep(usize),
}

/// Maximum array nesting accepted by the decoder.
pub const MAX_NESTING_DEPTH: usize = 32;

/// A value as it travels on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Nil,
    Err { code: u32, msg: String },
    Str(Bytes),
    Int(i64),
    Dbl(f64),
    Arr(Vec<WireValue>),
}

impl WireValue {
    pub fn nil() -> Self {
        WireValue::Nil
    }

    /// Creates an error value.
    ///
    /// # Example
    /// ```
    /// use tidekv::protocol::types::{err_code, WireValue};
    /// let err = WireValue::err(err_code::UNKNOWN, "unknown command");
    /// assert!(err.is_error());
    /// ```
    pub fn err(code: u32, msg: impl Into<String>) -> Self {
        WireValue::Err {
            code,
            msg: msg.into(),
        }
    }

    pub fn str(data: impl Into<Bytes>) -> Self {
        WireValue::Str(data.into())
    }

    pub fn int(n: i64) -> Self {
        WireValue::Int(n)
    }

    pub fn dbl(d: f64) -> Self {
        WireValue::Dbl(d)
    }

    pub fn arr(values: Vec<WireValue>) -> Self {
        WireValue::Arr(values)
    }

    pub fn tag(&self) -> Tag {
        match self {
            WireValue::Nil => Tag::Nil,
            WireValue::Err { .. } => Tag::Err,
            WireValue::Str(_) => Tag::Str,
            WireValue::Int(_) => Tag::Int,
            WireValue::Dbl(_) => Tag::Dbl,
            WireValue::Arr(_) => Tag::Arr,
        }
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, WireValue::Err { .. })
    }

    /// Returns the error code if this is an `ERR` value.
    pub fn error_code(&self) -> Option<u32> {
        match self {
            WireValue::Err { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Number of bytes [`serialize_into`](Self::serialize_into) will write.
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            WireValue::Nil => 0,
            WireValue::Err { msg, .. } => 8 + msg.len(),
            WireValue::Str(data) => 4 + data.len(),
            WireValue::Int(_) | WireValue::Dbl(_) => 8,
            WireValue::Arr(values) => 4 + values.iter().map(WireValue::encoded_len).sum::<usize>(),
        }
    }

    /// Appends the encoded value to `buf`.
    pub fn serialize_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag() as u8);
        match self {
            WireValue::Nil => {}
            WireValue::Err { code, msg } => {
                buf.put_u32_le(*code);
                buf.put_u32_le(msg.len() as u32);
                buf.put_slice(msg.as_bytes());
            }
            WireValue::Str(data) => {
                buf.put_u32_le(data.len() as u32);
                buf.put_slice(data);
            }
            WireValue::Int(n) => buf.put_i64_le(*n),
            WireValue::Dbl(d) => buf.put_f64_le(*d),
            WireValue::Arr(values) => {
                buf.put_u32_le(values.len() as u32);
                for value in values {
                    value.serialize_into(buf);
                }
            }
        }
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.serialize_into(&mut buf);
        buf
    }

    /// Decodes one value from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed, otherwise the value and
    /// the number of bytes it occupied.
    pub fn decode(buf: &[u8]) -> Result<Option<(WireValue, usize)>, DecodeError> {
        decode_value(buf, 0)
    }
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

fn read_u64(buf: &[u8], at: usize) -> Option<u64> {
    let bytes = buf.get(at..at + 8)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

fn decode_value(buf: &[u8], depth: usize) -> Result<Option<(WireValue, usize)>, DecodeError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(DecodeError::TooDeep(MAX_NESTING_DEPTH));
    }
    let Some(&first) = buf.first() else {
        return Ok(None);
    };

    let decoded = match Tag::try_from(first)? {
        Tag::Nil => Some((WireValue::Nil, 1)),
        Tag::Err => {
            let (Some(code), Some(len)) = (read_u32(buf, 1), read_u32(buf, 5)) else {
                return Ok(None);
            };
            let end = 9 + len as usize;
            let Some(raw) = buf.get(9..end) else {
                return Ok(None);
            };
            let msg = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
            Some((WireValue::err(code, msg), end))
        }
        Tag::Str => {
            let Some(len) = read_u32(buf, 1) else {
                return Ok(None);
            };
            let end = 5 + len as usize;
            buf.get(5..end)
                .map(|raw| (WireValue::Str(Bytes::copy_from_slice(raw)), end))
        }
        Tag::Int => read_u64(buf, 1).map(|raw| (WireValue::Int(raw as i64), 9)),
        Tag::Dbl => read_u64(buf, 1).map(|raw| (WireValue::Dbl(f64::from_bits(raw)), 9)),
        Tag::Arr => {
            let Some(n) = read_u32(buf, 1) else {
                return Ok(None);
            };
            let mut consumed = 5;
            let mut values = Vec::with_capacity((n as usize).min(1024));
            for _ in 0..n {
                match decode_value(&buf[consumed..], depth + 1)? {
                    Some((value, used)) => {
                        values.push(value);
                        consumed += used;
                    }
                    None => return Ok(None),
                }
            }
            Some((WireValue::Arr(values), consumed))
        }
    };
    Ok(decoded)
}

impl fmt::Display for WireValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireValue::Nil => write!(f, "(nil)"),
            WireValue::Err { code, msg } => write!(f, "(err) {} {}", code, msg),
            WireValue::Str(data) => match std::str::from_utf8(data) {
                Ok(s) => write!(f, "(str) {}", s),
                Err(_) => write!(f, "(str) <{} bytes>", data.len()),
            },
            WireValue::Int(n) => write!(f, "(int) {}", n),
            WireValue::Dbl(d) => write!(f, "(dbl) {}", d),
            WireValue::Arr(values) => {
                writeln!(f, "(arr) len={}", values.len())?;
                for value in values {
                    writeln!(f, "{}", value)?;
                }
                write!(f, "(arr) end")
            }
        }
    }
}
