//! Length-Prefixed Framing
//!
//! Both directions use the same outer frame: a little-endian `u32` length
//! followed by that many payload bytes. A payload longer than
//! [`MAX_MSG`] is a protocol error.
//!
//! ## Requests
//!
//! ```text
//! [len: u32] [nstr: u32] ([slen: u32] [bytes]) * nstr
//! ```
//!
//! ## Responses
//!
//! ```text
//! [len: u32] [tagged value]
//! ```
//!
//! Request arguments are sliced out of the frame as `Bytes`, so parsing
//! copies nothing.

use crate::protocol::types::{err_code, DecodeError, WireValue};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the length header.
pub const HEADER_LEN: usize = 4;

/// Largest payload accepted or produced.
pub const MAX_MSG: usize = 4096;

/// Most arguments a single request may carry.
pub const MAX_ARGS: usize = 200_000;

/// Protocol violations. Any of these terminates the connection.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("frame too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },

    #[error("too many arguments: {0}")]
    TooManyArgs(usize),

    #[error("argument runs past the end of the frame")]
    Truncated,

    #[error("{0} trailing bytes after the last argument")]
    TrailingBytes(usize),
}

/// Extracts one request from the front of `buf`.
///
/// - `Ok(Some(args))` - a complete frame was consumed
/// - `Ok(None)` - the frame is incomplete, `buf` is untouched
/// - `Err(e)` - the stream is malformed
pub fn parse_request(buf: &mut BytesMut) -> Result<Option<Vec<Bytes>>, FrameError> {
    let Some(len) = peek_len(buf) else {
        return Ok(None);
    };
    if len > MAX_MSG {
        return Err(FrameError::TooLarge {
            size: len,
            max: MAX_MSG,
        });
    }
    if buf.len() < HEADER_LEN + len {
        return Ok(None);
    }

    let mut frame = buf.split_to(HEADER_LEN + len).freeze();
    frame.advance(HEADER_LEN);
    decode_args(frame).map(Some)
}

fn peek_len(buf: &[u8]) -> Option<usize> {
    let header: [u8; HEADER_LEN] = buf.get(..HEADER_LEN)?.try_into().ok()?;
    Some(u32::from_le_bytes(header) as usize)
}

fn decode_args(mut payload: Bytes) -> Result<Vec<Bytes>, FrameError> {
    if payload.remaining() < 4 {
        return Err(FrameError::Truncated);
    }
    let nstr = payload.get_u32_le() as usize;
    if nstr > MAX_ARGS {
        return Err(FrameError::TooManyArgs(nstr));
    }

    let mut args = Vec::with_capacity(nstr.min(64));
    for _ in 0..nstr {
        if payload.remaining() < 4 {
            return Err(FrameError::Truncated);
        }
        let len = payload.get_u32_le() as usize;
        if payload.remaining() < len {
            return Err(FrameError::Truncated);
        }
        args.push(payload.split_to(len));
    }

    if payload.has_remaining() {
        return Err(FrameError::TrailingBytes(payload.remaining()));
    }
    Ok(args)
}

/// Appends a request frame for `args` to `out`.
pub fn encode_request<A: AsRef<[u8]>>(args: &[A], out: &mut BytesMut) {
    let len = 4 + args.iter().map(|a| 4 + a.as_ref().len()).sum::<usize>();
    out.reserve(HEADER_LEN + len);
    out.put_u32_le(len as u32);
    out.put_u32_le(args.len() as u32);
    for arg in args {
        out.put_u32_le(arg.as_ref().len() as u32);
        out.put_slice(arg.as_ref());
    }
}

/// Appends a response frame to `out`.
///
/// A value whose encoding exceeds [`MAX_MSG`] is replaced by a `TOO_BIG`
/// error so the frame limit holds in both directions.
pub fn write_response(value: &WireValue, out: &mut BytesMut) {
    if value.encoded_len() > MAX_MSG {
        let too_big = WireValue::err(err_code::TOO_BIG, "response is too big");
        return write_response(&too_big, out);
    }

    out.reserve(HEADER_LEN + value.encoded_len());
    out.put_u32_le(value.encoded_len() as u32);
    value.serialize_into(out);
}

/// Decodes one response frame from the front of `buf`.
pub fn read_response(buf: &[u8]) -> Result<Option<(WireValue, usize)>, DecodeError> {
    let Some(len) = peek_len(buf) else {
        return Ok(None);
    };
    let Some(body) = buf.get(HEADER_LEN..HEADER_LEN + len) else {
        return Ok(None);
    };
    Ok(WireValue::decode(body)?.map(|(value, _)| (value, HEADER_LEN + len)))
}
