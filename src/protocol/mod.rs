//! Wire Protocol
//!
//! Requests and responses travel as length-prefixed frames. A request is a
//! list of byte-string arguments; a response is one tagged value.
//!
//! ## Modules
//!
//! - `frame`: length-prefixed framing, request parsing, response framing
//! - `types`: the `WireValue` enum, its tag set and encoding
//!
//! ## Example
//!
//! ```
//! use tidekv::protocol::{encode_request, parse_request, write_response, read_response, WireValue};
//! use bytes::BytesMut;
//!
//! let mut buf = BytesMut::new();
//! encode_request(&["get", "name"], &mut buf);
//! let args = parse_request(&mut buf).unwrap().unwrap();
//! assert_eq!(args.len(), 2);
//!
//! let mut out = BytesMut::new();
//! write_response(&WireValue::nil(), &mut out);
//! let (value, _) = read_response(&out).unwrap().unwrap();
//! assert_eq!(value, WireValue::Nil);
//! ```

pub mod frame;
pub mod types;

// Re-export commonly used types for convenience
pub use frame::{
    encode_request, parse_request, read_response, write_response, FrameError, HEADER_LEN, MAX_MSG,
};
pub use types::{err_code, DecodeError, Tag, WireValue};
