//! RESP Protocol Implementation
//!
//! Everything the relay needs to speak the Redis Serialization Protocol:
//!
//! - `types`: the `RespValue` enum, serialization, and canned reply frames
//! - `request`: the `Request` record and the smart-mode fast-ack table
//! - `parser`: the incremental framer producing `Request`s with their raw
//!   bytes preserved for pipelined forwarding
//!
//! The parser is shared between the client-facing side (verb extraction and
//! `SELECT` tracking on) and the backend reply side (framing only).

pub mod parser;
pub mod request;
pub mod types;

// Re-export commonly used types for convenience
pub use parser::{ParseError, ParseResult, RequestParser};
pub use request::{fast_ack_reply, Request};
pub use types::{reply, RespValue};
