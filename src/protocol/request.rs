//! Request Record
//!
//! A `Request` is the unit that travels from the parser through the dispatch
//! loop into a backend intake channel. It keeps the exact bytes of the frame
//! as read from the client so a backend write is a plain byte copy, with no
//! re-serialization on the hot path.

use crate::protocol::types::{reply, RespValue};
use bytes::Bytes;
use tokio::sync::mpsc;

pub const SELECT_COMMAND: &[u8] = b"SELECT";
pub const QUIT_COMMAND: &[u8] = b"QUIT";

/// One parsed client request.
///
/// Invariants upheld by the parser:
/// - `command` is uppercased.
/// - `raw` is byte-for-byte the frame as received (CRLF-terminated).
/// - for multibulk frames, `items[0]` carries the same verb as `command`.
#[derive(Debug, Default)]
pub struct Request {
    /// Uppercased verb.
    pub command: Bytes,
    /// The full frame, suitable for pipelined forwarding.
    pub raw: Bytes,
    /// Parsed RESP pieces of the frame.
    pub items: Vec<RespValue>,
    /// Database index selected on the connection when this request was read.
    pub database: u32,
    /// Where the backend delivers the reply; `None` for fire-and-forget.
    /// Always a capacity-1 channel, reused across requests on a connection.
    pub reply: Option<mpsc::Sender<Bytes>>,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_quit(&self) -> bool {
        self.command == QUIT_COMMAND
    }

    pub fn is_select(&self) -> bool {
        self.command == SELECT_COMMAND
    }
}

/// The fast-ack table: commands whose success reply is a constant, answered
/// locally in smart mode before the backend has seen the write.
///
/// On backend failure the effect is a lost write, never a wrong reply.
pub fn fast_ack_reply(command: &[u8]) -> Option<&'static [u8]> {
    match command {
        b"PING" => Some(reply::PONG),

        b"SET" | b"SETEX" | b"PSETEX" | b"MSET" | b"HMSET" | b"SELECT" => Some(reply::OK),

        b"DEL" | b"HSET" | b"HDEL" | b"EXPIRE" | b"EXPIREAT" | b"PEXPIRE" | b"PEXPIREAT" => {
            Some(reply::ONE)
        }

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_ack_ok_commands() {
        for cmd in [b"SET".as_ref(), b"SETEX", b"PSETEX", b"MSET", b"HMSET", b"SELECT"] {
            assert_eq!(fast_ack_reply(cmd), Some(reply::OK), "{:?}", cmd);
        }
    }

    #[test]
    fn test_fast_ack_integer_commands() {
        for cmd in [
            b"DEL".as_ref(),
            b"HSET",
            b"HDEL",
            b"EXPIRE",
            b"EXPIREAT",
            b"PEXPIRE",
            b"PEXPIREAT",
        ] {
            assert_eq!(fast_ack_reply(cmd), Some(reply::ONE), "{:?}", cmd);
        }
    }

    #[test]
    fn test_fast_ack_ping() {
        assert_eq!(fast_ack_reply(b"PING"), Some(reply::PONG));
    }

    #[test]
    fn test_fast_ack_misses() {
        assert_eq!(fast_ack_reply(b"GET"), None);
        assert_eq!(fast_ack_reply(b"INCR"), None);
        // Lookup is on the uppercased verb only.
        assert_eq!(fast_ack_reply(b"set"), None);
    }
}
