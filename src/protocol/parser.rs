//! Incremental RESP Request Framer
//!
//! Turns a byte stream into [`Request`] records. The parser is incremental:
//! it works over whatever bytes the connection has buffered so far and
//! reports `Ok(None)` when the frame is incomplete, so the caller can read
//! more from the socket and retry.
//!
//! Two properties matter downstream:
//!
//! 1. **Raw preservation**: `Request.raw` is byte-for-byte the frame as it
//!    arrived, so forwarding to a backend is a plain copy. For every valid
//!    frame `F`, `parse(F).raw == F`.
//! 2. **SELECT statefulness**: the parser owns the connection's selected
//!    database index. A `SELECT n` request updates it, and every parsed
//!    request is stamped with the index current at parse time.
//!
//! The same parser runs on backend replies (`parse_command == false`), where
//! verb extraction and SELECT tracking are skipped and only the framing
//! matters.

use crate::protocol::request::Request;
use crate::protocol::types::RespValue;
use bytes::Bytes;
use thiserror::Error;

/// Maximum array nesting depth (prevents stack overflow on hostile input)
pub const MAX_NESTING_DEPTH: usize = 32;

/// Errors surfaced to the dispatch loop, which closes the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// An empty protocol line where content was required.
    #[error("short line")]
    ShortLine,

    /// A bulk payload not terminated by CRLF.
    #[error("line should end with CRLF")]
    MissingCRLF,

    /// Unparseable bulk length or integer field.
    #[error("bad length: {0}")]
    BadLength(String),

    /// Unparseable or negative array count.
    #[error("bad array count: {0}")]
    BadArrayCount(String),
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Per-connection request parser.
///
/// Holds the database index selected by the connection, updated whenever a
/// `SELECT` request is parsed.
#[derive(Debug, Default)]
pub struct RequestParser {
    database: u32,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// The database index currently selected on this connection.
    pub fn database(&self) -> u32 {
        self.database
    }

    /// Attempts to parse one request from `buf`.
    ///
    /// Returns `Ok(Some((request, consumed)))` on success, `Ok(None)` when
    /// the buffered bytes do not yet hold a complete frame.
    ///
    /// `parse_command` selects client-side behavior: uppercase the verb into
    /// `Request.command`, track `SELECT`, and stamp the database index. Pass
    /// `false` when framing backend replies.
    pub fn parse(
        &mut self,
        buf: &[u8],
        parse_command: bool,
    ) -> ParseResult<Option<(Request, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }

        let mut req = Request::new();

        let consumed = match buf[0] {
            b'+' | b'-' | b':' | b'$' | b'*' => match parse_value(buf, 0, 0)? {
                Some((value, consumed)) => {
                    match value {
                        RespValue::Array(items) => req.items = items,
                        other => req.items.push(other),
                    }
                    consumed
                }
                None => return Ok(None),
            },
            _ => match parse_inline(buf, &mut req)? {
                Some(consumed) => consumed,
                None => return Ok(None),
            },
        };

        if parse_command {
            if req.command.is_empty() {
                if let Some(verb) = req.items.first().and_then(RespValue::as_bytes) {
                    req.command = Bytes::from(verb.to_ascii_uppercase());
                }
            }

            if req.is_select() {
                if let Some(db) = req.items.get(1).and_then(RespValue::as_integer) {
                    if db >= 0 {
                        self.database = db as u32;
                    }
                }
            }
            req.database = self.database;
        }

        req.raw = Bytes::copy_from_slice(&buf[..consumed]);
        Ok(Some((req, consumed)))
    }
}

/// Parses one RESP value starting at `at`. Returns the value and the number
/// of bytes consumed from `at`, or `None` when incomplete.
fn parse_value(buf: &[u8], at: usize, depth: usize) -> ParseResult<Option<(RespValue, usize)>> {
    if depth > MAX_NESTING_DEPTH {
        return Err(ParseError::BadArrayCount("nesting too deep".to_string()));
    }
    if at >= buf.len() {
        return Ok(None);
    }

    match buf[at] {
        b'+' => Ok(line_content(buf, at)?
            .map(|(s, n)| (RespValue::SimpleString(lossy(s)), n))),
        b'-' => Ok(line_content(buf, at)?.map(|(s, n)| (RespValue::Error(lossy(s)), n))),
        b':' => match line_content(buf, at)? {
            Some((s, n)) => {
                let v = parse_i64(s).map_err(ParseError::BadLength)?;
                Ok(Some((RespValue::Integer(v), n)))
            }
            None => Ok(None),
        },
        b'$' => parse_bulk(buf, at),
        b'*' => parse_array(buf, at, depth),
        other => Err(ParseError::BadLength(format!(
            "unexpected type prefix {:#04x}",
            other
        ))),
    }
}

/// `$<length>\r\n<data>\r\n`. A negative length is a null element: the
/// length line is kept verbatim and no body is read.
fn parse_bulk(buf: &[u8], at: usize) -> ParseResult<Option<(RespValue, usize)>> {
    let (len_field, line_len) = match line_content(buf, at)? {
        Some(v) => v,
        None => return Ok(None),
    };
    let len = parse_i64(len_field).map_err(ParseError::BadLength)?;

    if len < 0 {
        return Ok(Some((RespValue::Null, line_len)));
    }
    let len = len as usize;

    let data_start = at + line_len;
    let total = line_len + len + 2;
    if buf.len() < at + total {
        return Ok(None);
    }

    if &buf[data_start + len..data_start + len + 2] != b"\r\n" {
        return Err(ParseError::MissingCRLF);
    }

    let data = Bytes::copy_from_slice(&buf[data_start..data_start + len]);
    Ok(Some((RespValue::BulkString(data), total)))
}

/// `*<count>\r\n<elements...>`. Negative counts are rejected on the request
/// side; nested arrays recurse.
fn parse_array(buf: &[u8], at: usize, depth: usize) -> ParseResult<Option<(RespValue, usize)>> {
    let (count_field, line_len) = match line_content(buf, at)? {
        Some(v) => v,
        None => return Ok(None),
    };
    let count = parse_i64(count_field).map_err(ParseError::BadArrayCount)?;
    if count < 0 {
        return Err(ParseError::BadArrayCount(count.to_string()));
    }

    let mut elements = Vec::with_capacity(count as usize);
    let mut consumed = line_len;
    for _ in 0..count {
        match parse_value(buf, at + consumed, depth + 1)? {
            Some((value, n)) => {
                elements.push(value);
                consumed += n;
            }
            None => return Ok(None),
        }
    }

    Ok(Some((RespValue::Array(elements), consumed)))
}

/// An inline request: a bare line, space-split, first token is the verb.
fn parse_inline(buf: &[u8], req: &mut Request) -> ParseResult<Option<usize>> {
    let (line, consumed) = match read_line(buf, 0) {
        Some(v) => v,
        None => return Ok(None),
    };
    if line.is_empty() {
        return Err(ParseError::ShortLine);
    }

    for token in line.split(|b| *b == b' ').filter(|t| !t.is_empty()) {
        req.items
            .push(RespValue::BulkString(Bytes::copy_from_slice(token)));
    }
    if req.items.is_empty() {
        return Err(ParseError::ShortLine);
    }
    Ok(Some(consumed))
}

/// Content of the line starting at `at`, skipping the type prefix byte.
/// Returns the content slice and the total line length including CRLF.
/// Empty content is legal here (`+\r\n` is an empty simple string); numeric
/// fields reject it downstream.
fn line_content(buf: &[u8], at: usize) -> ParseResult<Option<(&[u8], usize)>> {
    Ok(read_line(&buf[at..], 1))
}

/// Reads a CRLF-terminated line from `buf` starting at `skip`. Returns the
/// content (without CRLF) and the full length consumed from index 0.
fn read_line(buf: &[u8], skip: usize) -> Option<(&[u8], usize)> {
    let search = buf.get(skip..)?;
    let pos = find_crlf(search)?;
    Some((&search[..pos], skip + pos + 2))
}

#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_i64(field: &[u8]) -> Result<i64, String> {
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| String::from_utf8_lossy(field).into_owned())
}

fn lossy(b: &[u8]) -> String {
    String::from_utf8_lossy(b).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(input: &[u8]) -> (Request, usize) {
        RequestParser::new()
            .parse(input, true)
            .unwrap()
            .expect("complete frame")
    }

    #[test]
    fn test_multibulk_set() {
        let input = b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n";
        let (req, consumed) = parse_one(input);
        assert_eq!(consumed, input.len());
        assert_eq!(&req.command[..], b"SET");
        assert_eq!(&req.raw[..], &input[..]);
        assert_eq!(req.items.len(), 3);
        assert_eq!(req.items[1].as_bytes(), Some(&b"k"[..]));
    }

    #[test]
    fn test_command_uppercased() {
        let input = b"*2\r\n$3\r\nget\r\n$1\r\nk\r\n";
        let (req, _) = parse_one(input);
        assert_eq!(&req.command[..], b"GET");
        // items keep the original casing; only the verb is normalized
        assert_eq!(req.items[0].as_bytes(), Some(&b"get"[..]));
    }

    #[test]
    fn test_raw_round_trip() {
        let frames: &[&[u8]] = &[
            b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n",
            b"*1\r\n$4\r\nQUIT\r\n",
            b"*2\r\n$3\r\nGET\r\n$0\r\n\r\n",
            b"*2\r\n$3\r\nDEL\r\n$-1\r\n",
            b"+OK\r\n",
            b":1000\r\n",
            b"-ERR oops\r\n",
            b"*2\r\n:1\r\n*2\r\n:2\r\n:3\r\n",
        ];
        for frame in frames {
            let mut parser = RequestParser::new();
            let (req, consumed) = parser.parse(frame, true).unwrap().unwrap();
            assert_eq!(consumed, frame.len(), "{:?}", frame);
            assert_eq!(&req.raw[..], &frame[..], "{:?}", frame);
        }
    }

    #[test]
    fn test_inline_request() {
        let input = b"SET key value\r\n";
        let (req, consumed) = parse_one(input);
        assert_eq!(consumed, input.len());
        assert_eq!(&req.command[..], b"SET");
        assert_eq!(req.items.len(), 3);
        assert_eq!(&req.raw[..], &input[..]);
    }

    #[test]
    fn test_inline_lowercase_verb() {
        let (req, _) = parse_one(b"ping\r\n");
        assert_eq!(&req.command[..], b"PING");
    }

    #[test]
    fn test_zero_length_bulk() {
        let input = b"$0\r\n\r\n";
        let (req, consumed) = parse_one(input);
        assert_eq!(consumed, 6);
        assert_eq!(req.items[0].as_bytes(), Some(&b""[..]));
    }

    #[test]
    fn test_negative_bulk_is_null_verbatim() {
        // The null element keeps its length line in raw; no body follows.
        let input = b"*2\r\n$3\r\nDEL\r\n$-1\r\n";
        let (req, consumed) = parse_one(input);
        assert_eq!(consumed, input.len());
        assert!(req.items[1].is_null());
        assert_eq!(&req.raw[..], &input[..]);
    }

    #[test]
    fn test_negative_array_count_fails() {
        let err = RequestParser::new().parse(b"*-1\r\n", true).unwrap_err();
        assert!(matches!(err, ParseError::BadArrayCount(_)));
    }

    #[test]
    fn test_bad_bulk_length() {
        let err = RequestParser::new()
            .parse(b"$abc\r\nxx\r\n", true)
            .unwrap_err();
        assert!(matches!(err, ParseError::BadLength(_)));
    }

    #[test]
    fn test_missing_crlf_after_bulk() {
        let err = RequestParser::new()
            .parse(b"$5\r\nhelloXX", true)
            .unwrap_err();
        assert_eq!(err, ParseError::MissingCRLF);
    }

    #[test]
    fn test_short_line() {
        let err = RequestParser::new().parse(b"\r\n", true).unwrap_err();
        assert_eq!(err, ParseError::ShortLine);
    }

    #[test]
    fn test_empty_simple_string_is_legal() {
        let (req, consumed) = RequestParser::new().parse(b"+\r\n", false).unwrap().unwrap();
        assert_eq!(consumed, 3);
        assert_eq!(req.items[0], RespValue::SimpleString(String::new()));
    }

    #[test]
    fn test_empty_bulk_length_rejected() {
        let err = RequestParser::new().parse(b"$\r\n", true).unwrap_err();
        assert!(matches!(err, ParseError::BadLength(_)));
    }

    #[test]
    fn test_incomplete_frames() {
        let mut parser = RequestParser::new();
        for partial in [
            b"*3\r\n$3\r\nSET\r\n".as_ref(),
            b"$5\r\nhel",
            b"*2\r\n",
            b"+OK",
            b"PING",
        ] {
            assert!(parser.parse(partial, true).unwrap().is_none(), "{:?}", partial);
        }
    }

    #[test]
    fn test_select_updates_database() {
        let mut parser = RequestParser::new();

        let sel = b"*2\r\n$6\r\nSELECT\r\n$1\r\n3\r\n";
        let (req, _) = parser.parse(sel, true).unwrap().unwrap();
        assert_eq!(&req.command[..], b"SELECT");
        // The SELECT request itself already carries the new index.
        assert_eq!(req.database, 3);
        assert_eq!(parser.database(), 3);

        // Affinity: every later request on the connection carries db 3.
        let get = b"*2\r\n$3\r\nGET\r\n$1\r\nx\r\n";
        let (req, _) = parser.parse(get, true).unwrap().unwrap();
        assert_eq!(req.database, 3);

        let sel0 = b"*2\r\n$6\r\nSELECT\r\n$1\r\n0\r\n";
        let (req, _) = parser.parse(sel0, true).unwrap().unwrap();
        assert_eq!(req.database, 0);
    }

    #[test]
    fn test_select_bad_index_ignored() {
        let mut parser = RequestParser::new();
        let sel = b"*2\r\n$6\r\nSELECT\r\n$3\r\nfoo\r\n";
        let (req, _) = parser.parse(sel, true).unwrap().unwrap();
        assert_eq!(req.database, 0);
        assert_eq!(parser.database(), 0);
    }

    #[test]
    fn test_pipelined_frames() {
        let mut parser = RequestParser::new();
        let input = b"*1\r\n$4\r\nPING\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n";

        let (first, n) = parser.parse(input, true).unwrap().unwrap();
        assert_eq!(&first.command[..], b"PING");

        let (second, m) = parser.parse(&input[n..], true).unwrap().unwrap();
        assert_eq!(&second.command[..], b"GET");
        assert_eq!(n + m, input.len());
    }

    #[test]
    fn test_reply_side_parsing() {
        // parse_command == false: framing only, no verb, no SELECT tracking.
        let mut parser = RequestParser::new();
        let reply = b"$1\r\nv\r\n";
        let (req, consumed) = parser.parse(reply, false).unwrap().unwrap();
        assert_eq!(consumed, reply.len());
        assert!(req.command.is_empty());
        assert_eq!(&req.raw[..], &reply[..]);

        let sel = b"*2\r\n$6\r\nSELECT\r\n$1\r\n5\r\n";
        parser.parse(sel, false).unwrap().unwrap();
        assert_eq!(parser.database(), 0);
    }

    #[test]
    fn test_nested_array() {
        let input = b"*2\r\n$4\r\nEXEC\r\n*2\r\n:1\r\n:2\r\n";
        let (req, consumed) = parse_one(input);
        assert_eq!(consumed, input.len());
        assert_eq!(req.items.len(), 2);
        assert!(matches!(req.items[1], RespValue::Array(_)));
        assert_eq!(&req.raw[..], &input[..]);
    }

    #[test]
    fn test_nesting_depth_limit() {
        let mut input = Vec::new();
        for _ in 0..MAX_NESTING_DEPTH + 2 {
            input.extend_from_slice(b"*1\r\n");
        }
        input.extend_from_slice(b":1\r\n");
        let err = RequestParser::new().parse(&input, true).unwrap_err();
        assert!(matches!(err, ParseError::BadArrayCount(_)));
    }
}
