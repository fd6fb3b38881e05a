//! PostgreSQL message decoder.
//!
//! [`MessageReader`] reassembles complete backend messages from an
//! arbitrarily chunked byte stream, and parses each message body into a
//! [`BackendMessage`]. No message is produced until its declared length is
//! fully buffered.

#![allow(clippy::cast_possible_truncation)]

use std::fmt;

use super::{auth_code, backend_type, BackendMessage, ErrorFields, FieldDescription, TransactionStatus};

/// Maximum accepted message size (100MB; the protocol allows up to 1GB).
const MAX_MESSAGE_SIZE: u32 = 100 * 1024 * 1024;

/// Consumed bytes are reclaimed once the read cursor passes this mark.
const COMPACT_THRESHOLD: usize = 8192;

/// A framing-level protocol violation. Fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Declared message length exceeds the sanity cap.
    Oversized { length: u32 },
    /// Message body ended before a required field.
    Truncated(&'static str),
    /// ReadyForQuery carried an unknown transaction status byte.
    InvalidStatus(u8),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Oversized { length } => {
                write!(f, "message length {} exceeds maximum {}", length, MAX_MESSAGE_SIZE)
            }
            FrameError::Truncated(what) => write!(f, "truncated message: missing {}", what),
            FrameError::InvalidStatus(byte) => {
                write!(f, "invalid transaction status byte: 0x{:02x}", byte)
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// A cursor over a single message body.
///
/// All multi-byte integers are big-endian. Reads past the end return
/// `None` so body parsers can terminate cleanly on truncated input.
#[derive(Debug)]
struct MessageParser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> MessageParser<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn read_u8(&mut self) -> Option<u8> {
        let byte = self.data.get(self.pos)?;
        self.pos += 1;
        Some(*byte)
    }

    fn read_i16(&mut self) -> Option<i16> {
        if self.remaining() < 2 {
            return None;
        }
        let value = i16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Some(value)
    }

    fn read_i32(&mut self) -> Option<i32> {
        if self.remaining() < 4 {
            return None;
        }
        let value = i32::from_be_bytes([
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ]);
        self.pos += 4;
        Some(value)
    }

    /// Read a null-terminated string. If no terminator is present, the
    /// remainder of the buffer is returned and the cursor moves to the end.
    fn read_cstring(&mut self) -> String {
        let start = self.pos;
        while self.pos < self.data.len() && self.data[self.pos] != 0 {
            self.pos += 1;
        }
        let s = String::from_utf8_lossy(&self.data[start..self.pos]).into_owned();
        if self.pos < self.data.len() {
            self.pos += 1; // skip the terminator
        }
        s
    }

    fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(bytes)
    }

    fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }
}

/// Incremental reader for the backend message stream.
///
/// Bytes are appended with [`feed`](MessageReader::feed); complete messages
/// are drained with [`next_message`](MessageReader::next_message). The
/// internal buffer keeps a read cursor and reclaims consumed bytes
/// opportunistically, so feeding is amortized O(n).
#[derive(Debug, Default)]
pub struct MessageReader {
    buf: Vec<u8>,
    pos: usize,
}

impl MessageReader {
    /// Create an empty reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes received from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.compact();
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Extract the next complete message, if one is fully buffered.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A declared length
    /// below 4 triggers a one-byte resynchronization (with a logged
    /// warning) rather than an error.
    pub fn next_message(&mut self) -> Result<Option<BackendMessage>, FrameError> {
        loop {
            // Type byte + i32 length.
            if self.buffered() < 5 {
                return Ok(None);
            }

            let type_byte = self.buf[self.pos];
            let length = i32::from_be_bytes([
                self.buf[self.pos + 1],
                self.buf[self.pos + 2],
                self.buf[self.pos + 3],
                self.buf[self.pos + 4],
            ]);

            // The length includes its own 4 bytes; anything smaller cannot
            // be a frame boundary. Skip one byte and retry.
            if length < 4 {
                log::warn!(
                    "framing resync: dropping byte 0x{:02x} (declared length {})",
                    type_byte,
                    length
                );
                self.pos += 1;
                continue;
            }

            let length = length as u32;
            if length > MAX_MESSAGE_SIZE {
                return Err(FrameError::Oversized { length });
            }

            let total = 1 + length as usize;
            if self.buffered() < total {
                return Ok(None);
            }

            let body_start = self.pos + 5;
            let body_end = self.pos + total;
            let message = parse_message(type_byte, &self.buf[body_start..body_end])?;
            self.pos = body_end;
            self.compact();
            return Ok(Some(message));
        }
    }

    /// Release consumed bytes when everything is drained or the cursor has
    /// moved far enough to be worth the copy.
    fn compact(&mut self) {
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        } else if self.pos > COMPACT_THRESHOLD {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }
}

/// Parse a complete message body by its type byte.
fn parse_message(type_byte: u8, body: &[u8]) -> Result<BackendMessage, FrameError> {
    match type_byte {
        backend_type::AUTHENTICATION => parse_authentication(body),
        backend_type::PARAMETER_STATUS => {
            let mut parser = MessageParser::new(body);
            let name = parser.read_cstring();
            let value = parser.read_cstring();
            Ok(BackendMessage::ParameterStatus { name, value })
        }
        backend_type::BACKEND_KEY_DATA => {
            let mut parser = MessageParser::new(body);
            let process_id = parser
                .read_i32()
                .ok_or(FrameError::Truncated("backend process id"))?;
            let secret_key = parser
                .read_i32()
                .ok_or(FrameError::Truncated("backend secret key"))?;
            Ok(BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            })
        }
        backend_type::READY_FOR_QUERY => {
            let byte = *body.first().ok_or(FrameError::Truncated("transaction status"))?;
            let status =
                TransactionStatus::from_byte(byte).ok_or(FrameError::InvalidStatus(byte))?;
            Ok(BackendMessage::ReadyForQuery(status))
        }
        backend_type::ERROR_RESPONSE => Ok(BackendMessage::ErrorResponse(parse_fields(body))),
        backend_type::NOTICE_RESPONSE => Ok(BackendMessage::NoticeResponse(parse_fields(body))),
        backend_type::ROW_DESCRIPTION => Ok(BackendMessage::RowDescription(parse_row_description(
            body,
        ))),
        backend_type::DATA_ROW => Ok(BackendMessage::DataRow(parse_data_row(body))),
        backend_type::COMMAND_COMPLETE => {
            let mut parser = MessageParser::new(body);
            Ok(BackendMessage::CommandComplete(parser.read_cstring()))
        }
        backend_type::EMPTY_QUERY_RESPONSE => Ok(BackendMessage::EmptyQueryResponse),
        backend_type::NO_DATA => Ok(BackendMessage::NoData),
        other => Ok(BackendMessage::Other {
            type_byte: other,
            body: body.to_vec(),
        }),
    }
}

/// Parse an Authentication ('R') message body.
fn parse_authentication(body: &[u8]) -> Result<BackendMessage, FrameError> {
    let mut parser = MessageParser::new(body);
    let subtype = parser
        .read_i32()
        .ok_or(FrameError::Truncated("authentication subtype"))?;

    match subtype {
        auth_code::OK => Ok(BackendMessage::AuthenticationOk),
        auth_code::CLEARTEXT_PASSWORD => Ok(BackendMessage::AuthenticationCleartextPassword),
        auth_code::MD5_PASSWORD => {
            let salt = parser
                .read_bytes(4)
                .ok_or(FrameError::Truncated("MD5 salt"))?;
            let mut salt_arr = [0u8; 4];
            salt_arr.copy_from_slice(salt);
            Ok(BackendMessage::AuthenticationMD5Password(salt_arr))
        }
        auth_code::SASL => {
            // A sequence of NUL-terminated mechanism names ended by an
            // extra NUL.
            let mut mechanisms = Vec::new();
            while !parser.is_empty() {
                let mechanism = parser.read_cstring();
                if mechanism.is_empty() {
                    break;
                }
                mechanisms.push(mechanism);
            }
            Ok(BackendMessage::AuthenticationSASL(mechanisms))
        }
        auth_code::SASL_CONTINUE => Ok(BackendMessage::AuthenticationSASLContinue(
            parser.read_rest().to_vec(),
        )),
        auth_code::SASL_FINAL => Ok(BackendMessage::AuthenticationSASLFinal(
            parser.read_rest().to_vec(),
        )),
        other => Ok(BackendMessage::AuthenticationOther(other)),
    }
}

/// Parse the `(field code byte, C-string)` pairs of an ErrorResponse or
/// NoticeResponse, ending at a standalone NUL or end of body.
fn parse_fields(body: &[u8]) -> ErrorFields {
    let mut parser = MessageParser::new(body);
    let mut pairs = Vec::new();

    while let Some(code) = parser.read_u8() {
        if code == 0 {
            break;
        }
        let value = parser.read_cstring();
        pairs.push((code as char, value));
    }

    ErrorFields::from_pairs(pairs)
}

/// Parse a RowDescription body. Truncated input terminates the loop
/// cleanly, returning the fields read so far.
fn parse_row_description(body: &[u8]) -> Vec<FieldDescription> {
    let mut parser = MessageParser::new(body);
    let Some(count) = parser.read_i16() else {
        return Vec::new();
    };

    let mut fields = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        if parser.is_empty() {
            break;
        }
        let name = parser.read_cstring();
        let Some(table_oid) = parser.read_i32() else {
            break;
        };
        let Some(column_attr) = parser.read_i16() else {
            break;
        };
        let Some(type_oid) = parser.read_i32() else {
            break;
        };
        let Some(type_size) = parser.read_i16() else {
            break;
        };
        let Some(type_modifier) = parser.read_i32() else {
            break;
        };
        let Some(format) = parser.read_i16() else {
            break;
        };

        fields.push(FieldDescription {
            name,
            table_oid,
            column_attr,
            type_oid,
            type_size,
            type_modifier,
            format,
        });
    }
    fields
}

/// Parse a DataRow body. A column length of -1 denotes SQL NULL;
/// truncation stops parsing.
fn parse_data_row(body: &[u8]) -> Vec<Option<Vec<u8>>> {
    let mut parser = MessageParser::new(body);
    let Some(count) = parser.read_i16() else {
        return Vec::new();
    };

    let mut columns = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        let Some(len) = parser.read_i32() else {
            break;
        };
        if len < 0 {
            columns.push(None);
            continue;
        }
        let Some(bytes) = parser.read_bytes(len as usize) else {
            break;
        };
        columns.push(Some(bytes.to_vec()));
    }
    columns
}
