//! PostgreSQL message encoder.
//!
//! Encodes frontend messages into the wire format: a one-byte type tag
//! (except Startup), an i32 big-endian length that includes itself but not
//! the tag, and the message body.

#![allow(clippy::cast_possible_truncation)]

use super::{frontend_type, FrontendMessage};

/// Buffer for writing PostgreSQL protocol messages.
///
/// All multi-byte integers are written in big-endian (network) byte order.
#[derive(Debug, Clone, Default)]
pub struct MessageWriter {
    /// Internal buffer for message data
    buf: Vec<u8>,
}

impl MessageWriter {
    /// Create a new message writer.
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(1024),
        }
    }

    /// Get the current buffer contents.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Encode a frontend message into the buffer.
    ///
    /// Returns a slice to the encoded message data. The buffer is reused
    /// between calls; each call replaces the previous message.
    pub fn write(&mut self, msg: &FrontendMessage) -> &[u8] {
        self.buf.clear();

        match msg {
            FrontendMessage::Startup { version, params } => {
                self.write_startup(*version, params);
            }
            FrontendMessage::PasswordMessage(password) => {
                self.write_simple_string_message(frontend_type::PASSWORD, password);
            }
            FrontendMessage::SASLInitialResponse { mechanism, data } => {
                self.write_sasl_initial(mechanism, data);
            }
            FrontendMessage::SASLResponse(data) => {
                self.write_sasl_response(data);
            }
            FrontendMessage::Query(query) => {
                self.write_simple_string_message(frontend_type::QUERY, query);
            }
            FrontendMessage::Terminate => {
                self.write_empty_message(frontend_type::TERMINATE);
            }
        }

        &self.buf
    }

    // ==================== Message Encoders ====================

    /// Write a startup message (no type byte; length covers the whole frame).
    fn write_startup(&mut self, version: i32, params: &[(String, String)]) {
        let mut body_len = 4; // version
        for (key, value) in params {
            body_len += key.len() + 1 + value.len() + 1;
        }
        body_len += 1; // terminating null

        let total_len = (body_len + 4) as i32;
        self.buf.extend_from_slice(&total_len.to_be_bytes());
        self.buf.extend_from_slice(&version.to_be_bytes());

        for (key, value) in params {
            self.buf.extend_from_slice(key.as_bytes());
            self.buf.push(0);
            self.buf.extend_from_slice(value.as_bytes());
            self.buf.push(0);
        }

        self.buf.push(0);
    }

    /// Write a SASL initial response: mechanism name, then an i32-prefixed
    /// client-first payload (-1 when there is no payload).
    fn write_sasl_initial(&mut self, mechanism: &str, data: &[u8]) {
        self.buf.push(frontend_type::PASSWORD);

        let body_len = mechanism.len() + 1 + 4 + data.len();
        let total_len = (body_len + 4) as i32;
        self.buf.extend_from_slice(&total_len.to_be_bytes());

        self.buf.extend_from_slice(mechanism.as_bytes());
        self.buf.push(0);

        if data.is_empty() {
            self.buf.extend_from_slice(&(-1_i32).to_be_bytes());
        } else {
            let data_len = data.len() as i32;
            self.buf.extend_from_slice(&data_len.to_be_bytes());
            self.buf.extend_from_slice(data);
        }
    }

    /// Write a SASL response: raw payload, no terminator.
    fn write_sasl_response(&mut self, data: &[u8]) {
        self.buf.push(frontend_type::PASSWORD);
        let len = (data.len() + 4) as i32;
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(data);
    }

    // ==================== Helper Methods ====================

    /// Write a message with just a type byte and length (no body).
    fn write_empty_message(&mut self, type_byte: u8) {
        self.buf.push(type_byte);
        self.buf.extend_from_slice(&4_i32.to_be_bytes());
    }

    /// Write a message containing a single null-terminated string.
    fn write_simple_string_message(&mut self, type_byte: u8, s: &str) {
        self.buf.push(type_byte);
        let len = (s.len() + 5) as i32; // 4 for length + string + null
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }
}
