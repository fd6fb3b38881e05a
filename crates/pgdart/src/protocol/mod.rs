//! PostgreSQL wire protocol definitions.
//!
//! Message type constants, the frontend/backend message enums, and the
//! encoder/decoder for protocol version 3.0.
//!
//! Reference: <https://www.postgresql.org/docs/current/protocol-message-formats.html>

pub mod reader;
pub mod writer;

pub use reader::{FrameError, MessageReader};
pub use writer::MessageWriter;

use std::collections::HashMap;

/// PostgreSQL protocol version 3.0 (major=3, minor=0), encoded as
/// `(major << 16) | minor`.
pub const PROTOCOL_VERSION: i32 = 196608;

/// Frontend message type bytes (client -> server).
///
/// Kept separate from [`backend_type`] because several bytes (`S`, `D`,
/// `C`, `E`) carry different meanings in each direction; dispatch is
/// always by connection role. The extended-protocol types are defined for
/// completeness but no messages are built for them.
pub mod frontend_type {
    /// Password message ('p') - password or SASL response
    pub const PASSWORD: u8 = b'p';
    /// Simple query ('Q')
    pub const QUERY: u8 = b'Q';
    /// Terminate ('X')
    pub const TERMINATE: u8 = b'X';
    /// Parse ('P') - extended query protocol
    pub const PARSE: u8 = b'P';
    /// Bind ('B') - extended query protocol
    pub const BIND: u8 = b'B';
    /// Describe ('D') - extended query protocol
    pub const DESCRIBE: u8 = b'D';
    /// Execute ('E') - extended query protocol
    pub const EXECUTE: u8 = b'E';
    /// Close ('C') - extended query protocol
    pub const CLOSE: u8 = b'C';
    /// Sync ('S') - extended query protocol
    pub const SYNC: u8 = b'S';
    /// Flush ('H')
    pub const FLUSH: u8 = b'H';
}

/// Backend message type bytes (server -> client).
pub mod backend_type {
    /// Authentication request ('R')
    pub const AUTHENTICATION: u8 = b'R';
    /// Parameter status ('S')
    pub const PARAMETER_STATUS: u8 = b'S';
    /// Backend key data ('K')
    pub const BACKEND_KEY_DATA: u8 = b'K';
    /// Ready for query ('Z')
    pub const READY_FOR_QUERY: u8 = b'Z';
    /// Error response ('E')
    pub const ERROR_RESPONSE: u8 = b'E';
    /// Notice response ('N')
    pub const NOTICE_RESPONSE: u8 = b'N';
    /// Row description ('T')
    pub const ROW_DESCRIPTION: u8 = b'T';
    /// Data row ('D')
    pub const DATA_ROW: u8 = b'D';
    /// Command complete ('C')
    pub const COMMAND_COMPLETE: u8 = b'C';
    /// Empty query response ('I')
    pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
    /// No data ('n')
    pub const NO_DATA: u8 = b'n';
}

/// Authentication request subtype codes (body of an 'R' message).
pub mod auth_code {
    /// Authentication succeeded
    pub const OK: i32 = 0;
    /// Cleartext password requested
    pub const CLEARTEXT_PASSWORD: i32 = 3;
    /// MD5-hashed password requested (4 salt bytes follow)
    pub const MD5_PASSWORD: i32 = 5;
    /// SASL exchange requested (mechanism list follows)
    pub const SASL: i32 = 10;
    /// SASL continuation (server-first message)
    pub const SASL_CONTINUE: i32 = 11;
    /// SASL final (server-final message)
    pub const SASL_FINAL: i32 = 12;
}

/// Transaction status reported by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Not in a transaction block ('I')
    Idle,
    /// In a transaction block ('T')
    Transaction,
    /// In a failed transaction block ('E')
    Error,
}

impl TransactionStatus {
    /// Decode a ReadyForQuery status byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'I' => Some(TransactionStatus::Idle),
            b'T' => Some(TransactionStatus::Transaction),
            b'E' => Some(TransactionStatus::Error),
            _ => None,
        }
    }

    /// The wire byte for this status.
    pub const fn as_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::Transaction => b'T',
            TransactionStatus::Error => b'E',
        }
    }
}

/// One column of a RowDescription message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    /// Column name
    pub name: String,
    /// OID of the source table, or 0
    pub table_oid: i32,
    /// Attribute number within the source table, or 0
    pub column_attr: i16,
    /// OID of the column's data type
    pub type_oid: i32,
    /// Data type size (negative for variable-width types)
    pub type_size: i16,
    /// Type modifier
    pub type_modifier: i32,
    /// Format code: 0 = text, 1 = binary
    pub format: i16,
}

/// Fields of an ErrorResponse or NoticeResponse.
///
/// The server sends a sequence of `(field code byte, C-string)` pairs;
/// the full mapping is retained, with accessors for the common codes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    fields: HashMap<char, String>,
}

impl ErrorFields {
    /// Build from parsed (code, value) pairs. Later duplicates win.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (char, String)>) -> Self {
        Self {
            fields: pairs.into_iter().collect(),
        }
    }

    /// Get a raw field by its single-character code.
    pub fn get(&self, code: char) -> Option<&str> {
        self.fields.get(&code).map(String::as_str)
    }

    /// Severity ('S'), e.g. ERROR, FATAL, NOTICE.
    pub fn severity(&self) -> &str {
        self.get('S').unwrap_or("")
    }

    /// SQLSTATE code ('C').
    pub fn code(&self) -> &str {
        self.get('C').unwrap_or("")
    }

    /// Primary human-readable message ('M').
    pub fn message(&self) -> &str {
        self.get('M').unwrap_or("")
    }

    /// Optional detail ('D').
    pub fn detail(&self) -> Option<&str> {
        self.get('D')
    }

    /// Optional hint ('H').
    pub fn hint(&self) -> Option<&str> {
        self.get('H')
    }

    /// Error cursor position ('P'), 1-based character index into the query.
    pub fn position(&self) -> Option<u32> {
        self.get('P').and_then(|p| p.parse().ok())
    }

    /// The full field mapping.
    pub fn all(&self) -> &HashMap<char, String> {
        &self.fields
    }
}

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    /// The untyped startup frame that begins protocol negotiation.
    Startup {
        version: i32,
        params: Vec<(String, String)>,
    },
    /// Cleartext or MD5-hashed password (NUL-terminated body).
    PasswordMessage(String),
    /// SASL mechanism selection plus the client-first message.
    SASLInitialResponse { mechanism: String, data: Vec<u8> },
    /// A SASL continuation (client-final message; raw body, no terminator).
    SASLResponse(Vec<u8>),
    /// Simple query.
    Query(String),
    /// Graceful connection shutdown.
    Terminate,
}

/// Messages received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password([u8; 4]),
    /// SASL requested; carries the offered mechanism names.
    AuthenticationSASL(Vec<String>),
    /// SASL server-first message.
    AuthenticationSASLContinue(Vec<u8>),
    /// SASL server-final message.
    AuthenticationSASLFinal(Vec<u8>),
    /// An authentication subtype this client does not implement.
    AuthenticationOther(i32),
    ParameterStatus {
        name: String,
        value: String,
    },
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },
    ReadyForQuery(TransactionStatus),
    ErrorResponse(ErrorFields),
    NoticeResponse(ErrorFields),
    RowDescription(Vec<FieldDescription>),
    /// One result row; `None` entries are SQL NULL.
    DataRow(Vec<Option<Vec<u8>>>),
    /// Command tag, e.g. `SELECT 3` or `INSERT 0 1`.
    CommandComplete(String),
    EmptyQueryResponse,
    NoData,
    /// Any message type this client does not interpret; ignored.
    Other {
        type_byte: u8,
        body: Vec<u8>,
    },
}
