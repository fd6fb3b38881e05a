//! PostgreSQL connection implementation.
//!
//! This module implements the wire-protocol connection: TCP lifecycle,
//! the authentication state machine, the simple query protocol, and
//! graceful shutdown.
//!
//! The connection is blocking and single-threaded; at most one query is
//! in flight at a time. Server-initiated ParameterStatus and
//! NoticeResponse messages may arrive interleaved with query responses
//! and are absorbed without advancing the query state machine.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use pgdart_core::error::{
    ConnectionError, ConnectionErrorKind, Error, ProtocolError, QueryError, QueryErrorKind, Result,
};
use pgdart_core::{ColumnInfo, Row, Value};

use crate::auth::{ScramClient, SCRAM_SHA_256};
use crate::config::PgConfig;
use crate::protocol::{
    BackendMessage, ErrorFields, FieldDescription, FrontendMessage, MessageReader, MessageWriter,
    TransactionStatus, PROTOCOL_VERSION,
};

/// How long `close` waits for the server to finish the shutdown handshake.
const CLOSE_DRAIN_WINDOW: Duration = Duration::from_millis(250);

/// Connection state in the protocol state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// TCP connection established, startup sent
    Connecting,
    /// Performing the authentication handshake
    Authenticating,
    /// Idle; a query may be sent
    Ready(TransactionStatusState),
    /// Query sent, draining responses
    Busy,
    /// Unusable after a fatal error; reconnect required
    Failed,
    /// Connection has been closed
    Closed,
}

/// Transaction status from the server's ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatusState {
    /// Not in a transaction block ('I')
    #[default]
    Idle,
    /// In a transaction block ('T')
    InTransaction,
    /// In a failed transaction block ('E')
    InFailed,
}

impl From<TransactionStatus> for TransactionStatusState {
    fn from(status: TransactionStatus) -> Self {
        match status {
            TransactionStatus::Idle => TransactionStatusState::Idle,
            TransactionStatus::Transaction => TransactionStatusState::InTransaction,
            TransactionStatus::Error => TransactionStatusState::InFailed,
        }
    }
}

/// The result of one simple query.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Result rows, in server order
    pub rows: Vec<Row>,
    /// Column descriptors of the result set (empty for commands)
    pub fields: Vec<FieldDescription>,
    /// The command verb, e.g. `SELECT`, `INSERT`, `EMPTY`
    pub command: String,
    /// Rows affected or returned, per the command tag
    pub row_count: u64,
    /// The raw command tag as sent by the server
    pub command_tag: String,
    /// Inserted row OID (single-row INSERT into a WITH OIDS table; else None)
    pub oid: Option<u32>,
}

/// A blocking PostgreSQL connection.
///
/// Manages a TCP connection to a PostgreSQL server, handling framing,
/// authentication, and state tracking. Obtain one with
/// [`PgConnection::connect`], run queries with [`query`](Self::query),
/// and shut down with [`close`](Self::close).
pub struct PgConnection {
    /// TCP stream to the server
    stream: TcpStream,
    /// Current connection state
    state: ConnectionState,
    /// Backend process ID (for out-of-band cancellation)
    process_id: i32,
    /// Secret key (for out-of-band cancellation)
    secret_key: i32,
    /// Server parameters from ParameterStatus messages; last write wins
    parameters: HashMap<String, String>,
    /// Connection configuration
    config: PgConfig,
    /// Incremental backend message reader
    reader: MessageReader,
    /// Frontend message encoder
    writer: MessageWriter,
    /// Scratch buffer for socket reads
    read_buf: Vec<u8>,
}

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection")
            .field("state", &self.state)
            .field("process_id", &self.process_id)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("database", &self.config.database)
            .finish_non_exhaustive()
    }
}

impl PgConnection {
    /// Establish a new connection to the PostgreSQL server.
    ///
    /// This performs the complete handshake: TCP connect, startup message,
    /// authentication, and the parameter/key exchange up to the server's
    /// first ReadyForQuery.
    pub fn connect(config: PgConfig) -> Result<Self> {
        let stream = open_stream(&config)?;
        stream.set_nodelay(true).ok();
        stream.set_read_timeout(Some(config.connect_timeout)).ok();
        stream.set_write_timeout(Some(config.connect_timeout)).ok();

        let mut conn = Self {
            stream,
            state: ConnectionState::Connecting,
            process_id: 0,
            secret_key: 0,
            parameters: HashMap::new(),
            config,
            reader: MessageReader::new(),
            writer: MessageWriter::new(),
            read_buf: vec![0u8; 8192],
        };

        let params = conn.config.startup_params();
        conn.send_message(&FrontendMessage::Startup {
            version: PROTOCOL_VERSION,
            params,
        })?;
        conn.state = ConnectionState::Authenticating;

        if let Err(e) = conn.handle_auth() {
            conn.teardown();
            return Err(e);
        }
        if let Err(e) = conn.read_startup_messages() {
            conn.teardown();
            return Err(e);
        }

        Ok(conn)
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Check if the connection is idle and may accept a query.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, ConnectionState::Ready(_))
    }

    /// Get the backend process ID.
    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    /// Get the backend secret key.
    pub fn secret_key(&self) -> i32 {
        self.secret_key
    }

    /// Get a server parameter value (e.g. `server_version`).
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Get all server parameters.
    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }

    /// Execute a simple query and collect its full result.
    ///
    /// A server-reported error fails the query but leaves the connection
    /// usable once the server's following ReadyForQuery has been
    /// consumed. A timeout leaves the connection in the `Failed` state,
    /// because the frame boundary is unknown.
    pub fn query(&mut self, sql: &str) -> Result<QueryResult> {
        match self.state {
            ConnectionState::Ready(_) => {}
            ConnectionState::Busy
            | ConnectionState::Connecting
            | ConnectionState::Authenticating => {
                return Err(Error::Usage("connection not ready for query".to_string()));
            }
            ConnectionState::Failed => {
                return Err(Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Disconnected,
                    message: "connection is in a failed state; reconnect required".to_string(),
                    source: None,
                }));
            }
            ConnectionState::Closed | ConnectionState::Disconnected => {
                return Err(Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Disconnected,
                    message: "connection is closed".to_string(),
                    source: None,
                }));
            }
        }

        self.stream
            .set_read_timeout(Some(self.config.query_timeout))
            .ok();
        self.state = ConnectionState::Busy;
        self.send_message(&FrontendMessage::Query(sql.to_string()))?;

        let mut columns: Option<Arc<ColumnInfo>> = None;
        let mut field_descs: Vec<FieldDescription> = Vec::new();
        let mut rows: Vec<Row> = Vec::new();
        let mut command_tag: Option<String> = None;
        let mut empty_query = false;
        let mut server_error: Option<ErrorFields> = None;
        let ready_status;

        loop {
            match self.receive_message()? {
                BackendMessage::RowDescription(desc) => {
                    if server_error.is_none() {
                        let names = desc.iter().map(|f| f.name.clone()).collect();
                        columns = Some(Arc::new(ColumnInfo::new(names)));
                        field_descs = desc;
                    }
                }
                BackendMessage::DataRow(raw) => {
                    // After an error, remaining responses are drained
                    // without interpretation until ReadyForQuery.
                    if server_error.is_some() {
                        continue;
                    }
                    let Some(cols) = &columns else {
                        self.state = ConnectionState::Failed;
                        return Err(protocol_error("DataRow received before RowDescription"));
                    };
                    if raw.len() != field_descs.len() {
                        self.state = ConnectionState::Failed;
                        return Err(protocol_error(
                            "DataRow column count does not match RowDescription",
                        ));
                    }
                    let values = raw
                        .into_iter()
                        .zip(&field_descs)
                        .map(|(value, field)| decode_column(value, field))
                        .collect();
                    rows.push(Row::with_columns(Arc::clone(cols), values));
                }
                BackendMessage::CommandComplete(tag) => command_tag = Some(tag),
                BackendMessage::EmptyQueryResponse => empty_query = true,
                BackendMessage::NoData => {}
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.process_id = process_id;
                    self.secret_key = secret_key;
                }
                BackendMessage::NoticeResponse(notice) => log_notice(&notice),
                BackendMessage::ErrorResponse(fields) => server_error = Some(fields),
                BackendMessage::ReadyForQuery(status) => {
                    self.state = ConnectionState::Ready(status.into());
                    ready_status = status;
                    break;
                }
                _ => {}
            }
        }

        if let Some(fields) = server_error {
            return Err(error_from_fields(&fields, Some(sql)));
        }

        let (command, row_count, oid, tag) = match (command_tag, empty_query) {
            (Some(tag), _) => {
                let (command, row_count, oid) = parse_command_tag(&tag);
                (command, row_count, oid, tag)
            }
            (None, true) => ("EMPTY".to_string(), 0, None, "EMPTY".to_string()),
            (None, false) if ready_status == TransactionStatus::Idle => {
                ("EMPTY".to_string(), 0, None, String::new())
            }
            (None, false) => ("UNKNOWN".to_string(), 0, None, String::new()),
        };

        Ok(QueryResult {
            rows,
            fields: field_descs,
            command,
            row_count,
            command_tag: tag,
            oid,
        })
    }

    /// Close the connection gracefully: send Terminate, half-close the
    /// write side, and wait briefly for the server to hang up.
    /// Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if matches!(
            self.state,
            ConnectionState::Closed | ConnectionState::Disconnected
        ) {
            return Ok(());
        }

        // Best effort from here on; the socket may already be dead.
        let terminate = self.writer.write(&FrontendMessage::Terminate).to_vec();
        let _ = self.stream.write_all(&terminate);
        let _ = self.stream.flush();
        let _ = self.stream.shutdown(Shutdown::Write);

        let _ = self.stream.set_read_timeout(Some(CLOSE_DRAIN_WINDOW));
        let mut buf = [0u8; 512];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }

        self.state = ConnectionState::Closed;
        Ok(())
    }

    // ==================== Authentication ====================

    fn require_password(&self, message: &str) -> Result<&str> {
        self.config
            .password
            .as_deref()
            .ok_or_else(|| auth_error(message.to_string()))
    }

    fn handle_auth(&mut self) -> Result<()> {
        loop {
            match self.receive_message()? {
                BackendMessage::AuthenticationOk => return Ok(()),
                BackendMessage::AuthenticationCleartextPassword => {
                    let password = self
                        .require_password("password required for cleartext authentication")?
                        .to_string();
                    self.send_message(&FrontendMessage::PasswordMessage(password))?;
                }
                BackendMessage::AuthenticationMD5Password(salt) => {
                    let password =
                        self.require_password("password required for MD5 authentication")?;
                    let hash = md5_password(&self.config.user, password, salt);
                    self.send_message(&FrontendMessage::PasswordMessage(hash))?;
                }
                BackendMessage::AuthenticationSASL(mechanisms) => {
                    if mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                        self.scram_auth()?;
                    } else {
                        return Err(auth_error(format!(
                            "no supported SASL mechanism offered; server offered {:?}",
                            mechanisms
                        )));
                    }
                }
                BackendMessage::AuthenticationOther(subtype) => {
                    return Err(auth_error(format!(
                        "unsupported authentication type {}",
                        subtype
                    )));
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::NoticeResponse(notice) => log_notice(&notice),
                BackendMessage::ErrorResponse(fields) => {
                    return Err(error_from_fields(&fields, None));
                }
                other => {
                    return Err(protocol_error(format!(
                        "unexpected message during authentication: {:?}",
                        other
                    )));
                }
            }
        }
    }

    /// Run the SCRAM-SHA-256 exchange. The concluding AuthenticationOk is
    /// consumed by the caller's loop.
    fn scram_auth(&mut self) -> Result<()> {
        let password = self
            .require_password("password required for SCRAM-SHA-256 authentication")?
            .to_string();
        let mut client = ScramClient::new(&self.config.user, &password);

        self.send_message(&FrontendMessage::SASLInitialResponse {
            mechanism: SCRAM_SHA_256.to_string(),
            data: client.client_first(),
        })?;

        let server_first = match self.receive_message()? {
            BackendMessage::AuthenticationSASLContinue(data) => data,
            BackendMessage::ErrorResponse(fields) => {
                return Err(error_from_fields(&fields, None));
            }
            other => {
                return Err(protocol_error(format!(
                    "expected SASL continue, got {:?}",
                    other
                )));
            }
        };

        let client_final = client.process_server_first(&server_first)?;
        self.send_message(&FrontendMessage::SASLResponse(client_final))?;

        let server_final = match self.receive_message()? {
            BackendMessage::AuthenticationSASLFinal(data) => data,
            BackendMessage::ErrorResponse(fields) => {
                return Err(error_from_fields(&fields, None));
            }
            other => {
                return Err(protocol_error(format!(
                    "expected SASL final, got {:?}",
                    other
                )));
            }
        };

        client.verify_server_final(&server_final)
    }

    /// Drain BackendKeyData / ParameterStatus until the first
    /// ReadyForQuery after authentication.
    fn read_startup_messages(&mut self) -> Result<()> {
        loop {
            match self.receive_message()? {
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.process_id = process_id;
                    self.secret_key = secret_key;
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::ReadyForQuery(status) => {
                    self.state = ConnectionState::Ready(status.into());
                    return Ok(());
                }
                BackendMessage::NoticeResponse(notice) => log_notice(&notice),
                BackendMessage::ErrorResponse(fields) => {
                    return Err(error_from_fields(&fields, None));
                }
                other => {
                    return Err(protocol_error(format!(
                        "unexpected startup message: {:?}",
                        other
                    )));
                }
            }
        }
    }

    // ==================== Low-Level I/O ====================

    fn send_message(&mut self, msg: &FrontendMessage) -> Result<()> {
        let data = self.writer.write(msg);
        if let Err(e) = self.stream.write_all(data).and_then(|()| self.stream.flush()) {
            self.state = ConnectionState::Failed;
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Disconnected,
                message: format!("failed to write to server: {}", e),
                source: Some(Box::new(e)),
            }));
        }
        Ok(())
    }

    fn receive_message(&mut self) -> Result<BackendMessage> {
        loop {
            match self.reader.next_message() {
                Ok(Some(msg)) => return Ok(msg),
                Ok(None) => {}
                Err(e) => {
                    self.state = ConnectionState::Failed;
                    return Err(Error::Protocol(ProtocolError {
                        message: format!("framing error: {}", e),
                        raw_data: None,
                        source: Some(Box::new(e)),
                    }));
                }
            }

            let n = match self.stream.read(&mut self.read_buf) {
                Ok(n) => n,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                    ) =>
                {
                    self.state = ConnectionState::Failed;
                    return Err(Error::Timeout);
                }
                Err(e) => {
                    self.state = ConnectionState::Failed;
                    return Err(Error::Connection(ConnectionError {
                        kind: ConnectionErrorKind::Disconnected,
                        message: format!("failed to read from server: {}", e),
                        source: Some(Box::new(e)),
                    }));
                }
            };

            if n == 0 {
                self.state = ConnectionState::Disconnected;
                return Err(Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Disconnected,
                    message: "connection closed by server".to_string(),
                    source: None,
                }));
            }

            self.reader.feed(&self.read_buf[..n]);
        }
    }

    /// Mark the connection unusable and tear the socket down.
    fn teardown(&mut self) {
        self.state = ConnectionState::Failed;
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        // Try to close gracefully, ignore errors.
        let _ = self.close();
    }
}

// ==================== Helper Functions ====================

/// Resolve the configured host and open a TCP stream within the timeout.
fn open_stream(config: &PgConfig) -> Result<TcpStream> {
    let addr_string = config.socket_addr();
    let addrs: Vec<SocketAddr> = addr_string
        .to_socket_addrs()
        .map_err(|e| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: format!("failed to resolve {}: {}", addr_string, e),
                source: Some(Box::new(e)),
            })
        })?
        .collect();

    let mut last_err: Option<std::io::Error> = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, config.connect_timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }

    let kind = match &last_err {
        Some(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            ConnectionErrorKind::Refused
        }
        _ => ConnectionErrorKind::Connect,
    };
    let message = match &last_err {
        Some(e) => format!("failed to connect to {}: {}", addr_string, e),
        None => format!("no addresses resolved for {}", addr_string),
    };
    Err(Error::Connection(ConnectionError {
        kind,
        message,
        source: last_err.map(|e| Box::new(e) as _),
    }))
}

/// Decode one column of a DataRow according to its field format.
fn decode_column(value: Option<Vec<u8>>, field: &FieldDescription) -> Value {
    match value {
        None => Value::Null,
        Some(bytes) if field.format == 0 => {
            Value::Text(String::from_utf8_lossy(&bytes).into_owned())
        }
        Some(bytes) => Value::Bytes(bytes),
    }
}

/// Parse a CommandComplete tag into (command, row count, oid).
///
/// `INSERT <oid> <rows>` is the three-token special case; otherwise the
/// last token is taken as the row count when numeric, 0 when not.
fn parse_command_tag(tag: &str) -> (String, u64, Option<u32>) {
    let tokens: Vec<&str> = tag.split_ascii_whitespace().collect();

    if tokens.len() == 3 && tokens[0].eq_ignore_ascii_case("INSERT") {
        let oid = tokens[1].parse().ok();
        let row_count = tokens[2].parse().unwrap_or(0);
        return (tokens[0].to_string(), row_count, oid);
    }

    let row_count = tokens
        .last()
        .and_then(|t| t.parse().ok())
        .unwrap_or(0);
    let command = tokens.first().map_or_else(String::new, |t| t.to_string());
    (command, row_count, None)
}

/// Compute the MD5 password hash: `"md5" + md5(md5(password + user) + salt)`.
fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    use std::fmt::Write;

    let inner = format!("{}{}", password, user);
    let inner_hash = md5::compute(inner.as_bytes());

    let mut outer_input = format!("{:x}", inner_hash).into_bytes();
    outer_input.extend_from_slice(&salt);
    let outer_hash = md5::compute(&outer_input);

    let mut result = String::with_capacity(35);
    result.push_str("md5");
    write!(&mut result, "{:x}", outer_hash).unwrap();
    result
}

/// Surface a NoticeResponse. Notices are informational and never fail a
/// query; they go to the log sink.
fn log_notice(notice: &ErrorFields) {
    log::info!("server notice: {} {}", notice.severity(), notice.message());
}

fn auth_error(msg: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Authentication,
        message: msg.into(),
        source: None,
    })
}

fn protocol_error(msg: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError {
        message: msg.into(),
        raw_data: None,
        source: None,
    })
}

/// Classify a server ErrorResponse by SQLSTATE class, carrying the full
/// field mapping.
fn error_from_fields(fields: &ErrorFields, sql: Option<&str>) -> Error {
    let code = fields.code();
    let kind = match code.get(..2) {
        Some("08") => {
            // Connection exception
            return Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: fields.message().to_string(),
                source: None,
            });
        }
        Some("28") => {
            // Invalid authorization specification
            return Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Authentication,
                message: fields.message().to_string(),
                source: None,
            });
        }
        Some("42") => QueryErrorKind::Syntax,
        Some("23") => QueryErrorKind::Constraint,
        Some("40") => {
            if code == "40001" {
                QueryErrorKind::Serialization
            } else {
                QueryErrorKind::Deadlock
            }
        }
        Some("57") => {
            if code == "57014" {
                QueryErrorKind::Cancelled
            } else {
                QueryErrorKind::Timeout
            }
        }
        _ => QueryErrorKind::Database,
    };

    Error::Query(QueryError {
        kind,
        sql: sql.map(str::to_string),
        sqlstate: (!code.is_empty()).then(|| code.to_string()),
        message: fields.message().to_string(),
        detail: fields.detail().map(str::to_string),
        hint: fields.hint().map(str::to_string),
        position: fields.position().map(|p| p as usize),
        fields: fields.all().clone(),
        source: None,
    })
}
