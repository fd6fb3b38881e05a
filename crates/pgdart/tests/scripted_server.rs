//! End-to-end tests against a scripted PostgreSQL server.
//!
//! Each test binds a loopback listener and runs a server script on a
//! thread: it reads the client's startup and query frames, asserts their
//! shape, and replies with hand-built backend frames. This exercises the
//! full connect/auth/query/close paths deterministically, without a live
//! database.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256};

use pgdart::{ConnectionErrorKind, Error, PgConfig, PgConnection, Value};

// ==================== Backend frame builders ====================

fn frame(type_byte: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![type_byte];
    out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn cstr(s: &str) -> Vec<u8> {
    let mut out = s.as_bytes().to_vec();
    out.push(0);
    out
}

fn auth_frame(subtype: i32, extra: &[u8]) -> Vec<u8> {
    let mut body = subtype.to_be_bytes().to_vec();
    body.extend_from_slice(extra);
    frame(b'R', &body)
}

fn parameter_status(name: &str, value: &str) -> Vec<u8> {
    let mut body = cstr(name);
    body.extend_from_slice(&cstr(value));
    frame(b'S', &body)
}

fn backend_key_data(process_id: i32, secret_key: i32) -> Vec<u8> {
    let mut body = process_id.to_be_bytes().to_vec();
    body.extend_from_slice(&secret_key.to_be_bytes());
    frame(b'K', &body)
}

fn ready(status: u8) -> Vec<u8> {
    frame(b'Z', &[status])
}

fn row_description(names: &[&str]) -> Vec<u8> {
    let mut body = (names.len() as i16).to_be_bytes().to_vec();
    for name in names {
        body.extend_from_slice(&cstr(name));
        body.extend_from_slice(&0_i32.to_be_bytes()); // table oid
        body.extend_from_slice(&0_i16.to_be_bytes()); // attribute number
        body.extend_from_slice(&25_i32.to_be_bytes()); // text type oid
        body.extend_from_slice(&(-1_i16).to_be_bytes()); // type size
        body.extend_from_slice(&(-1_i32).to_be_bytes()); // type modifier
        body.extend_from_slice(&0_i16.to_be_bytes()); // text format
    }
    frame(b'T', &body)
}

fn data_row(values: &[Option<&str>]) -> Vec<u8> {
    let mut body = (values.len() as i16).to_be_bytes().to_vec();
    for value in values {
        match value {
            Some(text) => {
                body.extend_from_slice(&(text.len() as i32).to_be_bytes());
                body.extend_from_slice(text.as_bytes());
            }
            None => body.extend_from_slice(&(-1_i32).to_be_bytes()),
        }
    }
    frame(b'D', &body)
}

fn command_complete(tag: &str) -> Vec<u8> {
    frame(b'C', &cstr(tag))
}

fn error_response(fields: &[(u8, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (code, value) in fields {
        body.push(*code);
        body.extend_from_slice(&cstr(value));
    }
    body.push(0);
    frame(b'E', &body)
}

fn notice_response(fields: &[(u8, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (code, value) in fields {
        body.push(*code);
        body.extend_from_slice(&cstr(value));
    }
    body.push(0);
    frame(b'N', &body)
}

// ==================== Server-side frame reading ====================

fn read_exact_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).unwrap();
    buf
}

fn read_startup(stream: &mut TcpStream) -> HashMap<String, String> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).unwrap();
    let len = i32::from_be_bytes(len_bytes) as usize;
    let rest = read_exact_n(stream, len - 4);

    let version = i32::from_be_bytes(rest[..4].try_into().unwrap());
    assert_eq!(version, 196608, "startup must carry protocol version 3.0");

    let mut params = HashMap::new();
    let mut pos = 4;
    while pos < rest.len() && rest[pos] != 0 {
        let key_end = pos + rest[pos..].iter().position(|&b| b == 0).unwrap();
        let key = String::from_utf8(rest[pos..key_end].to_vec()).unwrap();
        pos = key_end + 1;
        let val_end = pos + rest[pos..].iter().position(|&b| b == 0).unwrap();
        let value = String::from_utf8(rest[pos..val_end].to_vec()).unwrap();
        pos = val_end + 1;
        params.insert(key, value);
    }
    params
}

fn read_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let header = read_exact_n(stream, 5);
    let len = i32::from_be_bytes(header[1..5].try_into().unwrap()) as usize;
    let body = read_exact_n(stream, len - 4);
    (header[0], body)
}

fn expect_query(stream: &mut TcpStream, expected_sql: &str) {
    let (type_byte, body) = read_frame(stream);
    assert_eq!(type_byte, b'Q');
    assert_eq!(body, [expected_sql.as_bytes(), &[0][..]].concat());
}

fn expect_terminate(stream: &mut TcpStream) {
    let (type_byte, body) = read_frame(stream);
    assert_eq!(type_byte, b'X');
    assert!(body.is_empty());
}

/// Complete a trust (no-password) handshake, asserting the startup
/// parameters the client is required to send.
fn trust_handshake(stream: &mut TcpStream) {
    let params = read_startup(stream);
    assert_eq!(params.get("user").map(String::as_str), Some("postgres"));
    assert_eq!(params.get("database").map(String::as_str), Some("testdb"));
    assert_eq!(params.get("client_encoding").map(String::as_str), Some("UTF8"));

    let mut out = auth_frame(0, &[]);
    out.extend_from_slice(&parameter_status("server_version", "16.3"));
    out.extend_from_slice(&parameter_status("client_encoding", "UTF8"));
    out.extend_from_slice(&parameter_status("DateStyle", "ISO, MDY"));
    out.extend_from_slice(&backend_key_data(4242, 1717));
    out.extend_from_slice(&ready(b'I'));
    stream.write_all(&out).unwrap();
}

fn spawn_server<F>(script: F) -> (u16, JoinHandle<()>)
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        script(stream);
    });
    (port, handle)
}

fn test_config(port: u16) -> PgConfig {
    PgConfig::new("127.0.0.1", "postgres", "testdb")
        .port(port)
        .connect_timeout(Duration::from_secs(5))
        .query_timeout(Duration::from_secs(5))
}

// ==================== SCRAM server ====================

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Run the server side of a SCRAM-SHA-256 exchange, verifying the client
/// proof against `expected_password`. Returns true on success (and
/// completes the handshake); on mismatch sends a 28P01 error and returns
/// false.
fn scram_handshake(stream: &mut TcpStream, expected_password: &str) -> bool {
    let _params = read_startup(stream);

    // Offer SCRAM-SHA-256.
    let mut mechanisms = cstr("SCRAM-SHA-256");
    mechanisms.push(0);
    stream.write_all(&auth_frame(10, &mechanisms)).unwrap();

    // SASLInitialResponse: mechanism, i32 payload length, client-first.
    let (type_byte, body) = read_frame(stream);
    assert_eq!(type_byte, b'p');
    let nul = body.iter().position(|&b| b == 0).unwrap();
    assert_eq!(&body[..nul], b"SCRAM-SHA-256");
    let len_start = nul + 1;
    let payload_len =
        i32::from_be_bytes(body[len_start..len_start + 4].try_into().unwrap()) as usize;
    let client_first =
        String::from_utf8(body[len_start + 4..len_start + 4 + payload_len].to_vec()).unwrap();

    let client_first_bare = client_first.strip_prefix("n,,").unwrap().to_string();
    let client_nonce = client_first_bare.split_once(",r=").unwrap().1.to_string();

    // Server-first.
    let server_nonce = format!("{}3rfcNHYJY1ZVvWVs7j", client_nonce);
    let salt = b"pgdart-test-salt";
    let iterations = 4096u32;
    let server_first = format!(
        "r={},s={},i={}",
        server_nonce,
        BASE64.encode(salt),
        iterations
    );
    stream
        .write_all(&auth_frame(11, server_first.as_bytes()))
        .unwrap();

    // Client-final; verify the proof.
    let (type_byte, body) = read_frame(stream);
    assert_eq!(type_byte, b'p');
    let client_final = String::from_utf8(body).unwrap();
    let (without_proof, proof_b64) = client_final.rsplit_once(",p=").unwrap();
    assert!(without_proof.starts_with("c=biws,r="));
    let proof = BASE64.decode(proof_b64).unwrap();

    let mut salted = [0u8; 32];
    pbkdf2_hmac::<Sha256>(expected_password.as_bytes(), salt, iterations, &mut salted);
    let client_key = hmac_sha256(&salted, b"Client Key");
    let stored_key: [u8; 32] = Sha256::digest(&client_key).into();
    let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);
    let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
    let expected_proof: Vec<u8> = client_key
        .iter()
        .zip(client_signature.iter())
        .map(|(a, b)| a ^ b)
        .collect();

    if proof != expected_proof {
        let err = error_response(&[
            (b'S', "FATAL"),
            (b'C', "28P01"),
            (b'M', "password authentication failed for user \"postgres\""),
        ]);
        stream.write_all(&err).unwrap();
        return false;
    }

    // Server-final + completion.
    let server_key = hmac_sha256(&salted, b"Server Key");
    let server_signature = hmac_sha256(&server_key, auth_message.as_bytes());
    let server_final = format!("v={}", BASE64.encode(server_signature));
    let mut out = auth_frame(12, server_final.as_bytes());
    out.extend_from_slice(&auth_frame(0, &[]));
    out.extend_from_slice(&parameter_status("server_version", "16.3"));
    out.extend_from_slice(&backend_key_data(7, 8));
    out.extend_from_slice(&ready(b'I'));
    stream.write_all(&out).unwrap();
    true
}

// ==================== Tests ====================

#[test]
fn connect_and_select_row() {
    let (port, server) = spawn_server(|mut stream| {
        trust_handshake(&mut stream);
        expect_query(&mut stream, "SELECT 1 AS n");

        let mut out = row_description(&["n"]);
        out.extend_from_slice(&data_row(&[Some("1")]));
        out.extend_from_slice(&command_complete("SELECT 1"));
        out.extend_from_slice(&ready(b'I'));
        stream.write_all(&out).unwrap();

        expect_terminate(&mut stream);
    });

    let mut conn = PgConnection::connect(test_config(port)).unwrap();
    assert!(conn.is_ready());
    assert_eq!(conn.parameter("server_version"), Some("16.3"));
    assert_eq!(conn.parameter("DateStyle"), Some("ISO, MDY"));
    assert_eq!(conn.process_id(), 4242);
    assert_eq!(conn.secret_key(), 1717);

    let result = conn.query("SELECT 1 AS n").unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0].get_str("n"), Some("1"));
    assert_eq!(result.command, "SELECT");
    assert_eq!(result.row_count, 1);
    assert_eq!(result.command_tag, "SELECT 1");
    assert_eq!(result.oid, None);
    assert_eq!(result.fields.len(), 1);
    assert_eq!(result.fields[0].name, "n");
    assert!(conn.is_ready());

    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn null_and_text_columns() {
    let (port, server) = spawn_server(|mut stream| {
        trust_handshake(&mut stream);
        expect_query(&mut stream, "SELECT NULL AS a, 'x' AS b");

        let mut out = row_description(&["a", "b"]);
        out.extend_from_slice(&data_row(&[None, Some("x")]));
        out.extend_from_slice(&command_complete("SELECT 1"));
        out.extend_from_slice(&ready(b'I'));
        stream.write_all(&out).unwrap();

        expect_terminate(&mut stream);
    });

    let mut conn = PgConnection::connect(test_config(port)).unwrap();
    let result = conn.query("SELECT NULL AS a, 'x' AS b").unwrap();
    assert_eq!(result.rows[0].get_by_name("a"), Some(&Value::Null));
    assert_eq!(result.rows[0].get_str("b"), Some("x"));
    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn empty_query_synthesizes_empty_command() {
    let (port, server) = spawn_server(|mut stream| {
        trust_handshake(&mut stream);
        expect_query(&mut stream, "");

        let mut out = frame(b'I', &[]);
        out.extend_from_slice(&ready(b'I'));
        stream.write_all(&out).unwrap();

        expect_terminate(&mut stream);
    });

    let mut conn = PgConnection::connect(test_config(port)).unwrap();
    let result = conn.query("").unwrap();
    assert_eq!(result.command, "EMPTY");
    assert_eq!(result.row_count, 0);
    assert!(result.rows.is_empty());
    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn server_error_then_recovery() {
    let (port, server) = spawn_server(|mut stream| {
        trust_handshake(&mut stream);

        expect_query(&mut stream, "SELECT * FROM __nope__");
        let mut out = error_response(&[
            (b'S', "ERROR"),
            (b'C', "42P01"),
            (b'M', "relation \"__nope__\" does not exist"),
            (b'P', "15"),
        ]);
        out.extend_from_slice(&ready(b'I'));
        stream.write_all(&out).unwrap();

        expect_query(&mut stream, "SELECT 2");
        let mut out = row_description(&["?column?"]);
        out.extend_from_slice(&data_row(&[Some("2")]));
        out.extend_from_slice(&command_complete("SELECT 1"));
        out.extend_from_slice(&ready(b'I'));
        stream.write_all(&out).unwrap();

        expect_terminate(&mut stream);
    });

    let mut conn = PgConnection::connect(test_config(port)).unwrap();

    let err = conn.query("SELECT * FROM __nope__").unwrap_err();
    assert_eq!(err.sqlstate(), Some("42P01"));
    assert!(err.is_recoverable());
    let Error::Query(q) = &err else {
        panic!("expected a query error, got {:?}", err);
    };
    assert_eq!(q.position, Some(15));

    // The connection is usable again after the server's ReadyForQuery.
    assert!(conn.is_ready());
    let result = conn.query("SELECT 2").unwrap();
    assert_eq!(result.rows[0].get(0), Some(&Value::Text("2".to_string())));

    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn rows_arrive_in_order() {
    let (port, server) = spawn_server(|mut stream| {
        trust_handshake(&mut stream);
        expect_query(
            &mut stream,
            "SELECT 1 UNION ALL SELECT 2 UNION ALL SELECT 3",
        );

        let mut out = row_description(&["?column?"]);
        for value in ["1", "2", "3"] {
            out.extend_from_slice(&data_row(&[Some(value)]));
        }
        out.extend_from_slice(&command_complete("SELECT 3"));
        out.extend_from_slice(&ready(b'I'));
        stream.write_all(&out).unwrap();

        expect_terminate(&mut stream);
    });

    let mut conn = PgConnection::connect(test_config(port)).unwrap();
    let result = conn
        .query("SELECT 1 UNION ALL SELECT 2 UNION ALL SELECT 3")
        .unwrap();
    assert_eq!(result.row_count, 3);
    let values: Vec<_> = result
        .rows
        .iter()
        .map(|row| row.get(0).unwrap().as_str().unwrap().to_string())
        .collect();
    assert_eq!(values, vec!["1", "2", "3"]);
    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn scram_authentication_succeeds() {
    let (port, server) = spawn_server(|mut stream| {
        assert!(scram_handshake(&mut stream, "postgres"));
        expect_query(&mut stream, "SELECT 1");

        let mut out = row_description(&["?column?"]);
        out.extend_from_slice(&data_row(&[Some("1")]));
        out.extend_from_slice(&command_complete("SELECT 1"));
        out.extend_from_slice(&ready(b'I'));
        stream.write_all(&out).unwrap();

        expect_terminate(&mut stream);
    });

    let config = test_config(port).password("postgres");
    let mut conn = PgConnection::connect(config).unwrap();
    assert!(conn.is_ready());
    let result = conn.query("SELECT 1").unwrap();
    assert_eq!(result.row_count, 1);
    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn scram_wrong_password_rejects() {
    let (port, server) = spawn_server(|mut stream| {
        assert!(!scram_handshake(&mut stream, "postgres"));
    });

    let config = test_config(port).password("not-the-password");
    let err = PgConnection::connect(config).unwrap_err();
    assert!(matches!(
        err,
        Error::Connection(ref c) if c.kind == ConnectionErrorKind::Authentication
    ));
    server.join().unwrap();
}

#[test]
fn cleartext_authentication() {
    let (port, server) = spawn_server(|mut stream| {
        let _params = read_startup(&mut stream);
        stream.write_all(&auth_frame(3, &[])).unwrap();

        let (type_byte, body) = read_frame(&mut stream);
        assert_eq!(type_byte, b'p');
        assert_eq!(body, cstr("sekret"));

        let mut out = auth_frame(0, &[]);
        out.extend_from_slice(&ready(b'I'));
        stream.write_all(&out).unwrap();

        expect_terminate(&mut stream);
    });

    let config = test_config(port).password("sekret");
    let mut conn = PgConnection::connect(config).unwrap();
    assert!(conn.is_ready());
    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn md5_authentication() {
    let salt = *b"\x01\x02\x03\x04";
    let (port, server) = spawn_server(move |mut stream| {
        let _params = read_startup(&mut stream);
        stream.write_all(&auth_frame(5, &salt)).unwrap();

        let (type_byte, body) = read_frame(&mut stream);
        assert_eq!(type_byte, b'p');

        // md5(md5(password + user) + salt), lowercase hex, "md5" prefix.
        let inner = format!("{:x}", md5::compute(b"sekretpostgres"));
        let mut outer_input = inner.into_bytes();
        outer_input.extend_from_slice(&salt);
        let expected = format!("md5{:x}", md5::compute(&outer_input));
        assert_eq!(body, cstr(&expected));

        let mut out = auth_frame(0, &[]);
        out.extend_from_slice(&ready(b'I'));
        stream.write_all(&out).unwrap();

        expect_terminate(&mut stream);
    });

    let config = test_config(port).password("sekret");
    let mut conn = PgConnection::connect(config).unwrap();
    assert!(conn.is_ready());
    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn unsupported_auth_type_rejects() {
    let (port, server) = spawn_server(|mut stream| {
        let _params = read_startup(&mut stream);
        // Subtype 7 is GSSAPI; this client does not implement it.
        stream.write_all(&auth_frame(7, &[])).unwrap();
    });

    let err = PgConnection::connect(test_config(port)).unwrap_err();
    assert!(matches!(
        err,
        Error::Connection(ref c) if c.kind == ConnectionErrorKind::Authentication
    ));
    assert!(err.to_string().contains("unsupported authentication type 7"));
    server.join().unwrap();
}

#[test]
fn unsupported_sasl_mechanism_rejects() {
    let (port, server) = spawn_server(|mut stream| {
        let _params = read_startup(&mut stream);
        let mut mechanisms = cstr("EXTERNAL");
        mechanisms.push(0);
        stream.write_all(&auth_frame(10, &mechanisms)).unwrap();
    });

    let config = test_config(port).password("pw");
    let err = PgConnection::connect(config).unwrap_err();
    assert!(matches!(
        err,
        Error::Connection(ref c) if c.kind == ConnectionErrorKind::Authentication
    ));
    assert!(err.to_string().contains("EXTERNAL"));
    server.join().unwrap();
}

#[test]
fn interleaved_parameter_status_and_notices() {
    let (port, server) = spawn_server(|mut stream| {
        trust_handshake(&mut stream);
        expect_query(&mut stream, "SET search_path TO app");

        // Asynchronous traffic interleaved with the query responses must
        // not advance or disturb the query state machine.
        let mut out = notice_response(&[(b'S', "NOTICE"), (b'M', "something advisory")]);
        out.extend_from_slice(&parameter_status("search_path", "app"));
        out.extend_from_slice(&command_complete("SET"));
        out.extend_from_slice(&notice_response(&[(b'S', "WARNING"), (b'M', "late warning")]));
        out.extend_from_slice(&ready(b'I'));
        stream.write_all(&out).unwrap();

        expect_terminate(&mut stream);
    });

    let mut conn = PgConnection::connect(test_config(port)).unwrap();
    let result = conn.query("SET search_path TO app").unwrap();
    assert_eq!(result.command, "SET");
    assert_eq!(result.row_count, 0);
    // Last-write-wins parameter tracking picked up the mid-query update.
    assert_eq!(conn.parameter("search_path"), Some("app"));
    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn duplicate_column_names_are_preserved() {
    let (port, server) = spawn_server(|mut stream| {
        trust_handshake(&mut stream);
        expect_query(&mut stream, "SELECT 1 AS x, 2 AS x");

        let mut out = row_description(&["x", "x"]);
        out.extend_from_slice(&data_row(&[Some("1"), Some("2")]));
        out.extend_from_slice(&command_complete("SELECT 1"));
        out.extend_from_slice(&ready(b'I'));
        stream.write_all(&out).unwrap();

        expect_terminate(&mut stream);
    });

    let mut conn = PgConnection::connect(test_config(port)).unwrap();
    let result = conn.query("SELECT 1 AS x, 2 AS x").unwrap();
    assert_eq!(result.fields.len(), 2);
    let row = &result.rows[0];
    assert_eq!(row.get(0), Some(&Value::Text("1".to_string())));
    assert_eq!(row.get(1), Some(&Value::Text("2".to_string())));
    // Name lookup resolves to the first occurrence.
    assert_eq!(row.get_str("x"), Some("1"));
    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn chunked_server_stream_is_reassembled() {
    let (port, server) = spawn_server(|mut stream| {
        trust_handshake(&mut stream);
        expect_query(&mut stream, "SELECT 'chunky' AS c");

        let mut out = row_description(&["c"]);
        out.extend_from_slice(&data_row(&[Some("chunky")]));
        out.extend_from_slice(&command_complete("SELECT 1"));
        out.extend_from_slice(&ready(b'I'));

        // Dribble the response out one byte at a time.
        for byte in out {
            stream.write_all(&[byte]).unwrap();
            stream.flush().unwrap();
        }

        expect_terminate(&mut stream);
    });

    let mut conn = PgConnection::connect(test_config(port)).unwrap();
    let result = conn.query("SELECT 'chunky' AS c").unwrap();
    assert_eq!(result.rows[0].get_str("c"), Some("chunky"));
    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn query_timeout_marks_connection_failed() {
    let (port, server) = spawn_server(|mut stream| {
        trust_handshake(&mut stream);
        let (type_byte, _) = read_frame(&mut stream);
        assert_eq!(type_byte, b'Q');
        // Never respond; the client's deadline must fire.
        thread::sleep(Duration::from_millis(800));
    });

    let config = test_config(port).query_timeout(Duration::from_millis(200));
    let mut conn = PgConnection::connect(config).unwrap();

    let err = conn.query("SELECT pg_sleep(60)").unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert!(!conn.is_ready());

    // The frame boundary is unknown; every further query must reject.
    let err = conn.query("SELECT 1").unwrap_err();
    assert!(err.is_connection_error());

    conn.close().unwrap();
    server.join().unwrap();
}
