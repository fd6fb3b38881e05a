//! SCRAM-SHA-256 authentication (RFC 5802 / RFC 7677, client side).
//!
//! Passwords are normalized with NFKC only. Full SASLprep (RFC 4013)
//! additionally prohibits control characters and maps certain spaces;
//! passwords containing such characters may fail to authenticate.
//! Printable ASCII passwords are unaffected.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::{thread_rng, Rng};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use pgdart_core::error::{
    ConnectionError, ConnectionErrorKind, Error, ProtocolError,
};

type HmacSha256 = Hmac<Sha256>;

/// Base64 of the GS2 header `n,,` (no channel binding, no authzid).
const GS2_HEADER_B64: &str = "biws";

/// SCRAM-SHA-256 client state machine.
///
/// One instance lives for the duration of a single authentication
/// exchange. Once the server-first message has been processed, the salt,
/// iteration count, and combined nonce are fixed for the session.
pub struct ScramClient {
    username: String,
    password: String,
    client_nonce: String,

    // State from the server-first message
    server_nonce: Option<String>,
    salt: Option<Vec<u8>>,
    iterations: Option<u32>,

    // Derived state for server-final verification
    salted_password: Option<[u8; 32]>,
    auth_message: Option<String>,
}

impl ScramClient {
    /// Create a new SCRAM client for one authentication exchange.
    ///
    /// The client nonce is the base64 encoding of 18 cryptographically
    /// random bytes.
    pub fn new(username: &str, password: &str) -> Self {
        let mut nonce_bytes = [0u8; 18];
        thread_rng().fill(&mut nonce_bytes);

        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce: BASE64.encode(nonce_bytes),
            server_nonce: None,
            salt: None,
            iterations: None,
            salted_password: None,
            auth_message: None,
        }
    }

    /// Generate the client-first message: `n,,n=<user>,r=<nonce>`.
    pub fn client_first(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", sasl_name(&self.username), self.client_nonce)
    }

    /// Process the server-first message and produce the client-final
    /// message (`c=biws,r=<nonce>,p=<proof>`).
    pub fn process_server_first(&mut self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let server_first = std::str::from_utf8(data)
            .map_err(|e| protocol_error(format!("invalid UTF-8 in SASL continue: {}", e)))?;

        let params = parse_scram_params(server_first);

        let combined_nonce = params
            .iter()
            .find(|(k, _)| *k == "r")
            .map(|(_, v)| v.to_string())
            .ok_or_else(|| protocol_error("server-first message is missing the nonce"))?;
        let salt = params
            .iter()
            .find(|(k, _)| *k == "s")
            .ok_or_else(|| protocol_error("server-first message is missing the salt"))
            .and_then(|(_, v)| {
                BASE64
                    .decode(v)
                    .map_err(|e| protocol_error(format!("invalid base64 salt: {}", e)))
            })?;
        let iterations: u32 = params
            .iter()
            .find(|(k, _)| *k == "i")
            .ok_or_else(|| protocol_error("server-first message is missing the iteration count"))
            .and_then(|(_, v)| {
                v.parse()
                    .map_err(|e| protocol_error(format!("invalid iteration count: {}", e)))
            })?;

        // The combined nonce must extend our nonce exactly, or the
        // exchange is not a response to our client-first message.
        if !combined_nonce.starts_with(&self.client_nonce) {
            return Err(auth_error("server nonce does not extend the client nonce"));
        }

        // NFKC normalization only; see the module docs for the SASLprep
        // deviation.
        let normalized_password: String = self.password.nfkc().collect();

        let mut salted_password = [0u8; 32];
        pbkdf2_hmac::<Sha256>(
            normalized_password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        );

        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key = sha256(&client_key);

        let client_final_without_proof = format!("c={},r={}", GS2_HEADER_B64, combined_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            client_final_without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let client_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        self.server_nonce = Some(combined_nonce);
        self.salt = Some(salt);
        self.iterations = Some(iterations);
        self.salted_password = Some(salted_password);
        self.auth_message = Some(auth_message);

        let client_final = format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(&client_proof)
        );
        Ok(client_final.into_bytes())
    }

    /// Verify the server-final message (the server's signature proves it
    /// also knows the salted password). Any failure is fatal.
    pub fn verify_server_final(&self, data: &[u8]) -> Result<(), Error> {
        let server_final = std::str::from_utf8(data)
            .map_err(|e| protocol_error(format!("invalid UTF-8 in SASL final: {}", e)))?;

        if let Some(server_error) = server_final.strip_prefix("e=") {
            return Err(auth_error(format!(
                "server rejected authentication: {}",
                server_error
            )));
        }

        let params = parse_scram_params(server_final);
        let verifier = params
            .iter()
            .find(|(k, _)| *k == "v")
            .map(|(_, v)| *v)
            .ok_or_else(|| protocol_error("server-final message is missing the verifier"))?;

        let server_signature = BASE64
            .decode(verifier)
            .map_err(|e| protocol_error(format!("invalid base64 server signature: {}", e)))?;

        let salted_password = self
            .salted_password
            .as_ref()
            .ok_or_else(|| protocol_error("SASL final received before server-first"))?;
        let auth_message = self
            .auth_message
            .as_ref()
            .ok_or_else(|| protocol_error("SASL final received before server-first"))?;

        let server_key = hmac_sha256(salted_password, b"Server Key")?;

        // Constant-time comparison via the MAC verifier.
        let mut mac = HmacSha256::new_from_slice(&server_key)
            .map_err(|e| protocol_error(format!("HMAC init failed: {}", e)))?;
        mac.update(auth_message.as_bytes());
        mac.verify_slice(&server_signature)
            .map_err(|_| auth_error("server signature mismatch"))?;

        Ok(())
    }
}

/// Escape a username for inclusion in the SCRAM client-first message:
/// `=` becomes `=3D`, `,` becomes `=2C`.
fn sasl_name(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

/// Split a SCRAM message into `(key, value)` attribute pairs. Each
/// comma-separated token splits on the first `=`; values may themselves
/// contain `=` (base64 padding).
fn parse_scram_params(message: &str) -> Vec<(&str, &str)> {
    message
        .split(',')
        .filter_map(|token| token.split_once('='))
        .collect()
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], Error> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| protocol_error(format!("HMAC init failed: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn protocol_error(msg: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError {
        message: msg.into(),
        raw_data: None,
        source: None,
    })
}

fn auth_error(msg: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Authentication,
        message: msg.into(),
        source: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a client with the fixed nonce from the RFC 7677 §3 example.
    fn rfc7677_client() -> ScramClient {
        let mut client = ScramClient::new("user", "pencil");
        client.client_nonce = "rOprNGfwEbeRWgbNEkqO".to_string();
        client
    }

    const RFC7677_SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
    const RFC7677_SERVER_FINAL: &str = "v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=";

    #[test]
    fn rfc7677_client_first() {
        let client = rfc7677_client();
        assert_eq!(
            client.client_first(),
            b"n,,n=user,r=rOprNGfwEbeRWgbNEkqO".to_vec()
        );
    }

    #[test]
    fn rfc7677_client_proof_matches() {
        let mut client = rfc7677_client();
        let client_final = client
            .process_server_first(RFC7677_SERVER_FIRST.as_bytes())
            .unwrap();

        assert_eq!(
            String::from_utf8(client_final).unwrap(),
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
             p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );
    }

    #[test]
    fn rfc7677_server_signature_verifies() {
        let mut client = rfc7677_client();
        client
            .process_server_first(RFC7677_SERVER_FIRST.as_bytes())
            .unwrap();
        client
            .verify_server_final(RFC7677_SERVER_FINAL.as_bytes())
            .unwrap();
    }

    #[test]
    fn mismatched_server_signature_fails() {
        let mut client = rfc7677_client();
        client
            .process_server_first(RFC7677_SERVER_FIRST.as_bytes())
            .unwrap();

        let err = client
            .verify_server_final(b"v=AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[test]
    fn server_error_in_final_is_reported() {
        let mut client = rfc7677_client();
        client
            .process_server_first(RFC7677_SERVER_FIRST.as_bytes())
            .unwrap();

        let err = client
            .verify_server_final(b"e=invalid-proof")
            .unwrap_err();
        assert!(err.to_string().contains("invalid-proof"));
    }

    #[test]
    fn foreign_nonce_is_rejected() {
        let mut client = rfc7677_client();
        let err = client
            .process_server_first(b"r=completelyDifferentNonce,s=c2FsdA==,i=4096")
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[test]
    fn missing_salt_or_iterations_fails() {
        let mut client = rfc7677_client();
        assert!(client
            .process_server_first(b"r=rOprNGfwEbeRWgbNEkqOmore,i=4096")
            .is_err());

        let mut client = rfc7677_client();
        assert!(client
            .process_server_first(b"r=rOprNGfwEbeRWgbNEkqOmore,s=c2FsdA==")
            .is_err());
    }

    #[test]
    fn nonce_is_base64_of_18_bytes() {
        let client = ScramClient::new("user", "pw");
        // 18 bytes encode to 24 base64 characters without padding.
        assert_eq!(client.client_nonce.len(), 24);
        assert!(BASE64.decode(&client.client_nonce).unwrap().len() == 18);

        // Nonces must differ between exchanges.
        let other = ScramClient::new("user", "pw");
        assert_ne!(client.client_nonce, other.client_nonce);
    }

    #[test]
    fn sasl_name_escaping() {
        assert_eq!(sasl_name("plain"), "plain");
        assert_eq!(sasl_name("a=b"), "a=3Db");
        assert_eq!(sasl_name("a,b"), "a=2Cb");
        assert_eq!(sasl_name("=,"), "=3D=2C");
    }

    #[test]
    fn scram_params_split_on_first_equals_only() {
        let params = parse_scram_params("r=abc,s=AA==,i=4096");
        assert_eq!(params[0], ("r", "abc"));
        assert_eq!(params[1], ("s", "AA=="));
        assert_eq!(params[2], ("i", "4096"));
    }
}
