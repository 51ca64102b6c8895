//! Authentication handler for PostgreSQL wire protocol
//!
//! Supports trust, cleartext password, MD5 password and SCRAM-SHA-256 over a
//! pluggable [`CredentialStore`]. The handler is driven one client message at a
//! time and never logs or keeps the secrets it sees.

use crate::error::{PgWireError, Result};
use crate::protocol::message::AuthenticationRequest;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{Buf, Bytes};
use constant_time_eq::constant_time_eq;
use duckdb_pgwire_core::sqlstate;
use hmac::{Hmac, Mac};
use log::{debug, warn};
use pbkdf2::pbkdf2_hmac_array;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

/// SASL mechanism name for SCRAM-SHA-256
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// PBKDF2 iteration count advertised in the server-first message
pub const SCRAM_ITERATIONS: u32 = 4096;

const SCRAM_SALT_LEN: usize = 16;
const SCRAM_NONCE_LEN: usize = 18;

/// Source of user secrets
pub trait CredentialStore: Send + Sync + fmt::Debug {
    /// Cleartext password for `user`, if the user exists
    fn password(&self, user: &str) -> Option<String>;
}

/// Credential store backed by a fixed user table
#[derive(Clone, Default)]
pub struct StaticCredentials {
    users: HashMap<String, String>,
}

impl StaticCredentials {
    /// Create a store from a user → password table
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    /// Add or replace a user
    pub fn with_user(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(user.into(), password.into());
        self
    }
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut users: Vec<&String> = self.users.keys().collect();
        users.sort();
        f.debug_struct("StaticCredentials").field("users", &users).finish()
    }
}

impl CredentialStore for StaticCredentials {
    fn password(&self, user: &str) -> Option<String> {
        self.users.get(user).cloned()
    }
}

/// Authentication method
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum AuthMethod {
    /// No authentication required (trust)
    #[serde(rename = "trust")]
    Trust,

    /// Cleartext password authentication
    #[serde(rename = "password")]
    CleartextPassword,

    /// MD5 password authentication
    #[serde(rename = "md5")]
    Md5Password,

    /// SCRAM-SHA-256 authentication
    #[serde(rename = "scram-sha-256")]
    ScramSha256,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Trust => write!(f, "trust"),
            AuthMethod::CleartextPassword => write!(f, "password"),
            AuthMethod::Md5Password => write!(f, "md5"),
            AuthMethod::ScramSha256 => write!(f, "scram-sha-256"),
        }
    }
}

impl FromStr for AuthMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trust" => Ok(AuthMethod::Trust),
            "password" | "cleartext" => Ok(AuthMethod::CleartextPassword),
            "md5" => Ok(AuthMethod::Md5Password),
            "scram-sha-256" | "scram" => Ok(AuthMethod::ScramSha256),
            other => Err(format!("unknown authentication method: {}", other)),
        }
    }
}

/// Authentication configuration
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Method every client must use
    pub method: AuthMethod,

    /// Usernames and passwords
    pub users: HashMap<String, String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            method: AuthMethod::Trust,
            users: HashMap::new(),
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut users: Vec<&String> = self.users.keys().collect();
        users.sort();
        f.debug_struct("AuthConfig")
            .field("method", &self.method)
            .field("users", &users)
            .finish()
    }
}

impl AuthConfig {
    /// Credential store for the configured users
    pub fn credential_store(&self) -> Arc<dyn CredentialStore> {
        Arc::new(StaticCredentials::new(self.users.clone()))
    }
}

/// Outcome of one authentication step
#[derive(Debug, Clone, PartialEq)]
pub enum AuthStep {
    /// Send this request and wait for the client's answer
    Challenge(AuthenticationRequest),

    /// Client is authenticated; send the optional message, then AuthenticationOk
    Accept(Option<AuthenticationRequest>),
}

/// Where the exchange stands
enum AuthState {
    NotStarted,
    AwaitingCleartext,
    AwaitingMd5 {
        salt: [u8; 4],
    },
    AwaitingScramFirst,
    AwaitingScramFinal {
        client_first_bare: String,
        server_first: String,
        nonce: String,
        salted_password: Option<[u8; 32]>,
    },
    Done,
}

/// Authentication handler for one connection
pub struct AuthHandler {
    method: AuthMethod,
    store: Arc<dyn CredentialStore>,
    user: String,
    state: AuthState,
}

impl fmt::Debug for AuthHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthHandler")
            .field("method", &self.method)
            .field("user", &self.user)
            .finish()
    }
}

impl AuthHandler {
    /// Create a handler using `method` against `store`
    pub fn new(method: AuthMethod, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            method,
            store,
            user: String::new(),
            state: AuthState::NotStarted,
        }
    }

    /// Configured method
    pub fn method(&self) -> AuthMethod {
        self.method
    }

    /// Start authenticating `user`
    pub fn begin(&mut self, user: &str) -> Result<AuthStep> {
        self.user = user.to_string();
        debug!("Authenticating user {} with {}", user, self.method);

        match self.method {
            AuthMethod::Trust => {
                self.state = AuthState::Done;
                Ok(AuthStep::Accept(None))
            }
            AuthMethod::CleartextPassword => {
                self.state = AuthState::AwaitingCleartext;
                Ok(AuthStep::Challenge(AuthenticationRequest::CleartextPassword))
            }
            AuthMethod::Md5Password => {
                let salt: [u8; 4] = rand::thread_rng().gen();
                self.state = AuthState::AwaitingMd5 { salt };
                Ok(AuthStep::Challenge(AuthenticationRequest::Md5Password { salt }))
            }
            AuthMethod::ScramSha256 => {
                self.state = AuthState::AwaitingScramFirst;
                Ok(AuthStep::Challenge(AuthenticationRequest::SASL {
                    mechanisms: vec![SCRAM_SHA_256.to_string()],
                }))
            }
        }
    }

    /// Handle the body of a `p` message from the client
    pub fn respond(&mut self, body: &Bytes) -> Result<AuthStep> {
        match std::mem::replace(&mut self.state, AuthState::Done) {
            AuthState::AwaitingCleartext => {
                let supplied = read_password(body)?;
                match self.store.password(&self.user) {
                    Some(expected) if constant_time_eq(expected.as_bytes(), supplied.as_bytes()) => {
                        Ok(AuthStep::Accept(None))
                    }
                    _ => Err(self.failed()),
                }
            }
            AuthState::AwaitingMd5 { salt } => {
                let supplied = read_password(body)?;
                match self.store.password(&self.user) {
                    Some(password) => {
                        let expected = md5_password_hash(&self.user, &password, &salt);
                        if constant_time_eq(expected.as_bytes(), supplied.as_bytes()) {
                            Ok(AuthStep::Accept(None))
                        } else {
                            Err(self.failed())
                        }
                    }
                    None => Err(self.failed()),
                }
            }
            AuthState::AwaitingScramFirst => self.scram_client_first(body),
            AuthState::AwaitingScramFinal {
                client_first_bare,
                server_first,
                nonce,
                salted_password,
            } => self.scram_client_final(body, &client_first_bare, &server_first, &nonce, salted_password),
            AuthState::NotStarted | AuthState::Done => Err(PgWireError::ProtocolViolation(
                "unexpected password message".to_string(),
            )),
        }
    }

    fn failed(&self) -> PgWireError {
        warn!("Password authentication failed for user {}", self.user);
        PgWireError::auth(
            sqlstate::INVALID_PASSWORD,
            format!("password authentication failed for user \"{}\"", self.user),
        )
    }

    fn scram_client_first(&mut self, body: &Bytes) -> Result<AuthStep> {
        let mut buf = body.clone();
        let mechanism = take_cstring(&mut buf)?;
        if mechanism != SCRAM_SHA_256 {
            return Err(PgWireError::auth(
                sqlstate::INVALID_AUTHORIZATION_SPECIFICATION,
                "client selected an invalid SASL authentication mechanism",
            ));
        }
        if buf.remaining() < 4 {
            return Err(malformed("missing SASL response length"));
        }
        let len = buf.get_i32();
        if len < 0 || len as usize != buf.remaining() {
            return Err(malformed("SASL response length does not match message"));
        }
        let client_first = std::str::from_utf8(&buf).map_err(|_| malformed("client-first is not UTF-8"))?;

        let client_first_bare = if let Some(rest) = client_first.strip_prefix("n,,") {
            rest
        } else if let Some(rest) = client_first.strip_prefix("y,,") {
            rest
        } else if client_first.starts_with("p=") {
            return Err(PgWireError::auth(
                sqlstate::INVALID_AUTHORIZATION_SPECIFICATION,
                "channel binding is not supported",
            ));
        } else {
            return Err(malformed("unsupported GS2 header"));
        };

        let client_nonce = client_first_bare
            .split(',')
            .find_map(|attr| attr.strip_prefix("r="))
            .filter(|nonce| !nonce.is_empty() && nonce.chars().all(|c| c.is_ascii_graphic() && c != ','))
            .ok_or_else(|| malformed("client-first has no nonce"))?;

        let mut rng = rand::thread_rng();
        let mut salt = [0u8; SCRAM_SALT_LEN];
        rng.fill(&mut salt[..]);
        let mut server_nonce = [0u8; SCRAM_NONCE_LEN];
        rng.fill(&mut server_nonce[..]);
        let nonce = format!("{}{}", client_nonce, BASE64.encode(server_nonce));

        // Unknown users still get a plausible challenge and fail at the proof
        let salted_password = self
            .store
            .password(&self.user)
            .map(|password| pbkdf2_hmac_array::<Sha256, 32>(password.as_bytes(), &salt, SCRAM_ITERATIONS));

        let server_first = format!("r={},s={},i={}", nonce, BASE64.encode(salt), SCRAM_ITERATIONS);
        self.state = AuthState::AwaitingScramFinal {
            client_first_bare: client_first_bare.to_string(),
            server_first: server_first.clone(),
            nonce,
            salted_password,
        };
        Ok(AuthStep::Challenge(AuthenticationRequest::SASLContinue {
            data: Bytes::from(server_first),
        }))
    }

    fn scram_client_final(
        &mut self,
        body: &Bytes,
        client_first_bare: &str,
        server_first: &str,
        nonce: &str,
        salted_password: Option<[u8; 32]>,
    ) -> Result<AuthStep> {
        let client_final = std::str::from_utf8(body).map_err(|_| malformed("client-final is not UTF-8"))?;
        let (without_proof, proof) = client_final
            .rsplit_once(",p=")
            .ok_or_else(|| malformed("client-final has no proof"))?;

        let mut binding = None;
        let mut final_nonce = None;
        for attr in without_proof.split(',') {
            if let Some(value) = attr.strip_prefix("c=") {
                binding = Some(value);
            } else if let Some(value) = attr.strip_prefix("r=") {
                final_nonce = Some(value);
            }
        }

        let binding = BASE64
            .decode(binding.ok_or_else(|| malformed("client-final has no channel binding"))?)
            .map_err(|_| malformed("invalid channel binding encoding"))?;
        if binding != b"n,," && binding != b"y,," {
            return Err(malformed("unexpected channel binding"));
        }
        if final_nonce != Some(nonce) {
            return Err(malformed("nonce does not match"));
        }
        let proof = BASE64.decode(proof).map_err(|_| malformed("invalid proof encoding"))?;

        let salted_password = match salted_password {
            Some(salted) => salted,
            None => return Err(self.failed()),
        };
        if proof.len() != 32 {
            return Err(self.failed());
        }

        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);
        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key = Sha256::digest(client_key);
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;

        let recovered: Vec<u8> = proof
            .iter()
            .zip(client_signature.iter())
            .map(|(p, s)| p ^ s)
            .collect();
        if !constant_time_eq(Sha256::digest(&recovered).as_slice(), stored_key.as_slice()) {
            return Err(self.failed());
        }

        let server_key = hmac_sha256(&salted_password, b"Server Key")?;
        let server_signature = hmac_sha256(&server_key, auth_message.as_bytes())?;
        Ok(AuthStep::Accept(Some(AuthenticationRequest::SASLFinal {
            data: Bytes::from(format!("v={}", BASE64.encode(server_signature))),
        })))
    }
}

/// Response a client sends to an MD5 challenge
pub fn md5_password_hash(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = hex::encode(md5::compute(format!("{}{}", password, user)).0);
    let mut outer = inner.into_bytes();
    outer.extend_from_slice(salt);
    format!("md5{}", hex::encode(md5::compute(outer).0))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| PgWireError::auth(sqlstate::INTERNAL_ERROR, format!("HMAC setup failed: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

fn malformed(reason: &str) -> PgWireError {
    PgWireError::ProtocolViolation(format!("malformed SCRAM message: {}", reason))
}

fn take_cstring(buf: &mut Bytes) -> Result<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| PgWireError::ProtocolViolation("unterminated string in password message".to_string()))?;
    let raw = buf.split_to(end);
    buf.advance(1);
    String::from_utf8(raw.to_vec())
        .map_err(|_| PgWireError::ProtocolViolation("invalid UTF-8 in password message".to_string()))
}

fn read_password(body: &Bytes) -> Result<String> {
    let mut buf = body.clone();
    let password = take_cstring(&mut buf)?;
    if buf.has_remaining() {
        return Err(PgWireError::ProtocolViolation(
            "trailing bytes after password".to_string(),
        ));
    }
    Ok(password)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::FrontendMessage;
    use rstest::rstest;

    fn store() -> Arc<dyn CredentialStore> {
        Arc::new(StaticCredentials::default().with_user("alice", "wonderland"))
    }

    fn body(message: FrontendMessage) -> Bytes {
        match message {
            FrontendMessage::PasswordMessage(body) => body,
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_trust_accepts_immediately() {
        let mut handler = AuthHandler::new(AuthMethod::Trust, store());
        assert_eq!(handler.begin("anyone").unwrap(), AuthStep::Accept(None));
    }

    #[test]
    fn test_cleartext_password() {
        let mut handler = AuthHandler::new(AuthMethod::CleartextPassword, store());
        assert_eq!(
            handler.begin("alice").unwrap(),
            AuthStep::Challenge(AuthenticationRequest::CleartextPassword)
        );
        assert_eq!(
            handler.respond(&body(FrontendMessage::password("wonderland"))).unwrap(),
            AuthStep::Accept(None)
        );
    }

    #[rstest]
    #[case("alice", "looking-glass")]
    #[case("mallory", "wonderland")]
    fn test_cleartext_rejections_look_the_same(#[case] user: &str, #[case] password: &str) {
        let mut handler = AuthHandler::new(AuthMethod::CleartextPassword, store());
        handler.begin(user).unwrap();
        match handler.respond(&body(FrontendMessage::password(password))) {
            Err(PgWireError::Auth { code, message }) => {
                assert_eq!(code, sqlstate::INVALID_PASSWORD);
                assert_eq!(message, format!("password authentication failed for user \"{}\"", user));
            }
            other => panic!("expected auth failure, got {:?}", other),
        }
    }

    #[test]
    fn test_md5_password() {
        let mut handler = AuthHandler::new(AuthMethod::Md5Password, store());
        let salt = match handler.begin("alice").unwrap() {
            AuthStep::Challenge(AuthenticationRequest::Md5Password { salt }) => salt,
            other => panic!("unexpected step {:?}", other),
        };
        let response = md5_password_hash("alice", "wonderland", &salt);
        assert_eq!(
            handler.respond(&body(FrontendMessage::password(&response))).unwrap(),
            AuthStep::Accept(None)
        );
    }

    #[test]
    fn test_md5_hash_format() {
        let hash = md5_password_hash("postgres", "secret", &[1, 2, 3, 4]);
        assert!(hash.starts_with("md5"));
        assert_eq!(hash.len(), 35);
        assert!(hash[3..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_md5_wrong_password() {
        let mut handler = AuthHandler::new(AuthMethod::Md5Password, store());
        let salt = match handler.begin("alice").unwrap() {
            AuthStep::Challenge(AuthenticationRequest::Md5Password { salt }) => salt,
            other => panic!("unexpected step {:?}", other),
        };
        let response = md5_password_hash("alice", "nope", &salt);
        assert!(matches!(
            handler.respond(&body(FrontendMessage::password(&response))),
            Err(PgWireError::Auth { .. })
        ));
    }

    /// Client side of SCRAM-SHA-256, returning (client-final, expected server-final)
    fn scram_client_final(password: &str, client_first_bare: &str, server_first: &str) -> (String, String) {
        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for attr in server_first.split(',') {
            match attr.split_at(2) {
                ("r=", v) => nonce = Some(v.to_string()),
                ("s=", v) => salt = Some(BASE64.decode(v).unwrap()),
                ("i=", v) => iterations = Some(v.parse::<u32>().unwrap()),
                _ => {}
            }
        }
        let salted = pbkdf2_hmac_array::<Sha256, 32>(password.as_bytes(), &salt.unwrap(), iterations.unwrap());
        let without_proof = format!("c={},r={}", BASE64.encode("n,,"), nonce.unwrap());
        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);

        let client_key = hmac_sha256(&salted, b"Client Key").unwrap();
        let stored_key = Sha256::digest(client_key);
        let signature = hmac_sha256(&stored_key, auth_message.as_bytes()).unwrap();
        let proof: Vec<u8> = client_key.iter().zip(signature.iter()).map(|(k, s)| k ^ s).collect();

        let server_key = hmac_sha256(&salted, b"Server Key").unwrap();
        let server_signature = hmac_sha256(&server_key, auth_message.as_bytes()).unwrap();
        (
            format!("{},p={}", without_proof, BASE64.encode(proof)),
            format!("v={}", BASE64.encode(server_signature)),
        )
    }

    fn scram_exchange(user: &str, password: &str) -> Result<AuthStep> {
        let mut handler = AuthHandler::new(AuthMethod::ScramSha256, store());
        assert_eq!(
            handler.begin(user).unwrap(),
            AuthStep::Challenge(AuthenticationRequest::SASL {
                mechanisms: vec![SCRAM_SHA_256.to_string()]
            })
        );

        let client_first_bare = "n=,r=rOprNGfwEbeRWgbNEkqO";
        let first = format!("n,,{}", client_first_bare);
        let server_first = match handler
            .respond(&body(FrontendMessage::sasl_initial_response(SCRAM_SHA_256, first.as_bytes())))?
        {
            AuthStep::Challenge(AuthenticationRequest::SASLContinue { data }) => {
                String::from_utf8(data.to_vec()).unwrap()
            }
            other => panic!("unexpected step {:?}", other),
        };
        assert!(server_first.starts_with("r=rOprNGfwEbeRWgbNEkqO"));

        let (client_final, expected_server_final) = scram_client_final(password, client_first_bare, &server_first);
        let step = handler.respond(&body(FrontendMessage::sasl_response(client_final.as_bytes())))?;
        if let AuthStep::Accept(Some(AuthenticationRequest::SASLFinal { data })) = &step {
            assert_eq!(&data[..], expected_server_final.as_bytes());
        }
        Ok(step)
    }

    #[test]
    fn test_scram_exchange_succeeds() {
        assert!(matches!(
            scram_exchange("alice", "wonderland").unwrap(),
            AuthStep::Accept(Some(AuthenticationRequest::SASLFinal { .. }))
        ));
    }

    #[test]
    fn test_scram_wrong_password() {
        assert!(matches!(
            scram_exchange("alice", "looking-glass"),
            Err(PgWireError::Auth { code, .. }) if code == sqlstate::INVALID_PASSWORD
        ));
    }

    #[test]
    fn test_scram_unknown_user_fails_at_proof() {
        assert!(matches!(
            scram_exchange("mallory", "wonderland"),
            Err(PgWireError::Auth { .. })
        ));
    }

    #[test]
    fn test_scram_rejects_other_mechanisms() {
        let mut handler = AuthHandler::new(AuthMethod::ScramSha256, store());
        handler.begin("alice").unwrap();
        let result = handler.respond(&body(FrontendMessage::sasl_initial_response("SCRAM-SHA-256-PLUS", b"p=tls-server-end-point,,n=,r=x")));
        assert!(matches!(result, Err(PgWireError::Auth { .. })));
    }

    #[test]
    fn test_password_before_challenge_is_a_violation() {
        let mut handler = AuthHandler::new(AuthMethod::CleartextPassword, store());
        let result = handler.respond(&body(FrontendMessage::password("wonderland")));
        assert!(matches!(result, Err(PgWireError::ProtocolViolation(_))));
    }

    #[rstest]
    #[case("trust", AuthMethod::Trust)]
    #[case("password", AuthMethod::CleartextPassword)]
    #[case("MD5", AuthMethod::Md5Password)]
    #[case("scram-sha-256", AuthMethod::ScramSha256)]
    fn test_auth_method_from_str(#[case] input: &str, #[case] expected: AuthMethod) {
        assert_eq!(input.parse::<AuthMethod>().unwrap(), expected);
        assert_eq!(expected.to_string().parse::<AuthMethod>().unwrap(), expected);
    }

    #[test]
    fn test_scram_client_final_matches_rfc_7677() {
        let (client_final, server_final) = scram_client_final(
            "pencil",
            "n=user,r=rOprNGfwEbeRWgbNEkqO",
            "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096",
        );
        assert_eq!(
            client_final,
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );
        assert_eq!(server_final, "v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=");
    }

    #[test]
    fn test_debug_output_hides_passwords() {
        let config = AuthConfig {
            method: AuthMethod::Md5Password,
            users: [("alice".to_string(), "wonderland".to_string())].into_iter().collect(),
        };
        let rendered = format!("{:?} {:?}", config, config.credential_store());
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("wonderland"));
    }
}
