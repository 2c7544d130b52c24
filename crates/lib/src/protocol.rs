//! Protocol identifiers, server endpoints and responses
//!
//! A server may speak several generations of the account-management protocol
//! at once. Each generation is named by a [`ProtocolIdentifier`] and reachable
//! under one [`ServerEndpoint`] path. The advertisement served at the base URI
//! lists every endpoint the server is willing to talk on.
//!
//! Every exchange ends in a [`Response`]: either a [`Success`] carrying a typed
//! [`Reply`](crate::command::Reply), or an [`ErrorResponse`] carrying a stable
//! [`ErrorCode`], a message, free-form attributes and an optional remediation
//! hint.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::Reply;

/// Names one wire-compatible generation of the command/response schema
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolIdentifier {
    pub name: String,
    pub version_major: u32,
    pub version_minor: u32,
}

impl ProtocolIdentifier {
    pub fn new(name: impl Into<String>, version_major: u32, version_minor: u32) -> Self {
        Self {
            name: name.into(),
            version_major,
            version_minor,
        }
    }

    /// Selection key: major first, then minor
    pub fn version(&self) -> (u32, u32) {
        (self.version_major, self.version_minor)
    }
}

impl fmt::Display for ProtocolIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}.{}",
            self.name, self.version_major, self.version_minor
        )
    }
}

/// One advertised (version, endpoint) pairing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub supported: ProtocolIdentifier,
    /// Path relative to the base URI, e.g. `adm/1/0/`
    pub path: String,
}

/// Document served at the base URI
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub protocols: Vec<ServerEndpoint>,
}

/// Server-assigned identity of a single exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Who a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Blame {
    Client,
    Server,
}

/// Stable machine-readable error codes.
///
/// Storage-layer codes are carried verbatim in [`ErrorCode::Storage`]. A
/// string that is neither one of the protocol's own codes nor shaped like a
/// five-character SQLSTATE parses as [`ErrorCode::Other`], so codes added by
/// newer servers keep their text without being mistaken for storage codes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    Protocol,
    Io,
    Http,
    NoSupportedProtocols,
    Authentication,
    NotLoggedIn,
    Timeout,
    RateLimitExceeded,
    Banned,
    Validity,
    Security,
    Password,
    NotFound,
    SearchNotStarted,
    Internal,
    Storage(String),
    Other(String),
}

impl ErrorCode {
    const NAMED: &'static [ErrorCode] = &[
        ErrorCode::Protocol,
        ErrorCode::Io,
        ErrorCode::Http,
        ErrorCode::NoSupportedProtocols,
        ErrorCode::Authentication,
        ErrorCode::NotLoggedIn,
        ErrorCode::Timeout,
        ErrorCode::RateLimitExceeded,
        ErrorCode::Banned,
        ErrorCode::Validity,
        ErrorCode::Security,
        ErrorCode::Password,
        ErrorCode::NotFound,
        ErrorCode::SearchNotStarted,
        ErrorCode::Internal,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::Protocol => "ProtocolError",
            ErrorCode::Io => "IOError",
            ErrorCode::Http => "HTTPError",
            ErrorCode::NoSupportedProtocols => "NoSupportedProtocols",
            ErrorCode::Authentication => "AuthenticationError",
            ErrorCode::NotLoggedIn => "NotLoggedIn",
            ErrorCode::Timeout => "TimeoutError",
            ErrorCode::RateLimitExceeded => "RateLimitExceeded",
            ErrorCode::Banned => "Banned",
            ErrorCode::Validity => "Validity",
            ErrorCode::Security => "Security",
            ErrorCode::Password => "PasswordError",
            ErrorCode::NotFound => "NotFound",
            ErrorCode::SearchNotStarted => "SearchNotStarted",
            ErrorCode::Internal => "Internal",
            ErrorCode::Storage(code) | ErrorCode::Other(code) => code,
        }
    }

    pub fn parse(code: &str) -> Self {
        Self::NAMED
            .iter()
            .find(|named| named.as_str() == code)
            .cloned()
            .unwrap_or_else(|| {
                if is_sqlstate(code) {
                    ErrorCode::Storage(code.to_string())
                } else {
                    ErrorCode::Other(code.to_string())
                }
            })
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, ErrorCode::Storage(_))
    }
}

/// Five digits or uppercase ASCII letters
fn is_sqlstate(code: &str) -> bool {
    code.len() == 5
        && code
            .bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_uppercase())
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ErrorCode {
    fn from(code: String) -> Self {
        Self::parse(&code)
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        code.as_str().to_string()
    }
}

/// Structured failure returned by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub request_id: RequestId,
    pub message: String,
    pub code: ErrorCode,
    pub attributes: BTreeMap<String, String>,
    pub remediating_action: Option<String>,
    pub blame: Blame,
}

impl ErrorResponse {
    pub fn is_authentication(&self) -> bool {
        self.code == ErrorCode::Authentication
    }
}

/// Successful reply to a command
#[derive(Debug, Clone, PartialEq)]
pub struct Success {
    pub request_id: RequestId,
    pub reply: Reply,
}

/// Outcome of one exchange as it appears on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success(Success),
    Error(ErrorResponse),
}

impl Response {
    pub fn request_id(&self) -> RequestId {
        match self {
            Response::Success(success) => success.request_id,
            Response::Error(error) => error.request_id,
        }
    }
}
