//! JSON envelope codec
//!
//! # Wire Format
//!
//! Every message is one JSON object:
//!
//! ```text
//! {"schema": "urn:warden:acct-admin:1.1",
//!  "type": "UserSearchBegin",
//!  "request_id": "…",          (responses only)
//!  "body": { … }}
//! ```
//!
//! `type` selects the concrete shape of `body`. It must be listed in the
//! registry and allowed by the codec's protocol version, otherwise decoding
//! fails before `body` is looked at. `schema` is informational.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::command::{CommandKind, CommandMessage, ERROR_DISCRIMINATOR, Reply, ReplyKind};
use crate::protocol::{Blame, ErrorCode, ErrorResponse, RequestId, Response, Success};
use crate::version::ProtocolVersion;

/// Codec failures; all of them are protocol errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("message type {kind} is not part of protocol {version}")]
    NotPermitted { kind: String, version: String },
    #[error("expected a {expected}, received message type {actual}")]
    UnexpectedType {
        expected: &'static str,
        actual: String,
    },
    #[error("response of type {0} carries no request id")]
    MissingRequestId(String),
    #[error("invalid body for message type {kind}: {source}")]
    Body {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

impl CodecError {
    /// Diagnostic attributes for the uniform error shape
    pub fn attributes(&self) -> BTreeMap<String, String> {
        let mut attributes = BTreeMap::new();
        match self {
            CodecError::UnknownType(kind) => {
                attributes.insert("received_type".into(), kind.clone());
            }
            CodecError::NotPermitted { kind, version } => {
                attributes.insert("received_type".into(), kind.clone());
                attributes.insert("protocol".into(), version.clone());
            }
            CodecError::UnexpectedType { expected, actual } => {
                attributes.insert("expected_type".into(), (*expected).to_string());
                attributes.insert("received_type".into(), actual.clone());
            }
            CodecError::MissingRequestId(kind) | CodecError::Body { kind, .. } => {
                attributes.insert("received_type".into(), kind.clone());
            }
            CodecError::Malformed(_) | CodecError::Encode(_) => {}
        }
        attributes
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    schema: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<RequestId>,
    #[serde(default)]
    body: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorBody {
    message: String,
    code: ErrorCode,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remediating_action: Option<String>,
    blame: Blame,
}

/// Serializer and parser for one protocol version
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    version: ProtocolVersion,
}

impl Codec {
    pub fn new(version: ProtocolVersion) -> Self {
        Self { version }
    }

    pub fn version(&self) -> &ProtocolVersion {
        &self.version
    }

    pub fn content_type(&self) -> &'static str {
        self.version.content_type
    }

    pub fn serialize_command(&self, command: &CommandMessage) -> Result<Vec<u8>, CodecError> {
        let kind = command.kind();
        if !self.version.allows_command(kind) {
            return Err(self.not_permitted(kind.discriminator()));
        }
        let body = tagged_body(serde_json::to_value(command).map_err(CodecError::Encode)?);
        self.write(Envelope {
            schema: self.version.schema.to_string(),
            kind: kind.discriminator().to_string(),
            request_id: None,
            body,
        })
    }

    pub fn parse_command(&self, bytes: &[u8]) -> Result<CommandMessage, CodecError> {
        let envelope = self.read(bytes)?;
        let Some(kind) = CommandKind::from_discriminator(&envelope.kind) else {
            return Err(self.unrecognized("command", envelope.kind));
        };
        if !self.version.allows_command(kind) {
            return Err(self.not_permitted(&envelope.kind));
        }
        untag(envelope.kind, envelope.body)
    }

    pub fn serialize_response(&self, response: &Response) -> Result<Vec<u8>, CodecError> {
        let envelope = match response {
            Response::Success(Success { request_id, reply }) => {
                let kind = reply.kind();
                if !self.version.allows_reply(kind) {
                    return Err(self.not_permitted(kind.discriminator()));
                }
                Envelope {
                    schema: self.version.schema.to_string(),
                    kind: kind.discriminator().to_string(),
                    request_id: Some(*request_id),
                    body: tagged_body(serde_json::to_value(reply).map_err(CodecError::Encode)?),
                }
            }
            Response::Error(error) => {
                let body = ErrorBody {
                    message: error.message.clone(),
                    code: error.code.clone(),
                    attributes: error.attributes.clone(),
                    remediating_action: error.remediating_action.clone(),
                    blame: error.blame,
                };
                Envelope {
                    schema: self.version.schema.to_string(),
                    kind: ERROR_DISCRIMINATOR.to_string(),
                    request_id: Some(error.request_id),
                    body: serde_json::to_value(body).map_err(CodecError::Encode)?,
                }
            }
        };
        self.write(envelope)
    }

    pub fn parse_response(&self, bytes: &[u8]) -> Result<Response, CodecError> {
        let envelope = self.read(bytes)?;

        if envelope.kind == ERROR_DISCRIMINATOR {
            let request_id = envelope
                .request_id
                .ok_or_else(|| CodecError::MissingRequestId(envelope.kind.clone()))?;
            let body: ErrorBody =
                serde_json::from_value(envelope.body).map_err(|source| CodecError::Body {
                    kind: envelope.kind,
                    source,
                })?;
            return Ok(Response::Error(ErrorResponse {
                request_id,
                message: body.message,
                code: body.code,
                attributes: body.attributes,
                remediating_action: body.remediating_action,
                blame: body.blame,
            }));
        }

        let Some(kind) = ReplyKind::from_discriminator(&envelope.kind) else {
            return Err(self.unrecognized("response", envelope.kind));
        };
        if !self.version.allows_reply(kind) {
            return Err(self.not_permitted(&envelope.kind));
        }
        let request_id = envelope
            .request_id
            .ok_or_else(|| CodecError::MissingRequestId(envelope.kind.clone()))?;
        let reply: Reply = untag(envelope.kind, envelope.body)?;
        Ok(Response::Success(Success { request_id, reply }))
    }

    fn read(&self, bytes: &[u8]) -> Result<Envelope, CodecError> {
        let envelope: Envelope = serde_json::from_slice(bytes).map_err(CodecError::Malformed)?;
        if envelope.schema != self.version.schema {
            debug!(
                expected = self.version.schema,
                received = %envelope.schema,
                "schema identifier differs from negotiated version"
            );
        }
        Ok(envelope)
    }

    fn write(&self, envelope: Envelope) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(&envelope).map_err(CodecError::Encode)
    }

    fn not_permitted(&self, kind: &str) -> CodecError {
        CodecError::NotPermitted {
            kind: kind.to_string(),
            version: self.version.identifier().to_string(),
        }
    }

    /// A known discriminator of the wrong direction is unexpected; anything
    /// else is unknown
    fn unrecognized(&self, expected: &'static str, kind: String) -> CodecError {
        let known = kind == ERROR_DISCRIMINATOR
            || CommandKind::from_discriminator(&kind).is_some()
            || ReplyKind::from_discriminator(&kind).is_some();
        if known {
            CodecError::UnexpectedType {
                expected,
                actual: kind,
            }
        } else {
            CodecError::UnknownType(kind)
        }
    }
}

/// Pull `body` out of a serde adjacently tagged value
fn tagged_body(value: Value) -> Value {
    match value {
        Value::Object(mut map) => map.remove("body").unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

/// Rebuild the adjacently tagged form and deserialize the closed enum
fn untag<T: serde::de::DeserializeOwned>(kind: String, body: Value) -> Result<T, CodecError> {
    let mut map = Map::new();
    map.insert("type".into(), Value::String(kind.clone()));
    map.insert("body".into(), body);
    serde_json::from_value(Value::Object(map)).map_err(|source| CodecError::Body { kind, source })
}
