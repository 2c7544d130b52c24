use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

use crate::channel::ChannelError;
use crate::codec::CodecError;
use crate::protocol::{Blame, ErrorCode, ErrorResponse, ProtocolIdentifier};

/// Every failure the client surfaces.
///
/// Whatever the origin, callers can render one shape from it: [`code`],
/// the `Display` message, [`attributes`] and [`remediation`].
///
/// [`code`]: ClientError::code
/// [`attributes`]: ClientError::attributes
/// [`remediation`]: ClientError::remediation
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("protocol error: {message}")]
    Protocol {
        message: String,
        attributes: BTreeMap<String, String>,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP status {status} from {url}")]
    Http { status: u16, url: String },
    #[error("no supported protocols in common with the server")]
    NoSupportedProtocols {
        offered: Vec<ProtocolIdentifier>,
        supported: Vec<ProtocolIdentifier>,
    },
    #[error("not logged in")]
    NotLoggedIn,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("{}", .0.message)]
    Server(ErrorResponse),
}

impl ClientError {
    pub fn protocol(message: impl Into<String>) -> Self {
        ClientError::Protocol {
            message: message.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn protocol_with(
        message: impl Into<String>,
        attributes: impl IntoIterator<Item = (&'static str, String)>,
    ) -> Self {
        ClientError::Protocol {
            message: message.into(),
            attributes: attributes
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ClientError::Protocol { .. } => ErrorCode::Protocol,
            ClientError::Io(_) => ErrorCode::Io,
            ClientError::Http { .. } => ErrorCode::Http,
            ClientError::NoSupportedProtocols { .. } => ErrorCode::NoSupportedProtocols,
            ClientError::NotLoggedIn => ErrorCode::NotLoggedIn,
            ClientError::Timeout(_) => ErrorCode::Timeout,
            ClientError::Server(error) => error.code.clone(),
        }
    }

    pub fn attributes(&self) -> BTreeMap<String, String> {
        match self {
            ClientError::Protocol { attributes, .. } => attributes.clone(),
            ClientError::Http { status, url } => BTreeMap::from([
                ("http_status".to_string(), status.to_string()),
                ("url".to_string(), url.clone()),
            ]),
            ClientError::NoSupportedProtocols { offered, supported } => BTreeMap::from([
                ("offered".to_string(), join(offered)),
                ("supported".to_string(), join(supported)),
            ]),
            ClientError::Server(error) => error.attributes.clone(),
            ClientError::Io(_) | ClientError::NotLoggedIn | ClientError::Timeout(_) => {
                BTreeMap::new()
            }
        }
    }

    pub fn remediation(&self) -> Option<&str> {
        match self {
            ClientError::Server(error) => error.remediating_action.as_deref(),
            ClientError::NotLoggedIn => Some("Log in before issuing commands."),
            ClientError::NoSupportedProtocols { .. } => {
                Some("Upgrade the client or the server so they share a protocol version.")
            }
            _ => None,
        }
    }

    /// Failures the server attributes to the caller; local failures count as
    /// the client's own
    pub fn blame(&self) -> Blame {
        match self {
            ClientError::Server(error) => error.blame,
            ClientError::Http { status, .. } if *status >= 500 => Blame::Server,
            _ => Blame::Client,
        }
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, ClientError::Server(error) if error.is_authentication())
    }

    /// True for a `NotFound` response and for a bare 404 on the command
    /// endpoint
    pub fn is_not_found(&self) -> bool {
        match self {
            ClientError::Server(error) => error.code == ErrorCode::NotFound,
            ClientError::Protocol { attributes, .. } => {
                attributes.get("http_status").map(String::as_str) == Some("404")
            }
            _ => false,
        }
    }
}

impl From<CodecError> for ClientError {
    fn from(err: CodecError) -> Self {
        ClientError::Protocol {
            attributes: err.attributes(),
            message: err.to_string(),
        }
    }
}

impl From<ChannelError> for ClientError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Timeout(after) => ClientError::Timeout(after),
            ChannelError::Io(e) => ClientError::Io(e),
        }
    }
}

fn join(ids: &[ProtocolIdentifier]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
