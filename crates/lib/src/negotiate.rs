//! Version negotiation
//!
//! The server advertises every `(protocol, version) -> path` pairing it speaks
//! at its base URI. The client intersects that list with its own supported
//! versions, picks the greatest common `(major, minor)` and builds a transport
//! for the resolved endpoint.
//!
//! Ties are settled by declaration order: when the server advertises one
//! identifier twice, its first path wins; when the client declares one
//! identifier twice, its first factory wins.

use std::time::Duration;

use tracing::{debug, info};
use url::Url;

use crate::channel::HttpChannel;
use crate::connection::Connector;
use crate::error::ClientError;
use crate::protocol::{Advertisement, ProtocolIdentifier, ServerEndpoint};
use crate::transport::{HttpTransport, Transport, TransportFactory};
use crate::version::{ALL_VERSIONS, ProtocolVersion};

/// A version the client can speak and how to build its transport
#[derive(Clone, Copy)]
pub struct SupportedProtocol {
    pub version: ProtocolVersion,
    pub factory: TransportFactory,
}

impl SupportedProtocol {
    /// Speak `version` with the JSON-over-HTTP transport
    pub fn http(version: ProtocolVersion) -> Self {
        Self {
            version,
            factory: HttpTransport::boxed,
        }
    }
}

impl std::fmt::Debug for SupportedProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupportedProtocol")
            .field("version", &self.version.identifier())
            .finish_non_exhaustive()
    }
}

/// Every version this crate speaks, newest first
pub fn default_protocols() -> Vec<SupportedProtocol> {
    ALL_VERSIONS
        .iter()
        .rev()
        .copied()
        .map(SupportedProtocol::http)
        .collect()
}

/// Outcome of [`select`]
#[derive(Debug, Clone, Copy)]
pub struct Selection<'a> {
    pub protocol: &'a SupportedProtocol,
    pub endpoint: &'a ServerEndpoint,
}

/// Pick the greatest `(major, minor)` present on both sides
pub fn select<'a>(
    advertised: &'a [ServerEndpoint],
    supported: &'a [SupportedProtocol],
) -> Option<Selection<'a>> {
    let mut best: Option<Selection<'a>> = None;
    for protocol in supported {
        let Some(endpoint) = advertised
            .iter()
            .find(|endpoint| protocol.version.matches(&endpoint.supported))
        else {
            continue;
        };
        let better = best.is_none_or(|current| {
            endpoint.supported.version() > current.endpoint.supported.version()
        });
        if better {
            best = Some(Selection { protocol, endpoint });
        }
    }
    best
}

/// Read the advertisement at `base` and build a transport for the best
/// common version. The channel moves into the transport on success.
pub fn negotiate(
    base: &Url,
    supported: &[SupportedProtocol],
    mut channel: Box<dyn HttpChannel>,
    timeout: Duration,
) -> Result<Box<dyn Transport>, ClientError> {
    debug!(%base, "fetching protocol advertisement");
    let reply = channel.get(base, timeout)?;
    if !reply.is_success() {
        return Err(ClientError::Http {
            status: reply.status,
            url: base.to_string(),
        });
    }

    let advertisement: Advertisement = serde_json::from_slice(&reply.body).map_err(|e| {
        ClientError::protocol_with(
            format!("unreadable protocol advertisement: {e}"),
            [
                ("expected_type", "Advertisement".to_string()),
                ("url", base.to_string()),
            ],
        )
    })?;

    let Some(selection) = select(&advertisement.protocols, supported) else {
        return Err(ClientError::NoSupportedProtocols {
            offered: advertisement
                .protocols
                .iter()
                .map(|endpoint| endpoint.supported.clone())
                .collect(),
            supported: supported
                .iter()
                .map(|protocol| protocol.version.identifier())
                .collect(),
        });
    };

    let endpoint = base
        .join(&selection.endpoint.path)
        .map(normalize_base)
        .map_err(|e| {
            ClientError::protocol_with(
                format!("cannot resolve endpoint path: {e}"),
                [("path", selection.endpoint.path.clone())],
            )
        })?;

    info!(
        protocol = %selection.endpoint.supported,
        %endpoint,
        "negotiated protocol version"
    );
    (selection.protocol.factory)(selection.protocol.version, endpoint, channel)
}

/// Make `base` usable as a reference-resolution base: paths resolve below it
/// only when it ends in a slash
pub fn normalize_base(mut base: Url) -> Url {
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base
}

type ChannelSource = Box<dyn FnMut() -> Box<dyn HttpChannel> + Send>;

/// [`Connector`] that negotiates against a fixed base URI
pub struct Negotiator {
    base: Url,
    supported: Vec<SupportedProtocol>,
    channels: ChannelSource,
}

impl Negotiator {
    /// Negotiate over fresh `ureq` channels
    #[cfg(feature = "http")]
    pub fn new(base: Url, supported: Vec<SupportedProtocol>) -> Self {
        Self::with_channels(base, supported, || {
            Box::new(crate::channel::UreqChannel::new())
        })
    }

    pub fn with_channels(
        base: Url,
        supported: Vec<SupportedProtocol>,
        channels: impl FnMut() -> Box<dyn HttpChannel> + Send + 'static,
    ) -> Self {
        Self {
            base: normalize_base(base),
            supported,
            channels: Box::new(channels),
        }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn supported(&self) -> impl Iterator<Item = ProtocolIdentifier> + '_ {
        self.supported.iter().map(|p| p.version.identifier())
    }
}

impl Connector for Negotiator {
    fn connect(&mut self, timeout: Duration) -> Result<Box<dyn Transport>, ClientError> {
        let channel = (self.channels)();
        negotiate(&self.base, &self.supported, channel, timeout)
    }
}
