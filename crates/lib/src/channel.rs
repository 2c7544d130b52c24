//! Byte channel underneath a transport
//!
//! [`HttpChannel`] is the only place the client touches the network. The
//! negotiator uses it for the advertisement read; afterwards the transport
//! owns it for posting command bodies. Session cookies live in the channel,
//! so closing it ends the client side of the session.

use std::io;
use std::time::Duration;

use thiserror::Error;
use url::Url;

/// Largest reply body a channel will read
pub const MAX_REPLY_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Raw HTTP reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    /// Exact `Content-Type` header value, parameters included
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Synchronous request/reply exchange over HTTP
pub trait HttpChannel: Send {
    fn get(&mut self, url: &Url, timeout: Duration) -> Result<HttpReply, ChannelError>;

    fn post(
        &mut self,
        url: &Url,
        content_type: &str,
        body: &[u8],
        timeout: Duration,
    ) -> Result<HttpReply, ChannelError>;

    /// Release the connection pool and any session cookies
    fn close(&mut self) {}
}

#[cfg(feature = "http")]
pub use self::ureq_channel::UreqChannel;

#[cfg(feature = "http")]
mod ureq_channel {
    use std::error::Error as _;
    use std::io::{self, Read};
    use std::time::Duration;

    use tracing::trace;
    use url::Url;

    use super::{ChannelError, HttpChannel, HttpReply, MAX_REPLY_BYTES};

    /// Channel backed by a cookie-keeping `ureq` agent
    pub struct UreqChannel {
        agent: Option<ureq::Agent>,
    }

    impl UreqChannel {
        pub fn new() -> Self {
            let agent = ureq::AgentBuilder::new()
                .user_agent(concat!("libwarden/", env!("CARGO_PKG_VERSION")))
                .build();
            Self { agent: Some(agent) }
        }

        fn agent(&self) -> Result<&ureq::Agent, ChannelError> {
            self.agent.as_ref().ok_or_else(|| {
                ChannelError::Io(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "channel has been closed",
                ))
            })
        }
    }

    impl Default for UreqChannel {
        fn default() -> Self {
            Self::new()
        }
    }

    impl HttpChannel for UreqChannel {
        fn get(&mut self, url: &Url, timeout: Duration) -> Result<HttpReply, ChannelError> {
            trace!(%url, "GET");
            let result = self.agent()?.get(url.as_str()).timeout(timeout).call();
            finish(result, timeout)
        }

        fn post(
            &mut self,
            url: &Url,
            content_type: &str,
            body: &[u8],
            timeout: Duration,
        ) -> Result<HttpReply, ChannelError> {
            trace!(%url, bytes = body.len(), "POST");
            let result = self
                .agent()?
                .post(url.as_str())
                .timeout(timeout)
                .set("Content-Type", content_type)
                .set("Accept", content_type)
                .send_bytes(body);
            finish(result, timeout)
        }

        fn close(&mut self) {
            self.agent = None;
        }
    }

    /// Error statuses still carry a protocol body, so both arms become replies
    fn finish(
        result: Result<ureq::Response, ureq::Error>,
        timeout: Duration,
    ) -> Result<HttpReply, ChannelError> {
        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(transport)) => {
                let timed_out = transport
                    .source()
                    .and_then(|source| source.downcast_ref::<io::Error>())
                    .is_some_and(|e| is_timeout(e.kind()));
                if timed_out {
                    return Err(ChannelError::Timeout(timeout));
                }
                return Err(ChannelError::Io(io::Error::other(transport.to_string())));
            }
        };

        let status = response.status();
        let content_type = response.header("Content-Type").map(str::to_owned);
        let mut body = Vec::new();
        response
            .into_reader()
            .take(MAX_REPLY_BYTES)
            .read_to_end(&mut body)
            .map_err(|e| {
                if is_timeout(e.kind()) {
                    ChannelError::Timeout(timeout)
                } else {
                    ChannelError::Io(e)
                }
            })?;

        Ok(HttpReply {
            status,
            content_type,
            body,
        })
    }

    fn is_timeout(kind: io::ErrorKind) -> bool {
        matches!(kind, io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_range() {
        let reply = |status| HttpReply {
            status,
            content_type: None,
            body: Vec::new(),
        };
        assert!(reply(200).is_success());
        assert!(reply(204).is_success());
        assert!(!reply(302).is_success());
        assert!(!reply(404).is_success());
    }

    #[cfg(feature = "http")]
    #[test]
    fn closed_channel_refuses_requests() {
        let mut channel = UreqChannel::new();
        channel.close();
        let url = Url::parse("http://127.0.0.1:9/").unwrap();
        let err = channel.get(&url, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, ChannelError::Io(e) if e.kind() == io::ErrorKind::NotConnected));
    }
}
