//! Per-version transport
//!
//! A [`Transport`] owns the codec and endpoint URIs of one negotiated protocol
//! version and performs single request/reply exchanges. It classifies each
//! reply as a success, a domain error returned by the server, or a protocol
//! violation; it never retries.

use std::time::Duration;

use tracing::{debug, warn};
use url::Url;

use crate::channel::HttpChannel;
use crate::codec::Codec;
use crate::command::{Command, CommandMessage};
use crate::error::ClientError;
use crate::negotiate::normalize_base;
use crate::protocol::{ErrorResponse, Response};
use crate::version::ProtocolVersion;

/// Exchange of serialized commands with one endpoint
pub trait Transport: Send {
    fn version(&self) -> &ProtocolVersion;

    /// Send one command and return the server's parsed response
    fn send(&mut self, command: &CommandMessage, timeout: Duration)
    -> Result<Response, ClientError>;

    /// Release the underlying channel; the transport is unusable afterwards
    fn close(&mut self);
}

/// Builds a transport for a negotiated version from its resolved endpoint
pub type TransportFactory =
    fn(ProtocolVersion, Url, Box<dyn HttpChannel>) -> Result<Box<dyn Transport>, ClientError>;

/// Typed result of a successful exchange
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<R> {
    Reply(R),
    Refused(ErrorResponse),
}

/// Send a typed command and check the reply against the type it promises
pub fn exchange<C: Command>(
    transport: &mut dyn Transport,
    command: &C,
    timeout: Duration,
) -> Result<Outcome<C::Reply>, ClientError> {
    let message: CommandMessage = command.clone().into();
    match transport.send(&message, timeout)? {
        Response::Error(error) => Ok(Outcome::Refused(error)),
        Response::Success(success) => {
            let actual = success.reply.kind();
            C::extract(success.reply).map(Outcome::Reply).map_err(|_| {
                warn!(
                    command = %C::KIND,
                    expected = %C::REPLY,
                    %actual,
                    request_id = %success.request_id,
                    "reply type does not match command"
                );
                ClientError::protocol_with(
                    format!("{} answered with {actual}, expected {}", C::KIND, C::REPLY),
                    [
                        ("expected_type", C::REPLY.to_string()),
                        ("received_type", actual.to_string()),
                        ("request_id", success.request_id.to_string()),
                    ],
                )
            })
        }
    }
}

/// Transport speaking the JSON envelope over HTTP POST
pub struct HttpTransport {
    codec: Codec,
    login: Url,
    command: Url,
    channel: Box<dyn HttpChannel>,
}

impl HttpTransport {
    pub fn new(
        version: ProtocolVersion,
        endpoint: Url,
        channel: Box<dyn HttpChannel>,
    ) -> Result<Self, ClientError> {
        let endpoint = normalize_base(endpoint);
        let join = |path: &str| {
            endpoint.join(path).map_err(|e| {
                ClientError::protocol_with(
                    format!("cannot resolve {path} endpoint: {e}"),
                    [("endpoint", endpoint.to_string())],
                )
            })
        };
        Ok(Self {
            codec: Codec::new(version),
            login: join("login")?,
            command: join("command")?,
            channel,
        })
    }

    /// [`TransportFactory`] for this transport
    pub fn boxed(
        version: ProtocolVersion,
        endpoint: Url,
        channel: Box<dyn HttpChannel>,
    ) -> Result<Box<dyn Transport>, ClientError> {
        Ok(Box::new(Self::new(version, endpoint, channel)?))
    }

    pub fn login_url(&self) -> &Url {
        &self.login
    }

    pub fn command_url(&self) -> &Url {
        &self.command
    }
}

impl Transport for HttpTransport {
    fn version(&self) -> &ProtocolVersion {
        self.codec.version()
    }

    fn send(
        &mut self,
        command: &CommandMessage,
        timeout: Duration,
    ) -> Result<Response, ClientError> {
        let kind = command.kind();
        let body = self.codec.serialize_command(command)?;
        let url = if kind.is_login() {
            &self.login
        } else {
            &self.command
        };

        debug!(%kind, %url, bytes = body.len(), "sending command");
        let reply = self
            .channel
            .post(url, self.codec.content_type(), &body, timeout)?;

        let expected = self.codec.content_type();
        let received = reply.content_type.as_deref().unwrap_or("");
        if received != expected {
            return Err(ClientError::protocol_with(
                format!("unexpected content type {received:?} in reply to {kind}"),
                [
                    ("expected_content_type", expected.to_string()),
                    ("received_content_type", received.to_string()),
                    ("http_status", reply.status.to_string()),
                ],
            ));
        }

        let response = self.codec.parse_response(&reply.body).map_err(|e| {
            let mut err = ClientError::from(e);
            if let ClientError::Protocol { attributes, .. } = &mut err {
                attributes
                    .entry("expected_type".into())
                    .or_insert_with(|| "Response".into());
                attributes.insert("http_status".into(), reply.status.to_string());
            }
            err
        })?;

        debug!(%kind, request_id = %response.request_id(), status = reply.status, "received response");
        Ok(response)
    }

    fn close(&mut self) {
        self.channel.close();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::channel::{ChannelError, HttpReply};
    use crate::command::{Done, Login, LoginOk, Logout, Reply, UserGet, samples};
    use crate::model::UserId;
    use crate::protocol::{Blame, ErrorCode, RequestId, Success};
    use crate::version::{V1_0, V1_1};

    #[derive(Debug, Clone)]
    struct Sent {
        url: String,
        content_type: String,
    }

    /// Channel replaying canned replies and recording what was posted
    struct ScriptedChannel {
        replies: VecDeque<Result<HttpReply, ChannelError>>,
        sent: Arc<Mutex<Vec<Sent>>>,
    }

    impl HttpChannel for ScriptedChannel {
        fn get(&mut self, _url: &Url, _timeout: Duration) -> Result<HttpReply, ChannelError> {
            unreachable!("transport never issues GET")
        }

        fn post(
            &mut self,
            url: &Url,
            content_type: &str,
            _body: &[u8],
            _timeout: Duration,
        ) -> Result<HttpReply, ChannelError> {
            self.sent.lock().unwrap().push(Sent {
                url: url.to_string(),
                content_type: content_type.to_string(),
            });
            self.replies.pop_front().expect("no scripted reply left")
        }
    }

    fn transport(
        version: ProtocolVersion,
        replies: Vec<Result<HttpReply, ChannelError>>,
    ) -> (HttpTransport, Arc<Mutex<Vec<Sent>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let channel = ScriptedChannel {
            replies: replies.into(),
            sent: Arc::clone(&sent),
        };
        let endpoint = Url::parse("http://accounts.example/adm/1/1/").unwrap();
        (
            HttpTransport::new(version, endpoint, Box::new(channel)).unwrap(),
            sent,
        )
    }

    fn reply_with(version: ProtocolVersion, response: &Response) -> HttpReply {
        HttpReply {
            status: 200,
            content_type: Some(version.content_type.to_string()),
            body: Codec::new(version).serialize_response(response).unwrap(),
        }
    }

    fn done() -> Response {
        Response::Success(Success {
            request_id: RequestId::new(),
            reply: Reply::Done(Done),
        })
    }

    fn login() -> Login {
        Login {
            user_name: "grace".into(),
            password: "hunter22".into(),
        }
    }

    #[test]
    fn login_and_commands_use_their_own_endpoints() {
        let ok = Response::Success(Success {
            request_id: RequestId::new(),
            reply: samples::replies().remove(0),
        });
        let (mut t, sent) = transport(
            V1_1,
            vec![Ok(reply_with(V1_1, &ok)), Ok(reply_with(V1_1, &done()))],
        );

        let outcome = exchange(&mut t, &login(), Duration::from_secs(1)).unwrap();
        assert!(matches!(outcome, Outcome::Reply(LoginOk { .. })));
        let outcome = exchange(&mut t, &Logout, Duration::from_secs(1)).unwrap();
        assert_eq!(outcome, Outcome::Reply(Done));

        let sent = sent.lock().unwrap();
        assert_eq!(sent[0].url, "http://accounts.example/adm/1/1/login");
        assert_eq!(sent[1].url, "http://accounts.example/adm/1/1/command");
        assert_eq!(sent[1].content_type, V1_1.content_type);
    }

    #[test]
    fn endpoint_without_trailing_slash_is_treated_as_a_directory() {
        let endpoint = Url::parse("http://accounts.example/adm/1/0").unwrap();
        let t = HttpTransport::new(V1_0, endpoint, Box::new(ScriptedChannel {
            replies: VecDeque::new(),
            sent: Arc::default(),
        }))
        .unwrap();
        assert_eq!(t.login_url().as_str(), "http://accounts.example/adm/1/0/login");
        assert_eq!(t.command_url().as_str(), "http://accounts.example/adm/1/0/command");
    }

    #[test]
    fn content_type_mismatch_is_a_protocol_error() {
        let mut reply = reply_with(V1_1, &done());
        reply.content_type = Some("text/html".into());
        let (mut t, _) = transport(V1_1, vec![Ok(reply)]);

        let err = exchange(&mut t, &Logout, Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Protocol);
        let attributes = err.attributes();
        assert_eq!(attributes["expected_content_type"], V1_1.content_type);
        assert_eq!(attributes["received_content_type"], "text/html");
    }

    #[test]
    fn unparsable_body_is_a_protocol_error() {
        let reply = HttpReply {
            status: 200,
            content_type: Some(V1_1.content_type.into()),
            body: b"{\"not\": \"an envelope\"}".to_vec(),
        };
        let (mut t, _) = transport(V1_1, vec![Ok(reply)]);
        let err = exchange(&mut t, &Logout, Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Protocol);
        assert_eq!(err.attributes()["expected_type"], "Response");
    }

    #[test]
    fn error_responses_are_returned_as_is() {
        let error = ErrorResponse {
            request_id: RequestId::new(),
            message: "no such user".into(),
            code: ErrorCode::NotFound,
            attributes: Default::default(),
            remediating_action: None,
            blame: Blame::Client,
        };
        let mut reply = reply_with(V1_1, &Response::Error(error.clone()));
        reply.status = 404;
        let (mut t, _) = transport(V1_1, vec![Ok(reply)]);

        let outcome = exchange(&mut t, &UserGet { user: UserId::new() }, Duration::from_secs(1));
        assert_eq!(outcome.unwrap(), Outcome::Refused(error));
    }

    #[test]
    fn mismatched_reply_type_is_a_protocol_error() {
        let (mut t, _) = transport(V1_1, vec![Ok(reply_with(V1_1, &done()))]);
        let err = exchange(&mut t, &UserGet { user: UserId::new() }, Duration::from_secs(1))
            .unwrap_err();
        let attributes = err.attributes();
        assert_eq!(attributes["expected_type"], "User");
        assert_eq!(attributes["received_type"], "Done");
    }

    #[test]
    fn disallowed_command_is_never_sent() {
        let (mut t, sent) = transport(V1_0, vec![]);
        let command = crate::command::AuditSearchNext;
        let err = exchange(&mut t, &command, Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Protocol);
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn channel_timeout_surfaces_as_timeout() {
        let (mut t, _) = transport(
            V1_1,
            vec![Err(ChannelError::Timeout(Duration::from_millis(5)))],
        );
        let err = exchange(&mut t, &Logout, Duration::from_millis(5)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Timeout);
    }
}
