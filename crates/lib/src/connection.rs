//! Connection state machine
//!
//! A [`Connection`] is either disconnected, possibly with a negotiated
//! transport still bound, or connected with the credentials of its last
//! successful login. Authentication failures on ordinary commands trigger a
//! bounded number of transparent re-logins; every other failure is returned
//! to the caller untouched.
//!
//! # Retries
//!
//! After an authentication failure the original command is sent again once
//! the remembered login succeeds, at most [`MAX_RELOGIN_ATTEMPTS`] times. The
//! command is re-sent whether or not it is idempotent.
//!
//! The timeout applies to each exchange, not to the whole call: one
//! [`Connection::execute`] performs up to `2 * MAX_RELOGIN_ATTEMPTS + 1`
//! exchanges (three sends of the command and two logins) and may block for
//! that many timeouts.

use std::mem;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::command::{Command, Login, LoginOk};
use crate::error::ClientError;
use crate::protocol::ErrorResponse;
use crate::transport::{Outcome, Transport, exchange};
use crate::version::ProtocolVersion;

/// Re-logins allowed per command; the command is sent at most one more time
/// than this
pub const MAX_RELOGIN_ATTEMPTS: u32 = 2;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Source of transports for a connection that has none bound yet
pub trait Connector: Send {
    fn connect(&mut self, timeout: Duration) -> Result<Box<dyn Transport>, ClientError>;
}

struct Connected {
    transport: Box<dyn Transport>,
    last_login: Login,
}

enum State {
    Disconnected { bound: Option<Box<dyn Transport>> },
    Connected(Connected),
}

impl State {
    fn transport(&self) -> Option<&dyn Transport> {
        match self {
            State::Disconnected { bound } => bound.as_deref(),
            State::Connected(connected) => Some(connected.transport.as_ref()),
        }
    }
}

/// Client side of one authenticated conversation with the server
pub struct Connection<K> {
    connector: K,
    state: State,
    timeout: Duration,
}

impl<K: Connector> Connection<K> {
    pub fn new(connector: K) -> Self {
        Self {
            connector,
            state: State::Disconnected { bound: None },
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, State::Connected(_))
    }

    /// Version of the bound transport, if negotiation has happened
    pub fn protocol(&self) -> Option<ProtocolVersion> {
        self.state.transport().map(|t| *t.version())
    }

    pub fn connector(&self) -> &K {
        &self.connector
    }

    /// Log in, negotiating first when no transport is bound.
    ///
    /// A refused login leaves the connection disconnected with its transport
    /// still bound. Any other failure leaves the state as it was.
    pub fn login(&mut self, login: Login) -> Result<LoginOk, ClientError> {
        let previous = mem::replace(&mut self.state, State::Disconnected { bound: None });
        let (mut transport, previous_login) = match previous {
            State::Connected(Connected {
                transport,
                last_login,
            }) => (transport, Some(last_login)),
            State::Disconnected { bound: Some(transport) } => (transport, None),
            State::Disconnected { bound: None } => (self.connector.connect(self.timeout)?, None),
        };

        match exchange(transport.as_mut(), &login, self.timeout) {
            Ok(Outcome::Reply(ok)) => {
                info!(user = %ok.user.name, "logged in");
                self.state = State::Connected(Connected {
                    transport,
                    last_login: login,
                });
                Ok(ok)
            }
            Ok(Outcome::Refused(error)) => {
                warn!(code = %error.code, request_id = %error.request_id, "login refused");
                self.state = State::Disconnected {
                    bound: Some(transport),
                };
                Err(ClientError::Server(error))
            }
            Err(err) => {
                self.state = match previous_login {
                    Some(last_login) => State::Connected(Connected {
                        transport,
                        last_login,
                    }),
                    None => State::Disconnected {
                        bound: Some(transport),
                    },
                };
                Err(err)
            }
        }
    }

    /// Send `command` and return its typed reply.
    ///
    /// Each exchange gets the full [`timeout`](Self::timeout); with re-logins
    /// the call can take up to five of them.
    pub fn execute<C: Command>(&mut self, command: &C) -> Result<C::Reply, ClientError> {
        let mut relogins = 0;
        loop {
            let State::Connected(connected) = &mut self.state else {
                return Err(ClientError::NotLoggedIn);
            };
            match exchange(connected.transport.as_mut(), command, self.timeout)? {
                Outcome::Reply(reply) => return Ok(reply),
                Outcome::Refused(error) if retriable::<C>(&error) => {
                    if relogins == MAX_RELOGIN_ATTEMPTS {
                        warn!(command = %C::KIND, attempts = relogins + 1, "giving up after repeated authentication failures");
                        return Err(ClientError::Server(error));
                    }
                    relogins += 1;
                    debug!(command = %C::KIND, relogins, "session rejected, logging in again");
                    self.relogin()?;
                }
                Outcome::Refused(error) => return Err(ClientError::Server(error)),
            }
        }
    }

    /// Like [`execute`](Self::execute), with a missing resource as `None`
    pub fn execute_optional<C: Command>(
        &mut self,
        command: &C,
    ) -> Result<Option<C::Reply>, ClientError> {
        match self.execute(command) {
            Ok(reply) => Ok(Some(reply)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Drop the transport and forget the login
    pub fn close(&mut self) {
        let previous = mem::replace(&mut self.state, State::Disconnected { bound: None });
        let transport = match previous {
            State::Connected(connected) => Some(connected.transport),
            State::Disconnected { bound } => bound,
        };
        if let Some(mut transport) = transport {
            transport.close();
            debug!("connection closed");
        }
    }

    /// Re-send the remembered login, replacing the connected state
    fn relogin(&mut self) -> Result<(), ClientError> {
        let previous = mem::replace(&mut self.state, State::Disconnected { bound: None });
        let State::Connected(Connected {
            mut transport,
            last_login,
        }) = previous
        else {
            self.state = previous;
            return Err(ClientError::NotLoggedIn);
        };

        match exchange(transport.as_mut(), &last_login, self.timeout) {
            Ok(Outcome::Reply(_)) => {
                self.state = State::Connected(Connected {
                    transport,
                    last_login,
                });
                Ok(())
            }
            Ok(Outcome::Refused(error)) => {
                warn!(code = %error.code, "stored credentials were rejected");
                self.state = State::Disconnected {
                    bound: Some(transport),
                };
                Err(ClientError::Server(error))
            }
            Err(err) => {
                self.state = State::Connected(Connected {
                    transport,
                    last_login,
                });
                Err(err)
            }
        }
    }
}

impl<K> Drop for Connection<K> {
    fn drop(&mut self) {
        let transport = match &mut self.state {
            State::Connected(connected) => Some(&mut connected.transport),
            State::Disconnected { bound } => bound.as_mut(),
        };
        if let Some(transport) = transport {
            transport.close();
        }
    }
}

fn retriable<C: Command>(error: &ErrorResponse) -> bool {
    error.is_authentication() && !C::KIND.is_login()
}
