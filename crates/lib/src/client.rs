use std::time::Duration;

use url::Url;

use crate::command::{
    AuditSearchBegin, AuditSearchNext, AuditSearchPrevious, Login, Logout, UserBan, UserCreate,
    UserDelete, UserGet, UserSearchBegin, UserSearchByEmailBegin, UserSearchByEmailNext,
    UserSearchByEmailPrevious, UserSearchNext, UserSearchPrevious, UserUnban,
};
use crate::connection::{Connection, Connector, DEFAULT_TIMEOUT};
use crate::error::ClientError;
use crate::model::{
    AuditEvent, AuditSearchParameters, Page, UserId, UserSearchByEmailParameters,
    UserSearchParameters, UserSummary, UserView,
};
use crate::negotiate::{SupportedProtocol, default_protocols};
use crate::version::ProtocolVersion;

#[cfg(feature = "http")]
use crate::negotiate::Negotiator;

/// Settings for an [`AccountClient`]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URI the server advertises its protocol versions at
    pub base: Url,
    /// Bound on every exchange, negotiation included
    pub timeout: Duration,
    /// Versions to offer, in order of preference for equal versions
    pub protocols: Vec<SupportedProtocol>,
}

impl ClientConfig {
    pub fn new(base: Url) -> Self {
        Self {
            base,
            timeout: DEFAULT_TIMEOUT,
            protocols: default_protocols(),
        }
    }
}

/// Which search a page request continues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Next,
    Previous,
}

/// Typed front end over a [`Connection`]
#[cfg(feature = "http")]
pub struct AccountClient<K: Connector = Negotiator> {
    connection: Connection<K>,
}

#[cfg(not(feature = "http"))]
pub struct AccountClient<K: Connector> {
    connection: Connection<K>,
}

#[cfg(feature = "http")]
impl AccountClient<Negotiator> {
    pub fn new(config: ClientConfig) -> Self {
        let negotiator = Negotiator::new(config.base, config.protocols);
        Self::with_connector(negotiator, config.timeout)
    }
}

impl<K: Connector> AccountClient<K> {
    pub fn with_connector(connector: K, timeout: Duration) -> Self {
        Self {
            connection: Connection::new(connector).with_timeout(timeout),
        }
    }

    pub fn connection(&mut self) -> &mut Connection<K> {
        &mut self.connection
    }

    pub fn protocol(&self) -> Option<ProtocolVersion> {
        self.connection.protocol()
    }

    pub fn login(&mut self, user_name: &str, password: &str) -> Result<UserSummary, ClientError> {
        let ok = self.connection.login(Login {
            user_name: user_name.to_string(),
            password: password.to_string(),
        })?;
        Ok(ok.user)
    }

    /// End the server session and close the connection
    pub fn logout(&mut self) -> Result<(), ClientError> {
        let result = self.connection.execute(&Logout).map(drop);
        self.connection.close();
        result
    }

    pub fn create_user(&mut self, command: UserCreate) -> Result<UserId, ClientError> {
        Ok(self.connection.execute(&command)?.user)
    }

    pub fn user(&mut self, user: UserId) -> Result<Option<UserView>, ClientError> {
        self.connection.execute_optional(&UserGet { user })
    }

    pub fn delete_user(&mut self, user: UserId) -> Result<(), ClientError> {
        self.connection.execute(&UserDelete { user }).map(drop)
    }

    pub fn ban_user(
        &mut self,
        user: UserId,
        reason: String,
        expires: Option<u64>,
    ) -> Result<(), ClientError> {
        self.connection
            .execute(&UserBan {
                user,
                reason,
                expires,
            })
            .map(drop)
    }

    pub fn unban_user(&mut self, user: UserId) -> Result<(), ClientError> {
        self.connection.execute(&UserUnban { user }).map(drop)
    }

    pub fn search_users(
        &mut self,
        parameters: UserSearchParameters,
    ) -> Result<Page<UserSummary>, ClientError> {
        self.connection.execute(&UserSearchBegin(parameters))
    }

    pub fn users_page(&mut self, direction: Direction) -> Result<Page<UserSummary>, ClientError> {
        match direction {
            Direction::Next => self.connection.execute(&UserSearchNext),
            Direction::Previous => self.connection.execute(&UserSearchPrevious),
        }
    }

    pub fn search_users_by_email(
        &mut self,
        parameters: UserSearchByEmailParameters,
    ) -> Result<Page<UserSummary>, ClientError> {
        self.connection.execute(&UserSearchByEmailBegin(parameters))
    }

    pub fn users_by_email_page(
        &mut self,
        direction: Direction,
    ) -> Result<Page<UserSummary>, ClientError> {
        match direction {
            Direction::Next => self.connection.execute(&UserSearchByEmailNext),
            Direction::Previous => self.connection.execute(&UserSearchByEmailPrevious),
        }
    }

    pub fn search_audit(
        &mut self,
        parameters: AuditSearchParameters,
    ) -> Result<Page<AuditEvent>, ClientError> {
        self.connection.execute(&AuditSearchBegin(parameters))
    }

    pub fn audit_page(&mut self, direction: Direction) -> Result<Page<AuditEvent>, ClientError> {
        match direction {
            Direction::Next => self.connection.execute(&AuditSearchNext),
            Direction::Previous => self.connection.execute(&AuditSearchPrevious),
        }
    }

    pub fn close(&mut self) {
        self.connection.close();
    }
}
