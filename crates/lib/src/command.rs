//! Commands, replies and their wire discriminators
//!
//! Every command is a struct implementing [`Command`], which names the reply
//! type the server promises for it. On the wire all commands travel as one
//! closed enum, [`CommandMessage`], and all successful replies as [`Reply`].
//!
//! # Registry
//!
//! Discriminator strings are not derived from type names. They come from the
//! explicit tables [`CommandKind::ALL`] and [`ReplyKind::ALL`], and
//! [`verify_registry`] checks those tables for completeness and uniqueness.
//! The codec refuses any discriminator it cannot find there.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{
    AuditEvent, AuditSearchParameters, Page, UserId, UserSearchByEmailParameters,
    UserSearchParameters, UserSummary, UserView,
};

/// Discriminator of an error response
pub const ERROR_DISCRIMINATOR: &str = "Error";

/// A request whose static type names the expected reply
pub trait Command: Clone + Into<CommandMessage> {
    type Reply;

    const KIND: CommandKind;
    const REPLY: ReplyKind;

    /// Take the promised payload out of a reply, or give the reply back if it
    /// is of another kind
    fn extract(reply: Reply) -> Result<Self::Reply, Reply>;
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Login {
    pub user_name: String,
    pub password: String,
}

impl fmt::Debug for Login {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Login")
            .field("user_name", &self.user_name)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Logout;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCreate {
    pub name: String,
    pub email: String,
    pub real_name: String,
    pub password: String,
    #[serde(default)]
    pub admin: bool,
}

impl fmt::Debug for UserCreate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserCreate")
            .field("name", &self.name)
            .field("email", &self.email)
            .field("real_name", &self.real_name)
            .field("password", &"<redacted>")
            .field("admin", &self.admin)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserGet {
    pub user: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDelete {
    pub user: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBan {
    pub user: UserId,
    pub reason: String,
    #[serde(default)]
    pub expires: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserUnban {
    pub user: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSearchBegin(pub UserSearchParameters);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSearchNext;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSearchPrevious;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSearchByEmailBegin(pub UserSearchByEmailParameters);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSearchByEmailNext;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSearchByEmailPrevious;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSearchBegin(pub AuditSearchParameters);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSearchNext;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSearchPrevious;

/// Every command, as it travels on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum CommandMessage {
    Login(Login),
    Logout(Logout),
    UserCreate(UserCreate),
    UserGet(UserGet),
    UserDelete(UserDelete),
    UserBan(UserBan),
    UserUnban(UserUnban),
    UserSearchBegin(UserSearchBegin),
    UserSearchNext(UserSearchNext),
    UserSearchPrevious(UserSearchPrevious),
    UserSearchByEmailBegin(UserSearchByEmailBegin),
    UserSearchByEmailNext(UserSearchByEmailNext),
    UserSearchByEmailPrevious(UserSearchByEmailPrevious),
    AuditSearchBegin(AuditSearchBegin),
    AuditSearchNext(AuditSearchNext),
    AuditSearchPrevious(AuditSearchPrevious),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Login,
    Logout,
    UserCreate,
    UserGet,
    UserDelete,
    UserBan,
    UserUnban,
    UserSearchBegin,
    UserSearchNext,
    UserSearchPrevious,
    UserSearchByEmailBegin,
    UserSearchByEmailNext,
    UserSearchByEmailPrevious,
    AuditSearchBegin,
    AuditSearchNext,
    AuditSearchPrevious,
}

impl CommandKind {
    pub const ALL: &'static [CommandKind] = &[
        CommandKind::Login,
        CommandKind::Logout,
        CommandKind::UserCreate,
        CommandKind::UserGet,
        CommandKind::UserDelete,
        CommandKind::UserBan,
        CommandKind::UserUnban,
        CommandKind::UserSearchBegin,
        CommandKind::UserSearchNext,
        CommandKind::UserSearchPrevious,
        CommandKind::UserSearchByEmailBegin,
        CommandKind::UserSearchByEmailNext,
        CommandKind::UserSearchByEmailPrevious,
        CommandKind::AuditSearchBegin,
        CommandKind::AuditSearchNext,
        CommandKind::AuditSearchPrevious,
    ];

    pub fn discriminator(self) -> &'static str {
        match self {
            CommandKind::Login => "Login",
            CommandKind::Logout => "Logout",
            CommandKind::UserCreate => "UserCreate",
            CommandKind::UserGet => "UserGet",
            CommandKind::UserDelete => "UserDelete",
            CommandKind::UserBan => "UserBan",
            CommandKind::UserUnban => "UserUnban",
            CommandKind::UserSearchBegin => "UserSearchBegin",
            CommandKind::UserSearchNext => "UserSearchNext",
            CommandKind::UserSearchPrevious => "UserSearchPrevious",
            CommandKind::UserSearchByEmailBegin => "UserSearchByEmailBegin",
            CommandKind::UserSearchByEmailNext => "UserSearchByEmailNext",
            CommandKind::UserSearchByEmailPrevious => "UserSearchByEmailPrevious",
            CommandKind::AuditSearchBegin => "AuditSearchBegin",
            CommandKind::AuditSearchNext => "AuditSearchNext",
            CommandKind::AuditSearchPrevious => "AuditSearchPrevious",
        }
    }

    pub fn from_discriminator(discriminator: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.discriminator() == discriminator)
    }

    /// Login goes to its own endpoint and is never retried by re-login
    pub fn is_login(self) -> bool {
        matches!(self, CommandKind::Login)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.discriminator())
    }
}

impl CommandMessage {
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandMessage::Login(_) => CommandKind::Login,
            CommandMessage::Logout(_) => CommandKind::Logout,
            CommandMessage::UserCreate(_) => CommandKind::UserCreate,
            CommandMessage::UserGet(_) => CommandKind::UserGet,
            CommandMessage::UserDelete(_) => CommandKind::UserDelete,
            CommandMessage::UserBan(_) => CommandKind::UserBan,
            CommandMessage::UserUnban(_) => CommandKind::UserUnban,
            CommandMessage::UserSearchBegin(_) => CommandKind::UserSearchBegin,
            CommandMessage::UserSearchNext(_) => CommandKind::UserSearchNext,
            CommandMessage::UserSearchPrevious(_) => CommandKind::UserSearchPrevious,
            CommandMessage::UserSearchByEmailBegin(_) => CommandKind::UserSearchByEmailBegin,
            CommandMessage::UserSearchByEmailNext(_) => CommandKind::UserSearchByEmailNext,
            CommandMessage::UserSearchByEmailPrevious(_) => {
                CommandKind::UserSearchByEmailPrevious
            }
            CommandMessage::AuditSearchBegin(_) => CommandKind::AuditSearchBegin,
            CommandMessage::AuditSearchNext(_) => CommandKind::AuditSearchNext,
            CommandMessage::AuditSearchPrevious(_) => CommandKind::AuditSearchPrevious,
        }
    }
}

/// Payload of a successful login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginOk {
    pub user: UserSummary,
}

/// Payload of commands that only acknowledge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Done;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCreated {
    pub user: UserId,
}

/// Every successful reply payload, as it travels on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum Reply {
    LoginOk(LoginOk),
    Done(Done),
    UserCreated(UserCreated),
    User(UserView),
    UserPage(Page<UserSummary>),
    AuditPage(Page<AuditEvent>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyKind {
    LoginOk,
    Done,
    UserCreated,
    User,
    UserPage,
    AuditPage,
}

impl ReplyKind {
    pub const ALL: &'static [ReplyKind] = &[
        ReplyKind::LoginOk,
        ReplyKind::Done,
        ReplyKind::UserCreated,
        ReplyKind::User,
        ReplyKind::UserPage,
        ReplyKind::AuditPage,
    ];

    pub fn discriminator(self) -> &'static str {
        match self {
            ReplyKind::LoginOk => "LoginOk",
            ReplyKind::Done => "Done",
            ReplyKind::UserCreated => "UserCreated",
            ReplyKind::User => "User",
            ReplyKind::UserPage => "UserPage",
            ReplyKind::AuditPage => "AuditPage",
        }
    }

    pub fn from_discriminator(discriminator: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.discriminator() == discriminator)
    }
}

impl fmt::Display for ReplyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.discriminator())
    }
}

impl Reply {
    pub fn kind(&self) -> ReplyKind {
        match self {
            Reply::LoginOk(_) => ReplyKind::LoginOk,
            Reply::Done(_) => ReplyKind::Done,
            Reply::UserCreated(_) => ReplyKind::UserCreated,
            Reply::User(_) => ReplyKind::User,
            Reply::UserPage(_) => ReplyKind::UserPage,
            Reply::AuditPage(_) => ReplyKind::AuditPage,
        }
    }
}

macro_rules! commands {
    ($($command:ident => $reply:ident($payload:ty)),* $(,)?) => {
        $(
            impl From<$command> for CommandMessage {
                fn from(command: $command) -> Self {
                    CommandMessage::$command(command)
                }
            }

            impl Command for $command {
                type Reply = $payload;

                const KIND: CommandKind = CommandKind::$command;
                const REPLY: ReplyKind = ReplyKind::$reply;

                fn extract(reply: Reply) -> Result<$payload, Reply> {
                    match reply {
                        Reply::$reply(payload) => Ok(payload),
                        other => Err(other),
                    }
                }
            }
        )*
    };
}

commands! {
    Login => LoginOk(LoginOk),
    Logout => Done(Done),
    UserCreate => UserCreated(UserCreated),
    UserGet => User(UserView),
    UserDelete => Done(Done),
    UserBan => Done(Done),
    UserUnban => Done(Done),
    UserSearchBegin => UserPage(Page<UserSummary>),
    UserSearchNext => UserPage(Page<UserSummary>),
    UserSearchPrevious => UserPage(Page<UserSummary>),
    UserSearchByEmailBegin => UserPage(Page<UserSummary>),
    UserSearchByEmailNext => UserPage(Page<UserSummary>),
    UserSearchByEmailPrevious => UserPage(Page<UserSummary>),
    AuditSearchBegin => AuditPage(Page<AuditEvent>),
    AuditSearchNext => AuditPage(Page<AuditEvent>),
    AuditSearchPrevious => AuditPage(Page<AuditEvent>),
}

/// Registry inconsistency found by [`verify_registry`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("discriminator registry is inconsistent: {0}")]
pub struct RegistryError(pub String);

/// Check that every discriminator is unique across commands, replies and the
/// error response, and that each one maps back to its own kind.
pub fn verify_registry() -> Result<(), RegistryError> {
    let mut seen = HashSet::new();
    seen.insert(ERROR_DISCRIMINATOR);

    for kind in CommandKind::ALL {
        let discriminator = kind.discriminator();
        if !seen.insert(discriminator) {
            return Err(RegistryError(format!("duplicate discriminator {discriminator}")));
        }
        if CommandKind::from_discriminator(discriminator) != Some(*kind) {
            return Err(RegistryError(format!("{discriminator} does not map back")));
        }
    }

    for kind in ReplyKind::ALL {
        let discriminator = kind.discriminator();
        if !seen.insert(discriminator) {
            return Err(RegistryError(format!("duplicate discriminator {discriminator}")));
        }
        if ReplyKind::from_discriminator(discriminator) != Some(*kind) {
            return Err(RegistryError(format!("{discriminator} does not map back")));
        }
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod samples {
    //! One value of every command and reply, shared by codec tests

    use super::*;
    use crate::model::{Ban, ColumnOrder, TimeRange, UserColumn};

    pub fn user() -> UserView {
        UserView {
            id: UserId::new(),
            name: "grace".into(),
            email: "grace@example.com".into(),
            real_name: "Grace Hopper".into(),
            admin: true,
            created: 1_700_000_000,
            ban: Some(Ban {
                reason: "testing".into(),
                expires: Some(1_800_000_000),
            }),
        }
    }

    pub fn commands() -> Vec<CommandMessage> {
        let id = UserId::new();
        vec![
            Login {
                user_name: "grace".into(),
                password: "hunter22".into(),
            }
            .into(),
            Logout.into(),
            UserCreate {
                name: "ada".into(),
                email: "ada@example.com".into(),
                real_name: "Ada Lovelace".into(),
                password: "analytical".into(),
                admin: false,
            }
            .into(),
            UserGet { user: id }.into(),
            UserDelete { user: id }.into(),
            UserBan {
                user: id,
                reason: "spam".into(),
                expires: Some(1_800_000_000),
            }
            .into(),
            UserUnban { user: id }.into(),
            UserSearchBegin(UserSearchParameters {
                time_range: TimeRange {
                    lower: 10,
                    upper: 20,
                },
                query: Some("gr".into()),
                ordering: vec![ColumnOrder::descending(UserColumn::Created)],
                limit: 7,
            })
            .into(),
            UserSearchNext.into(),
            UserSearchPrevious.into(),
            UserSearchByEmailBegin(UserSearchByEmailParameters {
                email: "example.com".into(),
                ..Default::default()
            })
            .into(),
            UserSearchByEmailNext.into(),
            UserSearchByEmailPrevious.into(),
            AuditSearchBegin(AuditSearchParameters {
                owner: Some(id),
                kind: Some("USER_CREATED".into()),
                ..Default::default()
            })
            .into(),
            AuditSearchNext.into(),
            AuditSearchPrevious.into(),
        ]
    }

    pub fn replies() -> Vec<Reply> {
        let user = user();
        vec![
            Reply::LoginOk(LoginOk {
                user: user.summary(),
            }),
            Reply::Done(Done),
            Reply::UserCreated(UserCreated { user: user.id }),
            Reply::User(user.clone()),
            Reply::UserPage(Page {
                items: vec![user.summary()],
                page_index: 2,
                page_count: 5,
                page_first_offset: 10,
            }),
            Reply::AuditPage(Page {
                items: vec![AuditEvent {
                    id: 4,
                    time: 1_700_000_001,
                    owner: user.id,
                    kind: "USER_CREATED".into(),
                    message: "created ada".into(),
                }],
                page_index: 1,
                page_count: 1,
                page_first_offset: 0,
            }),
        ]
    }
}
