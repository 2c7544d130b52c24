//! Protocol generations spoken by this crate
//!
//! Each generation fixes a schema identifier, a content type and the closed
//! set of commands and replies that may appear on its wire.

use crate::command::{CommandKind, ReplyKind};
use crate::protocol::ProtocolIdentifier;

pub const PROTOCOL_NAME: &str = "acct-admin";

/// One generation of the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub name: &'static str,
    pub major: u32,
    pub minor: u32,
    /// Diagnostic schema identifier written into every envelope
    pub schema: &'static str,
    /// Exact `Content-Type` of every request and reply body
    pub content_type: &'static str,
    pub commands: &'static [CommandKind],
    pub replies: &'static [ReplyKind],
}

impl ProtocolVersion {
    pub fn identifier(&self) -> ProtocolIdentifier {
        ProtocolIdentifier::new(self.name, self.major, self.minor)
    }

    pub fn matches(&self, identifier: &ProtocolIdentifier) -> bool {
        identifier.name == self.name
            && identifier.version_major == self.major
            && identifier.version_minor == self.minor
    }

    pub fn allows_command(&self, kind: CommandKind) -> bool {
        self.commands.contains(&kind)
    }

    pub fn allows_reply(&self, kind: ReplyKind) -> bool {
        self.replies.contains(&kind)
    }

    /// Path the server mounts this version under, relative to its base
    pub fn endpoint_path(&self) -> String {
        format!("adm/{}/{}/", self.major, self.minor)
    }
}

const V1_0_COMMANDS: &[CommandKind] = &[
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
];

const V1_0_REPLIES: &[ReplyKind] = &[
    ReplyKind::LoginOk,
    ReplyKind::Done,
    ReplyKind::UserCreated,
    ReplyKind::User,
    ReplyKind::UserPage,
];

pub const V1_0: ProtocolVersion = ProtocolVersion {
    name: PROTOCOL_NAME,
    major: 1,
    minor: 0,
    schema: "urn:warden:acct-admin:1.0",
    content_type: "application/vnd.warden.acct-admin+json; version=1.0",
    commands: V1_0_COMMANDS,
    replies: V1_0_REPLIES,
};

/// 1.1 adds email and audit searches
pub const V1_1: ProtocolVersion = ProtocolVersion {
    name: PROTOCOL_NAME,
    major: 1,
    minor: 1,
    schema: "urn:warden:acct-admin:1.1",
    content_type: "application/vnd.warden.acct-admin+json; version=1.1",
    commands: CommandKind::ALL,
    replies: ReplyKind::ALL,
};

/// Every generation this crate can speak, oldest first
pub const ALL_VERSIONS: &[ProtocolVersion] = &[V1_0, V1_1];

pub fn find(identifier: &ProtocolIdentifier) -> Option<ProtocolVersion> {
    ALL_VERSIONS.iter().copied().find(|v| v.matches(identifier))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_version_is_a_superset() {
        for kind in V1_0.commands {
            assert!(V1_1.allows_command(*kind));
        }
        for kind in V1_0.replies {
            assert!(V1_1.allows_reply(*kind));
        }
        assert!(!V1_0.allows_command(CommandKind::AuditSearchBegin));
        assert!(!V1_0.allows_reply(ReplyKind::AuditPage));
    }

    #[test]
    fn versions_have_distinct_wire_markers() {
        assert_ne!(V1_0.schema, V1_1.schema);
        assert_ne!(V1_0.content_type, V1_1.content_type);
        assert_eq!(V1_0.endpoint_path(), "adm/1/0/");
    }

    #[test]
    fn find_by_identifier() {
        let id = ProtocolIdentifier::new(PROTOCOL_NAME, 1, 1);
        assert_eq!(find(&id), Some(V1_1));
        assert_eq!(find(&ProtocolIdentifier::new("other", 1, 1)), None);
    }
}
