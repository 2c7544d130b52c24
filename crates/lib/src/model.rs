//! Domain values carried by commands and replies

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default number of items per page when a search does not ask for one
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Account identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Inclusive range of unix timestamps (seconds)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub lower: u64,
    pub upper: u64,
}

impl TimeRange {
    pub fn contains(&self, time: u64) -> bool {
        self.lower <= time && time <= self.upper
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self {
            lower: 0,
            upper: u64::MAX,
        }
    }
}

/// Sort key for one column; the store appends the primary key last
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnOrder<C> {
    pub column: C,
    pub ascending: bool,
}

impl<C> ColumnOrder<C> {
    pub fn ascending(column: C) -> Self {
        Self {
            column,
            ascending: true,
        }
    }

    pub fn descending(column: C) -> Self {
        Self {
            column,
            ascending: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserColumn {
    Id,
    Name,
    Email,
    RealName,
    Created,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditColumn {
    Id,
    Time,
    Owner,
    Kind,
}

/// Filter for the general user search
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSearchParameters {
    /// Creation time window
    #[serde(default)]
    pub time_range: TimeRange,
    /// Case-insensitive substring of name, real name or email
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub ordering: Vec<ColumnOrder<UserColumn>>,
    pub limit: u32,
}

impl Default for UserSearchParameters {
    fn default() -> Self {
        Self {
            time_range: TimeRange::default(),
            query: None,
            ordering: vec![ColumnOrder::ascending(UserColumn::Name)],
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Filter for searching users by email address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSearchByEmailParameters {
    #[serde(default)]
    pub time_range: TimeRange,
    /// Case-insensitive substring of the email address
    pub email: String,
    #[serde(default)]
    pub ordering: Vec<ColumnOrder<UserColumn>>,
    pub limit: u32,
}

impl Default for UserSearchByEmailParameters {
    fn default() -> Self {
        Self {
            time_range: TimeRange::default(),
            email: String::new(),
            ordering: vec![ColumnOrder::ascending(UserColumn::Email)],
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Filter for the audit log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSearchParameters {
    #[serde(default)]
    pub time_range: TimeRange,
    #[serde(default)]
    pub owner: Option<UserId>,
    /// Exact event kind, e.g. `USER_CREATED`
    #[serde(default)]
    pub kind: Option<String>,
    /// Case-insensitive substring of the message
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub ordering: Vec<ColumnOrder<AuditColumn>>,
    pub limit: u32,
}

impl Default for AuditSearchParameters {
    fn default() -> Self {
        Self {
            time_range: TimeRange::default(),
            owner: None,
            kind: None,
            message: None,
            ordering: vec![ColumnOrder::descending(AuditColumn::Time)],
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Row of a user search
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub real_name: String,
    pub admin: bool,
    pub created: u64,
}

/// Active ban on an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ban {
    pub reason: String,
    /// Unix time the ban lapses; `None` bans forever
    pub expires: Option<u64>,
}

impl Ban {
    pub fn is_active(&self, now: u64) -> bool {
        self.expires.is_none_or(|expires| now < expires)
    }
}

/// Full account record as seen by an administrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserView {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub real_name: String,
    pub admin: bool,
    pub created: u64,
    pub ban: Option<Ban>,
}

impl UserView {
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            name: self.name.clone(),
            email: self.email.clone(),
            real_name: self.real_name.clone(),
            admin: self.admin,
            created: self.created,
        }
    }
}

/// One audit log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: u64,
    pub time: u64,
    pub owner: UserId,
    pub kind: String,
    pub message: String,
}

/// One page of an ordered result set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// 1-based
    pub page_index: u32,
    pub page_count: u32,
    /// Absolute 0-based offset of `items[0]` in the full result set
    pub page_first_offset: u64,
}

impl<T> Page<T> {
    pub fn is_last(&self) -> bool {
        self.page_index >= self.page_count
    }

    /// Inclusive 1-based row range for "showing N-M" displays
    pub fn shown_range(&self) -> Option<(u64, u64)> {
        if self.items.is_empty() {
            return None;
        }
        let first = self.page_first_offset + 1;
        Some((first, first + self.items.len() as u64 - 1))
    }
}
