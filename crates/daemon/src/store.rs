//! In-memory account store
//!
//! Every command works on its own [`Transaction`] over a snapshot of the
//! committed state. Taking a snapshot clones two `Arc`s and never waits for
//! writers, so read-only commands run side by side.
//!
//! Writes stay private until [`commit`]. Audit records are buffered and
//! appended to the shared log at commit time, when they also receive their
//! ids. The first write to the users table takes the store's writer lock and
//! checks that no other transaction changed the table since the snapshot; if
//! one did, the write fails with [`SERIALIZATION_FAILURE`] and the command
//! may be retried on a fresh snapshot. Dropping a transaction without
//! committing discards its writes.
//!
//! [`commit`]: Transaction::commit

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use libwarden::model::{
    AuditColumn, AuditEvent, AuditSearchParameters, Ban, ColumnOrder, UserColumn, UserId,
    UserSearchByEmailParameters, UserSearchParameters, UserSummary, UserView,
};
use thiserror::Error;

use crate::paging::PagedSource;

/// SQLSTATE class 23 code for a unique constraint violation
pub const UNIQUE_VIOLATION: &str = "23505";
/// Code for writes against a row that does not exist
pub const NO_DATA: &str = "02000";
/// Code for a write that lost the race against a concurrent commit
pub const SERIALIZATION_FAILURE: &str = "40001";

/// Failure reported by the storage layer; `code` passes through to clients
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StorageError {
    pub code: String,
    pub message: String,
    /// Constraint or column the failure refers to
    pub constraint: Option<String>,
}

impl StorageError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            constraint: None,
        }
    }

    fn unique(constraint: &str, value: &str) -> Self {
        Self {
            code: UNIQUE_VIOLATION.to_string(),
            message: format!("duplicate key value {value:?} violates unique constraint {constraint}"),
            constraint: Some(constraint.to_string()),
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        self.code == UNIQUE_VIOLATION
    }

    pub fn is_serialization_failure(&self) -> bool {
        self.code == SERIALIZATION_FAILURE
    }
}

/// Stored account, password hash included
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub real_name: String,
    pub admin: bool,
    pub created: u64,
    pub password_hash: String,
    pub ban: Option<Ban>,
}

impl UserRecord {
    pub fn view(&self) -> UserView {
        UserView {
            id: self.id,
            name: self.name.clone(),
            email: self.email.clone(),
            real_name: self.real_name.clone(),
            admin: self.admin,
            created: self.created,
            ban: self.ban.clone(),
        }
    }

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

/// Published state; `audit_len` bounds the part of the log it covers
#[derive(Debug, Clone, Default)]
struct Committed {
    users: Arc<HashMap<UserId, UserRecord>>,
    audit_len: usize,
    /// Bumped by every commit that changes the users table
    version: u64,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    committed: RwLock<Committed>,
    /// Append-only; entries past a snapshot's `audit_len` are invisible to it
    audit: RwLock<Vec<AuditEvent>>,
    writer: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a transaction on the current committed state
    pub fn begin(&self) -> Transaction<'_> {
        let base = self
            .committed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        Transaction {
            store: self,
            users: Arc::clone(&base.users),
            base,
            appended: Vec::new(),
            writer: None,
        }
    }
}

pub struct Transaction<'a> {
    store: &'a MemoryStore,
    base: Committed,
    /// Shared with `base` until the first users write
    users: Arc<HashMap<UserId, UserRecord>>,
    appended: Vec<PendingAudit>,
    writer: Option<MutexGuard<'a, ()>>,
}

#[derive(Debug)]
struct PendingAudit {
    time: u64,
    owner: UserId,
    kind: String,
    message: String,
}

impl Transaction<'_> {
    /// Publish the writes; a read-only transaction publishes nothing
    pub fn commit(self) {
        if self.writer.is_none() && self.appended.is_empty() {
            return;
        }
        let store = self.store;
        let _writer = match self.writer {
            Some(guard) => guard,
            None => store.writer.lock().unwrap_or_else(|e| e.into_inner()),
        };

        let audit_len = {
            let mut log = store.audit.write().unwrap_or_else(|e| e.into_inner());
            for pending in self.appended {
                let id = log.len() as u64 + 1;
                log.push(AuditEvent {
                    id,
                    time: pending.time,
                    owner: pending.owner,
                    kind: pending.kind,
                    message: pending.message,
                });
            }
            log.len()
        };

        let mut committed = store.committed.write().unwrap_or_else(|e| e.into_inner());
        committed.audit_len = audit_len;
        if !Arc::ptr_eq(&committed.users, &self.users) {
            committed.users = self.users;
            committed.version += 1;
        }
    }

    /// Take the writer lock before the first users write
    fn for_update(&mut self) -> Result<&mut HashMap<UserId, UserRecord>, StorageError> {
        if self.writer.is_none() {
            let guard = self.store.writer.lock().unwrap_or_else(|e| e.into_inner());
            let version = self
                .store
                .committed
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .version;
            if version != self.base.version {
                return Err(StorageError::new(
                    SERIALIZATION_FAILURE,
                    "could not serialize access due to concurrent update",
                ));
            }
            self.writer = Some(guard);
        }
        Ok(Arc::make_mut(&mut self.users))
    }

    pub fn user(&self, id: UserId) -> Option<&UserRecord> {
        self.users.get(&id)
    }

    pub fn user_by_name(&self, name: &str) -> Option<&UserRecord> {
        self.users.values().find(|user| user.name == name)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn insert_user(&mut self, record: UserRecord) -> Result<(), StorageError> {
        for existing in self.users.values() {
            if existing.name == record.name {
                return Err(StorageError::unique("users_name_key", &record.name));
            }
            if existing.email.eq_ignore_ascii_case(&record.email) {
                return Err(StorageError::unique("users_email_key", &record.email));
            }
        }
        if self.users.contains_key(&record.id) {
            return Err(StorageError::unique("users_pkey", &record.id.to_string()));
        }
        self.for_update()?.insert(record.id, record);
        Ok(())
    }

    pub fn delete_user(&mut self, id: UserId) -> Result<Option<UserRecord>, StorageError> {
        if !self.users.contains_key(&id) {
            return Ok(None);
        }
        Ok(self.for_update()?.remove(&id))
    }

    pub fn set_ban(&mut self, id: UserId, ban: Option<Ban>) -> Result<(), StorageError> {
        if !self.users.contains_key(&id) {
            return Err(StorageError::new(NO_DATA, format!("no user row with id {id}")));
        }
        if let Some(user) = self.for_update()?.get_mut(&id) {
            user.ban = ban;
        }
        Ok(())
    }

    /// Queue one audit log record; ids are assigned on commit
    pub fn append_audit(&mut self, time: u64, owner: UserId, kind: &str, message: String) {
        self.appended.push(PendingAudit {
            time,
            owner,
            kind: kind.to_string(),
            message,
        });
    }

    fn users_where(&self, keep: impl Fn(&UserRecord) -> bool) -> Vec<&UserRecord> {
        self.users.values().filter(|user| keep(user)).collect()
    }

    /// Run `f` over the audit records this snapshot can see that match
    /// `parameters`, the transaction's own pending records excluded
    fn audit_where<R>(
        &self,
        parameters: &AuditSearchParameters,
        f: impl FnOnce(Vec<&AuditEvent>) -> R,
    ) -> R {
        let kind = parameters.kind.as_deref();
        let message = parameters.message.as_deref().map(str::to_lowercase);
        let log = self.store.audit.read().unwrap_or_else(|e| e.into_inner());
        let rows = log[..self.base.audit_len]
            .iter()
            .filter(|event| parameters.time_range.contains(event.time))
            .filter(|event| parameters.owner.is_none_or(|owner| owner == event.owner))
            .filter(|event| kind.is_none_or(|kind| kind.eq_ignore_ascii_case(&event.kind)))
            .filter(|event| {
                message
                    .as_deref()
                    .is_none_or(|needle| event.message.to_lowercase().contains(needle))
            })
            .collect();
        f(rows)
    }
}

fn matches_query(user: &UserRecord, query: Option<&str>) -> bool {
    let Some(query) = query else {
        return true;
    };
    let query = query.to_lowercase();
    [&user.name, &user.real_name, &user.email]
        .iter()
        .any(|field| field.to_lowercase().contains(&query))
}

fn compare_users(ordering: &[ColumnOrder<UserColumn>], a: &UserRecord, b: &UserRecord) -> Ordering {
    ordering
        .iter()
        .map(|order| {
            let cmp = match order.column {
                UserColumn::Id => a.id.cmp(&b.id),
                UserColumn::Name => a.name.cmp(&b.name),
                UserColumn::Email => a.email.cmp(&b.email),
                UserColumn::RealName => a.real_name.cmp(&b.real_name),
                UserColumn::Created => a.created.cmp(&b.created),
            };
            if order.ascending { cmp } else { cmp.reverse() }
        })
        .find(|cmp| cmp.is_ne())
        .unwrap_or_else(|| a.id.cmp(&b.id))
}

fn compare_audit(ordering: &[ColumnOrder<AuditColumn>], a: &AuditEvent, b: &AuditEvent) -> Ordering {
    ordering
        .iter()
        .map(|order| {
            let cmp = match order.column {
                AuditColumn::Id => a.id.cmp(&b.id),
                AuditColumn::Time => a.time.cmp(&b.time),
                AuditColumn::Owner => a.owner.cmp(&b.owner),
                AuditColumn::Kind => a.kind.cmp(&b.kind),
            };
            if order.ascending { cmp } else { cmp.reverse() }
        })
        .find(|cmp| cmp.is_ne())
        .unwrap_or_else(|| a.id.cmp(&b.id))
}

fn window<T>(rows: Vec<T>, offset: u64, limit: u32) -> Vec<T> {
    let offset = usize::try_from(offset).unwrap_or(usize::MAX);
    rows.into_iter().skip(offset).take(limit as usize).collect()
}

impl PagedSource<UserSearchParameters> for Transaction<'_> {
    type Item = UserSummary;

    fn count(&self, parameters: &UserSearchParameters) -> Result<u64, StorageError> {
        let query = parameters.query.as_deref();
        Ok(self
            .users_where(|u| parameters.time_range.contains(u.created) && matches_query(u, query))
            .len() as u64)
    }

    fn fetch(
        &self,
        parameters: &UserSearchParameters,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<UserSummary>, StorageError> {
        let query = parameters.query.as_deref();
        let mut rows = self
            .users_where(|u| parameters.time_range.contains(u.created) && matches_query(u, query));
        rows.sort_by(|a, b| compare_users(&parameters.ordering, a, b));
        Ok(window(rows, offset, limit)
            .into_iter()
            .map(UserRecord::summary)
            .collect())
    }
}

impl PagedSource<UserSearchByEmailParameters> for Transaction<'_> {
    type Item = UserSummary;

    fn count(&self, parameters: &UserSearchByEmailParameters) -> Result<u64, StorageError> {
        let needle = parameters.email.to_lowercase();
        Ok(self
            .users_where(|u| {
                parameters.time_range.contains(u.created) && u.email.to_lowercase().contains(&needle)
            })
            .len() as u64)
    }

    fn fetch(
        &self,
        parameters: &UserSearchByEmailParameters,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<UserSummary>, StorageError> {
        let needle = parameters.email.to_lowercase();
        let mut rows = self.users_where(|u| {
            parameters.time_range.contains(u.created) && u.email.to_lowercase().contains(&needle)
        });
        rows.sort_by(|a, b| compare_users(&parameters.ordering, a, b));
        Ok(window(rows, offset, limit)
            .into_iter()
            .map(UserRecord::summary)
            .collect())
    }
}

impl PagedSource<AuditSearchParameters> for Transaction<'_> {
    type Item = AuditEvent;

    fn count(&self, parameters: &AuditSearchParameters) -> Result<u64, StorageError> {
        Ok(self.audit_where(parameters, |rows| rows.len() as u64))
    }

    fn fetch(
        &self,
        parameters: &AuditSearchParameters,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<AuditEvent>, StorageError> {
        Ok(self.audit_where(parameters, |mut rows| {
            rows.sort_by(|a, b| compare_audit(&parameters.ordering, a, b));
            window(rows, offset, limit).into_iter().cloned().collect()
        }))
    }
}
