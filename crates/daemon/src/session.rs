use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock, TryLockError};
use std::time::{Duration, Instant};

use libwarden::model::{
    AuditSearchParameters, UserId, UserSearchByEmailParameters, UserSearchParameters,
};
use tracing::debug;
use uuid::Uuid;

use crate::paging::PagingCursor;

/// Name of the cookie carrying a [`SessionKey`]
pub const SESSION_COOKIE: &str = "warden_session";

/// Session identity, rendered as `<principal>.<session>` in the cookie
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub principal: UserId,
    pub session: Uuid,
}

impl SessionKey {
    pub fn new(principal: UserId) -> Self {
        Self {
            principal,
            session: Uuid::new_v4(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.principal, self.session.simple())
    }
}

impl FromStr for SessionKey {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (principal, session) = s.split_once('.').unwrap_or((s, ""));
        Ok(Self {
            principal: principal.parse()?,
            session: Uuid::parse_str(session)?,
        })
    }
}

/// Search cursors of one session, one per search kind
#[derive(Debug, Default)]
pub struct Cursors {
    pub users: Option<PagingCursor<UserSearchParameters>>,
    pub users_by_email: Option<PagingCursor<UserSearchByEmailParameters>>,
    pub audit: Option<PagingCursor<AuditSearchParameters>>,
}

#[derive(Debug)]
pub struct Session {
    pub key: SessionKey,
    pub user_name: String,
    pub admin: bool,
    pub cursors: Cursors,
    last_seen: Instant,
}

pub type SessionHandle = Arc<Mutex<Session>>;

/// Live sessions, evicted after `idle_timeout` without use
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionKey, SessionHandle>>,
    idle_timeout: Duration,
}

impl SessionStore {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            idle_timeout,
        }
    }

    pub fn create(&self, principal: UserId, user_name: &str, admin: bool) -> SessionKey {
        let key = SessionKey::new(principal);
        let session = Session {
            key,
            user_name: user_name.to_string(),
            admin,
            cursors: Cursors::default(),
            last_seen: Instant::now(),
        };
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.insert(key, Arc::new(Mutex::new(session)));
        debug!(session = %key, "session created");
        key
    }

    /// Look up a live session and mark it used
    pub fn get(&self, key: &SessionKey) -> Option<SessionHandle> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &SessionKey, now: Instant) -> Option<SessionHandle> {
        let handle = {
            let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            sessions.get(key).cloned()?
        };

        let expired = {
            let mut session = handle.lock().unwrap_or_else(|e| e.into_inner());
            if now.duration_since(session.last_seen) >= self.idle_timeout {
                true
            } else {
                session.last_seen = now;
                false
            }
        };
        if expired {
            debug!(session = %key, "session expired");
            self.remove(key);
            return None;
        }
        Some(handle)
    }

    pub fn remove(&self, key: &SessionKey) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.remove(key).is_some()
    }

    /// End every session of `principal`; returns how many were ended
    pub fn remove_principal(&self, principal: UserId) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|key, _| key.principal != principal);
        before - sessions.len()
    }

    /// Evict idle sessions; returns how many were evicted. Sessions locked by
    /// a running command are in use and kept.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, handle| match handle.try_lock() {
            Ok(session) => now.duration_since(session.last_seen) < self.idle_timeout,
            Err(TryLockError::Poisoned(e)) => {
                now.duration_since(e.into_inner().last_seen) < self.idle_timeout
            }
            Err(TryLockError::WouldBlock) => true,
        });
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Extract the session cookie from a `Cookie` header value
pub fn from_cookie_header(header: &str) -> Option<SessionKey> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .and_then(|(_, value)| value.parse().ok())
}
