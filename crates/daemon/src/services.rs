//! Collaborators the executor calls out to: login rate limiting, credential
//! hashing and mail delivery.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher as _, PasswordVerifier as _};
use rand::rngs::OsRng;
use thiserror::Error;
use tracing::info;

/// Rejection from a [`RateLimiter`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("too many attempts from {host}, retry in {}s", retry_after.as_secs())]
pub struct RateLimited {
    pub host: String,
    pub retry_after: Duration,
}

pub trait RateLimiter: Send + Sync {
    /// Record an attempt from `host`, refusing it once the host is over its
    /// budget
    fn check(&self, host: &str) -> Result<(), RateLimited>;
}

/// Allows `attempts` per `window` for each host
pub struct SlidingWindow {
    attempts: usize,
    window: Duration,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindow {
    pub fn new(attempts: u32, window: Duration) -> Self {
        Self {
            attempts: attempts as usize,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn check_at(&self, host: &str, now: Instant) -> Result<(), RateLimited> {
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        let recent = hits.entry(host.to_string()).or_default();
        while recent
            .front()
            .is_some_and(|at| now.duration_since(*at) >= self.window)
        {
            recent.pop_front();
        }

        if recent.len() >= self.attempts {
            let oldest = recent.front().copied().unwrap_or(now);
            return Err(RateLimited {
                host: host.to_string(),
                retry_after: self.window.saturating_sub(now.duration_since(oldest)),
            });
        }
        recent.push_back(now);
        Ok(())
    }

    /// Drop hosts with no attempt inside the window
    pub fn prune(&self, now: Instant) {
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        hits.retain(|_, recent| {
            recent
                .back()
                .is_some_and(|at| now.duration_since(*at) < self.window)
        });
    }
}

impl RateLimiter for SlidingWindow {
    fn check(&self, host: &str) -> Result<(), RateLimited> {
        self.check_at(host, Instant::now())
    }
}

#[derive(Debug, Error)]
#[error("password hashing failed: {0}")]
pub struct HashError(pub String);

pub trait PasswordHasher: Send + Sync {
    /// Hash `password` with a fresh salt into a self-describing string
    fn hash(&self, password: &str) -> Result<String, HashError>;

    fn verify(&self, password: &str, stored: &str) -> bool;
}

/// Argon2id with PHC-format hashes
#[derive(Default)]
pub struct Argon2Hasher {
    argon2: Argon2<'static>,
}

impl Argon2Hasher {
    pub fn new(argon2: Argon2<'static>) -> Self {
        Self { argon2 }
    }
}

impl PasswordHasher for Argon2Hasher {
    fn hash(&self, password: &str) -> Result<String, HashError> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| HashError(e.to_string()))
    }

    fn verify(&self, password: &str, stored: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(stored) else {
            return false;
        };
        self.argon2
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Error)]
#[error("mail delivery failed: {0}")]
pub struct MailError(pub String);

pub trait Mailer: Send + Sync {
    fn send(&self, mail: &Mail) -> Result<(), MailError>;
}

/// Mailer that only logs what it would send
#[derive(Debug, Default)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, mail: &Mail) -> Result<(), MailError> {
        info!(to = %mail.to, subject = %mail.subject, "mail queued");
        Ok(())
    }
}
