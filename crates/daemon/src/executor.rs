//! Command execution
//!
//! [`CommandExecutor::execute`] runs one decoded command inside its own
//! storage transaction and always produces a response: handler errors and
//! panics are folded into a [`Failure`] carrying the protocol error code,
//! HTTP status and blame for the failure category.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::StatusCode;
use libwarden::command::{CommandMessage, Reply};
use libwarden::model::{Ban, UserId};
use libwarden::protocol::{Blame, ErrorCode, ErrorResponse, RequestId, Response, Success};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};

use crate::handlers::{Effects, Scope};
use crate::services::{HashError, Mailer, PasswordHasher, RateLimited, RateLimiter};
use crate::session::{SessionKey, SessionStore};
use crate::store::{MemoryStore, StorageError, UserRecord};

/// Page size bounds applied to search parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingLimits {
    /// Used when a search asks for `limit = 0`
    pub default_page_size: u32,
    pub max_page_size: u32,
}

impl Default for PagingLimits {
    fn default() -> Self {
        Self {
            default_page_size: libwarden::model::DEFAULT_PAGE_SIZE,
            max_page_size: 500,
        }
    }
}

pub struct Services {
    pub limiter: Arc<dyn RateLimiter>,
    pub mailer: Arc<dyn Mailer>,
    pub passwords: Arc<dyn PasswordHasher>,
}

/// Per-request facts the handlers see
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub request_id: RequestId,
    /// Rate limiting key
    pub remote_host: String,
    pub session: Option<SessionKey>,
    /// Unix seconds
    pub now: u64,
}

impl CommandContext {
    pub fn new(remote_host: impl Into<String>, session: Option<SessionKey>) -> Self {
        Self {
            request_id: RequestId::new(),
            remote_host: remote_host.into(),
            session,
            now: unix_now(),
        }
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// How a command changed the caller's session cookie
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionChange {
    Started(SessionKey),
    Ended,
}

#[derive(Debug)]
pub struct Execution {
    pub response: Response,
    pub status: StatusCode,
    pub session: Option<SessionChange>,
}

/// Failure categories a handler can report
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{message}")]
    Validity {
        message: String,
        field: Option<&'static str>,
    },
    #[error("{0}")]
    Security(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("{0}")]
    Password(String),
    #[error("{0}")]
    Authentication(String),
    #[error(transparent)]
    RateLimited(#[from] RateLimited),
    #[error("account is banned: {}", .0.reason)]
    Banned(Ban),
    #[error("{0}")]
    NotFound(String),
    #[error("no {0} search has been started in this session")]
    SearchNotStarted(&'static str),
    #[error(transparent)]
    Hash(#[from] HashError),
    #[error("{message}")]
    Other {
        code: Option<ErrorCode>,
        message: String,
    },
}

impl HandlerError {
    pub fn validity(field: &'static str, message: impl Into<String>) -> Self {
        HandlerError::Validity {
            message: message.into(),
            field: Some(field),
        }
    }
}

/// Uniform shape of every failed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub message: String,
    /// Underlying error text when `message` was rewritten for the client
    pub cause: Option<String>,
    pub code: ErrorCode,
    pub attributes: BTreeMap<String, String>,
    pub remediation: Option<String>,
    pub request_id: RequestId,
    pub status: StatusCode,
    pub blame: Blame,
}

impl Failure {
    fn new(request_id: RequestId, code: ErrorCode, status: StatusCode, message: String) -> Self {
        let blame = if status.is_server_error() {
            Blame::Server
        } else {
            Blame::Client
        };
        Self {
            message,
            cause: None,
            code,
            attributes: BTreeMap::new(),
            remediation: None,
            request_id,
            status,
            blame,
        }
    }

    fn attribute(mut self, key: &str, value: impl ToString) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }

    fn remediation(mut self, hint: impl Into<String>) -> Self {
        self.remediation = Some(hint.into());
        self
    }

    /// Classify a handler error
    pub fn from_error(err: &HandlerError, request_id: RequestId) -> Self {
        let message = err.to_string();
        match err {
            HandlerError::Validity { field, .. } => {
                let failure =
                    Failure::new(request_id, ErrorCode::Validity, StatusCode::BAD_REQUEST, message);
                match field {
                    Some(field) => failure
                        .attribute("field", field)
                        .remediation(format!("Correct the {field} and try again.")),
                    None => failure,
                }
            }
            HandlerError::Security(_) => {
                Failure::new(request_id, ErrorCode::Security, StatusCode::FORBIDDEN, message)
            }
            // Uniqueness violations are the one storage failure the caller can
            // correct: 400 and client blame, code kept, message rewritten
            HandlerError::Storage(storage) if storage.is_unique_violation() => {
                let mut failure = Failure::new(
                    request_id,
                    ErrorCode::Storage(storage.code.clone()),
                    StatusCode::BAD_REQUEST,
                    duplicate_message(storage.constraint.as_deref()),
                );
                failure.cause = Some(storage.message.clone());
                if let Some(constraint) = &storage.constraint {
                    failure = failure.attribute("constraint", constraint);
                }
                failure.remediation("Choose a different value and try again.")
            }
            HandlerError::Storage(storage) => Failure::new(
                request_id,
                ErrorCode::Storage(storage.code.clone()),
                StatusCode::INTERNAL_SERVER_ERROR,
                message,
            ),
            HandlerError::Password(_) => {
                Failure::new(request_id, ErrorCode::Password, StatusCode::BAD_REQUEST, message)
                    .remediation("Choose a longer password.")
            }
            HandlerError::Authentication(_) => Failure::new(
                request_id,
                ErrorCode::Authentication,
                StatusCode::UNAUTHORIZED,
                message,
            )
            .remediation("Log in again."),
            HandlerError::RateLimited(limited) => {
                let seconds = limited.retry_after.as_secs().max(1);
                Failure::new(
                    request_id,
                    ErrorCode::RateLimitExceeded,
                    StatusCode::TOO_MANY_REQUESTS,
                    message,
                )
                .attribute("retry_after_seconds", seconds)
                .remediation(format!("Wait {seconds} seconds before trying again."))
            }
            HandlerError::Banned(ban) => {
                let failure =
                    Failure::new(request_id, ErrorCode::Banned, StatusCode::FORBIDDEN, message)
                        .attribute("reason", &ban.reason);
                match ban.expires {
                    Some(expires) => failure
                        .attribute("expires", expires)
                        .remediation(format!("The ban lifts at unix time {expires}.")),
                    None => failure.remediation("Contact an administrator."),
                }
            }
            HandlerError::NotFound(_) => {
                Failure::new(request_id, ErrorCode::NotFound, StatusCode::NOT_FOUND, message)
            }
            HandlerError::SearchNotStarted(search) => Failure::new(
                request_id,
                ErrorCode::SearchNotStarted,
                StatusCode::BAD_REQUEST,
                message,
            )
            .attribute("search", search)
            .remediation("Begin a search before asking for another page."),
            HandlerError::Hash(_) => Failure::new(
                request_id,
                ErrorCode::Internal,
                StatusCode::INTERNAL_SERVER_ERROR,
                message,
            ),
            HandlerError::Other { code, .. } => Failure::new(
                request_id,
                code.clone().unwrap_or(ErrorCode::Internal),
                StatusCode::INTERNAL_SERVER_ERROR,
                message,
            ),
        }
    }

    /// Classify a handler panic
    pub fn from_panic(payload: &(dyn Any + Send), request_id: RequestId) -> Self {
        let cause = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned());
        let mut failure = Failure::new(
            request_id,
            ErrorCode::Internal,
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal error".to_string(),
        );
        failure.cause = cause;
        failure
    }

    pub fn into_response(self) -> ErrorResponse {
        ErrorResponse {
            request_id: self.request_id,
            message: self.message,
            code: self.code,
            attributes: self.attributes,
            remediating_action: self.remediation,
            blame: self.blame,
        }
    }
}

fn duplicate_message(constraint: Option<&str>) -> String {
    match constraint {
        Some("users_name_key") => "a user with this name already exists".to_string(),
        Some("users_email_key") => "a user with this email address already exists".to_string(),
        _ => "a record with the same key already exists".to_string(),
    }
}

/// Runs of one command before a write conflict is reported to the caller
const MAX_ATTEMPTS: u32 = 3;

/// Runs commands against the store and session table it was built with
pub struct CommandExecutor {
    store: Arc<MemoryStore>,
    sessions: Arc<SessionStore>,
    services: Services,
    paging: PagingLimits,
}

impl CommandExecutor {
    pub fn new(
        store: Arc<MemoryStore>,
        sessions: Arc<SessionStore>,
        services: Services,
        paging: PagingLimits,
    ) -> Self {
        Self {
            store,
            sessions,
            services,
            paging,
        }
    }

    pub fn execute(&self, ctx: CommandContext, command: CommandMessage) -> Execution {
        let kind = command.kind();
        let span = info_span!("command", kind = kind.discriminator(), request_id = %ctx.request_id);
        let _entered = span.enter();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run(&ctx, command)));
        let failure = match outcome {
            Ok(Ok((reply, session))) => {
                debug!("command succeeded");
                return Execution {
                    response: Response::Success(Success {
                        request_id: ctx.request_id,
                        reply,
                    }),
                    status: StatusCode::OK,
                    session,
                };
            }
            Ok(Err(err)) => Failure::from_error(&err, ctx.request_id),
            Err(payload) => Failure::from_panic(payload.as_ref(), ctx.request_id),
        };

        match failure.blame {
            Blame::Server => error!(
                code = %failure.code,
                cause = failure.cause.as_deref().unwrap_or(&failure.message),
                "command failed"
            ),
            Blame::Client => info!(code = %failure.code, message = %failure.message, "command refused"),
        }
        Execution {
            status: failure.status,
            response: Response::Error(failure.into_response()),
            session: None,
        }
    }

    /// Run the command, starting over on a fresh snapshot when its write
    /// loses a race against a concurrent commit
    fn run(
        &self,
        ctx: &CommandContext,
        command: CommandMessage,
    ) -> Result<(Reply, Option<SessionChange>), HandlerError> {
        let mut attempt = 1;
        loop {
            match self.attempt(ctx, command.clone()) {
                Err(HandlerError::Storage(err))
                    if err.is_serialization_failure() && attempt < MAX_ATTEMPTS =>
                {
                    debug!(attempt, "transaction conflict, retrying");
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    fn attempt(
        &self,
        ctx: &CommandContext,
        command: CommandMessage,
    ) -> Result<(Reply, Option<SessionChange>), HandlerError> {
        let mut tx = self.store.begin();
        let mut scope = Scope::new(&mut tx, ctx, &self.sessions, &self.services, self.paging);
        let reply = scope.dispatch(command)?;
        let Effects {
            session,
            revoke,
            mail,
        } = scope.finish();
        tx.commit();

        for principal in revoke {
            let ended = self.sessions.remove_principal(principal);
            debug!(%principal, ended, "sessions revoked");
        }
        for message in mail {
            if let Err(err) = self.services.mailer.send(&message) {
                warn!(to = %message.to, %err, "mail dispatch failed after commit");
            }
        }
        Ok((reply, session))
    }

    /// Create the configured administrator unless an account with that name
    /// exists; returns whether one was created
    pub fn bootstrap_admin(
        &self,
        name: &str,
        email: &str,
        real_name: &str,
        password: &str,
    ) -> Result<bool, HandlerError> {
        let mut tx = self.store.begin();
        if tx.user_by_name(name).is_some() {
            return Ok(false);
        }
        let now = unix_now();
        let id = UserId::new();
        tx.insert_user(UserRecord {
            id,
            name: name.to_string(),
            email: email.to_string(),
            real_name: real_name.to_string(),
            admin: true,
            created: now,
            password_hash: self.services.passwords.hash(password)?,
            ban: None,
        })?;
        tx.append_audit(now, id, "USER_CREATED", format!("bootstrap administrator {name}"));
        tx.commit();
        info!(user = name, "bootstrap administrator created");
        Ok(true)
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::time::Duration;

    use libwarden::command::{Login, UserGet, UserSearchNext};

    use super::testing::*;
    use super::*;

    fn request_id() -> RequestId {
        RequestId::new()
    }

    fn classify(err: HandlerError) -> (ErrorCode, u16, Blame) {
        let failure = Failure::from_error(&err, request_id());
        (failure.code, failure.status.as_u16(), failure.blame)
    }

    #[test]
    fn mapping_table() {
        let cases = [
            (
                HandlerError::validity("email", "bad email"),
                (ErrorCode::Validity, 400, Blame::Client),
            ),
            (
                HandlerError::Security("admins only".into()),
                (ErrorCode::Security, 403, Blame::Client),
            ),
            (
                HandlerError::Storage(StorageError::new("23505", "dup")),
                (ErrorCode::Storage("23505".into()), 400, Blame::Client),
            ),
            (
                HandlerError::Storage(StorageError::new("40P01", "deadlock")),
                (ErrorCode::Storage("40P01".into()), 500, Blame::Server),
            ),
            (
                HandlerError::Password("too short".into()),
                (ErrorCode::Password, 400, Blame::Client),
            ),
            (
                HandlerError::Authentication("expired".into()),
                (ErrorCode::Authentication, 401, Blame::Client),
            ),
            (
                HandlerError::RateLimited(RateLimited {
                    host: "h".into(),
                    retry_after: Duration::from_secs(5),
                }),
                (ErrorCode::RateLimitExceeded, 429, Blame::Client),
            ),
            (
                HandlerError::Banned(Ban {
                    reason: "spam".into(),
                    expires: None,
                }),
                (ErrorCode::Banned, 403, Blame::Client),
            ),
            (
                HandlerError::NotFound("no such user".into()),
                (ErrorCode::NotFound, 404, Blame::Client),
            ),
            (
                HandlerError::SearchNotStarted("user"),
                (ErrorCode::SearchNotStarted, 400, Blame::Client),
            ),
            (
                HandlerError::Hash(HashError("out of memory".into())),
                (ErrorCode::Internal, 500, Blame::Server),
            ),
            (
                HandlerError::Other {
                    code: None,
                    message: "boom".into(),
                },
                (ErrorCode::Internal, 500, Blame::Server),
            ),
            (
                HandlerError::Other {
                    code: Some(ErrorCode::Storage("XX000".into())),
                    message: "boom".into(),
                },
                (ErrorCode::Storage("XX000".into()), 500, Blame::Server),
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(classify(err), expected);
        }
    }

    #[test]
    fn mapping_is_deterministic() {
        let id = request_id();
        let err = HandlerError::Banned(Ban {
            reason: "spam".into(),
            expires: Some(99),
        });
        assert_eq!(Failure::from_error(&err, id), Failure::from_error(&err, id));
    }

    #[test]
    fn duplicates_keep_code_and_rewrite_message() {
        let mut storage = StorageError::new("23505", "duplicate key value \"ada\" violates unique constraint users_name_key");
        storage.constraint = Some("users_name_key".into());
        let failure = Failure::from_error(&HandlerError::Storage(storage.clone()), request_id());
        assert_eq!(failure.code.as_str(), "23505");
        assert_eq!(failure.status, StatusCode::BAD_REQUEST);
        assert_eq!(failure.blame, Blame::Client);
        assert_eq!(failure.message, "a user with this name already exists");
        assert_eq!(failure.cause, Some(storage.message));
        assert_eq!(failure.attributes["constraint"], "users_name_key");
    }

    #[test]
    fn panics_become_internal_errors() {
        let payload: Box<dyn Any + Send> = Box::new("index out of bounds");
        let failure = Failure::from_panic(payload.as_ref(), request_id());
        assert_eq!(failure.code, ErrorCode::Internal);
        assert_eq!(failure.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(failure.blame, Blame::Server);
        assert_eq!(failure.cause.as_deref(), Some("index out of bounds"));
    }

    #[test]
    fn execution_echoes_request_id() {
        let h = harness(10);
        let ctx = CommandContext::new("127.0.0.1", None);
        let id = ctx.request_id;
        let execution = h.executor.execute(
            ctx,
            Login {
                user_name: ADMIN.into(),
                password: PASSWORD.into(),
            }
            .into(),
        );
        assert_eq!(execution.status, StatusCode::OK);
        assert_eq!(execution.response.request_id(), id);
        assert!(matches!(execution.session, Some(SessionChange::Started(_))));
    }

    #[test]
    fn commands_without_session_are_unauthenticated() {
        let h = harness(10);
        let execution = h.executor.execute(
            CommandContext::new("127.0.0.1", None),
            UserGet { user: UserId::new() }.into(),
        );
        assert_eq!(execution.status, StatusCode::UNAUTHORIZED);
        let Response::Error(error) = execution.response else {
            panic!("expected an error response");
        };
        assert!(error.is_authentication());

        let execution = h.executor.execute(
            CommandContext::new("127.0.0.1", None),
            UserSearchNext.into(),
        );
        assert_eq!(execution.status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn refused_command_writes_nothing() {
        let h = harness(10);
        let before = h.store.begin().user_count();
        let execution = h.executor.execute(
            CommandContext::new("127.0.0.1", None),
            libwarden::command::UserDelete { user: UserId::new() }.into(),
        );
        assert_ne!(execution.status, StatusCode::OK);
        assert_eq!(h.store.begin().user_count(), before);
    }

    /// Commits a competing account while hashing, once armed
    struct RacingHasher {
        store: Arc<MemoryStore>,
        armed: AtomicBool,
        every_time: bool,
        inner: crate::services::Argon2Hasher,
    }

    impl PasswordHasher for RacingHasher {
        fn hash(&self, password: &str) -> Result<String, HashError> {
            let armed = if self.every_time {
                self.armed.load(AtomicOrdering::SeqCst)
            } else {
                self.armed.swap(false, AtomicOrdering::SeqCst)
            };
            if armed {
                let mut tx = self.store.begin();
                tx.insert_user(crate::store::fixtures::user(&format!("rival{}", tx.user_count()), 1))
                    .unwrap();
                tx.commit();
            }
            self.inner.hash(password)
        }

        fn verify(&self, password: &str, stored: &str) -> bool {
            self.inner.verify(password, stored)
        }
    }

    fn racing(every_time: bool) -> (CommandExecutor, Arc<MemoryStore>, Arc<RacingHasher>) {
        let store = Arc::new(MemoryStore::new());
        let hasher = Arc::new(RacingHasher {
            store: Arc::clone(&store),
            armed: AtomicBool::new(false),
            every_time,
            inner: crate::services::fakes::cheap_hasher(),
        });
        let executor = CommandExecutor::new(
            Arc::clone(&store),
            Arc::new(SessionStore::new(Duration::from_secs(600))),
            Services {
                limiter: Arc::new(crate::services::SlidingWindow::new(10, Duration::from_secs(60))),
                mailer: Arc::new(crate::services::fakes::Outbox::default()),
                passwords: hasher.clone(),
            },
            PagingLimits::default(),
        );
        executor
            .bootstrap_admin(ADMIN, "root@example.org", "Root", PASSWORD)
            .unwrap();
        (executor, store, hasher)
    }

    fn admin_session(executor: &CommandExecutor) -> SessionKey {
        let execution = executor.execute(
            CommandContext::new("127.0.0.1", None),
            Login {
                user_name: ADMIN.into(),
                password: PASSWORD.into(),
            }
            .into(),
        );
        match execution.session {
            Some(SessionChange::Started(key)) => key,
            other => panic!("login did not start a session: {other:?}"),
        }
    }

    fn create(name: &str) -> CommandMessage {
        libwarden::command::UserCreate {
            name: name.into(),
            email: format!("{name}@example.org"),
            real_name: "Ada Lovelace".into(),
            password: "long enough".into(),
            admin: false,
        }
        .into()
    }

    #[test]
    fn write_conflict_is_retried_on_a_fresh_snapshot() {
        let (executor, store, hasher) = racing(false);
        let session = admin_session(&executor);
        hasher.armed.store(true, AtomicOrdering::SeqCst);

        let execution = executor.execute(CommandContext::new("127.0.0.1", Some(session)), create("ada"));
        assert_eq!(execution.status, StatusCode::OK);
        let tx = store.begin();
        assert!(tx.user_by_name("ada").is_some());
        assert!(tx.user_by_name("rival1").is_some());
    }

    #[test]
    fn persistent_conflict_is_a_server_storage_error() {
        let (executor, store, hasher) = racing(true);
        let session = admin_session(&executor);
        hasher.armed.store(true, AtomicOrdering::SeqCst);

        let execution = executor.execute(CommandContext::new("127.0.0.1", Some(session)), create("ada"));
        assert_eq!(execution.status, StatusCode::INTERNAL_SERVER_ERROR);
        let Response::Error(error) = execution.response else {
            panic!("expected an error response");
        };
        assert_eq!(error.code.as_str(), "40001");
        assert_eq!(error.blame, Blame::Server);
        let tx = store.begin();
        assert!(tx.user_by_name("ada").is_none());
        assert_eq!(tx.user_count(), 1 + MAX_ATTEMPTS as usize);
    }

    #[test]
    fn reads_proceed_while_a_write_is_open() {
        let h = harness(10);
        let session = admin_session(&h.executor);
        let admin = h.store.begin().user_by_name(ADMIN).unwrap().id;

        let mut open = h.store.begin();
        open.insert_user(crate::store::fixtures::user("pending", 1)).unwrap();

        let execution = h.executor.execute(
            CommandContext::new("127.0.0.1", Some(session)),
            UserGet { user: admin }.into(),
        );
        assert_eq!(execution.status, StatusCode::OK);
        let execution = h.executor.execute(
            CommandContext::new("127.0.0.1", Some(session)),
            libwarden::command::UserSearchBegin(Default::default()).into(),
        );
        assert_eq!(execution.status, StatusCode::OK);
        drop(open);
    }
}
