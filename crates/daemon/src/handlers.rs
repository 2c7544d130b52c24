//! One handler per command
//!
//! Handlers run inside the command's transaction through a [`Scope`]. Work
//! that must not happen before the transaction commits (mail, revoking the
//! sessions of deleted or banned accounts) is collected in [`Effects`] and
//! carried out by the executor after commit.

use libwarden::command::{
    CommandMessage, Done, Login, LoginOk, Reply, UserBan, UserCreate, UserCreated, UserDelete,
    UserGet, UserUnban,
};
use libwarden::model::{
    AuditSearchParameters, Ban, Page, UserId, UserSearchByEmailParameters, UserSearchParameters,
};
use tracing::info;

use crate::executor::{CommandContext, HandlerError, PagingLimits, Services, SessionChange};
use crate::paging::{PagedSource, PagingCursor};
use crate::services::Mail;
use crate::session::{Cursors, SessionHandle, SessionStore};
use crate::store::{Transaction, UserRecord};

pub const MIN_PASSWORD_LENGTH: usize = 8;
const MAX_NAME_LENGTH: usize = 64;

/// Post-commit work produced by a handler
#[derive(Debug, Default)]
pub struct Effects {
    pub session: Option<SessionChange>,
    /// Principals whose sessions end
    pub revoke: Vec<UserId>,
    pub mail: Vec<Mail>,
}

#[derive(Debug, Clone, Copy)]
enum Turn {
    Next,
    Previous,
}

/// What a handler may touch while its command runs
pub struct Scope<'a, 't> {
    tx: &'a mut Transaction<'t>,
    ctx: &'a CommandContext,
    sessions: &'a SessionStore,
    services: &'a Services,
    paging: PagingLimits,
    effects: Effects,
}

impl<'a, 't> Scope<'a, 't> {
    pub fn new(
        tx: &'a mut Transaction<'t>,
        ctx: &'a CommandContext,
        sessions: &'a SessionStore,
        services: &'a Services,
        paging: PagingLimits,
    ) -> Self {
        Self {
            tx,
            ctx,
            sessions,
            services,
            paging,
            effects: Effects::default(),
        }
    }

    pub fn finish(self) -> Effects {
        self.effects
    }

    pub fn dispatch(&mut self, command: CommandMessage) -> Result<Reply, HandlerError> {
        match command {
            CommandMessage::Login(login) => self.login(login).map(Reply::LoginOk),
            CommandMessage::Logout(_) => self.logout().map(Reply::Done),
            CommandMessage::UserCreate(create) => self.user_create(create).map(Reply::UserCreated),
            CommandMessage::UserGet(get) => self.user_get(get),
            CommandMessage::UserDelete(delete) => self.user_delete(delete).map(Reply::Done),
            CommandMessage::UserBan(ban) => self.user_ban(ban).map(Reply::Done),
            CommandMessage::UserUnban(unban) => self.user_unban(unban).map(Reply::Done),
            CommandMessage::UserSearchBegin(begin) => {
                self.begin(begin.0.limit, begin.0, users).map(Reply::UserPage)
            }
            CommandMessage::UserSearchNext(_) => {
                self.turn("user", Turn::Next, users).map(Reply::UserPage)
            }
            CommandMessage::UserSearchPrevious(_) => {
                self.turn("user", Turn::Previous, users).map(Reply::UserPage)
            }
            CommandMessage::UserSearchByEmailBegin(begin) => {
                if begin.0.email.trim().is_empty() {
                    return Err(HandlerError::validity("email", "email query must not be empty"));
                }
                self.begin(begin.0.limit, begin.0, users_by_email)
                    .map(Reply::UserPage)
            }
            CommandMessage::UserSearchByEmailNext(_) => self
                .turn("user by email", Turn::Next, users_by_email)
                .map(Reply::UserPage),
            CommandMessage::UserSearchByEmailPrevious(_) => self
                .turn("user by email", Turn::Previous, users_by_email)
                .map(Reply::UserPage),
            CommandMessage::AuditSearchBegin(begin) => {
                self.begin(begin.0.limit, begin.0, audit).map(Reply::AuditPage)
            }
            CommandMessage::AuditSearchNext(_) => {
                self.turn("audit", Turn::Next, audit).map(Reply::AuditPage)
            }
            CommandMessage::AuditSearchPrevious(_) => self
                .turn("audit", Turn::Previous, audit)
                .map(Reply::AuditPage),
        }
    }

    fn login(&mut self, login: Login) -> Result<LoginOk, HandlerError> {
        self.services.limiter.check(&self.ctx.remote_host)?;

        let rejected = || HandlerError::Authentication("invalid user name or password".into());
        let user = self.tx.user_by_name(&login.user_name).ok_or_else(rejected)?;
        if !self
            .services
            .passwords
            .verify(&login.password, &user.password_hash)
        {
            return Err(rejected());
        }
        if let Some(ban) = user.ban.as_ref().filter(|ban| ban.is_active(self.ctx.now)) {
            return Err(HandlerError::Banned(ban.clone()));
        }

        let summary = user.summary();
        let message = format!("{} logged in from {}", summary.name, self.ctx.remote_host);
        self.tx
            .append_audit(self.ctx.now, summary.id, "LOGIN", message);

        if let Some(previous) = self.ctx.session {
            self.sessions.remove(&previous);
        }
        let key = self.sessions.create(summary.id, &summary.name, summary.admin);
        self.effects.session = Some(SessionChange::Started(key));
        info!(user = %summary.name, "login accepted");
        Ok(LoginOk { user: summary })
    }

    fn logout(&mut self) -> Result<Done, HandlerError> {
        let Some(key) = self.ctx.session else {
            return Err(HandlerError::Authentication("not logged in".into()));
        };
        if let Some(handle) = self.sessions.get(&key) {
            let user = handle.lock().unwrap_or_else(|e| e.into_inner()).user_name.clone();
            info!(%user, "logged out");
        }
        self.sessions.remove(&key);
        self.effects.session = Some(SessionChange::Ended);
        Ok(Done)
    }

    fn user_create(&mut self, create: UserCreate) -> Result<UserCreated, HandlerError> {
        let actor = self.admin()?;

        let name = create.name.trim();
        if name.is_empty() || name.len() > MAX_NAME_LENGTH {
            return Err(HandlerError::validity(
                "name",
                format!("user name must be 1 to {MAX_NAME_LENGTH} characters"),
            ));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(HandlerError::validity(
                "name",
                "user name may only contain letters, digits, '.', '_' and '-'",
            ));
        }
        let email = create.email.trim();
        let valid_email = email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
        if !valid_email {
            return Err(HandlerError::validity("email", "email address is malformed"));
        }
        if create.real_name.trim().is_empty() {
            return Err(HandlerError::validity("real_name", "real name must not be empty"));
        }
        if create.password.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(HandlerError::Password(format!(
                "password must be at least {MIN_PASSWORD_LENGTH} characters"
            )));
        }

        let record = UserRecord {
            id: UserId::new(),
            name: name.to_string(),
            email: email.to_string(),
            real_name: create.real_name.trim().to_string(),
            admin: create.admin,
            created: self.ctx.now,
            password_hash: self.services.passwords.hash(&create.password)?,
            ban: None,
        };
        let id = record.id;
        self.tx.insert_user(record)?;
        self.tx.append_audit(
            self.ctx.now,
            actor,
            "USER_CREATED",
            format!("created user {name}"),
        );
        self.effects.mail.push(Mail {
            to: email.to_string(),
            subject: "Your account is ready".to_string(),
            body: format!(
                "Hello {},\n\nan account named {name} has been created for you.\n",
                create.real_name.trim()
            ),
        });
        Ok(UserCreated { user: id })
    }

    fn user_get(&mut self, get: UserGet) -> Result<Reply, HandlerError> {
        let (actor, admin) = self.principal()?;
        if !admin && actor != get.user {
            return Err(HandlerError::Security(
                "only administrators may view other accounts".into(),
            ));
        }
        self.tx
            .user(get.user)
            .map(|user| Reply::User(user.view()))
            .ok_or_else(|| HandlerError::NotFound(format!("no user with id {}", get.user)))
    }

    fn user_delete(&mut self, delete: UserDelete) -> Result<Done, HandlerError> {
        let actor = self.admin()?;
        if actor == delete.user {
            return Err(HandlerError::Security("cannot delete your own account".into()));
        }
        let removed = self
            .tx
            .delete_user(delete.user)?
            .ok_or_else(|| HandlerError::NotFound(format!("no user with id {}", delete.user)))?;
        self.tx.append_audit(
            self.ctx.now,
            actor,
            "USER_DELETED",
            format!("deleted user {}", removed.name),
        );
        self.effects.revoke.push(delete.user);
        Ok(Done)
    }

    fn user_ban(&mut self, ban: UserBan) -> Result<Done, HandlerError> {
        let actor = self.admin()?;
        if actor == ban.user {
            return Err(HandlerError::Security("cannot ban your own account".into()));
        }
        if ban.reason.trim().is_empty() {
            return Err(HandlerError::validity("reason", "a ban needs a reason"));
        }
        if ban.expires.is_some_and(|expires| expires <= self.ctx.now) {
            return Err(HandlerError::validity("expires", "ban expiry lies in the past"));
        }
        let name = self.existing(ban.user)?.name.clone();
        let expiry = ban
            .expires
            .map_or_else(|| "permanently".to_string(), |at| format!("until {at}"));
        let record = Ban {
            reason: ban.reason.trim().to_string(),
            expires: ban.expires,
        };
        let message = format!("banned user {name} {expiry}: {}", record.reason);
        self.tx.set_ban(ban.user, Some(record))?;
        self.tx
            .append_audit(self.ctx.now, actor, "USER_BANNED", message);
        self.effects.revoke.push(ban.user);
        Ok(Done)
    }

    fn user_unban(&mut self, unban: UserUnban) -> Result<Done, HandlerError> {
        let actor = self.admin()?;
        let name = self.existing(unban.user)?.name.clone();
        self.tx.set_ban(unban.user, None)?;
        self.tx.append_audit(
            self.ctx.now,
            actor,
            "USER_UNBANNED",
            format!("lifted ban on user {name}"),
        );
        Ok(Done)
    }

    /// Start a search; any cursor of the same kind is discarded even if the
    /// first page cannot be read
    fn begin<P>(
        &mut self,
        limit: u32,
        parameters: P,
        slot: fn(&mut Cursors) -> &mut Option<PagingCursor<P>>,
    ) -> Result<Page<<Transaction<'t> as PagedSource<P>>::Item>, HandlerError>
    where
        Transaction<'t>: PagedSource<P>,
    {
        let handle = self.admin_session()?;
        let page_size = self.page_size(limit);
        let mut session = handle.lock().unwrap_or_else(|e| e.into_inner());
        let current = slot(&mut session.cursors);
        *current = None;
        let mut cursor = PagingCursor::create(parameters, page_size);
        let page = cursor.page_current(&*self.tx)?;
        *current = Some(cursor);
        Ok(page)
    }

    fn turn<P>(
        &mut self,
        search: &'static str,
        turn: Turn,
        slot: fn(&mut Cursors) -> &mut Option<PagingCursor<P>>,
    ) -> Result<Page<<Transaction<'t> as PagedSource<P>>::Item>, HandlerError>
    where
        Transaction<'t>: PagedSource<P>,
    {
        let handle = self.admin_session()?;
        let mut session = handle.lock().unwrap_or_else(|e| e.into_inner());
        let cursor = slot(&mut session.cursors)
            .as_mut()
            .ok_or(HandlerError::SearchNotStarted(search))?;
        let page = match turn {
            Turn::Next => cursor.page_next(&*self.tx)?,
            Turn::Previous => cursor.page_previous(&*self.tx)?,
        };
        Ok(page)
    }

    /// `limit = 0` asks for the default page size; larger requests are capped
    fn page_size(&self, limit: u32) -> u32 {
        match limit {
            0 => self.paging.default_page_size,
            n => n.min(self.paging.max_page_size),
        }
    }

    fn existing(&self, user: UserId) -> Result<&UserRecord, HandlerError> {
        self.tx
            .user(user)
            .ok_or_else(|| HandlerError::NotFound(format!("no user with id {user}")))
    }

    /// The caller's live session; the account behind it must still exist and
    /// not be banned
    fn session(&self) -> Result<SessionHandle, HandlerError> {
        let key = self
            .ctx
            .session
            .ok_or_else(|| HandlerError::Authentication("not logged in".into()))?;
        let handle = self
            .sessions
            .get(&key)
            .ok_or_else(|| HandlerError::Authentication("session expired".into()))?;

        let Some(user) = self.tx.user(key.principal) else {
            self.sessions.remove(&key);
            return Err(HandlerError::Authentication("account no longer exists".into()));
        };
        if let Some(ban) = user.ban.as_ref().filter(|ban| ban.is_active(self.ctx.now)) {
            self.sessions.remove(&key);
            return Err(HandlerError::Banned(ban.clone()));
        }
        Ok(handle)
    }

    /// `(principal, admin)` of the caller
    fn principal(&self) -> Result<(UserId, bool), HandlerError> {
        let handle = self.session()?;
        let session = handle.lock().unwrap_or_else(|e| e.into_inner());
        Ok((session.key.principal, session.admin))
    }

    fn admin_session(&self) -> Result<SessionHandle, HandlerError> {
        let handle = self.session()?;
        let admin = handle.lock().unwrap_or_else(|e| e.into_inner()).admin;
        if !admin {
            return Err(HandlerError::Security(
                "this command requires an administrator".into(),
            ));
        }
        Ok(handle)
    }

    /// Principal of an administrator caller
    fn admin(&self) -> Result<UserId, HandlerError> {
        let handle = self.admin_session()?;
        let principal = handle.lock().unwrap_or_else(|e| e.into_inner()).key.principal;
        Ok(principal)
    }
}

fn users(cursors: &mut Cursors) -> &mut Option<PagingCursor<UserSearchParameters>> {
    &mut cursors.users
}

fn users_by_email(cursors: &mut Cursors) -> &mut Option<PagingCursor<UserSearchByEmailParameters>> {
    &mut cursors.users_by_email
}

fn audit(cursors: &mut Cursors) -> &mut Option<PagingCursor<AuditSearchParameters>> {
    &mut cursors.audit
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use libwarden::command::{
        AuditSearchBegin, AuditSearchNext, UserSearchBegin, UserSearchByEmailBegin,
        UserSearchNext, UserSearchPrevious,
    };
    use libwarden::model::{AuditEvent, UserSummary};
    use libwarden::protocol::{ErrorCode, ErrorResponse, Response};

    use super::*;
    use crate::executor::testing::{ADMIN, Harness, PASSWORD, harness};
    use crate::session::SessionKey;

    struct Caller<'h> {
        h: &'h Harness,
        host: String,
        session: Option<SessionKey>,
    }

    impl<'h> Caller<'h> {
        fn anonymous(h: &'h Harness) -> Self {
            Self {
                h,
                host: "192.0.2.1".into(),
                session: None,
            }
        }

        fn admin(h: &'h Harness) -> Self {
            let mut caller = Self::anonymous(h);
            caller.login(ADMIN, PASSWORD).unwrap();
            caller
        }

        fn send(&mut self, command: impl Into<CommandMessage>) -> Result<Reply, ErrorResponse> {
            let ctx = CommandContext::new(self.host.clone(), self.session);
            let execution = self.h.executor.execute(ctx, command.into());
            match execution.session {
                Some(SessionChange::Started(key)) => self.session = Some(key),
                Some(SessionChange::Ended) => self.session = None,
                None => {}
            }
            match execution.response {
                Response::Success(success) => {
                    assert_eq!(execution.status, StatusCode::OK);
                    Ok(success.reply)
                }
                Response::Error(error) => Err(error),
            }
        }

        fn login(&mut self, user: &str, password: &str) -> Result<Reply, ErrorResponse> {
            self.send(Login {
                user_name: user.into(),
                password: password.into(),
            })
        }

        fn create(&mut self, name: &str) -> UserId {
            let reply = self
                .send(UserCreate {
                    name: name.into(),
                    email: format!("{name}@example.org"),
                    real_name: format!("{name} example"),
                    password: "long enough".into(),
                    admin: false,
                })
                .unwrap();
            let Reply::UserCreated(created) = reply else {
                panic!("unexpected reply {reply:?}");
            };
            created.user
        }
    }

    fn user_page(reply: Result<Reply, ErrorResponse>) -> Page<UserSummary> {
        match reply.unwrap() {
            Reply::UserPage(page) => page,
            other => panic!("unexpected reply {other:?}"),
        }
    }

    fn audit_page(reply: Result<Reply, ErrorResponse>) -> Page<AuditEvent> {
        match reply.unwrap() {
            Reply::AuditPage(page) => page,
            other => panic!("unexpected reply {other:?}"),
        }
    }

    fn search(limit: u32) -> UserSearchBegin {
        UserSearchBegin(UserSearchParameters {
            limit,
            ..UserSearchParameters::default()
        })
    }

    #[test]
    fn wrong_password_is_authentication_error() {
        let h = harness(10);
        let err = Caller::anonymous(&h).login(ADMIN, "nope").unwrap_err();
        assert_eq!(err.code, ErrorCode::Authentication);
        let err = Caller::anonymous(&h).login("nobody", PASSWORD).unwrap_err();
        assert_eq!(err.code, ErrorCode::Authentication);
    }

    #[test]
    fn login_is_rate_limited_per_host() {
        let h = harness(2);
        let mut caller = Caller::anonymous(&h);
        caller.login(ADMIN, "nope").unwrap_err();
        caller.login(ADMIN, "nope").unwrap_err();
        let err = caller.login(ADMIN, PASSWORD).unwrap_err();
        assert_eq!(err.code, ErrorCode::RateLimitExceeded);
        assert!(err.attributes.contains_key("retry_after_seconds"));

        let mut elsewhere = Caller::anonymous(&h);
        elsewhere.host = "198.51.100.7".into();
        elsewhere.login(ADMIN, PASSWORD).unwrap();
    }

    #[test]
    fn create_sends_mail_after_commit() {
        let h = harness(10);
        let mut admin = Caller::admin(&h);
        let id = admin.create("ada");
        let sent = h.outbox.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "ada@example.org");

        let Reply::User(view) = admin.send(UserGet { user: id }).unwrap() else {
            panic!("expected a user");
        };
        assert_eq!(view.name, "ada");
    }

    #[test]
    fn failed_create_sends_nothing() {
        let h = harness(10);
        let mut admin = Caller::admin(&h);
        admin.create("ada");
        let err = admin
            .send(UserCreate {
                name: "ada".into(),
                email: "someone.else@example.org".into(),
                real_name: "Ada Again".into(),
                password: "long enough".into(),
                admin: false,
            })
            .unwrap_err();
        assert_eq!(err.code.as_str(), "23505");
        assert_eq!(err.message, "a user with this name already exists");
        assert_eq!(h.outbox.sent().len(), 1);
    }

    #[test]
    fn create_validates_input() {
        let h = harness(10);
        let mut admin = Caller::admin(&h);
        let base = UserCreate {
            name: "bob".into(),
            email: "bob@example.org".into(),
            real_name: "Bob".into(),
            password: "long enough".into(),
            admin: false,
        };

        let err = admin
            .send(UserCreate {
                email: "bob".into(),
                ..base.clone()
            })
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Validity);
        assert_eq!(err.attributes["field"], "email");

        let err = admin
            .send(UserCreate {
                password: "short".into(),
                ..base.clone()
            })
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Password);

        let err = admin
            .send(UserCreate {
                name: "bob smith".into(),
                ..base
            })
            .unwrap_err();
        assert_eq!(err.attributes["field"], "name");
    }

    #[test]
    fn missing_user_is_not_found() {
        let h = harness(10);
        let mut admin = Caller::admin(&h);
        let err = admin.send(UserGet { user: UserId::new() }).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
        let err = admin.send(UserDelete { user: UserId::new() }).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[test]
    fn non_admins_are_refused() {
        let h = harness(10);
        let mut admin = Caller::admin(&h);
        let ada = admin.create("ada");

        let mut user = Caller::anonymous(&h);
        user.login("ada", "long enough").unwrap();
        assert!(matches!(user.send(UserGet { user: ada }), Ok(Reply::User(_))));
        let err = user.send(search(5)).unwrap_err();
        assert_eq!(err.code, ErrorCode::Security);
        let err = user.send(UserDelete { user: ada }).unwrap_err();
        assert_eq!(err.code, ErrorCode::Security);
    }

    #[test]
    fn ban_ends_sessions_and_blocks_login() {
        let h = harness(10);
        let mut admin = Caller::admin(&h);
        let ada = admin.create("ada");
        let mut user = Caller::anonymous(&h);
        user.login("ada", "long enough").unwrap();

        admin
            .send(UserBan {
                user: ada,
                reason: "spam".into(),
                expires: None,
            })
            .unwrap();

        let err = user.send(UserGet { user: ada }).unwrap_err();
        assert_eq!(err.code, ErrorCode::Authentication);

        let err = Caller::anonymous(&h)
            .login("ada", "long enough")
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Banned);
        assert_eq!(err.attributes["reason"], "spam");
        assert!(err.remediating_action.is_some());

        admin.send(UserUnban { user: ada }).unwrap();
        Caller::anonymous(&h).login("ada", "long enough").unwrap();
    }

    #[test]
    fn ban_rejects_past_expiry_and_self() {
        let h = harness(10);
        let mut admin = Caller::admin(&h);
        let ada = admin.create("ada");
        let err = admin
            .send(UserBan {
                user: ada,
                reason: "spam".into(),
                expires: Some(1),
            })
            .unwrap_err();
        assert_eq!(err.attributes["field"], "expires");

        let Reply::LoginOk(me) = admin.login(ADMIN, PASSWORD).unwrap() else {
            panic!("expected login");
        };
        let err = admin
            .send(UserBan {
                user: me.user.id,
                reason: "oops".into(),
                expires: None,
            })
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Security);
    }

    #[test]
    fn expired_ban_does_not_block() {
        let h = harness(10);
        let mut admin = Caller::admin(&h);
        let ada = admin.create("ada");
        {
            let mut tx = h.store.begin();
            tx.set_ban(
                ada,
                Some(Ban {
                    reason: "old".into(),
                    expires: Some(10),
                }),
            )
            .unwrap();
            tx.commit();
        }
        Caller::anonymous(&h).login("ada", "long enough").unwrap();
    }

    #[test]
    fn logout_ends_session() {
        let h = harness(10);
        let mut admin = Caller::admin(&h);
        let stale = admin.session;
        admin.send(libwarden::command::Logout).unwrap();
        assert_eq!(admin.session, None);

        admin.session = stale;
        let err = admin.send(search(5)).unwrap_err();
        assert_eq!(err.code, ErrorCode::Authentication);
    }

    #[test]
    fn logging_in_again_ends_the_previous_session() {
        let h = harness(10);
        let mut admin = Caller::admin(&h);
        let first = admin.session;
        admin.login(ADMIN, PASSWORD).unwrap();
        let second = admin.session;
        assert_ne!(first, second);
        admin.send(search(5)).unwrap();

        admin.session = first;
        let err = admin.send(search(5)).unwrap_err();
        assert_eq!(err.code, ErrorCode::Authentication);
    }

    #[test]
    fn paging_walks_and_resets() {
        let h = harness(10);
        let mut admin = Caller::admin(&h);
        for i in 0..11 {
            admin.create(&format!("user{i:02}"));
        }

        let first = user_page(admin.send(search(5)));
        assert_eq!((first.page_index, first.page_count), (1, 3));
        assert_eq!(first.items.len(), 5);

        let second = user_page(admin.send(UserSearchNext));
        let third = user_page(admin.send(UserSearchNext));
        assert_eq!(third.items.len(), 2);
        let again = user_page(admin.send(UserSearchNext));
        assert_eq!(again, third);
        assert_eq!(user_page(admin.send(UserSearchPrevious)), second);

        let mut names: Vec<_> = [&first, &second, &third]
            .iter()
            .flat_map(|page| page.items.iter().map(|u| u.name.clone()))
            .collect();
        let total = names.len();
        names.dedup();
        assert_eq!(names.len(), total);
        assert_eq!(total, 12);

        let reset = user_page(admin.send(search(5)));
        assert_eq!(reset.page_index, 1);
        assert_eq!(reset, first);
    }

    #[test]
    fn turning_before_begin_fails() {
        let h = harness(10);
        let mut admin = Caller::admin(&h);
        let err = admin.send(UserSearchNext).unwrap_err();
        assert_eq!(err.code, ErrorCode::SearchNotStarted);
        let err = admin.send(AuditSearchNext).unwrap_err();
        assert_eq!(err.attributes["search"], "audit");

        // one kind of search does not start another
        admin.send(search(5)).unwrap();
        let err = admin.send(AuditSearchNext).unwrap_err();
        assert_eq!(err.code, ErrorCode::SearchNotStarted);
    }

    #[test]
    fn page_size_limits() {
        let h = harness(10);
        let mut admin = Caller::admin(&h);
        for i in 0..29 {
            admin.create(&format!("user{i:02}"));
        }
        let capped = user_page(admin.send(search(1000)));
        assert_eq!((capped.items.len(), capped.page_count), (25, 2));
        let default = user_page(admin.send(search(0)));
        assert_eq!((default.items.len(), default.page_count), (10, 3));
    }

    #[test]
    fn email_search_needs_a_query() {
        let h = harness(10);
        let mut admin = Caller::admin(&h);
        admin.create("ada");
        let err = admin
            .send(UserSearchByEmailBegin(UserSearchByEmailParameters::default()))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Validity);

        let page = user_page(admin.send(UserSearchByEmailBegin(UserSearchByEmailParameters {
            email: "ADA@".into(),
            ..UserSearchByEmailParameters::default()
        })));
        assert_eq!(page.items.len(), 1);
    }

    #[test]
    fn audit_log_records_actions() {
        let h = harness(10);
        let mut admin = Caller::admin(&h);
        let ada = admin.create("ada");
        admin.send(UserDelete { user: ada }).unwrap();

        let page = audit_page(admin.send(AuditSearchBegin(AuditSearchParameters::default())));
        let kinds: Vec<_> = page.items.iter().map(|e| e.kind.as_str()).collect();
        for kind in ["USER_CREATED", "LOGIN", "USER_DELETED"] {
            assert!(kinds.contains(&kind), "missing {kind} in {kinds:?}");
        }
    }
}
