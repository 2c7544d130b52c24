//! HTTP front of the daemon
//!
//! `GET /` serves the advertisement. Every enabled protocol version gets a
//! `login` and a `command` endpoint under its own path; both decode the body
//! with that version's codec and hand the command to the executor on the
//! blocking pool.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use libwarden::ProtocolVersion;
use libwarden::codec::Codec;
use libwarden::protocol::{
    Advertisement, Blame, ErrorCode, ErrorResponse, RequestId, Response as Outcome, ServerEndpoint,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigError};
use crate::executor::{CommandContext, CommandExecutor, HandlerError, Services, SessionChange};
use crate::services::{Argon2Hasher, LogMailer, SlidingWindow};
use crate::session::{SESSION_COOKIE, SessionStore, from_cookie_header};
use crate::store::MemoryStore;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to create bootstrap administrator: {0}")]
    Bootstrap(#[from] HandlerError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct AppState {
    executor: Arc<CommandExecutor>,
    advertisement: Arc<Advertisement>,
}

/// Which of a version's two endpoints received the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Login,
    Command,
}

pub async fn run(config: Config) -> Result<(), ServerError> {
    let versions = config.protocol_versions()?;

    let sessions = Arc::new(SessionStore::new(config.idle_timeout()));
    let limiter = Arc::new(SlidingWindow::new(
        config.rate_limit.attempts,
        config.rate_window(),
    ));
    let executor = Arc::new(CommandExecutor::new(
        Arc::new(MemoryStore::new()),
        Arc::clone(&sessions),
        Services {
            limiter: limiter.clone(),
            mailer: Arc::new(LogMailer),
            passwords: Arc::new(Argon2Hasher::default()),
        },
        config.paging_limits(),
    ));

    if let Some(admin) = &config.bootstrap {
        executor.bootstrap_admin(&admin.name, &admin.email, &admin.real_name, &admin.password)?;
    } else {
        warn!("no bootstrap administrator configured; nobody can log in");
    }

    let sweeper = tokio::spawn(sweep(sessions, limiter, config.sweep_interval()));

    let listener = TcpListener::bind(config.listen).await?;
    info!(
        addr = %listener.local_addr()?,
        versions = ?versions.iter().map(|v| v.identifier().to_string()).collect::<Vec<_>>(),
        "listening"
    );

    let result = serve(listener, router(executor, &versions), shutdown_signal()).await;
    sweeper.abort();
    info!("server stopped");
    result.map_err(ServerError::from)
}

/// Serve `app` until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

pub fn router(executor: Arc<CommandExecutor>, versions: &[ProtocolVersion]) -> Router {
    let advertisement = Advertisement {
        protocols: versions
            .iter()
            .map(|version| ServerEndpoint {
                supported: version.identifier(),
                path: version.endpoint_path(),
            })
            .collect(),
    };
    let state = AppState {
        executor,
        advertisement: Arc::new(advertisement),
    };

    let mut app = Router::new().route("/", get(advertise));
    for version in versions {
        let codec = Codec::new(*version);
        let base = format!("/{}", version.endpoint_path());
        for (suffix, endpoint) in [("login", Endpoint::Login), ("command", Endpoint::Command)] {
            app = app.route(
                &format!("{base}{suffix}"),
                post(
                    move |State(state): State<AppState>,
                          ConnectInfo(remote): ConnectInfo<SocketAddr>,
                          headers: HeaderMap,
                          body: Bytes| {
                        handle(state, remote, headers, body, codec, endpoint)
                    },
                ),
            );
        }
    }
    app.with_state(state)
}

async fn advertise(State(state): State<AppState>) -> Json<Advertisement> {
    Json(state.advertisement.as_ref().clone())
}

async fn handle(
    state: AppState,
    remote: SocketAddr,
    headers: HeaderMap,
    body: Bytes,
    codec: Codec,
    endpoint: Endpoint,
) -> Response {
    let received = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if received != codec.content_type() {
        let attributes = BTreeMap::from([
            (
                "expected_content_type".to_string(),
                codec.content_type().to_string(),
            ),
            ("received_content_type".to_string(), received.to_string()),
        ]);
        return reply(
            &codec,
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            &protocol_error("unexpected content type", attributes),
            None,
        );
    }

    let command = match codec.parse_command(&body) {
        Ok(command) => command,
        Err(err) => {
            debug!(%err, "undecodable command");
            return reply(
                &codec,
                StatusCode::BAD_REQUEST,
                &protocol_error(err.to_string(), err.attributes()),
                None,
            );
        }
    };

    let kind = command.kind();
    if kind.is_login() != (endpoint == Endpoint::Login) {
        let expected = match endpoint {
            Endpoint::Login => "login",
            Endpoint::Command => "command",
        };
        let attributes = BTreeMap::from([
            ("received_type".to_string(), kind.discriminator().to_string()),
            ("endpoint".to_string(), expected.to_string()),
        ]);
        return reply(
            &codec,
            StatusCode::BAD_REQUEST,
            &protocol_error(format!("{kind} cannot be sent to the {expected} endpoint"), attributes),
            None,
        );
    }

    let session = headers
        .get(COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(from_cookie_header);
    let ctx = CommandContext::new(remote.ip().to_string(), session);
    let request_id = ctx.request_id;

    let executor = Arc::clone(&state.executor);
    match tokio::task::spawn_blocking(move || executor.execute(ctx, command)).await {
        Ok(execution) => reply(&codec, execution.status, &execution.response, execution.session),
        Err(err) => {
            error!(%request_id, %err, "command task failed");
            let failure = ErrorResponse {
                request_id,
                message: "internal error".to_string(),
                code: ErrorCode::Internal,
                attributes: BTreeMap::new(),
                remediating_action: None,
                blame: Blame::Server,
            };
            reply(
                &codec,
                StatusCode::INTERNAL_SERVER_ERROR,
                &Outcome::Error(failure),
                None,
            )
        }
    }
}

/// Rejection raised before a command reaches the executor
fn protocol_error(message: impl Into<String>, attributes: BTreeMap<String, String>) -> Outcome {
    Outcome::Error(ErrorResponse {
        request_id: RequestId::new(),
        message: message.into(),
        code: ErrorCode::Protocol,
        attributes,
        remediating_action: None,
        blame: Blame::Client,
    })
}

fn reply(
    codec: &Codec,
    status: StatusCode,
    outcome: &Outcome,
    session: Option<SessionChange>,
) -> Response {
    let body = match codec.serialize_response(outcome) {
        Ok(body) => body,
        Err(err) => {
            error!(%err, "failed to encode response");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut response = (status, [(CONTENT_TYPE, codec.content_type())], body).into_response();
    let cookie = match session {
        Some(SessionChange::Started(key)) => {
            Some(format!("{SESSION_COOKIE}={key}; Path=/; HttpOnly; SameSite=Strict"))
        }
        Some(SessionChange::Ended) => Some(format!(
            "{SESSION_COOKIE}=; Path=/; Max-Age=0; HttpOnly; SameSite=Strict"
        )),
        None => None,
    };
    if let Some(value) = cookie.and_then(|c| HeaderValue::from_str(&c).ok()) {
        response.headers_mut().insert(SET_COOKIE, value);
    }
    response
}

/// Evict idle sessions and forget quiet hosts on every tick
async fn sweep(sessions: Arc<SessionStore>, limiter: Arc<SlidingWindow>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let now = Instant::now();
        let evicted = sessions.sweep(now);
        limiter.prune(now);
        if evicted > 0 {
            debug!(evicted, remaining = sessions.len(), "idle sessions swept");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(%err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(%err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested");
}
