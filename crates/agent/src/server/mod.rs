//! HTTP server and channel dispatcher.
//!
//! Every channel path upgrades to a WebSocket behind the access gate. After
//! the upgrade the query string is parsed into a [`ChannelRequest`], the
//! matching handler runs to completion, and the session is closed once with
//! the handler's [`TerminalStatus`].

pub mod tls;

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{RawQuery, State};
use axum::middleware;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use protocol::{ChannelKind, ChannelRequest, Interpreter, TerminalStatus};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::auth::{require_access, AccessGate, BasicAuth};
use crate::config::{Config, ConfigError, ScriptsConfig};
use crate::exec::{execute, run_script, ProcessLauncher, SystemLauncher};
use crate::files::upload;
use crate::probe::probe_port;
use crate::session::{attach_interactive, Session};

/// Path of the liveness endpoint.
pub const HEALTH_PATH: &str = "/healthz";

/// Path of the readiness endpoint.
pub const READY_PATH: &str = "/readyz";

/// Immutable state shared by all sessions.
pub struct AgentState {
    /// Creates the processes of command and script channels.
    pub launcher: Arc<dyn ProcessLauncher>,
    /// Interpreter prefixes of the script channels.
    pub scripts: ScriptsConfig,
    /// Host the port probe binds on.
    pub probe_host: IpAddr,
}

impl AgentState {
    /// Build the state from validated configuration.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            launcher: Arc::new(SystemLauncher),
            scripts: config.scripts.clone(),
            probe_host: config.probe_host()?,
        })
    }

    /// Replace the process launcher.
    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Interpreter command prefix for a script channel.
    pub fn interpreter(&self, interpreter: Interpreter) -> &[String] {
        match interpreter {
            Interpreter::Python => &self.scripts.python,
            Interpreter::Shell => &self.scripts.shell,
        }
    }
}

/// Build the router serving every channel plus the health endpoints.
pub fn router(state: Arc<AgentState>, gate: Arc<dyn AccessGate>) -> Router {
    let mut channels = Router::new();
    for kind in ChannelKind::ALL {
        channels = channels.route(
            kind.path(),
            get(
                move |State(state): State<Arc<AgentState>>,
                      RawQuery(query): RawQuery,
                      ws: WebSocketUpgrade| open_channel(kind, state, query, ws),
            ),
        );
    }

    channels
        .route_layer(middleware::from_fn_with_state(gate, require_access))
        .route(HEALTH_PATH, get(health))
        .route(READY_PATH, get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn open_channel(
    kind: ChannelKind,
    state: Arc<AgentState>,
    query: Option<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let session = Session::new(socket);
        let span = tracing::info_span!("session", id = %session.id(), channel = %kind);
        run_session(session, kind, query, state).instrument(span).await;
    })
}

async fn run_session(
    mut session: Session,
    kind: ChannelKind,
    query: Option<String>,
    state: Arc<AgentState>,
) {
    tracing::info!("Channel opened");

    let status = match ChannelRequest::parse(kind, query.as_deref()) {
        Ok(request) => dispatch(&mut session, request, &state).await,
        Err(e) => {
            tracing::warn!(error = %e, "Rejected channel request");
            if let Err(send_err) = session.sender().send_text(e.to_string()).await {
                tracing::debug!(error = %send_err, "Failed to report rejection");
            }
            TerminalStatus::InvalidParameters(e.to_string())
        }
    };

    tracing::info!(status = %status, "Channel finished");
    session.close(status).await;
}

/// Run the handler for `request` and return its terminal status.
pub async fn dispatch(
    session: &mut Session,
    request: ChannelRequest,
    state: &AgentState,
) -> TerminalStatus {
    match request {
        ChannelRequest::CommandExec { command, args } => {
            execute(session, state.launcher.as_ref(), &command, &args).await
        }
        ChannelRequest::ScriptExec { interpreter, args } => {
            run_script(
                session,
                state.launcher.as_ref(),
                state.interpreter(interpreter),
                &args,
            )
            .await
        }
        ChannelRequest::Interactive { entrypoint } => attach_interactive(session, &entrypoint).await,
        ChannelRequest::Upload {
            directory,
            file_name,
        } => upload(session, &directory, &file_name).await,
        ChannelRequest::PortProbe { port } => probe_port(state.probe_host, port).await,
    }
}

/// Serve on the configured address until `shutdown` resolves.
///
/// Terminates TLS itself when a certificate and key are configured.
pub async fn serve<F>(config: &Config, state: AgentState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = config.socket_addr()?;
    let gate: Arc<dyn AccessGate> =
        Arc::new(BasicAuth::new(&config.auth.user, &config.auth.password));
    let app = router(Arc::new(state), gate);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    match config.tls_files() {
        Some((cert, key)) => {
            let acceptor = tls::load_acceptor(cert, key)?;
            tracing::info!("Listening on https://{}", addr);
            tls::serve(listener, app, acceptor, shutdown).await
        }
        None => {
            tracing::info!("Listening on http://{}", addr);
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
                .context("HTTP server error")
        }
    }
}
