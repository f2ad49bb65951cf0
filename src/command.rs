//! Embedded status/control HTTP server and the `CommandSource` seam that
//! feeds commands into the watch loop (spec ref: §4.7 WatchLoop, "External
//! control surface"; SPEC_FULL.md §1 ambient stack, "CommandSource").
//!
//! Grounded in the teacher's `ui.rs`: an `axum` router built from a small
//! `Arc`-wrapped state struct, a `JsonError` `IntoResponse` wrapper for
//! uniform error bodies, and a handle type that holds the bound port and a
//! `tokio::sync::watch` shutdown signal so the server task can be stopped
//! from outside without dropping the whole runtime.

use crate::status::{Status, StatusExchange};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// A command the watch loop should act on at its next convenient boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Run one sync pass immediately instead of waiting for the interval.
    SyncNow,
    /// Same as `SyncNow`, but ignoring `--until-found`/`--recent` for this pass.
    SyncAll,
    /// Stop the watch loop after the in-flight pass (if any) completes.
    Stop,
}

/// Decouples the watch loop from axum: it only needs something it can poll
/// for the next queued command, whether that arrives over HTTP, a webhook
/// relay, or (in tests) a plain channel fed by hand.
pub trait CommandSource: Send {
    fn try_recv(&mut self) -> Option<ControlCommand>;
}

pub struct ChannelCommandSource {
    receiver: mpsc::UnboundedReceiver<ControlCommand>,
}

impl CommandSource for ChannelCommandSource {
    fn try_recv(&mut self) -> Option<ControlCommand> {
        self.receiver.try_recv().ok()
    }
}

/// Point-in-time snapshot the status server publishes at `GET /api/status`.
/// The watch loop owns the only writer; readers only ever see a clone.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub last_run_started: Option<String>,
    pub last_run_finished: Option<String>,
    pub last_error: Option<String>,
    pub assets_downloaded_last_run: u64,
    pub total_assets_downloaded: u64,
    /// Assets the current album reported at the start of the last pass.
    pub total_count: u64,
    /// Assets the last pass actually paged through and examined.
    pub checked_count: u64,
    /// Assets the last pass saw but didn't reach (stopped early or cancelled).
    pub to_download_count: u64,
    /// Seconds remaining until the next scheduled pass, `None` outside watch mode.
    pub waiting_seconds: Option<u64>,
    /// Unix timestamp the last pass finished, for clients that want to
    /// compute staleness without parsing `last_run_finished`.
    pub last_sync_unix: Option<i64>,
}

#[derive(Clone, Default)]
pub struct SharedSnapshot(Arc<Mutex<StatusSnapshot>>);

impl SharedSnapshot {
    pub fn get(&self) -> StatusSnapshot {
        self.0.lock().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut StatusSnapshot)) {
        f(&mut self.0.lock());
    }
}

struct ServerState {
    status: StatusExchange,
    snapshot: SharedSnapshot,
    commands: mpsc::UnboundedSender<ControlCommand>,
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    snapshot: StatusSnapshot,
    mfa_status: &'static str,
}

#[derive(Deserialize)]
struct MfaCodeRequest {
    code: String,
}

struct JsonError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for JsonError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

async fn get_status(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let mfa_status = mfa_status_label(state.status.get_status());
    Json(StatusResponse { snapshot: state.snapshot.get(), mfa_status })
}

fn mfa_status_label(status: Status) -> &'static str {
    match status {
        Status::NoInputNeeded => "none",
        Status::NeedPassword => "need_password",
        Status::NeedMfa => "need_mfa",
        Status::SuppliedMfa => "supplied_mfa",
        Status::CheckingMfa => "checking_mfa",
    }
}

async fn post_sync_now(State(state): State<Arc<ServerState>>) -> Result<impl IntoResponse, JsonError> {
    send_command(&state, ControlCommand::SyncNow)
}

async fn post_sync_all(State(state): State<Arc<ServerState>>) -> Result<impl IntoResponse, JsonError> {
    send_command(&state, ControlCommand::SyncAll)
}

async fn post_stop(State(state): State<Arc<ServerState>>) -> Result<impl IntoResponse, JsonError> {
    send_command(&state, ControlCommand::Stop)
}

fn send_command(state: &ServerState, command: ControlCommand) -> Result<impl IntoResponse, JsonError> {
    state.commands.send(command).map_err(|_| JsonError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        message: "watch loop is not listening for commands".to_string(),
    })?;
    Ok(Json(serde_json::json!({ "accepted": true })))
}

async fn post_mfa_code(State(state): State<Arc<ServerState>>, Json(request): Json<MfaCodeRequest>) -> Result<impl IntoResponse, JsonError> {
    if !state.status.supply_mfa_code(request.code) {
        return Err(JsonError {
            status: StatusCode::CONFLICT,
            message: "no MFA code is currently being waited on".to_string(),
        });
    }
    Ok(Json(serde_json::json!({ "accepted": true })))
}

fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/sync-now", post(post_sync_now))
        .route("/api/sync-all", post(post_sync_all))
        .route("/api/stop", post(post_stop))
        .route("/api/mfa-code", post(post_mfa_code))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// A running control server plus the pieces the watch loop needs to talk
/// to it: a command source to drain, and the snapshot it should keep
/// updated.
pub struct ControlServer {
    pub handle: JoinHandle<()>,
    pub commands: ChannelCommandSource,
    pub snapshot: SharedSnapshot,
    pub local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl ControlServer {
    pub async fn spawn(bind: &str, port: u16, status: StatusExchange) -> anyhow::Result<Self> {
        let addr: SocketAddr = format!("{bind}:{port}").parse()?;
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let snapshot = SharedSnapshot::default();
        let state = Arc::new(ServerState { status, snapshot: snapshot.clone(), commands: command_tx });
        let router = build_router(state);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(err) = server.await {
                tracing::error!(error = %err, "control server exited with an error");
            }
        });

        tracing::info!(addr = %local_addr, "control server listening");
        Ok(Self { handle, commands: ChannelCommandSource { receiver: command_rx }, snapshot, local_addr, shutdown: shutdown_tx })
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mfa_status_label_covers_every_variant() {
        assert_eq!(mfa_status_label(Status::NoInputNeeded), "none");
        assert_eq!(mfa_status_label(Status::NeedMfa), "need_mfa");
        assert_eq!(mfa_status_label(Status::SuppliedMfa), "supplied_mfa");
        assert_eq!(mfa_status_label(Status::CheckingMfa), "checking_mfa");
        assert_eq!(mfa_status_label(Status::NeedPassword), "need_password");
    }

    #[test]
    fn shared_snapshot_reflects_updates() {
        let snapshot = SharedSnapshot::default();
        snapshot.update(|s| s.total_assets_downloaded = 42);
        assert_eq!(snapshot.get().total_assets_downloaded, 42);
    }
}
