//! Message Router (C9, §4.9). The one component in direct contact with the
//! client WebSocket: owns the split sink/stream, attaches identity to every
//! dispatch, enforces the preconditions in §4.9, and is the single writer
//! for the outbound half of the socket (§5 "serialize sends per client
//! channel") via an mpsc queue every other producer — the session actor, the
//! Status Sampler, the Docker Inspector — pushes into instead of touching
//! the socket directly.

mod sftp;

use crate::config::Config;
use crate::error::GatewayError;
use crate::events::{EventBus, EventKind};
use crate::models::{InboundEnvelope, OutboundEnvelope};
use crate::profiles::{self, Decryptor, ProfileStore};
use crate::session::handle::SessionState;
use crate::session::{docker, registry::Registry, status, SessionHandle};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::Instrument;

/// Process-wide collaborators every client connection shares (§5 "the
/// Session Registry is the only shared mutable structure").
pub struct AppState {
    pub registry: Arc<Registry>,
    pub events: Arc<EventBus>,
    pub config: Arc<Config>,
    pub profiles: Arc<dyn ProfileStore>,
    pub decryptor: Arc<dyn Decryptor>,
}

impl AppState {
    pub fn new(config: Config, profiles: Arc<dyn ProfileStore>, decryptor: Arc<dyn Decryptor>) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            events: Arc::new(EventBus::default()),
            config: Arc::new(config),
            profiles,
            decryptor,
        }
    }
}

/// Identity captured at channel acceptance (§3, §6.4); authentication itself
/// is out of scope (§1) and assumed to have populated these already.
#[derive(Debug, Clone, Default)]
pub struct ClientIdentity {
    pub user_id: Option<i64>,
    pub username: Option<String>,
    pub ip: String,
}

/// Drive one client message channel end to end: read/dispatch loop, the
/// single outbound writer task, and the per-connection Liveness Keeper
/// (§4.11). Returns once the socket closes or a fatal protocol error occurs;
/// any session this connection owns is torn down on the way out.
pub async fn handle_connection(ws: WebSocketStream<TcpStream>, state: Arc<AppState>, identity: ClientIdentity) {
    // Entered for the whole connection lifetime (§4.9 "every session gets a
    // span tagged with session_id/user_id/connection_id"); session_id and
    // connection_id are unknown until ssh:connect succeeds, so they start
    // empty and get recorded onto this same span in handle_ssh_connect.
    let span = tracing::info_span!(
        "client_connection",
        ip = %identity.ip,
        user_id = identity.user_id,
        session_id = tracing::field::Empty,
        connection_id = tracing::field::Empty,
    );
    connection_loop(ws, state, identity).instrument(span).await
}

async fn connection_loop(ws: WebSocketStream<TcpStream>, state: Arc<AppState>, identity: ClientIdentity) {
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let acked = Arc::new(AtomicBool::new(true));
    let ping_tx = tx.clone();
    let ping_acked = acked.clone();
    let ping_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            if !ping_acked.swap(false, Ordering::AcqRel) {
                break;
            }
            if ping_tx.send(Message::Ping(Vec::new().into())).is_err() {
                break;
            }
        }
    });

    let mut session: Option<Arc<SessionHandle>> = None;
    let mut forward_task: Option<tokio::task::JoinHandle<()>> = None;

    loop {
        // Clone just the `Arc<Notify>` (not a borrow of `session` itself) so
        // this future doesn't hold a live borrow across the `select!` arm
        // that mutates `session`.
        let ended_signal = session.as_ref().map(|handle| handle.ended.clone());
        let session_ended = async {
            match &ended_signal {
                Some(notify) => notify.notified().await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            frame = stream.next() => {
                let Some(frame) = frame else { break };
                match frame {
                    Ok(Message::Text(text)) => {
                        dispatch_text(&text, &mut session, &mut forward_task, &state, &identity, &tx).await;
                    }
                    Ok(Message::Pong(_)) => acked.store(true, Ordering::Release),
                    Ok(Message::Ping(payload)) => {
                        let _ = tx.send(Message::Pong(payload));
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(error = %e, "client channel read error");
                        break;
                    }
                }
            }
            _ = session_ended => {
                // Shell died out from under the actor thread (§4.1 "Ready ->
                // Teardown triggers on shell close"); tear the session down
                // but keep the client channel open for a fresh ssh:connect.
                if let Some(handle) = session.take() {
                    tracing::debug!(session_id = %handle.id, "session ended, tearing down");
                    state.registry.remove(&handle.id);
                    state.events.emit(
                        EventKind::Logout,
                        identity.user_id,
                        identity.username.clone(),
                        Some(json!({"sessionId": handle.id.to_string()})),
                    );
                }
                if let Some(task) = forward_task.take() {
                    task.abort();
                }
            }
        }
    }

    ping_task.abort();
    if let Some(task) = forward_task.take() {
        task.abort();
    }
    if let Some(handle) = session.take() {
        state.registry.remove(&handle.id);
        state.events.emit(
            EventKind::Logout,
            identity.user_id,
            identity.username.clone(),
            Some(json!({"sessionId": handle.id.to_string()})),
        );
    }
    drop(tx);
    let _ = writer.await;
}

async fn dispatch_text(
    text: &str,
    session: &mut Option<Arc<SessionHandle>>,
    forward_task: &mut Option<tokio::task::JoinHandle<()>>,
    state: &Arc<AppState>,
    identity: &ClientIdentity,
    tx: &UnboundedSender<Message>,
) {
    let envelope: InboundEnvelope = match serde_json::from_str(text) {
        Ok(env) => env,
        Err(e) => {
            send_error(tx, format!("malformed message: {e}"));
            return;
        }
    };

    let kind = envelope.kind.as_str();

    if kind.starts_with("sftp:") && !kind.starts_with("sftp:upload:") && envelope.request_id.as_deref().unwrap_or("").is_empty() {
        send_envelope(
            tx,
            OutboundEnvelope::new("sftp_error").with_payload(json!({"message": "requestId is required for sftp requests"})),
        );
        return;
    }

    match kind {
        "ssh:connect" => handle_ssh_connect(envelope.payload, session, forward_task, state, identity, tx).await,
        "ssh:input" => handle_ssh_input(envelope.payload, session),
        "ssh:resize" => handle_ssh_resize(envelope.payload, session),
        "docker:get_status" => handle_docker_get_status(session, tx).await,
        "docker:command" => handle_docker_command(envelope.payload, session, state, identity, tx).await,
        "docker:get_stats" => handle_docker_get_stats(envelope.payload, session, tx).await,
        k if k.starts_with("sftp:") => sftp::dispatch(k, envelope.payload, envelope.request_id, session, tx).await,
        other => send_error(tx, format!("unsupported message type '{other}'")),
    }
}

// ---- Shell Channel / session lifecycle (C2, C3) ---------------------------

async fn handle_ssh_connect(
    payload: Value,
    session: &mut Option<Arc<SessionHandle>>,
    forward_task: &mut Option<tokio::task::JoinHandle<()>>,
    state: &Arc<AppState>,
    identity: &ClientIdentity,
    tx: &UnboundedSender<Message>,
) {
    let Some(connection_id) = payload.get("connectionId").and_then(Value::as_i64) else {
        send_ssh_error(tx, "ssh:connect requires an integer connectionId".to_string());
        return;
    };

    if let Some(old) = session.take() {
        if let Some(task) = forward_task.take() {
            task.abort();
        }
        state.registry.remove(&old.id);
    }

    send_status(tx, "resolving connection profile");
    let encrypted = match state.profiles.load(connection_id) {
        Ok(p) => p,
        Err(e) => {
            let e = e.with_operation("profiles.load");
            e.log();
            send_ssh_error(tx, e.user_message());
            return;
        }
    };
    let spec = match profiles::decrypt_spec(encrypted, state.decryptor.as_ref()) {
        Ok(s) => s,
        Err(e) => {
            let e = e.with_operation("decrypt_spec");
            e.log();
            send_ssh_error(tx, e.user_message());
            return;
        }
    };

    send_status(tx, format!("connecting to {}:{}", spec.host, spec.port));

    let (handle, outbound_rx) = match SessionHandle::connect(
        spec,
        state.config.ssh_connect_timeout(),
        state.config.sftp_buffer_size(),
    )
    .await
    {
        Ok(pair) => pair,
        Err(e) => {
            let e = e.with_operation("ssh_connect");
            e.log();
            state.events.emit(
                EventKind::SshConnectFailure,
                identity.user_id,
                identity.username.clone(),
                Some(json!({"connectionId": connection_id, "error": e.user_message()})),
            );
            send_ssh_error(tx, e.user_message());
            return;
        }
    };
    let handle = Arc::new(handle);
    tracing::Span::current().record("session_id", tracing::field::display(handle.id)).record("connection_id", connection_id);
    state.registry.insert(handle.clone());

    let jh = tokio::spawn(forward_outbound(outbound_rx, tx.clone()));
    *forward_task = Some(jh);

    if let Err(e) = handle.shell_open(80, 24).await {
        let e = e.with_operation("shell_open").with_session(handle.id);
        e.log();
        state.registry.remove(&handle.id);
        state.events.emit(
            EventKind::SshShellFailure,
            identity.user_id,
            identity.username.clone(),
            Some(json!({"connectionId": connection_id, "error": e.user_message()})),
        );
        send_ssh_error(tx, e.user_message());
        return;
    }
    handle.set_state(SessionState::Ready);

    let status_task = status::spawn(handle.clone(), connection_id, state.config.status_sampler_interval(), state.registry.net_cache());
    handle.register_background(status_task);
    let docker_task = docker::spawn(handle.clone(), state.config.docker_status_interval());
    handle.register_background(docker_task);

    state.events.emit(
        EventKind::SshConnectSuccess,
        identity.user_id,
        identity.username.clone(),
        Some(json!({"connectionId": connection_id, "sessionId": handle.id.to_string()})),
    );

    send_envelope(
        tx,
        OutboundEnvelope::new("ssh:connected").with_payload(json!({"connectionId": connection_id, "sessionId": handle.id.to_string()})),
    );

    *session = Some(handle);
}

async fn forward_outbound(mut rx: UnboundedReceiver<OutboundEnvelope>, tx: UnboundedSender<Message>) {
    while let Some(envelope) = rx.recv().await {
        match serde_json::to_string(&envelope) {
            Ok(text) => {
                if tx.send(Message::Text(text.into())).is_err() {
                    break;
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to serialize outbound envelope"),
        }
    }
}

fn handle_ssh_input(payload: Value, session: &Option<Arc<SessionHandle>>) {
    let Some(handle) = session else {
        tracing::warn!("ssh:input dropped, no active session");
        return;
    };
    let Some(data) = payload.get("data").and_then(Value::as_str) else { return };
    handle.shell_input(data.as_bytes().to_vec());
}

/// `ssh:resize{cols,rows}`: non-positive values are rejected silently — the
/// admission rule in §4.3 ("rejects non-positive integers") has no
/// associated wire error, unlike every SFTP/shell failure path.
fn handle_ssh_resize(payload: Value, session: &Option<Arc<SessionHandle>>) {
    let Some(handle) = session else { return };
    let cols = payload.get("cols").and_then(Value::as_i64).unwrap_or(0);
    let rows = payload.get("rows").and_then(Value::as_i64).unwrap_or(0);
    if cols <= 0 || rows <= 0 || cols > u16::MAX as i64 || rows > u16::MAX as i64 {
        tracing::warn!(cols, rows, "ssh:resize rejected, non-positive or out-of-range dimensions");
        return;
    }
    handle.shell_resize(cols as u16, rows as u16);
}

// ---- Docker Inspector (C7) -------------------------------------------------

async fn handle_docker_get_status(session: &Option<Arc<SessionHandle>>, tx: &UnboundedSender<Message>) {
    let Some(handle) = session else {
        send_error(tx, "docker:get_status requires an active session");
        return;
    };
    docker::poll_once(handle).await;
}

async fn handle_docker_command(
    payload: Value,
    session: &Option<Arc<SessionHandle>>,
    _state: &Arc<AppState>,
    _identity: &ClientIdentity,
    tx: &UnboundedSender<Message>,
) {
    let Some(handle) = session else {
        send_error(tx, "docker:command requires an active session");
        return;
    };
    let Some(container_id) = payload.get("containerId").and_then(Value::as_str) else {
        send_docker_command_error(tx, "", "", "containerId is required".to_string());
        return;
    };
    let Some(command) = payload.get("command").and_then(Value::as_str) else {
        send_docker_command_error(tx, container_id, "", "command is required".to_string());
        return;
    };

    match docker::run_command(handle, container_id, command).await {
        Ok(()) => {
            let hint_tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                let _ = hint_tx.send(Message::Text(
                    serde_json::to_string(&OutboundEnvelope::new("request_docker_status_update")).unwrap_or_default().into(),
                ));
            });
        }
        Err(message) => send_docker_command_error(tx, container_id, command, message),
    }
}

async fn handle_docker_get_stats(payload: Value, session: &Option<Arc<SessionHandle>>, tx: &UnboundedSender<Message>) {
    let Some(handle) = session else {
        send_error(tx, "docker:get_stats requires an active session");
        return;
    };
    let Some(container_id) = payload.get("containerId").and_then(Value::as_str) else {
        send_error(tx, "containerId is required");
        return;
    };
    match docker::stats_for(handle, container_id).await {
        Ok(stats) => send_envelope(tx, OutboundEnvelope::new("docker:stats:update").with_payload(json!({"containerId": container_id, "stats": stats}))),
        Err(message) => send_envelope(tx, OutboundEnvelope::new("docker:stats:error").with_payload(json!({"containerId": container_id, "message": message}))),
    }
}

fn send_docker_command_error(tx: &UnboundedSender<Message>, container_id: &str, command: &str, message: String) {
    send_envelope(
        tx,
        OutboundEnvelope::new("docker:command:error").with_payload(json!({"command": command, "containerId": container_id, "message": message})),
    );
}

// ---- Outbound helpers -------------------------------------------------------

fn send_envelope(tx: &UnboundedSender<Message>, envelope: OutboundEnvelope) {
    match serde_json::to_string(&envelope) {
        Ok(text) => {
            let _ = tx.send(Message::Text(text.into()));
        }
        Err(e) => tracing::error!(error = %e, "failed to serialize outbound envelope"),
    }
}

fn send_status(tx: &UnboundedSender<Message>, message: impl Into<String>) {
    send_envelope(tx, OutboundEnvelope::new("ssh:status").with_payload(json!(message.into())));
}

fn send_ssh_error(tx: &UnboundedSender<Message>, message: String) {
    send_envelope(tx, OutboundEnvelope::new("ssh:error").with_payload(json!(message)));
}

fn send_error(tx: &UnboundedSender<Message>, message: impl Into<String>) {
    send_envelope(tx, OutboundEnvelope::new("error").with_payload(json!(message.into())));
}

/// Shared by this module and `sftp` for precondition failures that need a
/// session but don't have one (§7 PreconditionError).
pub(crate) fn require_session<'a>(session: &'a Option<Arc<SessionHandle>>) -> Result<&'a Arc<SessionHandle>, GatewayError> {
    session.as_ref().ok_or_else(|| GatewayError::precondition("no active session bound to this client channel"))
}
