//! Async-facing wrapper around a session actor (§3 `Session`, §4.1). Owns the
//! session's lifecycle state machine and forwards calls to the actor thread
//! as `ActorCommand`s, awaiting the `oneshot` reply. Generalizes the
//! teacher's `ManagedSession` (state field + ssh2 handles) by splitting the
//! ssh2 handles off into the actor thread itself.

use crate::error::GatewayError;
use crate::models::{ConnectionSpec, FileEntry, OutboundEnvelope};
use crate::session::actor::{self, ActorCommand, ActorHandle, ExecOutput, UploadChunkOutcome, UploadStartOutcome};
use crate::session::utils::run_blocking;
use crate::session::{transport, SessionId};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// §4.1 session lifecycle: `Created -> Authenticating -> Connected ->
/// ShellOpening -> Ready -> Teardown -> Gone`. Stored as a small integer so
/// reads never block a concurrent writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Created = 0,
    Authenticating = 1,
    Connected = 2,
    ShellOpening = 3,
    Ready = 4,
    Teardown = 5,
    Gone = 6,
}

impl From<u8> for SessionState {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Authenticating,
            2 => Self::Connected,
            3 => Self::ShellOpening,
            4 => Self::Ready,
            5 => Self::Teardown,
            _ => Self::Gone,
        }
    }
}

pub struct SessionHandle {
    pub id: SessionId,
    pub connection_id: i64,
    pub connection_name: String,
    pub username: String,
    pub host: String,
    state: AtomicU8,
    actor: ActorHandle,
    /// Periodic Status Sampler / Docker Inspector tasks (§4.6, §4.7) spun up
    /// once the session is `Ready`; aborted on teardown so they never probe
    /// an actor thread that has already shut down.
    background: Mutex<Vec<JoinHandle<()>>>,
    /// Clone of the actor's outbound sender, handed to the Status Sampler and
    /// Docker Inspector so their `status_update`/`docker:status:update` frames
    /// join the same ordered outbound queue as shell and SFTP traffic (§5
    /// "outbound messages are delivered in the order their producers enqueue
    /// them").
    outbound: UnboundedSender<OutboundEnvelope>,
    /// Fired by the actor thread when the shell closes out from under it
    /// (remote disconnect, read error). The Router races this against its
    /// inbound frame loop so a session whose shell died gets torn down from
    /// the Registry even if the client never sends anything else (§4.1,
    /// §8 invariant 5).
    pub ended: std::sync::Arc<tokio::sync::Notify>,
}

impl SessionHandle {
    /// Run the Transport Adapter (C2) for `spec` and spawn the session actor
    /// (C3-C5) on top of it. Returns the handle plus the receiving end of its
    /// outbound push channel, which the Message Router drains into the
    /// client's WebSocket.
    pub async fn connect(
        spec: ConnectionSpec,
        connect_timeout: Duration,
        sftp_buffer_size: usize,
    ) -> Result<(SessionHandle, UnboundedReceiver<OutboundEnvelope>), GatewayError> {
        let connection_id = spec.connection_id;
        let connection_name = spec.connection_name.clone();
        let username = spec.username.clone();
        let host = spec.host.clone();

        let session = run_blocking(move || transport::connect(&spec, connect_timeout)).await?;

        let (outbound_tx, outbound_rx) = unbounded_channel();
        let ended = std::sync::Arc::new(tokio::sync::Notify::new());
        let actor = actor::spawn(session, outbound_tx.clone(), ended.clone(), sftp_buffer_size);

        let handle = SessionHandle {
            id: uuid::Uuid::new_v4(),
            connection_id,
            connection_name,
            username,
            host,
            state: AtomicU8::new(SessionState::Connected as u8),
            actor,
            background: Mutex::new(Vec::new()),
            outbound: outbound_tx,
            ended,
        };
        Ok((handle, outbound_rx))
    }

    /// Clone of the outbound queue, for producers other than the actor
    /// itself (Status Sampler, Docker Inspector) that need to push a frame
    /// without round-tripping through an `ActorCommand`.
    pub fn outbound(&self) -> UnboundedSender<OutboundEnvelope> {
        self.outbound.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state.load(Ordering::Acquire).into()
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Track a background task so teardown can cancel it deterministically
    /// (§4.1 Registry.Remove: every timer tied to the session must stop).
    pub fn register_background(&self, task: JoinHandle<()>) {
        self.background.lock().unwrap().push(task);
    }

    pub fn shutdown(&self) {
        self.set_state(SessionState::Teardown);
        for task in self.background.lock().unwrap().drain(..) {
            task.abort();
        }
        self.actor.send(ActorCommand::Shutdown);
        self.set_state(SessionState::Gone);
    }

    fn call<T, F>(&self, build: F) -> CallFuture<T>
    where
        F: FnOnce(oneshot::Sender<Result<T, GatewayError>>) -> ActorCommand,
    {
        let (tx, rx) = oneshot::channel();
        self.actor.send(build(tx));
        CallFuture { rx }
    }

    // ---- Shell Channel (C3) -------------------------------------------------

    pub async fn shell_open(&self, cols: u16, rows: u16) -> Result<(), GatewayError> {
        self.call(|reply| ActorCommand::ShellOpen { cols, rows, reply }).await
    }

    pub fn shell_input(&self, data: Vec<u8>) {
        self.actor.send(ActorCommand::ShellInput { data });
    }

    pub fn shell_resize(&self, cols: u16, rows: u16) {
        self.actor.send(ActorCommand::ShellResize { cols, rows });
    }

    // ---- Remote-Exec Helper (C4) --------------------------------------------

    pub async fn exec(&self, command: String) -> Result<ExecOutput, GatewayError> {
        self.call(|reply| ActorCommand::Exec { command, reply }).await
    }

    // ---- SFTP Service (C5) --------------------------------------------------

    pub async fn sftp_readdir(&self, path: String) -> Result<Vec<FileEntry>, GatewayError> {
        self.call(|reply| ActorCommand::SftpReaddir { path, reply }).await
    }

    pub async fn sftp_stat(&self, path: String) -> Result<FileEntry, GatewayError> {
        self.call(|reply| ActorCommand::SftpStat { path, reply }).await
    }

    pub async fn sftp_realpath(&self, path: String) -> Result<String, GatewayError> {
        self.call(|reply| ActorCommand::SftpRealpath { path, reply }).await
    }

    pub async fn sftp_mkdir(&self, path: String) -> Result<Option<FileEntry>, GatewayError> {
        self.call(|reply| ActorCommand::SftpMkdir { path, reply }).await
    }

    pub async fn sftp_unlink(&self, path: String) -> Result<(), GatewayError> {
        self.call(|reply| ActorCommand::SftpUnlink { path, reply }).await
    }

    pub async fn sftp_rmdir(&self, path: String) -> Result<(), GatewayError> {
        self.call(|reply| ActorCommand::SftpRmdir { path, reply }).await
    }

    pub async fn sftp_rename(&self, old_path: String, new_path: String) -> Result<Option<FileEntry>, GatewayError> {
        self.call(|reply| ActorCommand::SftpRename { old_path, new_path, reply }).await
    }

    pub async fn sftp_chmod(&self, path: String, mode: u32) -> Result<Option<FileEntry>, GatewayError> {
        self.call(|reply| ActorCommand::SftpChmod { path, mode, reply }).await
    }

    pub async fn sftp_readfile(&self, path: String) -> Result<String, GatewayError> {
        self.call(|reply| ActorCommand::SftpReadfile { path, reply }).await
    }

    pub async fn sftp_writefile(&self, path: String, content: String) -> Result<Option<FileEntry>, GatewayError> {
        self.call(|reply| ActorCommand::SftpWritefile { path, content, reply }).await
    }

    pub async fn sftp_copy(&self, sources: Vec<String>, destination_dir: String) -> Result<Vec<FileEntry>, GatewayError> {
        self.call(|reply| ActorCommand::SftpCopy { sources, destination_dir, reply }).await
    }

    pub async fn sftp_move(&self, sources: Vec<String>, destination_dir: String) -> Result<Vec<FileEntry>, GatewayError> {
        self.call(|reply| ActorCommand::SftpMove { sources, destination_dir, reply }).await
    }

    // ---- Chunked upload engine (§4.5.5) --------------------------------------

    pub async fn upload_start(
        &self,
        upload_id: String,
        remote_path: String,
        size: u64,
        relative_path: Option<String>,
    ) -> Result<UploadStartOutcome, GatewayError> {
        self.call(|reply| ActorCommand::UploadStart { upload_id, remote_path, size, relative_path, reply }).await
    }

    pub async fn upload_chunk(&self, upload_id: String, data: Vec<u8>) -> Result<UploadChunkOutcome, GatewayError> {
        self.call(|reply| ActorCommand::UploadChunk { upload_id, data, reply }).await
    }

    pub fn upload_cancel(&self, upload_id: String) {
        self.actor.send(ActorCommand::UploadCancel { upload_id });
    }
}

/// Thin future wrapping the `oneshot` reply; a dropped sender (actor thread
/// gone) surfaces as an internal error rather than a panic. `oneshot::Receiver`
/// is `Unpin`, so this can implement `Future` without any unsafe code.
/// Construct a handle around an unconnected `ssh2::Session` so the Registry
/// and teardown paths can be exercised without a live sshd (§8 invariant 5).
#[cfg(test)]
pub fn test_handle() -> (std::sync::Arc<SessionHandle>, UnboundedReceiver<OutboundEnvelope>) {
    let session = ssh2::Session::new().expect("ssh2 session object");
    let (outbound_tx, outbound_rx) = unbounded_channel();
    let ended = std::sync::Arc::new(tokio::sync::Notify::new());
    let actor = actor::spawn(session, outbound_tx.clone(), ended.clone(), 32 * 1024);
    let handle = SessionHandle {
        id: uuid::Uuid::new_v4(),
        connection_id: 0,
        connection_name: "test".to_string(),
        username: "test".to_string(),
        host: "test".to_string(),
        state: AtomicU8::new(SessionState::Ready as u8),
        actor,
        background: Mutex::new(Vec::new()),
        outbound: outbound_tx,
        ended,
    };
    (std::sync::Arc::new(handle), outbound_rx)
}

struct CallFuture<T> {
    rx: oneshot::Receiver<Result<T, GatewayError>>,
}

impl<T> std::future::Future for CallFuture<T> {
    type Output = Result<T, GatewayError>;

    fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Self::Output> {
        match std::pin::Pin::new(&mut self.rx).poll(cx) {
            std::task::Poll::Ready(Ok(result)) => std::task::Poll::Ready(result),
            std::task::Poll::Ready(Err(_)) => {
                std::task::Poll::Ready(Err(GatewayError::internal("session actor is gone")))
            }
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}
