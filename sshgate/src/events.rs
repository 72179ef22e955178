//! Event Bus (C10). Typed events, fire-and-forget delivery: the multiplexer
//! only ever produces events, never awaits a consumer (§4.10), so a slow or
//! absent audit/notification subscriber can never back-pressure a session.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[allow(non_camel_case_types)]
pub enum EventKind {
    LoginSuccess,
    LoginFailure,
    Logout,
    PasswordChanged,
    TwoFaEnabled,
    TwoFaDisabled,
    PasskeyRegistered,
    PasskeyDeleted,
    ConnectionCreated,
    ConnectionUpdated,
    ConnectionDeleted,
    ProxyCreated,
    ProxyUpdated,
    ProxyDeleted,
    TagCreated,
    TagUpdated,
    TagDeleted,
    SettingsUpdated,
    IpWhitelistUpdated,
    NotificationSettingCreated,
    NotificationSettingUpdated,
    NotificationSettingDeleted,
    SftpAction,
    SshConnectSuccess,
    SshConnectFailure,
    SshShellFailure,
    ServerStarted,
    ServerError,
    DatabaseMigration,
    AdminSetupComplete,
    TestNotification,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub user_id: Option<i64>,
    pub username: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub details: Option<Value>,
}

/// Typed event fan-out. Audit loggers and notification dispatchers subscribe
/// via `subscribe()`; the core multiplexer never sees or waits on them.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Emitted synchronously at the call site; delivery is asynchronous (§4.10).
    pub fn emit(
        &self,
        kind: EventKind,
        user_id: Option<i64>,
        username: Option<String>,
        details: Option<Value>,
    ) {
        let event = Event {
            kind,
            user_id,
            username,
            timestamp: Utc::now(),
            details,
        };
        // A send error just means there are currently no subscribers; that is
        // not a failure for an emitter that must never block or propagate.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.emit(EventKind::ServerStarted, None, None, None);
    }

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(
            EventKind::SshConnectSuccess,
            Some(7),
            Some("alice".into()),
            None,
        );
        let evt = rx.recv().await.unwrap();
        assert_eq!(evt.kind, EventKind::SshConnectSuccess);
        assert_eq!(evt.user_id, Some(7));
    }
}
