//! Session Registry (C1, §4.1). The single shared mutable structure in the
//! gateway (§5 "Shared-resource policy"): a concurrent map from session id
//! to its handle. `remove` is the one teardown path every collaborator
//! (Router, Liveness Keeper, the actor's own disconnect notification) calls
//! through; it is idempotent and tolerant of a session that never finished
//! connecting, mirroring the teacher's `AppState::sessions` map but with the
//! cleanup fan-out the teacher left to per-command `Drop` impls made explicit
//! here instead.

use crate::models::NetworkSample;
use crate::session::handle::SessionHandle;
use crate::session::SessionId;
use dashmap::DashMap;
use std::sync::Arc;

pub struct Registry {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    /// Status Sampler's previous-tick counters (§3 `NetworkRateCache`), keyed
    /// by session. Owned here, rather than by `SessionHandle` or `AppState`
    /// directly, so `remove` can wipe a session's entry in the same place
    /// every other piece of per-session state is torn down (§3 "wiped on
    /// session teardown"). Held behind an `Arc` so `status::spawn`'s task can
    /// keep its own handle to the same map without borrowing the `Registry`.
    net_cache: Arc<DashMap<SessionId, NetworkSample>>,
}

impl Registry {
    pub fn new() -> Self {
        Self { sessions: DashMap::new(), net_cache: Arc::new(DashMap::new()) }
    }

    pub fn insert(&self, handle: Arc<SessionHandle>) {
        self.sessions.insert(handle.id, handle);
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// The Status Sampler's per-session network-rate cache (§3
    /// `NetworkRateCache`), shared with every `status::spawn` task through
    /// the same `Registry` the session is tracked in.
    pub fn net_cache(&self) -> Arc<DashMap<SessionId, NetworkSample>> {
        self.net_cache.clone()
    }

    /// Remove `id` and tear its session down: stop the status/docker timers,
    /// end the shell, close SFTP, end the transport, cancel every
    /// `ActiveUpload` tied to it, and wipe its `NetworkRateCache` entry
    /// (§4.1). Calling this twice for the same id is a no-op the second time
    /// (§8 "Teardown called twice is a no-op").
    pub fn remove(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        let removed = self.sessions.remove(id).map(|(_, handle)| handle);
        if let Some(handle) = &removed {
            handle.shutdown();
        }
        self.net_cache.remove(id);
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of every live session, used by the Liveness Keeper's 5s
    /// sweep (§4.11) and by diagnostics.
    pub fn iter(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::handle;

    #[tokio::test]
    async fn insert_get_remove_round_trip() {
        let registry = Registry::new();
        let (handle, _outbound_rx) = handle::test_handle();
        let id = handle.id;

        registry.insert(handle);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&id).is_some());

        let removed = registry.remove(&id);
        assert!(removed.is_some());
        assert_eq!(registry.len(), 0);
        assert!(registry.get(&id).is_none());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = Registry::new();
        let (handle, _outbound_rx) = handle::test_handle();
        let id = handle.id;
        registry.insert(handle);

        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn remove_unknown_id_never_panics() {
        let registry = Registry::new();
        assert!(registry.remove(&uuid::Uuid::new_v4()).is_none());
    }
}
