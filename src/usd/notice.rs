//! Change notices and listener registration
//!
//! A [`NoticeRegistry`] holds the listeners for one notice type from one
//! sender. Registering returns a [`ListenerKey`] that revokes the listener;
//! revoking twice, or after the registry is gone, does nothing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::sync::lock;
use crate::usd::path::SdfPath;
use crate::usd::stage::{Stage, StageWeak};

/// Listener callback for notices of type `N`
pub type NoticeCallback<N> = Arc<dyn Fn(&N) + Send + Sync>;

trait RevokeListener: Send + Sync {
    fn revoke(&self, id: u64) -> bool;
}

/// Listeners for one notice type, scoped to one sender
pub struct NoticeRegistry<N> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, NoticeCallback<N>)>>,
}

impl<N: 'static> NoticeRegistry<N> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Register a listener
    pub fn register<F>(self: &Arc<Self>, callback: F) -> ListenerKey
    where
        F: Fn(&N) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).push((id, Arc::new(callback)));

        let registry: Arc<dyn RevokeListener> = self.clone();
        ListenerKey {
            id,
            registry: Arc::downgrade(&registry),
        }
    }

    /// Deliver a notice to every listener registered at the time of the
    /// call. No lock is held while listeners run.
    pub fn send(&self, notice: &N) -> usize {
        let snapshot: Vec<NoticeCallback<N>> = lock(&self.listeners)
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in &snapshot {
            callback(notice);
        }
        snapshot.len()
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }
}

impl<N: 'static> RevokeListener for NoticeRegistry<N> {
    fn revoke(&self, id: u64) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }
}

/// Handle to a registered listener
pub struct ListenerKey {
    id: u64,
    registry: Weak<dyn RevokeListener>,
}

impl ListenerKey {
    /// Remove the listener. Returns false if it was already gone.
    pub fn revoke(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.revoke(self.id),
            None => false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl std::fmt::Debug for ListenerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerKey")
            .field("id", &self.id)
            .field("live", &(self.registry.strong_count() > 0))
            .finish()
    }
}

/// Objects on a stage changed. Resynced paths had structural changes
/// (prims or property specs added, removed, renamed, retyped, composition
/// changes); changed-info-only paths had values or metadata edited.
#[derive(Debug, Clone)]
pub struct ObjectsChanged {
    stage: StageWeak,
    resynced: Vec<SdfPath>,
    changed_info_only: Vec<SdfPath>,
}

impl ObjectsChanged {
    pub fn new(stage: StageWeak, resynced: Vec<SdfPath>, changed_info_only: Vec<SdfPath>) -> Self {
        Self {
            stage,
            resynced,
            changed_info_only,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        self.stage.upgrade()
    }

    pub fn sender(&self) -> &StageWeak {
        &self.stage
    }

    pub fn resynced_paths(&self) -> &[SdfPath] {
        &self.resynced
    }

    pub fn changed_info_only_paths(&self) -> &[SdfPath] {
        &self.changed_info_only
    }

    /// True if `path` or one of its ancestors was resynced
    pub fn resynced_object(&self, path: &SdfPath) -> bool {
        self.resynced.iter().any(|resynced| path.has_prefix(resynced))
    }

    pub fn changed_info_only(&self, path: &SdfPath) -> bool {
        self.changed_info_only.iter().any(|changed| changed == path)
    }
}

/// Some layer content used by the stage changed
#[derive(Debug, Clone)]
pub struct StageContentsChanged {
    pub stage: StageWeak,
}

/// The stage's edit target changed
#[derive(Debug, Clone)]
pub struct StageEditTargetChanged {
    pub stage: StageWeak,
}
