//! Stage notice listener and change classification
//!
//! A [`StageNoticeListener`] subscribes to the objects-changed and
//! contents-changed notices of exactly one stage and forwards them to
//! whichever callbacks are currently installed. Nodes own one each.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::sync::lock;
use crate::usd::{ListenerKey, ObjectsChanged, Stage, StageContentsChanged, StageWeak};

/// How disruptive an objects-changed notice is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChangeType {
    Ignored,
    Update,
    Resync,
}

impl ChangeType {
    /// A resync is always also an update
    pub fn implies_update(self) -> bool {
        self != ChangeType::Ignored
    }
}

/// Classify an objects-changed notice. Any resynced path makes it a
/// resync; otherwise any changed-info path makes it an update.
pub fn classify_objects_changed(notice: &ObjectsChanged) -> ChangeType {
    if !notice.resynced_paths().is_empty() {
        ChangeType::Resync
    } else if !notice.changed_info_only_paths().is_empty() {
        ChangeType::Update
    } else {
        ChangeType::Ignored
    }
}

type ObjectsChangedFn = Arc<dyn Fn(&ObjectsChanged) + Send + Sync>;
type ContentsChangedFn = Arc<dyn Fn(&StageContentsChanged) + Send + Sync>;

/// Forwards one stage's notices to replaceable callbacks
pub struct StageNoticeListener {
    stage: StageWeak,
    keys: Vec<ListenerKey>,
    objects_changed: Arc<Mutex<Option<ObjectsChangedFn>>>,
    contents_changed: Arc<Mutex<Option<ContentsChangedFn>>>,
}

impl Default for StageNoticeListener {
    fn default() -> Self {
        Self::new()
    }
}

impl StageNoticeListener {
    pub fn new() -> Self {
        Self {
            stage: StageWeak::default(),
            keys: Vec::new(),
            objects_changed: Arc::new(Mutex::new(None)),
            contents_changed: Arc::new(Mutex::new(None)),
        }
    }

    /// Listen to `stage`, or to nothing. Any previous subscription is
    /// revoked first. Nothing fires until the next notice.
    pub fn set_stage(&mut self, stage: Option<&Stage>) {
        self.set_stage_weak(&stage.map(Stage::downgrade).unwrap_or_default());
    }

    /// Like [`set_stage`](Self::set_stage). An expired reference leaves the
    /// listener unsubscribed, which is not an error.
    pub fn set_stage_weak(&mut self, stage: &StageWeak) {
        self.revoke();
        self.stage = stage.clone();

        let Some(stage) = stage.upgrade() else {
            return;
        };

        let slot = self.objects_changed.clone();
        self.keys.push(stage.objects_changed().register(move |notice| {
            let callback = lock(&slot).clone();
            if let Some(callback) = callback {
                callback(notice);
            }
        }));

        let slot = self.contents_changed.clone();
        self.keys.push(stage.contents_changed().register(move |notice| {
            let callback = lock(&slot).clone();
            if let Some(callback) = callback {
                callback(notice);
            }
        }));
    }

    pub fn stage(&self) -> Option<Stage> {
        self.stage.upgrade()
    }

    pub fn stage_weak(&self) -> &StageWeak {
        &self.stage
    }

    /// Replace the objects-changed callback. The subscription is untouched.
    pub fn set_stage_objects_changed_callback<F>(&self, callback: F)
    where
        F: Fn(&ObjectsChanged) + Send + Sync + 'static,
    {
        *lock(&self.objects_changed) = Some(Arc::new(callback));
    }

    pub fn set_stage_contents_changed_callback<F>(&self, callback: F)
    where
        F: Fn(&StageContentsChanged) + Send + Sync + 'static,
    {
        *lock(&self.contents_changed) = Some(Arc::new(callback));
    }

    pub fn clear_callbacks(&self) {
        *lock(&self.objects_changed) = None;
        *lock(&self.contents_changed) = None;
    }

    pub fn is_subscribed(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Ids of the live subscriptions
    pub fn subscription_ids(&self) -> Vec<u64> {
        self.keys.iter().map(ListenerKey::id).collect()
    }

    /// Drop the current subscription. Safe to call repeatedly.
    pub fn revoke(&mut self) {
        for key in self.keys.drain(..) {
            key.revoke();
        }
    }
}

impl Drop for StageNoticeListener {
    fn drop(&mut self) {
        self.revoke();
    }
}

impl std::fmt::Debug for StageNoticeListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageNoticeListener")
            .field("stage", &self.stage)
            .field("subscriptions", &self.keys.len())
            .finish()
    }
}
