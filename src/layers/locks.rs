//! Locked layers
//!
//! A layer is unlocked, locked by the user, or system-locked because its
//! file cannot be written. The three states are exclusive. Locked layers are
//! held strongly so their permissions survive until the scene is reset.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::sync::lock;
use crate::usd::{LayerHandle, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LayerLock {
    #[default]
    Unlocked,
    /// Not editable, still saveable
    Locked,
    /// Neither editable nor saveable
    SystemLocked,
}

impl LayerLock {
    fn permissions(self) -> (bool, bool) {
        match self {
            LayerLock::Unlocked => (true, true),
            LayerLock::Locked => (false, true),
            LayerLock::SystemLocked => (false, false),
        }
    }
}

struct LockedLayer {
    layer: LayerHandle,
    lock: LayerLock,
    proxy_paths: Vec<String>,
}

#[derive(Default)]
pub struct LockedLayers {
    layers: Mutex<Vec<LockedLayer>>,
}

impl LockedLayers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `layer` in the `state` lock state on behalf of the proxy shape at
    /// `proxy_path`, replacing whatever state it was in
    pub fn lock_layer(&self, proxy_path: &str, layer: &LayerHandle, state: LayerLock) {
        let (edit, save) = state.permissions();
        layer.set_permission_to_edit(edit);
        layer.set_permission_to_save(save);

        let mut layers = lock(&self.layers);
        let existing = layers.iter().position(|l| Arc::ptr_eq(&l.layer, layer));
        match (state, existing) {
            (LayerLock::Unlocked, Some(index)) => {
                layers.remove(index);
            }
            (LayerLock::Unlocked, None) => {}
            (_, Some(index)) => {
                let entry = &mut layers[index];
                entry.lock = state;
                if !entry.proxy_paths.iter().any(|p| p == proxy_path) {
                    entry.proxy_paths.push(proxy_path.to_string());
                }
            }
            (_, None) => layers.push(LockedLayer {
                layer: layer.clone(),
                lock: state,
                proxy_paths: vec![proxy_path.to_string()],
            }),
        }
        log::debug!("{} is now {:?} ({})", layer.identifier(), state, proxy_path);
    }

    pub fn lock_state(&self, layer: &LayerHandle) -> LayerLock {
        lock(&self.layers)
            .iter()
            .find(|l| Arc::ptr_eq(&l.layer, layer))
            .map(|l| l.lock)
            .unwrap_or_default()
    }

    pub fn is_layer_locked(&self, layer: &LayerHandle) -> bool {
        self.lock_state(layer) == LayerLock::Locked
    }

    pub fn is_layer_system_locked(&self, layer: &LayerHandle) -> bool {
        self.lock_state(layer) == LayerLock::SystemLocked
    }

    /// Layers locked on behalf of one proxy shape
    pub fn locked_layers_for(&self, proxy_path: &str) -> Vec<(LayerHandle, LayerLock)> {
        lock(&self.layers)
            .iter()
            .filter(|l| l.proxy_paths.iter().any(|p| p == proxy_path))
            .map(|l| (l.layer.clone(), l.lock))
            .collect()
    }

    /// System-lock file layers of `stage` that cannot be written, and lift
    /// system locks from those that now can. Returns how many layers
    /// changed state.
    pub fn refresh_system_locks(&self, proxy_path: &str, stage: &Stage) -> usize {
        let mut changed = 0;
        for layer in stage.layer_stack() {
            let Some(path) = layer.real_path() else {
                continue;
            };
            let read_only = std::fs::metadata(path)
                .map(|meta| meta.permissions().readonly())
                .unwrap_or(false);
            let state = self.lock_state(&layer);
            if read_only && state != LayerLock::SystemLocked {
                self.lock_layer(proxy_path, &layer, LayerLock::SystemLocked);
                changed += 1;
            } else if !read_only && state == LayerLock::SystemLocked {
                self.lock_layer(proxy_path, &layer, LayerLock::Unlocked);
                changed += 1;
            }
        }
        changed
    }

    /// Forget every lock. Called when the scene is reset.
    pub fn clear(&self) {
        let mut layers = lock(&self.layers);
        if !layers.is_empty() {
            log::debug!("Releasing {} locked layers", layers.len());
        }
        layers.clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.layers).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.layers).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usd::Layer;

    const ALL: [LayerLock; 3] = [LayerLock::Unlocked, LayerLock::Locked, LayerLock::SystemLocked];

    #[test]
    fn test_lock_states_are_exclusive() {
        let locks = LockedLayers::new();
        let layer = Layer::new_anonymous("locks.usda");
        for first in ALL {
            for second in ALL {
                locks.lock_layer("|stage|stageShape", &layer, first);
                locks.lock_layer("|stage|stageShape", &layer, second);
                assert!(!(locks.is_layer_locked(&layer) && locks.is_layer_system_locked(&layer)));
                assert_eq!(locks.lock_state(&layer), second);
            }
        }
    }

    #[test]
    fn test_permissions_follow_state() {
        let locks = LockedLayers::new();
        let layer = Layer::new_anonymous("perm.usda");

        locks.lock_layer("|p", &layer, LayerLock::Locked);
        assert!(!layer.permission_to_edit());
        assert!(layer.permission_to_save());

        locks.lock_layer("|p", &layer, LayerLock::SystemLocked);
        assert!(!layer.permission_to_edit());
        assert!(!layer.permission_to_save());
        assert!(!locks.is_layer_locked(&layer));

        locks.lock_layer("|p", &layer, LayerLock::Unlocked);
        assert!(layer.permission_to_edit());
        assert!(layer.permission_to_save());
        assert!(locks.is_empty());
    }

    #[test]
    fn test_clear_forgets_locks() {
        let locks = LockedLayers::new();
        let a = Layer::new_anonymous("a.usda");
        let b = Layer::new_anonymous("b.usda");
        locks.lock_layer("|p", &a, LayerLock::Locked);
        locks.lock_layer("|q", &b, LayerLock::SystemLocked);
        assert_eq!(locks.locked_layers_for("|p").len(), 1);

        locks.clear();
        assert!(!locks.is_layer_locked(&a));
        assert!(!locks.is_layer_system_locked(&b));
        assert!(locks.locked_layers_for("|q").is_empty());
    }
}
