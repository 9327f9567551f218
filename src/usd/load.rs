//! Population masks and payload load rules

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::usd::path::SdfPath;

/// Which payloads are loaded when a stage is first opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InitialLoadSet {
    #[default]
    LoadAll,
    LoadNone,
}

/// Restricts which prims a stage populates. An empty mask populates
/// everything; otherwise a prim is populated if it is an ancestor or a
/// descendant of some mask path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PopulationMask {
    paths: Vec<SdfPath>,
}

impl PopulationMask {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(paths: impl IntoIterator<Item = SdfPath>) -> Self {
        let mut mask = Self::default();
        for path in paths {
            mask.add(path);
        }
        mask
    }

    /// Add a path. Paths already covered by a shallower entry are dropped.
    pub fn add(&mut self, path: SdfPath) {
        if self.paths.iter().any(|p| path.has_prefix(p)) {
            return;
        }
        self.paths.retain(|p| !p.has_prefix(&path));
        self.paths.push(path);
        self.paths.sort();
    }

    pub fn is_all(&self) -> bool {
        self.paths.is_empty() || self.paths.iter().any(SdfPath::is_absolute_root)
    }

    pub fn paths(&self) -> &[SdfPath] {
        &self.paths
    }

    pub fn includes(&self, path: &SdfPath) -> bool {
        self.is_all()
            || self
                .paths
                .iter()
                .any(|p| path.has_prefix(p) || p.has_prefix(path))
    }
}

/// Per-prim load/unload decisions layered over the initial load set. The
/// deepest rule on a path wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadRules {
    initial: InitialLoadSet,
    rules: BTreeMap<SdfPath, bool>,
}

impl LoadRules {
    pub fn new(initial: InitialLoadSet) -> Self {
        Self {
            initial,
            rules: BTreeMap::new(),
        }
    }

    pub fn initial(&self) -> InitialLoadSet {
        self.initial
    }

    pub fn load(&mut self, path: SdfPath) {
        self.rules.retain(|p, _| !p.has_prefix(&path));
        self.rules.insert(path, true);
    }

    pub fn unload(&mut self, path: SdfPath) {
        self.rules.retain(|p, _| !p.has_prefix(&path));
        self.rules.insert(path, false);
    }

    pub fn is_loaded(&self, path: &SdfPath) -> bool {
        self.rules
            .iter()
            .filter(|(rule_path, _)| path.has_prefix(rule_path))
            .max_by_key(|(rule_path, _)| rule_path.element_count())
            .map(|(_, loaded)| *loaded)
            .unwrap_or(self.initial == InitialLoadSet::LoadAll)
    }
}
