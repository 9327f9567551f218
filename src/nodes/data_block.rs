//! Plug values handed to a node during compute

use std::collections::{BTreeMap, BTreeSet};

use crate::nodes::attribute::PlugData;
use crate::nodes::node::NodeId;
use crate::usd::TimeCode;

/// Snapshot of a node's plug values. Inputs have already been pulled from
/// upstream; outputs written here are stored back and marked clean.
#[derive(Debug)]
pub struct DataBlock {
    node: NodeId,
    values: BTreeMap<String, PlugData>,
    dirty: BTreeSet<String>,
    written: BTreeSet<String>,
    cleaned: BTreeSet<String>,
}

static NONE: PlugData = PlugData::None;

impl DataBlock {
    pub(crate) fn new(node: NodeId, values: BTreeMap<String, PlugData>) -> Self {
        Self {
            node,
            values,
            dirty: BTreeSet::new(),
            written: BTreeSet::new(),
            cleaned: BTreeSet::new(),
        }
    }

    pub(crate) fn with_dirty(mut self, dirty: BTreeSet<String>) -> Self {
        self.dirty = dirty;
        self
    }

    /// True if `name` was dirty when compute started and nothing in this
    /// compute has written it yet
    pub fn is_dirty(&self, name: &str) -> bool {
        self.dirty.contains(name) && !self.cleaned.contains(name)
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn input_value(&self, name: &str) -> &PlugData {
        self.values.get(name).unwrap_or(&NONE)
    }

    pub fn input_bool(&self, name: &str) -> bool {
        self.input_value(name).as_bool().unwrap_or(false)
    }

    pub fn input_int(&self, name: &str) -> i64 {
        self.input_value(name).as_int().unwrap_or(0)
    }

    pub fn input_str(&self, name: &str) -> &str {
        self.input_value(name).as_str().unwrap_or("")
    }

    pub fn input_string_array(&self, name: &str) -> &[String] {
        self.input_value(name).as_string_array().unwrap_or(&[])
    }

    pub fn input_time(&self, name: &str) -> TimeCode {
        self.input_value(name).as_time().unwrap_or_default()
    }

    /// Write an output value; it is stored back clean
    pub fn set_output(&mut self, name: &str, value: impl Into<PlugData>) {
        self.values.insert(name.to_string(), value.into());
        self.written.insert(name.to_string());
        self.cleaned.insert(name.to_string());
    }

    pub fn set_clean(&mut self, name: &str) {
        self.cleaned.insert(name.to_string());
    }

    pub(crate) fn into_results(self) -> (Vec<(String, PlugData)>, BTreeSet<String>) {
        let Self {
            mut values,
            written,
            cleaned,
            ..
        } = self;
        let written = written
            .into_iter()
            .filter_map(|name| values.remove(&name).map(|value| (name, value)))
            .collect();
        (written, cleaned)
    }
}
