//! Attribute definitions and plug values

use std::collections::BTreeSet;

use crate::usd::{SdfPath, Stage, TimeCode};

/// Stage handle carried on a plug: the stage plus the prim the node
/// treats as its root
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageData {
    pub stage: Option<Stage>,
    pub prim_path: SdfPath,
}

impl StageData {
    pub fn new(stage: Stage, prim_path: SdfPath) -> Self {
        Self {
            stage: Some(stage),
            prim_path,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.stage.is_some()
    }
}

/// A value held by a plug
#[derive(Debug, Clone, Default, PartialEq)]
pub enum PlugData {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    StringArray(Vec<String>),
    Time(TimeCode),
    Stage(StageData),
}

impl PlugData {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PlugData::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PlugData::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PlugData::Double(d) => Some(*d),
            PlugData::Int(i) => Some(*i as f64),
            PlugData::Time(t) => Some(t.value()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PlugData::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_string_array(&self) -> Option<&[String]> {
        match self {
            PlugData::StringArray(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<TimeCode> {
        match self {
            PlugData::Time(t) => Some(*t),
            PlugData::Double(d) => Some(TimeCode::new(*d)),
            _ => None,
        }
    }

    pub fn as_stage_data(&self) -> Option<&StageData> {
        match self {
            PlugData::Stage(data) => Some(data),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, PlugData::None)
    }
}

impl From<bool> for PlugData {
    fn from(value: bool) -> Self {
        PlugData::Bool(value)
    }
}

impl From<i64> for PlugData {
    fn from(value: i64) -> Self {
        PlugData::Int(value)
    }
}

impl From<f64> for PlugData {
    fn from(value: f64) -> Self {
        PlugData::Double(value)
    }
}

impl From<&str> for PlugData {
    fn from(value: &str) -> Self {
        PlugData::String(value.to_string())
    }
}

impl From<String> for PlugData {
    fn from(value: String) -> Self {
        PlugData::String(value)
    }
}

impl From<TimeCode> for PlugData {
    fn from(value: TimeCode) -> Self {
        PlugData::Time(value)
    }
}

impl From<StageData> for PlugData {
    fn from(value: StageData) -> Self {
        PlugData::Stage(value)
    }
}

/// Whether the graph sets an attribute or the node computes it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    Input,
    Output,
}

/// One attribute of a node class
#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub kind: AttributeKind,
    pub default: PlugData,
    pub writable: bool,
    pub storable: bool,
    pub connectable: bool,
    pub internal: bool,
}

impl Attribute {
    pub fn input(name: impl Into<String>, default: impl Into<PlugData>) -> Self {
        Self {
            name: name.into(),
            kind: AttributeKind::Input,
            default: default.into(),
            writable: true,
            storable: true,
            connectable: true,
            internal: false,
        }
    }

    pub fn output(name: impl Into<String>, default: impl Into<PlugData>) -> Self {
        Self {
            name: name.into(),
            kind: AttributeKind::Output,
            default: default.into(),
            writable: false,
            storable: false,
            connectable: true,
            internal: false,
        }
    }

    pub fn storable(mut self, storable: bool) -> Self {
        self.storable = storable;
        self
    }

    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    pub fn connectable(mut self, connectable: bool) -> Self {
        self.connectable = connectable;
        self
    }

    /// Internal attributes are hidden from the user but still take part
    /// in dirty propagation
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn is_computed(&self) -> bool {
        self.kind == AttributeKind::Output
    }
}

/// Dependency node or DAG node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Dependency,
    Dag,
}

/// Static description of a node type: its attributes and the
/// `attribute_affects` edges between them. Edges are not transitive; every
/// input must name every output it feeds.
#[derive(Debug, Clone)]
pub struct NodeClass {
    type_name: String,
    kind: NodeKind,
    type_hierarchy: Vec<String>,
    attributes: Vec<Attribute>,
    affects: Vec<(String, String)>,
}

impl NodeClass {
    pub fn new(type_name: impl Into<String>, kind: NodeKind) -> Self {
        let type_name = type_name.into();
        Self {
            type_hierarchy: vec![type_name.clone()],
            type_name,
            kind,
            attributes: Vec::new(),
            affects: Vec::new(),
        }
    }

    /// A derived type inheriting every attribute and edge of `base`
    pub fn derive_from(base: &NodeClass, type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        let mut type_hierarchy = vec![type_name.clone()];
        type_hierarchy.extend(base.type_hierarchy.iter().cloned());
        Self {
            type_name,
            kind: base.kind,
            type_hierarchy,
            attributes: base.attributes.clone(),
            affects: base.affects.clone(),
        }
    }

    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.add_attribute(attribute);
        self
    }

    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.retain(|a| a.name != attribute.name);
        self.attributes.push(attribute);
    }

    pub fn attribute_affects(mut self, from: &str, to: &str) -> Self {
        let edge = (from.to_string(), to.to_string());
        if !self.affects.contains(&edge) {
            self.affects.push(edge);
        }
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// This type followed by its ancestors
    pub fn type_hierarchy(&self) -> &[String] {
        &self.type_hierarchy
    }

    /// Type filters as used by node-added callbacks: `"dependNode"` matches
    /// every node, `"dagNode"` every DAG node.
    pub fn is_type(&self, filter: &str) -> bool {
        match filter {
            "dependNode" => true,
            "dagNode" => self.kind == NodeKind::Dag,
            _ => self.type_hierarchy.iter().any(|t| t == filter),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attribute(name).is_some()
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Attributes directly affected by `name`
    pub fn affected_by(&self, name: &str) -> Vec<&str> {
        self.affects
            .iter()
            .filter(|(from, _)| from == name)
            .map(|(_, to)| to.as_str())
            .collect()
    }

    /// Attributes that directly affect `name`
    pub fn affecting(&self, name: &str) -> BTreeSet<&str> {
        self.affects
            .iter()
            .filter(|(_, to)| to == name)
            .map(|(from, _)| from.as_str())
            .collect()
    }
}
