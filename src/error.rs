//! Error types for the proxy-stage core
//!
//! Errors only travel on the API edges (opening layers, authoring edits,
//! wiring the graph, loading config). Inside a node `compute()` they are
//! turned into a [`Status`](crate::nodes::Status) and an empty result.

use std::path::PathBuf;
use thiserror::Error;

use crate::nodes::NodeId;
use crate::usd::SdfPath;

/// Errors raised by the USD stage runtime
#[derive(Debug, Error)]
pub enum UsdError {
    #[error("Invalid path: '{0}'")]
    InvalidPath(String),

    #[error("Invalid prim name: '{0}'")]
    InvalidPrimName(String),

    #[error("Failed to open layer {path}: {message}")]
    LayerOpen { path: PathBuf, message: String },

    #[error("Layer '{0}' does not permit editing")]
    LayerNotEditable(String),

    #[error("No prim at path {0}")]
    PrimNotFound(SdfPath),

    #[error("Prim already exists at path {0}")]
    PrimExists(SdfPath),

    #[error("Layer '{0}' is not used by the stage and cannot be the edit target")]
    InvalidEditTarget(String),

    #[error("Stage has expired")]
    StageExpired,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while wiring or editing the dependency graph
#[derive(Debug, Error)]
pub enum DgError {
    #[error("Node {0} not found")]
    NodeNotFound(NodeId),

    #[error("Node {node} has no attribute '{attr}'")]
    UnknownAttribute { node: NodeId, attr: String },

    #[error("Attribute '{0}' is not writable")]
    NotWritable(String),

    #[error("Attribute '{0}' is not connectable")]
    NotConnectable(String),

    #[error("Plug {0} already has an incoming connection")]
    AlreadyConnected(String),

    #[error("No connection from {from} to {to}")]
    NotConnected { from: String, to: String },

    #[error("Cannot connect a node to itself")]
    SelfConnection,

    #[error("Node {node} is not a {expected}")]
    WrongNodeType { node: NodeId, expected: &'static str },

    #[error("Node {0} has a parent that is not a DAG node")]
    InvalidParent(NodeId),

    #[error("Re-entrant evaluation of node {0} rejected")]
    ReentrantEvaluation(NodeId),
}

/// Errors raised while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Umbrella error for the crate
#[derive(Debug, Error)]
pub enum MayaUsdError {
    #[error(transparent)]
    Usd(#[from] UsdError),

    #[error(transparent)]
    Dg(#[from] DgError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, MayaUsdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usd_error_display() {
        let err = UsdError::LayerNotEditable("anon:1234:session.usda".to_string());
        assert_eq!(
            err.to_string(),
            "Layer 'anon:1234:session.usda' does not permit editing"
        );
    }

    #[test]
    fn test_umbrella_conversion() {
        fn inner() -> std::result::Result<(), DgError> {
            Err(DgError::NodeNotFound(7))
        }

        fn outer() -> Result<()> {
            inner()?;
            Ok(())
        }

        let err = outer().unwrap_err();
        assert!(matches!(err, MayaUsdError::Dg(DgError::NodeNotFound(7))));
        assert_eq!(err.to_string(), "Node 7 not found");
    }

    #[test]
    fn test_config_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope")
            .err()
            .unwrap();
        let err: ConfigError = json_err.into();
        assert!(err.to_string().starts_with("Invalid config JSON"));
    }
}
