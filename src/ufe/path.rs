//! Two-segment scene-item paths: a DAG path to the proxy shape followed
//! by a prim path inside its stage
//!
//! Text form is `|stage1|stageShape1,/World/cube`. A path with only the
//! DAG segment names the proxy shape itself.

use std::fmt;
use std::str::FromStr;

use crate::error::UsdError;
use crate::usd::SdfPath;

const SEGMENT_SEPARATOR: char = ',';

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UfePath {
    dag_path: String,
    prim_path: SdfPath,
}

impl UfePath {
    pub fn new(dag_path: impl Into<String>, prim_path: SdfPath) -> Self {
        Self {
            dag_path: dag_path.into(),
            prim_path,
        }
    }

    /// Path of the proxy shape node alone
    pub fn proxy(dag_path: impl Into<String>) -> Self {
        Self::new(dag_path, SdfPath::empty())
    }

    pub fn dag_path(&self) -> &str {
        &self.dag_path
    }

    pub fn prim_path(&self) -> &SdfPath {
        &self.prim_path
    }

    pub fn has_prim_segment(&self) -> bool {
        !self.prim_path.is_empty()
    }

    /// Same proxy, different prim
    pub fn with_prim(&self, prim_path: SdfPath) -> Self {
        Self::new(self.dag_path.clone(), prim_path)
    }

    /// True if `self` is `prefix` or lies below it
    pub fn starts_with(&self, prefix: &UfePath) -> bool {
        if self.dag_path != prefix.dag_path {
            return false;
        }
        !prefix.has_prim_segment() || self.prim_path.has_prefix(&prefix.prim_path)
    }
}

impl fmt::Display for UfePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_prim_segment() {
            write!(f, "{}{}{}", self.dag_path, SEGMENT_SEPARATOR, self.prim_path.as_str())
        } else {
            f.write_str(&self.dag_path)
        }
    }
}

impl FromStr for UfePath {
    type Err = UsdError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let (dag_path, prim_path) = match text.split_once(SEGMENT_SEPARATOR) {
            Some((dag, prim)) => (dag, SdfPath::new(prim)?),
            None => (text, SdfPath::empty()),
        };
        if !dag_path.starts_with('|') {
            return Err(UsdError::InvalidPath(text.to_string()));
        }
        Ok(Self::new(dag_path, prim_path))
    }
}
