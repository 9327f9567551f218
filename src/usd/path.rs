//! Scene description paths
//!
//! Only absolute paths are supported: prim paths (`/World/cube`) and
//! prim-property paths (`/World/cube.xformOp:translate`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::UsdError;

/// An absolute prim or prim-property path. The empty path is the invalid
/// sentinel, as in USD.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SdfPath(String);

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_property_name(s: &str) -> bool {
    !s.is_empty() && s.split(':').all(is_identifier)
}

impl SdfPath {
    /// The pseudo-root path `/`
    pub fn absolute_root() -> Self {
        Self("/".to_string())
    }

    /// The empty (invalid) path
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// Parse a path string
    pub fn new(text: &str) -> Result<Self, UsdError> {
        if text.is_empty() {
            return Ok(Self::empty());
        }
        if text == "/" {
            return Ok(Self::absolute_root());
        }
        if !text.starts_with('/') {
            return Err(UsdError::InvalidPath(text.to_string()));
        }

        let (prim_part, property) = match text.split_once('.') {
            Some((prim, prop)) => (prim, Some(prop)),
            None => (text, None),
        };

        if prim_part == "/" && property.is_some() {
            return Err(UsdError::InvalidPath(text.to_string()));
        }
        if !prim_part[1..].split('/').all(is_identifier) {
            return Err(UsdError::InvalidPath(text.to_string()));
        }
        if let Some(prop) = property {
            if !is_property_name(prop) {
                return Err(UsdError::InvalidPath(text.to_string()));
            }
        }

        Ok(Self(text.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_absolute_root(&self) -> bool {
        self.0 == "/"
    }

    pub fn is_property_path(&self) -> bool {
        self.0.contains('.')
    }

    pub fn is_prim_path(&self) -> bool {
        !self.is_empty() && !self.is_property_path()
    }

    /// Last element name: the prim name, or the property name for property
    /// paths. Empty for the root and the empty path.
    pub fn name(&self) -> &str {
        if let Some(prop) = self.property_name() {
            return prop;
        }
        if self.is_empty() || self.is_absolute_root() {
            return "";
        }
        self.0.rsplit('/').next().unwrap_or("")
    }

    /// Property name of a property path
    pub fn property_name(&self) -> Option<&str> {
        self.0.split_once('.').map(|(_, prop)| prop)
    }

    /// Owning prim path; a prim path is returned unchanged
    pub fn prim_path(&self) -> SdfPath {
        match self.0.split_once('.') {
            Some((prim, _)) => Self(prim.to_string()),
            None => self.clone(),
        }
    }

    /// Parent path. The parent of a property path is its prim; the parent of
    /// the root is the empty path.
    pub fn parent(&self) -> SdfPath {
        if self.is_property_path() {
            return self.prim_path();
        }
        if self.is_empty() || self.is_absolute_root() {
            return Self::empty();
        }
        match self.0.rfind('/') {
            Some(0) => Self::absolute_root(),
            Some(idx) => Self(self.0[..idx].to_string()),
            None => Self::empty(),
        }
    }

    /// Append a child prim name
    pub fn append_child(&self, name: &str) -> Result<SdfPath, UsdError> {
        if !self.is_prim_path() || !is_identifier(name) {
            return Err(UsdError::InvalidPrimName(name.to_string()));
        }
        if self.is_absolute_root() {
            Ok(Self(format!("/{}", name)))
        } else {
            Ok(Self(format!("{}/{}", self.0, name)))
        }
    }

    /// Append a property name
    pub fn append_property(&self, name: &str) -> Result<SdfPath, UsdError> {
        if !self.is_prim_path() || self.is_absolute_root() || !is_property_name(name) {
            return Err(UsdError::InvalidPath(format!("{}.{}", self.0, name)));
        }
        Ok(Self(format!("{}.{}", self.0, name)))
    }

    /// True if `prefix` equals this path or is one of its ancestors
    pub fn has_prefix(&self, prefix: &SdfPath) -> bool {
        if prefix.is_empty() || self.is_empty() {
            return false;
        }
        if prefix.is_absolute_root() || self == prefix {
            return true;
        }
        self.0.len() > prefix.0.len()
            && self.0.starts_with(&prefix.0)
            && matches!(self.0.as_bytes()[prefix.0.len()], b'/' | b'.')
    }

    /// Replace `old` with `new` if `old` is a prefix of this path
    pub fn replace_prefix(&self, old: &SdfPath, new: &SdfPath) -> Option<SdfPath> {
        if !self.has_prefix(old) {
            return None;
        }
        if self == old {
            return Some(new.clone());
        }
        // Suffix starts with the separator ('/' or '.')
        let suffix = if old.is_absolute_root() {
            &self.0[..]
        } else {
            &self.0[old.0.len()..]
        };
        if new.is_absolute_root() {
            if suffix.starts_with('.') {
                return None;
            }
            Some(Self(suffix.to_string()))
        } else {
            Some(Self(format!("{}{}", new.0, suffix)))
        }
    }

    /// Number of prim elements (`/` has 0, `/a/b` has 2)
    pub fn element_count(&self) -> usize {
        let prim = self.prim_path();
        if prim.is_empty() || prim.is_absolute_root() {
            0
        } else {
            prim.0[1..].split('/').count()
        }
    }

    /// Prim-path prefixes from the top-most ancestor down to this prim path
    pub fn prefixes(&self) -> Vec<SdfPath> {
        let prim = self.prim_path();
        let mut result = Vec::new();
        let mut current = prim;
        while !current.is_empty() && !current.is_absolute_root() {
            result.push(current.clone());
            current = current.parent();
        }
        result.reverse();
        result
    }
}

impl fmt::Display for SdfPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SdfPath {
    type Err = UsdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for SdfPath {
    type Error = UsdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<SdfPath> for String {
    fn from(path: SdfPath) -> Self {
        path.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> SdfPath {
        SdfPath::new(s).unwrap()
    }

    #[test]
    fn test_parse_valid_paths() {
        assert!(p("/").is_absolute_root());
        assert!(p("/World/cube").is_prim_path());
        assert!(p("/World/cube.xformOp:translate").is_property_path());
        assert!(p("").is_empty());
    }

    #[test]
    fn test_parse_invalid_paths() {
        assert!(SdfPath::new("World").is_err());
        assert!(SdfPath::new("/World//cube").is_err());
        assert!(SdfPath::new("/1cube").is_err());
        assert!(SdfPath::new("/.size").is_err());
        assert!(SdfPath::new("/cube.").is_err());
    }

    #[test]
    fn test_name_and_parent() {
        let path = p("/World/cube");
        assert_eq!(path.name(), "cube");
        assert_eq!(path.parent(), p("/World"));
        assert_eq!(p("/World").parent(), SdfPath::absolute_root());
        assert!(SdfPath::absolute_root().parent().is_empty());

        let prop = p("/World/cube.size");
        assert_eq!(prop.name(), "size");
        assert_eq!(prop.parent(), path);
        assert_eq!(prop.prim_path(), path);
    }

    #[test]
    fn test_append() {
        let root = SdfPath::absolute_root();
        let world = root.append_child("World").unwrap();
        assert_eq!(world.as_str(), "/World");
        assert_eq!(world.append_child("cube").unwrap().as_str(), "/World/cube");
        assert_eq!(
            world.append_property("visibility").unwrap().as_str(),
            "/World.visibility"
        );
        assert!(world.append_child("bad name").is_err());
        assert!(root.append_property("size").is_err());
    }

    #[test]
    fn test_has_prefix() {
        let cube = p("/World/cube");
        assert!(cube.has_prefix(&p("/World")));
        assert!(cube.has_prefix(&SdfPath::absolute_root()));
        assert!(cube.has_prefix(&cube));
        assert!(!p("/World/cubes").has_prefix(&cube));
        assert!(p("/World/cube.size").has_prefix(&cube));
        assert!(!cube.has_prefix(&SdfPath::empty()));
    }

    #[test]
    fn test_replace_prefix() {
        let cube = p("/World/cube/mesh");
        assert_eq!(
            cube.replace_prefix(&p("/World/cube"), &p("/World/box")),
            Some(p("/World/box/mesh"))
        );
        assert_eq!(
            p("/World/cube.size").replace_prefix(&p("/World/cube"), &p("/box")),
            Some(p("/box.size"))
        );
        assert_eq!(cube.replace_prefix(&p("/Other"), &p("/box")), None);
    }

    #[test]
    fn test_prefixes_and_counts() {
        let path = p("/a/b/c.attr");
        assert_eq!(path.element_count(), 3);
        assert_eq!(path.prefixes(), vec![p("/a"), p("/a/b"), p("/a/b/c")]);
        assert!(SdfPath::absolute_root().prefixes().is_empty());
    }

    #[test]
    fn test_serde_roundtrip_rejects_invalid() {
        let json = serde_json::to_string(&p("/World/cube")).unwrap();
        assert_eq!(json, "\"/World/cube\"");
        assert!(serde_json::from_str::<SdfPath>("\"nope\"").is_err());
    }
}
