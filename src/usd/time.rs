//! Time codes

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A time at which to sample attribute values. The distinguished
/// [`TimeCode::DEFAULT`] samples the non-animated default value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeCode(f64);

impl TimeCode {
    /// The "default" time (not a frame)
    pub const DEFAULT: TimeCode = TimeCode(f64::NAN);

    pub fn new(value: f64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    pub fn is_default(&self) -> bool {
        self.0.is_nan()
    }
}

impl Default for TimeCode {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<f64> for TimeCode {
    fn from(value: f64) -> Self {
        Self(value)
    }
}

// DEFAULT sorts before every numeric time and equals itself.
impl PartialEq for TimeCode {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TimeCode {}

impl PartialOrd for TimeCode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeCode {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.is_default(), other.is_default()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self.0.total_cmp(&other.0),
        }
    }
}

impl Hash for TimeCode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        if self.is_default() {
            u64::MAX.hash(state);
        } else {
            // 0.0 and -0.0 compare unequal under total_cmp, so hash bits directly
            self.0.to_bits().hash(state);
        }
    }
}

impl fmt::Display for TimeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() {
            f.write_str("DEFAULT")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_equality_and_order() {
        assert_eq!(TimeCode::DEFAULT, TimeCode::default());
        assert!(TimeCode::DEFAULT < TimeCode::new(-1000.0));
        assert!(TimeCode::new(1.0) < TimeCode::new(2.0));
    }

    #[test]
    fn test_hash_map_key() {
        let mut map = HashMap::new();
        map.insert(TimeCode::DEFAULT, "default");
        map.insert(TimeCode::new(24.0), "frame");
        assert_eq!(map.get(&TimeCode::default()), Some(&"default"));
        assert_eq!(map.get(&TimeCode::new(24.0)), Some(&"frame"));
    }
}
