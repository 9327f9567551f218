//! Axis-aligned bounds and imageable purposes

use glam::{DAffine3, DVec3};
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in double precision. The empty box has
/// `min > max` on every axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: DVec3,
    pub max: DVec3,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::empty()
    }
}

impl BoundingBox {
    pub fn empty() -> Self {
        Self {
            min: DVec3::splat(f64::INFINITY),
            max: DVec3::splat(f64::NEG_INFINITY),
        }
    }

    pub fn new(a: DVec3, b: DVec3) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    pub fn extend(&mut self, point: DVec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Bounds of this box's eight corners after `xform`
    pub fn transformed(&self, xform: &DAffine3) -> BoundingBox {
        if self.is_empty() {
            return *self;
        }
        let mut result = BoundingBox::empty();
        for i in 0..8 {
            let corner = DVec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            );
            result.extend(xform.transform_point3(corner));
        }
        result
    }

    pub fn center(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> DVec3 {
        if self.is_empty() {
            DVec3::ZERO
        } else {
            self.max - self.min
        }
    }
}

/// Imageable purpose of a prim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Purpose {
    #[default]
    Default,
    Render,
    Proxy,
    Guide,
}

impl Purpose {
    pub fn from_token(token: &str) -> Self {
        match token {
            "render" => Purpose::Render,
            "proxy" => Purpose::Proxy,
            "guide" => Purpose::Guide,
            _ => Purpose::Default,
        }
    }

    pub fn as_token(&self) -> &'static str {
        match self {
            Purpose::Default => "default",
            Purpose::Render => "render",
            Purpose::Proxy => "proxy",
            Purpose::Guide => "guide",
        }
    }
}

/// Which non-default purposes are drawn. Default-purpose prims always are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PurposeToggles {
    pub render: bool,
    pub proxy: bool,
    pub guide: bool,
}

impl Default for PurposeToggles {
    fn default() -> Self {
        Self {
            render: false,
            proxy: true,
            guide: false,
        }
    }
}

impl PurposeToggles {
    pub fn all() -> Self {
        Self {
            render: true,
            proxy: true,
            guide: true,
        }
    }

    pub fn includes(&self, purpose: Purpose) -> bool {
        match purpose {
            Purpose::Default => true,
            Purpose::Render => self.render,
            Purpose::Proxy => self.proxy,
            Purpose::Guide => self.guide,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_union() {
        let a = BoundingBox::empty();
        let b = BoundingBox::new(DVec3::ZERO, DVec3::ONE);
        assert!(a.is_empty());
        assert_eq!(a.union(&b), b);
        assert_eq!(b.union(&a), b);
        assert_eq!(a.size(), DVec3::ZERO);
    }

    #[test]
    fn test_transformed() {
        let b = BoundingBox::new(DVec3::splat(-1.0), DVec3::splat(1.0));
        let moved = b.transformed(&DAffine3::from_translation(DVec3::new(5.0, 0.0, 0.0)));
        assert_eq!(moved.min, DVec3::new(4.0, -1.0, -1.0));
        assert_eq!(moved.max, DVec3::new(6.0, 1.0, 1.0));
        assert_eq!(moved.center(), DVec3::new(5.0, 0.0, 0.0));
    }

    #[test]
    fn test_purpose_toggles() {
        let toggles = PurposeToggles::default();
        assert!(toggles.includes(Purpose::Default));
        assert!(toggles.includes(Purpose::Proxy));
        assert!(!toggles.includes(Purpose::Render));
        assert!(!toggles.includes(Purpose::Guide));
        assert_eq!(Purpose::from_token("guide"), Purpose::Guide);
        assert_eq!(Purpose::from_token("bogus"), Purpose::Default);
    }
}
