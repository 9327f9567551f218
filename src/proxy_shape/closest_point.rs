//! Closest-point delegate
//!
//! Proxy shapes do not intersect rays with USD geometry themselves. A
//! renderer registers a delegate once; until then every query misses and
//! no shape can be made live.

use std::sync::{Arc, RwLock};

use glam::DVec3;

use crate::proxy_shape::base::ProxyShape;
use crate::sync::{read, write};

/// Where a ray hit a shape
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClosestPointHit {
    pub point: DVec3,
    pub normal: DVec3,
}

pub trait ClosestPointDelegate: Send + Sync {
    fn closest_point(
        &self,
        shape: &ProxyShape<'_>,
        ray_source: DVec3,
        ray_direction: DVec3,
    ) -> Option<ClosestPointHit>;
}

impl<F> ClosestPointDelegate for F
where
    F: Fn(&ProxyShape<'_>, DVec3, DVec3) -> Option<ClosestPointHit> + Send + Sync,
{
    fn closest_point(
        &self,
        shape: &ProxyShape<'_>,
        ray_source: DVec3,
        ray_direction: DVec3,
    ) -> Option<ClosestPointHit> {
        self(shape, ray_source, ray_direction)
    }
}

/// Holds the one registered delegate
#[derive(Default)]
pub struct ClosestPointRegistry {
    delegate: RwLock<Option<Arc<dyn ClosestPointDelegate>>>,
}

impl ClosestPointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or clear the delegate. Replaces any earlier one.
    pub fn set_delegate(&self, delegate: Option<Arc<dyn ClosestPointDelegate>>) {
        *write(&self.delegate) = delegate;
    }

    pub fn delegate(&self) -> Option<Arc<dyn ClosestPointDelegate>> {
        read(&self.delegate).clone()
    }

    pub fn is_set(&self) -> bool {
        read(&self.delegate).is_some()
    }
}

/// Intersects rays with the shape's cached bounding box
#[derive(Debug, Clone, Copy, Default)]
pub struct BoundsIntersector;

impl ClosestPointDelegate for BoundsIntersector {
    fn closest_point(
        &self,
        shape: &ProxyShape<'_>,
        ray_source: DVec3,
        ray_direction: DVec3,
    ) -> Option<ClosestPointHit> {
        let bounds = shape.bounding_box();
        if bounds.is_empty() || ray_direction.length_squared() == 0.0 {
            return None;
        }

        // Slab test, remembering which face the ray entered through
        let mut t_near = f64::NEG_INFINITY;
        let mut t_far = f64::INFINITY;
        let mut normal = DVec3::ZERO;
        for axis in 0..3 {
            let origin = ray_source[axis];
            let direction = ray_direction[axis];
            if direction.abs() < f64::EPSILON {
                if origin < bounds.min[axis] || origin > bounds.max[axis] {
                    return None;
                }
                continue;
            }
            let t1 = (bounds.min[axis] - origin) / direction;
            let t2 = (bounds.max[axis] - origin) / direction;
            let (t_enter, t_exit) = if t1 < t2 { (t1, t2) } else { (t2, t1) };
            if t_enter > t_near {
                t_near = t_enter;
                normal = DVec3::ZERO;
                normal[axis] = -direction.signum();
            }
            t_far = t_far.min(t_exit);
            if t_near > t_far {
                return None;
            }
        }
        if t_far < 0.0 {
            return None;
        }
        let t = t_near.max(0.0);
        Some(ClosestPointHit {
            point: ray_source + ray_direction * t,
            normal,
        })
    }
}
