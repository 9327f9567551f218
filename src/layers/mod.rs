//! Layer locking

pub mod locks;

pub use locks::{LayerLock, LockedLayers};
