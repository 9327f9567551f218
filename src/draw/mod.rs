//! Batch-renderer side of the proxy shapes

pub mod shape_adapters;

pub use shape_adapters::ShapeAdapterRegistry;
