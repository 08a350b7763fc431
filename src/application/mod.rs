//! Application services: the cache-or-render pipeline.

pub mod error;
pub mod render;
pub mod snapshot;
