//! Study metadata backed by MADO manifests: the parser, the TTL cache and the
//! query operations serving C-FIND and C-MOVE.

pub mod cache;
pub mod manifest;
pub mod model;
pub mod service;

pub use cache::{MetadataCache, MetadataError};
pub use model::{InstanceMetadata, SeriesMetadata, StudyMetadata};
pub use service::{InstanceKeys, MetadataService, SeriesKeys, StudyKeys};
