//! Intercepting resource cache for offline use.
//!
//! This module provides a host-agnostic caching layer that:
//! - Precaches versioned static assets on install and drops old versions on activate
//! - Serves the application shell offline once all of its sub-resources are cached
//! - Keeps per-survey payloads and media in a shared `forms` partition
//! - Answers `CHECK_FORM_HASH` messages from pages

mod layer;
mod routes;
mod shell;
mod storage;
mod traits;
mod upstream;
mod worker;

pub use layer::ResourceCache;
pub use routes::{
  sentinel_key, static_partition, PartitionRule, ResourceKind, ResourceRoutes, FORMS_PARTITION,
  PARTITION_RULES,
};
pub use shell::sub_resources;
pub use storage::CacheStorage;
pub use traits::{
  ActivateReport, CacheMessage, CacheReply, CacheSource, CachedEntry, CachedResponse, HashStatus,
  InstallReport, InterceptLayer, InterceptRequest, Intercepted, Upstream,
};
pub use upstream::HttpUpstream;
pub use worker::{spawn, CacheHandle};
