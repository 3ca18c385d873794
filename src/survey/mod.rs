//! Cached survey definitions, their sources and freshness tracking.

pub mod form_cache;
pub mod source;
pub mod types;

pub use form_cache::{FormCache, FormCacheSettings, FormEvent, Freshness, FreshnessHandle, MediaFetcher};
pub use source::{OpenRosaSource, SurveySource, TransformSource};
pub use types::{extract_model, version_hash, HashResponse, Survey};
