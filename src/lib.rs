//! Offline-first form caching, record queueing and OpenRosa synchronization.
//!
//! Components, leaves first:
//! - [`openrosa::ProtocolClient`] speaks the OpenRosa discovery, download and
//!   submission dialect
//! - [`db::Store`] persists surveys, records and cached responses in SQLite
//! - [`survey::FormCache`] keeps versioned survey definitions and media fresh
//! - [`records::RecordQueue`] saves records, autosaves and last-saved snapshots
//! - [`sync::SyncUploader`] drains the queue to the server
//! - [`cache::ResourceCache`] intercepts requests to keep the application
//!   usable offline

pub mod cache;
pub mod db;
pub mod error;
pub mod openrosa;
pub mod records;
pub mod survey;
pub mod sync;

pub use error::{Error, Result};
