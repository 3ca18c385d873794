//! Queue synchronization with origin servers.

pub mod uploader;

pub use uploader::{Submitter, SyncUploader, UploadFailure, UploadHandle, UploadReport};
