//! OpenRosa protocol client: form discovery, download, manifests and submission.

pub mod api_types;
pub mod auth;
pub mod client;
pub mod profile;
pub mod submission;
pub mod types;

pub use client::{ClientSettings, ProtocolClient};
pub use profile::{CustomParam, ServerProfile, ServerProfiles};
pub use types::{Credentials, FormDescriptor, FormInfo, ManifestEntry, MediaPayload, SubmissionAck};
