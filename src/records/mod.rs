//! Local record queue: finalized records, drafts, autosave and last-saved
//! snapshots.

pub mod encryption;
pub mod queue;
pub mod types;

pub use encryption::{EncryptionCapability, SubmissionKeyDetector};
pub use queue::RecordQueue;
pub use types::{auto_saved_key, is_reserved_id, last_saved_key, Attachment, Record, SaveMode};
