//! Seam for the external encryption capability.

use crate::error::{Error, Result};
use crate::survey::Survey;

use super::types::Record;

/// Transforms finalized records of encryption-enabled surveys.
pub trait EncryptionCapability: Send + Sync {
  fn is_encryption_enabled(&self, survey: &Survey) -> bool;

  /// Replace the record's content with its ciphertext form.
  fn encrypt(&self, survey: &Survey, record: Record) -> Result<Record>;
}

/// Detects encryption from the form's submission public key.
///
/// It has no key material of its own, so encrypting always fails. Plug in a
/// real capability to accept finalized records of encrypted forms.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmissionKeyDetector;

impl EncryptionCapability for SubmissionKeyDetector {
  fn is_encryption_enabled(&self, survey: &Survey) -> bool {
    survey.form.contains("base64RsaPublicKey")
  }

  fn encrypt(&self, survey: &Survey, _record: Record) -> Result<Record> {
    Err(Error::EncryptionUnavailable(survey.survey_id.clone()))
  }
}
