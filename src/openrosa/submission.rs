//! Splitting a record into submission batches.
//!
//! Every batch carries the instance XML. Attachments are packed greedily in
//! record order so that no batch exceeds the server's accepted size. All but
//! the last batch are flagged incomplete so the server waits for the rest.

use crate::error::{Error, Result};
use crate::records::{Attachment, Record};

/// Multipart field name of the instance XML.
pub const XML_PART: &str = "xml_submission_file";
/// Multipart field flagging a partial submission.
pub const INCOMPLETE_PART: &str = "*isIncomplete*";

/// One POST worth of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<'a> {
  pub files: Vec<&'a Attachment>,
  pub incomplete: bool,
}

/// Split a record into batches no larger than `max_size` bytes.
///
/// `None` means the server does not enforce a limit and everything goes in
/// one batch.
pub fn split_into_batches(record: &Record, max_size: Option<u64>) -> Result<Vec<Batch<'_>>> {
  let Some(max) = max_size else {
    return Ok(vec![Batch {
      files: record.files.iter().collect(),
      incomplete: false,
    }]);
  };

  let xml_size = record.xml.len() as u64;
  if xml_size > max {
    return Err(Error::TooLarge {
      name: XML_PART.to_string(),
      size: xml_size,
      max,
    });
  }
  let budget = max - xml_size;

  let mut batches: Vec<Vec<&Attachment>> = vec![Vec::new()];
  let mut used = 0u64;

  for file in &record.files {
    let size = file.size();
    if size > budget {
      return Err(Error::TooLarge {
        name: file.name.clone(),
        size,
        max,
      });
    }
    if used + size > budget {
      batches.push(Vec::new());
      used = 0;
    }
    used += size;
    if let Some(current) = batches.last_mut() {
      current.push(file);
    }
  }

  let count = batches.len();
  Ok(
    batches
      .into_iter()
      .enumerate()
      .map(|(i, files)| Batch {
        files,
        incomplete: i + 1 < count,
      })
      .collect(),
  )
}
