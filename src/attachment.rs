//! Files attached to outbound messages.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MAX_IMAGE_SIZE: usize = 5 * 1024 * 1024;
pub const MAX_FILE_SIZE: usize = 20 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaCategory {
  Image,
  Video,
  Audio,
  File,
}

impl MediaCategory {
  pub fn from_mime(mime: &str) -> Self {
    let mime = mime.to_ascii_lowercase();
    if mime.starts_with("image/") {
      Self::Image
    } else if mime.starts_with("video/") {
      Self::Video
    } else if mime.starts_with("audio/") {
      Self::Audio
    } else {
      Self::File
    }
  }

  /// Largest accepted size in bytes.
  pub fn size_limit(self) -> usize {
    match self {
      Self::Image => MAX_IMAGE_SIZE,
      _ => MAX_FILE_SIZE,
    }
  }
}

/// An attachment as sent with a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
  #[serde(rename = "type")]
  pub category: MediaCategory,
  pub mime_type: String,
  /// Base64 of the raw bytes
  pub content: String,
  pub file_name: String,
}

impl Attachment {
  pub fn from_bytes(file_name: &str, mime_type: &str, bytes: &[u8]) -> Result<Self> {
    let category = MediaCategory::from_mime(mime_type);
    let limit = category.size_limit();
    if bytes.len() > limit {
      return Err(eyre!(
        "{} exceeds the {} limit ({})",
        file_name,
        format_size(limit),
        format_size(bytes.len())
      ));
    }

    Ok(Self {
      category,
      mime_type: mime_type.to_string(),
      content: STANDARD.encode(bytes),
      file_name: file_name.to_string(),
    })
  }

  /// Read a file from disk, guessing its type from the extension.
  pub async fn read(path: &Path) -> Result<Self> {
    let file_name = path
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .ok_or_else(|| eyre!("{} is not a file", path.display()))?;
    let mime = mime_guess::from_path(path).first_or_octet_stream();

    let size = tokio::fs::metadata(path)
      .await
      .map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?
      .len() as usize;
    let limit = MediaCategory::from_mime(mime.essence_str()).size_limit();
    if size > limit {
      return Err(eyre!(
        "{} exceeds the {} limit ({})",
        file_name,
        format_size(limit),
        format_size(size)
      ));
    }

    let bytes = tokio::fs::read(path)
      .await
      .map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?;
    Self::from_bytes(&file_name, mime.essence_str(), &bytes)
  }
}

/// Attachments picked for the message being composed.
#[derive(Debug, Clone, Default)]
pub struct AttachmentSession {
  attachments: Vec<Attachment>,
}

impl AttachmentSession {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, attachment: Attachment) {
    self.attachments.push(attachment);
  }

  pub fn remove(&mut self, index: usize) -> Option<Attachment> {
    (index < self.attachments.len()).then(|| self.attachments.remove(index))
  }

  pub fn clear(&mut self) {
    self.attachments.clear();
  }

  pub fn is_empty(&self) -> bool {
    self.attachments.is_empty()
  }

  pub fn len(&self) -> usize {
    self.attachments.len()
  }

  /// The list sent alongside the message text.
  pub fn to_payload(&self) -> serde_json::Value {
    serde_json::Value::Array(
      self
        .attachments
        .iter()
        .filter_map(|a| serde_json::to_value(a).ok())
        .collect(),
    )
  }
}

/// Human-readable byte count.
pub fn format_size(bytes: usize) -> String {
  const KIB: f64 = 1024.0;
  let b = bytes as f64;
  if b < KIB {
    format!("{} B", bytes)
  } else if b < KIB * KIB {
    format!("{:.1} KB", b / KIB)
  } else {
    format!("{:.1} MB", b / (KIB * KIB))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_category_from_mime() {
    assert_eq!(MediaCategory::from_mime("image/heic"), MediaCategory::Image);
    assert_eq!(MediaCategory::from_mime("video/quicktime"), MediaCategory::Video);
    assert_eq!(MediaCategory::from_mime("Audio/FLAC"), MediaCategory::Audio);
    assert_eq!(MediaCategory::from_mime("application/pdf"), MediaCategory::File);
    assert_eq!(MediaCategory::from_mime(""), MediaCategory::File);
  }

  #[test]
  fn test_size_limits() {
    let big_image = vec![0u8; MAX_IMAGE_SIZE + 1];
    assert!(Attachment::from_bytes("a.png", "image/png", &big_image).is_err());
    // The same size is fine for a non-image
    assert!(Attachment::from_bytes("a.zip", "application/zip", &big_image).is_ok());

    let too_big = vec![0u8; MAX_FILE_SIZE + 1];
    assert!(Attachment::from_bytes("a.mp4", "video/mp4", &too_big).is_err());
  }

  #[test]
  fn test_wire_format() {
    let attachment = Attachment::from_bytes("hi.txt", "text/plain", b"hi").unwrap();
    assert_eq!(
      serde_json::to_value(&attachment).unwrap(),
      json!({"type": "file", "mimeType": "text/plain", "content": "aGk=", "fileName": "hi.txt"})
    );
  }

  #[test]
  fn test_session() {
    let mut session = AttachmentSession::new();
    session.add(Attachment::from_bytes("a.png", "image/png", b"a").unwrap());
    session.add(Attachment::from_bytes("b.ogg", "audio/ogg", b"b").unwrap());

    assert!(session.remove(5).is_none());
    let removed = session.remove(0).unwrap();
    assert_eq!(removed.file_name, "a.png");

    let payload = session.to_payload();
    assert_eq!(payload.as_array().unwrap().len(), 1);
    assert_eq!(payload[0]["type"], "audio");

    session.clear();
    assert!(session.is_empty());
  }

  #[test]
  fn test_format_size() {
    assert_eq!(format_size(512), "512 B");
    assert_eq!(format_size(1536), "1.5 KB");
    assert_eq!(format_size(MAX_IMAGE_SIZE), "5.0 MB");
  }

  #[tokio::test]
  async fn test_read_guesses_type() {
    let dir = std::env::temp_dir().join(format!("relay-sw-attach-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("photo.png");
    std::fs::write(&path, b"png-bytes").unwrap();

    let attachment = Attachment::read(&path).await.unwrap();
    assert_eq!(attachment.category, MediaCategory::Image);
    assert_eq!(attachment.mime_type, "image/png");
    assert_eq!(attachment.file_name, "photo.png");

    std::fs::remove_dir_all(&dir).unwrap();
  }
}
