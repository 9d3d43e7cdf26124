use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Image,
    Video,
}

impl MediaType {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
        }
    }
}

/// One produced image or video.
///
/// Artifacts are values: an "edited" image is always a new artifact, the
/// previous one stays untouched in history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub url: String,
    pub caption: Option<String>,
    pub action_label: String,
    pub media_type: MediaType,
}

impl Artifact {
    pub fn image(
        url: impl Into<String>,
        caption: Option<String>,
        action_label: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            caption,
            action_label: action_label.into(),
            media_type: MediaType::Image,
        }
    }

    pub fn video(
        url: impl Into<String>,
        caption: Option<String>,
        action_label: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            caption,
            action_label: action_label.into(),
            media_type: MediaType::Video,
        }
    }

    pub fn is_image(&self) -> bool {
        self.media_type == MediaType::Image
    }
}

/// An input image staged for an edit call, or an artifact round-tripped
/// into the same shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedImage {
    pub bytes: Vec<u8>,
    pub base64: String,
    pub mime_type: String,
}

impl UploadedImage {
    pub fn from_bytes(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        let base64 = BASE64.encode(&bytes);
        Self {
            bytes,
            base64,
            mime_type: mime_type.into(),
        }
    }

    pub fn from_base64(encoded: &str, mime_type: impl Into<String>) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded.trim().as_bytes())
            .context("image base64 decode failed")?;
        Ok(Self {
            bytes,
            base64: encoded.trim().to_string(),
            mime_type: mime_type.into(),
        })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        let mime = mime_for_path(path).unwrap_or("image/png");
        Ok(Self::from_bytes(bytes, mime))
    }

    /// Decodes an artifact locator: an image data URI or a filesystem path.
    pub fn from_locator(locator: &str) -> Result<Self> {
        let trimmed = locator.trim();
        if trimmed.starts_with("data:") {
            let Some((mime, payload)) = parse_image_data_uri(trimmed) else {
                bail!("unsupported data URI; expected data:image/<type>;base64,<payload>");
            };
            return Self::from_base64(payload, mime);
        }
        let path = Path::new(trimmed);
        if mime_for_path(path).is_none() {
            bail!("locator is not an image: {trimmed}");
        }
        Self::from_path(path)
    }

    pub fn to_data_uri(&self) -> String {
        image_data_uri(&self.mime_type, &self.base64)
    }
}

pub fn image_data_uri(mime_type: &str, base64: &str) -> String {
    format!("data:{mime_type};base64,{base64}")
}

/// Splits `data:image/<subtype>;base64,<payload>` into mime and payload.
pub fn parse_image_data_uri(locator: &str) -> Option<(&str, &str)> {
    let rest = locator.strip_prefix("data:")?;
    let (mime, payload) = rest.split_once(";base64,")?;
    let subtype = mime.strip_prefix("image/")?;
    if subtype.is_empty() || !subtype.chars().all(|ch| ch.is_ascii_lowercase()) {
        return None;
    }
    Some((mime, payload))
}

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

pub fn extension_for_mime(mime_type: &str) -> &'static str {
    let lowered = mime_type.trim().to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        return "jpg";
    }
    if lowered.contains("webp") {
        return "webp";
    }
    if lowered.contains("gif") {
        return "gif";
    }
    if lowered.contains("mp4") {
        return "mp4";
    }
    if lowered.contains("webm") {
        return "webm";
    }
    if lowered.contains("quicktime") {
        return "mov";
    }
    "png"
}
