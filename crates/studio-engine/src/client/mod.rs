use studio_contracts::artifact::UploadedImage;
use studio_contracts::prompt::AspectRatio;

use crate::error::{ClientError, ClientResult};

mod dryrun;
mod gemini;

pub use dryrun::DryrunClient;
pub use gemini::GeminiClient;

/// Most images one edit call accepts.
pub const MAX_EDIT_IMAGES: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub base64: String,
    pub mime_type: String,
}

impl GeneratedImage {
    pub fn data_uri(&self) -> String {
        studio_contracts::artifact::image_data_uri(&self.mime_type, &self.base64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditedImage {
    pub image: GeneratedImage,
    pub caption: Option<String>,
}

/// Opaque handle of a long-running video job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoJobHandle {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoOperationStatus {
    pub done: bool,
    /// Only meaningful once `done` is set.
    pub result_locator: Option<String>,
    /// Failure text reported by the service for a finished job.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaBytes {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Adapter to the hosted generative-media service.
pub trait OperationClient: Send + Sync {
    fn name(&self) -> &str;

    /// Fails with a service error when the service returns no images.
    fn generate_images(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
        count: u32,
    ) -> ClientResult<Vec<GeneratedImage>>;

    /// Fails with a service error when the response carries no image; any
    /// caption text becomes the error detail.
    fn edit_images(&self, prompt: &str, images: &[UploadedImage]) -> ClientResult<EditedImage>;

    fn start_video_generation(
        &self,
        prompt: &str,
        image: Option<&UploadedImage>,
    ) -> ClientResult<VideoJobHandle>;

    fn poll_video_operation(&self, handle: &VideoJobHandle) -> ClientResult<VideoOperationStatus>;

    /// Downloads a finished job's media.
    fn fetch_media(&self, locator: &str) -> ClientResult<MediaBytes>;
}

pub(crate) fn check_edit_inputs(images: &[UploadedImage]) -> ClientResult<()> {
    if images.is_empty() {
        return Err(ClientError::Service(
            "edit request needs at least one image".to_string(),
        ));
    }
    if images.len() > MAX_EDIT_IMAGES {
        return Err(ClientError::Service(format!(
            "edit request accepts at most {MAX_EDIT_IMAGES} images, got {}",
            images.len()
        )));
    }
    Ok(())
}

pub(crate) fn missing_edit_image(caption: Option<&str>) -> ClientError {
    let detail = caption.map(str::trim).unwrap_or_default();
    if detail.is_empty() {
        ClientError::Service("The image could not be edited.".to_string())
    } else {
        ClientError::Service(format!("The image could not be edited. {detail}"))
    }
}
