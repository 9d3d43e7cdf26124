use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Mutex;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use sha2::{Digest, Sha256};
use studio_contracts::artifact::UploadedImage;
use studio_contracts::prompt::AspectRatio;

use super::{
    check_edit_inputs, EditedImage, GeneratedImage, MediaBytes, OperationClient, VideoJobHandle,
    VideoOperationStatus,
};
use crate::error::{ClientError, ClientResult};

const DRYRUN_LONG_SIDE: u32 = 256;
const DRYRUN_VIDEO_SCHEME: &str = "dryrun://video/";

/// Offline client producing solid-colour PNGs keyed off the prompt, and
/// video jobs that finish after a fixed number of polls.
pub struct DryrunClient {
    polls_until_done: u32,
    polls: Mutex<HashMap<String, u32>>,
}

impl Default for DryrunClient {
    fn default() -> Self {
        Self::new(2)
    }
}

impl DryrunClient {
    pub fn new(polls_until_done: u32) -> Self {
        Self {
            polls_until_done,
            polls: Mutex::new(HashMap::new()),
        }
    }
}

impl OperationClient for DryrunClient {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate_images(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
        count: u32,
    ) -> ClientResult<Vec<GeneratedImage>> {
        let (width, height) = aspect_ratio.dimensions(DRYRUN_LONG_SIDE);
        (0..count.max(1))
            .map(|idx| {
                let color = color_from_seed(&[prompt.as_bytes(), &idx.to_be_bytes()]);
                let bytes = solid_png(width, height, color)?;
                Ok(GeneratedImage {
                    base64: BASE64.encode(bytes),
                    mime_type: "image/png".to_string(),
                })
            })
            .collect()
    }

    fn edit_images(&self, prompt: &str, images: &[UploadedImage]) -> ClientResult<EditedImage> {
        check_edit_inputs(images)?;
        let (width, height) = images
            .first()
            .and_then(|image| image::load_from_memory(&image.bytes).ok())
            .map(|decoded| (decoded.width(), decoded.height()))
            .unwrap_or((DRYRUN_LONG_SIDE, DRYRUN_LONG_SIDE));
        let mut seed: Vec<&[u8]> = vec![prompt.as_bytes()];
        seed.extend(images.iter().map(|image| image.bytes.as_slice()));
        let bytes = solid_png(width, height, color_from_seed(&seed))?;
        Ok(EditedImage {
            image: GeneratedImage {
                base64: BASE64.encode(bytes),
                mime_type: "image/png".to_string(),
            },
            caption: Some(format!("dryrun edit of {} image(s)", images.len())),
        })
    }

    fn start_video_generation(
        &self,
        prompt: &str,
        image: Option<&UploadedImage>,
    ) -> ClientResult<VideoJobHandle> {
        let mut hasher = Sha256::new();
        hasher.update(prompt.as_bytes());
        if let Some(image) = image {
            hasher.update(&image.bytes);
        }
        hasher.update(chrono::Utc::now().timestamp_millis().to_be_bytes());
        let name = format!("operations/dryrun-{}", hex::encode(&hasher.finalize()[..6]));
        self.lock_polls()?.insert(name.clone(), 0);
        Ok(VideoJobHandle { name })
    }

    fn poll_video_operation(&self, handle: &VideoJobHandle) -> ClientResult<VideoOperationStatus> {
        let mut polls = self.lock_polls()?;
        let Some(count) = polls.get_mut(&handle.name) else {
            return Err(ClientError::Service(format!(
                "unknown video operation: {}",
                handle.name
            )));
        };
        *count += 1;
        if *count < self.polls_until_done {
            return Ok(VideoOperationStatus::default());
        }
        polls.remove(&handle.name);
        Ok(VideoOperationStatus {
            done: true,
            result_locator: Some(format!("{DRYRUN_VIDEO_SCHEME}{}", handle.name)),
            error: None,
        })
    }

    fn fetch_media(&self, locator: &str) -> ClientResult<MediaBytes> {
        let Some(name) = locator.strip_prefix(DRYRUN_VIDEO_SCHEME) else {
            return Err(ClientError::Transport(anyhow::anyhow!(
                "dryrun cannot download {locator}"
            )));
        };
        let mut bytes = b"\x00\x00\x00\x18ftypmp42".to_vec();
        bytes.extend_from_slice(name.as_bytes());
        Ok(MediaBytes {
            bytes,
            mime_type: "video/mp4".to_string(),
        })
    }
}

impl DryrunClient {
    fn lock_polls(&self) -> ClientResult<std::sync::MutexGuard<'_, HashMap<String, u32>>> {
        self.polls
            .lock()
            .map_err(|_| ClientError::Transport(anyhow::anyhow!("dryrun poll table poisoned")))
    }
}

fn color_from_seed(parts: &[&[u8]]) -> [u8; 3] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    [digest[0], digest[1], digest[2]]
}

fn solid_png(width: u32, height: u32, color: [u8; 3]) -> anyhow::Result<Vec<u8>> {
    let mut image = RgbImage::new(width.max(1), height.max(1));
    for pixel in image.pixels_mut() {
        *pixel = Rgb(color);
    }
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .context("dryrun png encode failed")?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_images_follow_aspect_ratio() -> anyhow::Result<()> {
        let client = DryrunClient::default();
        let images = client.generate_images("a cat", AspectRatio::Landscape, 3)?;
        assert_eq!(images.len(), 3);
        let decoded = image::load_from_memory(&BASE64.decode(&images[0].base64)?)?;
        assert_eq!(
            (decoded.width(), decoded.height()),
            AspectRatio::Landscape.dimensions(DRYRUN_LONG_SIDE)
        );
        assert_ne!(images[0], images[1]);
        Ok(())
    }

    #[test]
    fn edits_keep_input_dimensions() -> anyhow::Result<()> {
        let client = DryrunClient::default();
        let input = UploadedImage::from_bytes(solid_png(40, 30, [1, 2, 3])?, "image/png");
        let edited = client.edit_images("make it red", &[input])?;
        let decoded = image::load_from_memory(&BASE64.decode(&edited.image.base64)?)?;
        assert_eq!((decoded.width(), decoded.height()), (40, 30));
        assert!(client.edit_images("x", &[]).is_err());
        Ok(())
    }

    #[test]
    fn video_jobs_finish_after_configured_polls() -> anyhow::Result<()> {
        let client = DryrunClient::new(3);
        let handle = client.start_video_generation("waves", None)?;
        assert!(!client.poll_video_operation(&handle)?.done);
        assert!(!client.poll_video_operation(&handle)?.done);
        let finished = client.poll_video_operation(&handle)?;
        assert!(finished.done);

        let locator = finished.result_locator.unwrap_or_default();
        let media = client.fetch_media(&locator)?;
        assert_eq!(media.mime_type, "video/mp4");
        assert!(client.poll_video_operation(&handle).is_err());
        Ok(())
    }
}
