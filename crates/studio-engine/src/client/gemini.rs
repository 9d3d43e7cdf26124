use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use studio_contracts::artifact::UploadedImage;
use studio_contracts::prompt::AspectRatio;
use tracing::{debug, warn};

use super::{
    check_edit_inputs, missing_edit_image, EditedImage, GeneratedImage, MediaBytes,
    OperationClient, VideoJobHandle, VideoOperationStatus,
};
use crate::config::EngineConfig;
use crate::error::{truncate_text, ClientError, ClientResult};

/// Blocking client for the Gemini REST surface: Imagen for fresh images,
/// Gemini image models for edits, Veo long-running jobs for video.
pub struct GeminiClient {
    config: EngineConfig,
    http: HttpClient,
}

impl GeminiClient {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            http: HttpClient::new(),
        }
    }

    fn api_key(&self) -> ClientResult<&str> {
        self.config
            .api_key
            .as_deref()
            .ok_or_else(|| ClientError::Transport(anyhow::anyhow!(
                "GEMINI_API_KEY, GOOGLE_API_KEY or API_KEY not set"
            )))
    }

    fn model_endpoint(&self, model: &str, method: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:{}", self.config.api_base, model_path, method)
    }

    fn post_with_transport_retries(
        &self,
        endpoint: &str,
        api_key: &str,
        payload: &Value,
    ) -> Result<HttpResponse> {
        let max_retries = self.config.transport_retries;
        let mut attempt = 0usize;
        loop {
            let response = self
                .http
                .post(endpoint)
                .query(&[("key", api_key)])
                .timeout(self.config.request_timeout())
                .json(payload)
                .send();

            match response {
                Ok(ok) => return Ok(ok),
                Err(raw) => {
                    let err = anyhow::Error::new(raw)
                        .context(format!("Gemini request failed ({endpoint})"));
                    if !is_retryable_transport_error(&err) || attempt >= max_retries {
                        return Err(err);
                    }
                    attempt += 1;
                    warn!(
                        endpoint,
                        attempt, max_retries, "transient transport failure, retrying"
                    );
                    let delay_s = self.config.retry_backoff_s * attempt as f64;
                    thread::sleep(Duration::from_secs_f64(delay_s));
                }
            }
        }
    }

    fn post_json(&self, endpoint: &str, payload: &Value) -> ClientResult<Value> {
        let api_key = self.api_key()?;
        debug!(endpoint, "posting request");
        let response = self.post_with_transport_retries(endpoint, api_key, payload)?;
        Ok(response_json_or_error("Gemini", response)?)
    }
}

impl OperationClient for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate_images(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
        count: u32,
    ) -> ClientResult<Vec<GeneratedImage>> {
        let endpoint = self.model_endpoint(&self.config.image_model, "predict");
        let payload = json!({
            "instances": [{ "prompt": prompt }],
            "parameters": {
                "sampleCount": count.max(1),
                "aspectRatio": aspect_ratio.as_str(),
                "outputMimeType": "image/png",
            },
        });
        let response = self.post_json(&endpoint, &payload)?;
        let images = extract_predictions(&response);
        if images.is_empty() {
            return Err(ClientError::Service(
                "The image could not be generated.".to_string(),
            ));
        }
        Ok(images)
    }

    fn edit_images(&self, prompt: &str, images: &[UploadedImage]) -> ClientResult<EditedImage> {
        check_edit_inputs(images)?;
        let endpoint = self.model_endpoint(&self.config.edit_model, "generateContent");
        let mut parts: Vec<Value> = images
            .iter()
            .map(|image| {
                json!({
                    "inlineData": {
                        "mimeType": image.mime_type,
                        "data": image.base64,
                    }
                })
            })
            .collect();
        parts.push(json!({ "text": prompt }));
        let payload = json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": {
                "responseModalities": ["IMAGE", "TEXT"],
            },
        });
        let response = self.post_json(&endpoint, &payload)?;
        let (image, caption) = extract_first_candidate(&response);
        match image {
            Some(image) => Ok(EditedImage { image, caption }),
            None => Err(missing_edit_image(caption.as_deref())),
        }
    }

    fn start_video_generation(
        &self,
        prompt: &str,
        image: Option<&UploadedImage>,
    ) -> ClientResult<VideoJobHandle> {
        let endpoint = self.model_endpoint(&self.config.video_model, "predictLongRunning");
        let mut instance = json!({ "prompt": prompt });
        if let (Some(image), Some(obj)) = (image, instance.as_object_mut()) {
            obj.insert(
                "image".to_string(),
                json!({
                    "bytesBase64Encoded": image.base64,
                    "mimeType": image.mime_type,
                }),
            );
        }
        let payload = json!({
            "instances": [instance],
            "parameters": { "sampleCount": 1 },
        });
        let response = self.post_json(&endpoint, &payload)?;
        let name = response
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                ClientError::Service("video job was not accepted: missing operation name".to_string())
            })?;
        Ok(VideoJobHandle {
            name: name.to_string(),
        })
    }

    fn poll_video_operation(&self, handle: &VideoJobHandle) -> ClientResult<VideoOperationStatus> {
        let api_key = self.api_key()?;
        let url = format!(
            "{}/{}",
            self.config.api_base,
            handle.name.trim_start_matches('/')
        );
        let response = self
            .http
            .get(&url)
            .query(&[("key", api_key)])
            .timeout(self.config.request_timeout())
            .send()
            .with_context(|| format!("video status request failed ({url})"))?;
        let payload = response_json_or_error("Gemini operation", response)?;
        Ok(parse_operation_status(&payload))
    }

    fn fetch_media(&self, locator: &str) -> ClientResult<MediaBytes> {
        let api_key = self.api_key()?;
        let response = self
            .http
            .get(locator)
            .query(&[("key", api_key)])
            .timeout(self.config.request_timeout())
            .send()
            .context("video download failed")?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Transport(anyhow::anyhow!(
                "video download failed: {status}"
            )));
        }
        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "video/mp4".to_string());
        let bytes = response
            .bytes()
            .context("video download body read failed")?
            .to_vec();
        Ok(MediaBytes { bytes, mime_type })
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn is_retryable_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| reqwest_err.is_timeout() || reqwest_err.is_connect())
            .unwrap_or(false)
    })
}

fn extract_predictions(response: &Value) -> Vec<GeneratedImage> {
    response
        .get("predictions")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let encoded = row
                        .get("bytesBase64Encoded")
                        .or_else(|| row.get("bytes_base64_encoded"))
                        .and_then(Value::as_str)
                        .filter(|value| !value.is_empty())?;
                    let mime_type = row
                        .get("mimeType")
                        .or_else(|| row.get("mime_type"))
                        .and_then(Value::as_str)
                        .unwrap_or("image/png");
                    Some(GeneratedImage {
                        base64: encoded.to_string(),
                        mime_type: mime_type.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// First inline image and first text part of the first candidate.
fn extract_first_candidate(response: &Value) -> (Option<GeneratedImage>, Option<String>) {
    let parts = response
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut image = None;
    let mut caption = None;
    for part in parts {
        if image.is_none() {
            let inline = part.get("inlineData").or_else(|| part.get("inline_data"));
            if let Some(data) = inline
                .and_then(|inline| inline.get("data"))
                .and_then(Value::as_str)
                .filter(|value| !value.is_empty())
            {
                let mime_type = inline
                    .and_then(|inline| inline.get("mimeType").or_else(|| inline.get("mime_type")))
                    .and_then(Value::as_str)
                    .unwrap_or("image/png");
                image = Some(GeneratedImage {
                    base64: data.to_string(),
                    mime_type: mime_type.to_string(),
                });
                continue;
            }
        }
        if caption.is_none() {
            caption = part
                .get("text")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string);
        }
    }
    (image, caption)
}

fn parse_operation_status(payload: &Value) -> VideoOperationStatus {
    let done = payload.get("done").and_then(Value::as_bool).unwrap_or(false);
    let response = payload.get("response");
    let result_locator = response
        .and_then(|response| {
            response
                .pointer("/generateVideoResponse/generatedSamples/0/video/uri")
                .or_else(|| response.pointer("/generatedVideos/0/video/uri"))
        })
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    let error = payload
        .get("error")
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string);
    VideoOperationStatus {
        done,
        result_locator,
        error,
    }
}
