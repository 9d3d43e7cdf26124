use std::env;
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_IMAGE_MODEL: &str = "imagen-4.0-generate-001";
pub const DEFAULT_EDIT_MODEL: &str = "gemini-2.5-flash-image-preview";
pub const DEFAULT_VIDEO_MODEL: &str = "veo-2.0-generate-001";

/// Runtime settings for the hosted media service and the video poller.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub image_model: String,
    pub edit_model: String,
    pub video_model: String,
    pub request_timeout_s: f64,
    pub transport_retries: usize,
    pub retry_backoff_s: f64,
    pub video_poll_interval_s: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            edit_model: DEFAULT_EDIT_MODEL.to_string(),
            video_model: DEFAULT_VIDEO_MODEL.to_string(),
            request_timeout_s: 90.0,
            transport_retries: 2,
            retry_backoff_s: 1.2,
            video_poll_interval_s: 10.0,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(non_empty_env)
    }

    /// Resolves every setting through `lookup`, which returns trimmed,
    /// non-empty values only.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            api_key: lookup("GEMINI_API_KEY")
                .or_else(|| lookup("GOOGLE_API_KEY"))
                .or_else(|| lookup("API_KEY")),
            api_base: lookup("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or(defaults.api_base),
            image_model: lookup("STUDIO_IMAGE_MODEL").unwrap_or(defaults.image_model),
            edit_model: lookup("STUDIO_EDIT_MODEL").unwrap_or(defaults.edit_model),
            video_model: lookup("STUDIO_VIDEO_MODEL").unwrap_or(defaults.video_model),
            request_timeout_s: env_f64(&lookup, "STUDIO_REQUEST_TIMEOUT", 90.0, 5.0, 600.0),
            transport_retries: env_f64(&lookup, "STUDIO_TRANSPORT_RETRIES", 2.0, 0.0, 4.0).round()
                as usize,
            retry_backoff_s: env_f64(&lookup, "STUDIO_RETRY_BACKOFF", 1.2, 0.1, 10.0),
            video_poll_interval_s: env_f64(&lookup, "STUDIO_VIDEO_POLL_INTERVAL", 10.0, 0.0, 120.0),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_s)
    }

    pub fn video_poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.video_poll_interval_s)
    }
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_f64<F>(lookup: &F, key: &str, default: f64, min: f64, max: f64) -> f64
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
        .clamp(min, max)
}
