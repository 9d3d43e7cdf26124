use studio_contracts::artifact::UploadedImage;
use studio_contracts::history::HistoryEngine;
use studio_contracts::prompt::{
    merge_negative_suggestion, ArtisticStyle, AspectRatio, CreateFunction, EditFunction, Mode,
    PromptFunction, PromptRequest,
};
use studio_contracts::selection::PendingSelection;

use crate::client::GeneratedImage;
use crate::error::{ActionError, ActionResult};
use crate::poller::{CancellationToken, VideoOperationPoller};

pub const MIN_IMAGE_COUNT: u32 = 1;
pub const MAX_IMAGE_COUNT: u32 = 4;

/// Everything one editing session owns.
///
/// Inputs and settings are public. The timeline, pending selections, video
/// job and reset epoch change only through the orchestrator's actions:
///
/// ```compile_fail
/// let mut session = studio_engine::SessionState::new();
/// session.epoch = 0;
/// ```
///
/// ```compile_fail
/// let mut session = studio_engine::SessionState::new();
/// session.history.clear();
/// ```
#[derive(Debug, Clone)]
pub struct SessionState {
    pub prompt: String,
    pub negative_prompt: String,
    pub mode: Mode,
    pub create_function: CreateFunction,
    pub edit_function: EditFunction,
    pub style: ArtisticStyle,
    pub aspect_ratio: AspectRatio,
    pub image_count: u32,
    pub compose_realistic: bool,
    pub primary_image: Option<UploadedImage>,
    pub secondary_image: Option<UploadedImage>,
    pub(crate) history: HistoryEngine,
    pub(crate) generated: PendingSelection<GeneratedImage>,
    pub(crate) variations: PendingSelection<GeneratedImage>,
    pub(crate) video: VideoOperationPoller,
    pub(crate) last_error: Option<String>,
    /// Bumped on every reset; results started under an older epoch are dropped.
    pub(crate) epoch: u64,
    pub(crate) video_token: Option<CancellationToken>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            mode: Mode::Create,
            create_function: CreateFunction::Free,
            edit_function: EditFunction::AddRemove,
            style: ArtisticStyle::None,
            aspect_ratio: AspectRatio::Square,
            image_count: MIN_IMAGE_COUNT,
            compose_realistic: false,
            primary_image: None,
            secondary_image: None,
            history: HistoryEngine::new(),
            generated: PendingSelection::default(),
            variations: PendingSelection::default(),
            video: VideoOperationPoller::new(),
            last_error: None,
            epoch: 0,
            video_token: None,
        }
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> &HistoryEngine {
        &self.history
    }

    pub fn generated(&self) -> &PendingSelection<GeneratedImage> {
        &self.generated
    }

    pub fn variations(&self) -> &PendingSelection<GeneratedImage> {
        &self.variations
    }

    pub fn video(&self) -> &VideoOperationPoller {
        &self.video
    }

    /// Message of the most recent failed action, cleared by the next commit.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The prompt function implied by the current mode and function choices.
    pub fn prompt_function(&self) -> PromptFunction {
        match self.mode {
            Mode::Create => PromptFunction::Create(self.create_function),
            Mode::Edit => PromptFunction::Edit(self.edit_function),
            Mode::Video => PromptFunction::Video,
        }
    }

    pub fn action_label(&self) -> String {
        self.prompt_function()
            .action_label(self.style, self.compose_realistic)
    }

    pub fn prompt_request(&self) -> PromptRequest<'_> {
        PromptRequest {
            raw_prompt: &self.prompt,
            function: self.prompt_function(),
            has_reference_image: self.primary_image.is_some(),
            style: self.style,
            compose_realistic: self.compose_realistic,
            negative_prompt: &self.negative_prompt,
        }
    }

    pub fn set_image_count(&mut self, count: u32) {
        self.image_count = count.clamp(MIN_IMAGE_COUNT, MAX_IMAGE_COUNT);
    }

    pub fn stage_primary(&mut self, image: UploadedImage) {
        self.primary_image = Some(image);
    }

    pub fn stage_secondary(&mut self, image: UploadedImage) {
        self.secondary_image = Some(image);
    }

    pub fn unstage(&mut self) {
        self.primary_image = None;
        self.secondary_image = None;
    }

    pub fn append_negative_suggestion(&mut self, suggestion: &str) {
        self.negative_prompt = merge_negative_suggestion(&self.negative_prompt, suggestion);
    }

    /// Applies one named setting from its textual form.
    pub fn apply_setting(&mut self, key: &str, raw: &str) -> ActionResult<()> {
        let value = raw.trim();
        match key {
            "mode" => self.mode = parse_or_invalid(Mode::parse(value), key, value)?,
            "create_function" => {
                self.create_function = parse_or_invalid(CreateFunction::parse(value), key, value)?
            }
            "edit_function" => {
                self.edit_function = parse_or_invalid(EditFunction::parse(value), key, value)?
            }
            "style" => self.style = parse_or_invalid(ArtisticStyle::parse(value), key, value)?,
            "aspect_ratio" => {
                self.aspect_ratio = parse_or_invalid(AspectRatio::parse(value), key, value)?
            }
            "image_count" => {
                let count = value.parse::<u32>().ok();
                self.set_image_count(parse_or_invalid(count, key, value)?);
            }
            "compose_realistic" => {
                let flag = match value.to_ascii_lowercase().as_str() {
                    "on" | "true" | "yes" | "1" => Some(true),
                    "off" | "false" | "no" | "0" => Some(false),
                    "" => Some(!self.compose_realistic),
                    _ => None,
                };
                self.compose_realistic = parse_or_invalid(flag, key, value)?;
            }
            "negative_prompt" => self.negative_prompt = value.to_string(),
            "prompt" => self.prompt = value.to_string(),
            _ => {
                return Err(ActionError::validation(format!("unknown setting: {key}")));
            }
        }
        Ok(())
    }

    /// Clears prompt, inputs, selections and history, and invalidates
    /// in-flight work. The caller cancels the video token it returns.
    pub(crate) fn reset(&mut self) -> Option<CancellationToken> {
        self.prompt.clear();
        self.negative_prompt.clear();
        self.unstage();
        self.history.clear();
        self.generated.dismiss();
        self.variations.dismiss();
        self.video.cancel();
        self.last_error = None;
        self.epoch += 1;
        self.video_token.take()
    }

    /// Starts editing `image` from an empty timeline.
    pub(crate) fn begin_edit_of(&mut self, image: UploadedImage, prompt: Option<String>) {
        self.primary_image = Some(image);
        self.secondary_image = None;
        self.prompt = prompt.unwrap_or_default();
        self.mode = Mode::Edit;
        self.edit_function = EditFunction::AddRemove;
        self.last_error = None;
    }
}

fn parse_or_invalid<T>(parsed: Option<T>, key: &str, raw: &str) -> ActionResult<T> {
    parsed.ok_or_else(|| ActionError::validation(format!("invalid {key}: {raw}")))
}
