//! Prompt templates and human-readable action labels.
//!
//! Everything here is pure: no state, no I/O.

use serde::{Deserialize, Serialize};

pub const UPSCALE_INSTRUCTION: &str = "Upscale this image to a higher resolution. Enhance details, sharpness, and overall quality without altering the artistic style or subject matter.";

pub const VARIATION_INSTRUCTION: &str = "Generate a subtle variation of this image. Keep the same theme, style and overall composition, but introduce small creative differences.";

const REFERENCE_IMAGE_CONTEXT: &str = " based on the style and subject of the provided image";

const COMPOSE_REALISM_SUFFIX: &str = " The final image should be ultra-realistic, photorealistic, 8k, sharp focus, with high detail and cinematic lighting.";

pub const CROP_LABEL: &str = "Crop";
pub const UPSCALE_LABEL: &str = "Upscale";
pub const VARIATION_LABEL: &str = "Variation";

pub const PROMPT_SUGGESTIONS: &[&str] = &[
    "A majestic lion wearing a crown of stars, photorealistic, cinematic lighting",
    "An enchanted forest at night with glowing mushrooms and mystical creatures, fantasy art",
    "A retro-futuristic city with flying cars and neon signs, cyberpunk style",
    "A watercolor painting of a quiet cafe on a rainy day in Paris",
    "A cute red panda wearing a tiny wizard hat, digital illustration",
    "A surreal landscape where clouds are cotton candy and rivers run with chocolate",
    "A detailed vector logo of a wolf howling at the moon, minimalist design",
    "A steampunk mechanical owl with glowing amber eyes",
    "A 3D render of a delicious-looking cheeseburger, food photography, high detail",
    "An astronaut floating peacefully in space looking at Earth, Milky Way behind, hyperrealistic",
    "A chibi-style illustration of a smiling avocado",
    "An isometric view of a cozy, messy artist studio",
    "A stained glass window depicting a cosmic supernova",
    "A synthwave sunset over a digital ocean",
];

pub const NEGATIVE_PROMPT_SUGGESTIONS: &[&str] = &[
    "text, signature, watermark",
    "deformed hands, extra fingers",
    "ugly, disfigured, morbid",
    "low quality, blurry, grainy",
    "drawing, cartoon, 3d",
    "frame, border",
    "bad anatomy, extra limbs",
    "oversaturated colors",
    "cropped head, out of frame",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Create,
    Edit,
    Video,
}

impl Mode {
    pub fn parse(raw: &str) -> Option<Self> {
        match normalize_key(raw).as_str() {
            "create" | "generate" => Some(Mode::Create),
            "edit" => Some(Mode::Edit),
            "video" => Some(Mode::Video),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Create => "create",
            Mode::Edit => "edit",
            Mode::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateFunction {
    #[default]
    Free,
    Sticker,
    Logo,
    Comic,
    Photorealistic,
}

impl CreateFunction {
    pub const ALL: [CreateFunction; 5] = [
        CreateFunction::Free,
        CreateFunction::Sticker,
        CreateFunction::Logo,
        CreateFunction::Comic,
        CreateFunction::Photorealistic,
    ];

    pub fn parse(raw: &str) -> Option<Self> {
        match normalize_key(raw).as_str() {
            "free" => Some(CreateFunction::Free),
            "sticker" => Some(CreateFunction::Sticker),
            "logo" | "text" => Some(CreateFunction::Logo),
            "comic" => Some(CreateFunction::Comic),
            "photorealistic" | "photo" | "realistic" => Some(CreateFunction::Photorealistic),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CreateFunction::Free => "free",
            CreateFunction::Sticker => "sticker",
            CreateFunction::Logo => "logo",
            CreateFunction::Comic => "comic",
            CreateFunction::Photorealistic => "photorealistic",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CreateFunction::Free => "Create",
            CreateFunction::Sticker => "Sticker",
            CreateFunction::Logo => "Logo",
            CreateFunction::Comic => "Comic",
            CreateFunction::Photorealistic => "Photorealistic",
        }
    }

    pub fn template(self, prompt: &str, has_reference_image: bool) -> String {
        let ctx = if has_reference_image {
            REFERENCE_IMAGE_CONTEXT
        } else {
            ""
        };
        match self {
            CreateFunction::Sticker => format!(
                "a die-cut sticker of {prompt}{ctx}, vibrant colors, white background, sticker style, sharp details"
            ),
            CreateFunction::Logo if has_reference_image => format!(
                "a clean, modern typographic logo for \"{prompt}\", incorporating elements or the style from the provided image, vector art, minimalist, on a plain background"
            ),
            CreateFunction::Logo => format!(
                "a clean, modern typographic logo for \"{prompt}\", vector art, minimalist, on a plain background"
            ),
            CreateFunction::Comic => format!(
                "a comic book panel illustration of {prompt}{ctx}, dynamic action, bold lines, vibrant colors, pop art style, halftone dots"
            ),
            CreateFunction::Photorealistic => format!(
                "award-winning hyperrealistic photograph of {prompt}{ctx}, captured with a DSLR camera, lens 85mm f/1.8, cinematic lighting, tack-sharp focus, incredibly high detail, skin pores visible, photorealistic, insane realism, as if it were a real photo"
            ),
            CreateFunction::Free if has_reference_image => format!(
                "Generate a new image inspired by the following prompt and reference image: \"{prompt}\""
            ),
            CreateFunction::Free => prompt.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditFunction {
    #[default]
    AddRemove,
    Retouch,
    Style,
    Compose,
    Upscale,
}

impl EditFunction {
    pub const ALL: [EditFunction; 5] = [
        EditFunction::AddRemove,
        EditFunction::Retouch,
        EditFunction::Style,
        EditFunction::Compose,
        EditFunction::Upscale,
    ];

    pub fn parse(raw: &str) -> Option<Self> {
        match normalize_key(raw).as_str() {
            "add_remove" | "add" | "remove" => Some(EditFunction::AddRemove),
            "retouch" => Some(EditFunction::Retouch),
            "style" => Some(EditFunction::Style),
            "compose" | "merge" => Some(EditFunction::Compose),
            "upscale" => Some(EditFunction::Upscale),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EditFunction::AddRemove => "add_remove",
            EditFunction::Retouch => "retouch",
            EditFunction::Style => "style",
            EditFunction::Compose => "compose",
            EditFunction::Upscale => "upscale",
        }
    }

    /// Number of staged images the function consumes.
    pub fn required_images(self) -> usize {
        if self == EditFunction::Compose {
            2
        } else {
            1
        }
    }

    pub fn needs_prompt(self) -> bool {
        self != EditFunction::Upscale
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ArtisticStyle {
    #[default]
    None,
    Vintage,
    Cyberpunk,
    Impressionist,
    PopArt,
    Steampunk,
}

impl ArtisticStyle {
    pub const ALL: [ArtisticStyle; 6] = [
        ArtisticStyle::None,
        ArtisticStyle::Vintage,
        ArtisticStyle::Cyberpunk,
        ArtisticStyle::Impressionist,
        ArtisticStyle::PopArt,
        ArtisticStyle::Steampunk,
    ];

    pub fn parse(raw: &str) -> Option<Self> {
        match normalize_key(raw).as_str() {
            "none" | "" => Some(ArtisticStyle::None),
            "vintage" => Some(ArtisticStyle::Vintage),
            "cyberpunk" => Some(ArtisticStyle::Cyberpunk),
            "impressionist" => Some(ArtisticStyle::Impressionist),
            "pop_art" | "popart" => Some(ArtisticStyle::PopArt),
            "steampunk" => Some(ArtisticStyle::Steampunk),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ArtisticStyle::None => "None",
            ArtisticStyle::Vintage => "Vintage",
            ArtisticStyle::Cyberpunk => "Cyberpunk",
            ArtisticStyle::Impressionist => "Impressionist",
            ArtisticStyle::PopArt => "Pop Art",
            ArtisticStyle::Steampunk => "Steampunk",
        }
    }

    pub fn is_none(self) -> bool {
        self == ArtisticStyle::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisualFilter {
    Grayscale,
    Sepia,
    Invert,
}

impl VisualFilter {
    pub const ALL: [VisualFilter; 3] = [
        VisualFilter::Grayscale,
        VisualFilter::Sepia,
        VisualFilter::Invert,
    ];

    pub fn parse(raw: &str) -> Option<Self> {
        match normalize_key(raw).as_str() {
            "grayscale" | "greyscale" | "gray" | "grey" => Some(VisualFilter::Grayscale),
            "sepia" => Some(VisualFilter::Sepia),
            "invert" => Some(VisualFilter::Invert),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            VisualFilter::Grayscale => "Grayscale",
            VisualFilter::Sepia => "Sepia",
            VisualFilter::Invert => "Invert",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "16:9")]
    Landscape,
    #[serde(rename = "9:16")]
    Portrait,
    #[serde(rename = "4:3")]
    Classic,
    #[serde(rename = "3:4")]
    ClassicPortrait,
}

impl AspectRatio {
    pub const ALL: [AspectRatio; 5] = [
        AspectRatio::Square,
        AspectRatio::Landscape,
        AspectRatio::Portrait,
        AspectRatio::Classic,
        AspectRatio::ClassicPortrait,
    ];

    pub fn parse(raw: &str) -> Option<Self> {
        let value = raw.trim().replace(['/', 'x'], ":");
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == value)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Landscape => "16:9",
            AspectRatio::Portrait => "9:16",
            AspectRatio::Classic => "4:3",
            AspectRatio::ClassicPortrait => "3:4",
        }
    }

    /// Pixel dimensions with the long side at `long_side`.
    pub fn dimensions(self, long_side: u32) -> (u32, u32) {
        let (w, h) = match self {
            AspectRatio::Square => (1, 1),
            AspectRatio::Landscape => (16, 9),
            AspectRatio::Portrait => (9, 16),
            AspectRatio::Classic => (4, 3),
            AspectRatio::ClassicPortrait => (3, 4),
        };
        let longest = w.max(h);
        ((long_side * w / longest).max(1), (long_side * h / longest).max(1))
    }
}

/// What the user asked the service to do with the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptFunction {
    Create(CreateFunction),
    Edit(EditFunction),
    Video,
}

impl PromptFunction {
    pub fn action_label(self, style: ArtisticStyle, compose_realistic: bool) -> String {
        match self {
            PromptFunction::Create(function) => function.label().to_string(),
            PromptFunction::Edit(EditFunction::AddRemove) => "Add/Remove".to_string(),
            PromptFunction::Edit(EditFunction::Retouch) => "Retouch".to_string(),
            PromptFunction::Edit(EditFunction::Style) => "Stylize".to_string(),
            PromptFunction::Edit(EditFunction::Compose) if compose_realistic => {
                "Compose (Realistic)".to_string()
            }
            PromptFunction::Edit(EditFunction::Compose) => "Compose".to_string(),
            PromptFunction::Edit(EditFunction::Upscale) => UPSCALE_LABEL.to_string(),
            PromptFunction::Video if style.is_none() => "Video".to_string(),
            PromptFunction::Video => format!("Video ({})", style.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest<'a> {
    pub raw_prompt: &'a str,
    pub function: PromptFunction,
    pub has_reference_image: bool,
    pub style: ArtisticStyle,
    pub compose_realistic: bool,
    pub negative_prompt: &'a str,
}

impl<'a> PromptRequest<'a> {
    pub fn new(raw_prompt: &'a str, function: PromptFunction) -> Self {
        Self {
            raw_prompt,
            function,
            has_reference_image: false,
            style: ArtisticStyle::None,
            compose_realistic: false,
            negative_prompt: "",
        }
    }
}

/// Builds the final prompt sent to the service.
///
/// The negative-prompt clause always comes last; upscale ignores both the
/// raw prompt and the negative prompt.
pub fn compose_prompt(request: &PromptRequest<'_>) -> String {
    let prompt = request.raw_prompt;
    let base = match request.function {
        PromptFunction::Create(function) => function.template(prompt, request.has_reference_image),
        PromptFunction::Edit(EditFunction::Upscale) => return UPSCALE_INSTRUCTION.to_string(),
        PromptFunction::Edit(EditFunction::AddRemove | EditFunction::Retouch) => {
            prompt.to_string()
        }
        PromptFunction::Edit(EditFunction::Style) => {
            format!("Apply a {} style to the image. {prompt}", request.style.name())
                .trim()
                .to_string()
        }
        PromptFunction::Edit(EditFunction::Compose) => {
            let mut text = format!(
                "Combine the two provided images. The user's instruction is: \"{prompt}\". Follow the instruction to merge the visual elements from both images into a cohesive new image."
            );
            if request.compose_realistic {
                text.push_str(COMPOSE_REALISM_SUFFIX);
            }
            text.trim().to_string()
        }
        PromptFunction::Video if request.style.is_none() => prompt.to_string(),
        PromptFunction::Video => format!("{prompt}, in the style of {}", request.style.name()),
    };
    apply_negative_prompt(&base, request.negative_prompt)
}

pub fn apply_negative_prompt(prompt: &str, negative_prompt: &str) -> String {
    let negative = negative_prompt.trim();
    if negative.is_empty() {
        return prompt.to_string();
    }
    format!("{prompt}. Avoid the following: {negative}.")
}

/// Instruction for restyling the current artifact from the timeline.
pub fn style_transfer_instruction(style: ArtisticStyle) -> String {
    format!(
        "Apply a {} style to this image. Maintain the original subject and composition.",
        style.name()
    )
}

pub fn style_label(style: ArtisticStyle) -> String {
    format!("Style {}", style.name())
}

pub fn filter_label(filter: VisualFilter) -> String {
    format!("Filter {}", filter.name())
}

/// Gallery caption for results derived from an earlier artifact.
pub fn gallery_prompt_text(prompt: &str, label: &str) -> String {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        format!("Image with {label}")
    } else {
        format!("{trimmed} ({label})")
    }
}

/// Appends `suggestion` to a comma-separated negative prompt unless it is
/// already one of the parts.
pub fn merge_negative_suggestion(current: &str, suggestion: &str) -> String {
    let trimmed = current.trim();
    let suggestion = suggestion.trim();
    if trimmed.is_empty() {
        return suggestion.to_string();
    }
    if suggestion.is_empty() || trimmed.split(',').map(str::trim).any(|part| part == suggestion) {
        return current.to_string();
    }
    format!("{trimmed}, {suggestion}")
}

/// A `count`-long window over `pool`, starting at `offset` and wrapping.
pub fn suggestion_window<'a>(pool: &[&'a str], offset: usize, count: usize) -> Vec<&'a str> {
    if pool.is_empty() {
        return Vec::new();
    }
    (0..count.min(pool.len()))
        .map(|idx| pool[(offset + idx) % pool.len()])
        .collect()
}

fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace(['-', ' ', '/'], "_")
}
