/// How the text after a slash command is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ArgShape {
    None,
    /// Whole remainder stored under the given key.
    Raw(&'static str),
    /// Whole remainder stored as a settings update under the given key.
    Setting(&'static str),
    /// One shell-quoted path.
    Path,
    /// Leading index, stored as `index`.
    Index,
    /// Leading id followed by shell-split tags.
    IdAndTags,
    /// Whitespace or comma separated numbers, stored as `values`.
    Numbers,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
    pub args: ArgShape,
    pub usage: &'static str,
}

const fn spec(
    command: &'static str,
    action: &'static str,
    args: ArgShape,
    usage: &'static str,
) -> CommandSpec {
    CommandSpec {
        command,
        action,
        args,
        usage,
    }
}

pub(crate) const COMMANDS: &[CommandSpec] = &[
    spec("mode", "update_settings", ArgShape::Setting("mode"), "/mode create|edit|video"),
    spec(
        "create",
        "update_settings",
        ArgShape::Setting("create_function"),
        "/create free|sticker|logo|comic|photorealistic",
    ),
    spec(
        "edit",
        "update_settings",
        ArgShape::Setting("edit_function"),
        "/edit add_remove|retouch|style|compose|upscale",
    ),
    spec("style", "update_settings", ArgShape::Setting("style"), "/style <name>"),
    spec(
        "ratio",
        "update_settings",
        ArgShape::Setting("aspect_ratio"),
        "/ratio 1:1|16:9|9:16|4:3|3:4",
    ),
    spec("count", "update_settings", ArgShape::Setting("image_count"), "/count 1-4"),
    spec(
        "realistic",
        "update_settings",
        ArgShape::Setting("compose_realistic"),
        "/realistic on|off",
    ),
    spec(
        "negative",
        "update_settings",
        ArgShape::Setting("negative_prompt"),
        "/negative <text>",
    ),
    spec("avoid", "append_negative", ArgShape::Raw("suggestion"), "/avoid <suggestion>"),
    spec("use", "stage_primary", ArgShape::Path, "/use <image path>"),
    spec("use2", "stage_secondary", ArgShape::Path, "/use2 <image path>"),
    spec("unstage", "unstage", ArgShape::None, "/unstage"),
    spec("generate", "generate", ArgShape::Raw("prompt"), "/generate [prompt]"),
    spec("upscale", "upscale", ArgShape::None, "/upscale"),
    spec("restyle", "apply_style", ArgShape::Raw("style"), "/restyle <style>"),
    spec("filter", "apply_filter", ArgShape::Raw("filter"), "/filter grayscale|sepia|invert"),
    spec("crop", "crop", ArgShape::Numbers, "/crop <x> <y> <width> <height>"),
    spec("variations", "variations", ArgShape::None, "/variations"),
    spec("pick", "pick", ArgShape::Index, "/pick <n>"),
    spec("dismiss", "dismiss", ArgShape::None, "/dismiss"),
    spec("video", "video", ArgShape::Raw("prompt"), "/video [prompt]"),
    spec("wait", "wait_video", ArgShape::None, "/wait"),
    spec("status", "status", ArgShape::None, "/status"),
    spec("undo", "undo", ArgShape::None, "/undo"),
    spec("redo", "redo", ArgShape::None, "/redo"),
    spec("jump", "jump", ArgShape::Index, "/jump <n>"),
    spec("history", "history", ArgShape::None, "/history"),
    spec("edit_current", "edit_current", ArgShape::None, "/edit_current"),
    spec("new", "reset", ArgShape::None, "/new"),
    spec("gallery", "gallery", ArgShape::Raw("query"), "/gallery [search]"),
    spec("tag", "tag", ArgShape::IdAndTags, "/tag <id> <tag>..."),
    spec("untag", "untag", ArgShape::IdAndTags, "/untag <id> <tag>..."),
    spec("delete", "delete", ArgShape::Raw("id"), "/delete <id>"),
    spec("load", "load", ArgShape::Raw("id"), "/load <id>"),
    spec("export", "export", ArgShape::Path, "/export <path>"),
    spec("suggest", "suggest", ArgShape::None, "/suggest"),
    spec("help", "help", ArgShape::None, "/help"),
];

pub(crate) fn find_command(command: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|spec| spec.command == command)
}

/// Usage lines for every slash command, in registry order.
pub fn chat_help_lines() -> Vec<&'static str> {
    COMMANDS.iter().map(|spec| spec.usage).collect()
}
