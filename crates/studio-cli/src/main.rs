use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use studio_contracts::artifact::{extension_for_mime, parse_image_data_uri, Artifact};
use studio_contracts::chat::{chat_help_lines, parse_intent, Intent};
use studio_contracts::events::EventWriter;
use studio_contracts::history::HistoryEngine;
use studio_contracts::gallery::{
    all_modes, all_tags, normalize_tags, DateWindow, GalleryEntry, GalleryFilter, GalleryStore,
    JsonGalleryStore,
};
use studio_contracts::prompt::{
    suggestion_window, ArtisticStyle, Mode, VisualFilter, NEGATIVE_PROMPT_SUGGESTIONS,
    PROMPT_SUGGESTIONS,
};
use studio_engine::client::GeneratedImage;
use studio_engine::transforms::CropRect;
use studio_engine::{
    Action, ActionOrchestrator, ActionOutcome, ActionResult, DryrunClient, EngineConfig,
    GeminiClient, ImmediateScheduler, OperationClient, OrchestratorOptions, Scheduler,
    SelectionKind, SessionState, ThreadScheduler,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "studio-rs", version, about = "AI image studio CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Chat(ChatArgs),
    Run(RunArgs),
    Gallery(GalleryArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProviderKind {
    Gemini,
    Dryrun,
}

#[derive(Debug, Args)]
struct SessionArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, value_enum, default_value = "gemini")]
    provider: ProviderKind,
    #[arg(long)]
    gallery: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    prompt: String,
    #[command(flatten)]
    session: SessionArgs,
    #[arg(long, default_value = "free")]
    create: String,
    #[arg(long, default_value = "1:1")]
    ratio: String,
    #[arg(long, default_value_t = 1)]
    count: u32,
    #[arg(long)]
    negative: Option<String>,
    #[arg(long)]
    reference: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct GalleryArgs {
    #[arg(long)]
    gallery: PathBuf,
    #[arg(long, default_value = "")]
    search: String,
    #[arg(long)]
    mode: Option<String>,
    #[arg(long, default_value = "any")]
    date: String,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long)]
    json: bool,
}

const SUGGESTION_COUNT: usize = 3;

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("studio-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
        Command::Run(args) => run_once(args),
        Command::Gallery(args) => run_gallery(args),
    }
}

fn build_orchestrator(args: &SessionArgs) -> Result<ActionOrchestrator> {
    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let gallery_path = args
        .gallery
        .clone()
        .unwrap_or_else(|| args.out.join("gallery.json"));

    let config = EngineConfig::from_env();
    let (client, scheduler): (Arc<dyn OperationClient>, Arc<dyn Scheduler>) = match args.provider
    {
        ProviderKind::Gemini => {
            if config.api_key.is_none() {
                warn!("GEMINI_API_KEY is not set; service calls will fail");
            }
            (
                Arc::new(GeminiClient::new(config.clone())),
                Arc::new(ThreadScheduler),
            )
        }
        ProviderKind::Dryrun => (
            Arc::new(DryrunClient::default()),
            Arc::new(ImmediateScheduler),
        ),
    };
    let options = OrchestratorOptions::new(args.out.join("media"))
        .with_poll_interval(config.video_poll_interval())
        .with_scheduler(scheduler);
    info!(
        out = %args.out.display(),
        gallery = %gallery_path.display(),
        provider = client.name(),
        "session ready"
    );
    Ok(ActionOrchestrator::new(
        client,
        Box::new(JsonGalleryStore::new(gallery_path)),
        EventWriter::for_new_session(events_path),
        options,
    ))
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let out_dir = args.session.out.clone();
    let orchestrator = build_orchestrator(&args.session)?;
    let stdin = io::stdin();
    let mut line = String::new();
    let mut suggestion_offset = 0usize;

    println!("Studio chat started. Type /help for commands.");

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        if intent.action == "noop" {
            continue;
        }

        match intent.action.as_str() {
            "help" => {
                for help in chat_help_lines() {
                    println!("{help}");
                }
            }
            "update_settings" => {
                for (key, value) in &intent.settings_update {
                    let raw = value.as_str().unwrap_or_default();
                    match orchestrator.with_session(|session| session.apply_setting(key, raw)) {
                        Ok(()) => println!("{key}: {}", setting_text(&orchestrator.snapshot(), key)),
                        Err(err) => println!("{err}"),
                    }
                }
            }
            "append_negative" => {
                let suggestion = intent.arg_str("suggestion").trim().to_string();
                if suggestion.is_empty() {
                    println!("/avoid requires a suggestion");
                    continue;
                }
                let negative = orchestrator.with_session(|session| {
                    session.append_negative_suggestion(&suggestion);
                    session.negative_prompt.clone()
                });
                println!("Negative prompt: {negative}");
            }
            "stage_primary" | "stage_secondary" => {
                let path = intent.arg_str("path");
                if path.is_empty() {
                    println!("{} requires a path", command_name(&intent));
                    continue;
                }
                let secondary = intent.action == "stage_secondary";
                match orchestrator.stage_image(path, secondary) {
                    Ok(()) if secondary => println!("Second image staged: {path}"),
                    Ok(()) => println!("Image staged: {path}"),
                    Err(err) => println!("{err}"),
                }
            }
            "unstage" => {
                orchestrator.with_session(SessionState::unstage);
                println!("Staged images cleared.");
            }
            "generate" => {
                if let Some(prompt) = intent.prompt.as_deref() {
                    orchestrator.with_session(|session| session.prompt = prompt.to_string());
                }
                report(&orchestrator, &out_dir, orchestrator.dispatch(Action::Generate));
            }
            "video" => {
                let outcome = run_video(&orchestrator, intent.prompt.as_deref());
                report(&orchestrator, &out_dir, outcome);
            }
            "upscale" => {
                report(&orchestrator, &out_dir, orchestrator.dispatch(Action::Upscale));
            }
            "apply_style" => {
                let raw = intent.arg_str("style");
                let Some(style) = ArtisticStyle::parse(raw) else {
                    println!("Unknown style: {raw}");
                    continue;
                };
                report(
                    &orchestrator,
                    &out_dir,
                    orchestrator.dispatch(Action::ApplyStyle(style)),
                );
            }
            "apply_filter" => {
                let raw = intent.arg_str("filter");
                let Some(filter) = VisualFilter::parse(raw) else {
                    println!("Unknown filter: {raw} (grayscale, sepia, invert)");
                    continue;
                };
                report(
                    &orchestrator,
                    &out_dir,
                    orchestrator.dispatch(Action::ApplyFilter(filter)),
                );
            }
            "crop" => {
                let Some(rect) = crop_from_numbers(&intent.arg_numbers()) else {
                    println!("/crop requires <x> <y> <width> <height>");
                    continue;
                };
                report(&orchestrator, &out_dir, orchestrator.dispatch(Action::Crop(rect)));
            }
            "variations" => {
                report(
                    &orchestrator,
                    &out_dir,
                    orchestrator.dispatch(Action::GenerateVariations),
                );
            }
            "pick" => {
                let Some(index) = intent.arg_index() else {
                    println!("/pick requires a candidate number");
                    continue;
                };
                let action = if orchestrator.snapshot().generated().is_awaiting() {
                    Action::PickGenerated(index)
                } else {
                    Action::PickVariation(index)
                };
                report(&orchestrator, &out_dir, orchestrator.dispatch(action));
            }
            "dismiss" => {
                orchestrator.dismiss_selection();
                println!("Selection dismissed.");
            }
            "wait_video" => {
                if !orchestrator.snapshot().video().is_in_flight() {
                    println!("No video job in flight.");
                    continue;
                }
                println!("Waiting for the video job...");
                match orchestrator.wait_for_video() {
                    Ok(state) => {
                        println!("Video job {}.", state.as_str());
                        print_current(&orchestrator.snapshot());
                    }
                    Err(err) => println!("{err}"),
                }
            }
            "status" => {
                for line in status_lines(&orchestrator.snapshot()) {
                    println!("{line}");
                }
            }
            "undo" => print_navigation(orchestrator.undo()),
            "redo" => print_navigation(orchestrator.redo()),
            "jump" => {
                let Some(index) = intent.arg_index() else {
                    println!("/jump requires a history position");
                    continue;
                };
                print_navigation(orchestrator.jump_to(index));
            }
            "history" => {
                let snapshot = orchestrator.snapshot();
                if snapshot.history().is_empty() {
                    println!("History is empty.");
                }
                for line in history_lines(snapshot.history()) {
                    println!("{line}");
                }
            }
            "edit_current" => match orchestrator.edit_current() {
                Ok(()) => println!("Current image staged for editing (mode: edit, add/remove)."),
                Err(err) => println!("{err}"),
            },
            "reset" => {
                orchestrator.reset();
                println!("Started a new image.");
            }
            "gallery" => {
                let filter = GalleryFilter {
                    search: intent.arg_str("query").to_string(),
                    ..GalleryFilter::default()
                };
                match orchestrator.with_gallery(|store| store.list()) {
                    Ok(entries) => {
                        let shown = filter.apply(&entries, now_ms());
                        if shown.is_empty() {
                            println!("No gallery entries.");
                        }
                        for entry in &shown {
                            println!("{}", gallery_line(entry));
                        }
                    }
                    Err(err) => println!("Gallery unavailable: {err:#}"),
                }
            }
            "tag" | "untag" => {
                let id = intent.arg_str("id").to_string();
                let tags = intent.arg_list("tags");
                if id.is_empty() || tags.is_empty() {
                    println!("{} requires <id> <tag>...", command_name(&intent));
                    continue;
                }
                let adding = intent.action == "tag";
                let result = orchestrator.with_gallery(|store| {
                    let Some(entry) = store.get(&id)? else {
                        return Ok(None);
                    };
                    let next = retag(&entry.tags, &tags, adding);
                    store.update_tags(&id, &next)?;
                    Ok(Some(next))
                });
                match result {
                    Ok(Some(next)) => println!("Tags for {id}: {}", next.join(", ")),
                    Ok(None) => println!("No gallery entry with id {id}."),
                    Err(err) => println!("Tag update failed: {err:#}"),
                }
            }
            "delete" => {
                let id = intent.arg_str("id").trim().to_string();
                match orchestrator.with_gallery(|store| store.delete(&id)) {
                    Ok(true) => println!("Deleted {id}."),
                    Ok(false) => println!("No gallery entry with id {id}."),
                    Err(err) => println!("Delete failed: {err:#}"),
                }
            }
            "load" => match orchestrator.load_gallery_entry(intent.arg_str("id").trim()) {
                Ok(entry) => println!("Loaded {} into the editor: {}", entry.id, entry.prompt),
                Err(err) => println!("{err}"),
            },
            "export" => {
                let path = intent.arg_str("path");
                if path.is_empty() {
                    println!("/export requires a path");
                    continue;
                }
                match orchestrator.export_current(Path::new(path)) {
                    Ok(written) => println!("Exported to {}", written.display()),
                    Err(err) => println!("{err}"),
                }
            }
            "suggest" => {
                println!("Prompt ideas:");
                for idea in suggestion_window(PROMPT_SUGGESTIONS, suggestion_offset, SUGGESTION_COUNT)
                {
                    println!("  {idea}");
                }
                println!("Things to avoid (/avoid <text>):");
                for idea in suggestion_window(
                    NEGATIVE_PROMPT_SUGGESTIONS,
                    suggestion_offset,
                    SUGGESTION_COUNT,
                ) {
                    println!("  {idea}");
                }
                suggestion_offset += SUGGESTION_COUNT;
            }
            "unknown" => {
                println!(
                    "Unknown command /{}. Type /help for commands.",
                    intent.arg_str("command")
                );
            }
            other => println!("Unhandled action: {other}"),
        }
    }
    Ok(())
}

fn run_once(args: RunArgs) -> Result<i32> {
    let orchestrator = build_orchestrator(&args.session)?;
    orchestrator.with_session(|session| -> Result<()> {
        session.apply_setting("mode", "create")?;
        session.apply_setting("create_function", &args.create)?;
        session.apply_setting("aspect_ratio", &args.ratio)?;
        session.set_image_count(args.count);
        session.prompt = args.prompt.clone();
        if let Some(negative) = &args.negative {
            session.negative_prompt = negative.clone();
        }
        Ok(())
    })?;
    if let Some(reference) = &args.reference {
        orchestrator.stage_image(&reference.to_string_lossy(), false)?;
    }

    match orchestrator.dispatch(Action::Generate)? {
        ActionOutcome::Committed(artifact) => {
            let path = args.session.out.join(format!(
                "result.{}",
                artifact_extension(&artifact)
            ));
            let written = orchestrator.export_current(&path)?;
            println!("{}", written.display());
        }
        ActionOutcome::AwaitingSelection { kind, .. } => {
            for path in write_candidates(&orchestrator.snapshot(), kind, &args.session.out)? {
                println!("{}", path.display());
            }
        }
        ActionOutcome::VideoSubmitted { operation } => {
            bail!("unexpected video job {operation} from a create run");
        }
    }
    Ok(0)
}

fn run_gallery(args: GalleryArgs) -> Result<i32> {
    let Some(date) = DateWindow::parse(&args.date) else {
        bail!("invalid --date {} (any, today, week, month)", args.date);
    };
    let mut store = JsonGalleryStore::new(&args.gallery);
    let entries = store.list()?;
    let filter = GalleryFilter {
        search: args.search,
        mode: args.mode,
        date,
        tags: normalize_tags(&args.tags),
    };
    let shown = filter.apply(&entries, now_ms());

    if args.json {
        println!("{}", serde_json::to_string_pretty(&shown)?);
        return Ok(0);
    }
    for entry in &shown {
        println!("{}", gallery_line(entry));
    }
    if filter.is_active() {
        println!("{} of {} entries", shown.len(), entries.len());
    } else {
        println!("{} entries", entries.len());
    }
    let modes = all_modes(&entries);
    if !modes.is_empty() {
        println!("modes: {}", modes.join(", "));
    }
    let tags = all_tags(&entries);
    if !tags.is_empty() {
        println!("tags: {}", tags.join(", "));
    }
    Ok(0)
}

fn report(orchestrator: &ActionOrchestrator, out_dir: &Path, result: ActionResult<ActionOutcome>) {
    match result {
        Ok(ActionOutcome::Committed(artifact)) => {
            println!(
                "{} -> {}",
                artifact.action_label,
                describe_locator(&artifact.url)
            );
            if let Some(caption) = artifact.caption.as_deref() {
                println!("  {caption}");
            }
            if artifact.is_image() {
                let preview = out_dir.join(format!("current.{}", artifact_extension(&artifact)));
                match orchestrator.export_current(&preview) {
                    Ok(written) => println!("  preview: {}", written.display()),
                    Err(err) => warn!(error = %err, "preview write failed"),
                }
            }
        }
        Ok(ActionOutcome::AwaitingSelection { kind, count }) => {
            println!("{count} {} images ready:", kind.as_str());
            match write_candidates(&orchestrator.snapshot(), kind, out_dir) {
                Ok(paths) => {
                    for (idx, path) in paths.iter().enumerate() {
                        println!("  [{idx}] {}", path.display());
                    }
                }
                Err(err) => warn!(error = %err, "candidate write failed"),
            }
            println!("Use /pick <n> to keep one, or /dismiss.");
        }
        Ok(ActionOutcome::VideoSubmitted { operation }) => {
            println!("Video job {operation} submitted. Use /status or /wait.");
        }
        Err(err) => println!("{} error: {err}", err.kind()),
    }
}

/// Runs one video job from the REPL, leaving the session's mode as it was.
fn run_video(
    orchestrator: &ActionOrchestrator,
    prompt: Option<&str>,
) -> ActionResult<ActionOutcome> {
    let previous = orchestrator.with_session(|session| {
        if let Some(prompt) = prompt {
            session.prompt = prompt.to_string();
        }
        std::mem::replace(&mut session.mode, Mode::Video)
    });
    let outcome = orchestrator.dispatch(Action::Generate);
    orchestrator.with_session(|session| session.mode = previous);
    outcome
}

fn write_candidates(
    session: &SessionState,
    kind: SelectionKind,
    out_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let candidates: &[GeneratedImage] = match kind {
        SelectionKind::Generated => session.generated().candidates(),
        SelectionKind::Variations => session.variations().candidates(),
    };
    let dir = out_dir.join("candidates");
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let mut paths = Vec::with_capacity(candidates.len());
    for (idx, candidate) in candidates.iter().enumerate() {
        let image = studio_contracts::artifact::UploadedImage::from_base64(
            &candidate.base64,
            candidate.mime_type.clone(),
        )?;
        let path = dir.join(format!(
            "{}-{idx}.{}",
            kind.as_str(),
            extension_for_mime(&candidate.mime_type)
        ));
        fs::write(&path, &image.bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        paths.push(path);
    }
    Ok(paths)
}

fn print_navigation(current: Option<Artifact>) {
    match current {
        Some(artifact) => println!(
            "Current: {} ({})",
            artifact.action_label,
            describe_locator(&artifact.url)
        ),
        None => println!("History is empty."),
    }
}

fn print_current(session: &SessionState) {
    print_navigation(session.history().current().cloned());
}

fn status_lines(session: &SessionState) -> Vec<String> {
    let mut lines = vec![
        format!("mode: {}", session.mode.as_str()),
        format!("action: {}", session.action_label()),
        format!("prompt: {}", display_or_dash(&session.prompt)),
        format!("negative: {}", display_or_dash(&session.negative_prompt)),
        format!(
            "style: {}  ratio: {}  count: {}  realistic: {}",
            session.style.name(),
            session.aspect_ratio.as_str(),
            session.image_count,
            on_off(session.compose_realistic)
        ),
        format!(
            "staged: {}{}",
            if session.primary_image.is_some() { "primary" } else { "none" },
            if session.secondary_image.is_some() { " + secondary" } else { "" }
        ),
        format!(
            "history: {} item(s), cursor {}",
            session.history().len(),
            session
                .history()
                .cursor()
                .map(|cursor| cursor.to_string())
                .unwrap_or_else(|| "-".to_string())
        ),
    ];
    if session.generated().is_awaiting() {
        lines.push(format!(
            "awaiting pick: {} generated",
            session.generated().candidates().len()
        ));
    }
    if session.variations().is_awaiting() {
        lines.push(format!(
            "awaiting pick: {} variations",
            session.variations().candidates().len()
        ));
    }
    let video = session.video();
    if video.is_in_flight() {
        lines.push(format!(
            "video: {} after {} poll(s): {}",
            video.state().as_str(),
            video.polls(),
            video.message()
        ));
    } else if video.state().as_str() != "idle" {
        lines.push(format!("video: {}", video.state().as_str()));
    }
    if let Some(error) = session.last_error() {
        lines.push(format!("last error: {error}"));
    }
    lines
}

fn history_lines(history: &HistoryEngine) -> Vec<String> {
    let cursor = history.cursor();
    history
        .items()
        .iter()
        .enumerate()
        .map(|(idx, artifact)| {
            let marker = if Some(idx) == cursor { "*" } else { " " };
            format!(
                "{marker} [{idx}] {} ({})",
                artifact.action_label,
                artifact.media_type.as_str()
            )
        })
        .collect()
}

fn gallery_line(entry: &GalleryEntry) -> String {
    let created = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(entry.created_at)
        .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    let tags = if entry.tags.is_empty() {
        String::new()
    } else {
        format!(" [{}]", entry.tags.join(", "))
    };
    format!(
        "{}  {created}  {}  {}{tags}",
        entry.id,
        display_or_dash(&entry.creation_mode),
        entry.prompt
    )
}

fn setting_text(session: &SessionState, key: &str) -> String {
    match key {
        "mode" => session.mode.as_str().to_string(),
        "create_function" => session.create_function.as_str().to_string(),
        "edit_function" => session.edit_function.as_str().to_string(),
        "style" => session.style.name().to_string(),
        "aspect_ratio" => session.aspect_ratio.as_str().to_string(),
        "image_count" => session.image_count.to_string(),
        "compose_realistic" => on_off(session.compose_realistic).to_string(),
        "negative_prompt" => display_or_dash(&session.negative_prompt).to_string(),
        _ => String::new(),
    }
}

/// Adds or removes `changes` while keeping existing order.
fn retag(current: &[String], changes: &[String], adding: bool) -> Vec<String> {
    let changes = normalize_tags(changes);
    if adding {
        let mut merged = current.to_vec();
        merged.extend(changes);
        normalize_tags(&merged)
    } else {
        current
            .iter()
            .filter(|tag| !changes.contains(tag))
            .cloned()
            .collect()
    }
}

fn crop_from_numbers(values: &[f64]) -> Option<CropRect> {
    match values {
        [x, y, width, height] => Some(CropRect::new(*x, *y, *width, *height)),
        _ => None,
    }
}

/// Short human form of a locator; data URIs are not printed in full.
fn describe_locator(locator: &str) -> String {
    match parse_image_data_uri(locator) {
        Some((mime, payload)) => format!("{mime}, {} base64 chars", payload.len()),
        None => locator.to_string(),
    }
}

fn artifact_extension(artifact: &Artifact) -> &'static str {
    match parse_image_data_uri(&artifact.url) {
        Some((mime, _)) => extension_for_mime(mime),
        None => Path::new(&artifact.url)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| match ext.to_ascii_lowercase().as_str() {
                "mp4" => "mp4",
                "webm" => "webm",
                "jpg" | "jpeg" => "jpg",
                _ => "png",
            })
            .unwrap_or("png"),
    }
}

fn command_name(intent: &Intent) -> String {
    intent
        .raw
        .trim()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string()
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

fn display_or_dash(value: &str) -> &str {
    if value.trim().is_empty() {
        "-"
    } else {
        value
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
