use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::{json, Map, Value};
use studio_contracts::artifact::{extension_for_mime, Artifact, UploadedImage};
use studio_contracts::events::{EventKind, EventWriter};
use studio_contracts::gallery::{GalleryEntry, GalleryStore};
use studio_contracts::history::HistoryEngine;
use studio_contracts::prompt::{
    compose_prompt, filter_label, gallery_prompt_text, style_label, style_transfer_instruction,
    ArtisticStyle, EditFunction, Mode, VisualFilter, CROP_LABEL, UPSCALE_INSTRUCTION,
    UPSCALE_LABEL, VARIATION_INSTRUCTION, VARIATION_LABEL,
};
use tracing::{debug, info, warn};

use crate::client::{EditedImage, GeneratedImage, OperationClient, VideoJobHandle};
use crate::error::{error_chain_text, ActionError, ActionResult, ClientError, ClientResult};
use crate::poller::{
    CancellationToken, PollStep, PollerState, Scheduler, ThreadScheduler,
    VIDEO_PROGRESS_MESSAGES,
};
use crate::session::SessionState;
use crate::transforms::{self, CropRect};

/// Concurrent edit calls fired by one variations request.
pub const VARIATION_COUNT: usize = 3;

/// A user-triggered action.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Runs the session's current mode: create, edit or video.
    Generate,
    /// Upscales the current artifact, or the staged image when there is none.
    Upscale,
    ApplyStyle(ArtisticStyle),
    ApplyFilter(VisualFilter),
    Crop(CropRect),
    GenerateVariations,
    PickGenerated(usize),
    PickVariation(usize),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Generate => "generate",
            Action::Upscale => "upscale",
            Action::ApplyStyle(_) => "apply_style",
            Action::ApplyFilter(_) => "apply_filter",
            Action::Crop(_) => "crop",
            Action::GenerateVariations => "generate_variations",
            Action::PickGenerated(_) => "pick_generated",
            Action::PickVariation(_) => "pick_variation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionKind {
    Generated,
    Variations,
}

impl SelectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SelectionKind::Generated => "generated",
            SelectionKind::Variations => "variations",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Committed(Artifact),
    AwaitingSelection { kind: SelectionKind, count: usize },
    VideoSubmitted { operation: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lineage {
    Replace,
    Append,
}

impl Lineage {
    fn as_str(self) -> &'static str {
        match self {
            Lineage::Replace => "replace",
            Lineage::Append => "append",
        }
    }
}

pub struct OrchestratorOptions {
    pub media_dir: PathBuf,
    pub poll_interval: Duration,
    pub scheduler: Arc<dyn Scheduler>,
}

impl OrchestratorOptions {
    pub fn new(media_dir: impl Into<PathBuf>) -> Self {
        Self {
            media_dir: media_dir.into(),
            poll_interval: Duration::from_secs(10),
            scheduler: Arc::new(ThreadScheduler),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }
}

/// State shared with the video worker thread.
struct Shared {
    session: Mutex<SessionState>,
    client: Arc<dyn OperationClient>,
    gallery: Mutex<Box<dyn GalleryStore>>,
    events: EventWriter,
    scheduler: Arc<dyn Scheduler>,
    media_dir: PathBuf,
    poll_interval: Duration,
}

impl Shared {
    fn lock_session(&self) -> MutexGuard<'_, SessionState> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, kind: EventKind, payload: Value) {
        let payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if let Err(err) = self.events.emit(kind, payload) {
            warn!(event_type = kind.as_str(), error = %err, "event write failed");
        }
    }

    fn record_failure(&self, action: &str, err: &ActionError) {
        if *err != ActionError::Cancelled && *err != ActionError::Busy {
            self.lock_session().last_error = Some(err.to_string());
        }
        warn!(action, kind = err.kind(), error = %err, "action failed");
        self.emit(
            EventKind::ActionFailed,
            json!({ "action": action, "kind": err.kind(), "message": err.to_string() }),
        );
    }

    /// Runs `apply` under the session lock unless a reset happened since
    /// `epoch` was read.
    fn with_epoch<T>(
        &self,
        epoch: u64,
        apply: impl FnOnce(&mut SessionState) -> ActionResult<T>,
    ) -> ActionResult<T> {
        let mut session = self.lock_session();
        if session.epoch != epoch {
            return Err(ActionError::Cancelled);
        }
        apply(&mut session)
    }

    fn commit(
        &self,
        epoch: u64,
        artifact: Artifact,
        lineage: Lineage,
        gallery_prompt: String,
    ) -> ActionResult<Artifact> {
        let committed =
            self.with_epoch(epoch, |session| Ok(self.commit_locked(session, artifact, lineage)))?;
        self.persist(&committed, &gallery_prompt);
        Ok(committed)
    }

    fn commit_locked(
        &self,
        session: &mut SessionState,
        artifact: Artifact,
        lineage: Lineage,
    ) -> Artifact {
        let committed = match lineage {
            Lineage::Replace => session.history.replace(artifact).clone(),
            Lineage::Append => session.history.append(artifact).clone(),
        };
        session.last_error = None;
        info!(
            label = %committed.action_label,
            lineage = lineage.as_str(),
            len = session.history.len(),
            "artifact committed"
        );
        self.emit(
            EventKind::ArtifactCommitted,
            json!({
                "action_label": committed.action_label,
                "media_type": committed.media_type.as_str(),
                "lineage": lineage.as_str(),
                "cursor": session.history.cursor(),
                "history_len": session.history.len(),
            }),
        );
        committed
    }

    /// Best-effort gallery write; failures are logged, never surfaced.
    fn persist(&self, artifact: &Artifact, prompt: &str) {
        let entry = GalleryEntry::new(&artifact.url, prompt, &artifact.action_label);
        let id = entry.id.clone();
        let result = self
            .gallery
            .lock()
            .map_err(|_| anyhow::anyhow!("gallery lock poisoned"))
            .and_then(|mut store| store.upsert(entry));
        match result {
            Ok(()) => debug!(id = %id, "gallery entry saved"),
            Err(err) => {
                let message = error_chain_text(&err, 300);
                warn!(error = %message, "gallery persist failed");
                self.emit(EventKind::GalleryPersistFailed, json!({ "message": message }));
            }
        }
    }
}

static NEXT_BUSY_TICKET: AtomicU64 = AtomicU64::new(1);

/// Holds the busy flag for as long as it lives.
///
/// The flag stores the ticket of its holder (zero when free), so a guard
/// whose claim was released by a reset never frees a later holder's claim.
struct BusyGuard {
    flag: Arc<AtomicU64>,
    ticket: u64,
}

impl BusyGuard {
    fn acquire(flag: &Arc<AtomicU64>) -> ActionResult<Self> {
        let ticket = NEXT_BUSY_TICKET.fetch_add(1, Ordering::Relaxed);
        flag.compare_exchange(0, ticket, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ActionError::Busy)?;
        Ok(Self {
            flag: Arc::clone(flag),
            ticket,
        })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let _ = self
            .flag
            .compare_exchange(self.ticket, 0, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// The current artifact (or staged image) an edit-style action works on.
struct Source {
    epoch: u64,
    image: UploadedImage,
    caption: Option<String>,
    prompt: String,
}

/// Single entry point for every action on one editing session.
///
/// At most one action runs at a time; a dispatch while another is in
/// flight fails with [`ActionError::Busy`]. A running video job holds the
/// busy flag until its worker reaches a terminal state or the session is
/// reset.
pub struct ActionOrchestrator {
    shared: Arc<Shared>,
    busy: Arc<AtomicU64>,
    video_worker: Mutex<Option<JoinHandle<()>>>,
    /// Workers of video jobs cancelled by a reset, still finishing a call.
    retired_workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ActionOrchestrator {
    pub fn new(
        client: Arc<dyn OperationClient>,
        gallery: Box<dyn GalleryStore>,
        events: EventWriter,
        options: OrchestratorOptions,
    ) -> Self {
        let shared = Shared {
            session: Mutex::new(SessionState::new()),
            client,
            gallery: Mutex::new(gallery),
            events,
            scheduler: options.scheduler,
            media_dir: options.media_dir,
            poll_interval: options.poll_interval,
        };
        shared.emit(
            EventKind::SessionStarted,
            json!({
                "client": shared.client.name(),
                "media_dir": shared.media_dir.to_string_lossy(),
            }),
        );
        Self {
            shared: Arc::new(shared),
            busy: Arc::new(AtomicU64::new(0)),
            video_worker: Mutex::new(None),
            retired_workers: Mutex::new(Vec::new()),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire) != 0
    }

    pub fn events(&self) -> &EventWriter {
        &self.shared.events
    }

    pub fn snapshot(&self) -> SessionState {
        self.shared.lock_session().clone()
    }

    pub fn with_session<R>(&self, apply: impl FnOnce(&mut SessionState) -> R) -> R {
        apply(&mut self.shared.lock_session())
    }

    pub fn with_gallery<R>(
        &self,
        apply: impl FnOnce(&mut dyn GalleryStore) -> anyhow::Result<R>,
    ) -> anyhow::Result<R> {
        let mut store = self
            .shared
            .gallery
            .lock()
            .map_err(|_| anyhow::anyhow!("gallery lock poisoned"))?;
        apply(&mut **store)
    }

    pub fn dispatch(&self, action: Action) -> ActionResult<ActionOutcome> {
        let name = action.name();
        let guard = match BusyGuard::acquire(&self.busy) {
            Ok(guard) => guard,
            Err(err) => {
                self.shared.record_failure(name, &err);
                return Err(err);
            }
        };
        debug!(action = name, "action started");
        self.shared.emit(EventKind::ActionStarted, json!({ "action": name }));

        let result = match action {
            Action::Generate => self.generate(guard),
            Action::Upscale => self.upscale(),
            Action::ApplyStyle(style) => self.apply_style(style),
            Action::ApplyFilter(filter) => self.apply_filter(filter),
            Action::Crop(rect) => self.crop(rect),
            Action::GenerateVariations => self.generate_variations(),
            Action::PickGenerated(index) => self.pick_generated(index),
            Action::PickVariation(index) => self.pick_variation(index),
        };
        if let Err(err) = &result {
            self.shared.record_failure(name, err);
        }
        result
    }

    fn generate(&self, guard: BusyGuard) -> ActionResult<ActionOutcome> {
        let mode = self.shared.lock_session().mode;
        match mode {
            Mode::Create => self.create(),
            Mode::Edit => self.edit(),
            Mode::Video => self.start_video(guard),
        }
    }

    fn create(&self) -> ActionResult<ActionOutcome> {
        let (epoch, prompt_text, reference, aspect_ratio, count, label, raw_prompt) = {
            let session = self.shared.lock_session();
            require_prompt(&session)?;
            (
                session.epoch,
                compose_prompt(&session.prompt_request()),
                session.primary_image.clone(),
                session.aspect_ratio,
                session.image_count,
                session.action_label(),
                session.prompt.clone(),
            )
        };

        if let Some(reference) = reference {
            let edited = self
                .shared
                .client
                .edit_images(&prompt_text, std::slice::from_ref(&reference))?;
            let artifact = Artifact::image(edited.image.data_uri(), edited.caption, label);
            return self
                .shared
                .commit(epoch, artifact, Lineage::Replace, raw_prompt)
                .map(ActionOutcome::Committed);
        }

        let mut images = self
            .shared
            .client
            .generate_images(&prompt_text, aspect_ratio, count)?;
        images.truncate(count.max(1) as usize);
        if images.len() > 1 {
            let offered = images.len();
            self.shared.with_epoch(epoch, |session| {
                session.generated.offer(images);
                Ok(())
            })?;
            self.shared.emit(
                EventKind::SelectionOffered,
                json!({ "kind": SelectionKind::Generated.as_str(), "count": offered }),
            );
            return Ok(ActionOutcome::AwaitingSelection {
                kind: SelectionKind::Generated,
                count: offered,
            });
        }
        let first = images
            .into_iter()
            .next()
            .ok_or_else(|| ActionError::service("The image could not be generated."))?;
        let artifact = Artifact::image(first.data_uri(), None, label);
        self.shared
            .commit(epoch, artifact, Lineage::Replace, raw_prompt)
            .map(ActionOutcome::Committed)
    }

    fn edit(&self) -> ActionResult<ActionOutcome> {
        let (epoch, prompt_text, images, label, gallery_prompt) = {
            let session = self.shared.lock_session();
            let function = session.edit_function;
            let Some(primary) = session.primary_image.clone() else {
                return Err(ActionError::validation("Please upload an image to edit."));
            };
            let mut images = vec![primary];
            if function.required_images() > 1 {
                let Some(secondary) = session.secondary_image.clone() else {
                    return Err(ActionError::validation(
                        "A second image is required for compose.",
                    ));
                };
                images.push(secondary);
            }
            if function.needs_prompt() {
                require_prompt(&session)?;
            }
            let gallery_prompt = if function == EditFunction::Upscale {
                gallery_prompt_text(&session.prompt, UPSCALE_LABEL)
            } else {
                session.prompt.clone()
            };
            (
                session.epoch,
                compose_prompt(&session.prompt_request()),
                images,
                session.action_label(),
                gallery_prompt,
            )
        };

        let edited = self.shared.client.edit_images(&prompt_text, &images)?;
        let artifact = Artifact::image(edited.image.data_uri(), edited.caption, label);
        self.shared
            .commit(epoch, artifact, Lineage::Append, gallery_prompt)
            .map(ActionOutcome::Committed)
    }

    fn current_source(&self, purpose: &str, allow_staged: bool) -> ActionResult<Source> {
        let session = self.shared.lock_session();
        let (image, caption) = match session.history.current() {
            Some(current) if current.is_image() => {
                let image = UploadedImage::from_locator(&current.url).map_err(|_| {
                    ActionError::validation(format!("Invalid image format to {purpose}."))
                })?;
                (image, current.caption.clone())
            }
            Some(_) if !allow_staged => {
                return Err(ActionError::validation(format!(
                    "The current item is a video; only images can {purpose}."
                )));
            }
            _ => match session.primary_image.clone().filter(|_| allow_staged) {
                Some(image) => (image, None),
                None => {
                    return Err(ActionError::validation(format!(
                        "There is no current image to {purpose}."
                    )));
                }
            },
        };
        Ok(Source {
            epoch: session.epoch,
            image,
            caption,
            prompt: session.prompt.clone(),
        })
    }

    fn edit_source(
        &self,
        source: Source,
        instruction: &str,
        label: String,
    ) -> ActionResult<ActionOutcome> {
        let edited = self
            .shared
            .client
            .edit_images(instruction, std::slice::from_ref(&source.image))?;
        let gallery_prompt = gallery_prompt_text(&source.prompt, &label);
        let artifact = Artifact::image(edited.image.data_uri(), edited.caption, label);
        self.shared
            .commit(source.epoch, artifact, Lineage::Append, gallery_prompt)
            .map(ActionOutcome::Committed)
    }

    fn upscale(&self) -> ActionResult<ActionOutcome> {
        let source = self.current_source("upscale", true)?;
        self.edit_source(source, UPSCALE_INSTRUCTION, UPSCALE_LABEL.to_string())
    }

    fn apply_style(&self, style: ArtisticStyle) -> ActionResult<ActionOutcome> {
        if style.is_none() {
            return Err(ActionError::validation("Choose a style to apply."));
        }
        let source = self.current_source("apply a style", false)?;
        self.edit_source(source, &style_transfer_instruction(style), style_label(style))
    }

    fn apply_local(
        &self,
        source: Source,
        label: String,
        transform: impl FnOnce(&UploadedImage) -> anyhow::Result<UploadedImage>,
    ) -> ActionResult<ActionOutcome> {
        let output = transform(&source.image)
            .map_err(|err| ActionError::local(error_chain_text(&err, 300)))?;
        let gallery_prompt = gallery_prompt_text(&source.prompt, &label);
        let artifact = Artifact::image(output.to_data_uri(), source.caption, label);
        self.shared
            .commit(source.epoch, artifact, Lineage::Append, gallery_prompt)
            .map(ActionOutcome::Committed)
    }

    fn apply_filter(&self, filter: VisualFilter) -> ActionResult<ActionOutcome> {
        let source = self.current_source("apply a filter", false)?;
        self.apply_local(source, filter_label(filter), |image| {
            transforms::apply_filter(image, filter)
        })
    }

    fn crop(&self, rect: CropRect) -> ActionResult<ActionOutcome> {
        let source = self.current_source("crop", false)?;
        self.apply_local(source, CROP_LABEL.to_string(), |image| {
            transforms::crop(image, rect)
        })
    }

    fn generate_variations(&self) -> ActionResult<ActionOutcome> {
        let source = self.current_source("generate variations", false)?;
        self.shared.with_epoch(source.epoch, |session| {
            session.variations.dismiss();
            Ok(())
        })?;

        let client = &self.shared.client;
        let image = std::slice::from_ref(&source.image);
        let results: Vec<ClientResult<EditedImage>> = thread::scope(|scope| {
            let workers: Vec<_> = (0..VARIATION_COUNT)
                .map(|_| scope.spawn(|| client.edit_images(VARIATION_INSTRUCTION, image)))
                .collect();
            workers
                .into_iter()
                .map(|worker| {
                    worker.join().unwrap_or_else(|_| {
                        Err(ClientError::Service("variation worker panicked".to_string()))
                    })
                })
                .collect()
        });

        // Every call has finished; commit only if all of them succeeded.
        let candidates = results
            .into_iter()
            .map(|result| result.map(|edited| edited.image))
            .collect::<ClientResult<Vec<GeneratedImage>>>()?;
        let count = candidates.len();
        self.shared.with_epoch(source.epoch, |session| {
            session.variations.offer(candidates);
            Ok(())
        })?;
        self.shared.emit(
            EventKind::SelectionOffered,
            json!({ "kind": SelectionKind::Variations.as_str(), "count": count }),
        );
        Ok(ActionOutcome::AwaitingSelection {
            kind: SelectionKind::Variations,
            count,
        })
    }

    fn pick_generated(&self, index: usize) -> ActionResult<ActionOutcome> {
        let (committed, prompt) = {
            let mut session = self.shared.lock_session();
            let chosen = choose(&mut session, SelectionKind::Generated, index)?;
            let label = session.action_label();
            let artifact = Artifact::image(chosen.data_uri(), None, label);
            let committed = self
                .shared
                .commit_locked(&mut session, artifact, Lineage::Replace);
            (committed, session.prompt.clone())
        };
        self.resolved(SelectionKind::Generated, index);
        self.shared.persist(&committed, &prompt);
        Ok(ActionOutcome::Committed(committed))
    }

    fn pick_variation(&self, index: usize) -> ActionResult<ActionOutcome> {
        let (committed, prompt) = {
            let mut session = self.shared.lock_session();
            let chosen = choose(&mut session, SelectionKind::Variations, index)?;
            let caption = session
                .history
                .current()
                .and_then(|current| current.caption.clone());
            let artifact = Artifact::image(chosen.data_uri(), caption, VARIATION_LABEL);
            let committed = self
                .shared
                .commit_locked(&mut session, artifact, Lineage::Append);
            (committed, gallery_prompt_text(&session.prompt, VARIATION_LABEL))
        };
        self.resolved(SelectionKind::Variations, index);
        self.shared.persist(&committed, &prompt);
        Ok(ActionOutcome::Committed(committed))
    }

    fn resolved(&self, kind: SelectionKind, index: usize) {
        self.shared.emit(
            EventKind::SelectionResolved,
            json!({ "kind": kind.as_str(), "index": index }),
        );
    }

    pub fn dismiss_selection(&self) {
        {
            let mut session = self.shared.lock_session();
            session.generated.dismiss();
            session.variations.dismiss();
        }
        self.shared.emit(EventKind::SelectionDismissed, json!({}));
    }

    fn start_video(&self, guard: BusyGuard) -> ActionResult<ActionOutcome> {
        let (epoch, prompt_text, reference, label, caption) = {
            let session = self.shared.lock_session();
            if session.video.is_in_flight() {
                return Err(ActionError::Busy);
            }
            require_prompt(&session)?;
            (
                session.epoch,
                compose_prompt(&session.prompt_request()),
                session.primary_image.clone(),
                session.action_label(),
                session.prompt.clone(),
            )
        };

        let handle = self
            .shared
            .client
            .start_video_generation(&prompt_text, reference.as_ref())?;
        self.reap_retired_workers();
        let token = CancellationToken::new();
        self.shared.with_epoch(epoch, |session| {
            session.video.submit(handle.clone())?;
            session.video_token = Some(token.clone());
            Ok(())
        })?;
        info!(operation = %handle.name, "video job submitted");
        self.shared.emit(
            EventKind::VideoSubmitted,
            json!({ "operation": handle.name, "message": VIDEO_PROGRESS_MESSAGES[0] }),
        );

        let job = VideoJob {
            shared: Arc::clone(&self.shared),
            handle: handle.clone(),
            token,
            epoch,
            label,
            caption,
            _busy: guard,
        };
        let spawned = thread::Builder::new()
            .name("studio-video-poller".to_string())
            .spawn(move || job.run());
        match spawned {
            Ok(worker) => {
                let mut slot = self
                    .video_worker
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                *slot = Some(worker);
            }
            Err(err) => {
                let message = format!("failed to start video poller: {err}");
                self.shared.lock_session().video.fail(message.clone());
                return Err(ActionError::Transport(message));
            }
        }
        Ok(ActionOutcome::VideoSubmitted {
            operation: handle.name,
        })
    }

    /// Blocks until the running video job (if any) reaches a terminal state.
    pub fn wait_for_video(&self) -> ActionResult<PollerState> {
        self.join_video_worker()?;
        Ok(self.shared.lock_session().video.state().clone())
    }

    fn join_video_worker(&self) -> ActionResult<()> {
        let worker = self
            .video_worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker
                .join()
                .map_err(|_| ActionError::service("video worker panicked"))?;
        }
        Ok(())
    }

    /// Joins retired workers that have already finished.
    fn reap_retired_workers(&self) {
        let mut retired = self
            .retired_workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (finished, running): (Vec<_>, Vec<_>) =
            retired.drain(..).partition(|worker| worker.is_finished());
        *retired = running;
        drop(retired);
        for worker in finished {
            if worker.join().is_err() {
                warn!("video worker panicked");
            }
        }
    }

    /// Blocks until every retired worker has returned.
    fn join_retired_workers(&self) {
        let retired = std::mem::take(
            &mut *self
                .retired_workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for worker in retired {
            if worker.join().is_err() {
                warn!("video worker panicked");
            }
        }
    }

    /// Starts over: cancels any video job and empties the session. Results
    /// of actions still in flight are discarded when they return.
    ///
    /// Returns without waiting for a video worker stuck in a service call;
    /// the worker is joined later and its result is dropped.
    pub fn reset(&self) {
        let token = self.shared.lock_session().reset();
        if let Some(token) = token {
            token.cancel();
        }
        let worker = self
            .video_worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            self.retired_workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(worker);
        }
        self.busy.store(0, Ordering::Release);
        info!("session reset");
        self.shared.emit(EventKind::SessionReset, json!({}));
    }

    pub fn undo(&self) -> Option<Artifact> {
        self.navigate("undo", |history| history.undo().cloned())
    }

    pub fn redo(&self) -> Option<Artifact> {
        self.navigate("redo", |history| history.redo().cloned())
    }

    pub fn jump_to(&self, index: usize) -> Option<Artifact> {
        self.navigate("jump", |history| history.jump_to(index).cloned())
    }

    fn navigate(
        &self,
        direction: &str,
        step: impl FnOnce(&mut HistoryEngine) -> Option<Artifact>,
    ) -> Option<Artifact> {
        let (from, to, current) = {
            let mut session = self.shared.lock_session();
            let from = session.history.cursor();
            let current = step(&mut session.history);
            (from, session.history.cursor(), current)
        };
        self.shared.emit(
            EventKind::HistoryNavigated,
            json!({ "direction": direction, "from": from, "to": to }),
        );
        current
    }

    /// Stages an image from a data URI or file path.
    pub fn stage_image(&self, locator: &str, secondary: bool) -> ActionResult<()> {
        let image = UploadedImage::from_locator(locator)
            .map_err(|err| ActionError::validation(error_chain_text(&err, 300)))?;
        let mut session = self.shared.lock_session();
        if secondary {
            session.stage_secondary(image);
        } else {
            session.stage_primary(image);
        }
        Ok(())
    }

    /// Moves the current image into the edit inputs.
    pub fn edit_current(&self) -> ActionResult<()> {
        let mut session = self.shared.lock_session();
        let Some(current) = session.history.current().filter(|item| item.is_image()) else {
            return Err(ActionError::validation("There is no current image to edit."));
        };
        let image = UploadedImage::from_locator(&current.url)
            .map_err(|_| ActionError::validation("Invalid image format to edit."))?;
        session.begin_edit_of(image, None);
        Ok(())
    }

    /// Loads a gallery entry as the edit input of a fresh, empty timeline.
    pub fn load_gallery_entry(&self, id: &str) -> ActionResult<GalleryEntry> {
        let _busy = BusyGuard::acquire(&self.busy)?;
        let entry = self
            .with_gallery(|store| store.get(id))
            .map_err(|err| ActionError::local(error_chain_text(&err, 300)))?
            .ok_or_else(|| ActionError::validation(format!("No gallery entry with id {id}.")))?;
        let image = UploadedImage::from_locator(&entry.url)
            .map_err(|_| ActionError::validation("Failed to load the image into the editor."))?;
        {
            let mut session = self.shared.lock_session();
            session.begin_edit_of(image, Some(entry.prompt.clone()));
            session.history.clear();
            session.generated.dismiss();
            session.variations.dismiss();
        }
        info!(id, "gallery entry loaded into editor");
        Ok(entry)
    }

    /// Writes the current artifact's bytes to `path`.
    pub fn export_current(&self, path: &Path) -> ActionResult<PathBuf> {
        let current = self
            .shared
            .lock_session()
            .history
            .current()
            .cloned()
            .ok_or_else(|| ActionError::validation("There is nothing to export."))?;
        let written = write_artifact(&current, path)
            .map_err(|err| ActionError::local(error_chain_text(&err, 300)))?;
        info!(path = %written.display(), "artifact exported");
        Ok(written)
    }
}

impl Drop for ActionOrchestrator {
    fn drop(&mut self) {
        let token = self.shared.lock_session().video_token.take();
        if let Some(token) = token {
            token.cancel();
        }
        let _ = self.join_video_worker();
        self.join_retired_workers();
    }
}

fn require_prompt(session: &SessionState) -> ActionResult<()> {
    if session.prompt.trim().is_empty() {
        return Err(ActionError::validation("Please enter a prompt."));
    }
    Ok(())
}

fn choose(
    session: &mut SessionState,
    kind: SelectionKind,
    index: usize,
) -> ActionResult<GeneratedImage> {
    let selection = match kind {
        SelectionKind::Generated => &mut session.generated,
        SelectionKind::Variations => &mut session.variations,
    };
    if !selection.is_awaiting() {
        return Err(ActionError::validation(format!(
            "There are no {} images to choose from.",
            kind.as_str()
        )));
    }
    let available = selection.candidates().len();
    selection.choose(index).ok_or_else(|| {
        ActionError::validation(format!(
            "Choose an image between 0 and {}.",
            available.saturating_sub(1)
        ))
    })
}

fn write_artifact(artifact: &Artifact, path: &Path) -> anyhow::Result<PathBuf> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    if artifact.is_image() {
        let image = UploadedImage::from_locator(&artifact.url)?;
        fs::write(path, &image.bytes)?;
    } else {
        fs::copy(&artifact.url, path)?;
    }
    Ok(path.to_path_buf())
}

/// Drives one submitted video job to a terminal state on its own thread.
struct VideoJob {
    shared: Arc<Shared>,
    handle: VideoJobHandle,
    token: CancellationToken,
    epoch: u64,
    label: String,
    caption: String,
    _busy: BusyGuard,
}

impl VideoJob {
    fn run(self) {
        let Some(locator) = self.poll_until_done() else {
            return;
        };
        let saved = self
            .shared
            .client
            .fetch_media(&locator)
            .map_err(ActionError::from)
            .and_then(|media| {
                self.save_media(&media.bytes, &media.mime_type)
                    .map_err(|err| ActionError::transport(&err))
            });

        let committed = {
            let mut session = self.shared.lock_session();
            if self.is_stale(&session) {
                drop(session);
                self.cancelled();
                return;
            }
            match saved {
                Ok(path) => {
                    let artifact = Artifact::video(
                        path.to_string_lossy(),
                        Some(self.caption.clone()).filter(|caption| !caption.is_empty()),
                        self.label.clone(),
                    );
                    let committed =
                        self.shared
                            .commit_locked(&mut session, artifact, Lineage::Replace);
                    session.video.complete();
                    session.video_token = None;
                    committed
                }
                Err(err) => {
                    self.fail_locked(&mut session, &err);
                    return;
                }
            }
        };
        info!(operation = %self.handle.name, "video job completed");
        self.shared.emit(
            EventKind::VideoCompleted,
            json!({ "operation": self.handle.name, "locator": committed.url }),
        );
        self.shared.persist(&committed, &self.caption);
    }

    /// Polls until the job reports a result locator. Returns `None` once the
    /// job failed or was cancelled; both are already recorded.
    fn poll_until_done(&self) -> Option<String> {
        loop {
            if !self
                .shared
                .scheduler
                .wait(self.shared.poll_interval, &self.token)
            {
                self.cancelled();
                return None;
            }
            let status = self.shared.client.poll_video_operation(&self.handle);

            let mut session = self.shared.lock_session();
            if self.is_stale(&session) {
                drop(session);
                self.cancelled();
                return None;
            }
            let status = match status {
                Ok(status) => status,
                Err(err) => {
                    self.fail_locked(&mut session, &ActionError::from(err));
                    return None;
                }
            };
            match session.video.record_status(status) {
                PollStep::Continue => {
                    let message = session.video.message();
                    let polls = session.video.polls();
                    drop(session);
                    debug!(operation = %self.handle.name, polls, "video job still running");
                    self.shared.emit(
                        EventKind::VideoProgress,
                        json!({ "operation": self.handle.name, "message": message, "polls": polls }),
                    );
                }
                PollStep::Download(locator) => return Some(locator),
                PollStep::Fail(message) => {
                    session.last_error = Some(message.clone());
                    session.video_token = None;
                    drop(session);
                    self.failed(&message);
                    return None;
                }
            }
        }
    }

    fn is_stale(&self, session: &SessionState) -> bool {
        self.token.is_cancelled() || session.epoch != self.epoch
    }

    fn save_media(&self, bytes: &[u8], mime_type: &str) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.shared.media_dir)?;
        let path = self.shared.media_dir.join(format!(
            "video-{}.{}",
            chrono::Utc::now().timestamp_millis(),
            extension_for_mime(mime_type)
        ));
        fs::write(&path, bytes)?;
        Ok(path)
    }

    fn fail_locked(&self, session: &mut SessionState, err: &ActionError) {
        let message = err.to_string();
        session.video.fail(message.clone());
        session.last_error = Some(message.clone());
        session.video_token = None;
        self.failed(&message);
    }

    fn failed(&self, message: &str) {
        warn!(operation = %self.handle.name, error = message, "video job failed");
        self.shared.emit(
            EventKind::VideoFailed,
            json!({ "operation": self.handle.name, "message": message }),
        );
    }

    fn cancelled(&self) {
        info!(operation = %self.handle.name, "video job cancelled");
        self.shared.emit(
            EventKind::VideoCancelled,
            json!({ "operation": self.handle.name }),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::mpsc;

    use studio_contracts::artifact::MediaType;
    use studio_contracts::gallery::JsonGalleryStore;
    use studio_contracts::prompt::{AspectRatio, CreateFunction};

    use super::*;
    use crate::client::{MediaBytes, VideoOperationStatus};
    use crate::poller::ImmediateScheduler;
    use crate::transforms::test_png;

    enum Reply<T> {
        Ok(T),
        Service(String),
        Transport(String),
    }

    impl<T> Reply<T> {
        fn into_result(self) -> ClientResult<T> {
            match self {
                Reply::Ok(value) => Ok(value),
                Reply::Service(message) => Err(ClientError::Service(message)),
                Reply::Transport(message) => Err(ClientError::Transport(anyhow::anyhow!(message))),
            }
        }
    }

    /// Replays queued replies; an empty queue is a transport failure.
    #[derive(Default)]
    struct ScriptedClient {
        generated: Mutex<VecDeque<Reply<Vec<GeneratedImage>>>>,
        edits: Mutex<VecDeque<Reply<EditedImage>>>,
        polls: Mutex<VecDeque<Reply<VideoOperationStatus>>>,
        media: Mutex<VecDeque<Reply<MediaBytes>>>,
        prompts: Mutex<Vec<String>>,
        edit_image_counts: Mutex<Vec<usize>>,
        edit_gate: Option<Gate>,
        poll_gate: Option<Gate>,
    }

    /// Signals entry into a call, then blocks it until released.
    type Gate = (Mutex<mpsc::Sender<()>>, Mutex<mpsc::Receiver<()>>);

    fn pass_gate(gate: &Option<Gate>) {
        if let Some((entered, release)) = gate {
            let _ = entered.lock().unwrap_or_else(PoisonError::into_inner).send(());
            let _ = release.lock().unwrap_or_else(PoisonError::into_inner).recv();
        }
    }

    fn pop<T>(queue: &Mutex<VecDeque<Reply<T>>>) -> ClientResult<T> {
        queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| Reply::Transport("no scripted reply".to_string()))
            .into_result()
    }

    impl ScriptedClient {
        fn push_generated(&self, reply: Reply<Vec<GeneratedImage>>) {
            self.generated.lock().unwrap_or_else(PoisonError::into_inner).push_back(reply);
        }

        fn push_edit(&self, reply: Reply<EditedImage>) {
            self.edits.lock().unwrap_or_else(PoisonError::into_inner).push_back(reply);
        }

        fn push_poll(&self, reply: Reply<VideoOperationStatus>) {
            self.polls.lock().unwrap_or_else(PoisonError::into_inner).push_back(reply);
        }

        fn push_media(&self, reply: Reply<MediaBytes>) {
            self.media.lock().unwrap_or_else(PoisonError::into_inner).push_back(reply);
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }

        fn edit_image_counts(&self) -> Vec<usize> {
            self.edit_image_counts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    impl OperationClient for ScriptedClient {
        fn name(&self) -> &str {
            "scripted"
        }

        fn generate_images(
            &self,
            prompt: &str,
            _aspect_ratio: AspectRatio,
            _count: u32,
        ) -> ClientResult<Vec<GeneratedImage>> {
            self.prompts.lock().unwrap_or_else(PoisonError::into_inner).push(prompt.to_string());
            pop(&self.generated)
        }

        fn edit_images(&self, prompt: &str, images: &[UploadedImage]) -> ClientResult<EditedImage> {
            self.prompts.lock().unwrap_or_else(PoisonError::into_inner).push(prompt.to_string());
            self.edit_image_counts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(images.len());
            pass_gate(&self.edit_gate);
            pop(&self.edits)
        }

        fn start_video_generation(
            &self,
            prompt: &str,
            _image: Option<&UploadedImage>,
        ) -> ClientResult<VideoJobHandle> {
            self.prompts.lock().unwrap_or_else(PoisonError::into_inner).push(prompt.to_string());
            Ok(VideoJobHandle {
                name: "operations/test".to_string(),
            })
        }

        fn poll_video_operation(&self, _handle: &VideoJobHandle) -> ClientResult<VideoOperationStatus> {
            pass_gate(&self.poll_gate);
            pop(&self.polls)
        }

        fn fetch_media(&self, _locator: &str) -> ClientResult<MediaBytes> {
            pop(&self.media)
        }
    }

    /// Blocks every wait until the token is cancelled.
    struct BlockingScheduler;

    impl Scheduler for BlockingScheduler {
        fn wait(&self, _interval: Duration, token: &CancellationToken) -> bool {
            while !token.wait_timeout(Duration::from_secs(60)) {}
            false
        }
    }

    struct FailingGallery;

    impl GalleryStore for FailingGallery {
        fn list(&mut self) -> anyhow::Result<Vec<GalleryEntry>> {
            Ok(Vec::new())
        }
        fn get(&mut self, _id: &str) -> anyhow::Result<Option<GalleryEntry>> {
            Ok(None)
        }
        fn upsert(&mut self, _entry: GalleryEntry) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
        fn delete(&mut self, _id: &str) -> anyhow::Result<bool> {
            Ok(false)
        }
        fn update_tags(&mut self, _id: &str, _tags: &[String]) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    struct Harness {
        _temp: tempfile::TempDir,
        root: PathBuf,
        client: Arc<ScriptedClient>,
        orchestrator: ActionOrchestrator,
    }

    impl Harness {
        fn build(client: ScriptedClient, scheduler: Arc<dyn Scheduler>) -> anyhow::Result<Self> {
            let temp = tempfile::tempdir()?;
            let root = temp.path().to_path_buf();
            let client = Arc::new(client);
            let orchestrator = ActionOrchestrator::new(
                client.clone(),
                Box::new(JsonGalleryStore::new(root.join("gallery.json"))),
                EventWriter::new(root.join("events.jsonl"), "session-test"),
                OrchestratorOptions::new(root.join("media"))
                    .with_poll_interval(Duration::ZERO)
                    .with_scheduler(scheduler),
            );
            Ok(Self {
                _temp: temp,
                root,
                client,
                orchestrator,
            })
        }

        fn new() -> anyhow::Result<Self> {
            Self::build(ScriptedClient::default(), Arc::new(ImmediateScheduler))
        }

        fn gallery_len(&self) -> anyhow::Result<usize> {
            Ok(self.orchestrator.with_gallery(|store| store.list())?.len())
        }

        fn event_types(&self) -> anyhow::Result<Vec<String>> {
            let raw = fs::read_to_string(self.root.join("events.jsonl"))?;
            raw.lines()
                .map(|line| {
                    let event: Value = serde_json::from_str(line)?;
                    Ok(event["type"].as_str().unwrap_or_default().to_string())
                })
                .collect()
        }

        fn labels(&self) -> Vec<String> {
            self.orchestrator
                .snapshot()
                .history
                .items()
                .iter()
                .map(|item| item.action_label.clone())
                .collect()
        }

        fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
            self.orchestrator
                .with_session(|session| session.apply_setting(key, value))?;
            Ok(())
        }

        /// Commits `labels` as one lineage via create + edits.
        fn seed_history(&self, labels: &[&str]) -> anyhow::Result<()> {
            self.orchestrator.with_session(|session| {
                session.history.clear();
                for (idx, label) in labels.iter().enumerate() {
                    let png = test_png(4, 4, [idx as u8 * 40, 10, 10, 255]);
                    session
                        .history
                        .append(Artifact::image(png.to_data_uri(), None, *label));
                }
            });
            Ok(())
        }
    }

    fn png_image(seed: u8) -> GeneratedImage {
        let png = test_png(6, 4, [seed, seed, seed, 255]);
        GeneratedImage {
            base64: png.base64,
            mime_type: "image/png".to_string(),
        }
    }

    fn edited(seed: u8) -> Reply<EditedImage> {
        Reply::Ok(EditedImage {
            image: png_image(seed),
            caption: Some(format!("caption {seed}")),
        })
    }

    fn done(locator: Option<&str>) -> Reply<VideoOperationStatus> {
        Reply::Ok(VideoOperationStatus {
            done: true,
            result_locator: locator.map(str::to_string),
            error: None,
        })
    }

    #[test]
    fn single_create_replaces_history_and_saves_to_gallery() -> anyhow::Result<()> {
        let h = Harness::new()?;
        h.seed_history(&["Old", "Older"])?;
        h.set("prompt", "a red fox")?;
        h.set("negative_prompt", "blurry, text")?;
        h.client.push_generated(Reply::Ok(vec![png_image(1)]));

        let outcome = h.orchestrator.dispatch(Action::Generate)?;
        assert!(matches!(outcome, ActionOutcome::Committed(ref artifact) if artifact.action_label == "Create"));
        assert_eq!(h.labels(), vec!["Create"]);
        assert_eq!(h.orchestrator.snapshot().history.cursor(), Some(0));
        assert_eq!(h.client.prompts(), vec!["a red fox. Avoid the following: blurry, text."]);

        let entries = h.orchestrator.with_gallery(|store| store.list())?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].prompt, "a red fox");
        assert_eq!(entries[0].creation_mode, "Create");
        assert!(h.event_types()?.contains(&"artifact_committed".to_string()));
        assert!(!h.orchestrator.is_busy());
        Ok(())
    }

    #[test]
    fn multi_create_waits_for_a_pick() -> anyhow::Result<()> {
        let h = Harness::new()?;
        h.set("prompt", "a lighthouse")?;
        h.set("create_function", "sticker")?;
        h.set("image_count", "3")?;
        h.client
            .push_generated(Reply::Ok(vec![png_image(1), png_image(2), png_image(3)]));

        let outcome = h.orchestrator.dispatch(Action::Generate)?;
        assert_eq!(
            outcome,
            ActionOutcome::AwaitingSelection {
                kind: SelectionKind::Generated,
                count: 3
            }
        );
        assert!(h.orchestrator.snapshot().history.is_empty());
        assert_eq!(h.gallery_len()?, 0);

        assert!(matches!(
            h.orchestrator.dispatch(Action::PickGenerated(7)),
            Err(ActionError::Validation(_))
        ));
        assert_eq!(h.orchestrator.snapshot().generated.candidates().len(), 3);

        let picked = h.orchestrator.dispatch(Action::PickGenerated(1))?;
        let ActionOutcome::Committed(artifact) = picked else {
            anyhow::bail!("expected a committed artifact");
        };
        assert_eq!(artifact.url, png_image(2).data_uri());
        assert_eq!(h.labels(), vec!["Sticker"]);
        assert!(!h.orchestrator.snapshot().generated.is_awaiting());
        assert_eq!(h.gallery_len()?, 1);
        Ok(())
    }

    #[test]
    fn compose_with_one_image_is_rejected_before_any_call() -> anyhow::Result<()> {
        let h = Harness::new()?;
        h.seed_history(&["A"])?;
        h.set("mode", "edit")?;
        h.set("edit_function", "compose")?;
        h.set("prompt", "put the cat on the sofa")?;
        h.orchestrator
            .stage_image(&test_png(4, 4, [1, 1, 1, 255]).to_data_uri(), false)?;

        let err = h.orchestrator.dispatch(Action::Generate);
        assert_eq!(
            err,
            Err(ActionError::Validation(
                "A second image is required for compose.".to_string()
            ))
        );
        assert!(h.client.prompts().is_empty());
        assert_eq!(h.labels(), vec!["A"]);
        assert_eq!(h.gallery_len()?, 0);
        assert_eq!(
            h.orchestrator.snapshot().last_error.as_deref(),
            Some("A second image is required for compose.")
        );
        assert!(h.event_types()?.contains(&"action_failed".to_string()));
        Ok(())
    }

    #[test]
    fn edit_appends_and_discards_redo_tail() -> anyhow::Result<()> {
        let h = Harness::new()?;
        h.seed_history(&["A", "B", "C"])?;
        h.orchestrator.jump_to(1);
        h.set("mode", "edit")?;
        h.set("prompt", "add a hat")?;
        h.orchestrator
            .stage_image(&test_png(4, 4, [1, 1, 1, 255]).to_data_uri(), false)?;
        h.client.push_edit(edited(9));

        h.orchestrator.dispatch(Action::Generate)?;
        assert_eq!(h.labels(), vec!["A", "B", "Add/Remove"]);
        assert_eq!(h.orchestrator.snapshot().history.cursor(), Some(2));
        Ok(())
    }

    #[test]
    fn create_with_reference_edits_then_replaces_history() -> anyhow::Result<()> {
        let h = Harness::new()?;
        h.seed_history(&["A", "B"])?;
        h.set("prompt", "a fox in snow")?;
        h.orchestrator
            .stage_image(&test_png(4, 4, [9, 9, 9, 255]).to_data_uri(), false)?;
        h.client.push_edit(edited(4));

        let outcome = h.orchestrator.dispatch(Action::Generate)?;
        let ActionOutcome::Committed(artifact) = outcome else {
            anyhow::bail!("expected a committed artifact");
        };
        assert_eq!(artifact.url, png_image(4).data_uri());
        assert_eq!(artifact.caption.as_deref(), Some("caption 4"));
        assert_eq!(h.labels(), vec!["Create"]);
        assert_eq!(h.orchestrator.snapshot().history().cursor(), Some(0));
        assert_eq!(
            h.client.prompts(),
            vec!["Generate a new image inspired by the following prompt and reference image: \"a fox in snow\""]
        );
        assert_eq!(h.client.edit_image_counts(), vec![1]);

        let entries = h.orchestrator.with_gallery(|store| store.list())?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].prompt, "a fox in snow");
        Ok(())
    }

    #[test]
    fn realistic_compose_sends_both_images_and_appends() -> anyhow::Result<()> {
        let h = Harness::new()?;
        h.seed_history(&["A"])?;
        h.set("mode", "edit")?;
        h.set("edit_function", "compose")?;
        h.set("compose_realistic", "on")?;
        h.set("prompt", "put the cat on the sofa")?;
        h.set("negative_prompt", "blurry")?;
        h.orchestrator
            .stage_image(&test_png(4, 4, [1, 1, 1, 255]).to_data_uri(), false)?;
        h.orchestrator
            .stage_image(&test_png(4, 4, [2, 2, 2, 255]).to_data_uri(), true)?;
        h.client.push_edit(edited(7));

        h.orchestrator.dispatch(Action::Generate)?;
        assert_eq!(h.labels(), vec!["A", "Compose (Realistic)"]);
        assert_eq!(h.client.edit_image_counts(), vec![2]);

        let prompts = h.client.prompts();
        let [prompt] = prompts.as_slice() else {
            anyhow::bail!("expected exactly one edit call");
        };
        assert!(prompt.starts_with("Combine the two provided images."));
        assert!(prompt.contains("\"put the cat on the sofa\""));
        let realism = prompt.find("ultra-realistic");
        let negative = prompt.find("Avoid the following: blurry.");
        assert!(matches!((realism, negative), (Some(r), Some(n)) if r < n));
        assert!(prompt.ends_with("Avoid the following: blurry."));
        Ok(())
    }

    #[test]
    fn service_error_leaves_history_untouched() -> anyhow::Result<()> {
        let h = Harness::new()?;
        h.seed_history(&["A"])?;
        h.client
            .push_edit(Reply::Service("The image could not be edited. refused".to_string()));

        let err = h.orchestrator.dispatch(Action::Upscale);
        assert!(matches!(err, Err(ActionError::Service(ref message)) if message.ends_with("refused")));
        assert_eq!(h.labels(), vec!["A"]);

        h.client.push_edit(Reply::Transport("connection reset".to_string()));
        let err = h.orchestrator.dispatch(Action::ApplyStyle(ArtisticStyle::Cyberpunk));
        assert!(matches!(err, Err(ActionError::Transport(_))));
        assert_eq!(h.labels(), vec!["A"]);
        Ok(())
    }

    #[test]
    fn post_hoc_actions_append_labelled_results() -> anyhow::Result<()> {
        let h = Harness::new()?;
        h.seed_history(&["A"])?;
        h.set("prompt", "portrait")?;
        h.client.push_edit(edited(2));
        h.client.push_edit(edited(3));

        h.orchestrator.dispatch(Action::Upscale)?;
        h.orchestrator
            .dispatch(Action::ApplyStyle(ArtisticStyle::PopArt))?;
        h.orchestrator
            .dispatch(Action::ApplyFilter(VisualFilter::Grayscale))?;
        h.orchestrator
            .dispatch(Action::Crop(CropRect::new(1.0, 1.0, 2.0, 2.0)))?;
        assert_eq!(
            h.labels(),
            vec!["A", "Upscale", "Style Pop Art", "Filter Grayscale", "Crop"]
        );
        assert_eq!(
            h.client.prompts(),
            vec![
                UPSCALE_INSTRUCTION.to_string(),
                style_transfer_instruction(ArtisticStyle::PopArt)
            ]
        );

        let snapshot = h.orchestrator.snapshot();
        let current = snapshot.history.current().cloned();
        assert_eq!(current.and_then(|item| item.caption), Some("caption 3".to_string()));

        let prompts: Vec<String> = h
            .orchestrator
            .with_gallery(|store| store.list())?
            .into_iter()
            .map(|entry| entry.prompt)
            .collect();
        assert_eq!(prompts[0], "portrait (Crop)");
        assert_eq!(prompts[3], "portrait (Upscale)");

        assert!(matches!(
            h.orchestrator.dispatch(Action::ApplyStyle(ArtisticStyle::None)),
            Err(ActionError::Validation(_))
        ));
        Ok(())
    }

    #[test]
    fn crop_outside_the_image_is_a_local_transform_error() -> anyhow::Result<()> {
        let h = Harness::new()?;
        h.seed_history(&["A"])?;
        let err = h
            .orchestrator
            .dispatch(Action::Crop(CropRect::new(50.0, 50.0, 5.0, 5.0)));
        assert!(matches!(err, Err(ActionError::LocalTransform(_))));
        assert_eq!(h.labels(), vec!["A"]);
        Ok(())
    }

    #[test]
    fn one_failed_variation_fails_the_whole_batch() -> anyhow::Result<()> {
        let h = Harness::new()?;
        h.seed_history(&["A", "B"])?;
        h.client.push_edit(edited(1));
        h.client.push_edit(Reply::Service("The image could not be edited.".to_string()));
        h.client.push_edit(edited(3));

        let err = h.orchestrator.dispatch(Action::GenerateVariations);
        assert!(matches!(err, Err(ActionError::Service(_))));
        let snapshot = h.orchestrator.snapshot();
        assert!(snapshot.variations.candidates().is_empty());
        assert_eq!(h.labels(), vec!["A", "B"]);
        assert_eq!(h.client.prompts().len(), VARIATION_COUNT);
        Ok(())
    }

    #[test]
    fn variations_are_offered_then_one_is_appended() -> anyhow::Result<()> {
        let h = Harness::new()?;
        h.seed_history(&["A"])?;
        h.set("prompt", "castle")?;
        for seed in 1..=3 {
            h.client.push_edit(edited(seed));
        }

        let outcome = h.orchestrator.dispatch(Action::GenerateVariations)?;
        assert_eq!(
            outcome,
            ActionOutcome::AwaitingSelection {
                kind: SelectionKind::Variations,
                count: VARIATION_COUNT
            }
        );
        assert_eq!(h.labels(), vec!["A"]);

        h.orchestrator.dispatch(Action::PickVariation(0))?;
        assert_eq!(h.labels(), vec!["A", "Variation"]);
        assert!(!h.orchestrator.snapshot().variations.is_awaiting());
        let entries = h.orchestrator.with_gallery(|store| store.list())?;
        assert_eq!(entries[0].prompt, "castle (Variation)");
        Ok(())
    }

    #[test]
    fn dismiss_clears_pending_candidates() -> anyhow::Result<()> {
        let h = Harness::new()?;
        h.set("prompt", "boats")?;
        h.set("image_count", "2")?;
        h.client.push_generated(Reply::Ok(vec![png_image(1), png_image(2)]));
        h.orchestrator.dispatch(Action::Generate)?;

        h.orchestrator.dismiss_selection();
        assert!(!h.orchestrator.snapshot().generated.is_awaiting());
        assert!(matches!(
            h.orchestrator.dispatch(Action::PickGenerated(0)),
            Err(ActionError::Validation(_))
        ));
        assert!(h.event_types()?.contains(&"selection_dismissed".to_string()));
        Ok(())
    }

    #[test]
    fn completed_video_replaces_image_history() -> anyhow::Result<()> {
        let h = Harness::new()?;
        h.seed_history(&["A", "B"])?;
        h.set("mode", "video")?;
        h.set("style", "cyberpunk")?;
        h.set("prompt", "rain on neon streets")?;
        h.client.push_poll(Reply::Ok(VideoOperationStatus::default()));
        h.client.push_poll(Reply::Ok(VideoOperationStatus::default()));
        h.client.push_poll(done(Some("https://files/v.mp4")));
        h.client.push_media(Reply::Ok(MediaBytes {
            bytes: b"mp4-bytes".to_vec(),
            mime_type: "video/mp4".to_string(),
        }));

        let outcome = h.orchestrator.dispatch(Action::Generate)?;
        assert_eq!(
            outcome,
            ActionOutcome::VideoSubmitted {
                operation: "operations/test".to_string()
            }
        );
        assert_eq!(h.orchestrator.wait_for_video()?, PollerState::Completed);

        let snapshot = h.orchestrator.snapshot();
        assert_eq!(snapshot.history.len(), 1);
        assert_eq!(snapshot.history.cursor(), Some(0));
        let video = snapshot.history.current().cloned();
        let Some(video) = video else {
            anyhow::bail!("expected a video artifact");
        };
        assert_eq!(video.media_type, MediaType::Video);
        assert_eq!(video.action_label, "Video (Cyberpunk)");
        assert!(video.url.ends_with(".mp4"));
        assert_eq!(fs::read(&video.url)?, b"mp4-bytes".to_vec());
        assert!(!snapshot.video.is_in_flight());
        assert_eq!(
            h.client.prompts(),
            vec!["rain on neon streets, in the style of Cyberpunk"]
        );

        let types = h.event_types()?;
        assert_eq!(
            types.iter().filter(|kind| *kind == "video_progress").count(),
            2
        );
        assert!(types.contains(&"video_completed".to_string()));
        assert_eq!(h.gallery_len()?, 1);
        assert!(!h.orchestrator.is_busy());
        Ok(())
    }

    #[test]
    fn video_without_result_fails_and_keeps_history() -> anyhow::Result<()> {
        let h = Harness::new()?;
        h.seed_history(&["A"])?;
        h.set("mode", "video")?;
        h.set("prompt", "waves")?;
        h.client.push_poll(done(None));

        h.orchestrator.dispatch(Action::Generate)?;
        let state = h.orchestrator.wait_for_video()?;
        assert!(matches!(state, PollerState::Failed(_)));
        let snapshot = h.orchestrator.snapshot();
        assert_eq!(h.labels(), vec!["A"]);
        assert!(!snapshot.video.is_in_flight());
        assert!(snapshot.last_error.is_some());
        assert!(h.event_types()?.contains(&"video_failed".to_string()));

        // The slot is free again.
        h.client.push_poll(Reply::Transport("status check failed".to_string()));
        h.orchestrator.dispatch(Action::Generate)?;
        assert!(matches!(h.orchestrator.wait_for_video()?, PollerState::Failed(_)));
        Ok(())
    }

    #[test]
    fn status_check_transport_error_fails_the_job() -> anyhow::Result<()> {
        let h = Harness::new()?;
        h.seed_history(&["A", "B"])?;
        h.set("mode", "video")?;
        h.set("prompt", "tides")?;
        h.client.push_poll(Reply::Ok(VideoOperationStatus::default()));
        h.client.push_poll(Reply::Transport("connection reset by peer".to_string()));

        h.orchestrator.dispatch(Action::Generate)?;
        let state = h.orchestrator.wait_for_video()?;
        assert!(matches!(state, PollerState::Failed(_)));

        let snapshot = h.orchestrator.snapshot();
        assert_eq!(h.labels(), vec!["A", "B"]);
        assert_eq!(snapshot.history().cursor(), Some(1));
        assert!(!snapshot.video().is_in_flight());
        assert!(snapshot.video_token.is_none());
        assert!(snapshot.last_error().is_some());
        assert!(!h.orchestrator.is_busy());
        assert_eq!(h.gallery_len()?, 0);

        let types = h.event_types()?;
        assert!(types.contains(&"video_failed".to_string()));
        assert!(!types.contains(&"video_completed".to_string()));
        Ok(())
    }

    #[test]
    fn download_failure_fails_the_job() -> anyhow::Result<()> {
        let h = Harness::new()?;
        h.set("mode", "video")?;
        h.set("prompt", "waves")?;
        h.client.push_poll(done(Some("https://files/v.mp4")));
        h.client.push_media(Reply::Transport("404 Not Found".to_string()));

        h.orchestrator.dispatch(Action::Generate)?;
        assert!(matches!(h.orchestrator.wait_for_video()?, PollerState::Failed(_)));
        assert!(h.orchestrator.snapshot().history.is_empty());
        Ok(())
    }

    #[test]
    fn running_video_blocks_other_actions_until_reset() -> anyhow::Result<()> {
        let h = Harness::build(ScriptedClient::default(), Arc::new(BlockingScheduler))?;
        h.seed_history(&["A"])?;
        h.set("mode", "video")?;
        h.set("prompt", "fireworks")?;

        h.orchestrator.dispatch(Action::Generate)?;
        assert!(h.orchestrator.is_busy());
        assert_eq!(h.orchestrator.dispatch(Action::Upscale), Err(ActionError::Busy));
        assert_eq!(h.orchestrator.dispatch(Action::Generate), Err(ActionError::Busy));

        h.orchestrator.reset();
        let snapshot = h.orchestrator.snapshot();
        assert!(snapshot.history.is_empty());
        assert!(snapshot.prompt.is_empty());
        assert!(!snapshot.video.is_in_flight());
        assert_eq!(snapshot.video.state(), &PollerState::Idle);
        assert!(!h.orchestrator.is_busy());

        h.orchestrator.join_retired_workers();
        let types = h.event_types()?;
        assert!(types.contains(&"video_cancelled".to_string()));
        assert!(types.contains(&"session_reset".to_string()));
        assert!(!types.contains(&"video_completed".to_string()));
        Ok(())
    }

    #[test]
    fn reset_returns_while_a_status_check_is_still_running() -> anyhow::Result<()> {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let client = ScriptedClient {
            poll_gate: Some((Mutex::new(entered_tx), Mutex::new(release_rx))),
            ..ScriptedClient::default()
        };
        let h = Harness::build(client, Arc::new(ImmediateScheduler))?;
        h.seed_history(&["A"])?;
        h.set("mode", "video")?;
        h.set("prompt", "comets")?;
        h.client.push_poll(done(Some("https://files/late.mp4")));
        h.client.push_media(Reply::Ok(MediaBytes {
            bytes: b"late".to_vec(),
            mime_type: "video/mp4".to_string(),
        }));

        h.orchestrator.dispatch(Action::Generate)?;
        entered_rx.recv_timeout(Duration::from_secs(10))?;

        // The status check is still blocked here.
        h.orchestrator.reset();
        assert!(!h.orchestrator.is_busy());
        h.set("mode", "create")?;
        h.set("prompt", "a quiet lake")?;
        h.client.push_generated(Reply::Ok(vec![png_image(6)]));
        h.orchestrator.dispatch(Action::Generate)?;
        assert_eq!(h.labels(), vec!["Create"]);

        release_tx.send(())?;
        h.orchestrator.join_retired_workers();
        assert_eq!(h.labels(), vec!["Create"]);
        assert!(!h.orchestrator.is_busy());
        assert_eq!(h.gallery_len()?, 1);
        let types = h.event_types()?;
        assert!(types.contains(&"video_cancelled".to_string()));
        assert!(!types.contains(&"video_completed".to_string()));
        Ok(())
    }

    #[test]
    fn stale_video_guard_does_not_release_a_later_action() -> anyhow::Result<()> {
        let h = Harness::build(ScriptedClient::default(), Arc::new(BlockingScheduler))?;
        h.set("mode", "video")?;
        h.set("prompt", "fireworks")?;
        h.orchestrator.dispatch(Action::Generate)?;
        h.orchestrator.reset();

        let held = BusyGuard::acquire(&h.orchestrator.busy)?;
        h.orchestrator.join_retired_workers();
        assert!(h.orchestrator.is_busy());
        assert_eq!(h.orchestrator.dispatch(Action::Upscale), Err(ActionError::Busy));
        drop(held);
        assert!(!h.orchestrator.is_busy());
        Ok(())
    }

    #[test]
    fn reset_discards_result_of_in_flight_edit() -> anyhow::Result<()> {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let client = ScriptedClient {
            edit_gate: Some((Mutex::new(entered_tx), Mutex::new(release_rx))),
            ..ScriptedClient::default()
        };
        let h = Harness::build(client, Arc::new(ImmediateScheduler))?;
        h.seed_history(&["A"])?;
        h.set("prompt", "sky")?;
        h.client.push_edit(edited(5));

        let result = thread::scope(|scope| {
            let running = scope.spawn(|| h.orchestrator.dispatch(Action::Upscale));
            let _ = entered_rx.recv();
            h.orchestrator.reset();
            let _ = release_tx.send(());
            running.join()
        });
        assert_eq!(result.ok(), Some(Err(ActionError::Cancelled)));
        assert!(h.orchestrator.snapshot().history.is_empty());
        assert_eq!(h.gallery_len()?, 0);
        Ok(())
    }

    #[test]
    fn gallery_failures_do_not_fail_the_action() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let client = Arc::new(ScriptedClient::default());
        client.push_generated(Reply::Ok(vec![png_image(4)]));
        let orchestrator = ActionOrchestrator::new(
            client,
            Box::new(FailingGallery),
            EventWriter::new(temp.path().join("events.jsonl"), "session-test"),
            OrchestratorOptions::new(temp.path().join("media")),
        );
        orchestrator.with_session(|session| session.prompt = "dunes".to_string());

        orchestrator.dispatch(Action::Generate)?;
        assert_eq!(orchestrator.snapshot().history.len(), 1);
        let events = fs::read_to_string(temp.path().join("events.jsonl"))?;
        assert!(events.contains("gallery_persist_failed"));
        Ok(())
    }

    #[test]
    fn navigation_moves_cursor_and_logs() -> anyhow::Result<()> {
        let h = Harness::new()?;
        h.seed_history(&["A", "B", "C"])?;
        assert_eq!(h.orchestrator.undo().map(|item| item.action_label), Some("B".to_string()));
        assert_eq!(h.orchestrator.undo().map(|item| item.action_label), Some("A".to_string()));
        assert_eq!(h.orchestrator.undo().map(|item| item.action_label), Some("A".to_string()));
        assert_eq!(h.orchestrator.redo().map(|item| item.action_label), Some("B".to_string()));
        assert_eq!(h.orchestrator.jump_to(3).map(|item| item.action_label), Some("B".to_string()));
        assert_eq!(h.orchestrator.jump_to(2).map(|item| item.action_label), Some("C".to_string()));
        let navigations = h
            .event_types()?
            .into_iter()
            .filter(|kind| kind == "history_navigated")
            .count();
        assert_eq!(navigations, 6);
        Ok(())
    }

    #[test]
    fn edit_current_and_gallery_load_stage_inputs() -> anyhow::Result<()> {
        let h = Harness::new()?;
        h.set("prompt", "owl")?;
        h.client.push_generated(Reply::Ok(vec![png_image(8)]));
        h.orchestrator.dispatch(Action::Generate)?;

        h.orchestrator.edit_current()?;
        let snapshot = h.orchestrator.snapshot();
        assert_eq!(snapshot.mode, Mode::Edit);
        assert_eq!(snapshot.edit_function, EditFunction::AddRemove);
        assert!(snapshot.prompt.is_empty());
        assert!(snapshot.primary_image.is_some());
        assert_eq!(snapshot.history.len(), 1);

        let id = h.orchestrator.with_gallery(|store| store.list())?[0].id.clone();
        h.orchestrator.with_session(|session| {
            session.mode = Mode::Create;
            session.create_function = CreateFunction::Logo;
        });
        let entry = h.orchestrator.load_gallery_entry(&id)?;
        let snapshot = h.orchestrator.snapshot();
        assert_eq!(snapshot.prompt, entry.prompt);
        assert_eq!(snapshot.mode, Mode::Edit);
        assert!(snapshot.history.is_empty());
        assert!(matches!(
            h.orchestrator.load_gallery_entry("missing"),
            Err(ActionError::Validation(_))
        ));
        Ok(())
    }

    #[test]
    fn export_writes_current_image_bytes() -> anyhow::Result<()> {
        let h = Harness::new()?;
        assert!(h.orchestrator.export_current(&h.root.join("none.png")).is_err());

        h.seed_history(&["A"])?;
        let path = h.root.join("exports").join("current.png");
        let written = h.orchestrator.export_current(&path)?;
        let decoded = image::load_from_memory(&fs::read(&written)?)?;
        assert_eq!((decoded.width(), decoded.height()), (4, 4));
        Ok(())
    }
}
