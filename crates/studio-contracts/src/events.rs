use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Every event type a session writes to `events.jsonl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SessionStarted,
    ActionStarted,
    ActionFailed,
    ArtifactCommitted,
    SelectionOffered,
    SelectionResolved,
    SelectionDismissed,
    VideoSubmitted,
    VideoProgress,
    VideoCompleted,
    VideoFailed,
    VideoCancelled,
    GalleryPersistFailed,
    SessionReset,
    HistoryNavigated,
}

impl EventKind {
    pub const ALL: [EventKind; 15] = [
        EventKind::SessionStarted,
        EventKind::ActionStarted,
        EventKind::ActionFailed,
        EventKind::ArtifactCommitted,
        EventKind::SelectionOffered,
        EventKind::SelectionResolved,
        EventKind::SelectionDismissed,
        EventKind::VideoSubmitted,
        EventKind::VideoProgress,
        EventKind::VideoCompleted,
        EventKind::VideoFailed,
        EventKind::VideoCancelled,
        EventKind::GalleryPersistFailed,
        EventKind::SessionReset,
        EventKind::HistoryNavigated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::SessionStarted => "session_started",
            EventKind::ActionStarted => "action_started",
            EventKind::ActionFailed => "action_failed",
            EventKind::ArtifactCommitted => "artifact_committed",
            EventKind::SelectionOffered => "selection_offered",
            EventKind::SelectionResolved => "selection_resolved",
            EventKind::SelectionDismissed => "selection_dismissed",
            EventKind::VideoSubmitted => "video_submitted",
            EventKind::VideoProgress => "video_progress",
            EventKind::VideoCompleted => "video_completed",
            EventKind::VideoFailed => "video_failed",
            EventKind::VideoCancelled => "video_cancelled",
            EventKind::GalleryPersistFailed => "gallery_persist_failed",
            EventKind::SessionReset => "session_reset",
            EventKind::HistoryNavigated => "history_navigated",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only writer for `events.jsonl`.
///
/// - default fields are `type`, `session_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    /// Writer for a fresh session; ids are `session-<uuid>`.
    pub fn for_new_session(path: impl Into<PathBuf>) -> Self {
        Self::new(path, format!("session-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn emit(&self, kind: EventKind, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(kind.as_str().to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
