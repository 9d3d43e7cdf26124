use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const GALLERY_STORAGE_KEY: &str = "ai-image-studio-gallery";
pub const GALLERY_SCHEMA_VERSION: u64 = 1;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GalleryEntry {
    pub id: String,
    pub url: String,
    pub prompt: String,
    pub created_at: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub creation_mode: String,
}

impl GalleryEntry {
    pub fn new(
        url: impl Into<String>,
        prompt: impl Into<String>,
        creation_mode: impl Into<String>,
    ) -> Self {
        let created_at = chrono::Utc::now().timestamp_millis();
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            id: format!("img-{created_at}-{}", &suffix[..9]),
            url: url.into(),
            prompt: prompt.into(),
            created_at,
            tags: Vec::new(),
            creation_mode: creation_mode.into(),
        }
    }
}

/// Durable archive of produced artifacts, independent of session history.
pub trait GalleryStore: Send {
    /// Newest first.
    fn list(&mut self) -> anyhow::Result<Vec<GalleryEntry>>;
    fn get(&mut self, id: &str) -> anyhow::Result<Option<GalleryEntry>>;
    /// Inserts at the front, or replaces in place when the id already exists.
    fn upsert(&mut self, entry: GalleryEntry) -> anyhow::Result<()>;
    fn delete(&mut self, id: &str) -> anyhow::Result<bool>;
    fn update_tags(&mut self, id: &str, tags: &[String]) -> anyhow::Result<bool>;
}

/// Gallery persisted as one JSON document.
///
/// The document is an object; the gallery lives under
/// [`GALLERY_STORAGE_KEY`] as `{ "schema_version": 1, "entries": [...] }`.
/// Other keys in the document are preserved on write. Every operation
/// re-reads the file so separate handles see each other's writes.
#[derive(Debug, Clone)]
pub struct JsonGalleryStore {
    path: PathBuf,
    entries: IndexMap<String, GalleryEntry>,
}

impl JsonGalleryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: IndexMap::new(),
        }
    }

    fn refresh(&mut self) {
        self.entries = read_json_object(&self.path)
            .and_then(|mut doc| doc.remove(GALLERY_STORAGE_KEY))
            .map(parse_gallery_payload)
            .unwrap_or_default();
    }

    fn flush(&self) -> anyhow::Result<()> {
        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        let entries = self
            .entries
            .values()
            .map(serde_json::to_value)
            .collect::<Result<Vec<Value>, _>>()
            .context("gallery entry serialization failed")?;
        let mut payload = Map::new();
        payload.insert(
            "schema_version".to_string(),
            Value::Number(GALLERY_SCHEMA_VERSION.into()),
        );
        payload.insert("entries".to_string(), Value::Array(entries));
        on_disk.insert(GALLERY_STORAGE_KEY.to_string(), Value::Object(payload));
        write_json_object(&self.path, &on_disk)
    }
}

impl GalleryStore for JsonGalleryStore {
    fn list(&mut self) -> anyhow::Result<Vec<GalleryEntry>> {
        self.refresh();
        Ok(self.entries.values().cloned().collect())
    }

    fn get(&mut self, id: &str) -> anyhow::Result<Option<GalleryEntry>> {
        self.refresh();
        Ok(self.entries.get(id).cloned())
    }

    fn upsert(&mut self, entry: GalleryEntry) -> anyhow::Result<()> {
        self.refresh();
        if let Some(existing) = self.entries.get_mut(&entry.id) {
            *existing = entry;
        } else {
            self.entries.shift_insert(0, entry.id.clone(), entry);
        }
        self.flush()
    }

    fn delete(&mut self, id: &str) -> anyhow::Result<bool> {
        self.refresh();
        if self.entries.shift_remove(id).is_none() {
            return Ok(false);
        }
        self.flush()?;
        Ok(true)
    }

    fn update_tags(&mut self, id: &str, tags: &[String]) -> anyhow::Result<bool> {
        self.refresh();
        let Some(entry) = self.entries.get_mut(id) else {
            return Ok(false);
        };
        entry.tags = normalize_tags(tags);
        self.flush()?;
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DateWindow {
    #[default]
    Any,
    Today,
    Week,
    Month,
}

impl DateWindow {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "any" | "" => Some(DateWindow::Any),
            "today" | "day" => Some(DateWindow::Today),
            "week" => Some(DateWindow::Week),
            "month" => Some(DateWindow::Month),
            _ => None,
        }
    }

    fn span_ms(self) -> Option<i64> {
        match self {
            DateWindow::Any => None,
            DateWindow::Today => Some(DAY_MS),
            DateWindow::Week => Some(7 * DAY_MS),
            DateWindow::Month => Some(30 * DAY_MS),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GalleryFilter {
    pub search: String,
    pub mode: Option<String>,
    pub date: DateWindow,
    pub tags: Vec<String>,
}

impl GalleryFilter {
    pub fn is_active(&self) -> bool {
        !self.search.trim().is_empty()
            || self.mode.is_some()
            || self.date != DateWindow::Any
            || !self.tags.is_empty()
    }

    pub fn matches(&self, entry: &GalleryEntry, now_ms: i64) -> bool {
        let term = self.search.trim().to_lowercase();
        if !term.is_empty()
            && !entry.prompt.to_lowercase().contains(&term)
            && !entry
                .tags
                .iter()
                .any(|tag| tag.to_lowercase().contains(&term))
        {
            return false;
        }
        if let Some(mode) = &self.mode {
            if &entry.creation_mode != mode {
                return false;
            }
        }
        if let Some(span) = self.date.span_ms() {
            if now_ms - entry.created_at >= span {
                return false;
            }
        }
        self.tags.iter().all(|tag| entry.tags.contains(tag))
    }

    pub fn apply(&self, entries: &[GalleryEntry], now_ms: i64) -> Vec<GalleryEntry> {
        entries
            .iter()
            .filter(|entry| self.matches(entry, now_ms))
            .cloned()
            .collect()
    }
}

pub fn all_tags(entries: &[GalleryEntry]) -> Vec<String> {
    entries
        .iter()
        .flat_map(|entry| entry.tags.iter().cloned())
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect()
}

pub fn all_modes(entries: &[GalleryEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| entry.creation_mode.clone())
        .filter(|mode| !mode.is_empty())
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect()
}

/// Trims, drops blanks and removes duplicates, keeping first-seen order.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let trimmed = tag.trim();
        if trimmed.is_empty() || out.iter().any(|existing| existing == trimmed) {
            continue;
        }
        out.push(trimmed.to_string());
    }
    out
}

fn parse_gallery_payload(payload: Value) -> IndexMap<String, GalleryEntry> {
    let mut entries = IndexMap::new();
    let rows = match payload {
        // Documents written before the schema envelope existed were a bare array.
        Value::Array(rows) => rows,
        Value::Object(mut obj) => match obj.remove("entries") {
            Some(Value::Array(rows)) => rows,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    for row in rows {
        if let Ok(entry) = serde_json::from_value::<GalleryEntry>(row) {
            entries.entry(entry.id.clone()).or_insert(entry);
        }
    }
    entries
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}
