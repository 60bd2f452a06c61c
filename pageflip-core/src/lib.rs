use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{NaiveDateTime, Utc};
use directories::ProjectDirs;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Decoded image payload for one page tier, as handed over by the backend.
#[derive(Debug, Clone)]
pub struct ImageBitmap {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl ImageBitmap {
    pub fn is_landscape(&self) -> bool {
        self.width > self.height
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("entry not found: {0}")]
    EntryNotFound(String),
    #[error("failed to decode {entry}: {reason}")]
    Decode { entry: String, reason: String },
    #[error("unsupported entry format: {0}")]
    Unsupported(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unable to resolve platform data directories")]
    NoDataDir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Ltr,
    Rtl,
}

/// Reader preferences that influence pagination. The direction only matters to
/// the presentation layer (left/right placement); it never changes which
/// entries end up on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ViewerSettings {
    pub two_paged: bool,
    pub first_page_single: bool,
    pub direction: Direction,
    pub enable_preview: bool,
}

impl Default for ViewerSettings {
    fn default() -> Self {
        Self {
            two_paged: true,
            first_page_single: true,
            direction: Direction::Ltr,
            enable_preview: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Preview,
    Full,
}

/// Cached image data for one entry. The full tier supersedes the preview tier:
/// once it arrives the preview handle is dropped and never fetched again.
/// Dimensions are fixed by whichever tier arrives first.
#[derive(Debug, Clone)]
pub struct PageEntry {
    width: u32,
    height: u32,
    preview: Option<Arc<ImageBitmap>>,
    full: Option<Arc<ImageBitmap>>,
}

impl PageEntry {
    fn new(tier: Tier, bitmap: Arc<ImageBitmap>) -> Self {
        let (width, height) = (bitmap.width, bitmap.height);
        let (preview, full) = match tier {
            Tier::Preview => (Some(bitmap), None),
            Tier::Full => (None, Some(bitmap)),
        };
        Self {
            width,
            height,
            preview,
            full,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_landscape(&self) -> bool {
        self.width > self.height
    }

    pub fn has_full(&self) -> bool {
        self.full.is_some()
    }

    pub fn has_preview(&self) -> bool {
        self.preview.is_some()
    }

    /// Best displayable bitmap for this entry, preferring the full tier.
    pub fn display(&self) -> Option<Arc<ImageBitmap>> {
        self.full.clone().or_else(|| self.preview.clone())
    }
}

/// Per-document cache of decoded page tiers, keyed by entry name. Dropping the
/// cache (or calling `clear`) releases every handle it owns.
#[derive(Debug, Default)]
pub struct PageCache {
    items: HashMap<String, PageEntry>,
}

impl PageCache {
    pub fn new() -> Self {
        Self {
            items: HashMap::new(),
        }
    }

    pub fn get(&self, entry: &str) -> Option<&PageEntry> {
        self.items.get(entry)
    }

    pub fn is_loaded(&self, entry: &str) -> bool {
        self.items
            .get(entry)
            .map_or(false, |item| item.display().is_some())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Tiers that still have to be fetched before `entry` is as good as it can
    /// get. The preview tier is only wanted while no tier is present at all;
    /// once the full tier is cached it has superseded the preview for good.
    pub fn missing_tiers(&self, entry: &str, settings: &ViewerSettings) -> Vec<Tier> {
        let item = self.items.get(entry);
        let has_full = item.map_or(false, PageEntry::has_full);
        let has_preview = item.map_or(false, PageEntry::has_preview);

        let mut missing = Vec::new();
        if settings.enable_preview && !has_full && !has_preview {
            missing.push(Tier::Preview);
        }
        if !has_full {
            missing.push(Tier::Full);
        }
        missing
    }

    pub fn merge(&mut self, entry: &str, tier: Tier, bitmap: ImageBitmap) {
        let bitmap = Arc::new(bitmap);
        match self.items.get_mut(entry) {
            Some(item) => {
                if item.width != bitmap.width || item.height != bitmap.height {
                    debug!(
                        entry,
                        cached_width = item.width,
                        cached_height = item.height,
                        tier_width = bitmap.width,
                        tier_height = bitmap.height,
                        "tier dimensions differ from cached entry; keeping the cached ones"
                    );
                }
                match tier {
                    Tier::Preview => {
                        if item.full.is_none() {
                            item.preview = Some(bitmap);
                        }
                    }
                    Tier::Full => {
                        item.full = Some(bitmap);
                        item.preview = None;
                    }
                }
            }
            None => {
                self.items.insert(entry.to_string(), PageEntry::new(tier, bitmap));
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct LayoutImage {
    pub entry: String,
    pub width: u32,
    pub height: u32,
    pub bitmap: Arc<ImageBitmap>,
}

impl LayoutImage {
    pub fn is_landscape(&self) -> bool {
        self.width > self.height
    }
}

/// What the presentation layer should put on screen for the current index.
/// Recomputed from scratch on every cache, index, or settings change.
#[derive(Debug, Clone)]
pub struct PageLayout {
    pub first: LayoutImage,
    pub second: Option<LayoutImage>,
    pub is_spread: bool,
    pub advance: usize,
}

impl PageLayout {
    fn single(first: LayoutImage) -> Self {
        Self {
            first,
            second: None,
            is_spread: false,
            advance: 1,
        }
    }

    fn spread(first: LayoutImage, second: LayoutImage) -> Self {
        Self {
            first,
            second: Some(second),
            is_spread: true,
            advance: 2,
        }
    }
}

fn layout_image(entry: &str, cache: &PageCache) -> Option<LayoutImage> {
    let item = cache.get(entry)?;
    let bitmap = item.display()?;
    Some(LayoutImage {
        entry: entry.to_string(),
        width: item.width(),
        height: item.height(),
        bitmap,
    })
}

/// Computes the displayable layout for `index`, or `None` while a required
/// entry has no cached tier yet.
///
/// Pairing rules, first match wins: single-page mode and the final entry are
/// always single; a landscape entry is never part of a spread, neither as the
/// first nor the second page; the first entry stays single when the cover
/// convention is on; everything else pairs up as a spread advancing by two.
pub fn calculate_layout(
    index: usize,
    entries: &[String],
    cache: &PageCache,
    settings: &ViewerSettings,
) -> Option<PageLayout> {
    let first = layout_image(entries.get(index)?, cache)?;

    if !settings.two_paged || index + 1 >= entries.len() {
        return Some(PageLayout::single(first));
    }
    if first.is_landscape() {
        return Some(PageLayout::single(first));
    }
    if index == 0 && settings.first_page_single {
        return Some(PageLayout::single(first));
    }

    let second = layout_image(&entries[index + 1], cache)?;
    if second.is_landscape() {
        return Some(PageLayout::single(first));
    }

    Some(PageLayout::spread(first, second))
}

/// Browser-style history: an ordered list with a cursor. Pushing while the
/// cursor sits in the middle discards the diverged future. Used once for
/// opened documents and once for browsed directories.
#[derive(Debug, Clone)]
pub struct HistoryStack<T> {
    entries: Vec<T>,
    cursor: Option<usize>,
}

impl<T> Default for HistoryStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HistoryStack<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            cursor: None,
        }
    }

    pub fn current(&self) -> Option<&T> {
        self.cursor.map(|cursor| &self.entries[cursor])
    }

    pub fn position(&self) -> Option<usize> {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn can_back(&self) -> bool {
        matches!(self.cursor, Some(cursor) if cursor > 0)
    }

    pub fn can_forward(&self) -> bool {
        matches!(self.cursor, Some(cursor) if cursor + 1 < self.entries.len())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = None;
    }

    /// Steps back and returns the new current entry, or `None` at the start.
    pub fn back(&mut self) -> Option<&T> {
        match self.cursor {
            Some(cursor) if cursor > 0 => {
                self.cursor = Some(cursor - 1);
                self.current()
            }
            _ => None,
        }
    }

    /// Steps forward and returns the new current entry, or `None` at the end.
    pub fn forward(&mut self) -> Option<&T> {
        match self.cursor {
            Some(cursor) if cursor + 1 < self.entries.len() => {
                self.cursor = Some(cursor + 1);
                self.current()
            }
            _ => None,
        }
    }
}

impl<T: PartialEq> HistoryStack<T> {
    /// Appends `item` and moves the cursor onto it. Re-pushing the current
    /// entry is a no-op; pushing anywhere before the end truncates the
    /// entries after the cursor first.
    pub fn push(&mut self, item: T) {
        if self.current() == Some(&item) {
            return;
        }
        match self.cursor {
            Some(cursor) => self.entries.truncate(cursor + 1),
            None => self.entries.clear(),
        }
        self.entries.push(item);
        self.cursor = Some(self.entries.len() - 1);
    }
}

pub type PathHistory = HistoryStack<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    File,
    Directory,
}

/// One row of reading history, keyed by path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastPageRecord {
    pub path: String,
    pub kind: RecordKind,
    pub page_index: usize,
    pub last_opened_at: NaiveDateTime,
}

/// Backend that decodes page images at two quality tiers. Implementations own
/// all container/format logic; this crate only consumes the decoded bytes.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_preview(&self, document: &str, entry: &str) -> Result<ImageBitmap, FetchError>;

    async fn fetch_full(&self, document: &str, entry: &str) -> Result<ImageBitmap, FetchError>;

    /// Hints the backend to warm its own caches for `count` entries starting
    /// at `start_index`. Best effort; callers never observe the outcome.
    async fn prewarm(&self, document: &str, start_index: usize, count: usize);
}

/// Durable "last viewed page" store.
#[async_trait]
pub trait LastPageStore: Send + Sync {
    async fn upsert(&self, path: &str, kind: RecordKind, page_index: usize)
        -> Result<(), StoreError>;

    /// `Ok(None)` is the normal first-time-open outcome, not an error.
    async fn query(&self, path: &str) -> Result<Option<LastPageRecord>, StoreError>;

    async fn latest(&self) -> Result<Option<LastPageRecord>, StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryStoreInner {
    seq: u64,
    records: HashMap<String, (u64, LastPageRecord)>,
}

pub struct MemoryLastPageStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryLastPageStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryStoreInner::default()),
        }
    }
}

impl Default for MemoryLastPageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LastPageStore for MemoryLastPageStore {
    async fn upsert(
        &self,
        path: &str,
        kind: RecordKind,
        page_index: usize,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.seq += 1;
        let seq = inner.seq;
        let record = LastPageRecord {
            path: path.to_string(),
            kind,
            page_index,
            last_opened_at: Utc::now().naive_utc(),
        };
        inner.records.insert(path.to_string(), (seq, record));
        Ok(())
    }

    async fn query(&self, path: &str) -> Result<Option<LastPageRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .records
            .get(path)
            .map(|(_, record)| record.clone()))
    }

    async fn latest(&self) -> Result<Option<LastPageRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .records
            .values()
            .max_by_key(|(seq, _)| *seq)
            .map(|(_, record)| record.clone()))
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.inner.lock().records.clear();
        Ok(())
    }
}

/// File-backed store keeping every record in a single JSON document, written
/// atomically via a temp file and rename.
pub struct JsonFileLastPageStore {
    path: PathBuf,
}

impl JsonFileLastPageStore {
    pub fn new(path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    pub fn in_default_location() -> Result<Self, StoreError> {
        let project_dirs =
            ProjectDirs::from("net", "pageflip", "pageflip").ok_or(StoreError::NoDataDir)?;
        Self::new(project_dirs.data_local_dir().join("history.json"))
    }

    fn read_all(&self) -> Result<HashMap<String, LastPageRecord>, StoreError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let mut file = File::open(&self.path)?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        Ok(serde_json::from_str(&buf)?)
    }

    fn write_all(&self, records: &HashMap<String, LastPageRecord>) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(records)?;
        let mut file = File::create(&tmp)?;
        file.write_all(payload.as_bytes())?;
        file.flush()?;
        fs::rename(tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl LastPageStore for JsonFileLastPageStore {
    async fn upsert(
        &self,
        path: &str,
        kind: RecordKind,
        page_index: usize,
    ) -> Result<(), StoreError> {
        let mut records = self.read_all()?;
        records.insert(
            path.to_string(),
            LastPageRecord {
                path: path.to_string(),
                kind,
                page_index,
                last_opened_at: Utc::now().naive_utc(),
            },
        );
        self.write_all(&records)
    }

    async fn query(&self, path: &str) -> Result<Option<LastPageRecord>, StoreError> {
        Ok(self.read_all()?.get(path).cloned())
    }

    async fn latest(&self) -> Result<Option<LastPageRecord>, StoreError> {
        let records = self.read_all()?;
        Ok(records
            .values()
            .max_by_key(|record| record.last_opened_at)
            .cloned())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}
