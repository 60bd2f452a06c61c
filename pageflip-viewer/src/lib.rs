use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use pageflip_core::{
    calculate_layout, FetchError, ImageBitmap, LastPageRecord, LastPageStore, PageCache,
    PageLayout, PageSource, RecordKind, Tier, ViewerSettings,
};

/// How many entries past the visible span the backend is asked to pre-warm.
const READ_AHEAD_WINDOW: usize = 8;

/// Quiet period before a noted page index is written through to the store.
pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    Idle,
    Loading,
    Ready,
}

struct OpenDocument {
    path: String,
    entries: Vec<String>,
    index: usize,
    cache: PageCache,
    layout: Option<PageLayout>,
}

struct ControllerState {
    document: Option<OpenDocument>,
    settings: ViewerSettings,
    generation: u64,
    scope: CancellationToken,
    phase: LoadPhase,
}

/// Handle for one load cycle. Dropping it detaches the cycle; cancelling it
/// stops the cycle's fetches from ever touching the cache.
pub struct LoadCycle {
    scope: CancellationToken,
    handle: JoinHandle<()>,
}

impl LoadCycle {
    fn idle() -> Self {
        Self {
            scope: CancellationToken::new(),
            handle: tokio::spawn(async {}),
        }
    }

    pub fn cancel(&self) {
        self.scope.cancel();
    }

    /// Waits until every fetch of this cycle has either been applied or
    /// discarded. Mainly useful to the owning shell and to tests.
    pub async fn settled(self) {
        let _ = self.handle.await;
    }
}

/// Orchestrates the page cache and the layout engine for one open document at
/// a time. All methods are synchronous and non-blocking; fetching happens on
/// spawned tasks, so the controller must live inside a tokio runtime.
///
/// Failures never escape this type: a failed tier stays absent (and is logged),
/// navigation at a boundary is a no-op.
pub struct ViewerController {
    source: Arc<dyn PageSource>,
    state: Arc<Mutex<ControllerState>>,
    layout_tx: watch::Sender<Option<PageLayout>>,
    index_tx: watch::Sender<usize>,
}

impl ViewerController {
    pub fn new(source: Arc<dyn PageSource>) -> Self {
        Self::with_settings(source, ViewerSettings::default())
    }

    pub fn with_settings(source: Arc<dyn PageSource>, settings: ViewerSettings) -> Self {
        let (layout_tx, _) = watch::channel(None);
        let (index_tx, _) = watch::channel(0);
        Self {
            source,
            state: Arc::new(Mutex::new(ControllerState {
                document: None,
                settings,
                generation: 0,
                scope: CancellationToken::new(),
                phase: LoadPhase::Idle,
            })),
            layout_tx,
            index_tx,
        }
    }

    /// Receiver for the current layout; `None` while the visible entries have
    /// no cached tier yet.
    pub fn layout_watch(&self) -> watch::Receiver<Option<PageLayout>> {
        self.layout_tx.subscribe()
    }

    /// Receiver for the current page index. History persistence observes this
    /// channel rather than being called by the controller.
    pub fn index_watch(&self) -> watch::Receiver<usize> {
        self.index_tx.subscribe()
    }

    pub fn current_layout(&self) -> Option<PageLayout> {
        self.state
            .lock()
            .document
            .as_ref()
            .and_then(|doc| doc.layout.clone())
    }

    pub fn current_index(&self) -> usize {
        self.state
            .lock()
            .document
            .as_ref()
            .map_or(0, |doc| doc.index)
    }

    pub fn phase(&self) -> LoadPhase {
        self.state.lock().phase
    }

    pub fn settings(&self) -> ViewerSettings {
        self.state.lock().settings
    }

    pub fn is_cached(&self, entry: &str) -> bool {
        self.state
            .lock()
            .document
            .as_ref()
            .map_or(false, |doc| doc.cache.is_loaded(entry))
    }

    /// Replaces the open document. The previous document's cache is dropped,
    /// which releases every image handle it owned.
    #[instrument(skip(self, entries), fields(entry_count = entries.len()))]
    pub fn open_document(&self, path: &str, entries: Vec<String>, start_index: usize) -> LoadCycle {
        let mut state = self.state.lock();
        let index = if entries.is_empty() {
            0
        } else {
            start_index.min(entries.len() - 1)
        };
        state.document = Some(OpenDocument {
            path: path.to_string(),
            entries,
            index,
            cache: PageCache::new(),
            layout: None,
        });
        self.index_tx.send_replace(index);
        self.begin_load(&mut state)
    }

    pub fn on_index_changed(&self, index: usize) -> LoadCycle {
        let mut state = self.state.lock();
        let Some(doc) = state.document.as_mut() else {
            return LoadCycle::idle();
        };
        if doc.entries.is_empty() {
            return LoadCycle::idle();
        }
        doc.index = index.min(doc.entries.len() - 1);
        self.index_tx.send_replace(doc.index);
        self.begin_load(&mut state)
    }

    pub fn on_settings_changed(&self, settings: ViewerSettings) -> LoadCycle {
        let mut state = self.state.lock();
        state.settings = settings;
        if state.document.is_none() {
            return LoadCycle::idle();
        }
        self.begin_load(&mut state)
    }

    /// Advances by the current layout's step (two across a spread, one
    /// otherwise). Returns `None` at the end of the document.
    pub fn move_forward(&self) -> Option<LoadCycle> {
        let mut state = self.state.lock();
        let settings = state.settings;
        let doc = state.document.as_mut()?;
        let advance = doc
            .layout
            .as_ref()
            .map(|layout| layout.advance)
            .unwrap_or(if settings.two_paged { 2 } else { 1 });
        let next = doc.index + advance;
        if next >= doc.entries.len() {
            return None;
        }
        doc.index = next;
        self.index_tx.send_replace(next);
        Some(self.begin_load(&mut state))
    }

    /// Steps back so that a following `move_forward` lands where we are now,
    /// even across runs of lone landscape pages. Returns `None` at the start.
    pub fn move_back(&self) -> Option<LoadCycle> {
        let mut state = self.state.lock();
        let settings = state.settings;
        let doc = state.document.as_mut()?;
        if doc.index == 0 {
            return None;
        }
        let target = if settings.two_paged {
            back_target(doc.index, &doc.entries, &doc.cache, &settings)
        } else {
            doc.index - 1
        };
        doc.index = target;
        self.index_tx.send_replace(target);
        Some(self.begin_load(&mut state))
    }

    /// Starts a new load cycle, superseding any cycle still in flight. The
    /// layout is recomputed and published immediately from whatever the cache
    /// already holds; missing tiers stream in on a spawned task.
    fn begin_load(&self, state: &mut ControllerState) -> LoadCycle {
        state.scope.cancel();
        state.generation += 1;
        let generation = state.generation;
        let scope = CancellationToken::new();
        state.scope = scope.clone();

        let settings = state.settings;
        let Some(doc) = state.document.as_mut() else {
            state.phase = LoadPhase::Idle;
            return LoadCycle::idle();
        };

        doc.layout = calculate_layout(doc.index, &doc.entries, &doc.cache, &settings);
        self.layout_tx.send_replace(doc.layout.clone());

        let mut required = vec![doc.index];
        if settings.two_paged && doc.index + 1 < doc.entries.len() {
            required.push(doc.index + 1);
        }
        let mut requests = Vec::new();
        for &i in &required {
            if let Some(entry) = doc.entries.get(i) {
                for tier in doc.cache.missing_tiers(entry, &settings) {
                    requests.push((entry.clone(), tier));
                }
            }
        }

        let document = doc.path.clone();
        let prewarm_start = doc.index + required.len();
        let within_document = prewarm_start < doc.entries.len();
        let ready = doc.layout.is_some();
        state.phase = if ready {
            LoadPhase::Ready
        } else {
            LoadPhase::Loading
        };

        debug!(
            document = %document,
            generation,
            pending = requests.len(),
            "starting load cycle"
        );

        // best-effort read-ahead; the outcome is never observed
        if within_document {
            let source = Arc::clone(&self.source);
            let prewarm_document = document.clone();
            tokio::spawn(async move {
                source
                    .prewarm(&prewarm_document, prewarm_start, READ_AHEAD_WINDOW)
                    .await;
            });
        }

        let source = Arc::clone(&self.source);
        let shared = Arc::clone(&self.state);
        let layout_tx = self.layout_tx.clone();
        let task_scope = scope.clone();
        let handle = tokio::spawn(async move {
            let mut fetches: FuturesUnordered<_> = requests
                .into_iter()
                .map(|(entry, tier)| {
                    let source = Arc::clone(&source);
                    let document = document.clone();
                    async move {
                        let result = match tier {
                            Tier::Preview => source.fetch_preview(&document, &entry).await,
                            Tier::Full => source.fetch_full(&document, &entry).await,
                        };
                        (entry, tier, result)
                    }
                })
                .collect();

            loop {
                // cancellation checkpoint: a superseded cycle must never
                // touch the cache, even if a fetch already completed
                let (entry, tier, result) = tokio::select! {
                    _ = task_scope.cancelled() => {
                        debug!(generation, "load cycle superseded; dropping remaining fetches");
                        break;
                    }
                    next = fetches.next() => match next {
                        Some(resolved) => resolved,
                        None => break,
                    },
                };
                apply_fetch(&shared, &layout_tx, generation, &entry, tier, result);
            }
        });

        LoadCycle { scope, handle }
    }
}

/// Merges one resolved tier into the cache and republishes the layout. Stale
/// results (an older generation) are discarded before any mutation.
fn apply_fetch(
    state: &Mutex<ControllerState>,
    layout_tx: &watch::Sender<Option<PageLayout>>,
    generation: u64,
    entry: &str,
    tier: Tier,
    result: Result<ImageBitmap, FetchError>,
) {
    let mut state = state.lock();
    if state.generation != generation {
        debug!(entry, ?tier, "discarding stale fetch result");
        return;
    }
    let settings = state.settings;
    let Some(doc) = state.document.as_mut() else {
        return;
    };
    match result {
        Ok(bitmap) => {
            debug!(
                entry,
                ?tier,
                width = bitmap.width,
                height = bitmap.height,
                "page tier loaded"
            );
            doc.cache.merge(entry, tier, bitmap);
        }
        Err(err) => {
            // the tier stays absent; navigating here again retries naturally
            warn!(entry, ?tier, %err, "failed to fetch page tier");
        }
    }
    doc.layout = calculate_layout(doc.index, &doc.entries, &doc.cache, &settings);
    let ready = doc.layout.is_some();
    layout_tx.send_replace(doc.layout.clone());
    if ready {
        state.phase = LoadPhase::Ready;
    }
}

/// Backward navigation target in two-page mode. Checks one step back before
/// two: a lone landscape page in the previous slot means the forward step that
/// crossed it advanced by one, and stepping back must mirror that exactly.
/// Simulations over uncached entries fall back to two steps rather than
/// blocking navigation on a fetch.
fn back_target(
    index: usize,
    entries: &[String],
    cache: &PageCache,
    settings: &ViewerSettings,
) -> usize {
    let one_back = index.saturating_sub(1);
    if let Some(layout) = calculate_layout(one_back, entries, cache, settings) {
        if !layout.is_spread && layout.first.is_landscape() {
            return one_back;
        }
    }
    let two_back = index.saturating_sub(2);
    match calculate_layout(two_back, entries, cache, settings) {
        None => two_back,
        Some(layout) if !layout.is_spread && layout.first.is_landscape() => one_back,
        Some(_) => two_back,
    }
}

/// Write-through of "last viewed page" with trailing-edge coalescing: every
/// call restarts the quiet period and replaces the pending record, so only the
/// final state before quiescence reaches the store. Store failures are logged
/// and swallowed; reading never blocks navigation.
pub struct HistoryPersistence {
    store: Arc<dyn LastPageStore>,
    quiet_period: Duration,
    enabled: bool,
    pending: Mutex<Option<CancellationToken>>,
}

impl HistoryPersistence {
    pub fn new(store: Arc<dyn LastPageStore>) -> Self {
        Self::with_quiet_period(store, DEFAULT_QUIET_PERIOD)
    }

    pub fn with_quiet_period(store: Arc<dyn LastPageStore>, quiet_period: Duration) -> Self {
        Self {
            store,
            quiet_period,
            enabled: true,
            pending: Mutex::new(None),
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.cancel_pending();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Schedules `(path, kind, page_index)` to be persisted once the quiet
    /// period elapses without another call.
    pub fn note_page(&self, path: &str, kind: RecordKind, page_index: usize) {
        if !self.enabled {
            return;
        }
        let token = CancellationToken::new();
        if let Some(previous) = self.pending.lock().replace(token.clone()) {
            previous.cancel();
        }
        let store = Arc::clone(&self.store);
        let quiet_period = self.quiet_period;
        let path = path.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(quiet_period) => {
                    if let Err(err) = store.upsert(&path, kind, page_index).await {
                        warn!(%path, page_index, %err, "failed to persist last viewed page");
                    }
                }
            }
        });
    }

    pub fn cancel_pending(&self) {
        if let Some(token) = self.pending.lock().take() {
            token.cancel();
        }
    }

    /// Page index to resume `path` at. A missing record is the normal
    /// first-time-open outcome; store errors degrade to the same answer.
    pub async fn resume_index(&self, path: &str) -> Option<usize> {
        if !self.enabled {
            return None;
        }
        match self.store.query(path).await {
            Ok(Some(record)) => Some(record.page_index),
            Ok(None) => None,
            Err(err) => {
                warn!(%path, %err, "failed to query last viewed page");
                None
            }
        }
    }

    /// Most recently opened record, for restoring the previous session.
    pub async fn restore_target(&self) -> Option<LastPageRecord> {
        if !self.enabled {
            return None;
        }
        match self.store.latest().await {
            Ok(record) => record,
            Err(err) => {
                warn!(%err, "failed to query latest history record");
                None
            }
        }
    }

    pub async fn clear_all(&self) {
        self.cancel_pending();
        if let Err(err) = self.store.clear().await {
            warn!(%err, "failed to clear history store");
        }
    }
}
