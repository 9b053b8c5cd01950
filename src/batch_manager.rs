use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use log::{debug, error, info, warn};
use thiserror::Error;
use url::Url;

use crate::delay_manager::Throttle;
use crate::extractor::{ExtractionResult, Extractor};
use crate::fetcher::{Fetch, FetchError};
use crate::file_sink::{FileSink, SinkError};
use crate::link_source::{Item, LinkSource, LinkSourceError};
use crate::resume_manager::ProgressStore;
use crate::retry::{self, RetryAction, RetryConfig};

/// Fatal errors. Everything per-item becomes a [`DownloadOutcome`] instead.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Cannot enumerate items: {0}")]
    LinkSource(#[from] LinkSourceError),

    #[error("Cannot prepare download directory {path}: {source}")]
    Setup {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    AlreadyPresent,
    Downloaded(u64),
    ExtractionFailed,
    TransferFailed(String),
    WriteFailed(String),
}

impl DownloadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DownloadOutcome::AlreadyPresent | DownloadOutcome::Downloaded(_))
    }
}

/// One attempt at an item, classified for the retry loop.
#[derive(Debug, Error)]
enum AttemptError {
    #[error("{0}")]
    Fetch(#[from] FetchError),

    #[error("no media link found")]
    NotFound,

    #[error("{0}")]
    Sink(#[from] SinkError),
}

impl AttemptError {
    fn retry_action(&self) -> RetryAction {
        match self {
            AttemptError::Fetch(_)
            | AttemptError::Sink(SinkError::Transfer { .. })
            | AttemptError::Sink(SinkError::Truncated { .. }) => RetryAction::Retry,
            AttemptError::NotFound | AttemptError::Sink(SinkError::Io { .. }) => {
                RetryAction::Abort
            }
        }
    }

    fn into_outcome(self) -> DownloadOutcome {
        match self {
            AttemptError::NotFound => DownloadOutcome::ExtractionFailed,
            AttemptError::Fetch(e) => DownloadOutcome::TransferFailed(e.to_string()),
            AttemptError::Sink(e @ SinkError::Transfer { .. })
            | AttemptError::Sink(e @ SinkError::Truncated { .. }) => {
                DownloadOutcome::TransferFailed(e.to_string())
            }
            AttemptError::Sink(e @ SinkError::Io { .. }) => {
                DownloadOutcome::WriteFailed(e.to_string())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub workers: usize,
    pub summary_every: usize,
    pub retry: RetryConfig,
}

impl Default for BatchSettings {
    fn default() -> Self {
        BatchSettings {
            workers: 1,
            summary_every: 10,
            retry: RetryConfig::default(),
        }
    }
}

/// Final tally of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub total: usize,
    /// Already completed before this run started.
    pub skipped: usize,
    /// Attempted during this run.
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    pub failed_items: Vec<u32>,
    pub cancelled: bool,
}

pub struct BatchManager<F: Fetch> {
    fetcher: F,
    extractor: Extractor,
    sink: FileSink,
    throttle: Throttle,
    settings: BatchSettings,
    cancel: Arc<AtomicBool>,
}

struct RunState<'s> {
    store: Mutex<&'s mut ProgressStore>,
    queue: Mutex<VecDeque<(usize, Item)>>,
    processed: AtomicUsize,
    total: usize,
    skipped: usize,
}

fn summary_due(done: usize, every: usize) -> bool {
    done % every.max(1) == 0
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<F: Fetch> BatchManager<F> {
    pub fn new(
        fetcher: F,
        extractor: Extractor,
        sink: FileSink,
        throttle: Throttle,
        settings: BatchSettings,
    ) -> Self {
        BatchManager {
            fetcher,
            extractor,
            sink,
            throttle,
            settings,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Setting the returned flag stops the batch at the next item boundary.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Items for this run: the cached link table when there is one, otherwise
    /// a fresh enumeration that is cached for later runs.
    pub fn resolve_items(
        &self,
        store: &mut ProgressStore,
        source: &dyn LinkSource,
    ) -> Result<Vec<Item>, BatchError> {
        let cached = store.cached_items();
        if !cached.is_empty() {
            info!("Using {} cached item links.", cached.len());
            return Ok(cached);
        }

        let items = source.load_items()?;
        if let Err(e) = store.store_links(&items) {
            error!("Failed to cache item links: {}", e);
        }
        Ok(items)
    }

    /// Process every item not yet completed, in ascending order.
    pub fn run(&self, mut items: Vec<Item>, store: &mut ProgressStore) -> Result<BatchReport, BatchError> {
        self.sink.ensure_dir().map_err(|source| BatchError::Setup {
            path: self.sink.dir().display().to_string(),
            source,
        })?;

        items.sort_by_key(|item| item.no);
        items.dedup_by_key(|item| item.no);
        let total = items.len();

        let pending: VecDeque<(usize, Item)> = items
            .into_iter()
            .enumerate()
            .filter(|(_, item)| !store.is_completed(item.no))
            .collect();
        let skipped = total - pending.len();

        info!(
            "{} items total, {} already completed, {} to process ({} worker(s), {} ms throttle).",
            total,
            skipped,
            pending.len(),
            self.settings.workers,
            self.throttle.interval().as_millis()
        );

        let state = RunState {
            store: Mutex::new(store),
            queue: Mutex::new(pending),
            processed: AtomicUsize::new(0),
            total,
            skipped,
        };

        let workers = self.settings.workers.max(1);
        if workers == 1 {
            self.worker_loop(&state, false);
        } else {
            thread::scope(|s| {
                for _ in 0..workers {
                    s.spawn(|| self.worker_loop(&state, true));
                }
            });
        }

        let cancelled = self.is_cancelled() && !lock(&state.queue).is_empty();
        let processed = state.processed.load(Ordering::SeqCst);
        let store = lock(&state.store);
        Ok(BatchReport {
            total,
            skipped,
            processed,
            completed: store.completed_count(),
            failed: store.failed_count(),
            failed_items: store.failed_items(),
            cancelled,
        })
    }

    /// Pooled workers take a throttle slot before each item; a lone worker
    /// pauses after each one.
    fn worker_loop(&self, state: &RunState<'_>, pooled: bool) {
        loop {
            if self.is_cancelled() {
                debug!("Cancellation requested, worker stopping.");
                return;
            }

            let Some((index, item)) = lock(&state.queue).pop_front() else {
                return;
            };

            if pooled {
                self.throttle.acquire();
                if self.is_cancelled() {
                    lock(&state.queue).push_front((index, item));
                    debug!("Cancellation requested, worker stopping.");
                    return;
                }
            }

            info!("[{}/{}] {:03} {}", index + 1, state.total, item.no, item.title);
            let outcome = self.process_item(&item);
            self.record(state, &item, &outcome);

            let done = state.processed.fetch_add(1, Ordering::SeqCst) + 1;
            if summary_due(done, self.settings.summary_every) {
                self.log_summary(state, done);
            }

            if !pooled && !lock(&state.queue).is_empty() && !self.is_cancelled() {
                self.throttle.pause();
            }
        }
    }

    /// Size check, then extraction and download with the per-run retry budget.
    pub fn process_item(&self, item: &Item) -> DownloadOutcome {
        let path = self.sink.destination_path(item);

        if self.sink.is_present(&path) {
            return DownloadOutcome::AlreadyPresent;
        }
        if let Some(size) = self.sink.existing_size(&path) {
            info!("  Found truncated file ({} bytes), downloading again.", size);
        }

        let page_url = match Url::parse(&item.source_url) {
            Ok(u) => u,
            Err(e) => {
                return DownloadOutcome::TransferFailed(format!(
                    "invalid source URL {}: {}",
                    item.source_url, e
                ))
            }
        };

        let label = format!("item {}", item.no);
        let result = retry::retry_with_backoff(
            &self.settings.retry,
            &label,
            AttemptError::retry_action,
            |_| -> Result<u64, AttemptError> {
                let html = self.fetcher.fetch_page(&page_url)?;
                let media_url = match self.extractor.extract(&html, &page_url) {
                    ExtractionResult::Found { url, strategy } => {
                        debug!("  Media link via {:?}", strategy);
                        url
                    }
                    ExtractionResult::NotFound => return Err(AttemptError::NotFound),
                };
                info!("  Media URL: {}", media_url);

                let mut body = self.fetcher.fetch_binary(&media_url)?;
                Ok(self.sink.write(&path, &mut *body)?)
            },
        );

        match result {
            Ok(bytes) => DownloadOutcome::Downloaded(bytes),
            Err(e) => e.into_outcome(),
        }
    }

    fn record(&self, state: &RunState<'_>, item: &Item, outcome: &DownloadOutcome) {
        match outcome {
            DownloadOutcome::AlreadyPresent => info!("  Already present, skipping download."),
            DownloadOutcome::Downloaded(bytes) => {
                info!("  Downloaded ({:.2} MB)", *bytes as f64 / (1024.0 * 1024.0))
            }
            DownloadOutcome::ExtractionFailed => warn!("  No media link found for item {}.", item.no),
            DownloadOutcome::TransferFailed(reason) => {
                warn!("  Download failed for item {}: {}", item.no, reason)
            }
            DownloadOutcome::WriteFailed(reason) => {
                error!("  Cannot save item {} (check disk space and permissions): {}", item.no, reason)
            }
        }

        let mut store = lock(&state.store);
        let result = if outcome.is_success() {
            store.mark_completed(item.no)
        } else {
            store.mark_failed(item.no)
        };
        if let Err(e) = result {
            error!("Failed to persist progress for item {}: {}", item.no, e);
        }
    }

    fn log_summary(&self, state: &RunState<'_>, done: usize) {
        let (completed, failed) = {
            let store = lock(&state.store);
            (store.completed_count(), store.failed_count())
        };
        let reached = state.skipped + done;
        let percent = if state.total == 0 {
            100.0
        } else {
            reached as f64 / state.total as f64 * 100.0
        };
        info!(
            "Progress: {}/{} ({:.1}%) | completed: {} | failed: {}",
            reached, state.total, percent, completed, failed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use std::io::{self, Read};
    use std::path::Path;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct FakeFetcher {
        pages: HashMap<String, String>,
        binaries: HashMap<String, Vec<u8>>,
        page_calls: AtomicUsize,
        page_starts: Mutex<Vec<Instant>>,
        binary_calls: AtomicUsize,
        /// Fail this many binary fetches with a 503 before serving.
        binary_failures: AtomicUsize,
        /// Set the flag once this many pages have been served.
        cancel_after_pages: Option<(usize, Arc<AtomicBool>)>,
    }

    impl FakeFetcher {
        fn page(mut self, url: &str, html: &str) -> Self {
            self.pages.insert(url.to_string(), html.to_string());
            self
        }

        fn binary(mut self, url: &str, size: usize) -> Self {
            self.binaries.insert(url.to_string(), vec![0xAB; size]);
            self
        }

        fn calls(&self) -> usize {
            self.page_calls.load(Ordering::SeqCst) + self.binary_calls.load(Ordering::SeqCst)
        }
    }

    impl Fetch for FakeFetcher {
        fn fetch_page(&self, url: &Url) -> Result<String, FetchError> {
            lock(&self.page_starts).push(Instant::now());
            let served = self.page_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((limit, flag)) = &self.cancel_after_pages {
                if served >= *limit {
                    flag.store(true, Ordering::SeqCst);
                }
            }
            self.pages.get(url.as_str()).cloned().ok_or(FetchError::Status {
                status: 404,
                url: url.to_string(),
            })
        }

        fn fetch_binary(&self, url: &Url) -> Result<Box<dyn Read + Send>, FetchError> {
            self.binary_calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.binary_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.binary_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(FetchError::Status {
                    status: 503,
                    url: url.to_string(),
                });
            }
            match self.binaries.get(url.as_str()) {
                Some(bytes) => Ok(Box::new(io::Cursor::new(bytes.clone()))),
                None => Err(FetchError::Status {
                    status: 404,
                    url: url.to_string(),
                }),
            }
        }
    }

    fn item(no: u32, title: &str) -> Item {
        Item {
            no,
            title: title.to_string(),
            source_url: format!("http://x/p{}", no),
        }
    }

    fn audio_page(no: u32) -> String {
        format!(r#"<html><body><audio src="http://x/f{}.mp3"></audio></body></html>"#, no)
    }

    /// Items 1..=n, each with a page and a 20 KB media file.
    fn site(n: u32) -> (FakeFetcher, Vec<Item>) {
        let mut fetcher = FakeFetcher::default();
        let mut items = Vec::new();
        for no in 1..=n {
            fetcher = fetcher
                .page(&format!("http://x/p{}", no), &audio_page(no))
                .binary(&format!("http://x/f{}.mp3", no), 20_000);
            items.push(item(no, &format!("Hymn {}", no)));
        }
        (fetcher, items)
    }

    fn manager(fetcher: FakeFetcher, dir: &Path, workers: usize) -> BatchManager<FakeFetcher> {
        throttled_manager(fetcher, dir, workers, Duration::ZERO)
    }

    fn throttled_manager(
        fetcher: FakeFetcher,
        dir: &Path,
        workers: usize,
        interval: Duration,
    ) -> BatchManager<FakeFetcher> {
        BatchManager::new(
            fetcher,
            Extractor::new("tfile.mp3").unwrap(),
            FileSink::new(dir, "mp3", 10_000),
            Throttle::new(interval),
            BatchSettings {
                workers,
                summary_every: 10,
                retry: RetryConfig {
                    max_retries: 2,
                    base_delay_secs: 0,
                    max_delay_secs: 0,
                },
            },
        )
    }

    #[test]
    fn test_single_item_success() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::default()
            .page("http://x/p7", r#"<audio src="http://x/f7.mp3">"#)
            .binary("http://x/f7.mp3", 15_000);
        let mgr = manager(fetcher, dir.path(), 1);
        let mut store = ProgressStore::load(dir.path().join("progress.json"));

        let report = mgr.run(vec![item(7, "A/B:C")], &mut store).unwrap();

        let saved = dir.path().join("007_A_B_C.mp3");
        assert_eq!(fs::metadata(&saved).unwrap().len(), 15_000);
        assert!(store.is_completed(7));
        assert!(!store.is_failed(7));
        assert_eq!(report.completed, 1);
        assert!(report.failed_items.is_empty());

        let reloaded = ProgressStore::load(dir.path().join("progress.json"));
        assert!(reloaded.is_completed(7));
    }

    #[test]
    fn test_extraction_failure_does_not_stop_batch() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::default()
            .page("http://x/p1", "<html><body><p>lyrics only</p></body></html>")
            .page("http://x/p2", &audio_page(2))
            .binary("http://x/f2.mp3", 20_000);
        let mgr = manager(fetcher, dir.path(), 1);
        let mut store = ProgressStore::load(dir.path().join("progress.json"));

        assert_eq!(mgr.process_item(&item(1, "One")), DownloadOutcome::ExtractionFailed);
        let report = mgr.run(vec![item(1, "One"), item(2, "Two")], &mut store).unwrap();

        assert_eq!(report.failed_items, vec![1]);
        assert!(!store.is_completed(1));
        assert!(store.is_completed(2));
        // Not-found is not retried within the run: one page fetch per attempt.
        assert_eq!(mgr.fetcher().page_calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_second_run_makes_no_requests() {
        let dir = tempfile::tempdir().unwrap();
        let (fetcher, items) = site(5);
        let mgr = manager(fetcher, dir.path(), 1);
        let progress = dir.path().join("progress.json");

        let mut store = ProgressStore::load(&progress);
        mgr.run(items.clone(), &mut store).unwrap();
        let after_first = mgr.fetcher().calls();
        assert_eq!(after_first, 10);

        let mut store = ProgressStore::load(&progress);
        let report = mgr.run(items, &mut store).unwrap();
        assert_eq!(mgr.fetcher().calls(), after_first);
        assert_eq!(report.skipped, 5);
        assert_eq!(report.processed, 0);
    }

    #[test]
    fn test_completed_items_are_never_attempted() {
        let dir = tempfile::tempdir().unwrap();
        let (fetcher, items) = site(3);
        let mgr = manager(fetcher, dir.path(), 1);
        let mut store = ProgressStore::load(dir.path().join("progress.json"));
        store.mark_completed(1).unwrap();
        store.mark_completed(3).unwrap();

        let report = mgr.run(items, &mut store).unwrap();
        // File for 1 and 3 never existed, yet neither is fetched.
        assert_eq!(mgr.fetcher().page_calls.load(Ordering::SeqCst), 1);
        assert!(!dir.path().join("001_Hymn 1.mp3").exists());
        assert!(dir.path().join("002_Hymn 2.mp3").exists());
        assert_eq!(report.processed, 1);
    }

    #[test]
    fn test_failed_items_are_retried_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let (fetcher, items) = site(2);
        let mgr = manager(fetcher, dir.path(), 1);
        let mut store = ProgressStore::load(dir.path().join("progress.json"));
        store.mark_failed(2).unwrap();

        let report = mgr.run(items, &mut store).unwrap();
        assert!(store.is_completed(2));
        assert!(!store.is_failed(2));
        assert!(report.failed_items.is_empty());
    }

    #[test]
    fn test_small_existing_file_is_downloaded_again() {
        let dir = tempfile::tempdir().unwrap();
        let (fetcher, items) = site(1);
        let mgr = manager(fetcher, dir.path(), 1);
        let path = dir.path().join("001_Hymn 1.mp3");
        fs::write(&path, vec![0u8; 5_000]).unwrap();

        assert_eq!(mgr.process_item(&items[0]), DownloadOutcome::Downloaded(20_000));
        assert_eq!(fs::metadata(&path).unwrap().len(), 20_000);
        assert_eq!(mgr.fetcher().binary_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_large_existing_file_is_kept_without_requests() {
        let dir = tempfile::tempdir().unwrap();
        let (fetcher, items) = site(1);
        let mgr = manager(fetcher, dir.path(), 1);
        fs::write(dir.path().join("001_Hymn 1.mp3"), vec![0u8; 20_000]).unwrap();
        let mut store = ProgressStore::load(dir.path().join("progress.json"));

        let report = mgr.run(items, &mut store).unwrap();
        assert_eq!(mgr.fetcher().calls(), 0);
        assert!(store.is_completed(1));
        assert_eq!(report.completed, 1);
    }

    #[test]
    fn test_undersized_download_is_not_completed() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::default()
            .page("http://x/p1", &audio_page(1))
            .binary("http://x/f1.mp3", 512);
        let mgr = manager(fetcher, dir.path(), 1);
        let mut store = ProgressStore::load(dir.path().join("progress.json"));

        let report = mgr.run(vec![item(1, "Hymn 1")], &mut store).unwrap();
        assert!(!store.is_completed(1));
        assert!(store.is_failed(1));
        assert_eq!(report.failed_items, vec![1]);
        assert!(!dir.path().join("001_Hymn 1.mp3").exists());
        // Small bodies count as transient: the whole retry budget is spent.
        assert_eq!(mgr.fetcher().binary_calls.load(Ordering::SeqCst), 3);
        match mgr.process_item(&item(1, "Hymn 1")) {
            DownloadOutcome::TransferFailed(reason) => assert!(reason.contains("512 bytes")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_transient_failure_retried_within_run() {
        let dir = tempfile::tempdir().unwrap();
        let (fetcher, items) = site(1);
        fetcher.binary_failures.store(1, Ordering::SeqCst);
        let mgr = manager(fetcher, dir.path(), 1);

        assert_eq!(mgr.process_item(&items[0]), DownloadOutcome::Downloaded(20_000));
        assert_eq!(mgr.fetcher().page_calls.load(Ordering::SeqCst), 2);
        assert_eq!(mgr.fetcher().binary_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_retry_budget_exhausted_marks_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (fetcher, items) = site(1);
        fetcher.binary_failures.store(10, Ordering::SeqCst);
        let mgr = manager(fetcher, dir.path(), 1);
        let mut store = ProgressStore::load(dir.path().join("progress.json"));

        let report = mgr.run(items, &mut store).unwrap();
        assert_eq!(mgr.fetcher().binary_calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.failed_items, vec![1]);
        assert!(!dir.path().join("001_Hymn 1.mp3").exists());
    }

    #[test]
    fn test_missing_page_is_transfer_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(FakeFetcher::default(), dir.path(), 1);
        match mgr.process_item(&item(9, "Nine")) {
            DownloadOutcome::TransferFailed(reason) => assert!(reason.contains("404")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_cancellation_stops_at_item_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let (mut fetcher, items) = site(4);
        let flag = Arc::new(AtomicBool::new(false));
        fetcher.cancel_after_pages = Some((2, flag.clone()));

        let mut mgr = manager(fetcher, dir.path(), 1);
        mgr.cancel = flag;
        let mut store = ProgressStore::load(dir.path().join("progress.json"));

        let report = mgr.run(items, &mut store).unwrap();
        // Item 2 was in flight when the flag was set and still finished.
        assert!(report.cancelled);
        assert_eq!(report.processed, 2);
        assert!(store.is_completed(2));
        assert!(!store.is_completed(3));
    }

    #[test]
    fn test_concurrent_workers_process_everything_once() {
        let dir = tempfile::tempdir().unwrap();
        let (fetcher, items) = site(12);
        let mgr = manager(fetcher, dir.path(), 3);
        let mut store = ProgressStore::load(dir.path().join("progress.json"));

        let report = mgr.run(items, &mut store).unwrap();
        assert_eq!(report.processed, 12);
        assert_eq!(report.completed, 12);
        assert_eq!(mgr.fetcher().page_calls.load(Ordering::SeqCst), 12);

        let reloaded = ProgressStore::load(dir.path().join("progress.json"));
        assert_eq!(reloaded.completed_count(), 12);
    }

    #[test]
    fn test_sequential_run_pauses_between_items() {
        let dir = tempfile::tempdir().unwrap();
        let (fetcher, items) = site(3);
        let mgr = throttled_manager(fetcher, dir.path(), 1, Duration::from_millis(50));
        let mut store = ProgressStore::load(dir.path().join("progress.json"));

        let start = Instant::now();
        mgr.run(items, &mut store).unwrap();
        // Two pauses; none after the last item.
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_millis(1_000));

        let starts = lock(&mgr.fetcher().page_starts).clone();
        for pair in starts.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(50));
        }
    }

    #[test]
    fn test_worker_pool_shares_one_interval() {
        let dir = tempfile::tempdir().unwrap();
        let (fetcher, items) = site(6);
        let interval = Duration::from_millis(100);
        let mgr = throttled_manager(fetcher, dir.path(), 3, interval);
        let mut store = ProgressStore::load(dir.path().join("progress.json"));

        let report = mgr.run(items, &mut store).unwrap();
        assert_eq!(report.completed, 6);

        let mut starts = lock(&mgr.fetcher().page_starts).clone();
        starts.sort();
        assert_eq!(starts.len(), 6);
        for pair in starts.windows(2) {
            assert!(
                pair[1].duration_since(pair[0]) >= Duration::from_millis(80),
                "page fetches started {:?} apart",
                pair[1].duration_since(pair[0])
            );
        }
        // Slots at 0, 100, ..., 500 ms.
        assert!(starts[5].duration_since(starts[0]) >= Duration::from_millis(490));
    }

    #[test]
    fn test_summary_every_nth_item() {
        let due: Vec<usize> = (1..=25).filter(|&done| summary_due(done, 10)).collect();
        assert_eq!(due, vec![10, 20]);
        assert!(summary_due(3, 1));
        // Zero is treated as "every item" rather than dividing by zero.
        assert!(summary_due(7, 0));
    }

    struct CountingSource {
        items: Vec<Item>,
        calls: AtomicUsize,
    }

    impl LinkSource for CountingSource {
        fn load_items(&self) -> Result<Vec<Item>, LinkSourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.items.is_empty() {
                Err(LinkSourceError::Empty)
            } else {
                Ok(self.items.clone())
            }
        }
    }

    #[test]
    fn test_links_are_enumerated_once_then_cached() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(FakeFetcher::default(), dir.path(), 1);
        let source = CountingSource {
            items: vec![item(2, "Two"), item(1, "One")],
            calls: AtomicUsize::new(0),
        };
        let progress = dir.path().join("progress.json");

        let mut store = ProgressStore::load(&progress);
        let first = mgr.resolve_items(&mut store, &source).unwrap();
        assert_eq!(first.len(), 2);

        let mut store = ProgressStore::load(&progress);
        let second = mgr.resolve_items(&mut store, &source).unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.iter().map(|i| i.no).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_link_source_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(FakeFetcher::default(), dir.path(), 1);
        let source = CountingSource {
            items: Vec::new(),
            calls: AtomicUsize::new(0),
        };
        let mut store = ProgressStore::load(dir.path().join("progress.json"));
        let err = mgr.resolve_items(&mut store, &source).unwrap_err();
        assert!(matches!(err, BatchError::LinkSource(LinkSourceError::Empty)));
    }
}
