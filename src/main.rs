use std::error::Error;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use hymn_downloader_lib::config::{self, Config};
use hymn_downloader_lib::delay_manager::Throttle;
use hymn_downloader_lib::{link_source, logger};
use hymn_downloader_lib::{BatchManager, BatchSettings, Extractor, FileSink, HttpFetcher, ProgressStore};
use log::{error, info, warn};

fn main() -> Result<(), Box<dyn Error>> {
    // The only argument is an optional config file path.
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(config::DEFAULT_CONFIG_FILE));
    let config = Config::load(&config_path)?;

    logger::init(Some(&config.log_path()));
    info!("{}", "=".repeat(60));
    info!("Starting hymn downloader");
    match &config.loaded_from {
        Some(path) => info!("Loaded config from {:?}", path),
        None => info!("No config file at {:?}, using defaults.", config_path),
    }
    info!("Download directory: {:?}", config.download_dir);
    info!("{}", "=".repeat(60));

    let fetcher = HttpFetcher::new(
        &config.user_agent,
        config.page_timeout(),
        config.binary_timeout(),
    )?;
    let manager = BatchManager::new(
        fetcher,
        Extractor::new(&config.media_marker)?,
        FileSink::new(&config.download_dir, &config.media_extension, config.min_file_size),
        Throttle::new(config.throttle_interval()),
        BatchSettings {
            workers: config.workers,
            summary_every: config.summary_every,
            retry: config.retry_config(),
        },
    );

    let cancel = manager.cancel_handle();
    let signals = Arc::new(AtomicU32::new(0));
    ctrlc::set_handler(move || {
        if signals.fetch_add(1, Ordering::SeqCst) == 0 {
            warn!("Received Ctrl+C, stopping after the current item. Press again to force exit.");
            cancel.store(true, Ordering::SeqCst);
        } else {
            warn!("Force exit requested");
            std::process::exit(130);
        }
    })?;

    let mut store = ProgressStore::load(config.progress_path());
    info!("Progress file: {:?}", store.path());
    let source = link_source::from_config(&config.link_source, manager.fetcher())?;
    let items = manager.resolve_items(&mut store, source.as_ref())?;

    if config.total_items > 0 && items.len() != config.total_items as usize {
        warn!(
            "Link source returned {} items, expected {}.",
            items.len(),
            config.total_items
        );
    }

    let report = manager.run(items, &mut store)?;

    info!("{}", "=".repeat(60));
    if report.cancelled {
        info!("Download cancelled. Run again to resume.");
    } else {
        info!("Download finished.");
    }
    info!("Completed: {}/{}", report.completed, report.total);
    info!("Failed:    {}/{}", report.failed, report.total);
    info!("Processed this run: {} (skipped {} already completed)", report.processed, report.skipped);
    if !report.failed_items.is_empty() {
        error!("Failed item numbers: {:?}", report.failed_items);
    }

    Ok(())
}
