use crate::cdn_downloader::{
    CdnDownloader, CdnGeneration, DEFAULT_FAILURE_COOLDOWN, DEFAULT_HTTP_TIMEOUT,
};
use crate::error::CacheError;
use crate::package_cache::PackageCache;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const MAX_WORKER_THREADS: usize = 3;

/// Settings for an [`ExportSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Where the CDN disk cache lives.
    pub cdn_cache_dir: PathBuf,
    /// Export worker count, clamped to `1..=3`.
    pub worker_threads: usize,
    pub enable_cdn: bool,
    /// Overrides the generation's default CDN address.
    pub cdn_base_url: Option<String>,
    pub failure_cooldown: Duration,
    pub http_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            cdn_cache_dir: PathBuf::from("cdn_cache"),
            worker_threads: std::thread::available_parallelism()
                .map_or(1, |n| n.get())
                .min(MAX_WORKER_THREADS),
            enable_cdn: false,
            cdn_base_url: None,
            failure_cooldown: DEFAULT_FAILURE_COOLDOWN,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}

impl SessionConfig {
    pub fn worker_count(&self) -> usize {
        self.worker_threads.clamp(1, MAX_WORKER_THREADS)
    }
}

/// Counts from one [`ExportSession::extract_many`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub extracted: usize,
    pub missing: usize,
    /// Ids never attempted because the session was cancelled.
    pub skipped: usize,
}

/// The package cache, CDN downloader and worker pool of one export run.
///
/// Replaces per-title global state: everything an export needs is owned here and handed to
/// the export pipeline. Dropping the session (or replacing its cache) blocks until any
/// in-flight cache load has finished.
pub struct ExportSession {
    config: SessionConfig,
    cache: Option<PackageCache>,
    cdn: Option<CdnDownloader>,
    cancelled: Arc<AtomicBool>,
    pool: rayon::ThreadPool,
}

impl std::fmt::Debug for ExportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportSession")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .field("cdn", &self.cdn)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl ExportSession {
    pub fn new(config: SessionConfig) -> Result<Self, CacheError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_count())
            .thread_name(|i| format!("export-worker-{i}"))
            .build()
            .map_err(|e| CacheError::Other(format!("Failed to start export workers: {e}")))?;
        Ok(ExportSession {
            config,
            cache: None,
            cdn: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            pool,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Installs the cache for the current title, returning the previous one.
    pub fn set_package_cache(&mut self, cache: PackageCache) -> Option<PackageCache> {
        self.cache.replace(cache)
    }

    pub fn package_cache(&self) -> Option<&PackageCache> {
        self.cache.as_ref()
    }

    pub fn set_cdn(&mut self, cdn: CdnDownloader) -> Option<CdnDownloader> {
        self.cdn.replace(cdn)
    }

    pub fn cdn(&self) -> Option<&CdnDownloader> {
        self.cdn.as_ref()
    }

    /// Initializes a CDN downloader for `game_directory` from the session settings.
    ///
    /// Does nothing when the CDN is disabled.
    pub fn open_cdn<P: AsRef<Path>>(
        &mut self,
        generation: CdnGeneration,
        game_directory: P,
    ) -> Result<(), CacheError> {
        if !self.config.enable_cdn {
            debug!("CDN disabled, not opening {generation:?}");
            return Ok(());
        }
        let mut builder = CdnDownloader::builder(generation)
            .with_cache_dir(&self.config.cdn_cache_dir)
            .with_failure_cooldown(self.config.failure_cooldown)
            .with_http_timeout(self.config.http_timeout);
        if let Some(base_url) = &self.config.cdn_base_url {
            builder = builder.with_base_url(base_url.clone());
        }
        self.cdn = Some(builder.initialize(game_directory)?);
        Ok(())
    }

    /// Extracts an object from the package cache, falling back to the CDN.
    pub fn extract(&self, id: u64, expected_size: Option<u64>) -> Option<Vec<u8>> {
        if let Some(data) = self
            .cache
            .as_ref()
            .and_then(|cache| cache.extract_object(id, expected_size))
        {
            return Some(data);
        }
        self.cdn
            .as_ref()
            .and_then(|cdn| cdn.extract_cdn_object(id, expected_size))
    }

    /// Extracts every id on the worker pool, handing each result to `sink`.
    ///
    /// Workers check the cancel flag before each id; extractions already running finish.
    pub fn extract_many<F>(&self, ids: &[u64], sink: F) -> ExportSummary
    where
        F: Fn(u64, Option<Vec<u8>>) + Send + Sync,
    {
        let extracted = AtomicUsize::new(0);
        let missing = AtomicUsize::new(0);
        let skipped = AtomicUsize::new(0);

        self.pool.install(|| {
            ids.par_iter().for_each(|&id| {
                if self.is_cancelled() {
                    skipped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                let data = self.extract(id, None);
                let counter = if data.is_some() { &extracted } else { &missing };
                counter.fetch_add(1, Ordering::Relaxed);
                sink(id, data);
            });
        });

        let summary = ExportSummary {
            extracted: extracted.into_inner(),
            missing: missing.into_inner(),
            skipped: skipped.into_inner(),
        };
        info!(
            "Exported {} objects ({} missing, {} skipped)",
            summary.extracted, summary.missing, summary.skipped
        );
        summary
    }

    /// Stops workers from starting new extractions.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Clears a previous [`ExportSession::cancel`].
    pub fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::Release);
    }

    /// The flag behind [`ExportSession::cancel`], for a UI thread to hold.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}
