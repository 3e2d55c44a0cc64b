//! Remote fallback for objects that on-demand titles do not ship locally.
//!
//! A [`CdnDownloader`] knows which objects the CDN serves (from the title's `*cdn.xpak`
//! index packages), serves repeats from a [`CdnCache`] on disk, and stops asking the network
//! for an id that failed until a cooldown has passed.

use crate::cdn_cache::CdnCache;
use crate::error::CacheError;
use crate::game_file_system::GameFileSystem;
use crate::hash_table_archive::{decompress_xpak_object, decompress_xsub_object, HashTableGeneration};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{BufReader, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_FAILURE_COOLDOWN: Duration = Duration::from_secs(60);
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const CDN_INDEX_PATTERN: &str = "*cdn.xpak";

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// The CDN layouts used by successive titles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CdnGeneration {
    /// Objects addressed by id alone, XPAK blocks behind a metadata prefix.
    V0,
    /// XSUB objects, indexed by `*cdn.xpak` packages with 16-byte records.
    V1,
    /// XSUB objects, indexed by `*cdn.xpak` packages with 20-byte records.
    V2,
}

impl CdnGeneration {
    pub fn default_base_url(self) -> &'static str {
        match self {
            CdnGeneration::V0 => "http://cod-assets.cdn.blizzard.com/pc/0",
            CdnGeneration::V1 => "http://cod-assets.cdn.blizzard.com/pc/s4_1",
            CdnGeneration::V2 => "http://cod-assets.cdn.blizzard.com/pc/iw9_2",
        }
    }

    /// The name of the on-disk [`CdnCache`].
    pub fn cache_name(self) -> &'static str {
        match self {
            CdnGeneration::V0 => "CoDCDNV0",
            CdnGeneration::V1 => "CoDCDNV1",
            CdnGeneration::V2 => "CoDCDNV2",
        }
    }

    fn index_generation(self) -> Option<HashTableGeneration> {
        match self {
            CdnGeneration::V0 => None,
            CdnGeneration::V1 => Some(HashTableGeneration::Xsub),
            CdnGeneration::V2 => Some(HashTableGeneration::XsubV2),
        }
    }

    fn checks_reachability(self) -> bool {
        matches!(self, CdnGeneration::V0 | CdnGeneration::V1)
    }

    /// The URL of one object. `entry` is required for every generation but V0.
    pub fn object_url(self, base_url: &str, id: u64, entry: Option<&CdnEntry>) -> String {
        let tag = match (self, entry) {
            (CdnGeneration::V1, Some(_)) => 21,
            (CdnGeneration::V2, Some(_)) => 22,
            _ => return format!("{base_url}/{id:016x}"),
        };
        let (size, flags) = entry.map_or((0, 0), |e| (e.size, e.flags));
        format!(
            "{base_url}/{tag}/{:02x}/{id:016x}_{size:08x}_{}",
            id as u8,
            if flags != 0 { "1" } else { "0" }
        )
    }
}

/// One object the CDN serves, as listed by an index package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CdnEntry {
    pub hash: u64,
    /// Size of the stored (still compressed) object.
    pub size: u64,
    pub flags: u64,
}

/// Source of the current time, replaceable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Fetches a whole HTTP resource.
pub trait HttpFetch: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, CacheError>;
}

/// [`HttpFetch`] over a blocking `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration) -> Result<Self, CacheError> {
        let client = reqwest::blocking::ClientBuilder::new()
            .user_agent(APP_USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| CacheError::Network(e.to_string()))?;
        Ok(ReqwestFetcher { client })
    }
}

impl HttpFetch for ReqwestFetcher {
    #[tracing::instrument(skip(self), err)]
    fn fetch(&self, url: &str) -> Result<Vec<u8>, CacheError> {
        let response = self
            .client
            .get(url)
            .send()
            .and_then(|response| response.error_for_status())
            .map_err(|e| CacheError::Network(e.to_string()))?;
        let body = response
            .bytes()
            .map_err(|e| CacheError::Network(e.to_string()))?;
        Ok(body.to_vec())
    }
}

/// Ids whose last network fetch failed, and when.
pub struct FailureTable {
    cooldown: Duration,
    clock: Arc<dyn Clock>,
    failures: Mutex<HashMap<u64, Instant>>,
}

impl std::fmt::Debug for FailureTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureTable")
            .field("cooldown", &self.cooldown)
            .field("failures", &self.failures.lock().len())
            .finish()
    }
}

impl FailureTable {
    pub fn new(cooldown: Duration, clock: Arc<dyn Clock>) -> Self {
        FailureTable {
            cooldown,
            clock,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_failed(&self, id: u64) {
        self.failures.lock().insert(id, self.clock.now());
    }

    /// Whether `id` failed within the cooldown. Expired records are removed.
    pub fn has_failed(&self, id: u64) -> bool {
        let mut failures = self.failures.lock();
        let Some(failed_at) = failures.get(&id).copied() else {
            return false;
        };
        if self.clock.now().saturating_duration_since(failed_at) <= self.cooldown {
            return true;
        }
        failures.remove(&id);
        false
    }
}

/// Configures and initializes a [`CdnDownloader`].
pub struct CdnDownloaderBuilder {
    generation: CdnGeneration,
    base_url: Option<String>,
    cache_dir: PathBuf,
    failure_cooldown: Duration,
    http_timeout: Duration,
    fetcher: Option<Arc<dyn HttpFetch>>,
    clock: Arc<dyn Clock>,
}

impl CdnDownloaderBuilder {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Directory holding the on-disk [`CdnCache`]. Default is `./cdn_cache`.
    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    /// How long a failed id is not requested again. Default is 60 seconds.
    pub fn with_failure_cooldown(mut self, cooldown: Duration) -> Self {
        self.failure_cooldown = cooldown;
        self
    }

    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Replaces the `reqwest` fetcher.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn HttpFetch>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Checks the CDN is reachable (V0 and V1), reads the CDN index packages of the title in
    /// `game_directory` (V1 and V2) and opens the disk cache.
    pub fn initialize<P: AsRef<Path>>(self, game_directory: P) -> Result<CdnDownloader, CacheError> {
        let base_url = self
            .base_url
            .unwrap_or_else(|| self.generation.default_base_url().to_owned());
        let http: Arc<dyn HttpFetch> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(ReqwestFetcher::new(self.http_timeout)?),
        };

        if self.generation.checks_reachability() {
            http.fetch(&base_url).map_err(|e| {
                CacheError::Network(format!("CDN {base_url} is not reachable: {e}"))
            })?;
        }

        let mut entries = HashMap::new();
        if let Some(index_generation) = self.generation.index_generation() {
            let file_system = GameFileSystem::open(game_directory)?;
            for name in file_system.enumerate_files(CDN_INDEX_PATTERN)? {
                if let Err(e) = load_cdn_index(&file_system, &name, index_generation, &mut entries) {
                    warn!("Skipping CDN index {name}: {e}");
                }
            }
        }

        let cache = CdnCache::load(&self.cache_dir, self.generation.cache_name())?;
        info!(
            "CDN {:?} ready: {} remote objects, {} cached",
            self.generation,
            entries.len(),
            cache.len()
        );

        Ok(CdnDownloader {
            generation: self.generation,
            base_url,
            entries,
            cache,
            failures: FailureTable::new(self.failure_cooldown, self.clock),
            http,
        })
    }
}

fn load_cdn_index(
    file_system: &GameFileSystem,
    name: &str,
    generation: HashTableGeneration,
    entries: &mut HashMap<u64, CdnEntry>,
) -> Result<(), CacheError> {
    let handle = file_system.open_file(name)?;
    let mut reader = BufReader::new(handle.cursor());
    let header = generation.read_header(&mut reader)?;
    for record in generation.read_records(&mut reader, &header)? {
        entries.insert(
            record.key,
            CdnEntry {
                hash: record.key,
                size: record.size,
                flags: record.flags,
            },
        );
    }
    debug!("Loaded CDN index {name}");
    Ok(())
}

/// Downloads objects from the CDN of one title generation.
pub struct CdnDownloader {
    generation: CdnGeneration,
    base_url: String,
    entries: HashMap<u64, CdnEntry>,
    cache: CdnCache,
    failures: FailureTable,
    http: Arc<dyn HttpFetch>,
}

impl std::fmt::Debug for CdnDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdnDownloader")
            .field("generation", &self.generation)
            .field("base_url", &self.base_url)
            .field("entries", &self.entries.len())
            .field("cache", &self.cache)
            .field("failures", &self.failures)
            .finish()
    }
}

impl CdnDownloader {
    pub fn builder(generation: CdnGeneration) -> CdnDownloaderBuilder {
        CdnDownloaderBuilder {
            generation,
            base_url: None,
            cache_dir: PathBuf::from("cdn_cache"),
            failure_cooldown: DEFAULT_FAILURE_COOLDOWN,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            fetcher: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn generation(&self) -> CdnGeneration {
        self.generation
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The remote entry for `id`, if an index package lists it.
    pub fn entry(&self, id: u64) -> Option<&CdnEntry> {
        self.entries.get(&id)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn cache(&self) -> &CdnCache {
        &self.cache
    }

    /// Fetches and decodes an object, from the disk cache when possible.
    ///
    /// Returns `None` when the CDN does not list `id`, when `id` failed within the cooldown,
    /// or when the download or decode fails (the failure is logged, and download failures
    /// start a cooldown).
    pub fn extract_cdn_object(&self, id: u64, expected_size: Option<u64>) -> Option<Vec<u8>> {
        let entry = match self.generation {
            CdnGeneration::V0 => None,
            CdnGeneration::V1 | CdnGeneration::V2 => Some(*self.entries.get(&id)?),
        };
        let stored_size = entry.map(|entry| entry.size);

        match self.cache.extract(id, stored_size) {
            Ok(Some(stored)) => match self.decode(id, &stored, expected_size) {
                Ok(data) => {
                    debug!("CDN cache hit for {id:#018x}");
                    return Some(data);
                }
                Err(e) => warn!("Cached CDN object {id:#018x} did not decode: {e}"),
            },
            Ok(None) => {}
            Err(e) => warn!("Failed to read CDN cache for {id:#018x}: {e}"),
        }

        if self.failures.has_failed(id) {
            debug!("Skipping {id:#018x}: failed recently");
            return None;
        }

        let url = self.generation.object_url(&self.base_url, id, entry.as_ref());
        let stored = match self.http.fetch(&url) {
            Ok(stored) if stored_size.map_or(true, |size| size == stored.len() as u64) => stored,
            Ok(stored) => {
                warn!(
                    "CDN returned {} bytes for {id:#018x}, expected {stored_size:?}",
                    stored.len()
                );
                self.failures.add_failed(id);
                return None;
            }
            Err(e) => {
                warn!("Failed to download {id:#018x}: {e}");
                self.failures.add_failed(id);
                return None;
            }
        };

        if let Err(e) = self.cache.add(id, &stored) {
            warn!("Failed to cache CDN object {id:#018x}: {e}");
        }
        match self.decode(id, &stored, expected_size) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!("Downloaded CDN object {id:#018x} did not decode: {e}");
                None
            }
        }
    }

    fn decode(&self, id: u64, stored: &[u8], expected_size: Option<u64>) -> Result<Vec<u8>, CacheError> {
        let expected_size = expected_size.unwrap_or(0);
        match self.generation {
            CdnGeneration::V0 => {
                let prefix = stored
                    .get(..2)
                    .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize + 2)
                    .ok_or_else(|| CacheError::InvalidData("CDN object too short".into()))?;
                let payload = stored.get(prefix..).ok_or_else(|| {
                    CacheError::InvalidData(format!("CDN metadata of {prefix} bytes overruns object"))
                })?;
                decompress_xpak_object(
                    &mut Cursor::new(payload),
                    payload.len() as u64,
                    expected_size,
                    0,
                )
            }
            CdnGeneration::V1 | CdnGeneration::V2 => decompress_xsub_object(
                &mut Cursor::new(stored),
                id,
                stored.len() as u64,
                expected_size,
            ),
        }
    }
}
