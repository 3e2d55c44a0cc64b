use crate::content_index::{ArchiveSegmentTable, ContentIndex, ContentLocation};
use crate::error::CacheError;
use crate::flat_offset_archive;
use crate::game_file_system::GameFileSystem;
use crate::hash_table_archive::{self, HashTableGeneration, PackageLoad};
use parking_lot::{Condvar, Mutex};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// The archive families a [`PackageCache`] can read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveFormat {
    /// Legacy `.ipak` archives in a plain directory.
    FlatOffset,
    /// Hash-table packages, read from CASC when the directory has a `.build.info` and from
    /// the directory otherwise.
    HashTable(HashTableGeneration),
    /// Hash-table packages that only ship inside a CASC storage.
    Casc(HashTableGeneration),
}

/// Load progress of a [`PackageCache`]. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CacheLoadState {
    NotLoaded,
    Loading,
    Loaded,
}

/// The index a load publishes. Written by the load thread only, read-only once published.
#[derive(Debug, Default)]
struct PackageIndex {
    objects: ContentIndex<u64>,
    segments: ArchiveSegmentTable,
    failure: Option<String>,
}

#[derive(Debug)]
struct Shared {
    format: ArchiveFormat,
    state: Mutex<CacheLoadState>,
    loaded: Condvar,
    backing_path: OnceLock<PathBuf>,
    index: OnceLock<PackageIndex>,
}

impl Shared {
    fn publish(&self, index: PackageIndex) {
        let objects = index.objects.len();
        let segments = index.segments.len();
        // Only the one load thread ever publishes.
        let _ = self.index.set(index);
        *self.state.lock() = CacheLoadState::Loaded;
        self.loaded.notify_all();
        info!("Package cache loaded: {objects} objects in {segments} segments");
    }
}

/// A cache of package objects addressed by 64-bit content id.
///
/// A cache is loaded once, in the background, with [`PackageCache::load_async`] or
/// [`PackageCache::load_single_file_async`]. Callers wait for the load with
/// [`PackageCache::wait_for_load`]; afterwards any number of threads may extract objects
/// concurrently.
///
/// ```no_run
/// use xpak_rs::hash_table_archive::HashTableGeneration;
/// use xpak_rs::package_cache::{ArchiveFormat, PackageCache};
///
/// let cache = PackageCache::new(ArchiveFormat::HashTable(HashTableGeneration::XsubV2));
/// cache.load_async("path/to/game").unwrap();
/// cache.wait_for_load();
/// if let Some(bytes) = cache.extract_object(0x1234_5678_9ABC_DEF0, None) {
///     println!("{} bytes", bytes.len());
/// }
/// ```
///
/// Dropping a cache blocks until an in-flight load has finished.
#[derive(Debug)]
pub struct PackageCache {
    shared: Arc<Shared>,
    loader: Mutex<Option<JoinHandle<()>>>,
}

impl PackageCache {
    pub fn new(format: ArchiveFormat) -> Self {
        PackageCache {
            shared: Arc::new(Shared {
                format,
                state: Mutex::new(CacheLoadState::NotLoaded),
                loaded: Condvar::new(),
                backing_path: OnceLock::new(),
                index: OnceLock::new(),
            }),
            loader: Mutex::new(None),
        }
    }

    pub fn format(&self) -> ArchiveFormat {
        self.shared.format
    }

    pub fn state(&self) -> CacheLoadState {
        *self.shared.state.lock()
    }

    /// Starts loading every package of a title below `base_path` on a background thread.
    ///
    /// Packages that fail to parse are logged and skipped. Fails if the cache has already
    /// been asked to load.
    pub fn load_async<P: AsRef<Path>>(&self, base_path: P) -> Result<(), CacheError> {
        let base_path = base_path.as_ref().to_path_buf();
        self.start_load(base_path, |format, base_path| load_title(format, base_path))
    }

    /// Starts loading a single package file on a background thread.
    ///
    /// Unlike [`PackageCache::load_async`], a parse failure aborts the load: the cache still
    /// reaches [`CacheLoadState::Loaded`] but indexes nothing, and
    /// [`PackageCache::load_failure`] reports why.
    pub fn load_single_file_async<P: AsRef<Path>>(&self, file_path: P) -> Result<(), CacheError> {
        let file_path = file_path.as_ref().to_path_buf();
        self.start_load(file_path, |format, file_path| {
            load_single_file(format, file_path).unwrap_or_else(|e| {
                warn!("Failed to load {}: {e}", file_path.display());
                PackageIndex {
                    failure: Some(e.to_string()),
                    ..Default::default()
                }
            })
        })
    }

    fn start_load<F>(&self, path: PathBuf, load: F) -> Result<(), CacheError>
    where
        F: FnOnce(ArchiveFormat, &Path) -> PackageIndex + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock();
            if *state != CacheLoadState::NotLoaded {
                return Err(CacheError::Other(format!(
                    "Package cache already {:?}",
                    *state
                )));
            }
            *state = CacheLoadState::Loading;
        }
        let _ = self.shared.backing_path.set(path.clone());

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("package-cache-load".into())
            .spawn(move || {
                let index = load(shared.format, &path);
                shared.publish(index);
            });
        match spawned {
            Ok(handle) => {
                *self.loader.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.publish(PackageIndex {
                    failure: Some(e.to_string()),
                    ..Default::default()
                });
                Err(CacheError::Io(e))
            }
        }
    }

    /// Blocks until the cache is [`CacheLoadState::Loaded`].
    ///
    /// Returns immediately once loaded. Must not be called on a cache that was never asked
    /// to load.
    pub fn wait_for_load(&self) {
        let mut state = self.shared.state.lock();
        while *state != CacheLoadState::Loaded {
            self.shared.loaded.wait(&mut state);
        }
    }

    /// Why a single-file load indexed nothing, if it failed.
    pub fn load_failure(&self) -> Option<String> {
        self.shared.index.get()?.failure.clone()
    }

    /// The published index, waiting out a load in progress.
    fn index(&self) -> Option<&PackageIndex> {
        if self.state() == CacheLoadState::NotLoaded {
            return None;
        }
        self.wait_for_load();
        self.shared.index.get()
    }

    fn locate(&self, id: u64) -> Option<(&PackageIndex, ContentLocation)> {
        let index = self.index()?;
        let location = *index.objects.get(&id)?;
        Some((index, location))
    }

    pub fn contains(&self, id: u64) -> bool {
        self.locate(id).is_some()
    }

    pub fn object_count(&self) -> usize {
        self.index().map_or(0, |index| index.objects.len())
    }

    /// Extracts and decodes an object.
    ///
    /// `Ok(None)` means the id is not indexed. `expected_size` is the decompressed size known
    /// by the caller, if any.
    pub fn try_extract_object(
        &self,
        id: u64,
        expected_size: Option<u64>,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        let Some((index, location)) = self.locate(id) else {
            return Ok(None);
        };
        let expected_size = expected_size.unwrap_or(0);
        let data = match self.shared.format {
            ArchiveFormat::FlatOffset => {
                flat_offset_archive::extract_object(&index.segments, &location)?
            }
            ArchiveFormat::HashTable(generation) | ArchiveFormat::Casc(generation) => {
                hash_table_archive::extract_object(
                    generation,
                    &index.segments,
                    id,
                    &location,
                    expected_size,
                )?
            }
        };
        Ok(Some(data))
    }

    /// Like [`PackageCache::try_extract_object`], but logs failures and reports them as not
    /// found.
    pub fn extract_object(&self, id: u64, expected_size: Option<u64>) -> Option<Vec<u8>> {
        self.try_extract_object(id, expected_size)
            .unwrap_or_else(|e| {
                warn!("Failed to extract object {id:#018x}: {e}");
                None
            })
    }

    /// The stored bytes of an object without decoding.
    pub fn extract_object_raw(&self, id: u64) -> Result<Option<Vec<u8>>, CacheError> {
        let Some((index, location)) = self.locate(id) else {
            return Ok(None);
        };
        hash_table_archive::extract_object_raw(&index.segments, &location).map(Some)
    }

    /// Hashes a human-readable asset name into a content id.
    ///
    /// None of the supported formats store names, so ids always come pre-hashed from the
    /// game layer and this returns `None`.
    pub fn hash_id(&self, _name: &str) -> Option<u64> {
        None
    }

    /// The directory or file this cache was loaded from.
    pub fn backing_path(&self) -> Option<&Path> {
        self.shared.backing_path.get().map(PathBuf::as_path)
    }

    /// Paths of the loaded archive segments, in segment order.
    pub fn segment_paths(&self) -> Vec<String> {
        self.index().map_or_else(Vec::new, |index| {
            index.segments.paths().map(str::to_owned).collect()
        })
    }
}

impl Drop for PackageCache {
    fn drop(&mut self) {
        if let Some(loader) = self.loader.get_mut().take() {
            if loader.join().is_err() {
                warn!("Package cache load thread panicked");
            }
        }
    }
}

fn open_file_system(format: ArchiveFormat, base_path: &Path) -> Result<GameFileSystem, CacheError> {
    match format {
        ArchiveFormat::FlatOffset => GameFileSystem::directory(base_path),
        ArchiveFormat::HashTable(_) => GameFileSystem::open(base_path),
        ArchiveFormat::Casc(_) => GameFileSystem::casc(base_path),
    }
}

fn file_patterns(format: ArchiveFormat) -> &'static [&'static str] {
    match format {
        ArchiveFormat::FlatOffset => &[flat_offset_archive::FILE_PATTERN],
        ArchiveFormat::HashTable(generation) | ArchiveFormat::Casc(generation) => {
            generation.file_patterns()
        }
    }
}

/// Loads one package into `index`.
fn load_package(
    format: ArchiveFormat,
    file_system: &GameFileSystem,
    name: &str,
    index: &mut PackageIndex,
) -> Result<(), CacheError> {
    match format {
        ArchiveFormat::FlatOffset => {
            flat_offset_archive::load_package(
                file_system,
                name,
                &mut index.objects,
                &mut index.segments,
            )?;
        }
        ArchiveFormat::HashTable(generation) | ArchiveFormat::Casc(generation) => {
            let load = hash_table_archive::load_package(
                file_system,
                name,
                generation,
                &mut index.objects,
                &mut index.segments,
            )?;
            if load == PackageLoad::NoData {
                debug!("Skipped {name}: no object data");
            }
        }
    }
    Ok(())
}

fn load_title(format: ArchiveFormat, base_path: &Path) -> PackageIndex {
    let mut index = PackageIndex::default();
    let file_system = match open_file_system(format, base_path) {
        Ok(file_system) => file_system,
        Err(e) => {
            warn!("Failed to open {}: {e}", base_path.display());
            index.failure = Some(e.to_string());
            return index;
        }
    };

    for pattern in file_patterns(format) {
        let names = match file_system.enumerate_files(pattern) {
            Ok(names) => names,
            Err(e) => {
                warn!("Failed to enumerate {pattern} in {}: {e}", base_path.display());
                continue;
            }
        };
        for name in names {
            if let Err(e) = load_package(format, &file_system, &name, &mut index) {
                warn!("Skipping package {name}: {e}");
            }
        }
    }
    index
}

fn load_single_file(format: ArchiveFormat, file_path: &Path) -> Result<PackageIndex, CacheError> {
    let (Some(parent), Some(name)) = (file_path.parent(), file_path.file_name()) else {
        return Err(CacheError::FileNotFound(file_path.display().to_string()));
    };
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };
    let file_system = GameFileSystem::directory(parent)?;
    let mut index = PackageIndex::default();
    load_package(format, &file_system, &name.to_string_lossy(), &mut index)?;
    Ok(index)
}
