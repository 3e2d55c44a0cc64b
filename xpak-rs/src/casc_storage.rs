use crate::{
    casc_build_info::CascBuildInfo,
    casc_config::CascConfig,
    casc_encoding_key::EncodingKey,
    casc_file::CascFile,
    casc_file_info::CascFileInfo,
    casc_file_span::CascFileSpan,
    casc_key_mapping_table::{sort_index_files, CascKeyMappingTable},
    content_index::ContentIndex,
    error::CacheError,
    root_handler::RootHandler,
};
use glob::glob;
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

/// Represents an open CASC storage directory, providing access to files and metadata.
///
/// `CascStorage` is the entry point for reading package archives that a title ships inside
/// Blizzard's CASC container. Opening a storage reads `.build.info`, the build config it
/// points to, every `Data/data/*.idx` index file and the TVFS root, after which files can
/// be listed through [`CascStorage::files`] and opened by name with
/// [`CascStorage::open_file`].
///
/// ```no_run
/// use std::io::Read;
/// use xpak_rs::casc_storage::CascStorage;
///
/// let storage = CascStorage::open("path/to/game").unwrap();
/// for file_info in storage.files().iter().filter(|f| f.exists) {
///     println!("{} ({} bytes)", file_info.file_name, file_info.file_size);
/// }
///
/// let mut file = storage.open_file("some/file/in/storage.xpak").unwrap();
/// let mut header = [0u8; 4];
/// file.read_exact(&mut header).unwrap();
/// ```
///
/// # Thread Safety
///
/// Every call to [`CascStorage::open_file`] opens its own handles to the data files, so a
/// single storage can be shared between threads without additional synchronization.
///
/// Only storages using the TVFS root format are supported.
#[derive(Debug)]
pub struct CascStorage {
    /// Path to the root of the storage directory.
    storage_path: PathBuf,
    /// Parsed build information from `.build.info`.
    build_info: CascBuildInfo,
    /// Parsed build configuration.
    config: CascConfig,
    /// Index and data files.
    data: DataFiles,
    /// Handler for the root file system.
    root_handler: RootHandler,
    /// List of files discovered in the storage, sorted by name.
    files: Vec<CascFileInfo>,
}

impl CascStorage {
    pub fn open<P: AsRef<Path>>(folder: P) -> Result<Self, CacheError> {
        let storage_path = folder.as_ref().to_path_buf();
        let data_path = storage_path.join("Data").join("data");
        debug!("Opening CASC storage at {}", storage_path.display());

        let build_info = Self::load_build_info(&storage_path)?;
        let config = Self::load_config_info(&build_info, &storage_path)?;
        let (index, index_key_length) = Self::load_index_files(&data_path)?;
        let data_file_paths = Self::load_data_files(&data_path)?;

        let data = DataFiles {
            index,
            index_key_length,
            data_file_paths,
        };
        let root_handler = Self::load_root_handler(&config, &data)?;
        let files = Self::load_files(&root_handler, &data);

        info!(
            "Opened CASC storage {} ({} index entries, {} files)",
            storage_path.display(),
            data.index.len(),
            files.len()
        );
        Ok(CascStorage {
            storage_path,
            build_info,
            config,
            data,
            root_handler,
            files,
        })
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    pub fn build_info(&self) -> &CascBuildInfo {
        &self.build_info
    }

    pub fn config(&self) -> &CascConfig {
        &self.config
    }

    /// Every file named by the root, including ones whose data is not local.
    pub fn files(&self) -> &[CascFileInfo] {
        &self.files
    }

    pub fn file_info(&self, name: &str) -> Option<&CascFileInfo> {
        self.files
            .binary_search_by(|info| info.file_name.as_str().cmp(name))
            .ok()
            .map(|i| &self.files[i])
    }

    /// The number of keys merged from the index files.
    pub fn index_len(&self) -> usize {
        self.data.index.len()
    }

    fn load_build_info(storage_path: &Path) -> Result<CascBuildInfo, CacheError> {
        fn find_build_info(dir: &Path) -> Option<PathBuf> {
            for entry in fs::read_dir(dir).ok()? {
                let path = entry.ok()?.path();
                if path.is_file() && path.file_name() == Some(".build.info".as_ref()) {
                    return Some(path);
                } else if path.is_dir() {
                    if let Some(found) = find_build_info(&path) {
                        return Some(found);
                    }
                }
            }
            None
        }

        let direct = storage_path.join(".build.info");
        let path = if direct.is_file() {
            Some(direct)
        } else {
            find_build_info(storage_path)
        };
        match path {
            Some(path) => CascBuildInfo::with_file(path),
            None => Err(CacheError::FileNotFound(
                "Failed to locate Build Info".into(),
            )),
        }
    }

    fn load_config_info(
        build_info: &CascBuildInfo,
        storage_path: &Path,
    ) -> Result<CascConfig, CacheError> {
        fn find_config(dir: &Path, build_key: &str) -> Option<PathBuf> {
            for entry in fs::read_dir(dir).ok()? {
                let path = entry.ok()?.path();
                if path.is_file() && path.file_name() == Some(build_key.as_ref()) {
                    return Some(path);
                } else if path.is_dir() {
                    if let Some(found) = find_config(&path, build_key) {
                        return Some(found);
                    }
                }
            }
            None
        }

        let build_key = build_info.get("Build Key", "").to_ascii_lowercase();
        if build_key.len() < 4 || !build_key.is_ascii() {
            return Err(CacheError::InvalidData(format!(
                "Invalid Build Key `{build_key}`"
            )));
        }
        let direct = storage_path
            .join("Data")
            .join("config")
            .join(&build_key[0..2])
            .join(&build_key[2..4])
            .join(&build_key);
        let path = if direct.is_file() {
            Some(direct)
        } else {
            find_config(storage_path, &build_key)
        };
        match path {
            Some(path) => CascConfig::with_file(path),
            None => Err(CacheError::FileNotFound(
                "Failed to locate Config Info".into(),
            )),
        }
    }

    fn load_index_files(data_path: &Path) -> Result<(ContentIndex<EncodingKey>, usize), CacheError> {
        let pattern = format!(
            "{}/*.idx",
            glob::Pattern::escape(&data_path.display().to_string())
        );
        let mut idx_files = glob(&pattern)?
            .filter_map(Result::ok)
            .collect::<Vec<_>>();
        sort_index_files(&mut idx_files);

        let mut index = ContentIndex::new();
        let mut key_length = 0usize;
        for idx_file in &idx_files {
            match CascKeyMappingTable::load(idx_file, &mut index) {
                Ok(table) => {
                    debug!(
                        "Loaded {} ({} entries, bucket {}, version {})",
                        idx_file.display(),
                        table.entry_count,
                        table.bucket_index,
                        table.version
                    );
                    key_length = key_length.max(table.encoding_key_length as usize);
                }
                Err(e) => warn!("Skipping index file {}: {e}", idx_file.display()),
            }
        }
        if index.is_empty() {
            return Err(CacheError::FileNotFound(format!(
                "No usable index files in {}",
                data_path.display()
            )));
        }
        Ok((index, key_length))
    }

    fn load_data_files(data_path: &Path) -> Result<Vec<Option<PathBuf>>, CacheError> {
        let pattern = format!(
            "{}/data.*",
            glob::Pattern::escape(&data_path.display().to_string())
        );
        let mut indexed_files: Vec<(usize, PathBuf)> = Vec::new();

        for entry in glob(&pattern)? {
            let path = entry.map_err(|e| CacheError::Other(format!("{e}")))?;
            if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                if let Ok(index) = ext.parse::<usize>() {
                    indexed_files.push((index, path));
                }
            }
        }

        let max_index = indexed_files.iter().map(|(i, _)| *i + 1).max().unwrap_or(0);
        let mut data_file_paths: Vec<Option<PathBuf>> = vec![None; max_index];
        for (index, path) in indexed_files {
            data_file_paths[index] = Some(path);
        }
        Ok(data_file_paths)
    }

    fn load_root_handler(config: &CascConfig, data: &DataFiles) -> Result<RootHandler, CacheError> {
        // The second value of `vfs-root` is the encoding key of the TVFS root.
        let key = config
            .get("vfs-root")
            .and_then(|var| var.values.get(1))
            .ok_or_else(|| CacheError::InvalidData("vfs-root not in config".to_string()))?;
        let encoding_key = EncodingKey::from_hex(key)?;

        let span = data.open_span(&encoding_key, 0)?;
        let mut stream = CascFile::new(vec![span]);
        RootHandler::read(&mut stream)
    }

    fn load_files(root_handler: &RootHandler, data: &DataFiles) -> Vec<CascFileInfo> {
        let mut files: Vec<CascFileInfo> = root_handler
            .file_entries()
            .values()
            .map(|entry| CascFileInfo {
                file_name: entry.name.clone(),
                file_size: entry.content_size(),
                exists: entry
                    .spans
                    .iter()
                    .all(|span| data.index.contains(&data.index_key(&span.encoding_key))),
            })
            .collect();
        files.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        files
    }

    /// Opens a file from the CASC storage by name, returning a new, independent handle.
    ///
    /// Each call returns a fresh `CascFile` with its own file position and cache,
    /// allowing safe, parallel reads from multiple threads.
    pub fn open_file(&self, name: &str) -> Result<CascFile, CacheError> {
        let entry = self
            .root_handler
            .file_entries()
            .get(name)
            .ok_or_else(|| CacheError::FileNotFound(format!("Entry not found: {name}")))?;

        let mut virtual_offset = 0u64;
        let mut spans = Vec::with_capacity(entry.spans.len());
        for span_info in &entry.spans {
            let span = self.data.open_span(&span_info.encoding_key, virtual_offset)?;
            virtual_offset = span.virtual_end_offset;
            spans.push(span);
        }
        Ok(CascFile::new(spans))
    }
}

/// The merged index files and the `data.NNN` files they point into.
#[derive(Debug)]
struct DataFiles {
    /// Truncated encoding key -> data file location, merged from every index file.
    index: ContentIndex<EncodingKey>,
    /// Key length used by the index files.
    index_key_length: usize,
    /// Paths to `data.NNN`, indexed by NNN.
    data_file_paths: Vec<Option<PathBuf>>,
}

impl DataFiles {
    fn index_key(&self, key: &EncodingKey) -> EncodingKey {
        key.truncated(self.index_key_length)
    }

    /// Opens the span stored under `key`, placing it at `virtual_offset` in its file.
    fn open_span(
        &self,
        key: &EncodingKey,
        virtual_offset: u64,
    ) -> Result<CascFileSpan<File>, CacheError> {
        let location = self
            .index
            .get(&self.index_key(key))
            .ok_or_else(|| CacheError::FileNotFound(format!("Encoding key {key} not in index")))?;
        let path = self
            .data_file_paths
            .get(location.archive_segment_index as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                CacheError::FileNotFound(format!(
                    "Missing data file data.{:03}",
                    location.archive_segment_index
                ))
            })?;
        CascFileSpan::open(File::open(path)?, location.offset, virtual_offset)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::casc_file::tests::blte_span;
    use crate::casc_key_mapping_table::tests::index_file;
    use crate::tvfs_root_handler::tests::tvfs_blob;
    use std::io::Read;

    pub(crate) const BUILD_KEY: &str = "abcdef0123456789abcdef0123456789";

    /// Writes a storage whose TVFS lists `files` under `pkg/`.
    pub(crate) fn write_storage(dir: &Path, files: &[(&str, Vec<u8>)]) {
        let data_dir = dir.join("Data").join("data");
        let config_dir = dir.join("Data").join("config").join("ab").join("cd");
        fs::create_dir_all(&data_dir).unwrap();
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(
            dir.join(".build.info"),
            format!("Branch!STRING:0|Build Key!HEX:16\nus|{BUILD_KEY}\n"),
        )
        .unwrap();
        fs::write(
            config_dir.join(BUILD_KEY),
            format!("vfs-root = {} {}\n", "00".repeat(16), "ee".repeat(16)),
        )
        .unwrap();

        let listing: Vec<(&str, [u8; 9], u32)> = files
            .iter()
            .enumerate()
            .map(|(i, (name, data))| (*name, [i as u8 + 1; 9], data.len() as u32))
            .collect();
        let root = tvfs_blob("pkg", &listing);

        let mut data = Vec::new();
        let mut entries = Vec::new();
        for (key, payload) in std::iter::once(([0xEEu8; 9], root))
            .chain(listing.iter().zip(files).map(|(l, f)| (l.1, f.1.clone())))
        {
            let frames: Vec<Vec<u8>> = payload.chunks(64).map(<[u8]>::to_vec).collect();
            let span = blte_span(&frames);
            entries.push((key, 0u32, data.len() as u64, span.len() as u32));
            data.extend(span);
        }
        fs::write(data_dir.join("data.000"), data).unwrap();
        fs::write(data_dir.join("0000000001.idx"), index_file(0, &entries)).unwrap();
    }

    #[test]
    fn storage_lists_and_opens_files() {
        let dir = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..300u32).map(|i| (i * 7) as u8).collect();
        write_storage(dir.path(), &[("a.xpak", payload.clone()), ("b.bin", vec![5; 10])]);

        let storage = CascStorage::open(dir.path()).unwrap();
        assert_eq!(storage.build_info().get("Build Key", ""), BUILD_KEY);
        assert_eq!(storage.index_len(), 3);
        let names: Vec<_> = storage.files().iter().map(|f| f.file_name.as_str()).collect();
        assert_eq!(names, vec!["pkg/a.xpak", "pkg/b.bin"]);
        assert!(storage.file_info("pkg/a.xpak").unwrap().exists);
        assert_eq!(storage.file_info("pkg/a.xpak").unwrap().file_size, 300);

        let mut file = storage.open_file("pkg/a.xpak").unwrap();
        assert_eq!(file.size(), 300);
        let mut contents = Vec::new();
        file.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, payload);

        assert!(matches!(
            storage.open_file("pkg/missing"),
            Err(CacheError::FileNotFound(_))
        ));
    }

    #[test]
    fn files_without_local_spans_are_not_openable() {
        let dir = tempfile::tempdir().unwrap();
        write_storage(dir.path(), &[("a.xpak", vec![1; 10])]);
        // Rewrite the index without the file's key.
        let data_dir = dir.path().join("Data").join("data");
        let raw = fs::read(data_dir.join("0000000001.idx")).unwrap();
        let root_entry_end = 0x28 + 18;
        let mut trimmed = raw[..root_entry_end].to_vec();
        trimmed[0x20..0x24].copy_from_slice(&18u32.to_le_bytes());
        fs::write(data_dir.join("0000000001.idx"), trimmed).unwrap();

        let storage = CascStorage::open(dir.path()).unwrap();
        assert!(!storage.file_info("pkg/a.xpak").unwrap().exists);
        assert!(storage.open_file("pkg/a.xpak").is_err());
    }

    #[test]
    fn missing_build_info_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            CascStorage::open(dir.path()),
            Err(CacheError::FileNotFound(_))
        ));
    }
}
