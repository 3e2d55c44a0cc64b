use crate::error::CacheError;
use crate::ext::io_ext::BytesReadExt;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// `CDNI`
pub const CDN_INFO_MAGIC: u32 = 0x494E4443;
const CDN_INFO_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CdnCacheEntry {
    offset: u64,
    size: u64,
}

/// Objects downloaded from the CDN, persisted on disk so they are only fetched once.
///
/// Two files live in the cache directory: `<name>.cdn_data` holds the payloads back to back,
/// and `<name>.cdn_info` lists `{hash, offset, size}` for each of them. The info file is
/// rewritten after every [`CdnCache::add`].
#[derive(Debug)]
pub struct CdnCache {
    info_path: PathBuf,
    data_path: PathBuf,
    entries: Mutex<HashMap<u64, CdnCacheEntry>>,
}

impl CdnCache {
    /// Opens (creating the directory if needed) the cache called `name` inside `dir`.
    ///
    /// A missing or unreadable info file yields an empty cache.
    pub fn load<P: AsRef<Path>>(dir: P, name: &str) -> Result<Self, CacheError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let info_path = dir.join(format!("{name}.cdn_info"));
        let data_path = dir.join(format!("{name}.cdn_data"));

        let entries = match File::open(&info_path) {
            Ok(file) => Self::read_info(&mut BufReader::new(file)).unwrap_or_else(|e| {
                warn!("Ignoring CDN cache info {}: {e}", info_path.display());
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        debug!("Loaded CDN cache {name} with {} entries", entries.len());

        Ok(CdnCache {
            info_path,
            data_path,
            entries: Mutex::new(entries),
        })
    }

    fn read_info<R: Read>(reader: &mut R) -> Result<HashMap<u64, CdnCacheEntry>, CacheError> {
        if reader.read_u32::<LittleEndian>()? != CDN_INFO_MAGIC {
            return Err(CacheError::MalformedHeader("Bad CDN cache magic".into()));
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != CDN_INFO_VERSION {
            return Err(CacheError::MalformedHeader(format!(
                "Unsupported CDN cache version {version}"
            )));
        }
        let count = reader.read_u32::<LittleEndian>()?;
        let mut entries = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let hash = reader.read_u64::<LittleEndian>()?;
            let offset = reader.read_u64::<LittleEndian>()?;
            let size = reader.read_u64::<LittleEndian>()?;
            entries.insert(hash, CdnCacheEntry { offset, size });
        }
        Ok(entries)
    }

    fn write_info(&self, entries: &HashMap<u64, CdnCacheEntry>) -> Result<(), CacheError> {
        let mut sorted: Vec<_> = entries.iter().collect();
        sorted.sort_by_key(|(hash, _)| **hash);

        let mut writer = BufWriter::new(File::create(&self.info_path)?);
        writer.write_u32::<LittleEndian>(CDN_INFO_MAGIC)?;
        writer.write_u32::<LittleEndian>(CDN_INFO_VERSION)?;
        writer.write_u32::<LittleEndian>(sorted.len() as u32)?;
        for (hash, entry) in sorted {
            writer.write_u64::<LittleEndian>(*hash)?;
            writer.write_u64::<LittleEndian>(entry.offset)?;
            writer.write_u64::<LittleEndian>(entry.size)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Rewrites the info file.
    pub fn save(&self) -> Result<(), CacheError> {
        let entries = self.entries.lock();
        self.write_info(&entries)
    }

    /// Appends `data` to the data file and records it under `hash`, replacing any older copy.
    pub fn add(&self, hash: u64, data: &[u8]) -> Result<(), CacheError> {
        let mut entries = self.entries.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.data_path)?;
        let offset = file.seek(SeekFrom::End(0))?;
        file.write_all(data)?;
        file.flush()?;

        entries.insert(
            hash,
            CdnCacheEntry {
                offset,
                size: data.len() as u64,
            },
        );
        self.write_info(&entries)
    }

    /// Reads the cached copy of `hash`.
    ///
    /// Returns `Ok(None)` when nothing is cached, or when `expected_size` is given and the
    /// cached copy has a different size.
    pub fn extract(&self, hash: u64, expected_size: Option<u64>) -> Result<Option<Vec<u8>>, CacheError> {
        let Some(entry) = self.entries.lock().get(&hash).copied() else {
            return Ok(None);
        };
        if expected_size.is_some_and(|size| size != entry.size) {
            debug!(
                "CDN cache entry {hash:#018x} is {} bytes, expected {expected_size:?}",
                entry.size
            );
            return Ok(None);
        }

        let mut file = File::open(&self.data_path)?;
        let data_length = file.metadata()?.len();
        if entry.offset.checked_add(entry.size).map_or(true, |end| end > data_length) {
            return Err(CacheError::InvalidData(format!(
                "CDN cache entry {hash:#018x} ({:#x} bytes at {:#x}) outside {} bytes of data",
                entry.size, entry.offset, data_length
            )));
        }
        file.seek(SeekFrom::Start(entry.offset))?;
        Ok(Some(file.read_bytes(entry.size as usize)?))
    }

    pub fn contains(&self, hash: u64) -> bool {
        self.entries.lock().contains_key(&hash)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
