use crate::archive_file_handle::ArchiveFileHandle;
use std::collections::hash_map::{self, HashMap};
use std::hash::Hash;

/// Where one object lives inside the archive segments of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContentLocation {
    /// Index into the owning [`ArchiveSegmentTable`].
    pub archive_segment_index: u32,
    pub offset: u64,
    pub compressed_size: u64,
    /// Zero when the archive does not record it.
    pub decompressed_size: u64,
}

/// Maps content keys (64-bit ids, or CASC encoding keys) to their [`ContentLocation`].
///
/// Filled by a single loader; read-only once published.
#[derive(Debug, Clone)]
pub struct ContentIndex<K = u64> {
    entries: HashMap<K, ContentLocation>,
}

impl<K: Eq + Hash> Default for ContentIndex<K> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash> ContentIndex<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a location, replacing (and returning) any previous one for the same key.
    pub fn insert(&mut self, key: K, location: ContentLocation) -> Option<ContentLocation> {
        self.entries.insert(key, location)
    }

    /// Inserts a location only when the key is not indexed yet. Returns whether it was added.
    pub fn insert_if_absent(&mut self, key: K, location: ContentLocation) -> bool {
        match self.entries.entry(key) {
            hash_map::Entry::Occupied(_) => false,
            hash_map::Entry::Vacant(slot) => {
                slot.insert(location);
                true
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<&ContentLocation> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut ContentLocation> {
        self.entries.get_mut(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> hash_map::Iter<'_, K, ContentLocation> {
        self.entries.iter()
    }
}

#[derive(Debug)]
struct ArchiveSegment {
    handle: ArchiveFileHandle,
    format_version: u16,
}

/// The ordered archive segments a cache reads from, addressed by
/// [`ContentLocation::archive_segment_index`]. Append-only while loading.
#[derive(Debug, Default)]
pub struct ArchiveSegmentTable {
    segments: Vec<ArchiveSegment>,
}

impl ArchiveSegmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a segment and returns its index. `format_version` is the version field of the
    /// segment's header, kept for decoders whose block layout depends on it.
    pub fn push(&mut self, handle: ArchiveFileHandle, format_version: u16) -> u32 {
        self.segments.push(ArchiveSegment {
            handle,
            format_version,
        });
        (self.segments.len() - 1) as u32
    }

    /// The index the next pushed segment will receive.
    pub fn next_index(&self) -> u32 {
        self.segments.len() as u32
    }

    pub fn get(&self, index: u32) -> Option<&ArchiveFileHandle> {
        self.segments.get(index as usize).map(|segment| &segment.handle)
    }

    pub fn format_version(&self, index: u32) -> Option<u16> {
        self.segments
            .get(index as usize)
            .map(|segment| segment.format_version)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Paths of every segment in index order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(|segment| segment.handle.path())
    }
}
