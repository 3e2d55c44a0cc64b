mod common;

use common::*;
use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use xpak_rs::cdn_downloader::{CdnDownloader, CdnGeneration, Clock, HttpFetch};
use xpak_rs::hash_table_archive::HashTableGeneration;
use xpak_rs::package_cache::{ArchiveFormat, CacheLoadState, PackageCache};
use xpak_rs::session::{ExportSession, SessionConfig};
use xpak_rs::CacheError;

fn loaded_cache(format: ArchiveFormat, dir: &std::path::Path) -> PackageCache {
    let cache = PackageCache::new(format);
    cache.load_async(dir).unwrap();
    cache.wait_for_load();
    cache
}

#[test]
fn test_xsub_objects_round_trip() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let objects: Vec<_> = (1..=40u64).map(|id| (id, payload(id, 10 + id as usize * 37))).collect();
    let (first, _) = xsub_package(true, 3, &objects[..20]);
    let (second, _) = xsub_package(true, 3, &objects[20..]);
    fs::write(dir.path().join("base_0.xsub"), first).unwrap();
    fs::write(dir.path().join("base_1.xsub"), second).unwrap();

    let cache = loaded_cache(ArchiveFormat::HashTable(HashTableGeneration::XsubV2), dir.path());
    assert_eq!(cache.object_count(), 40);
    assert_eq!(cache.segment_paths().len(), 2);
    for (id, bytes) in &objects {
        assert_eq!(cache.extract_object(*id, Some(bytes.len() as u64)).as_ref(), Some(bytes));
    }
    assert_eq!(cache.try_extract_object(0xDEAD, None).unwrap(), None);
    assert!(cache.extract_object(0xDEAD, None).is_none());
}

#[test]
fn test_known_and_unknown_ids() {
    let dir = tempfile::tempdir().unwrap();
    let (package, _) = xsub_package(
        false,
        3,
        &[(0xAABB, vec![0xAB; 16]), (0xCCDD, vec![0xCD; 32])],
    );
    fs::write(dir.path().join("core.xsub"), package).unwrap();

    let cache = loaded_cache(ArchiveFormat::HashTable(HashTableGeneration::Xsub), dir.path());
    assert_eq!(cache.extract_object(0xAABB, None).unwrap(), vec![0xAB; 16]);
    assert_eq!(cache.extract_object(0xCCDD, None).unwrap().len(), 32);
    assert!(cache.extract_object(0x9999, None).is_none());
    assert!(cache.contains(0xAABB));
    assert!(!cache.contains(0x9999));
}

#[test]
fn test_first_package_wins_for_duplicate_ids() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.xpak"), xpak_package(&[(7, b"from a".to_vec())])).unwrap();
    fs::write(dir.path().join("b.xpak"), xpak_package(&[(7, b"from b".to_vec()), (8, vec![8; 200])]))
        .unwrap();

    let cache = loaded_cache(ArchiveFormat::HashTable(HashTableGeneration::Xpak), dir.path());
    assert_eq!(cache.object_count(), 2);
    assert_eq!(cache.extract_object(7, None).unwrap(), b"from a");
    assert_eq!(cache.extract_object(8, None).unwrap(), vec![8; 200]);
}

#[test]
fn test_broken_packages_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let (package, _) = xsub_package(true, 3, &[(1, vec![1; 8])]);
    fs::write(dir.path().join("good.xsub"), package).unwrap();
    fs::write(dir.path().join("bad.xsub"), vec![0u8; 100]).unwrap();

    let cache = loaded_cache(ArchiveFormat::HashTable(HashTableGeneration::XsubV2), dir.path());
    assert!(cache.load_failure().is_none());
    assert_eq!(cache.object_count(), 1);
    assert_eq!(cache.extract_object(1, None).unwrap(), vec![1; 8]);
}

#[test]
fn test_split_data_packages() {
    let dir = tempfile::tempdir().unwrap();
    let (package, data) = xsub_package(true, 1, &[(0x42, payload(0x42, 1000))]);
    fs::write(dir.path().join("stream.xsub"), package).unwrap();
    fs::write(dir.path().join("stream.xsubdata"), data).unwrap();

    let cache = loaded_cache(ArchiveFormat::HashTable(HashTableGeneration::XsubV2), dir.path());
    assert_eq!(cache.extract_object(0x42, None).unwrap(), payload(0x42, 1000));
    assert!(cache.segment_paths()[0].ends_with("stream.xsubdata"));
}

#[test]
fn test_ipak_objects() {
    let dir = tempfile::tempdir().unwrap();
    let objects = vec![(0x1111u64, payload(1, 300)), (0x2222, payload(2, 5))];
    fs::write(dir.path().join("base.ipak"), ipak_package(&objects)).unwrap();

    let cache = loaded_cache(ArchiveFormat::FlatOffset, dir.path());
    assert_eq!(cache.object_count(), 2);
    for (id, bytes) in &objects {
        assert_eq!(&cache.extract_object(*id, None).unwrap(), bytes);
    }
    let raw = cache.extract_object_raw(0x2222).unwrap().unwrap();
    assert_eq!(raw.len(), 256);
}

#[test]
fn test_single_file_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("one.xpak");
    fs::write(&path, xpak_package(&[(5, vec![5; 50])])).unwrap();
    fs::write(dir.path().join("other.xpak"), xpak_package(&[(6, vec![6; 50])])).unwrap();

    let cache = PackageCache::new(ArchiveFormat::HashTable(HashTableGeneration::Xpak));
    cache.load_single_file_async(&path).unwrap();
    cache.wait_for_load();
    assert!(cache.load_failure().is_none());
    assert_eq!(cache.object_count(), 1);
    assert!(cache.extract_object(6, None).is_none());
    assert_eq!(cache.backing_path(), Some(path.as_path()));
}

#[test]
fn test_wait_for_load_is_a_barrier() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..8u64 {
        let objects: Vec<_> = (0..50).map(|n| (i * 1000 + n, payload(n, 64))).collect();
        let (package, _) = xsub_package(true, 3, &objects);
        fs::write(dir.path().join(format!("pkg_{i}.xsub")), package).unwrap();
    }

    let cache = PackageCache::new(ArchiveFormat::HashTable(HashTableGeneration::XsubV2));
    cache.load_async(dir.path()).unwrap();
    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                cache.wait_for_load();
                assert_eq!(cache.state(), CacheLoadState::Loaded);
                assert_eq!(cache.object_count(), 400);
            });
        }
    });
    cache.wait_for_load();
    cache.wait_for_load();
    assert_eq!(cache.extract_object(7049, None).unwrap(), payload(49, 64));
}

#[test]
fn test_concurrent_extraction() {
    let dir = tempfile::tempdir().unwrap();
    for chunk in 0..4u64 {
        let objects: Vec<_> = (chunk * 2000..(chunk + 1) * 2000)
            .map(|id| (id, payload(id, 24)))
            .collect();
        let (package, _) = xsub_package(true, 3, &objects);
        fs::write(dir.path().join(format!("chunk_{chunk}.xsub")), package).unwrap();
    }
    let cache = loaded_cache(ArchiveFormat::HashTable(HashTableGeneration::XsubV2), dir.path());
    assert_eq!(cache.object_count(), 8000);

    std::thread::scope(|scope| {
        for thread in 0..8u64 {
            let cache = &cache;
            scope.spawn(move || {
                for i in 0..1000u64 {
                    let id = (thread * 997 + i * 7) % 8000;
                    assert_eq!(cache.extract_object(id, None).unwrap(), payload(id, 24));
                }
            });
        }
    });
}

#[test]
fn test_casc_storages_require_build_info() {
    let dir = tempfile::tempdir().unwrap();
    let (package, _) = xsub_package(true, 3, &[(1, vec![1; 8])]);
    fs::write(dir.path().join("plain.xsub"), package).unwrap();

    let cache = loaded_cache(ArchiveFormat::Casc(HashTableGeneration::XsubV2), dir.path());
    assert!(cache.load_failure().is_some());
    assert_eq!(cache.object_count(), 0);
}

/// A clock moved by hand.
struct ManualClock {
    start: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    fn new() -> Self {
        ManualClock {
            start: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    fn set(&self, offset: Duration) {
        *self.offset.lock() = offset;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + *self.offset.lock()
    }
}

/// Serves fixed responses and counts every request.
#[derive(Default)]
struct FakeCdn {
    responses: Mutex<HashMap<String, Vec<u8>>>,
    requests: AtomicUsize,
}

impl FakeCdn {
    fn serve(&self, url: String, body: Vec<u8>) {
        self.responses.lock().insert(url, body);
    }

    fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl HttpFetch for FakeCdn {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, CacheError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| CacheError::Network(format!("404 {url}")))
    }
}

const BASE_URL: &str = "http://cdn.test/pc";

fn cdn_title(entries: &[(u64, u64, u64)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("title_cdn.xpak"), cdn_index(true, entries)).unwrap();
    dir
}

#[test]
fn test_cdn_failures_back_off() {
    init_tracing();
    let object = xsub_object(0x77, &payload(0x77, 90));
    let title = cdn_title(&[(0x77, object.len() as u64, 0)]);
    let cache_dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new());
    let cdn = Arc::new(FakeCdn::default());

    let downloader = CdnDownloader::builder(CdnGeneration::V2)
        .with_base_url(BASE_URL)
        .with_cache_dir(cache_dir.path())
        .with_fetcher(cdn.clone())
        .with_clock(clock.clone())
        .initialize(title.path())
        .unwrap();
    assert_eq!(downloader.entry_count(), 1);
    assert_eq!(cdn.requests(), 0);

    assert!(downloader.extract_cdn_object(0x77, None).is_none());
    assert_eq!(cdn.requests(), 1);

    let url = CdnGeneration::V2.object_url(BASE_URL, 0x77, downloader.entry(0x77));
    cdn.serve(url, object.clone());

    clock.set(Duration::from_secs(30));
    assert!(downloader.extract_cdn_object(0x77, None).is_none());
    assert_eq!(cdn.requests(), 1);

    clock.set(Duration::from_secs(61));
    assert_eq!(downloader.extract_cdn_object(0x77, None).unwrap(), payload(0x77, 90));
    assert_eq!(cdn.requests(), 2);

    // Served from the disk cache from now on.
    assert_eq!(downloader.extract_cdn_object(0x77, None).unwrap(), payload(0x77, 90));
    assert_eq!(cdn.requests(), 2);
    assert!(downloader.cache().contains(0x77));
}

#[test]
fn test_cdn_cache_survives_restarts() {
    let object = xsub_object(0x99, &payload(0x99, 40));
    let title = cdn_title(&[(0x99, object.len() as u64, 1)]);
    let cache_dir = tempfile::tempdir().unwrap();
    let url = format!("{BASE_URL}/22/99/0000000000000099_{:08x}_1", object.len());

    let cdn = Arc::new(FakeCdn::default());
    cdn.serve(url, object);
    let first = CdnDownloader::builder(CdnGeneration::V2)
        .with_base_url(BASE_URL)
        .with_cache_dir(cache_dir.path())
        .with_fetcher(cdn.clone())
        .initialize(title.path())
        .unwrap();
    assert_eq!(first.extract_cdn_object(0x99, Some(40)).unwrap(), payload(0x99, 40));
    assert_eq!(cdn.requests(), 1);
    assert!(first.extract_cdn_object(0x1234, None).is_none());
    assert_eq!(cdn.requests(), 1);
    drop(first);

    let offline = Arc::new(FakeCdn::default());
    let second = CdnDownloader::builder(CdnGeneration::V2)
        .with_base_url(BASE_URL)
        .with_cache_dir(cache_dir.path())
        .with_fetcher(offline.clone())
        .initialize(title.path())
        .unwrap();
    assert_eq!(second.extract_cdn_object(0x99, None).unwrap(), payload(0x99, 40));
    assert_eq!(offline.requests(), 0);
}

#[test]
fn test_cdn_size_mismatch_is_a_failure() {
    let object = xsub_object(0x55, &payload(0x55, 60));
    let title = cdn_title(&[(0x55, object.len() as u64, 0)]);
    let cache_dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new());
    let cdn = Arc::new(FakeCdn::default());

    let downloader = CdnDownloader::builder(CdnGeneration::V2)
        .with_base_url(BASE_URL)
        .with_cache_dir(cache_dir.path())
        .with_fetcher(cdn.clone())
        .with_clock(clock.clone())
        .initialize(title.path())
        .unwrap();
    let url = CdnGeneration::V2.object_url(BASE_URL, 0x55, downloader.entry(0x55));
    let mut truncated = object.clone();
    truncated.truncate(object.len() - 8);
    cdn.serve(url, truncated);

    assert!(downloader.extract_cdn_object(0x55, None).is_none());
    assert_eq!(cdn.requests(), 1);
    assert!(!downloader.cache().contains(0x55));

    clock.set(Duration::from_secs(30));
    assert!(downloader.extract_cdn_object(0x55, None).is_none());
    assert_eq!(cdn.requests(), 1);
    assert!(!downloader.cache().contains(0x55));
}

#[test]
fn test_unreachable_v1_cdn_fails_to_initialize() {
    let title = cdn_title(&[]);
    let cache_dir = tempfile::tempdir().unwrap();
    let result = CdnDownloader::builder(CdnGeneration::V1)
        .with_base_url(BASE_URL)
        .with_cache_dir(cache_dir.path())
        .with_fetcher(Arc::new(FakeCdn::default()))
        .initialize(title.path());
    assert!(matches!(result, Err(CacheError::Network(_))));
}

#[test]
fn test_session_falls_back_to_the_cdn() {
    let dir = tempfile::tempdir().unwrap();
    let (package, _) = xsub_package(true, 3, &[(1, vec![1; 10])]);
    fs::write(dir.path().join("local.xsub"), package).unwrap();
    let remote = xsub_object(2, &[2; 20]);
    fs::write(dir.path().join("title_cdn.xpak"), cdn_index(true, &[(2, remote.len() as u64, 0)]))
        .unwrap();

    let cache_dir = tempfile::tempdir().unwrap();
    let cdn = Arc::new(FakeCdn::default());
    let downloader = CdnDownloader::builder(CdnGeneration::V2)
        .with_base_url(BASE_URL)
        .with_cache_dir(cache_dir.path())
        .with_fetcher(cdn.clone())
        .initialize(dir.path())
        .unwrap();
    cdn.serve(
        CdnGeneration::V2.object_url(BASE_URL, 2, downloader.entry(2)),
        remote,
    );

    let mut session = ExportSession::new(SessionConfig {
        worker_threads: 2,
        ..Default::default()
    })
    .unwrap();
    session.set_package_cache(loaded_cache(
        ArchiveFormat::HashTable(HashTableGeneration::XsubV2),
        dir.path(),
    ));
    session.set_cdn(downloader);

    let results = Mutex::new(HashMap::new());
    let summary = session.extract_many(&[1, 2, 3], |id, data| {
        results.lock().insert(id, data);
    });
    assert_eq!((summary.extracted, summary.missing, summary.skipped), (2, 1, 0));
    let results = results.into_inner();
    assert_eq!(results[&1], Some(vec![1; 10]));
    assert_eq!(results[&2], Some(vec![2; 20]));
    assert_eq!(results[&3], None);
}
