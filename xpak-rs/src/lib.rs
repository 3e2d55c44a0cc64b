//! # xpak-rs
//!
//! `xpak-rs` reads the package archives Call of Duty titles ship their assets in and serves
//! individual objects by 64-bit content id.
//!
//! ## Features
//! - Hash-table packages (`.xpak`, `.xsub`) in plain directories or inside CASC storages
//! - Legacy flat-offset packages (`.ipak`)
//! - CASC storages: `.build.info`, build config, `.idx` index files, TVFS root and
//!   frame-based random access to BLTE-encoded files
//! - CDN fallback for on-demand titles with an on-disk cache and a retry cooldown
//! - Raw, LZ4, LZO1X and zlib blocks (Oodle blocks are reported as unsupported)
//!
//! ## Usage
//! Add to your `Cargo.toml`:
//! ```toml
//! [dependencies]
//! xpak-rs = "0.1"
//! ```
//!
//! ### Example: Loading a title and extracting objects
//! ```no_run
//! use xpak_rs::hash_table_archive::HashTableGeneration;
//! use xpak_rs::package_cache::{ArchiveFormat, PackageCache};
//! use xpak_rs::session::{ExportSession, SessionConfig};
//!
//! // Load every package of the title in the background.
//! let cache = PackageCache::new(ArchiveFormat::HashTable(HashTableGeneration::XsubV2));
//! cache.load_async("path/to/game").unwrap();
//!
//! let mut session = ExportSession::new(SessionConfig::default()).unwrap();
//! session.set_package_cache(cache);
//! session.package_cache().unwrap().wait_for_load();
//!
//! // Extract on the worker pool.
//! let ids = [0x1234_5678_9ABC_DEF0u64, 0x0FED_CBA9_8765_4321];
//! let summary = session.extract_many(&ids, |id, data| {
//!     if let Some(data) = data {
//!         println!("{id:#018x}: {} bytes", data.len());
//!     }
//! });
//! println!("{} extracted, {} missing", summary.extracted, summary.missing);
//! ```

pub mod archive_file_handle;
mod block_table;
pub mod casc_build_info;
pub mod casc_config;
pub mod casc_encoding_key;
pub mod casc_file;
mod casc_file_frame;
pub mod casc_file_info;
mod casc_file_span;
mod casc_key_mapping_table;
mod casc_span_header;
pub mod casc_storage;
pub mod cdn_cache;
pub mod cdn_downloader;
pub mod compression;
pub mod content_index;
mod entry;
pub mod error;
pub mod ext;
pub mod flat_offset_archive;
pub mod game_file_system;
pub mod hash_table_archive;
pub mod package_cache;
mod path_table_node_flags;
mod root_handler;
pub mod session;
mod span_info;
mod tvfs_root_handler;
mod utility;

pub use error::CacheError;
