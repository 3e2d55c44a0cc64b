use crate::archive_file_handle::ArchiveFileHandle;
use crate::casc_storage::CascStorage;
use crate::error::CacheError;
use glob::{MatchOptions, Pattern};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Where a title's files are read from: a plain directory, or a CASC storage when the
/// directory carries a `.build.info`.
#[derive(Debug, Clone)]
pub enum GameFileSystem {
    Directory(PathBuf),
    Casc(Arc<CascStorage>),
}

impl GameFileSystem {
    /// Opens `dir`, choosing CASC when `dir/.build.info` exists.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, CacheError> {
        let dir = dir.as_ref();
        if dir.join(".build.info").is_file() {
            Self::casc(dir)
        } else {
            Self::directory(dir)
        }
    }

    pub fn directory<P: AsRef<Path>>(dir: P) -> Result<Self, CacheError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(CacheError::FileNotFound(format!(
                "Game directory {} does not exist",
                dir.display()
            )));
        }
        Ok(GameFileSystem::Directory(dir.to_path_buf()))
    }

    pub fn casc<P: AsRef<Path>>(dir: P) -> Result<Self, CacheError> {
        Ok(GameFileSystem::Casc(Arc::new(CascStorage::open(dir)?)))
    }

    pub fn is_casc(&self) -> bool {
        matches!(self, GameFileSystem::Casc(_))
    }

    /// Names of every available file whose file name matches `pattern` (e.g. `*.xpak`).
    ///
    /// Names are `/`-separated and relative to the root, sorted, and can be passed back to
    /// [`GameFileSystem::open_file`].
    pub fn enumerate_files(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let pattern = Pattern::new(pattern)?;
        let mut names = match self {
            GameFileSystem::Directory(root) => {
                let all = format!("{}/**/*", Pattern::escape(&root.display().to_string()));
                glob::glob(&all)?
                    .filter_map(Result::ok)
                    .filter(|path| path.is_file())
                    .filter(|path| file_name_matches(&pattern, path.to_str().unwrap_or_default()))
                    .filter_map(|path| {
                        let relative = path.strip_prefix(root).ok()?;
                        Some(relative.to_string_lossy().replace('\\', "/"))
                    })
                    .collect::<Vec<_>>()
            }
            GameFileSystem::Casc(storage) => storage
                .files()
                .iter()
                .filter(|info| info.exists && file_name_matches(&pattern, &info.file_name))
                .map(|info| info.file_name.clone())
                .collect(),
        };
        names.sort();
        Ok(names)
    }

    pub fn exists(&self, name: &str) -> bool {
        match self {
            GameFileSystem::Directory(root) => root.join(name).is_file(),
            GameFileSystem::Casc(storage) => storage.file_info(name).is_some_and(|f| f.exists),
        }
    }

    /// Opens `name` as a shareable archive handle.
    pub fn open_file(&self, name: &str) -> Result<ArchiveFileHandle, CacheError> {
        match self {
            GameFileSystem::Directory(root) => ArchiveFileHandle::open(root.join(name)),
            GameFileSystem::Casc(storage) => {
                ArchiveFileHandle::from_reader(name, storage.open_file(name)?)
            }
        }
    }

    /// Where the files come from, for diagnostics.
    pub fn root(&self) -> &Path {
        match self {
            GameFileSystem::Directory(root) => root,
            GameFileSystem::Casc(storage) => storage.storage_path(),
        }
    }
}

fn file_name_matches(pattern: &Pattern, name: &str) -> bool {
    let file_name = name.rsplit(['/', '\\']).next().unwrap_or(name);
    pattern.matches_with(file_name, MATCH_OPTIONS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::casc_storage::tests::write_storage;
    use std::fs;

    #[test]
    fn directories_are_searched_recursively() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.xpak"), [1u8; 4]).unwrap();
        fs::write(dir.path().join("sub").join("b_cdn.XPAK"), [2u8; 8]).unwrap();
        fs::write(dir.path().join("c.xsub"), [3u8; 2]).unwrap();

        let game_fs = GameFileSystem::open(dir.path()).unwrap();
        assert!(!game_fs.is_casc());
        assert_eq!(game_fs.enumerate_files("*.xpak").unwrap(), vec!["a.xpak", "sub/b_cdn.XPAK"]);
        assert_eq!(game_fs.enumerate_files("*cdn.xpak").unwrap(), vec!["sub/b_cdn.XPAK"]);
        assert!(game_fs.exists("c.xsub"));
        assert_eq!(game_fs.open_file("sub/b_cdn.XPAK").unwrap().size(), 8);
        assert!(game_fs.open_file("missing.xpak").is_err());
    }

    #[test]
    fn build_info_selects_casc() {
        let dir = tempfile::tempdir().unwrap();
        write_storage(dir.path(), &[("one.xsub", vec![7; 100]), ("two.xpak", vec![8; 10])]);

        let game_fs = GameFileSystem::open(dir.path()).unwrap();
        assert!(game_fs.is_casc());
        assert_eq!(game_fs.enumerate_files("*.xsub").unwrap(), vec!["pkg/one.xsub"]);
        assert!(game_fs.exists("pkg/two.xpak"));
        let handle = game_fs.open_file("pkg/one.xsub").unwrap();
        assert_eq!(handle.size(), 100);
        assert_eq!(handle.read_at(90, 10).unwrap(), vec![7; 10]);
    }

    #[test]
    fn missing_directories_fail() {
        assert!(GameFileSystem::open("/definitely/not/here").is_err());
    }
}
