//! Cache directory path management
//!
//! This module provides the `CachePaths` struct which manages all filesystem paths
//! for the cache directory layout:
//!
//! ```text
//! ~/.cache/gitsync/
//! ├── gitsync.json                  # Settings
//! ├── mirrors/
//! │   ├── map                       # url = dirname
//! │   ├── invalid                   # invalidated dirnames
//! │   └── git-1A2B3C4D.git/         # Bare mirror
//! │       ├── gitsync.submodules    # Submodule urls of this repo
//! │       └── gitsync.timestamp     # Touched on every use
//! └── locks/
//!     └── mirrors.lock              # flock guarding map + invalid
//! ```

use std::path::{Path, PathBuf};

/// Environment variable overriding the cache root.
pub const CACHE_DIR_ENV: &str = "GITSYNC_CACHE_DIR";

/// Manages all filesystem paths for the cache directory layout
#[derive(Debug, Clone)]
pub struct CachePaths {
    root: PathBuf,
}

impl CachePaths {
    /// Creates a new CachePaths with the specified root directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root cache directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the settings file path: `{root}/gitsync.json`
    pub fn settings_file(&self) -> PathBuf {
        self.root.join("gitsync.json")
    }

    /// Returns the mirrors directory path: `{root}/mirrors`
    pub fn mirrors_dir(&self) -> PathBuf {
        self.root.join("mirrors")
    }

    /// Returns the url-to-dirname mapping file: `{root}/mirrors/map`
    pub fn map_file(&self) -> PathBuf {
        self.mirrors_dir().join("map")
    }

    /// Returns the invalidated dirname list: `{root}/mirrors/invalid`
    pub fn invalid_file(&self) -> PathBuf {
        self.mirrors_dir().join("invalid")
    }

    /// Returns the lock file guarding the mirror store: `{root}/locks/mirrors.lock`
    pub fn mirrors_lock(&self) -> PathBuf {
        self.root.join("locks").join("mirrors.lock")
    }
}

/// Submodule url cache inside a mirror: `{mirror}/gitsync.submodules`
pub fn submodules_file(mirror: &Path) -> PathBuf {
    mirror.join("gitsync.submodules")
}

/// Last-used marker inside a mirror: `{mirror}/gitsync.timestamp`
pub fn timestamp_file(mirror: &Path) -> PathBuf {
    mirror.join("gitsync.timestamp")
}

impl Default for CachePaths {
    /// Creates a CachePaths from `GITSYNC_CACHE_DIR`, or the system cache directory + "gitsync"
    ///
    /// Uses `dirs::cache_dir()` which resolves to:
    /// - Linux: `~/.cache`
    /// - macOS: `~/Library/Caches`
    /// - Windows: `C:\Users\<user>\AppData\Local`
    fn default() -> Self {
        if let Some(root) = std::env::var_os(CACHE_DIR_ENV).filter(|v| !v.is_empty()) {
            return Self::new(root);
        }
        let cache_dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".cache"));
        Self::new(cache_dir.join("gitsync"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_paths() -> CachePaths {
        CachePaths::new("cache-root")
    }

    #[test]
    fn test_root() {
        assert_eq!(test_paths().root(), Path::new("cache-root"));
    }

    #[test]
    fn test_store_files_live_with_mirrors() {
        let paths = test_paths();
        let mirrors = PathBuf::from("cache-root").join("mirrors");
        assert_eq!(paths.mirrors_dir(), mirrors);
        assert_eq!(paths.map_file(), mirrors.join("map"));
        assert_eq!(paths.invalid_file(), mirrors.join("invalid"));
    }

    #[test]
    fn test_lock_and_settings() {
        let paths = test_paths();
        assert_eq!(
            paths.mirrors_lock(),
            PathBuf::from("cache-root").join("locks").join("mirrors.lock")
        );
        assert_eq!(
            paths.settings_file(),
            PathBuf::from("cache-root").join("gitsync.json")
        );
    }

    #[test]
    fn test_per_mirror_files() {
        let mirror = Path::new("m").join("git-00000001.git");
        assert_eq!(submodules_file(&mirror), mirror.join("gitsync.submodules"));
        assert_eq!(timestamp_file(&mirror), mirror.join("gitsync.timestamp"));
    }
}
