//! Removal of mirrors nobody uses any more.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use crate::git::read_config_bool;
use crate::mirror::{MirrorManager, is_unused_for, read_submodules};

/// Mirror config key that protects a mirror from the cleaner when false.
const CLEANUP_ENABLED_KEY: &str = "gitsync.freeDiskSpaceCleanupEnabled";

/// Counters of one cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    /// Directories whose name was invalidated.
    pub removed_invalid: u64,
    /// Directories no url maps to.
    pub removed_unmapped: u64,
    /// Mirrors unused for longer than the maximum age.
    pub removed_unused: u64,
    /// Mappings whose directory no longer exists.
    pub dropped_mappings: u64,
    pub kept: u64,
}

/// Removes invalid, unmapped and long unused mirrors.
pub struct MirrorCleaner<'a> {
    mirrors: &'a MirrorManager,
    max_age: Duration,
}

fn remove_dir(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl<'a> MirrorCleaner<'a> {
    pub fn new(mirrors: &'a MirrorManager, max_age: Duration) -> Self {
        Self { mirrors, max_age }
    }

    /// `keep` plus, transitively, the submodule urls recorded in their mirrors.
    fn expand_keep(&self, keep: &BTreeSet<String>) -> BTreeSet<String> {
        let mappings = self.mirrors.mappings();
        let mut expanded = BTreeSet::new();
        let mut pending: Vec<String> = keep.iter().cloned().collect();
        while let Some(url) = pending.pop() {
            if !expanded.insert(url.clone()) {
                continue;
            }
            if let Some(dir) = mappings.get(&url) {
                pending.extend(read_submodules(dir).into_iter().filter(|sub| !expanded.contains(sub)));
            }
        }
        expanded
    }

    /// Clean the mirrors directory. Mirrors of urls in `keep` and their submodules are kept.
    pub fn cleanup(&self, keep: &BTreeSet<String>) -> CleanupStats {
        let mut stats = CleanupStats::default();

        let mut mappings = self.mirrors.mappings();
        mappings.retain(|url, dir| {
            if dir.is_dir() {
                return true;
            }
            log::info!("Mirror {} of {} is gone, removing its mapping", dir.display(), url);
            self.mirrors.remove_mapping(url);
            stats.dropped_mappings += 1;
            false
        });

        let base = self.mirrors.base_dir();
        if let Ok(entries) = fs::read_dir(&base) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                let invalid = self.mirrors.is_invalid(&name);
                if !invalid && mappings.values().any(|dir| *dir == path) {
                    continue;
                }
                log::info!(
                    "Removing {} mirror directory {}",
                    if invalid { "invalidated" } else { "unmapped" },
                    path.display()
                );
                match remove_dir(&path) {
                    Ok(()) if invalid => stats.removed_invalid += 1,
                    Ok(()) => stats.removed_unmapped += 1,
                    Err(e) => log::warn!("Failed to remove {}: {}", path.display(), e),
                }
            }
        }

        let keep = self.expand_keep(keep);
        for (url, dir) in &mappings {
            let protected = keep.contains(url) || !read_config_bool(&dir.join("config"), CLEANUP_ENABLED_KEY, true);
            if protected || !is_unused_for(dir, self.max_age) {
                stats.kept += 1;
                continue;
            }
            log::info!("Removing mirror {} of {}, unused for more than {:?}", dir.display(), url, self.max_age);
            match remove_dir(dir) {
                Ok(()) => {
                    self.mirrors.remove_mapping(url);
                    stats.removed_unused += 1;
                }
                Err(e) => log::warn!("Failed to remove mirror {}: {}", dir.display(), e),
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    use filetime::{FileTime, set_file_mtime};
    use tempfile::tempdir;

    use crate::mirror::{persist_submodules, touch_last_used};
    use crate::paths::{CachePaths, timestamp_file};

    const WEEK: Duration = Duration::from_secs(7 * 24 * 3600);

    fn mirror(mirrors: &MirrorManager, url: &str, age: Duration) -> std::path::PathBuf {
        let dir = mirrors.get_mirror_dir(url);
        fs::create_dir_all(&dir).unwrap();
        touch_last_used(&dir).unwrap();
        let at = SystemTime::now() - age;
        set_file_mtime(timestamp_file(&dir), FileTime::from_system_time(at)).unwrap();
        dir
    }

    #[test]
    fn old_mirrors_are_removed_unless_kept() {
        let temp_dir = tempdir().expect("Failed to create temp directory");
        let mirrors = MirrorManager::new(CachePaths::new(temp_dir.path()));
        let old = mirror(&mirrors, "https://h/old.git", 2 * WEEK);
        let fresh = mirror(&mirrors, "https://h/fresh.git", Duration::ZERO);
        let kept = mirror(&mirrors, "https://h/kept.git", 2 * WEEK);
        let sub = mirror(&mirrors, "https://h/sub.git", 2 * WEEK);
        persist_submodules(&kept, &BTreeSet::from(["https://h/sub.git".to_string()]));

        let stats = MirrorCleaner::new(&mirrors, WEEK).cleanup(&BTreeSet::from(["https://h/kept.git".to_string()]));
        assert_eq!(stats.removed_unused, 1);
        assert_eq!(stats.kept, 3);
        assert!(!old.exists());
        assert!(fresh.exists() && kept.exists() && sub.exists());
        assert!(!mirrors.mappings().contains_key("https://h/old.git"));
    }

    #[test]
    fn config_flag_protects_a_mirror() {
        let temp_dir = tempdir().expect("Failed to create temp directory");
        let mirrors = MirrorManager::new(CachePaths::new(temp_dir.path()));
        let dir = mirror(&mirrors, "https://h/big.git", 2 * WEEK);
        fs::write(dir.join("config"), "[gitsync]\n\tfreeDiskSpaceCleanupEnabled = false\n").unwrap();

        let stats = MirrorCleaner::new(&mirrors, WEEK).cleanup(&BTreeSet::new());
        assert_eq!(stats.removed_unused, 0);
        assert!(dir.exists());
    }

    #[test]
    fn invalid_and_unmapped_dirs_are_removed() {
        let temp_dir = tempdir().expect("Failed to create temp directory");
        let mirrors = MirrorManager::new(CachePaths::new(temp_dir.path()));
        let invalid = mirror(&mirrors, "https://h/a.git", Duration::ZERO);
        mirrors.invalidate(&invalid);
        let stray = mirrors.base_dir().join("git-DEADBEEF.git");
        fs::create_dir_all(&stray).unwrap();
        let live = mirror(&mirrors, "https://h/b.git", Duration::ZERO);

        let stats = MirrorCleaner::new(&mirrors, WEEK).cleanup(&BTreeSet::new());
        assert_eq!(stats.removed_invalid, 1);
        assert_eq!(stats.removed_unmapped, 1);
        assert!(!invalid.exists() && !stray.exists());
        assert!(live.exists());
    }

    #[test]
    fn vanished_directories_lose_their_mapping() {
        let temp_dir = tempdir().expect("Failed to create temp directory");
        let mirrors = MirrorManager::new(CachePaths::new(temp_dir.path()));
        mirrors.get_mirror_dir("https://h/gone.git");

        let stats = MirrorCleaner::new(&mirrors, WEEK).cleanup(&BTreeSet::new());
        assert_eq!(stats.dropped_mappings, 1);
        assert!(mirrors.mappings().is_empty());
    }
}
