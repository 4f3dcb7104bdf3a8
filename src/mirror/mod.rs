//! Shared bare mirrors of remote repositories.
//!
//! Every remote url gets one directory under the mirrors root. Names are derived from
//! the url so they survive restarts; the mapping lives in two flat files:
//!
//! ```text
//! mirrors/
//! ├── map              # `<url> = <dirname>` per line
//! ├── invalid          # dirnames that must never be handed out again
//! └── git-1A2B3C4D.git/
//! ```
//!
//! The store is re-read under a file lock on every change so that agents sharing a
//! cache root converge on the same directory for a url.

mod lock;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use crate::git::mirror_remote_url;
use crate::paths::{CachePaths, submodules_file, timestamp_file};

use lock::StoreLock;

static WRITE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// 32-bit string hash compatible with the names existing caches already use:
/// `h = 31 * h + c` over UTF-16 code units.
fn url_hash(value: &str) -> u32 {
    value
        .encode_utf16()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(c as i32)) as u32
}

/// Directory name for a url or a salted url.
pub fn dir_name_for(value: &str) -> String {
    format!("git-{:08X}.git", url_hash(value))
}

#[derive(Debug, Default)]
struct Store {
    /// url → dirname
    map: BTreeMap<String, String>,
    invalid: BTreeSet<String>,
}

impl Store {
    /// Invalid, mapped, or left on disk by a repository we no longer track.
    fn is_taken(&self, base: &Path, name: &str) -> bool {
        self.invalid.contains(name) || self.map.values().any(|n| n == name) || base.join(name).exists()
    }
}

fn parse_map(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let (url, name) = line.rsplit_once('=')?;
            let (url, name) = (url.trim(), name.trim());
            (!url.is_empty() && !name.is_empty()).then(|| (url.to_string(), name.to_string()))
        })
        .collect()
}

/// Write via a temp file and rename so readers never see a half-written store.
fn write_atomically(path: &Path, contents: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let counter = WRITE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp = path.with_extension(format!("tmp.{}.{}", std::process::id(), counter));
    fs::write(&temp, contents)?;
    if let Err(e) = fs::rename(&temp, path) {
        let _ = fs::remove_file(&temp);
        return Err(e);
    }
    Ok(())
}

/// Maps remote urls to mirror directories.
pub struct MirrorManager {
    paths: CachePaths,
    /// Serializes store edits within the process; the file lock covers other processes.
    edit: Mutex<()>,
}

impl MirrorManager {
    pub fn new(paths: CachePaths) -> Self {
        Self {
            paths,
            edit: Mutex::new(()),
        }
    }

    /// Root directory holding every mirror.
    pub fn base_dir(&self) -> PathBuf {
        self.paths.mirrors_dir()
    }

    /// Directory of the mirror for `url`, allocating and persisting a new name if needed.
    ///
    /// The directory itself is not created.
    pub fn get_mirror_dir(&self, url: &str) -> PathBuf {
        let base = self.base_dir();
        let name = self.update(|store| {
            if let Some(name) = store.map.get(url) {
                return (name.clone(), false);
            }
            let mut name = dir_name_for(url);
            let mut salt = 0u32;
            while store.is_taken(&base, &name) {
                name = dir_name_for(&format!("{url}{salt}"));
                salt += 1;
            }
            log::debug!("Mapping {} to mirror {}", url, name);
            store.map.insert(url.to_string(), name.clone());
            (name, true)
        });
        base.join(name)
    }

    /// Unmap every url pointing at `dir` and never hand its name out again.
    pub fn invalidate(&self, dir: &Path) {
        let Some(name) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            return;
        };
        self.update(|store| {
            store.map.retain(|_, n| *n != name);
            let added = store.invalid.insert(name.clone());
            if added {
                log::info!("Invalidated mirror directory {}", name);
            }
            ((), added)
        });
    }

    /// Drop the mapping of `url`, leaving its name free for reuse.
    pub fn remove_mapping(&self, url: &str) {
        self.update(|store| ((), store.map.remove(url).is_some()));
    }

    /// Every url with its mirror directory.
    pub fn mappings(&self) -> BTreeMap<String, PathBuf> {
        let base = self.base_dir();
        self.update(|store| {
            let mappings = store
                .map
                .iter()
                .map(|(url, name)| (url.clone(), base.join(name)))
                .collect();
            (mappings, false)
        })
    }

    /// Url mapped to the directory name `name`.
    pub fn url_for(&self, name: &str) -> Option<String> {
        self.update(|store| {
            let url = store.map.iter().find(|(_, n)| *n == name).map(|(url, _)| url.clone());
            (url, false)
        })
    }

    pub fn is_invalid(&self, name: &str) -> bool {
        self.update(|store| (store.invalid.contains(name), false))
    }

    /// Reload the store, apply `f`, and save when it reports a change.
    fn update<T>(&self, f: impl FnOnce(&mut Store) -> (T, bool)) -> T {
        let _guard = match self.edit.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _file_lock = match StoreLock::acquire(&self.paths.mirrors_lock()) {
            Ok(lock) => Some(lock),
            Err(e) => {
                log::warn!("Failed to lock mirror store: {}", e);
                None
            }
        };
        let (mut loaded, restored) = self.load();
        let (value, changed) = f(&mut loaded);
        if changed || restored {
            self.save(&loaded);
        }
        value
    }

    /// Read the store from disk. The flag is set when the map had to be rebuilt.
    fn load(&self) -> (Store, bool) {
        let invalid = fs::read_to_string(self.paths.invalid_file())
            .map(|text| {
                text.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        match fs::read_to_string(self.paths.map_file()) {
            Ok(text) => (
                Store {
                    map: parse_map(&text),
                    invalid,
                },
                false,
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let mut store = Store {
                    map: BTreeMap::new(),
                    invalid,
                };
                self.restore_map(&mut store);
                let restored = !store.map.is_empty();
                (store, restored)
            }
            Err(e) => {
                log::warn!("Failed to read mirror map {}: {}", self.paths.map_file().display(), e);
                (
                    Store {
                        map: BTreeMap::new(),
                        invalid,
                    },
                    false,
                )
            }
        }
    }

    /// Rebuild the map by reading the remote url of every existing mirror directory.
    fn restore_map(&self, store: &mut Store) {
        let Ok(entries) = fs::read_dir(self.base_dir()) else {
            return;
        };
        for entry in entries.flatten() {
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if store.invalid.contains(&name) {
                continue;
            }
            if let Some(url) = mirror_remote_url(&entry.path()) {
                log::info!("Restored mirror mapping {} = {}", url, name);
                store.map.insert(url, name);
            }
        }
    }

    fn save(&self, store: &Store) {
        let map: String = store
            .map
            .iter()
            .map(|(url, name)| format!("{url} = {name}\n"))
            .collect();
        if let Err(e) = write_atomically(&self.paths.map_file(), &map) {
            log::warn!("Failed to write mirror map {}: {}", self.paths.map_file().display(), e);
        }
        let invalid: String = store.invalid.iter().map(|name| format!("{name}\n")).collect();
        if let Err(e) = write_atomically(&self.paths.invalid_file(), &invalid) {
            log::warn!(
                "Failed to write invalid mirrors list {}: {}",
                self.paths.invalid_file().display(),
                e
            );
        }
    }
}

/// Record that `mirror` was just used.
pub fn touch_last_used(mirror: &Path) -> io::Result<()> {
    let file = timestamp_file(mirror);
    fs::write(&file, format!("{}\n", now_unix()))?;
    Ok(())
}

/// Last time `mirror` was used, falling back to the directory's own mtime.
pub fn last_used(mirror: &Path) -> Option<SystemTime> {
    fs::metadata(timestamp_file(mirror))
        .or_else(|_| fs::metadata(mirror))
        .and_then(|m| m.modified())
        .ok()
}

/// True when `mirror` has not been used for longer than `max_age`.
pub fn is_unused_for(mirror: &Path, max_age: Duration) -> bool {
    let Some(used) = last_used(mirror) else {
        return true;
    };
    let threshold = SystemTime::now().checked_sub(max_age).unwrap_or(SystemTime::UNIX_EPOCH);
    used < threshold
}

/// Remember the submodule urls of the repository mirrored in `mirror`, one per line.
///
/// Failures are logged; the list only feeds the mirror cleaner.
pub fn persist_submodules(mirror: &Path, urls: &BTreeSet<String>) {
    let file = submodules_file(mirror);
    let text: String = urls.iter().map(|url| format!("{url}\n")).collect();
    let result = fs::create_dir_all(mirror).and_then(|()| fs::write(&file, text));
    if let Err(e) = result {
        log::warn!("Failed to persist submodules to {}: {}", file.display(), e);
    }
}

/// Submodule urls recorded for `mirror`; empty when nothing was recorded.
pub fn read_submodules(mirror: &Path) -> BTreeSet<String> {
    match fs::read_to_string(submodules_file(mirror)) {
        Ok(text) => text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("Failed to read submodules of {}: {}", mirror.display(), e);
            }
            BTreeSet::new()
        }
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
