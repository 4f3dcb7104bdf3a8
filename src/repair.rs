//! Repairs of local repository state left behind by killed or crashed git processes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::classify::{Failure, classify};
use crate::error::SyncError;
use crate::git::GitDir;

/// Lock files git creates directly under the git directory.
const TOP_LEVEL_LOCKS: &[&str] = &["index.lock", "HEAD.lock", "config.lock", "shallow.lock", "packed-refs.lock"];

/// The git directory of `dir`: `dir/.git` for a working tree, `dir` itself when bare.
pub fn git_dir_of(dir: &Path) -> PathBuf {
    let dot_git = dir.join(".git");
    if dot_git.is_dir() { dot_git } else { dir.to_path_buf() }
}

fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn remove_lock_files_under(dir: &Path, removed: &mut Vec<PathBuf>) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            remove_lock_files_under(&path, removed)?;
        } else if path.extension().is_some_and(|ext| ext == "lock") && remove_file_if_exists(&path)? {
            removed.push(path);
        }
    }
    Ok(())
}

/// Remove `*.lock` files under `refs/` and `packed-refs.lock`. Returns what was removed.
pub fn remove_ref_locks(git_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    remove_lock_files_under(&git_dir.join("refs"), &mut removed)?;
    let packed = git_dir.join("packed-refs.lock");
    if remove_file_if_exists(&packed)? {
        removed.push(packed);
    }
    for path in &removed {
        log::info!("Removed stale ref lock {}", path.display());
    }
    Ok(removed)
}

/// Remove every lock file a killed git process may have left in `git_dir`.
pub fn remove_stale_locks(git_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut removed = remove_ref_locks(git_dir)?;
    for name in TOP_LEVEL_LOCKS {
        let path = git_dir.join(name);
        if remove_file_if_exists(&path)? {
            log::info!("Removed stale lock {}", path.display());
            removed.push(path);
        }
    }
    Ok(removed)
}

/// Delete `objects/pack/*.idx` files that have no matching `.pack`.
pub fn remove_orphaned_idx_files(git_dir: &Path) -> io::Result<usize> {
    let pack_dir = git_dir.join("objects").join("pack");
    let entries = match fs::read_dir(&pack_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "idx") && !path.with_extension("pack").exists() {
            log::info!("Removing orphaned pack index {}", path.display());
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Remove everything inside `dir`, creating it when missing.
pub fn clean_dir(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        return fs::create_dir_all(dir);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let meta = fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Run `op`, repairing the index or stale locks once and retrying when it fails on them.
pub fn run_and_fix_index_errors<T>(
    repo: &GitDir<'_>,
    mut op: impl FnMut() -> Result<T, SyncError>,
) -> Result<T, SyncError> {
    let err = match op() {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };
    let git_dir = git_dir_of(repo.dir());
    match classify(&err) {
        Failure::CorruptedIndex => {
            let index = git_dir.join("index");
            log::warn!("Index {} is corrupted, removing it and retrying: {}", index.display(), err);
            remove_file_if_exists(&index)?;
        }
        Failure::OutdatedIndex => {
            log::warn!("Index in {} is outdated, refreshing it and retrying", repo.dir().display());
            repo.refresh_index()?;
        }
        Failure::StaleLock => {
            log::warn!("Stale lock in {}, removing lock files and retrying", git_dir.display());
            remove_stale_locks(&git_dir)?;
        }
        _ => return Err(err),
    }
    op()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tempfile::tempdir;

    use crate::config::Settings;
    use crate::git::testing::ScriptedRunner;
    use crate::git::{CancelToken, GitCli, GitError};

    fn failed(stderr: &str) -> SyncError {
        SyncError::Git(GitError::Failed {
            command: "git checkout".into(),
            dir: PathBuf::from("/w"),
            exit_code: Some(128),
            stdout: String::new(),
            stderr: stderr.into(),
        })
    }

    #[test]
    fn removes_ref_locks_recursively() {
        let temp_dir = tempdir().expect("Failed to create temp directory");
        let git_dir = temp_dir.path();
        let nested = git_dir.join("refs/remotes/origin");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("main.lock"), "").unwrap();
        fs::write(nested.join("main"), "abc").unwrap();
        fs::write(git_dir.join("packed-refs.lock"), "").unwrap();

        let removed = remove_ref_locks(git_dir).expect("Failed to remove locks");
        assert_eq!(removed.len(), 2);
        assert!(!nested.join("main.lock").exists());
        assert!(nested.join("main").exists());
        assert!(!git_dir.join("packed-refs.lock").exists());
    }

    #[test]
    fn stale_locks_include_index_lock() {
        let temp_dir = tempdir().expect("Failed to create temp directory");
        let git_dir = temp_dir.path().join(".git");
        fs::create_dir_all(&git_dir).unwrap();
        fs::write(git_dir.join("index.lock"), "").unwrap();
        fs::write(git_dir.join("index"), "x").unwrap();

        assert_eq!(git_dir_of(temp_dir.path()), git_dir);
        remove_stale_locks(&git_dir).expect("Failed to remove locks");
        assert!(!git_dir.join("index.lock").exists());
        assert!(git_dir.join("index").exists());
    }

    #[test]
    fn removes_only_orphaned_idx_files() {
        let temp_dir = tempdir().expect("Failed to create temp directory");
        let pack_dir = temp_dir.path().join("objects/pack");
        fs::create_dir_all(&pack_dir).unwrap();
        fs::write(pack_dir.join("pack-a.idx"), "").unwrap();
        fs::write(pack_dir.join("pack-a.pack"), "").unwrap();
        fs::write(pack_dir.join("pack-b.idx"), "").unwrap();

        assert_eq!(remove_orphaned_idx_files(temp_dir.path()).unwrap(), 1);
        assert!(pack_dir.join("pack-a.idx").exists());
        assert!(!pack_dir.join("pack-b.idx").exists());
        assert_eq!(remove_orphaned_idx_files(&temp_dir.path().join("missing")).unwrap(), 0);
    }

    #[test]
    fn clean_dir_keeps_the_directory() {
        let temp_dir = tempdir().expect("Failed to create temp directory");
        let dir = temp_dir.path().join("w");
        fs::create_dir_all(dir.join(".git/objects")).unwrap();
        fs::write(dir.join("file"), "x").unwrap();

        clean_dir(&dir).expect("Failed to clean");
        assert!(dir.is_dir());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        let fresh = temp_dir.path().join("fresh");
        clean_dir(&fresh).expect("Failed to create");
        assert!(fresh.is_dir());
    }

    #[test]
    fn corrupted_index_is_deleted_and_operation_retried() {
        let temp_dir = tempdir().expect("Failed to create temp directory");
        let git_dir = temp_dir.path().join(".git");
        fs::create_dir_all(&git_dir).unwrap();
        fs::write(git_dir.join("index"), "garbage").unwrap();

        let git = GitCli::new(Arc::new(ScriptedRunner::new()), &Settings::default(), CancelToken::new());
        let repo = git.at(temp_dir.path());
        let mut calls = 0;
        let result = run_and_fix_index_errors(&repo, || {
            calls += 1;
            if calls == 1 {
                Err(failed("error: index file smaller than expected\nfatal: index file corrupt"))
            } else {
                Ok("done")
            }
        });
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls, 2);
        assert!(!git_dir.join("index").exists());
    }

    #[test]
    fn outdated_index_is_refreshed_once() {
        let runner = Arc::new(ScriptedRunner::new());
        let git = GitCli::new(runner.clone(), &Settings::default(), CancelToken::new());
        let repo = git.at(Path::new("/w"));
        let mut calls = 0;
        let result: Result<(), SyncError> = run_and_fix_index_errors(&repo, || {
            calls += 1;
            Err(failed("error: Entry 'a.txt' not uptodate. Cannot merge."))
        });
        assert!(result.is_err());
        assert_eq!(calls, 2);
        assert_eq!(runner.calls_matching(&["update-index", "--really-refresh"]).len(), 1);
    }

    #[test]
    fn other_errors_pass_through() {
        let git = GitCli::new(Arc::new(ScriptedRunner::new()), &Settings::default(), CancelToken::new());
        let repo = git.at(Path::new("/w"));
        let mut calls = 0;
        let result: Result<(), SyncError> = run_and_fix_index_errors(&repo, || {
            calls += 1;
            Err(failed("fatal: reference is not a tree"))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
