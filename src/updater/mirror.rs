//! Loading commits into a shared bare mirror, wiping it once when it is beyond repair.

use std::fs;
use std::path::{Path, PathBuf};

use super::Updater;
use crate::classify::classify;
use crate::error::SyncError;
use crate::git::repository_exists;
use crate::loader::{CommitLoader, LoaderKind};
use crate::mirror::touch_last_used;
use crate::repair::{clean_dir, remove_orphaned_idx_files};
use crate::types::RefName;

/// A commit a mirror must contain, with the branch it is expected on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorRevision {
    /// `None` when the commit is loaded from all heads, e.g. a submodule pin.
    pub branch: Option<RefName>,
    pub sha: String,
}

impl Updater<'_> {
    /// Bring the mirror in `dir` for `url` up to date with `revisions`.
    ///
    /// Returns the directory the mirror ended up in, which differs from `dir` when `dir`
    /// could not be wiped and was invalidated.
    pub(super) fn update_local_mirror(
        &self,
        dir: &Path,
        url: &str,
        revisions: &[MirrorRevision],
        kind: LoaderKind,
    ) -> Result<PathBuf, SyncError> {
        let fresh = !repository_exists(dir);
        if fresh {
            // not a repository yet; drop whatever an interrupted init left behind
            if let Err(e) = clean_dir(dir) {
                log::warn!("Failed to clean mirror directory {}: {}", dir.display(), e);
                return Err(SyncError::UnableToClean(dir.to_path_buf()));
            }
            self.init_mirror(dir, url)?;
        } else {
            self.git().at(dir).config_set("remote.origin.url", url)?;
        }
        match remove_orphaned_idx_files(dir) {
            Ok(0) => {}
            Ok(removed) => log::info!("Removed {} orphaned pack indexes from mirror {}", removed, dir.display()),
            Err(e) => log::warn!("Failed to remove orphaned pack indexes from {}: {}", dir.display(), e),
        }

        let mut err = match self.load_mirror_commits(dir, revisions, kind, false) {
            Ok(()) => return Ok(self.mirror_loaded(dir)),
            Err(e) => e,
        };
        if err.is_cancelled() {
            return Err(err);
        }
        if classify(&err).retry_after_pruning() {
            log::warn!("Failed to update mirror {}, retrying after removing outdated refs: {}", dir.display(), err);
            match self.load_mirror_commits(dir, revisions, kind, true) {
                Ok(()) => return Ok(self.mirror_loaded(dir)),
                Err(e) => err = e,
            }
        }

        let loaded_before = self.engine.loaded_mirrors.contains(dir);
        if fresh || loaded_before || err.is_cancelled() || !classify(&err).is_reclone_safe() {
            return Err(err);
        }
        log::warn!("Mirror {} looks broken, removing it and cloning again: {}", dir.display(), err);
        if let Err(e) = clean_dir(dir) {
            log::warn!("Failed to remove mirror {}, switching to a new directory: {}", dir.display(), e);
            self.engine.mirrors.invalidate(dir);
            let replacement = self.engine.mirrors.get_mirror_dir(url);
            return self.update_local_mirror(&replacement, url, revisions, kind);
        }
        self.init_mirror(dir, url)?;
        self.load_mirror_commits(dir, revisions, kind, false)?;
        Ok(self.mirror_loaded(dir))
    }

    fn init_mirror(&self, dir: &Path, url: &str) -> Result<(), SyncError> {
        log::info!("Initializing mirror of {} in {}", url, dir.display());
        fs::create_dir_all(dir)?;
        let repo = self.git().at(dir);
        repo.init(true)?;
        repo.config_set("remote.origin.url", url)?;
        self.engine.pruner.forget(dir);
        Ok(())
    }

    fn load_mirror_commits(
        &self,
        dir: &Path,
        revisions: &[MirrorRevision],
        kind: LoaderKind,
        force_prune: bool,
    ) -> Result<(), SyncError> {
        let repo = self.git().at(dir);
        let fetch_required = self.engine.pruner.remove_outdated_refs(&repo, force_prune)?;
        let loader = CommitLoader::new(self.git(), dir, kind, self.settings());
        for revision in revisions {
            // a missing commit surfaces when the checkout fetches from the mirror
            let found = match &revision.branch {
                Some(branch) => loader.load_commit_in_branch(&revision.sha, branch, fetch_required)?,
                None => loader.load_commit(&revision.sha)?,
            };
            if !found {
                log::debug!("Mirror {} does not contain {}", dir.display(), revision.sha);
            }
        }
        Ok(())
    }

    fn mirror_loaded(&self, dir: &Path) -> PathBuf {
        self.engine.loaded_mirrors.insert(dir.to_path_buf());
        if let Err(e) = touch_last_used(dir) {
            log::warn!("Failed to update last use time of mirror {}: {}", dir.display(), e);
        }
        dir.to_path_buf()
    }
}
