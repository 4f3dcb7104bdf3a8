use std::fs;
use std::io;

use super::Updater;
use crate::error::SyncError;
use crate::repair::run_and_fix_index_errors;

impl Updater<'_> {
    /// Move the working tree to the build revision. Returns true when the checked-out branch changed.
    pub(super) fn update_sources(&self) -> Result<bool, SyncError> {
        self.remove_index_lock()?;
        let repo = self.repo();
        let branch = &self.spec.branch;
        let revision = self.spec.revision.as_str();
        let branches = repo.branches()?;
        let current = branches.current.as_deref();

        if branch.is_regular_branch() {
            let name = branch.short_name();
            if current == Some(name) {
                log::info!("Resetting {} in {} to {}", name, self.target_dir.display(), revision);
                run_and_fix_index_errors(&repo, || Ok(repo.reset_hard(revision)?))?;
                self.track_remote_branch(name);
                return Ok(false);
            }
            if branches.contains(name) {
                repo.update_ref(branch.as_str(), revision)?;
            } else {
                repo.create_branch(name, revision, false)?;
            }
            log::info!("Checking out branch {} in {}", name, self.target_dir.display());
            run_and_fix_index_errors(&repo, || Ok(repo.checkout_force(name)?))?;
            self.track_remote_branch(name);
            return Ok(true);
        }

        let tag_at_revision =
            branch.is_tag() && repo.rev_parse(&format!("{}^{{commit}}", branch))?.as_deref() == Some(revision);
        let target = if tag_at_revision { branch.short_name() } else { revision };
        log::info!("Checking out {} in {}", target, self.target_dir.display());
        run_and_fix_index_errors(&repo, || Ok(repo.checkout_force(target)?))?;
        Ok(current.is_some())
    }

    /// A killed checkout leaves `index.lock` behind and every later command fails on it.
    fn remove_index_lock(&self) -> Result<(), SyncError> {
        let lock = self.target_dir.join(".git").join("index.lock");
        match fs::remove_file(&lock) {
            Ok(()) => {
                log::warn!("Removed stale {}", lock.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn track_remote_branch(&self, name: &str) {
        let upstream = format!("origin/{name}");
        if let Err(e) = self.repo().set_upstream(name, &upstream) {
            log::warn!("Failed to set upstream of {} to {}: {}", name, upstream, e);
        }
    }
}
