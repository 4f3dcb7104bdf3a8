use std::fs;

use super::Updater;
use crate::error::SyncError;
use crate::repair::{clean_dir, remove_orphaned_idx_files};

impl Updater<'_> {
    /// Reuse the checkout directory when it matches the policy, otherwise start from scratch.
    pub(super) fn init_git_repository(&mut self, force_fresh: bool) -> Result<(), SyncError> {
        let dot_git = self.target_dir.join(".git");
        if force_fresh {
            self.init_directory(true)?;
        } else if dot_git.exists() {
            let shallow = self.repo().is_shallow()?;
            if shallow != self.strategy.shallow_checkout {
                log::info!(
                    "{} is {}a shallow repository, recreating it",
                    self.target_dir.display(),
                    if shallow { "" } else { "not " }
                );
                self.init_directory(true)?;
            } else if let Err(e) = self.configure_existing() {
                if e.is_cancelled() {
                    return Err(e);
                }
                log::warn!(
                    "Do clean checkout due to errors while configuring {}: {}",
                    self.target_dir.display(),
                    e
                );
                self.init_directory(true)?;
            }
        } else {
            self.init_directory(false)?;
        }
        if let Err(e) = remove_orphaned_idx_files(&dot_git) {
            log::warn!("Failed to remove orphaned pack indexes in {}: {}", dot_git.display(), e);
        }
        Ok(())
    }

    fn configure_existing(&self) -> Result<(), SyncError> {
        self.configure_remote()?;
        self.setup_linkage(true)?;
        self.configure_sparse()
    }

    fn init_directory(&mut self, remove: bool) -> Result<(), SyncError> {
        if remove {
            log::info!("Removing {}", self.target_dir.display());
            if let Err(e) = clean_dir(&self.target_dir) {
                log::warn!("Failed to clean {}: {}", self.target_dir.display(), e);
                return Err(SyncError::UnableToClean(self.target_dir.clone()));
            }
        }
        fs::create_dir_all(&self.target_dir)?;
        log::info!("Initializing repository in {}", self.target_dir.display());
        self.repo().init(false)?;
        self.engine.pruner.forget(&self.target_dir);
        self.configure_remote()?;
        self.setup_linkage(false)?;
        self.configure_sparse()?;
        self.fresh = true;
        Ok(())
    }

    /// Point `origin` at the root's urls; a push url equal to the fetch url is not stored.
    fn configure_remote(&self) -> Result<(), SyncError> {
        let repo = self.repo();
        repo.config_set("remote.origin.url", &self.spec.fetch_url)?;
        let push_url = self.spec.push_url();
        if push_url != self.spec.fetch_url {
            repo.config_set("remote.origin.pushurl", push_url)?;
        } else {
            repo.config_unset("remote.origin.pushurl")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use std::sync::Arc;

    use tempfile::tempdir;

    use crate::config::Settings;
    use crate::git::testing::{Reply, ScriptedRunner};

    #[test]
    fn full_clone_is_recreated_when_shallow_is_requested() {
        let cache = tempdir().expect("Failed to create temp directory");
        let work = tempdir().expect("Failed to create temp directory");
        let target = work.path().join("checkout");
        std::fs::create_dir_all(target.join(".git/objects")).unwrap();
        std::fs::write(target.join("build.log"), "old").unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        runner.on(&["rev-parse", "--is-shallow-repository"], Reply::ok("false\n"));
        let settings = Settings {
            shallow: true,
            ..fast_settings()
        };
        let engine = engine(&runner, cache.path(), settings);
        let spec = spec();
        let mut updater = engine.updater(&spec, &target);

        updater.init_git_repository(false).expect("init should succeed");
        assert!(updater.fresh);
        assert!(!target.join("build.log").exists());
        assert!(!target.join(".git/objects").exists());
        assert_eq!(runner.calls_matching(&["init"]).len(), 1);
    }

    #[test]
    fn matching_repository_is_reconfigured_in_place() {
        let cache = tempdir().expect("Failed to create temp directory");
        let work = tempdir().expect("Failed to create temp directory");
        let target = work.path().join("checkout");
        std::fs::create_dir_all(target.join(".git")).unwrap();
        std::fs::write(target.join("keep.txt"), "x").unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        runner.on(&["rev-parse", "--is-shallow-repository"], Reply::ok("false\n"));
        let engine = engine(&runner, cache.path(), fast_settings());
        let mut spec = spec();
        spec.push_url = Some("ssh://git@example.com/r.git".into());
        let mut updater = engine.updater(&spec, &target);

        updater.init_git_repository(false).expect("init should succeed");
        assert!(!updater.fresh);
        assert!(target.join("keep.txt").exists());
        assert!(runner.calls_matching(&["init"]).is_empty());
        assert_eq!(
            runner.calls_matching(&["config", "remote.origin.pushurl"])[0].subcommand_args(),
            &["config", "remote.origin.pushurl", "ssh://git@example.com/r.git"].map(String::from)
        );
    }

    #[test]
    fn failed_reconfiguration_falls_back_to_fresh_init() {
        let cache = tempdir().expect("Failed to create temp directory");
        let work = tempdir().expect("Failed to create temp directory");
        let target = work.path().join("checkout");
        std::fs::create_dir_all(target.join(".git")).unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        runner.on(&["rev-parse", "--is-shallow-repository"], Reply::ok("false\n"));
        runner.on_seq(
            &["config", "remote.origin.url"],
            vec![Reply::fail("error: could not lock config file .git/config"), Reply::ok("")],
        );
        let engine = engine(&runner, cache.path(), fast_settings());
        let spec = spec();
        let mut updater = engine.updater(&spec, &target);

        updater.init_git_repository(false).expect("init should succeed");
        assert!(updater.fresh);
        assert_eq!(runner.calls_matching(&["init"]).len(), 1);
    }
}
