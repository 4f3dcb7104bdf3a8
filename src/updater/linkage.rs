//! How a checkout directory is wired to the shared mirror.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use url::Url;

use super::{Linkage, Updater};
use crate::error::SyncError;
use crate::git::GitDir;

/// Url of a local mirror directory as git expects it in config.
pub fn local_mirror_url(dir: &Path) -> String {
    Url::from_file_path(dir)
        .map(String::from)
        .unwrap_or_else(|()| dir.display().to_string())
}

fn alternates_file(dot_git: &Path) -> PathBuf {
    dot_git.join("objects").join("info").join("alternates")
}

/// Remove every `url.*` rewrite section.
fn remove_url_sections(repo: &GitDir<'_>) -> Result<(), SyncError> {
    for section in repo.config_sections("^url\\.")? {
        repo.config_remove_section(&section)?;
    }
    Ok(())
}

fn disable_alternates(dot_git: &Path) -> io::Result<()> {
    match fs::remove_file(alternates_file(dot_git)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Copy loose refs missing in `dst`, ignoring failures.
fn copy_refs_one_by_one(src: &Path, dst: &Path) {
    let Ok(entries) = fs::read_dir(src) else {
        return;
    };
    for entry in entries.flatten() {
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if from.is_dir() {
            copy_refs_one_by_one(&from, &to);
        } else if !to.exists() {
            let copied = fs::create_dir_all(dst).and_then(|()| fs::copy(&from, &to));
            if let Err(e) = copied {
                log::warn!("Error while copying ref {}, it will be created during fetch: {}", from.display(), e);
            }
        }
    }
}

impl Updater<'_> {
    pub(super) fn setup_linkage(&self, existing: bool) -> Result<(), SyncError> {
        let repo = self.repo();
        let dot_git = self.target_dir.join(".git");
        match self.strategy.linkage {
            Linkage::Direct => {
                if existing {
                    remove_url_sections(&repo)?;
                    repo.config_remove_section("lfs")?;
                    disable_alternates(&dot_git)?;
                }
            }
            Linkage::InsteadOf => {
                if existing {
                    remove_url_sections(&repo)?;
                }
                self.set_use_local_mirror(&repo)?;
                disable_alternates(&dot_git)?;
            }
            Linkage::Alternates => self.setup_alternates(&dot_git)?,
        }
        Ok(())
    }

    fn mirror_dir(&self) -> Result<&Path, SyncError> {
        self.mirror_dir
            .as_deref()
            .ok_or_else(|| SyncError::PolicyViolation(format!("{} requires a mirror", self.strategy.variant.name())))
    }

    /// Fetch through the mirror, push straight to the remote.
    fn set_use_local_mirror(&self, repo: &GitDir<'_>) -> Result<(), SyncError> {
        // the configured url may differ from the root's, e.g. without the username
        let remote_url = repo
            .config_get("remote.origin.url")?
            .unwrap_or_else(|| self.spec.fetch_url.clone());
        let mirror_url = local_mirror_url(self.mirror_dir()?);
        repo.config_set(&format!("url.{mirror_url}.insteadOf"), &remote_url)?;
        repo.config_set(&format!("url.{remote_url}.pushInsteadOf"), &remote_url)?;
        Ok(())
    }

    fn setup_alternates(&self, dot_git: &Path) -> Result<(), SyncError> {
        let mirror = self.mirror_dir()?;
        let alternates = alternates_file(dot_git);
        let objects = mirror.join("objects");
        let write = alternates
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| fs::write(&alternates, format!("{}\n", objects.display())));
        if let Err(e) = write {
            log::warn!("Error while configuring alternates at {}: {}", alternates.display(), e);
            return Err(e.into());
        }
        self.copy_refs(mirror, dot_git);
        Ok(())
    }

    fn copy_refs(&self, mirror: &Path, dot_git: &Path) {
        let packed = self
            .git()
            .at(mirror)
            .pack_refs()
            .map_err(SyncError::from)
            .and_then(|()| {
                fs::copy(mirror.join("packed-refs"), dot_git.join("packed-refs"))?;
                Ok(())
            });
        if let Err(e) = packed {
            log::warn!("Error while packing refs, will copy them one by one: {}", e);
            copy_refs_one_by_one(&mirror.join("refs"), &dot_git.join("refs"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{Strategy, Variant};
    use super::*;
    use std::sync::Arc;

    use tempfile::tempdir;

    use crate::config::Settings;
    use crate::git::testing::{Reply, ScriptedRunner};

    #[test]
    fn mirror_url_is_a_file_url() {
        assert_eq!(local_mirror_url(Path::new("/cache/mirrors/git-1.git")), "file:///cache/mirrors/git-1.git");
    }

    #[test]
    fn direct_linkage_removes_mirror_traces() {
        let cache = tempdir().expect("Failed to create temp directory");
        let work = tempdir().expect("Failed to create temp directory");
        let alternates = work.path().join(".git/objects/info/alternates");
        fs::create_dir_all(alternates.parent().unwrap()).unwrap();
        fs::write(&alternates, "/m/objects\n").unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        runner.on(&["config", "--get-regexp"], Reply::ok("url.file:///m.insteadof\n"));
        let engine = engine(&runner, cache.path(), fast_settings());
        let spec = spec();
        let updater = engine.updater(&spec, work.path());

        updater.setup_linkage(true).expect("linkage should succeed");
        assert!(!alternates.exists());
        let removed: Vec<String> = runner
            .calls_matching(&["config", "--remove-section"])
            .iter()
            .map(|c| c.subcommand_args()[2].clone())
            .collect();
        assert_eq!(removed, vec!["url.file:///m".to_string(), "lfs".to_string()]);
    }

    #[test]
    fn instead_of_points_fetches_at_the_mirror() {
        let cache = tempdir().expect("Failed to create temp directory");
        let work = tempdir().expect("Failed to create temp directory");
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(&["config", "--get", "remote.origin.url"], Reply::ok("https://example.com/r.git\n"));
        let settings = Settings {
            mirror_strategy: crate::config::MirrorStrategy::Mirror,
            ..fast_settings()
        };
        let engine = engine(&runner, cache.path(), settings);
        let spec = spec();
        let mut updater = engine.updater(&spec, work.path());
        updater.mirror_dir = Some(PathBuf::from("/cache/git-1.git"));

        updater.setup_linkage(false).expect("linkage should succeed");
        let sets: Vec<Vec<String>> = runner
            .calls_matching(&["config"])
            .iter()
            .map(|c| c.subcommand_args().to_vec())
            .filter(|args| args.len() == 3 && args[1] != "--get")
            .collect();
        assert_eq!(
            sets,
            vec![
                ["config", "url.file:///cache/git-1.git.insteadOf", "https://example.com/r.git"].map(String::from).to_vec(),
                ["config", "url.https://example.com/r.git.pushInsteadOf", "https://example.com/r.git"]
                    .map(String::from)
                    .to_vec(),
            ]
        );
    }

    #[test]
    fn alternates_point_at_mirror_objects_and_copy_refs() {
        let cache = tempdir().expect("Failed to create temp directory");
        let work = tempdir().expect("Failed to create temp directory");
        let mirror = cache.path().join("git-1.git");
        fs::create_dir_all(mirror.join("refs/heads")).unwrap();
        fs::write(mirror.join("refs/heads/main"), "abc\n").unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        runner.on(&["pack-refs"], Reply::fail("fatal: unable to pack refs"));
        let engine = engine(&runner, cache.path(), fast_settings());
        let spec = spec();
        let strategy = Strategy::new(Variant::MirrorWithAlternates, &Settings::default());
        let mut updater = engine.updater(&spec, work.path()).with_strategy(strategy);
        updater.mirror_dir = Some(mirror.clone());

        updater.setup_linkage(false).expect("linkage should succeed");
        let alternates = fs::read_to_string(work.path().join(".git/objects/info/alternates")).unwrap();
        assert_eq!(alternates.trim(), mirror.join("objects").display().to_string());
        assert_eq!(fs::read_to_string(work.path().join(".git/refs/heads/main")).unwrap(), "abc\n");
    }
}
