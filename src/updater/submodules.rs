//! Submodule checkout, either straight from their remotes or through shared mirrors.
//!
//! With mirrors, submodules sharing a url are fetched into one mirror once, whatever
//! number of paths pin it.

use std::collections::BTreeSet;
use std::path::Path;

use super::linkage::local_mirror_url;
use super::{MirrorRevision, SubmoduleSource, Updater};
use crate::error::SyncError;
use crate::git::{GitDir, SubmoduleEntry, read_submodule_sections};
use crate::loader::LoaderKind;
use crate::mirror::persist_submodules;
use crate::types::{RefName, with_username};

/// A submodule as pinned by the commit checked out in its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmoduleRecord {
    pub name: String,
    pub path: String,
    pub url: String,
    /// Commit recorded in the parent tree.
    pub revision: String,
    pub branch: Option<RefName>,
}

/// Submodules fetched from the same url.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedSubmodule {
    pub url: String,
    pub submodules: Vec<SubmoduleRecord>,
}

impl AggregatedSubmodule {
    /// Distinct commits the mirror of this url must contain.
    pub fn revisions(&self) -> Vec<MirrorRevision> {
        let mut revisions: Vec<MirrorRevision> = Vec::new();
        for record in &self.submodules {
            let revision = MirrorRevision {
                branch: record.branch.clone(),
                sha: record.revision.clone(),
            };
            if !revisions.contains(&revision) {
                revisions.push(revision);
            }
        }
        revisions
    }
}

/// Group `records` by url, keeping the order urls first appear in.
pub fn aggregate_by_url(records: Vec<SubmoduleRecord>) -> Vec<AggregatedSubmodule> {
    let mut aggregated: Vec<AggregatedSubmodule> = Vec::new();
    for record in records {
        match aggregated.iter_mut().find(|a| a.url == record.url) {
            Some(group) => group.submodules.push(record),
            None => aggregated.push(AggregatedSubmodule {
                url: record.url.clone(),
                submodules: vec![record],
            }),
        }
    }
    aggregated
}

/// Branch `.` follows the parent's branch.
fn resolve_branch(declared: Option<&str>, parent: Option<&RefName>) -> Option<RefName> {
    match declared {
        Some(".") => parent.cloned(),
        Some(name) => name.parse().ok(),
        None => None,
    }
}

fn submodule_entries(dir: &Path) -> Result<Vec<SubmoduleEntry>, SyncError> {
    let gitmodules = dir.join(".gitmodules");
    if !gitmodules.is_file() {
        return Ok(Vec::new());
    }
    Ok(read_submodule_sections(&gitmodules)?)
}

impl Updater<'_> {
    pub(super) fn checkout_submodules(&self, dir: &Path) -> Result<(), SyncError> {
        self.update_submodules(dir, Some(&self.spec.branch))
            .map_err(|e| SyncError::Submodules(Box::new(e)))
    }

    fn update_submodules(&self, dir: &Path, parent_branch: Option<&RefName>) -> Result<(), SyncError> {
        let entries = submodule_entries(dir)?;
        if entries.is_empty() {
            return Ok(());
        }
        log::info!("Updating submodules in {}", dir.display());
        let repo = self.git().at(dir);
        repo.submodule_init()?;
        repo.submodule_sync()?;
        if self.settings().use_main_repo_user_for_submodules {
            self.add_username(&repo, &entries)?;
        }
        match self.strategy.submodules {
            SubmoduleSource::Remote => repo.submodule_update(self.strategy.submodule_depth, true)?,
            SubmoduleSource::Mirrors => self.update_submodules_from_mirrors(&repo, &entries, parent_branch)?,
        }
        if !self.spec.submodules.is_recursive() {
            return Ok(());
        }
        for entry in &entries {
            let Some(path) = entry.path.as_deref() else {
                continue;
            };
            let sub = dir.join(path);
            if sub.join(".gitmodules").is_file() {
                let branch = resolve_branch(entry.branch.as_deref(), parent_branch);
                self.update_submodules(&sub, branch.as_ref())?;
            }
        }
        Ok(())
    }

    /// Put the root's username into submodule urls that would need credentials.
    fn add_username(&self, repo: &GitDir<'_>, entries: &[SubmoduleEntry]) -> Result<(), SyncError> {
        let Some(username) = self.spec.auth.username() else {
            return Ok(());
        };
        for entry in entries {
            let key = format!("submodule.{}.url", entry.name);
            let Some(url) = repo.config_get(&key)? else {
                continue;
            };
            if let Some(with_user) = with_username(&url, username) {
                log::debug!("Using {} for submodule {}", with_user, entry.name);
                repo.config_set(&key, &with_user)?;
            }
        }
        Ok(())
    }

    /// Submodules of the commit checked out in `repo`.
    fn submodule_records(
        &self,
        repo: &GitDir<'_>,
        entries: &[SubmoduleEntry],
        parent_branch: Option<&RefName>,
    ) -> Result<Vec<SubmoduleRecord>, SyncError> {
        let mut records = Vec::new();
        for entry in entries {
            let Some(path) = entry.path.clone() else {
                log::warn!("Submodule {} has no path in {}, skipping it", entry.name, repo.dir().display());
                continue;
            };
            let configured = repo.config_get(&format!("submodule.{}.url", entry.name))?;
            let Some(url) = configured.or_else(|| entry.url.clone()) else {
                log::warn!("Submodule {} has no url in {}, skipping it", entry.name, repo.dir().display());
                continue;
            };
            let Some(revision) = repo.ls_tree_sha("HEAD", &path)? else {
                log::warn!("Submodule {} is not committed at {}, skipping it", entry.name, path);
                continue;
            };
            records.push(SubmoduleRecord {
                name: entry.name.clone(),
                path,
                url,
                revision,
                branch: resolve_branch(entry.branch.as_deref(), parent_branch),
            });
        }
        Ok(records)
    }

    fn update_submodules_from_mirrors(
        &self,
        repo: &GitDir<'_>,
        entries: &[SubmoduleEntry],
        parent_branch: Option<&RefName>,
    ) -> Result<(), SyncError> {
        let records = self.submodule_records(repo, entries, parent_branch)?;
        if let Some(parent_url) = repo.config_get("remote.origin.url")? {
            let urls: BTreeSet<String> = records.iter().map(|r| r.url.clone()).collect();
            persist_submodules(&self.engine.mirrors.get_mirror_dir(&parent_url), &urls);
        }

        for group in aggregate_by_url(records.clone()) {
            let dir = self.engine.mirrors.get_mirror_dir(&group.url);
            log::info!("Update git mirror of submodule {} ({})", group.url, dir.display());
            let dir = self.update_local_mirror(&dir, &group.url, &group.revisions(), LoaderKind::SubmoduleMirror)?;
            self.git().at(&dir).pack_refs()?;
            let mirror_url = local_mirror_url(&dir);
            for record in &group.submodules {
                repo.config_set(&format!("submodule.{}.url", record.name), &mirror_url)?;
            }
        }
        repo.submodule_update(self.strategy.submodule_depth, true)?;

        // clones made from a mirror point at it; builds must see the real remote
        for record in &records {
            let sub = repo.dir().join(&record.path);
            if sub.join(".git").exists() {
                self.git().at(&sub).config_set("remote.origin.url", &record.url)?;
            }
        }
        Ok(())
    }
}
