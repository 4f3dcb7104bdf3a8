//! Local and remote ref snapshots and pruning of outdated refs.
//!
//! Git cannot fetch a branch `a/b` while a stale local `a` exists, and a renamed
//! branch leaves its old remote-tracking ref behind forever. Before loading commits
//! the local refs are compared with the remote listing and every ref the remote no
//! longer has is deleted.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::SyncError;
use crate::git::{GitDir, GitError};
use crate::repair::git_dir_of;
use crate::retry::{RetryPolicy, retry};

const HEADS: &str = "refs/heads/";
const TAGS: &str = "refs/tags/";
const REMOTES_ORIGIN: &str = "refs/remotes/origin/";

/// `update-ref --stdin` instructions per invocation.
const PRUNE_BATCH: usize = 1000;

/// Set of `(name, object id)` pairs from `show-ref` or `ls-remote`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefSnapshot {
    refs: BTreeMap<String, String>,
}

impl RefSnapshot {
    /// Parse `<sha> <name>` or `<sha>\t<name>` lines. Peeled tag entries are skipped.
    pub fn parse(listing: &str) -> Self {
        let refs = listing
            .lines()
            .filter_map(|line| {
                let line = line.trim_end();
                let (sha, name) = line.split_once([' ', '\t'])?;
                let name = name.trim();
                if sha.len() != 40 || name.is_empty() || name.ends_with("^{}") {
                    return None;
                }
                Some((name.to_string(), sha.to_string()))
            })
            .collect();
        Self { refs }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.refs.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.refs.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.refs.iter().map(|(name, sha)| (name.as_str(), sha.as_str()))
    }
}

/// Ref names `show-ref` reported as broken on stderr.
pub fn parse_invalid_refs(stderr: &str) -> Vec<String> {
    stderr
        .lines()
        .map(str::trim)
        .filter_map(|line| {
            line.strip_prefix("error: ")
                .and_then(|rest| rest.strip_suffix(" does not point to a valid object!"))
                .or_else(|| line.strip_prefix("warning: ignoring broken ref "))
                .map(str::to_string)
        })
        .collect()
}

/// A local ref to delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prune {
    /// Git cannot read the ref.
    Invalid(String),
    /// The remote no longer has `remote`, or its tag moved.
    Outdated { local: String, remote: String },
}

impl Prune {
    pub fn ref_name(&self) -> &str {
        match self {
            Prune::Invalid(name) => name,
            Prune::Outdated { local, .. } => local,
        }
    }
}

/// Remote side of a local ref, `None` for refs the remote does not advertise.
fn remote_counterpart(local: &str) -> Option<String> {
    if let Some(branch) = local.strip_prefix(REMOTES_ORIGIN) {
        return (branch != "HEAD").then(|| format!("{HEADS}{branch}"));
    }
    (local.starts_with(HEADS) || local.starts_with(TAGS)).then(|| local.to_string())
}

/// Local refs whose remote counterpart is gone, plus tags the remote moved.
pub fn detect_outdated(local: &RefSnapshot, remote: &RefSnapshot) -> Vec<Prune> {
    local
        .iter()
        .filter_map(|(name, sha)| {
            let counterpart = remote_counterpart(name)?;
            let outdated = match remote.get(&counterpart) {
                None => true,
                Some(remote_sha) => counterpart.starts_with(TAGS) && remote_sha != sha,
            };
            outdated.then(|| Prune::Outdated {
                local: name.to_string(),
                remote: counterpart,
            })
        })
        .collect()
}

/// Delete the given refs, batching through `update-ref --stdin`.
pub fn prune(repo: &GitDir<'_>, prunes: &[Prune]) -> Result<(), GitError> {
    match prunes {
        [] => Ok(()),
        [single] => repo.delete_ref(single.ref_name()),
        _ => {
            for batch in prunes.chunks(PRUNE_BATCH) {
                let names: Vec<&str> = batch.iter().map(Prune::ref_name).collect();
                log::info!("Removing refs: {:?}", names);
                let lines: Vec<String> = names.iter().map(|name| format!("delete {name}")).collect();
                repo.update_ref_stdin(&lines)?;
            }
            Ok(())
        }
    }
}

/// Drop every ref: delete `FETCH_HEAD` and `packed-refs` and recreate an empty `refs/`.
pub fn reset_refs(git_dir: &Path) -> io::Result<()> {
    for name in ["FETCH_HEAD", "packed-refs"] {
        match fs::remove_file(git_dir.join(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    let refs = git_dir.join("refs");
    match fs::remove_dir_all(&refs) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::create_dir_all(refs.join("heads"))?;
    fs::create_dir_all(refs.join("tags"))
}

/// Removes outdated refs, remembering remote listings for the rest of the run.
pub struct RefPruner {
    enabled: bool,
    policy: RetryPolicy,
    remote_refs: DashMap<PathBuf, Arc<RefSnapshot>>,
}

impl RefPruner {
    pub fn new(enabled: bool, policy: RetryPolicy) -> Self {
        Self {
            enabled,
            policy,
            remote_refs: DashMap::new(),
        }
    }

    /// Remote refs as seen from `repo`'s `origin`, listed once per repository.
    pub fn remote_refs(&self, repo: &GitDir<'_>) -> Result<Arc<RefSnapshot>, SyncError> {
        if let Some(cached) = self.remote_refs.get(repo.dir()) {
            return Ok(Arc::clone(cached.value()));
        }
        let listing = retry(&self.policy, repo.cancel_token(), "ls-remote", |_| Ok(repo.ls_remote()?))?;
        let snapshot = Arc::new(RefSnapshot::parse(&listing));
        self.remote_refs.insert(repo.dir().to_path_buf(), Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Forget the cached listing of `dir`, e.g. after its remote changed.
    pub fn forget(&self, dir: &Path) {
        self.remote_refs.remove(dir);
    }

    /// Delete invalid and outdated refs of `repo`. Returns true when anything was removed,
    /// meaning a fetch is required.
    ///
    /// Disabled pruning is skipped unless `force` is set.
    pub fn remove_outdated_refs(&self, repo: &GitDir<'_>, force: bool) -> Result<bool, SyncError> {
        if !self.enabled && !force {
            return Ok(false);
        }
        let show = repo.show_ref()?;
        let invalid: Vec<Prune> = parse_invalid_refs(&show.stderr)
            .into_iter()
            .map(Prune::Invalid)
            .collect();
        if !show.success() && invalid.is_empty() && !show.stderr.trim().is_empty() {
            let git_dir = git_dir_of(repo.dir());
            log::warn!(
                "show-ref failed in {} without naming a broken ref, recreating all refs: {}",
                repo.dir().display(),
                show.stderr.trim()
            );
            reset_refs(&git_dir)?;
            return Ok(true);
        }
        let local = RefSnapshot::parse(&show.stdout);
        if local.is_empty() && invalid.is_empty() {
            return Ok(false);
        }

        let mut removed = false;
        if !invalid.is_empty() {
            log::warn!("Removing {} invalid refs in {}", invalid.len(), repo.dir().display());
            prune(repo, &invalid)?;
            removed = true;
        }

        let remote = match self.remote_refs(repo) {
            Ok(remote) => remote,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                log::warn!("Failed to list remote repository refs, outdated local refs will not be cleaned: {}", e);
                return Ok(removed);
            }
        };
        let outdated = detect_outdated(&local, &remote);
        if !outdated.is_empty() {
            log::info!("Removing {} outdated refs in {}", outdated.len(), repo.dir().display());
            prune(repo, &outdated)?;
            removed = true;
        }
        Ok(removed)
    }
}
