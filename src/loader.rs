//! Fetch strategy: which refspecs to fetch, in what order, and when to stop.
//!
//! A `CommitLoader` is bound to one repository directory. Every fetch removes
//! leftover ref locks first, is retried with backoff on transient failures and
//! repeated once after repairing a corrupted index.

use std::path::Path;

use crate::classify::{Failure, classify};
use crate::config::{FetchHeadsMode, Settings};
use crate::error::SyncError;
use crate::git::{FetchArgs, GitCli, GitDir};
use crate::repair::{git_dir_of, remove_ref_locks, run_and_fix_index_errors};
use crate::retry::{RetryPolicy, retry};
use crate::refs::RefSnapshot;
use crate::types::RefName;

/// Prefix of the temporary mirror branch exposing a revision to a shallow fetch.
const TMP_BRANCH: &str = "tmp_branch_for_build";

/// Where fetched refs land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderKind {
    /// Working tree: branches go to `refs/remotes/origin/*`.
    Checkout,
    /// Bare mirror of a root: branches keep their names.
    Mirror,
    /// Bare mirror of a submodule: every ref keeps its name.
    SubmoduleMirror,
}

impl LoaderKind {
    /// Refspec covering all branch heads.
    pub fn all_heads_refspec(self) -> &'static str {
        match self {
            LoaderKind::Checkout => "+refs/heads/*:refs/remotes/origin/*",
            LoaderKind::Mirror => "+refs/heads/*:refs/heads/*",
            LoaderKind::SubmoduleMirror => "+refs/*:refs/*",
        }
    }

    /// Local name a fetch of `branch` is stored under.
    pub fn remote_ref(self, branch: &RefName) -> RefName {
        match self {
            LoaderKind::Checkout => branch.remote_tracking(),
            LoaderKind::Mirror | LoaderKind::SubmoduleMirror => branch.clone(),
        }
    }

    /// `+<branch>:<local name>`.
    pub fn branch_refspec(self, branch: &RefName) -> String {
        format!("+{}:{}", branch, self.remote_ref(branch))
    }
}

/// Ensures a commit becomes reachable in one repository with minimal transfer.
pub struct CommitLoader<'a> {
    repo: GitDir<'a>,
    kind: LoaderKind,
    mode: FetchHeadsMode,
    tags: bool,
    shallow_depth: u32,
    policy: RetryPolicy,
}

impl<'a> CommitLoader<'a> {
    pub fn new(git: &'a GitCli, dir: &Path, kind: LoaderKind, settings: &Settings) -> Self {
        Self {
            repo: git.at(dir),
            kind,
            mode: settings.fetch_heads_mode,
            tags: settings.fetch_tags,
            shallow_depth: settings.shallow_depth.max(1),
            policy: RetryPolicy::from_settings(settings),
        }
    }

    #[cfg(test)]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn repo(&self) -> &GitDir<'a> {
        &self.repo
    }

    /// Make `sha` present, fetching all heads when it is not.
    pub fn load_commit(&self, sha: &str) -> Result<bool, SyncError> {
        if self.repo.has_revision(sha)? {
            return Ok(true);
        }
        self.fetch_all_heads()?;
        Ok(self.repo.has_revision(sha)?)
    }

    /// Make `sha` present, fetching `branch` and all heads as the fetch mode dictates.
    ///
    /// `enforce_fetch` forces at least one fetch, e.g. after refs were pruned.
    /// Returns whether `sha` is present afterwards.
    pub fn load_commit_in_branch(&self, sha: &str, branch: &RefName, enforce_fetch: bool) -> Result<bool, SyncError> {
        match self.mode {
            FetchHeadsMode::Always => {
                self.fetch_all_heads()?;
                if !branch.is_regular_branch() && self.is_fetch_required(sha, branch)? {
                    self.fetch_branch(branch, None)?;
                }
            }
            FetchHeadsMode::BeforeBuildBranch => {
                if !enforce_fetch && !self.is_fetch_required(sha, branch)? {
                    return Ok(true);
                }
                self.fetch_all_heads()?;
                if !branch.is_regular_branch() && self.is_fetch_required(sha, branch)? {
                    self.fetch_branch(branch, None)?;
                }
            }
            FetchHeadsMode::AfterBuildBranch => {
                if !enforce_fetch && !self.is_fetch_required(sha, branch)? {
                    return Ok(true);
                }
                self.fetch_branch(branch, None)?;
                if self.repo.has_revision(sha)? {
                    return Ok(true);
                }
                self.fetch_all_heads()?;
            }
        }
        Ok(self.repo.has_revision(sha)?)
    }

    /// Like `load_commit_in_branch`, failing with `RevisionNotFound` when `sha` stays missing.
    pub fn ensure_commit_loaded(&self, sha: &str, branch: &RefName, url: &str, enforce_fetch: bool) -> Result<(), SyncError> {
        if self.load_commit_in_branch(sha, branch, enforce_fetch)? {
            return Ok(());
        }
        Err(SyncError::RevisionNotFound {
            revision: sha.to_string(),
            branch: branch.to_string(),
            url: url.to_string(),
        })
    }

    /// True unless the local copy of `branch` already points at `sha` and `sha` is present.
    pub fn is_fetch_required(&self, sha: &str, branch: &RefName) -> Result<bool, SyncError> {
        let remote_ref = self.kind.remote_ref(branch);
        let Some(local_sha) = self.repo.rev_parse(remote_ref.as_str())? else {
            return Ok(true);
        };
        if local_sha == sha && self.repo.has_revision(sha)? {
            return Ok(false);
        }
        Ok(true)
    }

    /// Fetch `sha` with the smallest depth the remote permits.
    ///
    /// `remote_refs` is the remote's listing; it tells whether `branch` still points at `sha`.
    pub fn load_commit_prefer_shallow(
        &self,
        sha: &str,
        branch: &RefName,
        remote_refs: &RefSnapshot,
    ) -> Result<bool, SyncError> {
        if self.mode != FetchHeadsMode::AfterBuildBranch {
            log::warn!(
                "Shallow fetch is only supported with the after-build-branch fetch mode, fetching {} fully",
                branch
            );
            return self.load_commit_in_branch(sha, branch, false);
        }
        let remote_ref = self.kind.remote_ref(branch);
        if self.repo.has_revision(sha)? && self.repo.rev_parse(remote_ref.as_str())?.is_some() {
            return Ok(true);
        }

        let branch_points_at_sha = remote_refs.get(branch.as_str()) == Some(sha);
        let depth = Some(self.shallow_depth);
        if branch.is_tag() && branch_points_at_sha {
            self.fetch_branch(branch, depth)?;
        } else {
            let refspec = if branch.is_tag() {
                sha.to_string()
            } else {
                format!("+{}:{}", sha, remote_ref)
            };
            match self.fetch(&FetchArgs::new(refspec).depth(depth)) {
                Ok(()) => {}
                Err(e) if classify(&e) == Failure::UnadvertisedObject => {
                    log::warn!("Remote does not allow fetching {} directly: {}", sha, e);
                    if branch_points_at_sha {
                        self.fetch_branch(branch, depth)?;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        if self.repo.has_revision(sha)? {
            return Ok(true);
        }
        log::info!("Revision {} not found after a shallow fetch, fetching {} fully", sha, branch);
        self.load_commit_in_branch(sha, branch, false)
    }

    /// Fetch `branch` at depth 1 from a local mirror into this checkout.
    ///
    /// Tags are fetched by name. Other revisions are exposed through a temporary mirror
    /// branch so the fetch does not depend on what the mirror's branch points at.
    pub fn load_shallow_branch(&self, sha: &str, branch: &RefName, mirror: &GitDir<'_>) -> Result<(), SyncError> {
        let depth = Some(self.shallow_depth);
        if branch.is_tag() {
            return self.fetch(&FetchArgs::new(format!("+{branch}:{branch}")).depth(depth));
        }
        let tmp = free_tmp_branch(mirror)?;
        mirror.update_ref(&format!("refs/heads/{tmp}"), sha)?;
        let result = self.fetch(
            &FetchArgs::new(format!("+refs/heads/{}:{}", tmp, self.kind.remote_ref(branch))).depth(depth),
        );
        if let Err(e) = mirror.delete_branch(&tmp) {
            log::warn!("Failed to delete temporary branch {} in {}: {}", tmp, mirror.dir().display(), e);
        }
        result
    }

    pub fn fetch_all_heads(&self) -> Result<(), SyncError> {
        self.fetch(&FetchArgs::new(self.kind.all_heads_refspec()))
    }

    fn fetch_branch(&self, branch: &RefName, depth: Option<u32>) -> Result<(), SyncError> {
        self.fetch(&FetchArgs::new(self.kind.branch_refspec(branch)).depth(depth))
    }

    /// One fetch with lock cleanup, retries and index repair.
    pub fn fetch(&self, args: &FetchArgs) -> Result<(), SyncError> {
        let args = args.clone().tags(self.tags);
        let git_dir = git_dir_of(self.repo.dir());
        let operation = format!("fetch {}", args.refspecs.join(" "));
        let result = run_and_fix_index_errors(&self.repo, || {
            retry(&self.policy, self.repo.cancel_token(), &operation, |_| {
                remove_ref_locks(&git_dir)?;
                Ok(self.repo.fetch(&args)?)
            })
        });
        if matches!(&result, Err(e) if classify(e) == Failure::Timeout) {
            log::error!(
                "No output from git during {} in {}, consider increasing the idle timeout",
                operation,
                self.repo.dir().display()
            );
        }
        result
    }
}

/// First `tmp_branch_for_build[N]` not taken in `mirror`.
fn free_tmp_branch(mirror: &GitDir<'_>) -> Result<String, SyncError> {
    let listing = mirror.show_ref()?;
    let taken = RefSnapshot::parse(&listing.stdout);
    let mut name = TMP_BRANCH.to_string();
    let mut i = 0;
    while taken.contains(&format!("refs/heads/{name}")) {
        i += 1;
        name = format!("{TMP_BRANCH}{i}");
    }
    Ok(name)
}
