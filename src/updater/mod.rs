//! The update pipeline for one VCS root.
//!
//! ```text
//! check auth ─► [update mirror] ─► configure or init ─► prune refs ─► load commit
//!                                        ▲                                  │
//!                                        └──── wipe once on failure ◄───────┤
//!                                                                           ▼
//!                                   submodules ◄── clean ◄── checkout ◄─────┘
//! ```
//!
//! One pipeline serves every variant; the `Strategy` picked from the settings
//! decides how the checkout links to a mirror, how the commit is loaded and
//! where submodules are fetched from.

mod checkout;
mod clean;
mod init;
mod linkage;
mod mirror;
mod sparse;
mod submodules;

use std::path::{Path, PathBuf};

use dashmap::DashSet;

use crate::classify::classify;
use crate::config::{MirrorStrategy, Settings, SubmodulePolicy};
use crate::error::{ErrorKind, SyncError};
use crate::git::{GitCli, GitDir};
use crate::loader::{CommitLoader, LoaderKind};
use crate::mirror::MirrorManager;
use crate::refs::RefPruner;
use crate::retry::RetryPolicy;
use crate::types::{AuthMethod, RepositorySpec, url_scheme};

use mirror::MirrorRevision;

/// How the checkout directory relates to a shared mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// The checkout fetches straight from the remote.
    Direct,
    /// The checkout fetches from a local mirror through `url.<mirror>.insteadOf`.
    Mirror,
    /// The checkout borrows the mirror's object store through an alternates file.
    MirrorWithAlternates,
    /// Like `Mirror`, but the checkout is a depth-limited clone of the mirror.
    ShallowMirror,
}

impl Variant {
    pub fn select(settings: &Settings) -> Self {
        match settings.mirror_strategy {
            MirrorStrategy::None => Self::Direct,
            MirrorStrategy::Mirror if settings.shallow => Self::ShallowMirror,
            MirrorStrategy::Mirror => Self::Mirror,
            MirrorStrategy::Alternates => Self::MirrorWithAlternates,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Mirror => "mirror",
            Self::MirrorWithAlternates => "mirror with alternates",
            Self::ShallowMirror => "shallow clone from mirror",
        }
    }
}

/// How the checkout directory is wired to the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    /// No mirror; rewrite sections and alternates left by earlier builds are removed.
    Direct,
    InsteadOf,
    Alternates,
}

/// How the build revision is brought into the checkout directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitLoading {
    InBranch,
    PreferShallow,
    ShallowFromMirror,
}

/// Where submodules are fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmoduleSource {
    Remote,
    Mirrors,
}

/// Policy of one update, fixed before the pipeline starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strategy {
    pub variant: Variant,
    pub linkage: Linkage,
    pub commit_loading: CommitLoading,
    pub submodules: SubmoduleSource,
    /// The checkout directory must be a shallow repository.
    pub shallow_checkout: bool,
    pub submodule_depth: Option<u32>,
}

impl Strategy {
    pub fn new(variant: Variant, settings: &Settings) -> Self {
        let submodules_from_mirrors = if settings.use_mirrors_for_submodules {
            SubmoduleSource::Mirrors
        } else {
            SubmoduleSource::Remote
        };
        let (linkage, commit_loading, submodules, shallow_checkout) = match variant {
            Variant::Direct if settings.shallow => {
                (Linkage::Direct, CommitLoading::PreferShallow, SubmoduleSource::Remote, true)
            }
            Variant::Direct => (Linkage::Direct, CommitLoading::InBranch, SubmoduleSource::Remote, false),
            Variant::Mirror => (Linkage::InsteadOf, CommitLoading::InBranch, submodules_from_mirrors, false),
            Variant::MirrorWithAlternates => {
                (Linkage::Alternates, CommitLoading::InBranch, submodules_from_mirrors, false)
            }
            Variant::ShallowMirror => (
                Linkage::InsteadOf,
                CommitLoading::ShallowFromMirror,
                submodules_from_mirrors,
                true,
            ),
        };
        let submodule_depth = settings
            .submodules_shallow_depth
            .or(shallow_checkout.then_some(settings.shallow_depth));
        Self {
            variant,
            linkage,
            commit_loading,
            submodules,
            shallow_checkout,
            submodule_depth,
        }
    }

    pub fn uses_mirror(&self) -> bool {
        self.linkage != Linkage::Direct
    }
}

/// A non-fatal problem to be reported on the build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildProblem {
    /// Problem type, e.g. `UpperLimitRevisionDiff`.
    pub kind: &'static str,
    pub description: String,
    pub details: String,
}

/// Outcome of a successful update.
#[derive(Debug, Default)]
pub struct UpdateReport {
    pub problems: Vec<BuildProblem>,
    /// Mirror the checkout was linked to.
    pub mirror_dir: Option<PathBuf>,
    /// The checkout directory was wiped and cloned again after a failure.
    pub reinitialized: bool,
}

/// Everything shared by the updates of one agent process.
pub struct Engine {
    git: GitCli,
    settings: Settings,
    mirrors: MirrorManager,
    pruner: RefPruner,
    /// Mirrors that loaded a commit in this process; they are never wiped.
    loaded_mirrors: DashSet<PathBuf>,
}

impl Engine {
    pub fn new(git: GitCli, settings: Settings, mirrors: MirrorManager) -> Self {
        let pruner = RefPruner::new(settings.remove_outdated_refs, RetryPolicy::from_settings(&settings));
        Self {
            git,
            settings,
            mirrors,
            pruner,
            loaded_mirrors: DashSet::new(),
        }
    }

    #[cfg(test)]
    pub fn mirrors(&self) -> &MirrorManager {
        &self.mirrors
    }

    /// Updater bringing `target_dir` to the state `spec` describes.
    pub fn updater<'a>(&'a self, spec: &'a RepositorySpec, target_dir: &Path) -> Updater<'a> {
        let variant = Variant::select(&self.settings);
        Updater {
            engine: self,
            spec,
            target_dir: target_dir.to_path_buf(),
            strategy: Strategy::new(variant, &self.settings),
            mirror_dir: None,
            fresh: false,
        }
    }

    /// Synchronize `target_dir` with `spec`.
    pub fn update(&self, spec: &RepositorySpec, target_dir: &Path) -> Result<UpdateReport, SyncError> {
        self.updater(spec, target_dir).update()
    }
}

/// Fails when the auth method cannot work over the url's transport.
pub fn check_auth(spec: &RepositorySpec) -> Result<(), SyncError> {
    let scheme = url_scheme(&spec.fetch_url);
    if scheme == "git" {
        return Ok(());
    }
    match &spec.auth {
        AuthMethod::Password { .. } | AuthMethod::AccessToken { .. }
            if !matches!(scheme.as_str(), "http" | "https") =>
        {
            Err(SyncError::PolicyViolation(format!(
                "'{}' protocol doesn't support authentication method '{}' with agent checkout and non-http protocols",
                scheme,
                spec.auth.display_name()
            )))
        }
        AuthMethod::PrivateKeyFile { .. } => Err(SyncError::PolicyViolation(format!(
            "Authentication method '{}' is not supported by agent checkout",
            spec.auth.display_name()
        ))),
        _ => Ok(()),
    }
}

/// The pipeline for one root and one checkout directory.
pub struct Updater<'a> {
    engine: &'a Engine,
    spec: &'a RepositorySpec,
    target_dir: PathBuf,
    strategy: Strategy,
    mirror_dir: Option<PathBuf>,
    /// The checkout directory was initialized from scratch in this update.
    fresh: bool,
}

impl<'a> Updater<'a> {
    #[cfg(test)]
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    fn git(&self) -> &'a GitCli {
        &self.engine.git
    }

    fn settings(&self) -> &'a Settings {
        &self.engine.settings
    }

    fn repo(&self) -> GitDir<'a> {
        self.engine.git.at(&self.target_dir)
    }

    fn loader(&self) -> CommitLoader<'a> {
        CommitLoader::new(self.git(), &self.target_dir, LoaderKind::Checkout, self.settings())
    }

    pub fn update(mut self) -> Result<UpdateReport, SyncError> {
        log::info!(
            "Updating {} in {} to {} ({}, {})",
            self.spec.fetch_url,
            self.target_dir.display(),
            self.spec.revision,
            self.spec.branch,
            self.strategy.variant.name()
        );
        check_auth(self.spec)?;
        self.check_sparse_checkout()?;

        let mut report = UpdateReport::default();
        if self.strategy.uses_mirror() {
            let dir = self.update_root_mirror()?;
            report.mirror_dir = Some(dir.clone());
            self.mirror_dir = Some(dir);
        }

        match self.update_checkout(false) {
            Ok(()) => {}
            Err(e) if self.should_reinitialize(&e) => {
                log::warn!(
                    "Update of {} failed, removing the repository and cloning from scratch: {}",
                    self.target_dir.display(),
                    e
                );
                self.update_checkout(true)?;
                report.reinitialized = true;
            }
            Err(e) => return Err(e),
        }

        self.check_upper_limit(&mut report);
        Ok(report)
    }

    fn should_reinitialize(&self, err: &SyncError) -> bool {
        if self.fresh {
            return false;
        }
        match err.kind() {
            ErrorKind::PolicyViolation | ErrorKind::RevisionNotFound | ErrorKind::Cancelled => false,
            _ => classify(err).is_reclone_safe(),
        }
    }

    fn update_checkout(&mut self, force_fresh: bool) -> Result<(), SyncError> {
        self.init_git_repository(force_fresh)?;
        let fetch_required = self.engine.pruner.remove_outdated_refs(&self.repo(), false)?;
        self.ensure_commit_loaded(fetch_required)?;
        let branch_changed = self.update_sources()?;
        self.clean(branch_changed)?;
        if self.spec.submodules.is_enabled() {
            match self.checkout_submodules(&self.target_dir) {
                Ok(()) => {}
                Err(e) if self.spec.submodules == SubmodulePolicy::CheckoutIgnoringErrors && !e.is_cancelled() => {
                    log::warn!("Ignoring submodule failure in {}: {}", self.target_dir.display(), e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn update_root_mirror(&self) -> Result<PathBuf, SyncError> {
        let dir = self.engine.mirrors.get_mirror_dir(&self.spec.fetch_url);
        log::info!("Update git mirror ({})", dir.display());
        let revision = MirrorRevision {
            branch: Some(self.spec.branch.clone()),
            sha: self.spec.revision.clone(),
        };
        let dir = self.update_local_mirror(&dir, &self.spec.fetch_url, &[revision], LoaderKind::Mirror)?;
        self.git().at(&dir).pack_refs()?;
        Ok(dir)
    }

    fn ensure_commit_loaded(&self, fetch_required: bool) -> Result<(), SyncError> {
        let loader = self.loader();
        let spec = self.spec;
        let found = match self.strategy.commit_loading {
            CommitLoading::InBranch => {
                return loader.ensure_commit_loaded(&spec.revision, &spec.branch, &spec.fetch_url, fetch_required);
            }
            CommitLoading::PreferShallow => {
                let remote = self.engine.pruner.remote_refs(loader.repo())?;
                loader.load_commit_prefer_shallow(&spec.revision, &spec.branch, &remote)?
            }
            CommitLoading::ShallowFromMirror => {
                let Some(mirror_dir) = &self.mirror_dir else {
                    return Err(SyncError::PolicyViolation(
                        "Shallow clone from a mirror requires a mirror".to_string(),
                    ));
                };
                let mirror = self.git().at(mirror_dir);
                loader.load_shallow_branch(&spec.revision, &spec.branch, &mirror)?;
                loader.repo().has_revision(&spec.revision)?
            }
        };
        if found {
            return Ok(());
        }
        Err(SyncError::RevisionNotFound {
            revision: spec.revision.clone(),
            branch: spec.branch.to_string(),
            url: spec.fetch_url.clone(),
        })
    }

    /// Report files the checkout rules see changing between the build and upper-limit revisions.
    ///
    /// Never fails the update; a missing upper-limit commit skips the check.
    fn check_upper_limit(&self, report: &mut UpdateReport) {
        if !self.settings().check_diff_with_upper_limit {
            return;
        }
        let Some(upper) = self.spec.upper_limit_revision.as_deref() else {
            return;
        };
        let revision = self.spec.revision.as_str();
        if upper == revision {
            log::info!("Build revision is the same as the upper limit revision, skip checking diff");
            return;
        }
        match self.loader().load_commit(upper) {
            Ok(true) => {}
            Ok(false) => {
                log::warn!("Failed to fetch {}, will not analyze diff with upper limit revision", upper);
                return;
            }
            Err(e) => {
                log::warn!("Failed to fetch {}, will not analyze diff with upper limit revision: {}", upper, e);
                return;
            }
        }
        let changed = match self.repo().diff_names(revision, upper) {
            Ok(changed) => changed,
            Err(e) => {
                log::warn!("Failed to compute diff with upper limit revision {}: {}", upper, e);
                return;
            }
        };
        let matched: Vec<String> = changed
            .into_iter()
            .filter(|path| self.spec.rules.map(path).is_some())
            .collect();
        if matched.is_empty() {
            log::info!("No diff matched by checkout rules found");
            return;
        }
        let mut details = String::from("Files matched by checkout rules changed between build revision and upper-limit revision\n");
        details.push_str(&format!("Checkout rules: '{}'\n", self.spec.rules.as_text()));
        details.push_str(&format!("Build revision: '{}'\n", revision));
        details.push_str(&format!("Upper limit revision: '{}'\n", upper));
        details.push_str("Files:\n");
        for path in &matched {
            details.push_str(&format!("\t{}\n", path));
        }
        log::error!("{}", details);
        report.problems.push(BuildProblem {
            kind: "UpperLimitRevisionDiff",
            description: "Diff with upper limit revision found".to_string(),
            details,
        });
    }
}
