//! Engine settings.
//!
//! Settings are read from a JSON file (`<cache-root>/gitsync.json` by default).
//! Every field is optional; missing fields take the defaults below.

use std::path::Path;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned while loading settings.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The settings file could not be read.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// The settings file is not valid JSON for `Settings`.
    #[error("failed to parse settings file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Which refs a checkout fetches besides the build branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchHeadsMode {
    /// Fetch the build branch; fall back to all heads if the revision is still missing.
    #[default]
    AfterBuildBranch,
    /// Fetch all heads first, then the build branch if it is not under `refs/heads`.
    BeforeBuildBranch,
    /// Always fetch all heads.
    Always,
}

/// When untracked files are removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CleanPolicy {
    Always,
    OnBranchChange,
    #[default]
    Never,
}

/// Which untracked files are removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CleanMode {
    #[default]
    AllUntracked,
    NonIgnoredOnly,
    IgnoredOnly,
}

/// What happens to submodules after checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SubmodulePolicy {
    Ignore,
    /// Update the first level only.
    NonRecursiveCheckout,
    /// Update submodules and recurse into nested ones.
    #[default]
    Checkout,
    /// Like `Checkout`, but a failure does not fail the update.
    CheckoutIgnoringErrors,
}

impl SubmodulePolicy {
    pub fn is_enabled(self) -> bool {
        self != SubmodulePolicy::Ignore
    }

    pub fn is_recursive(self) -> bool {
        matches!(
            self,
            SubmodulePolicy::Checkout | SubmodulePolicy::CheckoutIgnoringErrors
        )
    }
}

/// How local mirrors are used for the checkout directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MirrorStrategy {
    /// No mirror; the checkout directory fetches from the remote.
    #[default]
    None,
    /// Fetch into a shared mirror; the checkout fetches from it via `insteadOf`.
    Mirror,
    /// Fetch into a shared mirror; the checkout borrows its objects via alternates.
    Alternates,
}

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Path to the git executable.
    pub git_path: String,
    /// Idle-output timeout for network commands, in seconds.
    pub idle_timeout_secs: u64,
    /// Idle-output timeout for local commands, in seconds.
    pub local_timeout_secs: u64,
    pub fetch_heads_mode: FetchHeadsMode,
    pub fetch_tags: bool,
    pub mirror_strategy: MirrorStrategy,
    /// Clone the checkout directory shallow from a mirror.
    pub shallow: bool,
    pub shallow_depth: u32,
    pub submodules_shallow_depth: Option<u32>,
    pub use_mirrors_for_submodules: bool,
    pub use_sparse_checkout: bool,
    /// Insert the root's username into submodule URLs that need credentials.
    pub use_main_repo_user_for_submodules: bool,
    /// Never exclude sibling roots' directories from `git clean` when false.
    pub clean_respects_other_roots: bool,
    pub remove_outdated_refs: bool,
    pub check_diff_with_upper_limit: bool,
    /// Number of attempts for remote operations.
    pub remote_operation_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_factor: f64,
    pub retry_jitter: f64,
    pub idle_gc: IdleGcSettings,
    /// Mirrors unused for longer than this are removed by the cleaner, in days.
    pub unused_mirror_max_age_days: u64,
}

/// Idle compaction of mirrors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleGcSettings {
    pub enabled: bool,
    /// Minimum time since the last build before compaction starts, in minutes.
    pub cool_down_minutes: u64,
    /// A mirror is compacted at most once per this many hours.
    pub rate_hours: u64,
    /// How often the scheduler wakes up to look for work, in seconds.
    pub check_interval_secs: u64,
}

impl Default for IdleGcSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            cool_down_minutes: 30,
            rate_hours: 12,
            check_interval_secs: 60,
        }
    }
}

impl IdleGcSettings {
    pub fn cool_down(&self) -> Duration {
        Duration::from_secs(self.cool_down_minutes * 60)
    }

    pub fn rate(&self) -> Duration {
        Duration::from_secs(self.rate_hours * 60 * 60)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            git_path: "git".to_string(),
            idle_timeout_secs: 30 * 60,
            local_timeout_secs: 10 * 60,
            fetch_heads_mode: FetchHeadsMode::default(),
            fetch_tags: false,
            mirror_strategy: MirrorStrategy::default(),
            shallow: false,
            shallow_depth: 1,
            submodules_shallow_depth: None,
            use_mirrors_for_submodules: true,
            use_sparse_checkout: false,
            use_main_repo_user_for_submodules: true,
            clean_respects_other_roots: true,
            remove_outdated_refs: true,
            check_diff_with_upper_limit: true,
            remote_operation_attempts: 3,
            retry_initial_delay_ms: 1000,
            retry_factor: 2.0,
            retry_jitter: 0.1,
            idle_gc: IdleGcSettings::default(),
            unused_mirror_max_age_days: 7,
        }
    }
}

impl Settings {
    /// Load settings from `path`, or defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No settings file at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }

    pub fn local_timeout(&self) -> Duration {
        Duration::from_secs(self.local_timeout_secs.max(1))
    }

    pub fn unused_mirror_max_age(&self) -> Duration {
        Duration::from_secs(self.unused_mirror_max_age_days * 24 * 60 * 60)
    }
}
