//! Engine-level errors.

use std::path::PathBuf;

use thiserror::Error;

use crate::classify::{Failure, classify};
use crate::config::ConfigError;
use crate::git::GitError;

/// Errors returned by the synchronization engine.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A git command failed.
    #[error(transparent)]
    Git(#[from] GitError),
    /// An underlying IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Settings the engine refuses to run with (auth method, checkout rules, git version).
    #[error("{0}")]
    PolicyViolation(String),
    /// The revision is still missing after every fetch the policy permits.
    #[error("Cannot find revision {revision} in branch {branch} of {url}")]
    RevisionNotFound {
        revision: String,
        branch: String,
        url: String,
    },
    /// A repository directory could not be wiped before reinitialization.
    #[error("Unable to clean directory {}", .0.display())]
    UnableToClean(PathBuf),
    /// Updating submodules failed.
    #[error("Submodules checkout failed: {0}")]
    Submodules(#[source] Box<SyncError>),
    /// Settings could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failure taxonomy driving retry and repair decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeouts, refused or reset connections, lock contention.
    Transient,
    /// Broken index or leftover lock files; repaired in place.
    RepairableLocalState,
    /// Auth or checkout settings the engine refuses to run with.
    PolicyViolation,
    /// Revision missing after every permitted fetch.
    RevisionNotFound,
    /// The build was interrupted.
    Cancelled,
    /// Everything else; propagated unchanged.
    Unrecoverable,
}

/// How a failure is reported to the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Recorded as a build problem; the build is marked failed but keeps running.
    BuildProblem,
    /// Hard VCS failure aborting the checkout step.
    VcsFailure,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::PolicyViolation(_) => ErrorKind::PolicyViolation,
            SyncError::RevisionNotFound { .. } => ErrorKind::RevisionNotFound,
            SyncError::Submodules(inner) => inner.kind(),
            SyncError::Config(_) => ErrorKind::PolicyViolation,
            _ => match classify(self) {
                Failure::Cancelled => ErrorKind::Cancelled,
                Failure::Timeout
                | Failure::ConnectionRefused
                | Failure::ConnectionReset
                | Failure::StaleLock => ErrorKind::Transient,
                Failure::CorruptedIndex | Failure::OutdatedIndex => ErrorKind::RepairableLocalState,
                _ => ErrorKind::Unrecoverable,
            },
        }
    }

    pub fn severity(&self) -> Severity {
        match self.kind() {
            ErrorKind::PolicyViolation | ErrorKind::RevisionNotFound => Severity::BuildProblem,
            _ => Severity::VcsFailure,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(stderr: &str) -> SyncError {
        SyncError::Git(GitError::Failed {
            command: "git fetch".to_string(),
            dir: PathBuf::from("/r"),
            exit_code: Some(128),
            stdout: String::new(),
            stderr: stderr.to_string(),
        })
    }

    #[test]
    fn kinds_follow_classification() {
        assert_eq!(failed("fatal: Connection reset by peer").kind(), ErrorKind::Transient);
        assert_eq!(
            failed("fatal: index file smaller than expected").kind(),
            ErrorKind::RepairableLocalState
        );
        assert_eq!(
            failed("fatal: couldn't find remote ref refs/heads/x").kind(),
            ErrorKind::Unrecoverable
        );
        assert_eq!(SyncError::Git(GitError::Cancelled).kind(), ErrorKind::Cancelled);
        assert!(SyncError::Git(GitError::Cancelled).is_cancelled());
    }

    #[test]
    fn severities() {
        let missing = SyncError::RevisionNotFound {
            revision: "abc".into(),
            branch: "refs/heads/main".into(),
            url: "u".into(),
        };
        assert_eq!(missing.severity(), Severity::BuildProblem);
        assert_eq!(
            SyncError::PolicyViolation("no".into()).severity(),
            Severity::BuildProblem
        );
        assert_eq!(failed("fatal: boom").severity(), Severity::VcsFailure);
    }

    #[test]
    fn submodule_errors_keep_inner_kind_and_prefix() {
        let err = SyncError::Submodules(Box::new(SyncError::Git(GitError::Cancelled)));
        assert!(err.is_cancelled());
        assert!(err.to_string().starts_with("Submodules checkout failed:"));
    }
}
