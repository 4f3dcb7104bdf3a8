//! Classification of git failures from their output.
//!
//! Git reports nearly every problem as exit code 128 plus a line of text, so retry
//! and repair decisions are made by matching that text here and nowhere else.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::SyncError;
use crate::git::GitError;

/// What a failed git command most likely ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Cancelled,
    /// Idle timeout of the process or a network timeout reported by git.
    Timeout,
    ConnectionRefused,
    ConnectionReset,
    /// TLS handshake or certificate problem.
    Ssl,
    /// `index file smaller than expected`, `index file corrupt`.
    CorruptedIndex,
    /// `Entry '<path>' not uptodate. Cannot merge.`
    OutdatedIndex,
    /// A `.lock` file left behind by a killed git process.
    StaleLock,
    /// The remote does not have the requested ref.
    RefNotFound,
    /// The server refused to serve an object by id.
    UnadvertisedObject,
    /// The remote could not be reached or refused access.
    RemoteAccess,
    AuthFailed,
    Other,
}

fn outdated_index_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"Entry '.+' not uptodate\. Cannot merge\.").expect("valid outdated index regex")
    })
}

fn stale_lock_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)unable to create '[^']+\.lock': file exists|cannot lock ref")
            .expect("valid stale lock regex")
    })
}

const REMOTE_ACCESS_PHRASES: &[&str] = &[
    "no remote repository specified",
    "no such remote",
    "access denied",
    "permission denied",
    "could not read from remote repository",
    "repository not found",
];

/// Classify raw git output.
pub fn classify_message(message: &str) -> Failure {
    let lower = message.to_lowercase();
    if lower.contains("process timeout")
        || lower.contains("connection timed out")
        || lower.contains("operation timed out")
    {
        Failure::Timeout
    } else if lower.contains("connection refused") {
        Failure::ConnectionRefused
    } else if lower.contains("connection reset") {
        Failure::ConnectionReset
    } else if lower.contains("ssl") || lower.contains("certificate") {
        Failure::Ssl
    } else if lower.contains("index file smaller than expected") || lower.contains("index file corrupt") {
        Failure::CorruptedIndex
    } else if outdated_index_pattern().is_match(message) {
        Failure::OutdatedIndex
    } else if stale_lock_pattern().is_match(message) {
        Failure::StaleLock
    } else if lower.contains("server does not allow request for unadvertised object") {
        Failure::UnadvertisedObject
    } else if lower.contains("couldn't find remote ref") {
        Failure::RefNotFound
    } else if lower.contains("authentication failed") {
        Failure::AuthFailed
    } else if REMOTE_ACCESS_PHRASES.iter().any(|p| lower.contains(p)) {
        Failure::RemoteAccess
    } else {
        Failure::Other
    }
}

/// Classify a git error.
pub fn classify_git(err: &GitError) -> Failure {
    match err {
        GitError::Cancelled => Failure::Cancelled,
        GitError::Timeout { .. } => Failure::Timeout,
        GitError::Failed { stdout, stderr, .. } => {
            match classify_message(stderr) {
                Failure::Other => classify_message(stdout),
                failure => failure,
            }
        }
        other => classify_message(&other.to_string()),
    }
}

/// Classify an engine error.
pub fn classify(err: &SyncError) -> Failure {
    match err {
        SyncError::Git(git) => classify_git(git),
        SyncError::Submodules(inner) => classify(inner),
        other => classify_message(&other.to_string()),
    }
}

impl Failure {
    /// Errors about the remote itself, which a fresh clone would hit again.
    pub fn is_remote_access(self) -> bool {
        matches!(
            self,
            Failure::RefNotFound | Failure::UnadvertisedObject | Failure::RemoteAccess | Failure::AuthFailed
        )
    }

    /// Whether attempt number `attempt` (1-based) out of `max` may be followed by another.
    pub fn is_recoverable(self, attempt: u32, max: u32) -> bool {
        let attempts_left = attempt < max;
        match self {
            Failure::Timeout | Failure::ConnectionRefused | Failure::ConnectionReset | Failure::StaleLock => {
                attempts_left
            }
            Failure::Cancelled | Failure::Ssl | Failure::CorruptedIndex | Failure::OutdatedIndex => false,
            // a freshly pushed ref may not be visible on every replica yet
            Failure::RefNotFound => attempt == 1 || attempts_left,
            failure => attempts_left && !failure.is_remote_access(),
        }
    }

    /// Whether wiping and recloning a mirror could fix this failure.
    pub fn is_reclone_safe(self) -> bool {
        !matches!(self, Failure::Timeout | Failure::Cancelled) && !self.is_remote_access()
    }

    /// Whether a failed fetch is worth repeating after pruning outdated refs.
    pub fn retry_after_pruning(self) -> bool {
        !matches!(self, Failure::Timeout | Failure::Cancelled | Failure::Ssl) && !self.is_remote_access()
    }
}
