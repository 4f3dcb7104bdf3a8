//! Shared types for gitsync

use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

use crate::config::{CleanMode, CleanPolicy, SubmodulePolicy};

/// Error type for parsing failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("value cannot be empty")]
    Empty,
    #[error("invalid character in value: {0:?}")]
    InvalidCharacter(char),
    #[error("value cannot start with '{0}'")]
    InvalidStart(char),
    #[error("value cannot contain '..'")]
    DoubleDot,
    #[error("invalid checkout rule: {0}")]
    InvalidRule(String),
}

/// A fully expanded git reference name such as `refs/heads/main`.
///
/// Short names are expanded to branches: `main` becomes `refs/heads/main`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefName(String);

const HEADS: &str = "refs/heads/";
const TAGS: &str = "refs/tags/";
const REMOTES_ORIGIN: &str = "refs/remotes/origin/";

impl RefName {
    /// Returns the full reference name
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for `refs/heads/*`.
    pub fn is_regular_branch(&self) -> bool {
        self.0.starts_with(HEADS)
    }

    /// True for `refs/tags/*`.
    pub fn is_tag(&self) -> bool {
        self.0.starts_with(TAGS)
    }

    /// Name without the `refs/heads/`, `refs/tags/` or `refs/` prefix.
    pub fn short_name(&self) -> &str {
        self.0
            .strip_prefix(HEADS)
            .or_else(|| self.0.strip_prefix(TAGS))
            .or_else(|| self.0.strip_prefix("refs/"))
            .unwrap_or(&self.0)
    }

    /// Where a fetch into a non-bare checkout stores this ref.
    ///
    /// Branches land under `refs/remotes/origin/`, everything else keeps its name.
    pub fn remote_tracking(&self) -> RefName {
        match self.0.strip_prefix(HEADS) {
            Some(branch) => RefName(format!("{REMOTES_ORIGIN}{branch}")),
            None => self.clone(),
        }
    }

    /// Maps `refs/remotes/origin/X` back to the remote side `refs/heads/X`.
    pub fn remote_counterpart(&self) -> RefName {
        match self.0.strip_prefix(REMOTES_ORIGIN) {
            Some(branch) => RefName(format!("{HEADS}{branch}")),
            None => self.clone(),
        }
    }
}

impl FromStr for RefName {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        if s.starts_with('-') {
            return Err(ParseError::InvalidStart('-'));
        }
        if s.contains("..") {
            return Err(ParseError::DoubleDot);
        }
        if let Some(c) = s.chars().find(|c| c.is_control() || *c == ' ' || *c == '~' || *c == '^' || *c == ':') {
            return Err(ParseError::InvalidCharacter(c));
        }
        if s.starts_with("refs/") {
            Ok(RefName(s.to_string()))
        } else {
            Ok(RefName(format!("{HEADS}{s}")))
        }
    }
}

impl fmt::Display for RefName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the agent authenticates against the remote.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthMethod {
    #[default]
    Anonymous,
    Password { username: Option<String> },
    AccessToken { username: Option<String> },
    /// Key provided by the agent environment (ssh-agent or default identity).
    SshKey { username: Option<String> },
    /// Key file on disk; not supported by agent-side checkout.
    PrivateKeyFile { username: Option<String> },
}

impl AuthMethod {
    /// Username configured for the root, if any.
    pub fn username(&self) -> Option<&str> {
        match self {
            AuthMethod::Anonymous => None,
            AuthMethod::Password { username }
            | AuthMethod::AccessToken { username }
            | AuthMethod::SshKey { username }
            | AuthMethod::PrivateKeyFile { username } => username.as_deref(),
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            AuthMethod::Anonymous => "anonymous",
            AuthMethod::Password { .. } => "password",
            AuthMethod::AccessToken { .. } => "access token",
            AuthMethod::SshKey { .. } => "ssh key",
            AuthMethod::PrivateKeyFile { .. } => "private key file",
        }
    }
}

/// Scheme of a remote url. Scp-like `user@host:path` counts as `ssh`, bare paths as `file`.
pub fn url_scheme(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) if parsed.scheme().len() > 1 => parsed.scheme().to_string(),
        _ if is_scp_like(url) => "ssh".to_string(),
        _ => "file".to_string(),
    }
}

fn is_scp_like(url: &str) -> bool {
    match (url.find('@'), url.find(':')) {
        (Some(at), Some(colon)) => at < colon && !url.starts_with('/'),
        _ => false,
    }
}

/// `url` with `username` inserted, when the url needs credentials and carries no user yet.
pub fn with_username(url: &str, username: &str) -> Option<String> {
    let mut parsed = Url::parse(url).ok()?;
    if !matches!(parsed.scheme(), "http" | "https" | "ssh") || !parsed.username().is_empty() {
        return None;
    }
    parsed.set_username(username).ok()?;
    Some(parsed.into())
}

/// One `+:from=>to` include rule. Empty strings mean the repository root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeRule {
    pub from: String,
    pub to: String,
}

/// Checkout rules mapping repository paths into the checkout directory.
///
/// Text form, one rule per line or `;`-separated:
/// - `+:src=>lib` or `src=>lib` includes `src` as `lib`
/// - `+:docs` includes `docs` at the same place
/// - `-:docs/internal` excludes a path
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CheckoutRules {
    pub includes: Vec<IncludeRule>,
    pub excludes: Vec<String>,
}

fn normalize_rule_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    if trimmed == "." { String::new() } else { trimmed.to_string() }
}

fn covers(prefix: &str, path: &str) -> bool {
    prefix.is_empty()
        || path == prefix
        || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
}

impl CheckoutRules {
    /// Whole repository into the checkout directory.
    pub fn whole_repository() -> Self {
        Self::default()
    }

    /// True when no rule narrows or moves anything.
    pub fn is_trivial(&self) -> bool {
        self.excludes.is_empty()
            && self
                .includes
                .iter()
                .all(|rule| rule.from.is_empty() && rule.to.is_empty())
    }

    /// True when every include maps a path onto itself.
    pub fn is_identity(&self) -> bool {
        self.includes.iter().all(|rule| rule.from == rule.to)
    }

    /// Maps a repository path to its checkout location, or `None` when not checked out.
    ///
    /// The most specific matching rule wins.
    pub fn map(&self, path: &str) -> Option<String> {
        let path = normalize_rule_path(path);
        let include = self
            .includes
            .iter()
            .filter(|rule| covers(&rule.from, &path))
            .max_by_key(|rule| rule.from.len());
        let include = match (include, self.includes.is_empty()) {
            (Some(rule), _) => Some(rule.clone()),
            (None, true) => Some(IncludeRule {
                from: String::new(),
                to: String::new(),
            }),
            (None, false) => None,
        }?;
        let exclude = self
            .excludes
            .iter()
            .filter(|ex| covers(ex, &path))
            .map(|ex| ex.len())
            .max();
        if exclude.is_some_and(|len| len >= include.from.len()) {
            return None;
        }
        let rest = path[include.from.len()..].trim_start_matches('/');
        Some(match (include.to.is_empty(), rest.is_empty()) {
            (true, _) => rest.to_string(),
            (false, true) => include.to.clone(),
            (false, false) => format!("{}/{}", include.to, rest),
        })
    }

    /// Text form accepted by `FromStr`.
    pub fn as_text(&self) -> String {
        let mut lines: Vec<String> = self
            .includes
            .iter()
            .map(|rule| {
                if rule.from == rule.to {
                    format!("+:{}", if rule.from.is_empty() { "." } else { &rule.from })
                } else {
                    format!("+:{}=>{}", rule.from, rule.to)
                }
            })
            .collect();
        lines.extend(self.excludes.iter().map(|ex| format!("-:{ex}")));
        lines.join("\n")
    }
}

impl FromStr for CheckoutRules {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rules = CheckoutRules::default();
        for raw in s.split(['\n', ';']) {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(path) = line.strip_prefix("-:") {
                if path.contains("=>") {
                    return Err(ParseError::InvalidRule(line.to_string()));
                }
                let path = normalize_rule_path(path);
                if path.is_empty() {
                    return Err(ParseError::InvalidRule(line.to_string()));
                }
                rules.excludes.push(path);
                continue;
            }
            let body = line.strip_prefix("+:").unwrap_or(line);
            let (from, to) = match body.split_once("=>") {
                Some((from, to)) => (normalize_rule_path(from), normalize_rule_path(to)),
                None => {
                    let path = normalize_rule_path(body);
                    (path.clone(), path)
                }
            };
            if from.contains("..") || to.contains("..") {
                return Err(ParseError::InvalidRule(line.to_string()));
            }
            rules.includes.push(IncludeRule { from, to });
        }
        Ok(rules)
    }
}

/// Another VCS root of the same build, as far as cleaning needs to know it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiblingRoot {
    pub name: String,
    pub rules: CheckoutRules,
}

/// Everything one build needs to synchronize a single VCS root. Immutable per build.
#[derive(Debug, Clone)]
pub struct RepositorySpec {
    pub fetch_url: String,
    pub push_url: Option<String>,
    pub auth: AuthMethod,
    /// Branch or tag the revision was taken from.
    pub branch: RefName,
    /// Full sha the working tree must end at.
    pub revision: String,
    pub rules: CheckoutRules,
    pub submodules: SubmodulePolicy,
    pub clean_policy: CleanPolicy,
    pub clean_mode: CleanMode,
    /// Checkout path of this root relative to the build checkout directory.
    pub target_path: String,
    /// Other roots checked out by the same build.
    pub siblings: Vec<SiblingRoot>,
    /// Latest revision the build is allowed to see, for the diff check.
    pub upper_limit_revision: Option<String>,
}

impl RepositorySpec {
    /// Minimal spec: whole repository, default policies.
    pub fn new(fetch_url: impl Into<String>, branch: RefName, revision: impl Into<String>) -> Self {
        Self {
            fetch_url: fetch_url.into(),
            push_url: None,
            auth: AuthMethod::Anonymous,
            branch,
            revision: revision.into(),
            rules: CheckoutRules::whole_repository(),
            submodules: SubmodulePolicy::default(),
            clean_policy: CleanPolicy::default(),
            clean_mode: CleanMode::default(),
            target_path: String::new(),
            siblings: Vec::new(),
            upper_limit_revision: None,
        }
    }

    /// Push URL, falling back to the fetch URL.
    pub fn push_url(&self) -> &str {
        self.push_url.as_deref().unwrap_or(&self.fetch_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod ref_name_tests {
        use super::*;

        #[test]
        fn short_name_expands_to_branch() {
            let name: RefName = "main".parse().unwrap();
            assert_eq!(name.as_str(), "refs/heads/main");
            assert!(name.is_regular_branch());
            assert_eq!(name.short_name(), "main");
        }

        #[test]
        fn full_names_are_kept() {
            let tag: RefName = "refs/tags/v1.0".parse().unwrap();
            assert!(tag.is_tag());
            assert!(!tag.is_regular_branch());
            assert_eq!(tag.short_name(), "v1.0");

            let pull: RefName = "refs/pull/1/head".parse().unwrap();
            assert_eq!(pull.short_name(), "pull/1/head");
        }

        #[test]
        fn remote_tracking_only_moves_branches() {
            let branch: RefName = "refs/heads/feature/x".parse().unwrap();
            assert_eq!(
                branch.remote_tracking().as_str(),
                "refs/remotes/origin/feature/x"
            );
            assert_eq!(branch.remote_tracking().remote_counterpart(), branch);

            let tag: RefName = "refs/tags/v1".parse().unwrap();
            assert_eq!(tag.remote_tracking(), tag);
        }

        #[test]
        fn rejects_dangerous_names() {
            assert_eq!("".parse::<RefName>(), Err(ParseError::Empty));
            assert_eq!(
                "-upload-pack".parse::<RefName>(),
                Err(ParseError::InvalidStart('-'))
            );
            assert_eq!("a/../b".parse::<RefName>(), Err(ParseError::DoubleDot));
            assert!(matches!(
                "a:b".parse::<RefName>(),
                Err(ParseError::InvalidCharacter(':'))
            ));
        }

        #[test]
        fn url_schemes() {
            assert_eq!(url_scheme("https://example.com/r.git"), "https");
            assert_eq!(url_scheme("git://example.com/r.git"), "git");
            assert_eq!(url_scheme("git@example.com:org/r.git"), "ssh");
            assert_eq!(url_scheme("/srv/repos/r.git"), "file");
            assert_eq!(url_scheme("C:/repos/r.git"), "file");
        }

        #[test]
        fn username_only_added_where_missing() {
            assert_eq!(
                with_username("https://example.com/lib.git", "ci").as_deref(),
                Some("https://ci@example.com/lib.git")
            );
            assert_eq!(with_username("https://bob@example.com/lib.git", "ci"), None);
            assert_eq!(with_username("file:///srv/lib.git", "ci"), None);
            assert_eq!(with_username("../lib.git", "ci"), None);
        }
    }

    mod rules_tests {
        use super::*;

        #[test]
        fn empty_rules_are_trivial_and_map_everything() {
            let rules: CheckoutRules = "".parse().unwrap();
            assert!(rules.is_trivial());
            assert_eq!(rules.map("src/main.rs").as_deref(), Some("src/main.rs"));
        }

        #[test]
        fn parses_includes_and_excludes() {
            let rules: CheckoutRules = "+:src\n-:src/gen\n+:docs=>manual".parse().unwrap();
            assert_eq!(rules.includes.len(), 2);
            assert_eq!(rules.excludes, vec!["src/gen".to_string()]);
            assert!(!rules.is_trivial());
            assert!(!rules.is_identity());
        }

        #[test]
        fn map_uses_most_specific_rule() {
            let rules: CheckoutRules = "+:src;-:src/gen;+:src/gen/keep".parse().unwrap();
            assert_eq!(rules.map("src/a.rs").as_deref(), Some("src/a.rs"));
            assert_eq!(rules.map("src/gen/x.rs"), None);
            assert_eq!(
                rules.map("src/gen/keep/y.rs").as_deref(),
                Some("src/gen/keep/y.rs")
            );
            assert_eq!(rules.map("README"), None);
        }

        #[test]
        fn map_moves_paths() {
            let rules: CheckoutRules = "docs=>manual".parse().unwrap();
            assert_eq!(rules.map("docs/index.md").as_deref(), Some("manual/index.md"));
            assert_eq!(rules.map("docsx/index.md"), None);
        }

        #[test]
        fn root_exclude_is_invalid() {
            assert!(matches!(
                "-:.".parse::<CheckoutRules>(),
                Err(ParseError::InvalidRule(_))
            ));
        }

        #[test]
        fn text_form_parses_back() {
            let rules: CheckoutRules = "+:src\n-:src/gen".parse().unwrap();
            let again: CheckoutRules = rules.as_text().parse().unwrap();
            assert_eq!(rules, again);
        }
    }
}
