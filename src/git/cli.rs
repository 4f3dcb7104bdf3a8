//! Git CLI wrapper with security hardening.
//!
//! `GitCli` holds what every invocation shares (executable, runner, timeouts,
//! cancellation); `GitDir` binds it to one repository directory and exposes the
//! handful of subcommands the engine needs. Network commands get the long idle
//! timeout, local ones the short one.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::command::{CancelToken, CommandRunner, ExecResult, GitError, Invocation};
use crate::config::Settings;

/// Validate that a git ref or revision does not contain dangerous patterns.
///
/// Rejects:
/// - Empty strings
/// - Strings containing `..` (range syntax)
/// - Strings starting with `-` (could be interpreted as flags)
/// - Strings containing null bytes or control characters
pub fn validate_git_ref(value: &str, name: &str) -> Result<(), GitError> {
    if value.is_empty() {
        return Err(GitError::InvalidInput(format!("{} cannot be empty", name)));
    }
    if value.contains("..") {
        return Err(GitError::InvalidInput(format!(
            "{} cannot contain '..'",
            name
        )));
    }
    if value.starts_with('-') {
        return Err(GitError::InvalidInput(format!(
            "{} cannot start with '-'",
            name
        )));
    }
    if value.bytes().any(|b| b == 0 || b < 0x20) {
        return Err(GitError::InvalidInput(format!(
            "{} cannot contain null or control characters",
            name
        )));
    }
    Ok(())
}

/// A parsed `git --version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GitVersion(pub u32, pub u32, pub u32);

impl GitVersion {
    /// First version with `core.sparseCheckout`.
    pub const SPARSE_CHECKOUT: GitVersion = GitVersion(1, 7, 4);
    /// First version accepting `submodule update --progress`.
    pub const SUBMODULE_PROGRESS: GitVersion = GitVersion(2, 11, 0);

    /// Parse output like `git version 2.39.2` or `git version 2.37.1 (Apple Git-137.1)`.
    pub fn parse(output: &str) -> Option<Self> {
        let raw = output.trim().strip_prefix("git version ")?;
        let mut parts = raw
            .split(|c: char| !c.is_ascii_digit())
            .take(3)
            .map(|p| p.parse::<u32>().ok());
        let major = parts.next()??;
        let minor = parts.next().flatten().unwrap_or(0);
        let patch = parts.next().flatten().unwrap_or(0);
        Some(GitVersion(major, minor, patch))
    }
}

impl fmt::Display for GitVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

/// Branches of a working tree as listed by `git branch`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchList {
    /// Checked-out branch, `None` when HEAD is detached.
    pub current: Option<String>,
    pub names: Vec<String>,
}

impl BranchList {
    /// Parse `git branch` output, where the current branch is marked with `*`.
    pub fn parse(output: &str) -> Self {
        let mut list = BranchList::default();
        for line in output.lines() {
            let (current, name) = match line.strip_prefix('*') {
                Some(rest) => (true, rest.trim()),
                None => (false, line.trim()),
            };
            if name.is_empty() || name.starts_with('(') {
                continue;
            }
            if current {
                list.current = Some(name.to_string());
            }
            list.names.push(name.to_string());
        }
        list
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

/// Scope of `git clean`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanScope {
    All,
    NonIgnored,
    IgnoredOnly,
}

/// Arguments of a fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchArgs {
    pub refspecs: Vec<String>,
    pub depth: Option<u32>,
    pub tags: bool,
}

impl FetchArgs {
    pub fn new(refspec: impl Into<String>) -> Self {
        Self {
            refspecs: vec![refspec.into()],
            ..Self::default()
        }
    }

    pub fn depth(mut self, depth: Option<u32>) -> Self {
        self.depth = depth;
        self
    }

    pub fn tags(mut self, tags: bool) -> Self {
        self.tags = tags;
        self
    }
}

/// Git CLI wrapper shared by every repository the engine touches.
#[derive(Clone)]
pub struct GitCli {
    runner: Arc<dyn CommandRunner>,
    git_path: String,
    cancel: CancelToken,
    network_timeout: Duration,
    local_timeout: Duration,
}

impl GitCli {
    /// Create a wrapper from settings.
    pub fn new(runner: Arc<dyn CommandRunner>, settings: &Settings, cancel: CancelToken) -> Self {
        Self {
            runner,
            git_path: settings.git_path.clone(),
            cancel,
            network_timeout: settings.network_timeout(),
            local_timeout: settings.local_timeout(),
        }
    }

    /// Bind to a repository directory.
    pub fn at(&self, dir: &Path) -> GitDir<'_> {
        GitDir {
            git: self,
            dir: dir.to_path_buf(),
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Fails with `Cancelled` once the build was interrupted.
    pub fn check_cancelled(&self) -> Result<(), GitError> {
        if self.cancel.is_cancelled() {
            Err(GitError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Version of the configured git executable.
    pub fn version(&self) -> Result<GitVersion, GitError> {
        let dir = std::env::temp_dir();
        let result = self.at(&dir).exec(&["--version"], self.local_timeout, None)?;
        GitVersion::parse(&result.stdout).ok_or_else(|| {
            GitError::InvalidInput(format!("unexpected git version output: {}", result.stdout.trim()))
        })
    }
}

/// A `GitCli` bound to one repository directory.
pub struct GitDir<'a> {
    git: &'a GitCli,
    dir: PathBuf,
}

impl GitDir<'_> {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.git.cancel
    }

    /// Create a hardened invocation.
    ///
    /// Applies:
    /// - `GIT_TERMINAL_PROMPT=0` - disable interactive prompts
    /// - `core.hooksPath=` - disable hooks execution
    fn invocation(&self, args: &[&str], timeout: Duration, stdin: Option<String>) -> Invocation {
        let mut full = vec!["-c".to_string(), "core.hooksPath=".to_string()];
        full.extend(args.iter().map(|a| a.to_string()));
        Invocation {
            program: self.git.git_path.clone(),
            args: full,
            cwd: self.dir.clone(),
            env: vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())],
            stdin,
            idle_timeout: timeout,
            cancel: self.git.cancel.clone(),
        }
    }

    /// Run and return the result whatever the exit code.
    fn exec(&self, args: &[&str], timeout: Duration, stdin: Option<String>) -> Result<ExecResult, GitError> {
        self.git.check_cancelled()?;
        let invocation = self.invocation(args, timeout, stdin);
        log::debug!("[{}] {}", self.dir.display(), invocation.command_line());
        self.git.runner.run(&invocation)
    }

    /// Run and fail on non-zero exit.
    fn exec_checked(&self, args: &[&str], timeout: Duration, stdin: Option<String>) -> Result<ExecResult, GitError> {
        let result = self.exec(args, timeout, stdin)?;
        if !result.success() {
            let invocation = self.invocation(args, timeout, None);
            return Err(GitError::Failed {
                command: invocation.command_line(),
                dir: self.dir.clone(),
                exit_code: result.exit_code,
                stdout: result.stdout,
                stderr: result.stderr,
            });
        }
        Ok(result)
    }

    fn local(&self, args: &[&str]) -> Result<ExecResult, GitError> {
        self.exec_checked(args, self.git.local_timeout, None)
    }

    fn local_tolerant(&self, args: &[&str]) -> Result<ExecResult, GitError> {
        self.exec(args, self.git.local_timeout, None)
    }

    fn network(&self, args: &[&str]) -> Result<ExecResult, GitError> {
        self.exec_checked(args, self.git.network_timeout, None)
    }

    pub fn init(&self, bare: bool) -> Result<(), GitError> {
        if bare {
            self.local(&["init", "--bare", "-q"])?;
        } else {
            self.local(&["init", "-q"])?;
        }
        Ok(())
    }

    pub fn config_set(&self, key: &str, value: &str) -> Result<(), GitError> {
        self.local(&["config", key, value])?;
        Ok(())
    }

    /// Value of a config key, `None` when unset.
    pub fn config_get(&self, key: &str) -> Result<Option<String>, GitError> {
        let result = self.local_tolerant(&["config", "--get", key])?;
        match result.exit_code {
            Some(0) => Ok(Some(result.stdout.trim().to_string())),
            Some(1) => Ok(None),
            _ => Err(GitError::Failed {
                command: format!("git config --get {key}"),
                dir: self.dir.clone(),
                exit_code: result.exit_code,
                stdout: result.stdout,
                stderr: result.stderr,
            }),
        }
    }

    /// Remove a key; a missing key is not an error.
    pub fn config_unset(&self, key: &str) -> Result<(), GitError> {
        self.local_tolerant(&["config", "--unset-all", key])?;
        Ok(())
    }

    /// Remove a section; a missing section is not an error.
    pub fn config_remove_section(&self, section: &str) -> Result<(), GitError> {
        self.local_tolerant(&["config", "--remove-section", section])?;
        Ok(())
    }

    /// Names of the config sections whose keys match `pattern`.
    pub fn config_sections(&self, pattern: &str) -> Result<Vec<String>, GitError> {
        let result = self.local_tolerant(&["config", "--name-only", "--get-regexp", pattern])?;
        let mut sections: Vec<String> = result
            .stdout
            .lines()
            .filter_map(|key| key.trim().rsplit_once('.').map(|(section, _)| section.to_string()))
            .collect();
        sections.dedup();
        Ok(sections)
    }

    /// `--progress` keeps stderr busy during long transfers so the idle timeout only
    /// fires on a stalled fetch.
    pub fn fetch(&self, args: &FetchArgs) -> Result<(), GitError> {
        let mut cmd = vec!["fetch", "--progress", "--recurse-submodules=no"];
        cmd.push(if args.tags { "--tags" } else { "--no-tags" });
        let depth = args.depth.map(|d| format!("--depth={d}"));
        if let Some(depth) = depth.as_deref() {
            cmd.push(depth);
        }
        cmd.push("origin");
        for refspec in &args.refspecs {
            cmd.push(refspec);
        }
        self.network(&cmd)?;
        Ok(())
    }

    /// `git show-ref`; a non-zero exit is returned, not raised.
    pub fn show_ref(&self) -> Result<ExecResult, GitError> {
        self.local_tolerant(&["show-ref"])
    }

    pub fn ls_remote(&self) -> Result<String, GitError> {
        Ok(self.network(&["ls-remote", "origin"])?.stdout)
    }

    /// True if `revision` resolves to a commit present in the object store.
    pub fn has_revision(&self, revision: &str) -> Result<bool, GitError> {
        validate_git_ref(revision, "revision")?;
        let result = self.local_tolerant(&["log", "-n1", "--pretty=format:%H%x20%s", revision, "--"])?;
        Ok(result.success() && !result.stdout.trim().is_empty())
    }

    /// Object id `rev` points at, `None` when it does not resolve.
    pub fn rev_parse(&self, rev: &str) -> Result<Option<String>, GitError> {
        validate_git_ref(rev, "revision")?;
        let result = self.local_tolerant(&["rev-parse", "--verify", "--quiet", rev])?;
        if result.success() {
            Ok(Some(result.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// Shallow-ness via `rev-parse`, falling back to the `shallow` marker file.
    pub fn is_shallow(&self) -> Result<bool, GitError> {
        let result = self.local_tolerant(&["rev-parse", "--is-shallow-repository"])?;
        match result.stdout.trim() {
            "true" if result.success() => Ok(true),
            "false" if result.success() => Ok(false),
            _ => Ok(self.dir.join(".git").join("shallow").exists() || self.dir.join("shallow").exists()),
        }
    }

    pub fn branches(&self) -> Result<BranchList, GitError> {
        Ok(BranchList::parse(&self.local(&["branch"])?.stdout))
    }

    pub fn reset_hard(&self, revision: &str) -> Result<(), GitError> {
        validate_git_ref(revision, "revision")?;
        self.local(&["reset", "--hard", revision])?;
        Ok(())
    }

    pub fn set_upstream(&self, branch: &str, upstream: &str) -> Result<(), GitError> {
        validate_git_ref(branch, "branch")?;
        validate_git_ref(upstream, "upstream")?;
        self.local(&["branch", "--set-upstream-to", upstream, branch])?;
        Ok(())
    }

    pub fn create_branch(&self, name: &str, start: &str, track: bool) -> Result<(), GitError> {
        validate_git_ref(name, "branch")?;
        validate_git_ref(start, "start point")?;
        if track {
            self.local(&["branch", "--track", name, start])?;
        } else {
            self.local(&["branch", name, start])?;
        }
        Ok(())
    }

    pub fn delete_branch(&self, name: &str) -> Result<(), GitError> {
        validate_git_ref(name, "branch")?;
        self.local(&["branch", "-D", name])?;
        Ok(())
    }

    pub fn update_ref(&self, name: &str, revision: &str) -> Result<(), GitError> {
        validate_git_ref(name, "ref")?;
        validate_git_ref(revision, "revision")?;
        self.local(&["update-ref", name, revision])?;
        Ok(())
    }

    pub fn delete_ref(&self, name: &str) -> Result<(), GitError> {
        validate_git_ref(name, "ref")?;
        self.local(&["update-ref", "-d", name])?;
        Ok(())
    }

    /// Feed `update-ref --stdin` with the given instruction lines.
    pub fn update_ref_stdin(&self, lines: &[String]) -> Result<(), GitError> {
        let mut input = lines.join("\n");
        input.push('\n');
        self.exec_checked(&["update-ref", "--stdin"], self.git.local_timeout, Some(input))?;
        Ok(())
    }

    pub fn checkout_force(&self, target: &str) -> Result<(), GitError> {
        validate_git_ref(target, "checkout target")?;
        self.local(&["checkout", "-q", "-f", target])?;
        Ok(())
    }

    /// Refresh stat info of the index; exits non-zero when files need updating, which is fine.
    pub fn refresh_index(&self) -> Result<(), GitError> {
        self.local_tolerant(&["update-index", "--really-refresh", "-q"])?;
        Ok(())
    }

    pub fn clean(&self, scope: CleanScope, excludes: &[String]) -> Result<(), GitError> {
        let mut args: Vec<String> = vec!["clean".into(), "-f".into(), "-d".into()];
        match scope {
            CleanScope::All => args.push("-x".into()),
            CleanScope::IgnoredOnly => args.push("-X".into()),
            CleanScope::NonIgnored => {}
        }
        args.extend(excludes.iter().map(|path| format!("--exclude=/{path}")));
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.local(&args)?;
        Ok(())
    }

    pub fn submodule_init(&self) -> Result<(), GitError> {
        self.local(&["submodule", "init"])?;
        Ok(())
    }

    pub fn submodule_sync(&self) -> Result<(), GitError> {
        self.local(&["submodule", "sync"])?;
        Ok(())
    }

    /// `git submodule update`; local `file://` mirrors must be allowed explicitly.
    pub fn submodule_update(&self, depth: Option<u32>, force: bool) -> Result<(), GitError> {
        let mut args = vec!["-c", "protocol.file.allow=always", "submodule", "update"];
        if force {
            args.push("--force");
        }
        if self.git.version().is_ok_and(|v| v >= GitVersion::SUBMODULE_PROGRESS) {
            args.push("--progress");
        }
        let depth = depth.map(|d| format!("--depth={d}"));
        if let Some(depth) = depth.as_deref() {
            args.push(depth);
        }
        self.network(&args)?;
        Ok(())
    }

    /// Object id recorded for `path` in the tree of `revision`.
    pub fn ls_tree_sha(&self, revision: &str, path: &str) -> Result<Option<String>, GitError> {
        validate_git_ref(revision, "revision")?;
        let result = self.local(&["ls-tree", revision, "--", path])?;
        Ok(result.stdout.lines().find_map(|line| {
            let (meta, _) = line.split_once('\t')?;
            meta.split_whitespace().nth(2).map(str::to_string)
        }))
    }

    pub fn pack_refs(&self) -> Result<(), GitError> {
        self.local(&["pack-refs", "--all"])?;
        Ok(())
    }

    pub fn gc(&self) -> Result<(), GitError> {
        self.exec_checked(&["gc", "--quiet"], self.git.network_timeout, None)?;
        Ok(())
    }

    /// Paths changed between `from` and `to`.
    pub fn diff_names(&self, from: &str, to: &str) -> Result<Vec<String>, GitError> {
        validate_git_ref(from, "revision")?;
        validate_git_ref(to, "revision")?;
        let result = self.local(&["diff", "--name-only", from, to, "--"])?;
        Ok(result
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testing::{Reply, ScriptedRunner};

    fn cli(runner: Arc<ScriptedRunner>) -> GitCli {
        GitCli::new(runner, &Settings::default(), CancelToken::new())
    }

    #[test]
    fn validate_git_ref_rejects_empty() {
        let result = validate_git_ref("", "branch");
        assert!(matches!(result, Err(GitError::InvalidInput(_))));
    }

    #[test]
    fn validate_git_ref_rejects_path_traversal() {
        let result = validate_git_ref("foo/../bar", "branch");
        assert!(matches!(result, Err(GitError::InvalidInput(_))));
    }

    #[test]
    fn validate_git_ref_rejects_leading_dash() {
        let result = validate_git_ref("-malicious", "branch");
        assert!(matches!(result, Err(GitError::InvalidInput(_))));
    }

    #[test]
    fn validate_git_ref_accepts_valid_refs() {
        assert!(validate_git_ref("main", "branch").is_ok());
        assert!(validate_git_ref("refs/heads/feature/my-branch", "branch").is_ok());
        assert!(validate_git_ref("abc123def456", "commit").is_ok());
        assert!(validate_git_ref("+refs/heads/*:refs/heads/*", "refspec").is_ok());
    }

    #[test]
    fn version_parsing() {
        assert_eq!(GitVersion::parse("git version 2.39.2\n"), Some(GitVersion(2, 39, 2)));
        assert_eq!(
            GitVersion::parse("git version 2.37.1 (Apple Git-137.1)"),
            Some(GitVersion(2, 37, 1))
        );
        assert_eq!(
            GitVersion::parse("git version 2.41.0.windows.1"),
            Some(GitVersion(2, 41, 0))
        );
        assert_eq!(GitVersion::parse("hg 6.0"), None);
        assert!(GitVersion(1, 7, 3) < GitVersion::SPARSE_CHECKOUT);
    }

    #[test]
    fn branch_list_parses_current_marker() {
        let list = BranchList::parse("  feature\n* main\n  release/1.0\n");
        assert_eq!(list.current.as_deref(), Some("main"));
        assert!(list.contains("release/1.0"));
        assert_eq!(list.names.len(), 3);

        let detached = BranchList::parse("* (HEAD detached at 1a2b3c4)\n  main\n");
        assert_eq!(detached.current, None);
        assert_eq!(detached.names, vec!["main".to_string()]);
    }

    #[test]
    fn fetch_builds_hardened_command() {
        let runner = Arc::new(ScriptedRunner::new());
        let git = cli(runner.clone());
        git.at(Path::new("/repo"))
            .fetch(&FetchArgs::new("+refs/heads/main:refs/remotes/origin/main").depth(Some(1)))
            .expect("fetch should succeed");

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        let call = &calls[0];
        assert_eq!(call.args[0..2], ["-c".to_string(), "core.hooksPath=".to_string()]);
        assert_eq!(
            call.subcommand_args(),
            &[
                "fetch",
                "--progress",
                "--recurse-submodules=no",
                "--no-tags",
                "--depth=1",
                "origin",
                "+refs/heads/main:refs/remotes/origin/main"
            ]
            .map(String::from)
        );
        assert!(call.env.contains(&("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())));
        assert_eq!(call.cwd, PathBuf::from("/repo"));
    }

    #[test]
    fn failure_carries_stderr() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(&["fetch"], Reply::fail("fatal: couldn't find remote ref refs/heads/gone"));
        let git = cli(runner);
        let err = git
            .at(Path::new("/repo"))
            .fetch(&FetchArgs::new("+refs/heads/gone:refs/remotes/origin/gone"))
            .unwrap_err();
        assert!(err.to_string().contains("couldn't find remote ref"));
        assert!(err.stderr().contains("refs/heads/gone"));
    }

    #[test]
    fn config_get_distinguishes_missing_key() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(&["config", "remote.origin.url"], Reply::ok("https://example.com/r.git\n"));
        runner.on(&["config", "remote.origin.pushurl"], Reply::exit(1, ""));
        let git = cli(runner);
        let dir = git.at(Path::new("/repo"));
        assert_eq!(
            dir.config_get("remote.origin.url").unwrap().as_deref(),
            Some("https://example.com/r.git")
        );
        assert_eq!(dir.config_get("remote.origin.pushurl").unwrap(), None);
    }

    #[test]
    fn config_sections_strip_key_names() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            &["config", "--get-regexp"],
            Reply::ok("url./m/a.git.insteadof\nurl./m/a.git.pushinsteadof\nurl.x.insteadof\n"),
        );
        let git = cli(runner);
        let sections = git.at(Path::new("/repo")).config_sections("^url\\.").unwrap();
        assert_eq!(sections, vec!["url./m/a.git".to_string(), "url.x".to_string()]);
    }

    #[test]
    fn ls_tree_reads_gitlink_sha() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            &["ls-tree"],
            Reply::ok("160000 commit 0123456789abcdef0123456789abcdef01234567\tlibs/core\n"),
        );
        let git = cli(runner);
        let sha = git.at(Path::new("/repo")).ls_tree_sha("HEAD", "libs/core").unwrap();
        assert_eq!(sha.as_deref(), Some("0123456789abcdef0123456789abcdef01234567"));
    }

    #[test]
    fn cancelled_cli_runs_nothing() {
        let runner = Arc::new(ScriptedRunner::new());
        let git = cli(runner.clone());
        git.cancel_token().cancel();
        let result = git.at(Path::new("/repo")).pack_refs();
        assert!(matches!(result, Err(GitError::Cancelled)));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn clean_adds_scope_and_excludes() {
        let runner = Arc::new(ScriptedRunner::new());
        let git = cli(runner.clone());
        git.at(Path::new("/repo"))
            .clean(CleanScope::IgnoredOnly, &["other".to_string()])
            .unwrap();
        assert_eq!(
            runner.calls()[0].subcommand_args(),
            &["clean", "-f", "-d", "-X", "--exclude=/other"].map(String::from)
        );
    }

    #[test]
    fn submodule_update_reports_progress_on_recent_git() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on_seq(
            &["--version"],
            vec![Reply::ok("git version 2.39.2\n"), Reply::ok("git version 2.7.4\n")],
        );
        let git = cli(runner.clone());
        let repo = git.at(Path::new("/repo"));
        repo.submodule_update(Some(1), true).unwrap();
        repo.submodule_update(None, false).unwrap();

        let updates = runner.calls_matching(&["submodule", "update"]);
        assert_eq!(
            updates[0].subcommand_args(),
            &["submodule", "update", "--force", "--progress", "--depth=1"].map(String::from)
        );
        assert_eq!(updates[1].subcommand_args(), &["submodule", "update"].map(String::from));
    }
}
