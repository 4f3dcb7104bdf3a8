mod classify;
mod config;
mod error;
mod git;
mod loader;
mod maintenance;
mod mirror;
mod paths;
mod refs;
mod repair;
mod retry;
mod types;
mod updater;

use std::collections::BTreeSet;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use clap::{Args, Parser, Subcommand, ValueEnum};
use crossbeam_channel::{Receiver, bounded, select, unbounded};
use serde::{Deserialize, Serialize};

use crate::config::{CleanMode, CleanPolicy, MirrorStrategy, Settings, SubmodulePolicy};
use crate::git::{CancelToken, CommandRunner, GitCli, ProcessRunner};
use crate::maintenance::{IdleGc, IdleGcHandle, MirrorCleaner};
use crate::mirror::{MirrorManager, last_used};
use crate::paths::CachePaths;
use crate::types::{AuthMethod, CheckoutRules, RepositorySpec, SiblingRoot};
use crate::updater::{Engine, UpdateReport};

#[derive(Parser)]
#[command(
    name = "gitsync",
    about = "Synchronize build checkout directories with git remotes through local mirrors"
)]
struct Cli {
    /// Settings file (defaults to gitsync.json in the cache directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring a checkout directory to a revision
    Update {
        #[command(flatten)]
        root: RootArgs,

        /// Override the mirror strategy from the settings
        #[arg(long, value_enum)]
        mirror: Option<MirrorStrategy>,

        /// Clone the checkout directory shallow
        #[arg(long)]
        shallow: bool,
    },

    /// Serve builds read as JSON lines from stdin, compacting mirrors while idle
    Agent,

    /// Run one compaction pass over all mirrors
    Gc,

    /// List mirrors and their last use
    Mirrors,

    /// Remove invalid, unmapped and unused mirrors
    Cleanup {
        /// Urls whose mirrors must survive regardless of age
        #[arg(long)]
        keep: Vec<String>,
    },

    /// Never reuse a mirror directory again
    Invalidate {
        dir: PathBuf,
    },
}

/// Authentication the remote expects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
enum AuthKind {
    #[default]
    Anonymous,
    Password,
    Token,
    Ssh,
    KeyFile,
}

/// Another root of the same build.
#[derive(Debug, Clone, Deserialize)]
struct SiblingArgs {
    name: String,
    rules: Vec<String>,
}

/// One VCS root, from the command line or an agent request.
#[derive(Debug, Clone, Args, Deserialize)]
struct RootArgs {
    /// Remote url
    url: String,

    /// Full sha to check out
    revision: String,

    /// Branch or tag the revision belongs to
    #[arg(long)]
    branch: String,

    /// Checkout directory
    #[arg(long)]
    dir: PathBuf,

    #[arg(long)]
    #[serde(default)]
    push_url: Option<String>,

    #[arg(long, value_enum, default_value_t = AuthKind::Anonymous)]
    #[serde(default)]
    auth: AuthKind,

    #[arg(long)]
    #[serde(default)]
    username: Option<String>,

    /// Checkout rule such as `+:src=>src` or `-:docs`; repeatable
    #[arg(long = "rule")]
    #[serde(default)]
    rules: Vec<String>,

    #[arg(long, value_enum, default_value_t = CleanPolicy::Never)]
    #[serde(default)]
    clean: CleanPolicy,

    #[arg(long, value_enum, default_value_t = CleanMode::AllUntracked)]
    #[serde(default)]
    clean_mode: CleanMode,

    #[arg(long, value_enum, default_value_t = SubmodulePolicy::Checkout)]
    #[serde(default)]
    submodules: SubmodulePolicy,

    /// Path of this root inside the build checkout directory
    #[arg(long, default_value = "")]
    #[serde(default)]
    target_path: String,

    /// Latest revision the build may see; changes up to it are reported
    #[arg(long)]
    #[serde(default)]
    upper_limit: Option<String>,

    #[arg(skip)]
    #[serde(default)]
    siblings: Vec<SiblingArgs>,
}

fn parse_rules(lines: &[String]) -> Result<CheckoutRules, Box<dyn std::error::Error>> {
    if lines.is_empty() {
        return Ok(CheckoutRules::whole_repository());
    }
    Ok(lines.join("\n").parse()?)
}

impl RootArgs {
    fn to_spec(&self) -> Result<RepositorySpec, Box<dyn std::error::Error>> {
        let branch = self
            .branch
            .parse()
            .map_err(|e| format!("Invalid branch {:?}: {}", self.branch, e))?;
        let username = self.username.clone();
        let mut spec = RepositorySpec::new(&self.url, branch, &self.revision);
        spec.push_url = self.push_url.clone();
        spec.auth = match self.auth {
            AuthKind::Anonymous => AuthMethod::Anonymous,
            AuthKind::Password => AuthMethod::Password { username },
            AuthKind::Token => AuthMethod::AccessToken { username },
            AuthKind::Ssh => AuthMethod::SshKey { username },
            AuthKind::KeyFile => AuthMethod::PrivateKeyFile { username },
        };
        spec.rules = parse_rules(&self.rules)?;
        spec.submodules = self.submodules;
        spec.clean_policy = self.clean;
        spec.clean_mode = self.clean_mode;
        spec.target_path = self.target_path.clone();
        spec.upper_limit_revision = self.upper_limit.clone();
        for sibling in &self.siblings {
            spec.siblings.push(SiblingRoot {
                name: sibling.name.clone(),
                rules: parse_rules(&sibling.rules)?,
            });
        }
        Ok(spec)
    }
}

/// Outcome of one agent request, written back as a JSON line.
#[derive(Debug, Serialize)]
struct BuildResult {
    dir: PathBuf,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    severity: Option<String>,
    problems: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mirror: Option<PathBuf>,
    reinitialized: bool,
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let paths = CachePaths::default();

    let result = load_settings(cli.config.as_deref(), &paths).and_then(|settings| match cli.command {
        Commands::Update { root, mirror, shallow } => cmd_update(&paths, settings, &root, mirror, shallow),
        Commands::Agent => cmd_agent(&paths, settings),
        Commands::Gc => cmd_gc(&paths, settings),
        Commands::Mirrors => cmd_mirrors(&paths),
        Commands::Cleanup { keep } => cmd_cleanup(&paths, &settings, keep),
        Commands::Invalidate { dir } => cmd_invalidate(&paths, &dir),
    });

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_settings(config: Option<&Path>, paths: &CachePaths) -> Result<Settings, Box<dyn std::error::Error>> {
    let file = config.map(Path::to_path_buf).unwrap_or_else(|| paths.settings_file());
    Ok(Settings::load(&file)?)
}

/// Cancel running git commands on ctrl-c; the receiver fires once per interrupt.
fn install_interrupt_handler(cancel: CancelToken) -> Result<Receiver<()>, ctrlc::Error> {
    let (tx, rx) = bounded(1);
    ctrlc::set_handler(move || {
        log::warn!("Interrupted, cancelling running git commands");
        cancel.cancel();
        let _ = tx.try_send(());
    })?;
    Ok(rx)
}

fn runner() -> Arc<dyn CommandRunner> {
    Arc::new(ProcessRunner)
}

fn engine(paths: &CachePaths, settings: Settings, cancel: CancelToken) -> Engine {
    let git = GitCli::new(runner(), &settings, cancel);
    Engine::new(git, settings, MirrorManager::new(paths.clone()))
}

fn print_report(report: &UpdateReport) {
    if let Some(mirror) = &report.mirror_dir {
        println!("  Mirror:        {}", mirror.display());
    }
    if report.reinitialized {
        println!("  Reinitialized: yes");
    }
    for problem in &report.problems {
        println!("  Problem:       {} ({})", problem.description, problem.kind);
        if !problem.details.is_empty() {
            println!("{}", problem.details);
        }
    }
}

fn cmd_update(
    paths: &CachePaths,
    mut settings: Settings,
    root: &RootArgs,
    mirror: Option<MirrorStrategy>,
    shallow: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(mirror) = mirror {
        settings.mirror_strategy = mirror;
    }
    settings.shallow |= shallow;
    let spec = root.to_spec()?;

    let cancel = CancelToken::new();
    install_interrupt_handler(cancel.clone())?;
    let engine = engine(paths, settings, cancel);

    let report = engine.update(&spec, &root.dir)?;
    println!("Updated {} to {}", root.dir.display(), spec.revision);
    print_report(&report);
    Ok(())
}

fn serve(engine: &Engine, gc: &IdleGc, line: &str) -> BuildResult {
    let request: RootArgs = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            return BuildResult {
                dir: PathBuf::new(),
                ok: false,
                error: Some(format!("invalid request: {}", e)),
                severity: None,
                problems: Vec::new(),
                mirror: None,
                reinitialized: false,
            };
        }
    };
    let mut result = BuildResult {
        dir: request.dir.clone(),
        ok: false,
        error: None,
        severity: None,
        problems: Vec::new(),
        mirror: None,
        reinitialized: false,
    };
    let spec = match request.to_spec() {
        Ok(spec) => spec,
        Err(e) => {
            result.error = Some(e.to_string());
            return result;
        }
    };

    gc.build_started();
    let outcome = engine.update(&spec, &request.dir);
    gc.build_finished();

    match outcome {
        Ok(report) => {
            result.ok = true;
            result.problems = report
                .problems
                .iter()
                .map(|p| format!("{}: {}", p.kind, p.description))
                .collect();
            result.mirror = report.mirror_dir;
            result.reinitialized = report.reinitialized;
        }
        Err(e) => {
            log::error!("Update of {} failed: {}", request.dir.display(), e);
            result.severity = Some(format!("{:?}", e.severity()));
            result.error = Some(e.to_string());
        }
    }
    result
}

fn cmd_agent(paths: &CachePaths, settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = CancelToken::new();
    let interrupted = install_interrupt_handler(cancel.clone())?;

    let gc_git = GitCli::new(runner(), &settings, CancelToken::new());
    let gc = Arc::new(IdleGc::new(gc_git, paths.mirrors_dir(), settings.idle_gc.clone()));
    let mut handle = IdleGcHandle::spawn(gc.clone())?;
    let engine = engine(paths, settings, cancel.clone());

    let (lines_tx, lines_rx) = unbounded();
    thread::Builder::new().name("gitsync-stdin".to_string()).spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => {
                    if lines_tx.send(line).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    log::error!("Failed to read request: {}", e);
                    return;
                }
            }
        }
    })?;

    log::info!("Agent ready, reading requests from stdin");
    let mut stdout = io::stdout();
    loop {
        select! {
            recv(interrupted) -> _ => {
                log::info!("Agent interrupted");
                break;
            }
            recv(lines_rx) -> line => {
                let Ok(line) = line else {
                    log::info!("No more requests");
                    break;
                };
                let result = serve(&engine, &gc, &line);
                serde_json::to_writer(&mut stdout, &result)?;
                writeln!(stdout)?;
                stdout.flush()?;
                if !interrupted.is_empty() {
                    log::info!("Agent interrupted");
                    break;
                }
            }
        }
    }

    handle.shutdown();
    Ok(())
}

fn cmd_gc(paths: &CachePaths, settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = CancelToken::new();
    install_interrupt_handler(cancel.clone())?;
    let git = GitCli::new(runner(), &settings, cancel);
    let gc = IdleGc::new(git, paths.mirrors_dir(), settings.idle_gc);

    let stats = gc.run_once();
    println!("Compacted {} of {} mirrors", stats.compacted, stats.mirrors);
    if stats.failed > 0 {
        println!("  Failed:      {}", stats.failed);
    }
    if stats.interrupted {
        return Err("compaction interrupted".into());
    }
    Ok(())
}

fn cmd_mirrors(paths: &CachePaths) -> Result<(), Box<dyn std::error::Error>> {
    let mirrors = MirrorManager::new(paths.clone());
    let mappings = mirrors.mappings();
    if mappings.is_empty() {
        println!("No mirrors");
        return Ok(());
    }

    println!("{:<20} {:>12} URL", "MIRROR", "LAST USED");
    println!("{}", "-".repeat(80));
    for (url, dir) in mappings {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let used = last_used(&dir)
            .and_then(|at| at.elapsed().ok())
            .map(|age| format_duration(age.as_secs()))
            .unwrap_or_else(|| "never".to_string());
        println!("{:<20} {:>12} {}", name, used, url);
    }
    Ok(())
}

fn cmd_cleanup(paths: &CachePaths, settings: &Settings, keep: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let mirrors = MirrorManager::new(paths.clone());
    let keep: BTreeSet<String> = keep.into_iter().collect();
    let stats = MirrorCleaner::new(&mirrors, settings.unused_mirror_max_age()).cleanup(&keep);

    println!("Mirror cleanup");
    println!("  Unused removed:    {}", stats.removed_unused);
    println!("  Invalid removed:   {}", stats.removed_invalid);
    println!("  Unmapped removed:  {}", stats.removed_unmapped);
    println!("  Mappings dropped:  {}", stats.dropped_mappings);
    println!("  Kept:              {}", stats.kept);
    Ok(())
}

fn cmd_invalidate(paths: &CachePaths, dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let mirrors = MirrorManager::new(paths.clone());
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| format!("Not a mirror directory: {}", dir.display()))?;
    let url = mirrors.url_for(name);
    mirrors.invalidate(dir);
    match url {
        Some(url) => println!("Invalidated {} (was {})", name, url),
        None => println!("Invalidated {}", name),
    }
    Ok(())
}

fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s ago", secs)
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else if secs < 86400 {
        format!("{}h ago", secs / 3600)
    } else {
        format!("{}d ago", secs / 86400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_request_uses_defaults() {
        let line = r#"{"url":"https://example.com/r.git","revision":"abc","branch":"main","dir":"/w"}"#;
        let request: RootArgs = serde_json::from_str(line).unwrap();
        let spec = request.to_spec().unwrap();
        assert_eq!(spec.branch.as_str(), "refs/heads/main");
        assert_eq!(spec.auth, AuthMethod::Anonymous);
        assert_eq!(spec.submodules, SubmodulePolicy::Checkout);
        assert_eq!(spec.clean_policy, CleanPolicy::Never);
        assert_eq!(spec.rules, CheckoutRules::whole_repository());
    }

    #[test]
    fn agent_request_with_rules_and_siblings() {
        let line = r#"{
            "url": "https://example.com/r.git", "revision": "abc", "branch": "refs/tags/v1", "dir": "/w",
            "auth": "token", "username": "ci", "clean": "always", "submodules": "ignore",
            "rules": ["+:src", "-:src/gen"],
            "siblings": [{"name": "tools", "rules": ["+:.=>tools"]}]
        }"#;
        let request: RootArgs = serde_json::from_str(line).unwrap();
        let spec = request.to_spec().unwrap();
        assert!(spec.branch.is_tag());
        assert_eq!(spec.auth.username(), Some("ci"));
        assert_eq!(spec.clean_policy, CleanPolicy::Always);
        assert_eq!(spec.rules.excludes, vec!["src/gen"]);
        assert_eq!(spec.siblings[0].rules.includes[0].to, "tools");
    }

    #[test]
    fn bad_rule_is_rejected() {
        let rules = vec!["-:a=>b".to_string()];
        assert!(parse_rules(&rules).is_err());
    }

    #[test]
    fn cli_parses_update() {
        let cli = Cli::try_parse_from([
            "gitsync",
            "update",
            "https://example.com/r.git",
            "abc",
            "--branch",
            "main",
            "--dir",
            "/w",
            "--clean",
            "on-branch-change",
            "--mirror",
            "alternates",
        ])
        .unwrap();
        let Commands::Update { root, mirror, shallow } = cli.command else {
            panic!("expected update");
        };
        assert_eq!(root.clean, CleanPolicy::OnBranchChange);
        assert_eq!(mirror, Some(MirrorStrategy::Alternates));
        assert!(!shallow);
    }
}
