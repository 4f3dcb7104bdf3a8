//! Compaction of mirrors while the agent is idle.
//!
//! The scheduler thread wakes up every check interval and runs one pass when no
//! build ran for the cool-down period. A build start cancels the git token, which
//! interrupts the running `git gc` and ends the pass before the next mirror.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;

use crate::config::IdleGcSettings;
use crate::git::{GitCli, GitError, repository_exists};

/// Granularity of the shutdown check while the scheduler waits.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Counters of one compaction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub mirrors: u64,
    pub compacted: u64,
    /// Compacted recently enough to be left alone.
    pub skipped: u64,
    pub failed: u64,
    /// A build started and the rest of the pass was abandoned.
    pub interrupted: bool,
}

#[derive(Debug)]
struct GcState {
    building: bool,
    last_build_finished: Instant,
    last_gc: HashMap<PathBuf, Instant>,
}

/// Idle compaction of every mirror under one directory.
pub struct IdleGc {
    /// Bound to a token of its own; a build start cancels it.
    git: GitCli,
    mirrors_dir: PathBuf,
    settings: IdleGcSettings,
    state: Mutex<GcState>,
}

fn mirror_dirs(base: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(base) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir() && repository_exists(path))
        .collect()
}

impl IdleGc {
    pub fn new(git: GitCli, mirrors_dir: PathBuf, settings: IdleGcSettings) -> Self {
        Self {
            git,
            mirrors_dir,
            settings,
            state: Mutex::new(GcState {
                building: false,
                last_build_finished: Instant::now(),
                last_gc: HashMap::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, GcState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Interrupt compaction; nothing runs until `build_finished`.
    pub fn build_started(&self) {
        self.state().building = true;
        self.git.cancel_token().cancel();
    }

    pub fn build_finished(&self) {
        let mut state = self.state();
        state.building = false;
        state.last_build_finished = Instant::now();
        self.git.cancel_token().reset();
    }

    /// True when enabled, no build runs and the cool-down has passed.
    pub fn should_run(&self, now: Instant) -> bool {
        let state = self.state();
        self.settings.enabled
            && !state.building
            && now.saturating_duration_since(state.last_build_finished) >= self.settings.cool_down()
    }

    /// Compact every mirror in random order, skipping recently compacted ones.
    pub fn run_once(&self) -> GcStats {
        let mut dirs = mirror_dirs(&self.mirrors_dir);
        dirs.shuffle(&mut rand::thread_rng());
        let mut stats = GcStats {
            mirrors: dirs.len() as u64,
            ..GcStats::default()
        };
        for dir in dirs {
            if self.git.cancel_token().is_cancelled() {
                log::info!("Build started, abandoning mirror compaction");
                stats.interrupted = true;
                break;
            }
            let recent = self
                .state()
                .last_gc
                .get(&dir)
                .is_some_and(|at| at.elapsed() < self.settings.rate());
            if recent {
                stats.skipped += 1;
                continue;
            }
            log::debug!("Compacting mirror {}", dir.display());
            match self.git.at(&dir).gc() {
                Ok(()) => {
                    self.state().last_gc.insert(dir, Instant::now());
                    stats.compacted += 1;
                }
                Err(GitError::Cancelled) => {
                    log::info!("Compaction of {} interrupted by a build", dir.display());
                    stats.interrupted = true;
                    break;
                }
                Err(e) => {
                    log::warn!("Failed to compact mirror {}: {}", dir.display(), e);
                    stats.failed += 1;
                }
            }
        }
        stats
    }
}

/// Handle for the idle compaction thread.
pub struct IdleGcHandle {
    thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    gc: Arc<IdleGc>,
}

impl IdleGcHandle {
    /// Spawn the scheduler thread.
    pub fn spawn(gc: Arc<IdleGc>) -> io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let worker = gc.clone();
        let thread = thread::Builder::new()
            .name("gitsync-idle-gc".to_string())
            .spawn(move || run(&worker, &flag))?;
        Ok(Self {
            thread: Some(thread),
            shutdown,
            gc,
        })
    }

    /// Signal shutdown, interrupt a running compaction and wait for the thread to exit.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.gc.git.cancel_token().cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for IdleGcHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(gc: &IdleGc, shutdown: &AtomicBool) {
    log::info!("Idle gc thread started");
    loop {
        let wake_at = Instant::now() + gc.settings.check_interval();
        while Instant::now() < wake_at {
            if shutdown.load(Ordering::SeqCst) {
                log::info!("Idle gc shutting down");
                return;
            }
            thread::sleep(SLEEP_SLICE);
        }
        if gc.should_run(Instant::now()) {
            let stats = gc.run_once();
            log::info!(
                "Idle gc: {} compacted, {} skipped, {} failed of {} mirrors",
                stats.compacted,
                stats.skipped,
                stats.failed,
                stats.mirrors
            );
        }
    }
}
