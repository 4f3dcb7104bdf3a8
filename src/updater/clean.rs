use std::path::Path;

use super::Updater;
use crate::config::{CleanMode, CleanPolicy};
use crate::error::SyncError;
use crate::git::{CleanScope, read_submodule_sections};
use crate::repair::run_and_fix_index_errors;
use crate::types::CheckoutRules;

fn relative_to(path: &str, base: &str) -> Option<String> {
    if base.is_empty() {
        return Some(path.to_string());
    }
    if path == base {
        return Some(String::new());
    }
    path.strip_prefix(base)
        .and_then(|rest| rest.strip_prefix('/'))
        .map(str::to_string)
}

fn is_under(path: &str, parent: &str) -> bool {
    path == parent || path.strip_prefix(parent).is_some_and(|rest| rest.starts_with('/'))
}

/// Paths inside `target_path` another root checks files into, relative to `target_path`.
///
/// A root sharing the whole directory yields nothing; nested paths collapse into their parent.
pub fn paths_to_exclude(other: &CheckoutRules, target_path: &str) -> Vec<String> {
    let target = target_path.trim_matches('/');
    let mut paths: Vec<String> = other
        .includes
        .iter()
        .filter_map(|rule| relative_to(&rule.to, target))
        .filter(|path| !path.is_empty())
        .collect();
    paths.sort();
    paths.dedup();
    let mut collapsed: Vec<String> = Vec::new();
    for path in paths {
        if !collapsed.iter().any(|parent| is_under(&path, parent)) {
            collapsed.push(path);
        }
    }
    collapsed
}

fn scope_for(mode: CleanMode) -> CleanScope {
    match mode {
        CleanMode::AllUntracked => CleanScope::All,
        CleanMode::NonIgnoredOnly => CleanScope::NonIgnored,
        CleanMode::IgnoredOnly => CleanScope::IgnoredOnly,
    }
}

impl Updater<'_> {
    pub(super) fn clean(&self, branch_changed: bool) -> Result<(), SyncError> {
        match self.spec.clean_policy {
            CleanPolicy::Never => return Ok(()),
            CleanPolicy::OnBranchChange if !branch_changed => return Ok(()),
            _ => {}
        }
        let mut excludes = Vec::new();
        if self.settings().clean_respects_other_roots {
            for sibling in &self.spec.siblings {
                let paths = paths_to_exclude(&sibling.rules, &self.spec.target_path);
                if !paths.is_empty() {
                    log::debug!("Not cleaning paths of root {}: {:?}", sibling.name, paths);
                }
                excludes.extend(paths);
            }
        }
        let scope = scope_for(self.spec.clean_mode);
        log::info!("Cleaning {}", self.target_dir.display());
        let repo = self.repo();
        run_and_fix_index_errors(&repo, || Ok(repo.clean(scope, &excludes)?))?;
        if self.spec.submodules.is_enabled() {
            self.clean_submodules(&self.target_dir, scope);
        }
        Ok(())
    }

    fn clean_submodules(&self, dir: &Path, scope: CleanScope) {
        let gitmodules = dir.join(".gitmodules");
        if !gitmodules.is_file() {
            return;
        }
        let entries = match read_submodule_sections(&gitmodules) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Failed to read {}: {}", gitmodules.display(), e);
                return;
            }
        };
        for path in entries.iter().filter_map(|entry| entry.path.as_deref()) {
            let sub = dir.join(path);
            if !sub.join(".git").exists() {
                continue;
            }
            if let Err(e) = self.git().at(&sub).clean(scope, &[]) {
                log::error!("Failed to clean submodule {}: {}", sub.display(), e);
                continue;
            }
            if self.spec.submodules.is_recursive() {
                self.clean_submodules(&sub, scope);
            }
        }
    }
}
