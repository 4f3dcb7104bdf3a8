use std::fs;

use super::Updater;
use crate::error::SyncError;
use crate::git::GitVersion;
use crate::types::CheckoutRules;

/// Content of `.git/info/sparse-checkout` for `rules`.
pub fn sparse_checkout_lines(rules: &CheckoutRules) -> Vec<String> {
    let mut lines = Vec::new();
    let mut whole = rules.includes.is_empty();
    for rule in &rules.includes {
        if rule.from.is_empty() {
            whole = true;
        } else {
            lines.push(format!("/{}", rule.from));
        }
    }
    if whole {
        lines.insert(0, "/*".to_string());
    }
    lines.extend(rules.excludes.iter().map(|ex| format!("!/{ex}")));
    lines
}

impl Updater<'_> {
    fn sparse_checkout_active(&self) -> bool {
        self.settings().use_sparse_checkout && !self.spec.rules.is_trivial()
    }

    /// Reject rule sets sparse checkout cannot express before touching the directory.
    pub(super) fn check_sparse_checkout(&self) -> Result<(), SyncError> {
        if !self.sparse_checkout_active() {
            return Ok(());
        }
        let version = self.git().version()?;
        if version < GitVersion::SPARSE_CHECKOUT {
            return Err(SyncError::PolicyViolation(format!(
                "Sparse checkout requires git {} or newer, found {}",
                GitVersion::SPARSE_CHECKOUT,
                version
            )));
        }
        if !self.spec.rules.is_identity() {
            return Err(SyncError::PolicyViolation(format!(
                "Checkout rules moving paths are not supported with sparse checkout: '{}'",
                self.spec.rules.as_text()
            )));
        }
        Ok(())
    }

    pub(super) fn configure_sparse(&self) -> Result<(), SyncError> {
        let repo = self.repo();
        if !self.sparse_checkout_active() {
            repo.config_set("core.sparseCheckout", "false")?;
            return Ok(());
        }
        repo.config_set("core.sparseCheckout", "true")?;
        let info = self.target_dir.join(".git").join("info");
        let file = info.join("sparse-checkout");
        let mut content = sparse_checkout_lines(&self.spec.rules).join("\n");
        content.push('\n');
        if let Err(e) = fs::create_dir_all(&info).and_then(|()| fs::write(&file, content)) {
            log::warn!("Error while writing {}, sparse checkout is disabled: {}", file.display(), e);
            repo.config_set("core.sparseCheckout", "false")?;
        }
        Ok(())
    }
}
