//! Read-only repository inspection through libgit2.
//!
//! Write operations always go through the CLI; libgit2 is only used where a
//! cheap, process-free look at on-disk state is enough: validity checks and
//! reading config-format files (`config`, `.gitmodules`).

use std::collections::BTreeMap;
use std::path::Path;

use git2::{Config, Repository};

use super::command::GitError;

impl From<git2::Error> for GitError {
    fn from(e: git2::Error) -> Self {
        GitError::InvalidInput(format!("libgit2: {}", e.message()))
    }
}

/// Check if a path contains a repository libgit2 can open (corrupted config fails).
pub fn repository_exists(path: &Path) -> bool {
    Repository::open(path).is_ok()
}

/// Read a string key from a config-format file, `None` when missing or unreadable.
pub fn read_config_string(file: &Path, key: &str) -> Option<String> {
    let config = Config::open(file).ok()?;
    config.get_string(key).ok()
}

/// Read a boolean key from a config-format file.
pub fn read_config_bool(file: &Path, key: &str, default: bool) -> bool {
    Config::open(file)
        .ok()
        .and_then(|config| config.get_bool(key).ok())
        .unwrap_or(default)
}

/// Remote url configured in a bare mirror's `config` file.
pub fn mirror_remote_url(git_dir: &Path) -> Option<String> {
    let config = git_dir.join("config");
    read_config_string(&config, "gitsync.remote")
        .or_else(|| read_config_string(&config, "remote.origin.url"))
}

/// One `[submodule "name"]` section of a `.gitmodules` file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmoduleEntry {
    pub name: String,
    pub path: Option<String>,
    pub url: Option<String>,
    pub branch: Option<String>,
}

/// Parse the submodule sections of a config-format file such as `.gitmodules`.
///
/// Entries come back ordered by name.
pub fn read_submodule_sections(file: &Path) -> Result<Vec<SubmoduleEntry>, GitError> {
    let config = Config::open(file)?;
    let mut sections: BTreeMap<String, SubmoduleEntry> = BTreeMap::new();
    let mut entries = config.entries(Some(r"^submodule\..*"))?;
    while let Some(entry) = entries.next() {
        let entry = entry?;
        let (Some(key), Some(value)) = (entry.name(), entry.value()) else {
            continue;
        };
        let Some(rest) = key.strip_prefix("submodule.") else {
            continue;
        };
        let Some((name, field)) = rest.rsplit_once('.') else {
            continue;
        };
        let section = sections.entry(name.to_string()).or_insert_with(|| SubmoduleEntry {
            name: name.to_string(),
            ..SubmoduleEntry::default()
        });
        match field {
            "path" => section.path = Some(value.to_string()),
            "url" => section.url = Some(value.to_string()),
            "branch" => section.branch = Some(value.to_string()),
            _ => {}
        }
    }
    Ok(sections.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn repository_exists_returns_false_for_nonexistent() {
        let temp_dir = tempdir().expect("Failed to create temp directory");
        assert!(!repository_exists(&temp_dir.path().join("nonexistent")));
    }

    #[test]
    fn repository_exists_returns_false_for_regular_directory() {
        let temp_dir = tempdir().expect("Failed to create temp directory");
        assert!(!repository_exists(temp_dir.path()));
    }

    #[test]
    fn repository_exists_for_initialized_bare_repo() {
        let temp_dir = tempdir().expect("Failed to create temp directory");
        let path = temp_dir.path().join("m.git");
        Repository::init_bare(&path).expect("Failed to init repo");
        assert!(repository_exists(&path));
        assert!(Repository::open(&path).expect("Failed to open").is_bare());
    }

    #[test]
    fn mirror_remote_url_prefers_explicit_key() {
        let temp_dir = tempdir().expect("Failed to create temp directory");
        std::fs::write(
            temp_dir.path().join("config"),
            "[remote \"origin\"]\n\turl = https://a.example/x.git\n[gitsync]\n\tremote = https://b.example/x.git\n",
        )
        .unwrap();
        assert_eq!(
            mirror_remote_url(temp_dir.path()).as_deref(),
            Some("https://b.example/x.git")
        );
    }

    #[test]
    fn mirror_remote_url_falls_back_to_origin() {
        let temp_dir = tempdir().expect("Failed to create temp directory");
        std::fs::write(
            temp_dir.path().join("config"),
            "[remote \"origin\"]\n\turl = https://a.example/x.git\n",
        )
        .unwrap();
        assert_eq!(
            mirror_remote_url(temp_dir.path()).as_deref(),
            Some("https://a.example/x.git")
        );
        assert_eq!(mirror_remote_url(&temp_dir.path().join("missing")), None);
    }

    #[test]
    fn reads_gitmodules_sections() {
        let temp_dir = tempdir().expect("Failed to create temp directory");
        let file = temp_dir.path().join(".gitmodules");
        std::fs::write(
            &file,
            "[submodule \"libs/a\"]\n\tpath = libs/a\n\turl = ../a.git\n\tbranch = .\n\
             [submodule \"b\"]\n\tpath = vendor/b\n\turl = https://example.com/b.git\n",
        )
        .unwrap();

        let sections = read_submodule_sections(&file).expect("Failed to parse");
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].name, "b");
        assert_eq!(sections[0].path.as_deref(), Some("vendor/b"));
        assert_eq!(sections[1].name, "libs/a");
        assert_eq!(sections[1].url.as_deref(), Some("../a.git"));
        assert_eq!(sections[1].branch.as_deref(), Some("."));
    }

    #[test]
    fn read_config_bool_defaults() {
        let temp_dir = tempdir().expect("Failed to create temp directory");
        let file = temp_dir.path().join("config");
        std::fs::write(&file, "[gitsync]\n\tfreeDiskSpaceCleanupEnabled = false\n").unwrap();
        assert!(!read_config_bool(&file, "gitsync.freeDiskSpaceCleanupEnabled", true));
        assert!(read_config_bool(&file, "gitsync.other", true));
    }
}
