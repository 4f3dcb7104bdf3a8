//! Git access: the CLI for everything that changes a repository, libgit2 for cheap reads.

mod cli;
mod command;
mod repo;
#[cfg(test)]
pub mod testing;

pub use cli::{CleanScope, FetchArgs, GitCli, GitDir, GitVersion};
pub use command::{CancelToken, CommandRunner, GitError, ProcessRunner};
pub use repo::{
    SubmoduleEntry, mirror_remote_url, read_config_bool, read_submodule_sections,
    repository_exists,
};
