//! Git integration utilities for capturing repository state.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::domain::error::{FanoutError, Result};
use crate::domain::version::TagDescriber;

fn run_git(repo_dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .output()
        .map_err(|e| FanoutError::Git(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(FanoutError::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    let out = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if out.is_empty() {
        return Err(FanoutError::Git(format!(
            "git {} returned empty output",
            args.join(" ")
        )));
    }
    Ok(out)
}

/// Capture the HEAD commit SHA from a git repository.
///
/// Runs `git rev-parse HEAD` in the given directory. Returns an error if the
/// directory is not inside a git repository or if git is not available.
pub fn capture_head_sha(repo_dir: &Path) -> Result<String> {
    run_git(repo_dir, &["rev-parse", "HEAD"])
}

/// Nearest reachable tag, or the abbreviated commit id when no tag exists.
///
/// Runs `git describe --tags --always`.
pub fn describe_tags(repo_dir: &Path) -> Result<String> {
    run_git(repo_dir, &["describe", "--tags", "--always"])
}

/// [`TagDescriber`] backed by `git describe` in a work tree.
#[derive(Debug, Clone)]
pub struct GitDescriber {
    repo_dir: PathBuf,
}

impl GitDescriber {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }
}

impl TagDescriber for GitDescriber {
    fn describe(&self) -> Result<String> {
        describe_tags(&self.repo_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::version::{resolve_app_version, TriggerEvent, FALLBACK_VERSION};
    use std::process::Command as StdCommand;

    fn git(repo_dir: &Path, args: &[&str]) {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(repo_dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn make_git_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        git(dir.path(), &["init"]);
        git(dir.path(), &["config", "user.name", "test-user"]);
        git(dir.path(), &["config", "user.email", "test@example.com"]);
        git(dir.path(), &["config", "tag.gpgsign", "false"]);
        git(dir.path(), &["commit", "--allow-empty", "-m", "initial"]);
        dir
    }

    #[test]
    fn capture_head_sha_returns_40_hex_chars() {
        let repo = make_git_repo();
        let sha = capture_head_sha(repo.path()).unwrap();
        assert_eq!(sha.len(), 40, "SHA should be 40 hex chars, got: {sha}");
        assert!(sha.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn capture_head_sha_fails_outside_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(capture_head_sha(dir.path()).is_err());
    }

    #[test]
    fn describe_on_tagged_commit_returns_tag() {
        let repo = make_git_repo();
        git(repo.path(), &["tag", "v1.2.3"]);
        assert_eq!(describe_tags(repo.path()).unwrap(), "v1.2.3");

        let version =
            resolve_app_version(TriggerEvent::ManualDispatch, &GitDescriber::new(repo.path()));
        assert_eq!(version.as_str(), "v1.2.3");
    }

    #[test]
    fn describe_without_tags_returns_abbreviated_sha() {
        let repo = make_git_repo();
        let head = capture_head_sha(repo.path()).unwrap();
        let described = describe_tags(repo.path()).unwrap();
        assert!(head.starts_with(&described), "{described} not a prefix of {head}");
    }

    #[test]
    fn describe_outside_repo_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let version =
            resolve_app_version(TriggerEvent::ManualDispatch, &GitDescriber::new(dir.path()));
        assert_eq!(version.as_str(), FALLBACK_VERSION);
    }
}
