//! Git queries about the worktree a sandbox serves.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};

fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::ToolUnavailable("git".to_string()),
            _ => Error::Io(e),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Git(format!(
            "git {} failed in {}: {}",
            args.join(" "),
            dir.display(),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Returns the main checkout that owns `worktree`.
///
/// For a linked worktree this is the repository holding the shared `.git`
/// directory; for the main checkout it is the checkout itself.
pub fn find_main_repo_root(worktree: &Path) -> Result<PathBuf> {
    let common_dir = git(
        worktree,
        &["rev-parse", "--path-format=absolute", "--git-common-dir"],
    )?;
    let common_dir = PathBuf::from(common_dir.trim());
    common_dir
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| Error::Git(format!("unexpected git dir {}", common_dir.display())))
}

/// Returns the top level of the checkout containing `dir`.
pub fn toplevel(dir: &Path) -> Result<PathBuf> {
    let top = git(dir, &["rev-parse", "--show-toplevel"])?;
    Ok(PathBuf::from(top.trim()))
}

/// Returns true if the worktree has uncommitted or untracked changes.
pub fn is_dirty(worktree: &Path) -> Result<bool> {
    let status = git(worktree, &["status", "--porcelain"])?;
    Ok(!status.trim().is_empty())
}
