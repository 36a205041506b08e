//! Copies declared config files from the main repository into a worktree.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use super::ProvisioningError;

/// Lexically normalizes `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolves `path` to an absolute form, following symlinks in the part that exists.
fn resolve(path: &Path) -> PathBuf {
    let normalized = normalize(path);
    let mut existing = normalized.as_path();
    let mut rest = Vec::new();

    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return rest.iter().rev().fold(canonical, |acc, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return normalized,
        }
    }
}

/// Copies each `(destination, source)` pair from `source_root` into `dest_root`.
///
/// Sources must resolve inside `source_root` and destinations inside
/// `dest_root`. Every pair is attempted; returns the provisioned destination
/// names and every failure.
pub fn provision_files(
    files: &BTreeMap<String, String>,
    source_root: &Path,
    dest_root: &Path,
) -> (Vec<String>, Vec<ProvisioningError>) {
    let source_root = resolve(source_root);
    let dest_root = resolve(dest_root);

    let mut provisioned = Vec::new();
    let mut errors = Vec::new();

    for (dest_rel, source_rel) in files {
        let fail = |message: String| ProvisioningError::FileProvision {
            destination: dest_rel.clone(),
            source_path: source_rel.clone(),
            message,
        };

        let source = resolve(&source_root.join(source_rel));
        let dest = resolve(&dest_root.join(dest_rel));

        if !source.starts_with(&source_root) {
            errors.push(fail(format!(
                "{}: source path escapes project root: {}",
                dest_rel, source_rel
            )));
            continue;
        }
        if !dest.starts_with(&dest_root) {
            errors.push(fail(format!(
                "{}: destination path escapes worktree: {}",
                dest_rel, dest_rel
            )));
            continue;
        }

        if !source.is_file() {
            let example = source_root.join(format!("{}.example", source_rel));
            let hint = if example.is_file() {
                format!(" Hint: cp {}.example {}", source_rel, source_rel)
            } else {
                String::new()
            };
            errors.push(fail(format!(
                "{}: source not found at {}.{}",
                dest_rel,
                source.display(),
                hint
            )));
            continue;
        }

        let copied = dest
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|()| std::fs::copy(&source, &dest));
        match copied {
            Ok(_) => {
                tracing::debug!(dest = %dest_rel, source = %source_rel, "provisioned file");
                provisioned.push(dest_rel.clone());
            }
            Err(e) => errors.push(fail(format!(
                "{}: failed to copy from {}: {}",
                dest_rel, source_rel, e
            ))),
        }
    }

    (provisioned, errors)
}
