use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::actions::Action;
use crate::paths::RepoPath;

/// Why one accepted action could not be applied. Per-action failures are
/// surfaced to the operator and never abort the rest of the batch.
#[derive(Debug)]
pub enum ApplyError {
    /// A component of the target path is a symlink. Refused outright so a
    /// link can never redirect a write outside the repo root.
    SymlinkInPath { path: RepoPath, component: PathBuf },
    /// A component of the target path exists but is not a directory.
    NotADirectory { path: RepoPath, component: PathBuf },
    /// Deleting something that is neither a regular file, an empty
    /// directory, nor a symlink entry.
    UnsupportedFileType { path: RepoPath },
    Io { path: RepoPath, source: io::Error },
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ApplyError::SymlinkInPath { path, component } => write!(
                f,
                "refusing '{}': '{}' is a symlink",
                path,
                component.display()
            ),
            ApplyError::NotADirectory { path, component } => write!(
                f,
                "refusing '{}': '{}' is not a directory",
                path,
                component.display()
            ),
            ApplyError::UnsupportedFileType { path } => {
                write!(f, "refusing '{}': not a regular file or empty directory", path)
            }
            ApplyError::Io { path, source } => write!(f, "failed to apply '{}': {}", path, source),
        }
    }
}

impl std::error::Error for ApplyError {}

/// Apply one vetted action inside `root`.
///
/// Writes go through a sibling temp file plus an atomic rename, so readers
/// of the target only ever observe the old bytes or the new bytes. Deleting
/// an absent path is a no-op, which makes re-applying an action set after a
/// crash safe.
pub fn apply_action(root: &Path, action: &Action) -> Result<(), ApplyError> {
    match action {
        Action::CreateOrUpdate { path, contents } => create_or_update(root, path, contents),
        Action::Delete { path } => delete(root, path),
    }
}

fn create_or_update(root: &Path, path: &RepoPath, contents: &[u8]) -> Result<(), ApplyError> {
    let (parent, target) = walk_to_parent(root, path, true)?
        .unwrap_or_else(|| unreachable_walk(root, path));

    // A symlinked destination is removed as a link entry, never followed.
    // Parents are re-verified first under the walk above; the rename below
    // replaces the directory entry itself, so a link recreated in the
    // remaining window cannot redirect the write.
    match fs::symlink_metadata(&target) {
        Ok(meta) if meta.file_type().is_symlink() => {
            walk_to_parent(root, path, false)?;
            fs::remove_file(&target).map_err(|source| ApplyError::Io {
                path: path.clone(),
                source,
            })?;
        }
        _ => {}
    }

    let mut tmp = NamedTempFile::new_in(&parent).map_err(|source| ApplyError::Io {
        path: path.clone(),
        source,
    })?;
    tmp.write_all(contents).map_err(|source| ApplyError::Io {
        path: path.clone(),
        source,
    })?;
    tmp.as_file().sync_all().map_err(|source| ApplyError::Io {
        path: path.clone(),
        source,
    })?;
    tmp.persist(&target).map_err(|e| ApplyError::Io {
        path: path.clone(),
        source: e.error,
    })?;

    Ok(())
}

fn delete(root: &Path, path: &RepoPath) -> Result<(), ApplyError> {
    let Some((_, target)) = walk_to_parent(root, path, false)? else {
        // A parent directory is missing, so the target cannot exist.
        return Ok(());
    };

    match fs::symlink_metadata(&target) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ApplyError::Io {
            path: path.clone(),
            source,
        }),
        Ok(meta) => {
            let ft = meta.file_type();
            let result = if ft.is_symlink() || ft.is_file() {
                fs::remove_file(&target)
            } else if ft.is_dir() {
                // Only empty directories; remove_dir refuses the rest.
                fs::remove_dir(&target)
            } else {
                return Err(ApplyError::UnsupportedFileType { path: path.clone() });
            };
            result.map_err(|source| ApplyError::Io {
                path: path.clone(),
                source,
            })
        }
    }
}

/// Walk every directory component of `path` from `root` outward, refusing
/// symlinks at each step. With `create`, missing components become real
/// directories; without it, a missing component yields `Ok(None)`.
/// Returns the verified parent directory and the full target path.
fn walk_to_parent(
    root: &Path,
    path: &RepoPath,
    create: bool,
) -> Result<Option<(PathBuf, PathBuf)>, ApplyError> {
    let segments: Vec<&str> = path.segments().collect();
    let (file, dirs) = segments
        .split_last()
        .unwrap_or_else(|| unreachable_walk(root, path));

    let mut current = root.to_path_buf();
    for segment in dirs {
        current.push(segment);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(ApplyError::SymlinkInPath {
                    path: path.clone(),
                    component: current,
                });
            }
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(ApplyError::NotADirectory {
                    path: path.clone(),
                    component: current,
                });
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if !create {
                    return Ok(None);
                }
                fs::create_dir(&current).map_err(|source| ApplyError::Io {
                    path: path.clone(),
                    source,
                })?;
            }
            Err(source) => {
                return Err(ApplyError::Io {
                    path: path.clone(),
                    source,
                });
            }
        }
    }

    let target = current.join(file);
    Ok(Some((current, target)))
}

// RepoPath guarantees at least one segment, so split_last and the outer
// walk always produce a value.
fn unreachable_walk<T>(root: &Path, path: &RepoPath) -> T {
    unreachable!("walk of '{}' under {} produced no target", path, root.display())
}
