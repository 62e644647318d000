use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use git2::Repository;
use ignore::WalkBuilder;
use yaml_rust::YamlLoader;

use crate::paths::RepoPath;

const SPECS_DIR: &str = "specs";
const VCS_DIR: &str = ".git";
const HARNESS_DIR: &str = ".bork";
const MAIN_REF: &str = "main";

/// How a snapshot file participates in reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    Code,
    Spec,
    /// Present in the working tree but absent from the `main` branch.
    NewlyAddedSpec,
}

impl FileRole {
    pub fn label(&self) -> &'static str {
        match self {
            FileRole::Code => "Code",
            FileRole::Spec => "Spec",
            FileRole::NewlyAddedSpec => "NewlyAddedSpec",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileSnapshot {
    pub path: RepoPath,
    pub contents: Vec<u8>,
    pub role: FileRole,
}

/// A faithful picture of the working tree at the top of an iteration,
/// ordered by path, plus the unified diff of `specs/` against `main` when
/// the VCS can provide one.
#[derive(Debug, Clone)]
pub struct RepoSnapshot {
    pub files: Vec<FileSnapshot>,
    pub spec_diff: Option<String>,
}

#[derive(Debug)]
pub enum SnapshotError {
    Io { path: String, source: io::Error },
    Vcs(git2::Error),
    InvalidEntry(String),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SnapshotError::Io { path, source } => {
                write!(f, "failed to read {}: {}", path, source)
            }
            SnapshotError::Vcs(e) => write!(f, "VCS error while snapshotting: {}", e),
            SnapshotError::InvalidEntry(path) => {
                write!(f, "refusing to snapshot non-relative entry '{}'", path)
            }
        }
    }
}

impl std::error::Error for SnapshotError {}

impl From<git2::Error> for SnapshotError {
    fn from(e: git2::Error) -> Self {
        SnapshotError::Vcs(e)
    }
}

/// Snapshot the repository at `root`.
///
/// With a git working tree, enumeration covers tracked files plus untracked
/// non-ignored files, and the `specs/` diff against `main` is computed.
/// Without one (or when `main` cannot be resolved) snapshotting degrades:
/// a plain non-ignored walk, no diff, and every spec classified as `Spec`.
pub fn take(root: &Path, verbose: bool) -> Result<RepoSnapshot, SnapshotError> {
    match Repository::open(root) {
        Ok(repo) => take_with_vcs(root, &repo, verbose),
        Err(e) => {
            eprintln!(
                "warning: {} is not a git working tree ({}); snapshotting without a spec diff",
                root.display(),
                e.message()
            );
            take_plain(root, verbose)
        }
    }
}

fn take_with_vcs(root: &Path, repo: &Repository, verbose: bool) -> Result<RepoSnapshot, SnapshotError> {
    let rel_paths = enumerate_vcs(repo)?;

    let main_tree = match repo
        .revparse_single(MAIN_REF)
        .and_then(|obj| obj.peel_to_tree())
    {
        Ok(tree) => Some(tree),
        Err(e) => {
            eprintln!(
                "warning: cannot resolve '{}' ({}); snapshotting without a spec diff",
                MAIN_REF,
                e.message()
            );
            None
        }
    };

    let main_specs = main_tree.as_ref().map(spec_paths_in_tree).transpose()?;
    let files = read_files(root, &rel_paths, main_specs.as_ref(), verbose)?;

    let spec_diff = match main_tree {
        Some(tree) => {
            let newly_added: Vec<&RepoPath> = files
                .iter()
                .filter(|f| f.role == FileRole::NewlyAddedSpec)
                .map(|f| &f.path)
                .collect();
            spec_diff_against(repo, &tree, &newly_added)?
        }
        None => None,
    };

    Ok(RepoSnapshot { files, spec_diff })
}

fn take_plain(root: &Path, verbose: bool) -> Result<RepoSnapshot, SnapshotError> {
    let mut rel_paths = BTreeSet::new();
    for entry in WalkBuilder::new(root).hidden(false).build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let rel = match entry.path().strip_prefix(root) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        if let Some(rel) = rel.to_str() {
            rel_paths.insert(rel.to_string());
        }
    }

    let files = read_files(root, &rel_paths, None, verbose)?;
    Ok(RepoSnapshot {
        files,
        spec_diff: None,
    })
}

/// All index entries plus untracked non-ignored worktree files, by relative
/// path. The status walk includes unmodified entries so unchanged tracked
/// files are enumerated too.
fn enumerate_vcs(repo: &Repository) -> Result<BTreeSet<String>, SnapshotError> {
    let mut opts = git2::StatusOptions::new();
    opts.include_untracked(true)
        .recurse_untracked_dirs(true)
        .include_unmodified(true)
        .include_ignored(false)
        .exclude_submodules(true);

    let statuses = repo.statuses(Some(&mut opts))?;
    let mut rel_paths = BTreeSet::new();
    for entry in statuses.iter() {
        if let Some(path) = entry.path() {
            rel_paths.insert(path.to_string());
        }
    }
    Ok(rel_paths)
}

fn read_files(
    root: &Path,
    rel_paths: &BTreeSet<String>,
    main_specs: Option<&BTreeSet<String>>,
    verbose: bool,
) -> Result<Vec<FileSnapshot>, SnapshotError> {
    let mut files = Vec::new();

    for rel in rel_paths {
        if is_excluded(rel) {
            continue;
        }

        let path = RepoPath::parse(rel)
            .map_err(|_| SnapshotError::InvalidEntry(rel.clone()))?;
        let full = path.to_fs_path(root);

        // Only regular files enter the snapshot. Deleted-but-still-listed
        // entries and symlinks are skipped.
        match fs::symlink_metadata(&full) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(source) => {
                return Err(SnapshotError::Io {
                    path: rel.clone(),
                    source,
                });
            }
        }

        let contents = fs::read(&full).map_err(|source| SnapshotError::Io {
            path: rel.clone(),
            source,
        })?;

        let role = if path.is_under(SPECS_DIR) {
            if verbose && !has_spec_frontmatter(&contents) {
                eprintln!(
                    "warning: {} has no 'kind: spec' frontmatter",
                    path.as_str()
                );
            }
            match main_specs {
                Some(known) if !known.contains(path.as_str()) => FileRole::NewlyAddedSpec,
                _ => FileRole::Spec,
            }
        } else {
            FileRole::Code
        };

        files.push(FileSnapshot {
            path,
            contents,
            role,
        });
    }

    Ok(files)
}

fn is_excluded(rel: &str) -> bool {
    rel == VCS_DIR
        || rel.starts_with(".git/")
        || rel == HARNESS_DIR
        || rel.starts_with(".bork/")
}

/// Blob paths under `specs/` in the given tree.
fn spec_paths_in_tree(tree: &git2::Tree) -> Result<BTreeSet<String>, SnapshotError> {
    let mut paths = BTreeSet::new();
    tree.walk(git2::TreeWalkMode::PreOrder, |dir, entry| {
        if entry.kind() == Some(git2::ObjectType::Blob)
            && let Some(name) = entry.name()
        {
            let full = format!("{}{}", dir, name);
            if full.starts_with("specs/") {
                paths.insert(full);
            }
        }
        git2::TreeWalkResult::Ok
    })?;
    Ok(paths)
}

/// Unified diff of `specs/` between the `main` tree and the working tree.
/// Untracked spec files do not expand here; they are appended as `added:`
/// marker lines because their contents already sit in the snapshot list.
fn spec_diff_against(
    repo: &Repository,
    main_tree: &git2::Tree,
    newly_added: &[&RepoPath],
) -> Result<Option<String>, SnapshotError> {
    let mut opts = git2::DiffOptions::new();
    opts.pathspec(SPECS_DIR);

    let diff = repo.diff_tree_to_workdir_with_index(Some(main_tree), Some(&mut opts))?;

    let mut buf = Vec::new();
    diff.print(git2::DiffFormat::Patch, |_delta, _hunk, line| {
        match line.origin() {
            '+' | '-' | ' ' => buf.push(line.origin() as u8),
            _ => {}
        }
        buf.extend_from_slice(line.content());
        true
    })?;

    let mut text = String::from_utf8_lossy(&buf).into_owned();
    for path in newly_added {
        text.push_str(&format!("added: {}\n", path));
    }

    if text.is_empty() {
        Ok(None)
    } else {
        Ok(Some(text))
    }
}

/// True when the file opens with a YAML frontmatter block declaring
/// `kind: spec`.
fn has_spec_frontmatter(contents: &[u8]) -> bool {
    let text = String::from_utf8_lossy(contents);
    let Some(rest) = text.strip_prefix("---\n") else {
        return false;
    };
    let Some(end) = rest.find("\n---") else {
        return false;
    };
    YamlLoader::load_from_str(&rest[..end])
        .ok()
        .and_then(|docs| docs.into_iter().next())
        .is_some_and(|doc| doc["kind"].as_str() == Some("spec"))
}
