use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};

/// Reasons a raw path string cannot become a [`RepoPath`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    Empty,
    Absolute(String),
    NulByte(String),
    ParentSegment(String),
    InvalidEncoding(String),
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PathError::Empty => write!(f, "path is empty"),
            PathError::Absolute(raw) => write!(f, "path '{}' is absolute", raw),
            PathError::NulByte(raw) => write!(f, "path '{}' contains a NUL byte", raw.escape_default()),
            PathError::ParentSegment(raw) => {
                write!(f, "path '{}' contains a '..' segment", raw)
            }
            PathError::InvalidEncoding(raw) => {
                write!(f, "path '{}' is not valid UTF-8", raw)
            }
        }
    }
}

impl std::error::Error for PathError {}

/// A normalized relative path inside the repository.
///
/// The normalized form is `/`-joined with no leading slash, no `.` or `..`
/// segments, and no NUL bytes. Two paths are equal iff their normalized
/// segment sequences are equal. Paths proposed by the model are untrusted
/// input, so parsing is strict: anything absolute, empty, or containing a
/// `..` segment is refused outright rather than resolved.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RepoPath(String);

impl RepoPath {
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        if raw.is_empty() {
            return Err(PathError::Empty);
        }
        if raw.contains('\0') {
            return Err(PathError::NulByte(raw.to_string()));
        }

        let mut segments: Vec<&str> = Vec::new();
        for component in Path::new(raw).components() {
            match component {
                Component::Normal(segment) => match segment.to_str() {
                    Some(s) => segments.push(s),
                    None => return Err(PathError::InvalidEncoding(raw.to_string())),
                },
                Component::CurDir => {}
                Component::ParentDir => return Err(PathError::ParentSegment(raw.to_string())),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(PathError::Absolute(raw.to_string()));
                }
            }
        }

        if segments.is_empty() {
            return Err(PathError::Empty);
        }

        Ok(RepoPath(segments.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// True when this path sits strictly below the directory `dir`
    /// (itself given in normalized form).
    pub fn is_under(&self, dir: &str) -> bool {
        self.0
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Join onto a repo root, segment by segment. The result never escapes
    /// `root` because parsing refused every escaping form.
    pub fn to_fs_path(&self, root: &Path) -> PathBuf {
        let mut full = root.to_path_buf();
        for segment in self.segments() {
            full.push(segment);
        }
        full
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for RepoPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RepoPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        RepoPath::parse(&raw).map_err(de::Error::custom)
    }
}
