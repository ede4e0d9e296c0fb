//! Safe path algebra (spec §4.9, component C9).
//!
//! A small calculus distinguishing absolute directories (trailing
//! `/`), absolute files (no trailing `/`) and relative files, so that
//! every path crossing a resource boundary is joined and stripped
//! through typed operations instead of string concatenation. Every
//! public operation carries a doctest example.

use std::fmt;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path is not absolute: {0}")]
    NotAbsolute(String),
    #[error("path is not relative: {0}")]
    NotRelative(String),
    #[error("path contains a NUL byte")]
    NulByte,
    #[error("path contains an empty segment")]
    EmptySegment,
    #[error("path escapes its base directory")]
    Escapes,
}

/// Normalizes `text` into a stack of segments, rejecting NUL bytes,
/// empty interior segments (`//`), and any `..` that would pop past
/// the root (for absolute paths) or past the starting point (for
/// relative paths).
///
/// # Test
///
/// ```
/// use mgmtd::httpcache::path::normalize_segments;
///
/// assert_eq!(normalize_segments("/a/b/../c").unwrap(), vec!["a", "c"]);
/// assert!(normalize_segments("/a/../../c").is_err());
/// assert!(normalize_segments("/a//b").is_err());
/// ```
pub fn normalize_segments(text: &str) -> Result<Vec<String>, PathError> {
    if text.as_bytes().contains(&0) {
        return Err(PathError::NulByte);
    }

    let body = text.trim_start_matches('/');
    let mut stack: Vec<String> = Vec::new();

    for (i, seg) in body.split('/').enumerate() {
        let is_trailing_empty = seg.is_empty() && i == body.split('/').count() - 1;

        if seg.is_empty() {
            if is_trailing_empty {
                continue; // trailing slash: marks a directory, not an error
            }
            return Err(PathError::EmptySegment);
        }

        if seg == "." {
            continue;
        }

        if seg == ".." {
            if stack.pop().is_none() {
                return Err(PathError::Escapes);
            }
            continue;
        }

        stack.push(seg.to_string());
    }

    Ok(stack)
}

/// An absolute directory path; always rendered with a trailing `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbsoluteDir(String);

/// An absolute file path; never has a trailing `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbsoluteFile(String);

/// A relative file path; never starts with `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelativeFile(String);

impl fmt::Display for AbsoluteDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for AbsoluteFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RelativeFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AbsoluteDir {
    /// Parses `text` as an absolute directory. A missing trailing `/`
    /// is tolerated and added, matching the spec's definition
    /// ("AbsoluteDir: ends with `/`") rather than requiring callers to
    /// format it themselves.
    ///
    /// # Test
    ///
    /// ```
    /// use mgmtd::httpcache::path::AbsoluteDir;
    ///
    /// assert_eq!(AbsoluteDir::parse("/var/cache/p").unwrap().as_str(), "/var/cache/p/");
    /// assert!(AbsoluteDir::parse("var/cache").is_err());
    /// assert!(AbsoluteDir::parse("/var/../../cache").is_err());
    /// ```
    pub fn parse(text: &str) -> Result<Self, PathError> {
        if !text.starts_with('/') {
            return Err(PathError::NotAbsolute(text.to_string()));
        }

        let segs = normalize_segments(text)?;
        let mut rendered = String::from("/");
        rendered.push_str(&segs.join("/"));
        if !segs.is_empty() {
            rendered.push('/');
        }

        Ok(Self(rendered))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The directory immediately containing `leaf` (a file or a
    /// directory), or `None` if `leaf` is already the root.
    pub fn parent_of(leaf: &str) -> Option<Self> {
        let segs = normalize_segments(leaf).ok()?;
        if segs.is_empty() {
            return None;
        }

        let parent_segs = &segs[..segs.len() - 1];
        let mut rendered = String::from("/");
        rendered.push_str(&parent_segs.join("/"));
        if !parent_segs.is_empty() {
            rendered.push('/');
        }
        Some(Self(rendered))
    }

    /// One level further up, or `None` if this is already `/`.
    ///
    /// # Test
    ///
    /// ```
    /// use mgmtd::httpcache::path::AbsoluteDir;
    ///
    /// let d = AbsoluteDir::parse("/etc/app/").unwrap();
    /// assert_eq!(d.parent().unwrap().as_str(), "/etc/");
    /// assert_eq!(d.parent().unwrap().parent().unwrap().as_str(), "/");
    /// assert!(d.parent().unwrap().parent().unwrap().parent().is_none());
    /// ```
    pub fn parent(&self) -> Option<Self> {
        if self.0 == "/" {
            return None;
        }
        Self::parent_of(&self.0)
    }

    /// Directory-prefix relation: `path` lies under this directory.
    /// Not a string `starts_with` — `/mirror2/x` does not have prefix
    /// `/mirror/` even though the raw strings share a prefix.
    ///
    /// # Test
    ///
    /// ```
    /// use mgmtd::httpcache::path::AbsoluteDir;
    ///
    /// let dir = AbsoluteDir::parse("/mirror/").unwrap();
    /// assert!(dir.has_prefix_of("/mirror/x/y.tgz"));
    /// assert!(!dir.has_prefix_of("/mirror2/x"));
    /// ```
    pub fn has_prefix_of(&self, path: &str) -> bool {
        path.starts_with(self.0.as_str())
    }

    /// Strips this directory's prefix from `path`, returning the
    /// remainder as a relative file.
    ///
    /// # Test
    ///
    /// ```
    /// use mgmtd::httpcache::path::AbsoluteDir;
    ///
    /// let dir = AbsoluteDir::parse("/mirror/").unwrap();
    /// let rel = dir.strip_prefix("/mirror/x/y.tgz").unwrap();
    /// assert_eq!(rel.to_string(), "x/y.tgz");
    /// assert!(dir.strip_prefix("/etc/passwd").is_err());
    /// ```
    pub fn strip_prefix(&self, path: &str) -> Result<RelativeFile, PathError> {
        if !self.has_prefix_of(path) {
            return Err(PathError::Escapes);
        }

        let rel = &path[self.0.len()..];
        RelativeFile::parse(rel)
    }

    /// Joins `rel` onto this directory, rejecting any result that
    /// would escape it.
    ///
    /// # Test
    ///
    /// ```
    /// use mgmtd::httpcache::path::{AbsoluteDir, RelativeFile};
    ///
    /// let dir = AbsoluteDir::parse("/var/cache/p/").unwrap();
    /// let rel = RelativeFile::parse("x/y.tgz").unwrap();
    /// assert_eq!(dir.join(&rel).unwrap().to_string(), "/var/cache/p/x/y.tgz");
    /// ```
    pub fn join(&self, rel: &RelativeFile) -> Result<AbsoluteFile, PathError> {
        let mut combined = self.0.clone();
        combined.push_str(rel.as_str());

        let segs = normalize_segments(&combined)?;
        let base_segs = normalize_segments(&self.0)?;

        if segs.len() < base_segs.len() || segs[..base_segs.len()] != base_segs[..] {
            return Err(PathError::Escapes);
        }

        Ok(AbsoluteFile(format!("/{}", segs.join("/"))))
    }
}

impl AbsoluteFile {
    /// # Test
    ///
    /// ```
    /// use mgmtd::httpcache::path::AbsoluteFile;
    ///
    /// assert!(AbsoluteFile::parse("/etc/passwd").is_ok());
    /// assert!(AbsoluteFile::parse("/etc/").is_err());
    /// assert!(AbsoluteFile::parse("/../etc/passwd").is_err());
    /// ```
    pub fn parse(text: &str) -> Result<Self, PathError> {
        if !text.starts_with('/') {
            return Err(PathError::NotAbsolute(text.to_string()));
        }
        if text.ends_with('/') {
            return Err(PathError::NotAbsolute(format!("{text} is a directory")));
        }

        let segs = normalize_segments(text)?;
        Ok(Self(format!("/{}", segs.join("/"))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl RelativeFile {
    /// # Test
    ///
    /// ```
    /// use mgmtd::httpcache::path::RelativeFile;
    ///
    /// assert!(RelativeFile::parse("x/y.tgz").is_ok());
    /// assert!(RelativeFile::parse("/x/y.tgz").is_err());
    /// assert!(RelativeFile::parse("../etc/passwd").is_err());
    /// ```
    pub fn parse(text: &str) -> Result<Self, PathError> {
        if text.starts_with('/') {
            return Err(PathError::NotRelative(text.to_string()));
        }

        let segs = normalize_segments(&format!("/{text}"))?;
        Ok(Self(segs.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
