//! Domain newtypes with validation
//!
//! Strongly-typed wrappers for identifiers and path values. Each newtype
//! validates its input at construction time so the rest of the engine can
//! rely on the invariant without re-checking.
//!
//! ## Design Notes
//!
//! - UUID-backed identifiers share one macro so they stay interchangeable
//!   in storage (TEXT columns) while remaining distinct types.
//! - `RelativePath` is the only path type the reconciliation logic handles.
//!   Absolute paths (`SyncPath`) appear at the filesystem boundary only.

use std::fmt::{self, Display, Formatter};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::DomainError;

// ============================================================================
// UUID-based ID types
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random identifier
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID value
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| DomainError::InvalidId(format!("Invalid {}: {e}", $label)))
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(
    /// Stable internal identifier of a `SyncItem` (store primary key)
    UniqueId,
    "UniqueId"
);
uuid_id!(
    /// Identifier of a `SyncSession` (one local root paired with one remote folder)
    SessionId,
    "SessionId"
);
uuid_id!(
    /// Identifier of a `ConflictRecord`
    ConflictId,
    "ConflictId"
);

// ============================================================================
// RelativePath
// ============================================================================

/// A normalized path relative to a session root
///
/// Always `/`-separated, without leading or trailing separators and without
/// `.` or `..` components. The empty path denotes the session root itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelativePath(String);

impl RelativePath {
    /// Create a new RelativePath, normalizing separators
    ///
    /// Backslashes are treated as separators, empty and `.` segments are
    /// dropped.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidRelativePath` for absolute paths or paths
    /// containing `..`
    pub fn new(path: impl Into<String>) -> Result<Self, DomainError> {
        let raw: String = path.into();
        if raw.starts_with('/') || raw.starts_with('\\') {
            return Err(DomainError::InvalidRelativePath(format!(
                "Path must be relative: {raw}"
            )));
        }

        let mut segments = Vec::new();
        for segment in raw.split(['/', '\\']) {
            match segment {
                "" | "." => {}
                ".." => {
                    return Err(DomainError::InvalidRelativePath(format!(
                        "Path contains traversal: {raw}"
                    )))
                }
                s if s.contains('\0') => {
                    return Err(DomainError::InvalidRelativePath(format!(
                        "Path contains NUL byte: {raw:?}"
                    )))
                }
                s => segments.push(s),
            }
        }

        Ok(Self(segments.join("/")))
    }

    /// The session root
    #[must_use]
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Build a RelativePath from an absolute path under `root`
    ///
    /// # Errors
    /// Returns `DomainError::PathNotInSyncRoot` if `path` is outside `root`
    pub fn from_absolute(root: &Path, path: &Path) -> Result<Self, DomainError> {
        let stripped = path.strip_prefix(root).map_err(|_| {
            DomainError::PathNotInSyncRoot(format!(
                "{} is not within {}",
                path.display(),
                root.display()
            ))
        })?;

        let mut parts = Vec::new();
        for component in stripped.components() {
            match component {
                Component::Normal(c) => parts.push(c.to_string_lossy().into_owned()),
                Component::CurDir => {}
                other => {
                    return Err(DomainError::InvalidRelativePath(format!(
                        "Unexpected component {other:?} in {}",
                        path.display()
                    )))
                }
            }
        }
        Self::new(parts.join("/"))
    }

    /// Get the inner string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this path denotes the session root
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of components (0 for the root)
    #[must_use]
    pub fn depth(&self) -> usize {
        if self.0.is_empty() {
            0
        } else {
            self.0.split('/').count()
        }
    }

    /// Iterate over the path components
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Last component, empty for the root
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }

    /// Parent path, `None` for the root
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            return None;
        }
        match self.0.rfind('/') {
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => Some(Self::root()),
        }
    }

    /// Append a single name component
    ///
    /// # Errors
    /// Returns an error if `name` is empty or contains a separator
    pub fn join(&self, name: &str) -> Result<Self, DomainError> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(DomainError::InvalidRelativePath(format!(
                "Invalid path component: {name:?}"
            )));
        }
        if self.0.is_empty() {
            Ok(Self(name.to_string()))
        } else {
            Ok(Self(format!("{}/{name}", self.0)))
        }
    }

    /// Replace the last component
    ///
    /// # Errors
    /// Returns an error for the root or an invalid name
    pub fn with_file_name(&self, name: &str) -> Result<Self, DomainError> {
        let parent = self.parent().ok_or_else(|| {
            DomainError::InvalidRelativePath("The root has no file name".to_string())
        })?;
        parent.join(name)
    }

    /// Whether `self` equals `ancestor` or lies below it
    #[must_use]
    pub fn starts_with(&self, ancestor: &RelativePath) -> bool {
        if ancestor.0.is_empty() || self.0 == ancestor.0 {
            return true;
        }
        self.0.len() > ancestor.0.len()
            && self.0.starts_with(&ancestor.0)
            && self.0.as_bytes()[ancestor.0.len()] == b'/'
    }

    /// Whether `self` lies strictly below `ancestor`
    #[must_use]
    pub fn is_descendant_of(&self, ancestor: &RelativePath) -> bool {
        self != ancestor && self.starts_with(ancestor)
    }

    /// Rebase `self` from `old_prefix` onto `new_prefix`
    ///
    /// Returns `None` if `self` is not under `old_prefix`.
    #[must_use]
    pub fn rebase(&self, old_prefix: &RelativePath, new_prefix: &RelativePath) -> Option<Self> {
        if !self.starts_with(old_prefix) {
            return None;
        }
        let rest = self.0[old_prefix.0.len()..].trim_start_matches('/');
        if rest.is_empty() {
            return Some(new_prefix.clone());
        }
        if new_prefix.0.is_empty() {
            Some(Self(rest.to_string()))
        } else {
            Some(Self(format!("{}/{rest}", new_prefix.0)))
        }
    }

    /// Case-folded form used for case-insensitive comparisons
    #[must_use]
    pub fn folded(&self) -> String {
        self.0.to_lowercase()
    }

    /// Resolve against an absolute root directory
    #[must_use]
    pub fn to_path(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for component in self.components() {
            path.push(component);
        }
        path
    }
}

impl Display for RelativePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, ".")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl FromStr for RelativePath {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RelativePath {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<RelativePath> for String {
    fn from(path: RelativePath) -> Self {
        path.0
    }
}

// ============================================================================
// SyncPath
// ============================================================================

/// A validated absolute local path, used for session roots
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "PathBuf", into = "PathBuf")]
pub struct SyncPath(PathBuf);

impl SyncPath {
    /// Create a new SyncPath, validating it is absolute
    ///
    /// `.` and `..` components are resolved lexically since the path might
    /// not exist yet.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPath` if the path is not absolute or
    /// escapes the filesystem root
    pub fn new(path: PathBuf) -> Result<Self, DomainError> {
        if !path.is_absolute() {
            return Err(DomainError::InvalidPath(format!(
                "Path must be absolute: {}",
                path.display()
            )));
        }

        let mut normalized = PathBuf::new();
        for component in path.components() {
            match component {
                Component::Prefix(p) => normalized.push(p.as_os_str()),
                Component::RootDir => normalized.push(Component::RootDir.as_os_str()),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(DomainError::InvalidPath(
                            "Path escapes root via ..".to_string(),
                        ));
                    }
                }
                Component::Normal(c) => normalized.push(c),
            }
        }

        Ok(Self(normalized))
    }

    /// Get the inner path
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Whether `other` is this path or lies below it
    #[must_use]
    pub fn contains(&self, other: &SyncPath) -> bool {
        other.0.starts_with(&self.0)
    }

    /// Whether either path contains the other
    #[must_use]
    pub fn nests_with(&self, other: &SyncPath) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// Resolve a session-relative path to an absolute path
    #[must_use]
    pub fn resolve(&self, relative: &RelativePath) -> PathBuf {
        relative.to_path(&self.0)
    }

    /// Express an absolute path relative to this root
    ///
    /// # Errors
    /// Returns an error if `path` is outside this root
    pub fn relativize(&self, path: &Path) -> Result<RelativePath, DomainError> {
        RelativePath::from_absolute(&self.0, path)
    }
}

impl Display for SyncPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl TryFrom<PathBuf> for SyncPath {
    type Error = DomainError;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        Self::new(path)
    }
}

impl From<SyncPath> for PathBuf {
    fn from(sync_path: SyncPath) -> Self {
        sync_path.0
    }
}

impl AsRef<Path> for SyncPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

// ============================================================================
// Remote-side values
// ============================================================================

/// Root folder of a session on the remote drive (must start with `/`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemotePath(String);

impl RemotePath {
    /// Create a new RemotePath
    ///
    /// A trailing separator is removed (except for the drive root).
    ///
    /// # Errors
    /// Returns error if the path doesn't start with `/` or contains `..`
    pub fn new(path: String) -> Result<Self, DomainError> {
        if !path.starts_with('/') {
            return Err(DomainError::InvalidRemotePath(format!(
                "Remote path must start with '/': {path}"
            )));
        }
        if path.len() > 1 && path.contains("//") {
            return Err(DomainError::InvalidRemotePath(format!(
                "Remote path contains double slashes: {path}"
            )));
        }
        if path.split('/').any(|s| s == "..") {
            return Err(DomainError::InvalidRemotePath(format!(
                "Remote path contains traversal: {path}"
            )));
        }

        let trimmed = if path.len() > 1 {
            path.trim_end_matches('/').to_string()
        } else {
            path
        };
        Ok(Self(trimmed))
    }

    /// The drive root "/"
    #[must_use]
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The path relative to the drive root, as a `RelativePath`
    #[must_use]
    pub fn as_relative(&self) -> RelativePath {
        RelativePath(self.0.trim_start_matches('/').to_string())
    }
}

impl Display for RemotePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RemotePath {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for RemotePath {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<RemotePath> for String {
    fn from(path: RemotePath) -> Self {
        path.0
    }
}

/// Opaque identifier the remote drive assigns to an item
///
/// Once assigned to a `SyncItem` it never changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemoteId(String);

impl RemoteId {
    /// Create a new RemoteId
    ///
    /// # Errors
    /// Returns error if the ID is empty or contains characters outside
    /// `[A-Za-z0-9!._:-]`
    pub fn new(id: String) -> Result<Self, DomainError> {
        if id.is_empty() {
            return Err(DomainError::InvalidRemoteId(
                "Remote ID cannot be empty".to_string(),
            ));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "!-_.:".contains(c))
        {
            return Err(DomainError::InvalidRemoteId(format!(
                "Remote ID contains invalid characters: {id}"
            )));
        }
        Ok(Self(id))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RemoteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RemoteId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for RemoteId {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<RemoteId> for String {
    fn from(id: RemoteId) -> Self {
        id.0
    }
}

/// Content hash as lowercase hex (SHA-256 for local content)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileHash(String);

impl FileHash {
    /// Create a new FileHash
    ///
    /// # Errors
    /// Returns error if the value is empty, has odd length or is not hex
    pub fn new(hash: String) -> Result<Self, DomainError> {
        if hash.is_empty() {
            return Err(DomainError::InvalidHash("Hash cannot be empty".to_string()));
        }
        if hash.len() % 2 != 0 {
            return Err(DomainError::InvalidHash(format!(
                "Hash has odd length: {hash}"
            )));
        }
        if !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DomainError::InvalidHash(format!(
                "Hash is not hexadecimal: {hash}"
            )));
        }
        Ok(Self(hash.to_ascii_lowercase()))
    }

    /// Build a hash from raw digest bytes
    #[must_use]
    pub fn from_digest(bytes: &[u8]) -> Self {
        let mut hex = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            hex.push_str(&format!("{b:02x}"));
        }
        Self(hex)
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for FileHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FileHash {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for FileHash {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<FileHash> for String {
    fn from(hash: FileHash) -> Self {
        hash.0
    }
}

/// Position in the remote change feed (opaque to the engine)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChangeCursor(String);

impl ChangeCursor {
    /// Create a new ChangeCursor
    ///
    /// # Errors
    /// Returns error if the cursor is empty
    pub fn new(cursor: String) -> Result<Self, DomainError> {
        if cursor.is_empty() {
            return Err(DomainError::InvalidCursor(
                "Change cursor cannot be empty".to_string(),
            ));
        }
        Ok(Self(cursor))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ChangeCursor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ChangeCursor {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ChangeCursor> for String {
    fn from(cursor: ChangeCursor) -> Self {
        cursor.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod id_tests {
        use super::*;

        #[test]
        fn test_unique_id_roundtrip_through_string() {
            let id = UniqueId::new();
            let parsed: UniqueId = id.to_string().parse().unwrap();
            assert_eq!(id, parsed);
        }

        #[test]
        fn test_session_id_rejects_garbage() {
            let err = "not-a-uuid".parse::<SessionId>().unwrap_err();
            assert!(matches!(err, DomainError::InvalidId(_)));
        }

        #[test]
        fn test_ids_are_distinct() {
            assert_ne!(ConflictId::new(), ConflictId::new());
        }
    }

    mod relative_path_tests {
        use super::*;

        #[test]
        fn test_normalizes_separators() {
            let p = RelativePath::new("docs\\reports//2024/./q1.pdf").unwrap();
            assert_eq!(p.as_str(), "docs/reports/2024/q1.pdf");
            assert_eq!(p.depth(), 4);
            assert_eq!(p.file_name(), "q1.pdf");
        }

        #[test]
        fn test_rejects_traversal_and_absolute() {
            assert!(RelativePath::new("a/../b").is_err());
            assert!(RelativePath::new("/etc/passwd").is_err());
        }

        #[test]
        fn test_root_properties() {
            let root = RelativePath::root();
            assert!(root.is_root());
            assert_eq!(root.depth(), 0);
            assert_eq!(root.parent(), None);
            assert_eq!(root.to_string(), ".");
            assert_eq!(RelativePath::new("").unwrap(), root);
        }

        #[test]
        fn test_parent_and_join() {
            let p = RelativePath::new("a/b/c.txt").unwrap();
            assert_eq!(p.parent().unwrap().as_str(), "a/b");
            assert_eq!(
                RelativePath::new("top").unwrap().parent().unwrap(),
                RelativePath::root()
            );
            assert_eq!(
                RelativePath::root().join("x").unwrap().as_str(),
                "x"
            );
            assert!(p.join("bad/name").is_err());
            assert_eq!(p.with_file_name("d.txt").unwrap().as_str(), "a/b/d.txt");
        }

        #[test]
        fn test_starts_with_respects_component_boundaries() {
            let p = RelativePath::new("photos/2024/img.jpg").unwrap();
            assert!(p.starts_with(&RelativePath::new("photos").unwrap()));
            assert!(p.starts_with(&RelativePath::root()));
            assert!(!p.starts_with(&RelativePath::new("photo").unwrap()));
            assert!(p.is_descendant_of(&RelativePath::new("photos/2024").unwrap()));
            assert!(!p.is_descendant_of(&p));
        }

        #[test]
        fn test_rebase() {
            let p = RelativePath::new("old/sub/file.txt").unwrap();
            let rebased = p
                .rebase(
                    &RelativePath::new("old").unwrap(),
                    &RelativePath::new("new/place").unwrap(),
                )
                .unwrap();
            assert_eq!(rebased.as_str(), "new/place/sub/file.txt");
            assert!(p
                .rebase(&RelativePath::new("other").unwrap(), &RelativePath::root())
                .is_none());
        }

        #[test]
        fn test_from_absolute() {
            let root = Path::new("/home/user/Drive");
            let rel =
                RelativePath::from_absolute(root, Path::new("/home/user/Drive/a/b.txt")).unwrap();
            assert_eq!(rel.as_str(), "a/b.txt");
            assert!(RelativePath::from_absolute(root, Path::new("/tmp/x")).is_err());
            assert_eq!(rel.to_path(root), PathBuf::from("/home/user/Drive/a/b.txt"));
        }

        #[test]
        fn test_serde_roundtrip() {
            let p = RelativePath::new("a/b").unwrap();
            let json = serde_json::to_string(&p).unwrap();
            assert_eq!(json, "\"a/b\"");
            let back: RelativePath = serde_json::from_str(&json).unwrap();
            assert_eq!(back, p);
            assert!(serde_json::from_str::<RelativePath>("\"../x\"").is_err());
        }
    }

    mod sync_path_tests {
        use super::*;

        #[test]
        fn test_requires_absolute() {
            assert!(SyncPath::new(PathBuf::from("relative/dir")).is_err());
        }

        #[test]
        fn test_normalizes_dots() {
            let p = SyncPath::new(PathBuf::from("/home/user/./Drive/../Sync")).unwrap();
            assert_eq!(p.as_path(), Path::new("/home/user/Sync"));
        }

        #[test]
        fn test_nesting_both_directions() {
            let outer = SyncPath::new(PathBuf::from("/home/user")).unwrap();
            let inner = SyncPath::new(PathBuf::from("/home/user/Drive")).unwrap();
            let sibling = SyncPath::new(PathBuf::from("/home/other")).unwrap();
            let prefix_only = SyncPath::new(PathBuf::from("/home/user2")).unwrap();

            assert!(outer.nests_with(&inner));
            assert!(inner.nests_with(&outer));
            assert!(!outer.nests_with(&sibling));
            assert!(!outer.nests_with(&prefix_only));
        }
    }

    mod remote_tests {
        use super::*;

        #[test]
        fn test_remote_path_trims_trailing_separator() {
            let p = RemotePath::new("/Documents/".to_string()).unwrap();
            assert_eq!(p.as_str(), "/Documents");
            assert_eq!(p.as_relative().as_str(), "Documents");
            assert!(RemotePath::root().as_relative().is_root());
        }

        #[test]
        fn test_remote_path_validation() {
            assert!(RemotePath::new("Documents".to_string()).is_err());
            assert!(RemotePath::new("/a//b".to_string()).is_err());
            assert!(RemotePath::new("/a/../b".to_string()).is_err());
        }

        #[test]
        fn test_remote_id_validation() {
            assert!(RemoteId::new("abc-123_X!9".to_string()).is_ok());
            assert!(RemoteId::new(String::new()).is_err());
            assert!(RemoteId::new("has space".to_string()).is_err());
        }

        #[test]
        fn test_file_hash_is_lowercased_hex() {
            let h = FileHash::new("ABCDEF01".to_string()).unwrap();
            assert_eq!(h.as_str(), "abcdef01");
            assert!(FileHash::new("abc".to_string()).is_err());
            assert!(FileHash::new("zz".to_string()).is_err());
            assert_eq!(FileHash::from_digest(&[0x0f, 0xa0]).as_str(), "0fa0");
        }

        #[test]
        fn test_cursor_not_empty() {
            assert!(ChangeCursor::new(String::new()).is_err());
            assert_eq!(ChangeCursor::new("42".to_string()).unwrap().as_str(), "42");
        }
    }
}
