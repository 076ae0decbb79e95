//! Platform name validation
//!
//! Every action that introduces a name on one side is checked against the
//! naming rules of the target platform before it runs. Violations route the
//! item to the blacklist instead.
//!
//! Checks, in order:
//! 1. empty or only-spaces name
//! 2. reserved names (`.`, `..`; Windows device names and trailing dots)
//! 3. forbidden characters of the target OS
//! 4. trailing space (Windows)
//! 5. name length in bytes
//! 6. path length in characters
//!
//! Case-insensitive sibling collisions need the whole tree and are checked
//! through [`SiblingIndex`].

use std::collections::HashMap;

use kdsync_core::config::{PlatformConfig, TargetOs};
use kdsync_core::domain::{BlacklistReason, RelativePath, UniqueId};

const WINDOWS_DEVICE_NAMES: [&str; 4] = ["CON", "PRN", "AUX", "NUL"];
const WINDOWS_FORBIDDEN: [char; 9] = ['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// Validates names and paths against the target platform
#[derive(Debug, Clone)]
pub struct NameValidator {
    target_os: TargetOs,
    max_name_length: usize,
    max_path_length: usize,
}

impl NameValidator {
    pub fn new(config: &PlatformConfig) -> Self {
        Self {
            target_os: config.target_os,
            max_name_length: config.max_name_length,
            max_path_length: config.effective_max_path_length(),
        }
    }

    /// Checks a single name component
    pub fn check_name(&self, name: &str) -> Result<(), BlacklistReason> {
        if name.is_empty() || name.chars().all(|c| c == ' ') {
            return Err(BlacklistReason::UnsupportedCharacter);
        }
        if self.is_reserved(name) {
            return Err(BlacklistReason::ReservedName);
        }
        if name.chars().any(|c| self.is_forbidden(c)) {
            return Err(BlacklistReason::UnsupportedCharacter);
        }
        if self.target_os == TargetOs::Windows && name.ends_with(' ') {
            return Err(BlacklistReason::UnsupportedCharacter);
        }
        if name.len() > self.max_name_length {
            return Err(BlacklistReason::NameTooLong);
        }
        Ok(())
    }

    /// Checks the last component and the full length of `path`
    pub fn check_path(&self, path: &RelativePath) -> Result<(), BlacklistReason> {
        self.check_name(path.file_name())?;
        if path.as_str().chars().count() > self.max_path_length {
            return Err(BlacklistReason::PathTooLong);
        }
        Ok(())
    }

    fn is_reserved(&self, name: &str) -> bool {
        if name == "." || name == ".." {
            return true;
        }
        if self.target_os != TargetOs::Windows {
            return false;
        }
        if name.ends_with('.') {
            return true;
        }
        let stem = name.split('.').next().unwrap_or(name).to_ascii_uppercase();
        if WINDOWS_DEVICE_NAMES.contains(&stem.as_str()) {
            return true;
        }
        let bytes = stem.as_bytes();
        bytes.len() == 4
            && (stem.starts_with("COM") || stem.starts_with("LPT"))
            && (b'1'..=b'9').contains(&bytes[3])
    }

    fn is_forbidden(&self, c: char) -> bool {
        match self.target_os {
            TargetOs::Linux => c == '/' || c == '\0',
            TargetOs::Macos => c == '/' || c == ':' || c == '\0',
            TargetOs::Windows => WINDOWS_FORBIDDEN.contains(&c) || c.is_control(),
        }
    }
}

impl Default for NameValidator {
    fn default() -> Self {
        Self::new(&PlatformConfig::default())
    }
}

// ============================================================================
// SiblingIndex
// ============================================================================

/// Case-folded paths and the item owning each
///
/// The first item to claim a folded path owns it; a later item landing on
/// the same folded path is a case-insensitive duplicate.
#[derive(Debug, Clone, Default)]
pub struct SiblingIndex {
    owners: HashMap<String, UniqueId>,
}

impl SiblingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `path` for `item`, returning false if another item owns it
    pub fn claim(&mut self, path: &RelativePath, item: UniqueId) -> bool {
        if path.is_root() {
            return true;
        }
        let owner = self.owners.entry(path.folded()).or_insert(item);
        *owner == item
    }

    /// Whether `path` collides with a name owned by another item
    pub fn collides(&self, path: &RelativePath, item: &UniqueId) -> bool {
        self.owners
            .get(&path.folded())
            .is_some_and(|owner| owner != item)
    }

    /// Drops every claim of `item`
    pub fn release(&mut self, item: &UniqueId) {
        self.owners.retain(|_, owner| owner != item);
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}
