//! Conflict copy and rescue naming
//!
//! Conflict copies follow `stem (conflicted copy YYYY-MM-DD HHMMSS).ext`,
//! with ` (2)`, ` (3)`... appended to the stem on collision. Rescued items
//! keep their name at the session root, or become `name (1).ext`,
//! `name (2).ext`... when that name is taken.
//!
//! Every generated name respects the configured maximum name length: the
//! stem is shortened, the extension and suffix are kept.

use chrono::{DateTime, Utc};
use kdsync_core::domain::{DomainError, RelativePath};

/// Upper bound on numbered candidates before giving up
const MAX_ATTEMPTS: u32 = 9999;

/// Generates names for conflict copies and rescued items
#[derive(Debug, Clone, Copy)]
pub struct ConflictNamer {
    max_name_length: usize,
}

impl ConflictNamer {
    pub fn new(max_name_length: usize) -> Self {
        Self {
            max_name_length: max_name_length.max(1),
        }
    }

    /// Conflict copy name for `original_name` at `at`
    ///
    /// Given "report.docx", produces "report (conflicted copy 2026-02-07 142501).docx"
    pub fn conflict_copy_name(&self, original_name: &str, at: DateTime<Utc>) -> String {
        let (stem, ext) = split_extension(original_name);
        let suffix = format!(" (conflicted copy {})", at.format("%Y-%m-%d %H%M%S"));
        self.compose(stem, &suffix, ext)
    }

    /// Sibling path of `original` for a conflict copy that does not exist yet
    ///
    /// # Errors
    /// Returns `DomainError::ValidationFailed` if no free name is found.
    pub fn conflict_copy_path<F>(
        &self,
        original: &RelativePath,
        at: DateTime<Utc>,
        mut exists: F,
    ) -> Result<RelativePath, DomainError>
    where
        F: FnMut(&RelativePath) -> bool,
    {
        let base = self.conflict_copy_name(original.file_name(), at);
        let candidate = original.with_file_name(&base)?;
        if !exists(&candidate) {
            return Ok(candidate);
        }

        let (stem, ext) = split_extension(original.file_name());
        let copy_suffix = format!(" (conflicted copy {})", at.format("%Y-%m-%d %H%M%S"));
        for n in 2..=MAX_ATTEMPTS {
            let name = self.compose(stem, &format!("{copy_suffix} ({n})"), ext);
            let candidate = original.with_file_name(&name)?;
            if !exists(&candidate) {
                return Ok(candidate);
            }
        }
        Err(DomainError::ValidationFailed(format!(
            "No free conflict copy name for {original}"
        )))
    }

    /// Root-level path for rescuing `original`
    ///
    /// # Errors
    /// Returns `DomainError::ValidationFailed` if no free name is found.
    pub fn rescue_path<F>(
        &self,
        original: &RelativePath,
        mut exists: F,
    ) -> Result<RelativePath, DomainError>
    where
        F: FnMut(&RelativePath) -> bool,
    {
        let name = original.file_name();
        let (stem, ext) = split_extension(name);

        let plain = RelativePath::new(self.compose(stem, "", ext))?;
        if &plain != original && !exists(&plain) {
            return Ok(plain);
        }

        for n in 1..=MAX_ATTEMPTS {
            let candidate = RelativePath::new(self.compose(stem, &format!(" ({n})"), ext))?;
            if &candidate != original && !exists(&candidate) {
                return Ok(candidate);
            }
        }
        Err(DomainError::ValidationFailed(format!(
            "No free rescue name for {original}"
        )))
    }

    /// `stem + suffix + ext`, shortening the stem to fit the length limit
    fn compose(&self, stem: &str, suffix: &str, ext: &str) -> String {
        let fixed = suffix.chars().count() + ext.chars().count();
        let room = self.max_name_length.saturating_sub(fixed).max(1);
        let stem: String = stem.chars().take(room).collect();
        let stem = stem.trim_end();
        let stem = if stem.is_empty() { "_" } else { stem };
        format!("{stem}{suffix}{ext}")
    }
}

/// Splits "archive.tar.gz" into ("archive.tar", ".gz")
///
/// Dot files without another dot (".bashrc") have no extension.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    }
}
