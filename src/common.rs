use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    /// The file is a valid container but carries no CLI header
    #[error("Not a managed image: {0}")]
    NotManaged(PathBuf),

    #[error("Invalid executable image {path}: {reason}")]
    BadImage { path: PathBuf, reason: String },

    #[error("Malformed CLI metadata: {0}")]
    Malformed(String),

    #[error("Assembly not found: {0}")]
    AssemblyNotFound(String),

    #[error("Could not determine the assembly identity of {0}")]
    MissingIdentity(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Scan context building error: {0}")]
    ContextDeductionError(String),

    #[error(transparent)]
    IOError(#[from] std::io::Error),
    #[error(transparent)]
    PEError(#[from] pelite::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error(transparent)]
    GlobError(#[from] glob::PatternError),
    #[error("Scan task failed")]
    TaskError(#[from] tokio::task::JoinError),
}

impl ScanError {
    /// True if the file is readable but of the wrong kind for the pipeline that tried it
    pub fn is_format_mismatch(&self) -> bool {
        matches!(self, Self::NotManaged(_))
    }

    pub(crate) fn bad_image(path: &Path, reason: impl Into<String>) -> Self {
        Self::BadImage {
            path: path.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Remove the UNC prefix that canonicalization adds on Windows
pub fn decanonicalize(s: &str) -> String {
    s.strip_prefix(r"\\?\").unwrap_or(s).to_owned()
}

pub fn path_to_string<P: AsRef<Path>>(p: P) -> String {
    p.as_ref().to_string_lossy().into_owned()
}

pub fn osstring_to_string(s: &OsStr) -> String {
    s.to_string_lossy().into_owned()
}

/// Canonical path without the UNC prefix, for display
pub fn readable_canonical_path<P: AsRef<Path>>(p: P) -> Result<String, ScanError> {
    let canonical = fs_err::canonicalize(p.as_ref())?;
    Ok(decanonicalize(&path_to_string(canonical)))
}

/// Lowercase file name of a path, if it has one
pub(crate) fn file_name_lowercase(p: &Path) -> Option<String> {
    p.file_name().map(|n| osstring_to_string(n).to_lowercase())
}
