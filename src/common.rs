//! Error taxonomy and small path helpers shared by the whole crate

use std::ffi::OsStr;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LookupError {
    /// The file is not a well-formed PE/COFF image (bad magic, truncated
    /// headers, unsupported machine type)
    #[error("not a valid PE image: {path}: {reason}")]
    InvalidImage { path: String, reason: String },

    /// The embedded manifest resource is not well-formed XML; the original
    /// text is carried along for diagnostics
    #[error("malformed embedded manifest: {source}")]
    MalformedManifest {
        source: roxmltree::Error,
        content: String,
    },

    /// An OS-maintained table (ApiSet schema, KnownDlls) could not be read
    #[error("system table unavailable: {0}")]
    SystemTable(String),

    /// Filesystem scan error during resolution
    #[error("scan error: {0}")]
    ScanError(String),

    #[error("could not demangle symbol {0}")]
    DemanglingError(String),

    #[error(transparent)]
    IOError(#[from] std::io::Error),
    #[error(transparent)]
    PEError(#[from] pelite::Error),
}

/// Convert a path to a string, lossily if needed
pub fn path_to_string<P: AsRef<Path>>(path: P) -> String {
    path.as_ref().to_string_lossy().into_owned()
}

/// Convert an OsStr to a string, lossily if needed
pub fn osstring_to_string(s: &OsStr) -> String {
    s.to_string_lossy().into_owned()
}

/// Strip the Windows extended-length prefix that canonicalization introduces
pub fn decanonicalize(s: &str) -> String {
    s.replacen(r"\\?\", "", 1)
}

/// Canonical path as a printable string, without the `\\?\` prefix
pub fn readable_canonical_path<P: AsRef<Path>>(p: P) -> Result<String, LookupError> {
    let canonical = fs_err::canonicalize(p.as_ref())?;
    Ok(decanonicalize(&path_to_string(canonical)))
}

/// Lowercase base file name of a path or DLL reference
pub fn lowercase_file_name<P: AsRef<Path>>(p: P) -> String {
    p.as_ref()
        .file_name()
        .map(|s| osstring_to_string(s))
        .unwrap_or_else(|| path_to_string(p.as_ref()))
        .to_lowercase()
}
