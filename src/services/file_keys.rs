//! Translation between package-relative paths and repository file keys.
//!
//! The repository keeps files of a record in a flat namespace and `/` does not
//! survive in URLs, so path separators are replaced by a fixed token.

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Stand-in for `/` inside file keys.
pub const SEPARATOR_TOKEN: &str = "-0-0-";

const MAX_FILE_KEY_LEN: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FileKeyError {
    #[error("file path `{0}` cannot be encoded as a file key")]
    Unencodable(String),
    #[error("file key `{0}` does not decode to a safe relative path")]
    Unsafe(String),
}

/// Encode a package-relative path as a file key.
///
/// Strips a leading `./`, normalizes `\` to `/` and replaces separators with
/// [`SEPARATOR_TOKEN`]. Paths that step outside the package, or whose key
/// would not decode back to the same path, are rejected.
pub fn encode(path: &str) -> Result<String, FileKeyError> {
    let normalized = path.replace('\\', "/");
    let trimmed = normalized.strip_prefix("./").unwrap_or(&normalized);
    if trimmed.is_empty() || trimmed.starts_with('/') {
        return Err(FileKeyError::Unencodable(path.to_string()));
    }
    let mut parts = Vec::new();
    for part in trimmed.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        if part == ".." || part.contains(SEPARATOR_TOKEN) {
            return Err(FileKeyError::Unencodable(path.to_string()));
        }
        parts.push(part);
    }
    if parts.is_empty() {
        return Err(FileKeyError::Unencodable(path.to_string()));
    }
    let key = parts.join(SEPARATOR_TOKEN);
    // parts ending in `-0-0` or starting with `0-0-` fuse with the token
    if key.len() > MAX_FILE_KEY_LEN || decode(&key) != parts.join("/") {
        return Err(FileKeyError::Unencodable(path.to_string()));
    }
    Ok(key)
}

/// Decode a file key back into a `/`-separated relative path.
pub fn decode(key: &str) -> String {
    key.replace(SEPARATOR_TOKEN, "/")
}

/// Decode a file key into a relative filesystem path.
///
/// Rejects keys that would escape the target directory, the same way object
/// keys are checked before touching disk.
pub fn to_relative_path(key: &str) -> Result<PathBuf, FileKeyError> {
    if key.is_empty()
        || key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(FileKeyError::Unsafe(key.to_string()));
    }
    let mut path = PathBuf::new();
    for part in key.split(SEPARATOR_TOKEN) {
        let component = Path::new(part);
        match component.components().collect::<Vec<_>>().as_slice() {
            [Component::Normal(_)] => path.push(part),
            _ => return Err(FileKeyError::Unsafe(key.to_string())),
        }
    }
    Ok(path)
}
