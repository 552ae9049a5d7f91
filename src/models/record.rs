//! Remote record representations as exchanged with the repository.

use super::metadata::Metadata;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    Public,
    Restricted,
}

/// Access-mode pair of a record: metadata visibility and file visibility.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Access {
    pub record: AccessType,
    pub files: AccessType,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct FilesOptions {
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_preview: Option<String>,
}

/// A draft or published record.
///
/// Drafts are created without an id; the repository assigns one.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DraftRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub access: Access,

    #[serde(default)]
    pub files: FilesOptions,

    pub metadata: Metadata,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_published: bool,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub links: BTreeMap<String, String>,
}

impl DraftRecord {
    pub fn new(access: Access, files: FilesOptions, metadata: Metadata) -> Self {
        Self {
            id: None,
            access,
            files,
            metadata,
            is_published: false,
            links: BTreeMap::new(),
        }
    }
}

/// One file of a record's manifest.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct FileEntry {
    #[serde(default)]
    pub key: String,

    /// `algorithm:hexdigest`, present once the upload is committed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl FileEntry {
    pub fn pending(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }
}

/// A record's file manifest.
///
/// The repository answers with `entries` either as a list or as an object
/// keyed by file key. Both shapes deserialize into the same ordered list so
/// nothing past this boundary has to care.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(from = "RawManifest")]
pub struct FileManifest {
    pub entries: Vec<FileEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_preview: Option<String>,
}

#[derive(Deserialize)]
struct RawManifest {
    #[serde(default)]
    entries: Option<RawEntries>,
    #[serde(default)]
    default_preview: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEntries {
    List(Vec<FileEntry>),
    Keyed(BTreeMap<String, FileEntry>),
}

impl From<RawManifest> for FileManifest {
    fn from(raw: RawManifest) -> Self {
        let entries = match raw.entries {
            None => Vec::new(),
            Some(RawEntries::List(list)) => list,
            Some(RawEntries::Keyed(map)) => map
                .into_iter()
                .map(|(key, mut entry)| {
                    if entry.key.is_empty() {
                        entry.key = key;
                    }
                    entry
                })
                .collect(),
        };
        Self {
            entries,
            default_preview: raw.default_preview,
        }
    }
}

impl FileManifest {
    /// (key, checksum) pairs in manifest order.
    pub fn checksums(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries
            .iter()
            .map(|e| (e.key.as_str(), e.checksum.as_deref()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parameters for listing the user's records.
#[derive(Clone, Debug)]
pub struct RecordQuery {
    pub q: Option<String>,
    pub page: u32,
    pub size: u32,
}

impl RecordQuery {
    /// Query matching an exact title phrase.
    pub fn by_title(title: &str, page: u32, size: u32) -> Self {
        let escaped = title.replace('\\', "\\\\").replace('"', "\\\"");
        Self {
            q: Some(format!("metadata.title:\"{}\"", escaped)),
            page,
            size,
        }
    }

    pub fn all(page: u32, size: u32) -> Self {
        Self { q: None, page, size }
    }
}

/// One page of a record listing.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct RecordPage {
    pub hits: Vec<DraftRecord>,
    pub total: u64,
}
