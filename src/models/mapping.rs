//! The record map: how local files of a package are laid out over a tree of
//! repository records.
//!
//! A map is either read from the package's `recordmap.json` or synthesized by
//! [`crate::services::mapping_service`]. All paths are relative to the package
//! root.

use super::record::{Access, AccessType};
use serde::{Deserialize, Serialize};

/// Title suffix of the child record holding split-off private files.
pub const PRIVATE_FILES_SUFFIX: &str = "Private files";

/// A local file assigned to a record.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MapFile {
    pub name: String,

    /// Missing means "no explicit marking", which counts as public.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public: Option<bool>,
}

/// One node of the record tree; each node becomes one remote record.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct MapRecord {
    /// Appended to the inherited title as `"<title>: <suffix>"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Metadata file of this node. Without it the parent's metadata is inherited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,

    #[serde(default)]
    pub files: Vec<MapFile>,

    #[serde(default)]
    pub records: Vec<MapRecord>,
}

impl MapFile {
    pub fn new(name: impl Into<String>, public: Option<bool>) -> Self {
        Self {
            name: name.into(),
            public,
        }
    }

    pub fn is_public(&self) -> bool {
        self.public.unwrap_or(true)
    }
}

impl MapRecord {
    /// Title suffix, ignoring empty strings.
    pub fn title_suffix(&self) -> Option<&str> {
        self.title.as_deref().filter(|t| !t.is_empty())
    }

    /// Metadata file path, ignoring empty strings.
    pub fn metadata_file(&self) -> Option<&str> {
        self.metadata.as_deref().filter(|m| !m.is_empty())
    }

    /// Access pair for the record created from this node.
    ///
    /// Metadata is always public; files are public only when every file is.
    pub fn access(&self) -> Access {
        let files = if self.files.iter().all(MapFile::is_public) {
            AccessType::Public
        } else {
            AccessType::Restricted
        };
        Access {
            record: AccessType::Public,
            files,
        }
    }

    /// Whether the record will carry any files at all.
    pub fn has_files(&self) -> bool {
        !self.files.is_empty() || self.metadata_file().is_some()
    }

    /// Every path referenced by this node and its descendants.
    pub fn referenced_paths(&self) -> Vec<&str> {
        let mut paths = Vec::new();
        self.collect_paths(&mut paths);
        paths
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a str>) {
        if let Some(metadata) = self.metadata_file() {
            out.push(metadata);
        }
        out.extend(self.files.iter().map(|f| f.name.as_str()));
        for child in &self.records {
            child.collect_paths(out);
        }
    }

    /// Number of records the tree will produce.
    pub fn node_count(&self) -> usize {
        1 + self.records.iter().map(MapRecord::node_count).sum::<usize>()
    }

    /// Move private files of mixed nodes into a dedicated child record.
    ///
    /// Nodes with only public or only private files are left alone. The split
    /// child inherits the node's metadata rather than re-uploading the file.
    pub fn separate_private_files(self) -> MapRecord {
        let (private, public): (Vec<MapFile>, Vec<MapFile>) =
            self.files.into_iter().partition(|f| !f.is_public());

        let mut records: Vec<MapRecord> = Vec::new();
        let files = if !private.is_empty() && !public.is_empty() {
            records.push(MapRecord {
                title: Some(PRIVATE_FILES_SUFFIX.to_string()),
                metadata: None,
                files: private,
                records: Vec::new(),
            });
            public
        } else {
            private.into_iter().chain(public).collect()
        };

        records.extend(
            self.records
                .into_iter()
                .map(MapRecord::separate_private_files),
        );

        MapRecord {
            title: self.title,
            metadata: self.metadata,
            files,
            records,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, public: Option<bool>) -> MapFile {
        MapFile::new(name, public)
    }

    #[test]
    fn access_is_public_only_when_all_files_are() {
        let both_public = MapRecord {
            files: vec![file("a", Some(true)), file("b", Some(true))],
            ..Default::default()
        };
        assert_eq!(both_public.access().files, AccessType::Public);
        assert_eq!(both_public.access().record, AccessType::Public);

        let mixed = MapRecord {
            files: vec![file("a", Some(true)), file("b", Some(false))],
            ..Default::default()
        };
        assert_eq!(mixed.access().files, AccessType::Restricted);
        assert_eq!(mixed.access().record, AccessType::Public);

        let untagged = MapRecord {
            files: vec![file("a", None)],
            ..Default::default()
        };
        assert_eq!(untagged.access().files, AccessType::Public);
    }

    #[test]
    fn parses_record_map_document() {
        let map: MapRecord = serde_json::from_str(
            r#"{
                "metadata": "data/Metadata/metadata.json",
                "records": [
                    {"title": "Session 1",
                     "files": [{"name": "data/s1/a.wav", "public": true},
                               {"name": "data/s1/a.eaf"}]}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(map.metadata_file(), Some("data/Metadata/metadata.json"));
        assert!(map.files.is_empty());
        assert_eq!(map.records[0].title_suffix(), Some("Session 1"));
        assert_eq!(map.records[0].files[1].public, None);
        assert_eq!(
            map.referenced_paths(),
            vec!["data/Metadata/metadata.json", "data/s1/a.wav", "data/s1/a.eaf"]
        );
        assert_eq!(map.node_count(), 2);
    }

    #[test]
    fn empty_strings_count_as_absent() {
        let node = MapRecord {
            title: Some(String::new()),
            metadata: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(node.title_suffix(), None);
        assert_eq!(node.metadata_file(), None);
        assert!(!node.has_files());
    }

    #[test]
    fn private_files_move_to_child_record() {
        let map = MapRecord {
            metadata: Some("data/m.json".into()),
            files: vec![file("data/pub.txt", Some(true)), file("data/priv.txt", Some(false))],
            records: vec![MapRecord {
                title: Some("Session".into()),
                files: vec![file("data/s/x", Some(false))],
                ..Default::default()
            }],
            ..Default::default()
        };

        let split = map.separate_private_files();
        assert_eq!(split.files, vec![file("data/pub.txt", Some(true))]);
        assert_eq!(split.records.len(), 2);
        assert_eq!(split.records[0].title_suffix(), Some(PRIVATE_FILES_SUFFIX));
        assert_eq!(split.records[0].files, vec![file("data/priv.txt", Some(false))]);
        assert_eq!(split.records[0].metadata, None);
        // only-private node is untouched
        assert_eq!(split.records[1].files, vec![file("data/s/x", Some(false))]);
        assert!(split.records[1].records.is_empty());

        let mut before = split.referenced_paths();
        before.sort();
        assert_eq!(before, vec!["data/m.json", "data/priv.txt", "data/pub.txt", "data/s/x"]);
    }
}
