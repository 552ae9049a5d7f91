//! Resolve the record map of a package and check it against the files on disk.

use crate::models::{
    mapping::{MapFile, MapRecord},
    report::Report,
};
use std::{
    collections::BTreeSet,
    io,
    path::{Component, Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

const FUNCTION: &str = "Mapping";

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("failed to read record map {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse record map {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("record map has no metadata file for the root record")]
    MissingRootMetadata,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Fixed locations inside a package.
#[derive(Clone, Debug)]
pub struct PackageLayout {
    /// Payload directory, relative to the package root.
    pub data_dir: String,
    /// Root metadata file used when no record map exists.
    pub metadata_file: String,
    /// Optional explicit record map.
    pub record_map: String,
}

impl Default for PackageLayout {
    fn default() -> Self {
        Self {
            data_dir: "data".into(),
            metadata_file: "data/Metadata/metadata.json".into(),
            record_map: "recordmap.json".into(),
        }
    }
}

impl PackageLayout {
    /// Extension (with leading dot) that marks a file as the default preview.
    pub fn metadata_extension(&self) -> String {
        Path::new(&self.metadata_file)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default()
    }
}

/// Load the record map of a package, synthesizing one if none is present.
///
/// The synthesized map is a single root record whose metadata is the layout's
/// metadata file and whose files are every other regular file of the payload
/// directory, each tagged with `files_public`.
pub fn load_mapping(
    package: &Path,
    layout: &PackageLayout,
    files_public: bool,
    separate_private_records: bool,
) -> Result<MapRecord, MappingError> {
    let map_path = package.join(&layout.record_map);
    let mapping = if map_path.is_file() {
        info!("Reading record map {}", map_path.display());
        let raw = std::fs::read(&map_path).map_err(|source| MappingError::Read {
            path: map_path.clone(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| MappingError::Parse {
            path: map_path.clone(),
            source,
        })?
    } else {
        info!("No record map in {}, synthesizing one", package.display());
        synthesize_mapping(package, layout, files_public)?
    };

    if mapping.metadata_file().is_none() {
        return Err(MappingError::MissingRootMetadata);
    }

    Ok(if separate_private_records {
        mapping.separate_private_files()
    } else {
        mapping
    })
}

fn synthesize_mapping(
    package: &Path,
    layout: &PackageLayout,
    files_public: bool,
) -> Result<MapRecord, MappingError> {
    let metadata_abs = canonical_or_absolute(&package.join(&layout.metadata_file));
    let data_dir = package.join(&layout.data_dir);
    let mut files = Vec::new();
    for file in list_files(&data_dir)? {
        if canonical_or_absolute(&file) == metadata_abs {
            continue;
        }
        let relative = file.strip_prefix(package).unwrap_or(&file);
        files.push(MapFile::new(to_slash_path(relative), Some(files_public)));
    }
    Ok(MapRecord {
        title: None,
        metadata: Some(layout.metadata_file.clone()),
        files,
        records: Vec::new(),
    })
}

/// Check that the map covers exactly the files of the payload directory.
///
/// Differences in either direction are reported as critical entries and make
/// the result `false`. Nothing is corrected.
pub fn validate_mapping(
    package: &Path,
    layout: &PackageLayout,
    mapping: &MapRecord,
    report: &mut Report,
) -> Result<bool, MappingError> {
    let present: BTreeSet<PathBuf> = list_files(&package.join(&layout.data_dir))?
        .iter()
        .map(|p| canonical_or_absolute(p))
        .collect();
    let expected: BTreeSet<PathBuf> = mapping
        .referenced_paths()
        .into_iter()
        .map(|p| canonical_or_absolute(&package.join(p)))
        .collect();

    let unexpected: Vec<String> = present
        .difference(&expected)
        .map(|p| p.display().to_string())
        .collect();
    let missing: Vec<String> = expected
        .difference(&present)
        .map(|p| p.display().to_string())
        .collect();

    if !unexpected.is_empty() {
        report.add_critical(
            FUNCTION,
            format!("Unexpected files in path: {}", unexpected.join(", ")),
        );
    }
    if !missing.is_empty() {
        report.add_critical(
            FUNCTION,
            format!("Expected files missing in path: {}", missing.join(", ")),
        );
    }
    debug!(
        present = present.len(),
        expected = expected.len(),
        "compared record map against payload"
    );
    Ok(unexpected.is_empty() && missing.is_empty())
}

/// Recursively list regular files below `root`, sorted.
///
/// A missing directory yields an empty list. Symlinks to files are listed;
/// symlinked directories are not descended into.
pub fn list_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        for entry in entries {
            let path = entry?.path();
            let meta = std::fs::symlink_metadata(&path)?;
            if meta.file_type().is_symlink() {
                if std::fs::metadata(&path).is_ok_and(|target| target.is_file()) {
                    files.push(path);
                } else {
                    debug!("not following symlink {}", path.display());
                }
            } else if meta.is_dir() {
                pending.push(path);
            } else if meta.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Canonical path when the file exists, otherwise a lexically cleaned absolute
/// path so that missing files still compare sensibly.
fn canonical_or_absolute(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut cleaned = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other),
        }
    }
    cleaned
}

fn to_slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{write_file, PackageBuilder};

    #[test]
    fn synthesizes_single_root_record() {
        let pkg = PackageBuilder::new("Corpus A")
            .file("data/b.txt", "b")
            .file("data/sub/a.txt", "a")
            .build();

        let layout = PackageLayout::default();
        let mapping = load_mapping(pkg.path(), &layout, false, false).unwrap();
        assert_eq!(mapping.metadata_file(), Some("data/Metadata/metadata.json"));
        let names: Vec<_> = mapping.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["data/b.txt", "data/sub/a.txt"]);
        assert!(mapping.files.iter().all(|f| f.public == Some(false)));
        assert!(mapping.records.is_empty());

        let mut report = Report::new();
        assert!(validate_mapping(pkg.path(), &layout, &mapping, &mut report).unwrap());
        assert!(!report.has_critical());
    }

    #[test]
    fn extra_file_on_disk_fails_validation() {
        let pkg = PackageBuilder::new("Corpus A").file("data/a.txt", "a").build();
        let layout = PackageLayout::default();
        let mapping = load_mapping(pkg.path(), &layout, true, false).unwrap();

        write_file(pkg.path(), "data/late.txt", "surprise");
        let mut report = Report::new();
        assert!(!validate_mapping(pkg.path(), &layout, &mapping, &mut report).unwrap());
        assert_eq!(report.critical_count(), 1);
        assert!(report.items[0].message.starts_with("Unexpected files in path"));
        assert!(report.items[0].message.contains("late.txt"));
    }

    #[test]
    fn missing_file_fails_validation() {
        let pkg = PackageBuilder::new("Corpus A")
            .file("data/a.txt", "a")
            .file("data/b.txt", "b")
            .build();
        let layout = PackageLayout::default();
        let mapping = load_mapping(pkg.path(), &layout, true, false).unwrap();

        std::fs::remove_file(pkg.path().join("data/b.txt")).unwrap();
        let mut report = Report::new();
        assert!(!validate_mapping(pkg.path(), &layout, &mapping, &mut report).unwrap());
        assert_eq!(report.critical_count(), 1);
        assert!(report.items[0].message.starts_with("Expected files missing in path"));
    }

    #[test]
    fn explicit_record_map_is_used_verbatim() {
        let pkg = PackageBuilder::new("Corpus A")
            .file("data/s1/a.txt", "a")
            .file("data/s1/b.txt", "b")
            .record_map(
                r#"{"metadata": "./data/Metadata/metadata.json",
                    "records": [{"title": "Session 1",
                                 "files": [{"name": "data/s1/a.txt", "public": true},
                                           {"name": "data/s1/b.txt", "public": true}]}]}"#,
            )
            .build();
        let layout = PackageLayout::default();
        let mapping = load_mapping(pkg.path(), &layout, false, false).unwrap();
        assert_eq!(mapping.records.len(), 1);
        assert_eq!(mapping.records[0].title_suffix(), Some("Session 1"));

        // recordmap.json sits outside data/ and is not part of the payload check
        let mut report = Report::new();
        assert!(validate_mapping(pkg.path(), &layout, &mapping, &mut report).unwrap());
    }

    #[test]
    fn malformed_record_map_is_a_parse_error() {
        let pkg = PackageBuilder::new("Corpus A").record_map("{ nope").build();
        let err = load_mapping(pkg.path(), &PackageLayout::default(), true, false).unwrap_err();
        assert!(matches!(err, MappingError::Parse { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn listing_does_not_follow_directory_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "data/a.txt", "a");
        std::os::unix::fs::symlink(dir.path().join("data"), dir.path().join("data/loop")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("data/a.txt"), dir.path().join("data/b.txt"))
            .unwrap();

        let files = list_files(&dir.path().join("data")).unwrap();
        assert_eq!(
            files,
            vec![dir.path().join("data/a.txt"), dir.path().join("data/b.txt")]
        );
    }

    #[test]
    fn metadata_extension_comes_from_layout() {
        assert_eq!(PackageLayout::default().metadata_extension(), ".json");
    }
}
