//! Rebuilds a local file tree from a published record tree.

use crate::{
    models::{metadata::HAS_PART, report::Report},
    services::{
        checksum::verify_file,
        file_keys,
        repository::{Repository, RepositoryResult, find_record_by_title, record_id_from_url},
    },
};
use serde::Serialize;
use std::{collections::HashSet, path::Path};
use tracing::{debug, info};

const FUNCTION: &str = "Mirror";

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MirrorSummary {
    pub records: usize,
    pub files: usize,
    pub checksum_failures: usize,
}

/// Id of the record titled exactly `title`, if any.
pub async fn resolve_title(repo: &dyn Repository, title: &str) -> RepositoryResult<Option<String>> {
    Ok(find_record_by_title(repo, title)
        .await?
        .and_then(|record| record.id))
}

/// Download `root_id` and every `haspart` descendant into `dest`.
///
/// Files land at their decoded key below `dest`. Checksum failures are
/// reported and counted but do not stop the walk; remote errors do.
pub async fn download_tree(
    repo: &dyn Repository,
    root_id: &str,
    dest: &Path,
    report: &mut Report,
) -> RepositoryResult<MirrorSummary> {
    let mut summary = MirrorSummary::default();
    let mut visited = HashSet::new();
    let mut pending = vec![root_id.to_string()];

    while let Some(id) = pending.pop() {
        if !visited.insert(id.clone()) {
            continue;
        }
        let record = repo.get_record(&id).await?;
        info!("Downloading record {} (\"{}\")", id, record.metadata.title);
        summary.records += 1;

        let manifest = repo.list_record_files(&id).await?;
        for entry in &manifest.entries {
            let relative = match file_keys::to_relative_path(&entry.key) {
                Ok(relative) => relative,
                Err(err) => {
                    report.add_error(FUNCTION, &err, &format!("Skipping file of record {}", id));
                    summary.checksum_failures += 1;
                    continue;
                }
            };
            let target = dest.join(&relative);
            let bytes = repo.download_file(&id, &entry.key, &target).await?;
            summary.files += 1;
            debug!("wrote {} bytes to {}", bytes, target.display());

            let Some(checksum) = entry.checksum.as_deref() else {
                report.add_warning(
                    FUNCTION,
                    format!("No checksum for {} in record {}", entry.key, id),
                );
                continue;
            };
            match verify_file(&target, checksum).await {
                Ok(true) => {}
                Ok(false) => {
                    report.add_critical(
                        FUNCTION,
                        format!("Checksum mismatch for {}", relative.display()),
                    );
                    summary.checksum_failures += 1;
                }
                Err(err) => {
                    report.add_error(
                        FUNCTION,
                        &err,
                        &format!("Could not verify {}", relative.display()),
                    );
                    summary.checksum_failures += 1;
                }
            }
        }

        // reversed so that children are visited in relation order
        let mut children: Vec<String> = record
            .metadata
            .related_of(HAS_PART)
            .filter_map(record_id_from_url)
            .filter(|child| !visited.contains(*child))
            .map(str::to_string)
            .collect();
        children.reverse();
        pending.extend(children);
    }

    if summary.checksum_failures == 0 {
        report.add_correct(
            FUNCTION,
            format!(
                "Downloaded {} files from {} records",
                summary.files, summary.records
            ),
        );
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        metadata::{Metadata, RelatedIdentifier},
        record::{Access, AccessType, DraftRecord, FilesOptions},
    };
    use crate::services::memory_repository::MemoryRepository;
    use bytes::Bytes;

    fn publish_with(
        repo: &MemoryRepository,
        title: &str,
        files: &[(&str, &'static [u8])],
        parts: &[&str],
    ) -> String {
        let mut draft = DraftRecord::new(
            Access {
                record: AccessType::Public,
                files: AccessType::Public,
            },
            FilesOptions {
                enabled: !files.is_empty(),
                default_preview: None,
            },
            Metadata::new("dataset", vec![], title, "2024"),
        );
        for part in parts {
            draft
                .metadata
                .add_related(RelatedIdentifier::url(repo.record_url(part), HAS_PART));
        }
        let id = repo.insert_draft(&draft).id.unwrap();
        for (key, content) in files {
            repo.begin_files(&id, &[key.to_string()]).unwrap();
            repo.write_content(&id, key, Bytes::from_static(content)).unwrap();
            repo.commit_file(&id, key).unwrap();
        }
        repo.publish(&id).unwrap();
        id
    }

    #[tokio::test]
    async fn downloads_nested_records() {
        let repo = MemoryRepository::new("http://sandbox");
        let child = publish_with(
            &repo,
            "Corpus A: Session 1",
            &[("data-0-0-s1-0-0-a.txt", &b"alpha"[..])],
            &[],
        );
        let root = publish_with(
            &repo,
            "Corpus A",
            &[("data-0-0-Metadata-0-0-metadata.json", &b"{}"[..])],
            &[child.as_str()],
        );

        let dest = tempfile::tempdir().unwrap();
        let mut report = Report::new();
        let summary = download_tree(&repo, &root, dest.path(), &mut report).await.unwrap();
        assert_eq!(
            summary,
            MirrorSummary {
                records: 2,
                files: 2,
                checksum_failures: 0
            }
        );
        assert_eq!(std::fs::read(dest.path().join("data/s1/a.txt")).unwrap(), b"alpha");
        assert!(dest.path().join("data/Metadata/metadata.json").is_file());
        assert!(!report.has_critical());

        assert_eq!(resolve_title(&repo, "Corpus A").await.unwrap(), Some(root));
        assert_eq!(resolve_title(&repo, "Corpus").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cyclic_parts_are_visited_once() {
        let repo = MemoryRepository::new("http://sandbox");
        // a record claiming to be its own part
        let mut draft = DraftRecord::new(
            Access {
                record: AccessType::Public,
                files: AccessType::Public,
            },
            FilesOptions::default(),
            Metadata::new("dataset", vec![], "Loop", "2024"),
        );
        let id = repo.insert_draft(&draft).id.unwrap();
        draft
            .metadata
            .add_related(RelatedIdentifier::url(repo.record_url(&id), HAS_PART));
        repo.replace_draft(&id, &draft).unwrap();
        repo.publish(&id).unwrap();

        let dest = tempfile::tempdir().unwrap();
        let mut report = Report::new();
        let summary = download_tree(&repo, &id, dest.path(), &mut report).await.unwrap();
        assert_eq!(summary.records, 1);
    }

    #[tokio::test]
    async fn unknown_record_is_an_error() {
        let repo = MemoryRepository::new("http://sandbox");
        let dest = tempfile::tempdir().unwrap();
        let mut report = Report::new();
        assert!(
            download_tree(&repo, "nope-1", dest.path(), &mut report)
                .await
                .unwrap_err()
                .is_not_found()
        );
    }
}
