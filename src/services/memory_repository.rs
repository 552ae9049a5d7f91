//! In-process repository.
//!
//! Backs the sandbox server and the tests. Records live in a shared map behind
//! a mutex; file checksums are md5, as the real service computes them on
//! commit. A few switches inject faults so failure paths can be exercised.

use crate::{
    models::record::{DraftRecord, FileEntry, FileManifest, RecordPage, RecordQuery},
    services::{
        checksum::{DigestAlgorithm, digest_bytes},
        repository::{Repository, RepositoryError, RepositoryResult},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::debug;
use uuid::Uuid;

#[derive(Clone)]
pub struct MemoryRepository {
    base_url: String,
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    records: BTreeMap<String, StoredRecord>,
    sequence: u64,
    failing_uploads: BTreeSet<String>,
    corrupted_uploads: BTreeSet<String>,
    failing_publishes: BTreeSet<String>,
    fail_deletes: bool,
}

struct StoredRecord {
    record: DraftRecord,
    files: Vec<StoredFile>,
    created: u64,
}

struct StoredFile {
    key: String,
    content: Option<Bytes>,
    checksum: Option<String>,
}

impl StoredFile {
    fn entry(&self) -> FileEntry {
        FileEntry {
            key: self.key.clone(),
            checksum: self.checksum.clone(),
            size: self.content.as_ref().map(|c| c.len() as u64),
            status: Some(if self.checksum.is_some() { "completed" } else { "pending" }.into()),
        }
    }
}

impl StoredRecord {
    fn manifest(&self) -> FileManifest {
        FileManifest {
            entries: self.files.iter().map(StoredFile::entry).collect(),
            default_preview: self.record.files.default_preview.clone(),
        }
    }
}

fn new_record_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("{}-{}", &raw[..5], &raw[5..10])
}

/// Title phrase of a `metadata.title:"..."` query.
fn title_phrase(q: &str) -> Option<String> {
    let quoted = q.strip_prefix("metadata.title:")?;
    let inner = quoted.strip_prefix('"')?.strip_suffix('"')?;
    Some(inner.replace("\\\"", "\"").replace("\\\\", "\\"))
}

impl MemoryRepository {
    /// `base_url` is only used to build record links.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make content uploads of `key` fail.
    pub fn fail_upload(&self, key: &str) {
        self.lock().failing_uploads.insert(key.to_string());
    }

    /// Store altered bytes for `key`, so its checksum no longer matches.
    pub fn corrupt_upload(&self, key: &str) {
        self.lock().corrupted_uploads.insert(key.to_string());
    }

    /// Refuse to publish drafts titled `title`.
    pub fn fail_publish(&self, title: &str) {
        self.lock().failing_publishes.insert(title.to_string());
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.lock().fail_deletes = fail;
    }

    /// Ids of unpublished drafts, in creation order.
    pub fn draft_ids(&self) -> Vec<String> {
        self.ids_where(|r| !r.record.is_published)
    }

    /// Ids of published records, in creation order.
    pub fn published_ids(&self) -> Vec<String> {
        self.ids_where(|r| r.record.is_published)
    }

    fn ids_where(&self, keep: impl Fn(&StoredRecord) -> bool) -> Vec<String> {
        let state = self.lock();
        let mut records: Vec<(&u64, &String)> = state
            .records
            .iter()
            .filter(|(_, r)| keep(r))
            .map(|(id, r)| (&r.created, id))
            .collect();
        records.sort();
        records.into_iter().map(|(_, id)| id.clone()).collect()
    }

    pub fn insert_draft(&self, draft: &DraftRecord) -> DraftRecord {
        let mut state = self.lock();
        let id = new_record_id();
        let mut record = draft.clone();
        record.id = Some(id.clone());
        record.is_published = false;
        record.links = BTreeMap::from([
            ("self".to_string(), format!("{}/api/records/{}/draft", self.base_url, id)),
            ("self_html".to_string(), format!("{}/records/{}", self.base_url, id)),
        ]);
        state.sequence += 1;
        let created = state.sequence;
        state.records.insert(
            id.clone(),
            StoredRecord {
                record: record.clone(),
                files: Vec::new(),
                created,
            },
        );
        debug!("created draft {}", id);
        record
    }

    fn with_draft<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut StoredRecord, &mut State) -> RepositoryResult<T>,
    ) -> RepositoryResult<T> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let mut stored = match state.records.remove(id) {
            Some(stored) if !stored.record.is_published => stored,
            Some(stored) => {
                state.records.insert(id.to_string(), stored);
                return Err(RepositoryError::NotFound(id.to_string()));
            }
            None => return Err(RepositoryError::NotFound(id.to_string())),
        };
        let result = f(&mut stored, state);
        state.records.insert(id.to_string(), stored);
        result
    }

    fn with_published<T>(
        &self,
        id: &str,
        f: impl FnOnce(&StoredRecord) -> RepositoryResult<T>,
    ) -> RepositoryResult<T> {
        let state = self.lock();
        match state.records.get(id) {
            Some(stored) if stored.record.is_published => f(stored),
            _ => Err(RepositoryError::NotFound(id.to_string())),
        }
    }

    pub fn read_draft(&self, id: &str) -> RepositoryResult<DraftRecord> {
        self.with_draft(id, |stored, _| Ok(stored.record.clone()))
    }

    /// Replace the editable parts of a draft: access, file options and metadata.
    pub fn replace_draft(&self, id: &str, draft: &DraftRecord) -> RepositoryResult<DraftRecord> {
        self.with_draft(id, |stored, _| {
            stored.record.access = draft.access;
            stored.record.files = draft.files.clone();
            stored.record.metadata = draft.metadata.clone();
            Ok(stored.record.clone())
        })
    }

    pub fn begin_files(&self, id: &str, keys: &[String]) -> RepositoryResult<FileManifest> {
        self.with_draft(id, |stored, _| {
            if !stored.record.files.enabled {
                return Err(RepositoryError::Rejected(format!(
                    "files are disabled on draft {}",
                    id
                )));
            }
            for key in keys {
                if stored.files.iter().any(|f| &f.key == key) {
                    return Err(RepositoryError::Rejected(format!(
                        "file `{}` already exists in draft {}",
                        key, id
                    )));
                }
            }
            stored.files.extend(keys.iter().map(|key| StoredFile {
                key: key.clone(),
                content: None,
                checksum: None,
            }));
            Ok(stored.manifest())
        })
    }

    pub fn write_content(&self, id: &str, key: &str, content: Bytes) -> RepositoryResult<()> {
        self.with_draft(id, |stored, state| {
            if state.failing_uploads.contains(key) {
                return Err(RepositoryError::Rejected(format!(
                    "upload of `{}` refused",
                    key
                )));
            }
            let content = if state.corrupted_uploads.contains(key) {
                let mut altered = content.to_vec();
                altered.extend_from_slice(b"\0corrupted");
                Bytes::from(altered)
            } else {
                content
            };
            let file = stored
                .files
                .iter_mut()
                .find(|f| f.key == key)
                .ok_or_else(|| RepositoryError::FileNotFound {
                    id: id.to_string(),
                    key: key.to_string(),
                })?;
            file.content = Some(content);
            file.checksum = None;
            Ok(())
        })
    }

    pub fn commit_file(&self, id: &str, key: &str) -> RepositoryResult<FileEntry> {
        self.with_draft(id, |stored, _| {
            let file = stored
                .files
                .iter_mut()
                .find(|f| f.key == key)
                .ok_or_else(|| RepositoryError::FileNotFound {
                    id: id.to_string(),
                    key: key.to_string(),
                })?;
            let content = file.content.as_ref().ok_or_else(|| {
                RepositoryError::Rejected(format!("file `{}` has no content yet", key))
            })?;
            file.checksum = Some(digest_bytes(DigestAlgorithm::Md5, content));
            Ok(file.entry())
        })
    }

    pub fn draft_manifest(&self, id: &str) -> RepositoryResult<FileManifest> {
        self.with_draft(id, |stored, _| Ok(stored.manifest()))
    }

    pub fn read_record(&self, id: &str) -> RepositoryResult<DraftRecord> {
        self.with_published(id, |stored| Ok(stored.record.clone()))
    }

    pub fn record_manifest(&self, id: &str) -> RepositoryResult<FileManifest> {
        self.with_published(id, |stored| Ok(stored.manifest()))
    }

    pub fn read_content(&self, id: &str, key: &str) -> RepositoryResult<Bytes> {
        self.with_published(id, |stored| {
            stored
                .files
                .iter()
                .find(|f| f.key == key)
                .and_then(|f| f.content.clone())
                .ok_or_else(|| RepositoryError::FileNotFound {
                    id: id.to_string(),
                    key: key.to_string(),
                })
        })
    }

    pub fn search(&self, query: &RecordQuery) -> RecordPage {
        let phrase = query.q.as_deref().map(|q| title_phrase(q).unwrap_or_else(|| q.to_string()));
        let state = self.lock();
        let mut matching: Vec<&StoredRecord> = state
            .records
            .values()
            .filter(|r| match &phrase {
                Some(phrase) => r.record.metadata.title.contains(phrase.as_str()),
                None => true,
            })
            .collect();
        matching.sort_by_key(|r| r.created);

        let size = query.size.max(1) as usize;
        let skip = (query.page.max(1) as usize - 1) * size;
        RecordPage {
            total: matching.len() as u64,
            hits: matching
                .into_iter()
                .skip(skip)
                .take(size)
                .map(|r| r.record.clone())
                .collect(),
        }
    }

    pub fn publish(&self, id: &str) -> RepositoryResult<DraftRecord> {
        self.with_draft(id, |stored, state| {
            if state.failing_publishes.contains(&stored.record.metadata.title) {
                return Err(RepositoryError::Rejected(format!(
                    "publishing draft {} refused",
                    id
                )));
            }
            if stored.record.files.enabled {
                if stored.files.is_empty() {
                    return Err(RepositoryError::Rejected(format!(
                        "draft {} has files enabled but none uploaded",
                        id
                    )));
                }
                if let Some(pending) = stored.files.iter().find(|f| f.checksum.is_none()) {
                    return Err(RepositoryError::Rejected(format!(
                        "file `{}` of draft {} is not committed",
                        pending.key, id
                    )));
                }
            }
            stored.record.is_published = true;
            debug!("published record {}", id);
            Ok(stored.record.clone())
        })
    }

    pub fn discard_draft(&self, id: &str) -> RepositoryResult<()> {
        let mut state = self.lock();
        if state.fail_deletes {
            return Err(RepositoryError::Rejected(format!("deleting {} refused", id)));
        }
        let is_draft = state
            .records
            .get(id)
            .is_some_and(|stored| !stored.record.is_published);
        if !is_draft {
            return Err(RepositoryError::NotFound(id.to_string()));
        }
        state.records.remove(id);
        debug!("deleted draft {}", id);
        Ok(())
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    fn record_url(&self, id: &str) -> String {
        format!("{}/records/{}", self.base_url, id)
    }

    async fn create_draft(&self, draft: &DraftRecord) -> RepositoryResult<DraftRecord> {
        Ok(self.insert_draft(draft))
    }

    async fn get_draft(&self, id: &str) -> RepositoryResult<DraftRecord> {
        self.read_draft(id)
    }

    async fn update_draft(&self, id: &str, draft: &DraftRecord) -> RepositoryResult<DraftRecord> {
        self.replace_draft(id, draft)
    }

    async fn start_file_uploads(&self, id: &str, keys: &[String]) -> RepositoryResult<()> {
        self.begin_files(id, keys).map(|_| ())
    }

    async fn upload_file_content(&self, id: &str, key: &str, path: &Path) -> RepositoryResult<()> {
        let content = tokio::fs::read(path).await?;
        self.write_content(id, key, Bytes::from(content))
    }

    async fn commit_file_upload(&self, id: &str, key: &str) -> RepositoryResult<FileEntry> {
        self.commit_file(id, key)
    }

    async fn list_draft_files(&self, id: &str) -> RepositoryResult<FileManifest> {
        self.draft_manifest(id)
    }

    async fn get_record(&self, id: &str) -> RepositoryResult<DraftRecord> {
        self.read_record(id)
    }

    async fn list_record_files(&self, id: &str) -> RepositoryResult<FileManifest> {
        self.record_manifest(id)
    }

    async fn download_file(&self, id: &str, key: &str, dest: &Path) -> RepositoryResult<u64> {
        let content = self.read_content(id, key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &content).await?;
        Ok(content.len() as u64)
    }

    async fn list_user_records(&self, query: &RecordQuery) -> RepositoryResult<RecordPage> {
        Ok(self.search(query))
    }

    async fn publish_draft(&self, id: &str) -> RepositoryResult<DraftRecord> {
        self.publish(id)
    }

    async fn delete_draft(&self, id: &str) -> RepositoryResult<()> {
        self.discard_draft(id)
    }
}
