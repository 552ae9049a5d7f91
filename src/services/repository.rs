//! The remote repository seam.
//!
//! Everything the deposit pipeline needs from an InvenioRDM-style service is
//! expressed by [`Repository`]. [`crate::services::invenio_client`] talks HTTP,
//! [`crate::services::memory_repository`] keeps records in process.

use crate::models::record::{DraftRecord, FileEntry, FileManifest, RecordPage, RecordQuery};
use async_trait::async_trait;
use std::{io, path::Path};
use thiserror::Error;

/// Page size used when scanning the user's records.
pub const LISTING_PAGE_SIZE: u32 = 25;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: String,
        url: String,
        status: u16,
        body: String,
    },
    #[error("record `{0}` not found")]
    NotFound(String),
    #[error("file `{key}` not found in record `{id}`")]
    FileNotFound { id: String, key: String },
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("invalid repository url `{0}`")]
    InvalidUrl(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RepositoryError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) | Self::FileNotFound { .. } => true,
            Self::Status { status, .. } => *status == 404,
            _ => false,
        }
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[async_trait]
pub trait Repository: Send + Sync {
    /// Public landing URL of a record, used as related identifier.
    fn record_url(&self, id: &str) -> String;

    async fn create_draft(&self, draft: &DraftRecord) -> RepositoryResult<DraftRecord>;
    async fn get_draft(&self, id: &str) -> RepositoryResult<DraftRecord>;
    async fn update_draft(&self, id: &str, draft: &DraftRecord) -> RepositoryResult<DraftRecord>;

    /// Register file keys on a draft before their content is sent.
    async fn start_file_uploads(&self, id: &str, keys: &[String]) -> RepositoryResult<()>;
    /// Stream a local file as the content of a registered key.
    async fn upload_file_content(&self, id: &str, key: &str, path: &Path) -> RepositoryResult<()>;
    async fn commit_file_upload(&self, id: &str, key: &str) -> RepositoryResult<FileEntry>;
    async fn list_draft_files(&self, id: &str) -> RepositoryResult<FileManifest>;

    async fn get_record(&self, id: &str) -> RepositoryResult<DraftRecord>;
    async fn list_record_files(&self, id: &str) -> RepositoryResult<FileManifest>;
    /// Write a published file to `dest` and return the number of bytes.
    async fn download_file(&self, id: &str, key: &str, dest: &Path) -> RepositoryResult<u64>;

    /// Drafts and published records owned by the authenticated user.
    async fn list_user_records(&self, query: &RecordQuery) -> RepositoryResult<RecordPage>;

    async fn publish_draft(&self, id: &str) -> RepositoryResult<DraftRecord>;
    async fn delete_draft(&self, id: &str) -> RepositoryResult<()>;
}

/// Page through the user's records for one whose title matches exactly.
///
/// The search engine matches phrases loosely, so hits are filtered again here.
pub async fn find_record_by_title(
    repo: &dyn Repository,
    title: &str,
) -> RepositoryResult<Option<DraftRecord>> {
    let mut page = 1;
    loop {
        let query = RecordQuery::by_title(title, page, LISTING_PAGE_SIZE);
        let result = repo.list_user_records(&query).await?;
        let seen = u64::from(page) * u64::from(LISTING_PAGE_SIZE);
        let exhausted = result.hits.is_empty() || seen >= result.total;
        if let Some(hit) = result.hits.into_iter().find(|r| r.metadata.title == title) {
            return Ok(Some(hit));
        }
        if exhausted {
            return Ok(None);
        }
        page += 1;
    }
}

/// Record id at the end of a record URL such as `https://host/records/abcde-12345`.
pub fn record_id_from_url(url: &str) -> Option<&str> {
    let (_, tail) = url.rsplit_once("/records/")?;
    let id = tail.trim_end_matches('/');
    if id.is_empty() || id.contains('/') {
        None
    } else {
        Some(id)
    }
}
