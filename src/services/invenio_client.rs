//! InvenioRDM REST client.
//!
//! Speaks the subset of the records API the deposit pipeline uses. Every
//! request carries the personal access token as a bearer token. File keys are
//! percent-encoded as single path segments.

use crate::{
    models::record::{DraftRecord, FileEntry, FileManifest, RecordPage, RecordQuery},
    services::repository::{Repository, RepositoryError, RepositoryResult},
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Body, Method, RequestBuilder, Response, Url, header};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::json;
use std::{path::Path, time::Duration};
use tokio::{fs::File, io::AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

pub struct InvenioClient {
    http: reqwest::Client,
    base: Url,
    token: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    hits: RecordPage,
}

impl InvenioClient {
    pub fn new(
        base_url: &str,
        token: impl Into<String>,
        timeout: Duration,
    ) -> RepositoryResult<Self> {
        let base = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|_| RepositoryError::InvalidUrl(base_url.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(RepositoryError::InvalidUrl(base_url.to_string()));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base,
            token: token.into(),
        })
    }

    fn url(&self, segments: &[&str]) -> RepositoryResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| RepositoryError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.token)
            .header(header::ACCEPT, "application/json")
    }

    /// Send and turn any non-success status into [`RepositoryError::Status`].
    async fn send(
        &self,
        method: Method,
        url: Url,
        build: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> RepositoryResult<Response> {
        debug!("{} {}", method, url);
        let response = build(self.request(method.clone(), url.clone())).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(RepositoryError::Status {
            method: method.to_string(),
            url: url.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        build: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> RepositoryResult<T> {
        let response = self.send(method, url, build).await?;
        let raw = response.bytes().await?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

#[async_trait]
impl Repository for InvenioClient {
    fn record_url(&self, id: &str) -> String {
        format!("{}/records/{}", self.base.as_str().trim_end_matches('/'), id)
    }

    async fn create_draft(&self, draft: &DraftRecord) -> RepositoryResult<DraftRecord> {
        let url = self.url(&["api", "records"])?;
        self.send_json(Method::POST, url, |r| r.json(draft)).await
    }

    async fn get_draft(&self, id: &str) -> RepositoryResult<DraftRecord> {
        let url = self.url(&["api", "records", id, "draft"])?;
        self.send_json(Method::GET, url, |r| r).await
    }

    async fn update_draft(&self, id: &str, draft: &DraftRecord) -> RepositoryResult<DraftRecord> {
        let url = self.url(&["api", "records", id, "draft"])?;
        self.send_json(Method::PUT, url, |r| r.json(draft)).await
    }

    async fn start_file_uploads(&self, id: &str, keys: &[String]) -> RepositoryResult<()> {
        let url = self.url(&["api", "records", id, "draft", "files"])?;
        let body: Vec<_> = keys.iter().map(|key| json!({ "key": key })).collect();
        self.send(Method::POST, url, |r| r.json(&body)).await?;
        Ok(())
    }

    async fn upload_file_content(&self, id: &str, key: &str, path: &Path) -> RepositoryResult<()> {
        let url = self.url(&["api", "records", id, "draft", "files", key, "content"])?;
        let file = File::open(path).await?;
        let len = file.metadata().await?.len();
        let body = Body::wrap_stream(ReaderStream::new(file));
        self.send(Method::PUT, url, |r| {
            r.header(header::CONTENT_TYPE, "application/octet-stream")
                .header(header::CONTENT_LENGTH, len)
                .body(body)
        })
        .await?;
        Ok(())
    }

    async fn commit_file_upload(&self, id: &str, key: &str) -> RepositoryResult<FileEntry> {
        let url = self.url(&["api", "records", id, "draft", "files", key, "commit"])?;
        self.send_json(Method::POST, url, |r| r).await
    }

    async fn list_draft_files(&self, id: &str) -> RepositoryResult<FileManifest> {
        let url = self.url(&["api", "records", id, "draft", "files"])?;
        self.send_json(Method::GET, url, |r| r).await
    }

    async fn get_record(&self, id: &str) -> RepositoryResult<DraftRecord> {
        let url = self.url(&["api", "records", id])?;
        self.send_json(Method::GET, url, |r| r).await
    }

    async fn list_record_files(&self, id: &str) -> RepositoryResult<FileManifest> {
        let url = self.url(&["api", "records", id, "files"])?;
        self.send_json(Method::GET, url, |r| r).await
    }

    async fn download_file(&self, id: &str, key: &str, dest: &Path) -> RepositoryResult<u64> {
        let url = self.url(&["api", "records", id, "files", key, "content"])?;
        let response = self.send(Method::GET, url, |r| r).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    async fn list_user_records(&self, query: &RecordQuery) -> RepositoryResult<RecordPage> {
        let url = self.url(&["api", "user", "records"])?;
        let mut params = vec![
            ("page", query.page.to_string()),
            ("size", query.size.to_string()),
        ];
        if let Some(q) = &query.q {
            params.push(("q", q.clone()));
        }
        let response: SearchResponse = self
            .send_json(Method::GET, url, |r| r.query(&params))
            .await?;
        Ok(response.hits)
    }

    async fn publish_draft(&self, id: &str) -> RepositoryResult<DraftRecord> {
        let url = self.url(&["api", "records", id, "draft", "actions", "publish"])?;
        self.send_json(Method::POST, url, |r| r).await
    }

    async fn delete_draft(&self, id: &str) -> RepositoryResult<()> {
        let url = self.url(&["api", "records", id, "draft"])?;
        self.send(Method::DELETE, url, |r| r).await?;
        Ok(())
    }
}
