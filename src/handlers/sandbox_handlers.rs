//! HTTP handlers for the sandbox repository.
//! Serve the InvenioRDM records API subset used by the deposit client on top
//! of a `MemoryRepository`.

use crate::{
    errors::AppError,
    models::record::{DraftRecord, RecordQuery},
    services::{memory_repository::MemoryRepository, repository::LISTING_PAGE_SIZE},
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::BytesMut;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
    pub page: Option<u32>,
    pub size: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct FileKeyReq {
    pub key: String,
}

/// POST `/api/records`
pub async fn create_draft(
    State(repo): State<MemoryRepository>,
    Json(draft): Json<DraftRecord>,
) -> impl IntoResponse {
    (StatusCode::CREATED, Json(repo.insert_draft(&draft)))
}

/// GET `/api/records/{id}/draft`
pub async fn get_draft(
    State(repo): State<MemoryRepository>,
    Path(id): Path<String>,
) -> Result<Json<DraftRecord>, AppError> {
    Ok(Json(repo.read_draft(&id)?))
}

/// PUT `/api/records/{id}/draft`
pub async fn update_draft(
    State(repo): State<MemoryRepository>,
    Path(id): Path<String>,
    Json(draft): Json<DraftRecord>,
) -> Result<Json<DraftRecord>, AppError> {
    Ok(Json(repo.replace_draft(&id, &draft)?))
}

/// DELETE `/api/records/{id}/draft`
pub async fn delete_draft(
    State(repo): State<MemoryRepository>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    repo.discard_draft(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST `/api/records/{id}/draft/actions/publish`
pub async fn publish_draft(
    State(repo): State<MemoryRepository>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let record = repo.publish(&id)?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

/// GET `/api/records/{id}/draft/files`
pub async fn list_draft_files(
    State(repo): State<MemoryRepository>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(repo.draft_manifest(&id)?))
}

/// POST `/api/records/{id}/draft/files`, body `[{"key": ...}]`.
pub async fn start_file_uploads(
    State(repo): State<MemoryRepository>,
    Path(id): Path<String>,
    Json(keys): Json<Vec<FileKeyReq>>,
) -> Result<impl IntoResponse, AppError> {
    if keys.iter().any(|k| k.key.is_empty()) {
        return Err(AppError::bad_request("file key must not be empty"));
    }
    let keys: Vec<String> = keys.into_iter().map(|k| k.key).collect();
    let manifest = repo.begin_files(&id, &keys)?;
    Ok((StatusCode::CREATED, Json(manifest)))
}

/// PUT `/api/records/{id}/draft/files/{key}/content`
pub async fn upload_file_content(
    State(repo): State<MemoryRepository>,
    Path((id, key)): Path<(String, String)>,
    body: Body,
) -> Result<StatusCode, AppError> {
    let mut stream = body.into_data_stream();
    let mut content = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| AppError::bad_request(err.to_string()))?;
        content.extend_from_slice(&chunk);
    }
    debug!("received {} bytes for {} in {}", content.len(), key, id);
    repo.write_content(&id, &key, content.freeze())?;
    Ok(StatusCode::OK)
}

/// POST `/api/records/{id}/draft/files/{key}/commit`
pub async fn commit_file_upload(
    State(repo): State<MemoryRepository>,
    Path((id, key)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(repo.commit_file(&id, &key)?))
}

/// GET `/api/records/{id}`
pub async fn get_record(
    State(repo): State<MemoryRepository>,
    Path(id): Path<String>,
) -> Result<Json<DraftRecord>, AppError> {
    Ok(Json(repo.read_record(&id)?))
}

/// GET `/api/records/{id}/files`
pub async fn list_record_files(
    State(repo): State<MemoryRepository>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(repo.record_manifest(&id)?))
}

/// GET `/api/records/{id}/files/{key}/content`
pub async fn get_file_content(
    State(repo): State<MemoryRepository>,
    Path((id, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let content = repo.read_content(&id, &key)?;
    let len = content.len();

    let mut response = Response::new(Body::from(content));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    *response.status_mut() = StatusCode::OK;
    Ok(response)
}

/// GET `/api/user/records?q=&page=&size=`
pub async fn list_user_records(
    State(repo): State<MemoryRepository>,
    Query(params): Query<SearchParams>,
) -> impl IntoResponse {
    let query = RecordQuery {
        q: params.q.filter(|q| !q.trim().is_empty()),
        page: params.page.unwrap_or(1).max(1),
        size: params.size.unwrap_or(LISTING_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
    };
    let page = repo.search(&query);
    Json(json!({
        "hits": {
            "hits": page.hits,
            "total": page.total,
        }
    }))
}
