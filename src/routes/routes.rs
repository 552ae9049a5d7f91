//! Routes of the sandbox repository server.
//!
//! ## Structure
//! - **Drafts**
//!   - `POST   /api/records` — create draft
//!   - `GET    /api/records/{id}/draft` — read draft
//!   - `PUT    /api/records/{id}/draft` — replace draft metadata
//!   - `DELETE /api/records/{id}/draft` — discard draft
//!   - `POST   /api/records/{id}/draft/actions/publish` — publish
//!
//! - **Draft files**
//!   - `GET|POST /api/records/{id}/draft/files` — manifest / register keys
//!   - `PUT    /api/records/{id}/draft/files/{key}/content` — upload bytes
//!   - `POST   /api/records/{id}/draft/files/{key}/commit` — commit upload
//!
//! - **Published records**
//!   - `GET    /api/records/{id}` and `/api/records/{id}/files`
//!   - `GET    /api/records/{id}/files/{key}/content` — download bytes
//!   - `GET    /api/user/records` — search the user's records

use crate::{
    handlers::{
        health_handlers::healthz,
        sandbox_handlers::{
            commit_file_upload, create_draft, delete_draft, get_draft, get_file_content,
            get_record, list_draft_files, list_record_files, list_user_records, publish_draft,
            start_file_uploads, update_draft, upload_file_content,
        },
    },
    services::memory_repository::MemoryRepository,
};
use axum::{
    Router,
    routing::{get, post, put},
};

/// Build the sandbox router. The router carries the shared `MemoryRepository`.
pub fn routes() -> Router<MemoryRepository> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/records", post(create_draft))
        .route(
            "/api/records/{id}/draft",
            get(get_draft).put(update_draft).delete(delete_draft),
        )
        .route("/api/records/{id}/draft/actions/publish", post(publish_draft))
        .route(
            "/api/records/{id}/draft/files",
            get(list_draft_files).post(start_file_uploads),
        )
        .route(
            "/api/records/{id}/draft/files/{key}/content",
            put(upload_file_content),
        )
        .route(
            "/api/records/{id}/draft/files/{key}/commit",
            post(commit_file_upload),
        )
        .route("/api/records/{id}", get(get_record))
        .route("/api/records/{id}/files", get(list_record_files))
        .route("/api/records/{id}/files/{key}/content", get(get_file_content))
        .route("/api/user/records", get(list_user_records))
}
