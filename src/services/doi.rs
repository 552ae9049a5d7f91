//! DOI registration.
//!
//! Records whose metadata carries a DOI placeholder get a DOI reserved at a
//! registration agency before publishing. [`DoiRegistrar`] is the seam;
//! [`DataciteClient`] talks to the DataCite REST API and creates DOIs in the
//! `draft` state, which can still be deleted if the deposit rolls back.

use crate::models::metadata::Metadata;
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, Url, header};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const JSON_API: &str = "application/vnd.api+json";

#[derive(Debug, Error)]
pub enum DoiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: String,
        url: String,
        status: u16,
        body: String,
    },
    #[error("invalid registration agency url `{0}`")]
    InvalidUrl(String),
    #[error("DOI registration refused: {0}")]
    Refused(String),
}

pub type DoiResult<T> = Result<T, DoiError>;

#[async_trait]
pub trait DoiRegistrar: Send + Sync {
    /// Reserve a draft DOI describing `metadata`, resolving to `landing_url`.
    async fn reserve(&self, metadata: &Metadata, landing_url: &str) -> DoiResult<String>;

    /// Delete a DOI that is still in the draft state.
    async fn delete(&self, doi: &str) -> DoiResult<()>;
}

/// Connection settings for a DataCite repository account.
#[derive(Clone)]
pub struct DataciteSettings {
    pub url: String,
    pub prefix: String,
    pub user: String,
    pub password: String,
}

pub struct DataciteClient {
    http: reqwest::Client,
    base: Url,
    prefix: String,
    user: String,
    password: String,
}

#[derive(Deserialize)]
struct DoiResponse {
    data: DoiData,
}

#[derive(Deserialize)]
struct DoiData {
    id: String,
}

impl DataciteClient {
    pub fn new(settings: &DataciteSettings, timeout: Duration) -> DoiResult<Self> {
        let base = Url::parse(settings.url.trim_end_matches('/'))
            .map_err(|_| DoiError::InvalidUrl(settings.url.clone()))?;
        if base.cannot_be_a_base() {
            return Err(DoiError::InvalidUrl(settings.url.clone()));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base,
            prefix: settings.prefix.clone(),
            user: settings.user.clone(),
            password: settings.password.clone(),
        })
    }

    fn url(&self, segments: &[&str]) -> DoiResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| DoiError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        build: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> DoiResult<Response> {
        debug!("{} {}", method, url);
        let request = self
            .http
            .request(method.clone(), url.clone())
            .basic_auth(&self.user, Some(&self.password))
            .header(header::ACCEPT, JSON_API);
        let response = build(request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(DoiError::Status {
            method: method.to_string(),
            url: url.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl DoiRegistrar for DataciteClient {
    async fn reserve(&self, metadata: &Metadata, landing_url: &str) -> DoiResult<String> {
        let url = self.url(&["dois"])?;
        let body = draft_doi_document(&self.prefix, metadata, landing_url);
        let response = self
            .send(Method::POST, url, |r| {
                r.header(header::CONTENT_TYPE, JSON_API).json(&body)
            })
            .await?;
        let created: DoiResponse = response.json().await?;
        if created.data.id.is_empty() {
            return Err(DoiError::Refused("response carries no DOI".to_string()));
        }
        Ok(created.data.id)
    }

    async fn delete(&self, doi: &str) -> DoiResult<()> {
        let mut segments = vec!["dois"];
        segments.extend(doi.split('/'));
        let url = self.url(&segments)?;
        self.send(Method::DELETE, url, |r| r).await?;
        Ok(())
    }
}

/// JSON:API document creating a draft DOI under `prefix`.
pub fn draft_doi_document(prefix: &str, metadata: &Metadata, landing_url: &str) -> Value {
    let creators: Vec<Value> = metadata
        .creators
        .iter()
        .map(|c| {
            let person = &c.person_or_org;
            let name = match (&person.name, &person.family_name, &person.given_name) {
                (Some(name), _, _) => name.clone(),
                (None, Some(family), Some(given)) => format!("{}, {}", family, given),
                (None, Some(family), None) => family.clone(),
                (None, None, given) => given.clone().unwrap_or_default(),
            };
            let kind = if person.kind == "personal" {
                "Personal"
            } else {
                "Organizational"
            };
            json!({ "name": name, "nameType": kind })
        })
        .collect();
    let year = metadata.publication_date.get(..4).unwrap_or_default();

    json!({
        "data": {
            "type": "dois",
            "attributes": {
                "prefix": prefix,
                "titles": [{ "title": metadata.title }],
                "creators": creators,
                "publicationYear": year,
                "types": { "resourceTypeGeneral": "Dataset" },
                "url": landing_url,
            }
        }
    })
}
