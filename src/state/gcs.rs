// ABOUTME: Google Cloud Storage watermark backend over the JSON API
// ABOUTME: Object generations serve as versions; writes are conditional on ifGenerationMatch

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use url::Url;

use crate::error::{Endpoint, Result, SyncError};

use super::{DocumentVersion, StateBackend, WatermarkDocument};

/// Default GCS API base URL
pub const DEFAULT_GCS_ENDPOINT: &str = "https://storage.googleapis.com";

/// Watermark document stored as `<prefix>/state.json` in a bucket.
pub struct GcsBackend {
    client: Client,
    endpoint: String,
    bucket: String,
    object: String,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectResource {
    generation: String,
}

impl GcsBackend {
    /// Create a GCS backend
    ///
    /// # Arguments
    ///
    /// * `bucket` - Bucket holding the document
    /// * `prefix` - Object prefix; the document is `<prefix>/state.json`
    /// * `endpoint` - Optional API base URL (defaults to https://storage.googleapis.com)
    /// * `access_token` - OAuth2 bearer token; omitted for unauthenticated emulators
    pub fn new(
        bucket: &str,
        prefix: &str,
        endpoint: Option<&str>,
        access_token: Option<String>,
    ) -> Result<Self> {
        if bucket.trim().is_empty() {
            return Err(SyncError::Config(
                "GCS state store requires a bucket".to_string(),
            ));
        }

        Ok(Self {
            client: Client::new(),
            endpoint: endpoint
                .unwrap_or(DEFAULT_GCS_ENDPOINT)
                .trim_end_matches('/')
                .to_string(),
            bucket: bucket.to_string(),
            object: object_name(prefix),
            access_token,
        })
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    /// `GET .../storage/v1/b/<bucket>/o/<object>?alt=media`
    pub fn download_url(&self) -> Result<Url> {
        let mut url = self.base_url()?;
        url.path_segments_mut()
            .map_err(|_| SyncError::Config(format!("Invalid GCS endpoint {}", self.endpoint)))?
            .pop_if_empty()
            .extend(["storage", "v1", "b", self.bucket.as_str(), "o", self.object.as_str()]);
        url.query_pairs_mut().append_pair("alt", "media");
        Ok(url)
    }

    /// `POST .../upload/storage/v1/b/<bucket>/o?uploadType=media&name=<object>&ifGenerationMatch=<g>`
    ///
    /// Generation 0 means the object must not exist yet.
    pub fn upload_url(&self, expected: Option<&str>) -> Result<Url> {
        let mut url = self.base_url()?;
        url.path_segments_mut()
            .map_err(|_| SyncError::Config(format!("Invalid GCS endpoint {}", self.endpoint)))?
            .pop_if_empty()
            .extend(["upload", "storage", "v1", "b", self.bucket.as_str(), "o"]);
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", &self.object)
            .append_pair("ifGenerationMatch", expected.unwrap_or("0"));
        Ok(url)
    }

    fn base_url(&self) -> Result<Url> {
        Url::parse(&self.endpoint)
            .map_err(|e| SyncError::Config(format!("Invalid GCS endpoint {}: {}", self.endpoint, e)))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }
}

fn object_name(prefix: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        "state.json".to_string()
    } else {
        format!("{}/state.json", prefix)
    }
}

fn transport_error(what: &str, err: reqwest::Error) -> SyncError {
    SyncError::transient(Endpoint::StateStore, format!("{}: {}", what, err))
}

/// Map an unexpected response status to an error. Throttling and server
/// errors are transient.
async fn status_error(what: &str, response: reqwest::Response) -> SyncError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = format!("{} returned {}: {}", what, status, body);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        SyncError::transient(Endpoint::StateStore, message)
    } else {
        SyncError::State(message)
    }
}

#[async_trait]
impl StateBackend for GcsBackend {
    fn describe(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.object)
    }

    async fn load(&self) -> Result<Option<(WatermarkDocument, DocumentVersion)>> {
        let what = "GCS download of watermark document";
        let response = self
            .authorize(self.client.get(self.download_url()?))
            .send()
            .await
            .map_err(|e| transport_error(what, e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error(what, response).await);
        }

        let generation = response
            .headers()
            .get("x-goog-generation")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                SyncError::State(format!("{} has no x-goog-generation header", what))
            })?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(what, e))?;
        let document = WatermarkDocument::from_bytes(&bytes)?;

        Ok(Some((document, generation)))
    }

    async fn save(
        &self,
        document: &WatermarkDocument,
        expected: Option<&str>,
    ) -> Result<DocumentVersion> {
        let what = "GCS upload of watermark document";
        let response = self
            .authorize(self.client.post(self.upload_url(expected)?))
            .header("Content-Type", "application/json")
            .body(document.to_bytes()?)
            .send()
            .await
            .map_err(|e| transport_error(what, e))?;

        if response.status() == StatusCode::PRECONDITION_FAILED {
            return Err(SyncError::StateConflict);
        }
        if !response.status().is_success() {
            return Err(status_error(what, response).await);
        }

        let resource: ObjectResource = response
            .json()
            .await
            .map_err(|e| SyncError::State(format!("{}: unreadable response: {}", what, e)))?;

        Ok(resource.generation)
    }
}
