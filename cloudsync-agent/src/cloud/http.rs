//! REST object store over HTTP.
//!
//! Speaks the minimal bucket API most S3-style gateways expose without signing:
//! `PUT {endpoint}/{container}` creates a container (409 means it already exists),
//! `PUT {endpoint}/{container}/{key}` streams an object, and
//! `DELETE {endpoint}/{container}/{key}` removes one (404 counts as removed).

use super::{container_name, Container, ObjectStore};
use crate::model::Backup;
use crate::utils::errors::{Result, SyncError};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use std::path::Path;
use tokio_util::io::ReaderStream;
use tracing::debug;

pub struct HttpObjectStore {
    client: Client,
    endpoint: Url,
    token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| SyncError::Config(format!("invalid endpoint '{endpoint}': {e}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(SyncError::Config(format!("endpoint '{endpoint}' cannot hold paths")));
        }

        Ok(Self {
            client: Client::new(),
            endpoint,
            token,
        })
    }

    /// `{endpoint}/{container}/{key segments...}`, each segment percent-encoded
    fn url(&self, container: &str, key: Option<&str>) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(container);
            if let Some(key) = key {
                segments.extend(key.split('/'));
            }
        }
        url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

async fn expect_success(response: Response, allowed: &[StatusCode], what: &str) -> Result<()> {
    let status = response.status();
    if status.is_success() || allowed.contains(&status) {
        return Ok(());
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(SyncError::Remote(format!("{what} failed with status {status}: {body}")))
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    fn provider(&self) -> &'static str {
        "http"
    }

    async fn create_container(&self, backup: &Backup) -> Result<Container> {
        let container = Container::new(&backup.name, container_name(&backup.name));
        let response = self
            .authorize(self.client.put(self.url(&container.name, None)))
            .send()
            .await?;
        expect_success(response, &[StatusCode::CONFLICT], "container create").await?;
        Ok(container)
    }

    async fn put(&self, container: &Container, key: &str, source: &Path) -> Result<()> {
        let file = tokio::fs::File::open(source).await?;
        let size = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let response = self
            .authorize(self.client.put(self.url(&container.name, Some(key))))
            .header(reqwest::header::CONTENT_LENGTH, size)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?;
        expect_success(response, &[], "upload").await?;

        debug!(container = %container.name, key, size, "Uploaded object");
        Ok(())
    }

    async fn delete(&self, container: &Container, key: &str) -> Result<()> {
        let response = self
            .authorize(self.client.delete(self.url(&container.name, Some(key))))
            .send()
            .await?;
        expect_success(response, &[StatusCode::NOT_FOUND], "delete").await?;

        debug!(container = %container.name, key, "Deleted object");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building_encodes_segments() {
        let store = HttpObjectStore::new("http://localhost:9000/objects/", None).unwrap();

        assert_eq!(
            store.url("docs", None).as_str(),
            "http://localhost:9000/objects/docs"
        );
        assert_eq!(
            store.url("docs", Some("docs/my file.txt")).as_str(),
            "http://localhost:9000/objects/docs/docs/my%20file.txt"
        );
    }

    #[test]
    fn test_rejects_invalid_endpoint() {
        assert!(matches!(
            HttpObjectStore::new("not a url", None),
            Err(SyncError::Config(_))
        ));
        assert!(matches!(
            HttpObjectStore::new("mailto:ops@example.com", None),
            Err(SyncError::Config(_))
        ));
    }
}
