//! HTTP-backed implementations of the discovery collaborators.
//!
//! - `POST {index}/search` with `{"text", "top_k"}` returns `[SearchHit]`
//! - `GET {metadata}/sources/{id}/schema|status|descriptor` returns the
//!   matching JSON document; 404 means "absent", not an error

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};
use url::Url;

use genpipe_shared::{GenPipeError, RawSourceDescriptor, Result};

use crate::client::{MetadataProvider, ProcessingStatus, Schema, SearchHit, VectorIndex};

/// User-Agent string for collaborator requests.
const USER_AGENT: &str = concat!("genpipe/", env!("CARGO_PKG_VERSION"));

/// Build a reqwest client with the given request timeout.
pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|e| GenPipeError::Network(format!("failed to build HTTP client: {e}")))
}

fn endpoint(base: &Url, path: &str) -> String {
    format!("{}/{}", base.as_str().trim_end_matches('/'), path)
}

// ---------------------------------------------------------------------------
// Vector index
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct SearchRequest<'a> {
    text: &'a str,
    top_k: usize,
}

/// Vector index reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpVectorIndex {
    client: Client,
    base: Url,
}

impl HttpVectorIndex {
    pub fn new(base: Url, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base,
        })
    }
}

#[async_trait]
impl VectorIndex for HttpVectorIndex {
    #[instrument(skip(self), fields(base = %self.base))]
    async fn search(&self, text: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        let url = endpoint(&self.base, "search");
        let response = self
            .client
            .post(&url)
            .json(&SearchRequest { text, top_k })
            .send()
            .await
            .map_err(|e| GenPipeError::Network(format!("{url}: {e}")))?;

        // An index with nothing indexed yet may answer 404.
        if response.status() == StatusCode::NOT_FOUND {
            debug!(%url, "search endpoint returned 404, treating as no hits");
            return Ok(Vec::new());
        }
        let status = response.status();
        if !status.is_success() {
            return Err(GenPipeError::Network(format!("{url}: HTTP {status}")));
        }

        response
            .json::<Vec<SearchHit>>()
            .await
            .map_err(|e| GenPipeError::parse(format!("{url}: invalid search response: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Metadata provider
// ---------------------------------------------------------------------------

/// Schema/status/descriptor provider reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpMetadataProvider {
    client: Client,
    base: Url,
}

impl HttpMetadataProvider {
    pub fn new(base: Url, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base,
        })
    }

    /// `{base}/sources/{id}/{document}`, with the id as one encoded segment.
    fn document_url(&self, source_id: &str, document: &str) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| GenPipeError::config(format!("metadata url cannot take a path: {}", self.base)))?
            .pop_if_empty()
            .extend(["sources", source_id, document]);
        Ok(url)
    }

    async fn fetch<T: DeserializeOwned>(&self, source_id: &str, document: &str) -> Result<Option<T>> {
        let url = self.document_url(source_id, document)?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| GenPipeError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(GenPipeError::Network(format!("{url}: HTTP {status}")));
        }

        response
            .json::<T>()
            .await
            .map(Some)
            .map_err(|e| GenPipeError::parse(format!("{url}: invalid {document} document: {e}")))
    }
}

#[async_trait]
impl MetadataProvider for HttpMetadataProvider {
    async fn schema(&self, source_id: &str) -> Result<Option<Schema>> {
        self.fetch(source_id, "schema").await
    }

    async fn status(&self, source_id: &str) -> Result<Option<ProcessingStatus>> {
        self.fetch(source_id, "status").await
    }

    async fn descriptor(&self, source_id: &str) -> Result<Option<RawSourceDescriptor>> {
        self.fetch(source_id, "descriptor").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{DiscoveryClient, DiscoveryOptions};
    use crate::instrumentation::DiscoveryTracker;
    use std::sync::Arc;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn timeout() -> Duration {
        Duration::from_secs(5)
    }

    #[tokio::test]
    async fn search_posts_query_and_parses_hits() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/search"))
            .and(body_json(serde_json::json!({"text": "permian oil", "top_k": 3})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": "rrc", "score": 0.91, "metadata": {"label": "Railroad Commission"}},
                {"id": "eia", "score": 0.42}
            ])))
            .mount(&server)
            .await;

        let index = HttpVectorIndex::new(Url::parse(&server.uri()).unwrap(), timeout()).unwrap();
        let hits = index.search("permian oil", 3).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "rrc");
        assert!(hits[1].metadata.is_null());
    }

    #[tokio::test]
    async fn search_server_error_is_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let index = HttpVectorIndex::new(Url::parse(&server.uri()).unwrap(), timeout()).unwrap();
        let err = index.search("oil", 3).await.unwrap_err();
        assert!(matches!(err, GenPipeError::Network(_)));
    }

    #[tokio::test]
    async fn metadata_404_is_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sources/ghost/schema"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider =
            HttpMetadataProvider::new(Url::parse(&server.uri()).unwrap(), timeout()).unwrap();
        assert!(provider.schema("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn source_ids_are_encoded_as_one_segment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/meta/sources/wells%2F2023%3Fx%23y/schema"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "columns": ["api_no"]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let base = Url::parse(&format!("{}/meta/", server.uri())).unwrap();
        let provider = HttpMetadataProvider::new(base, timeout()).unwrap();
        let schema = provider.schema("wells/2023?x#y").await.unwrap().unwrap();
        assert_eq!(schema.columns, vec!["api_no"]);
    }

    #[tokio::test]
    async fn descriptor_fixture_served_over_http() {
        let server = MockServer::start().await;
        let fixture = std::fs::read_to_string("../../../fixtures/sources/descriptors.fixture.json")
            .expect("read descriptor fixture");
        let all: serde_json::Value = serde_json::from_str(&fixture).unwrap();

        Mock::given(method("GET"))
            .and(path("/sources/fracfocus/descriptor"))
            .respond_with(ResponseTemplate::new(200).set_body_json(all["fracfocus"].clone()))
            .mount(&server)
            .await;

        let provider =
            HttpMetadataProvider::new(Url::parse(&server.uri()).unwrap(), timeout()).unwrap();
        let raw = provider.descriptor("fracfocus").await.unwrap().unwrap();
        assert!(raw.directory_structure.is_some());
    }

    #[tokio::test]
    async fn client_over_http_end_to_end() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": "rrc", "score": 0.9}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sources/rrc/schema"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "columns": ["county", "oil_bbl"],
                "row_count": 1843220
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sources/rrc/status"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sources/rrc/descriptor"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "file_count": 3,
                "location": "data/processed/rrc"
            })))
            .mount(&server)
            .await;

        let base = Url::parse(&server.uri()).unwrap();
        let tracker = DiscoveryTracker::new();
        let client = DiscoveryClient::new(
            Arc::new(HttpVectorIndex::new(base.clone(), timeout()).unwrap()),
            Arc::new(HttpMetadataProvider::new(base, timeout()).unwrap()),
        )
        .with_tracker(tracker.clone());

        let report = client.discover("oil wells", &DiscoveryOptions::default()).await;
        assert_eq!(report.sources.len(), 1);
        let rrc = &report.sources[0];
        assert_eq!(rrc.schema.as_ref().unwrap().row_count, 1843220);
        assert!(rrc.status.is_none());
        assert!(rrc.descriptor.is_some());

        let session = tracker.end_session();
        assert_eq!(session.total_attempts(), 4);
        assert_eq!(session.failed_attempts(), 1);
    }
}
