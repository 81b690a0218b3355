//! HTTP client for the cross-region replication metadata service.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ReplicationMetadata, SyncError};

#[derive(Serialize)]
struct RecordRequest<'a> {
    entry_hash: &'a str,
    regions: &'a BTreeSet<String>,
}

#[derive(Deserialize)]
struct QueryResponse {
    regions: BTreeSet<String>,
}

pub struct HttpReplicationMetadata {
    base_url: String,
    http_client: Client,
}

impl HttpReplicationMetadata {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SyncError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }
}

fn unavailable(err: reqwest::Error) -> SyncError {
    SyncError::Unavailable(format!("replication metadata unreachable: {}", err))
}

#[async_trait]
impl ReplicationMetadata for HttpReplicationMetadata {
    async fn record(&self, entry_hash: &str, regions: &BTreeSet<String>) -> Result<(), SyncError> {
        let response = self
            .http_client
            .post(format!("{}/replication", self.base_url))
            .json(&RecordRequest { entry_hash, regions })
            .send()
            .await
            .map_err(unavailable)?;

        if !response.status().is_success() {
            return Err(SyncError::Unavailable(format!(
                "replication metadata returned {}",
                response.status()
            )));
        }
        debug!(entry_hash = %entry_hash, "replication metadata recorded");
        Ok(())
    }

    async fn query(&self, entry_hash: &str) -> Result<BTreeSet<String>, SyncError> {
        let response = self
            .http_client
            .get(format!("{}/replication/{}", self.base_url, entry_hash))
            .send()
            .await
            .map_err(unavailable)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(BTreeSet::new()),
            status if status.is_success() => {
                let body: QueryResponse = response.json().await.map_err(|e| {
                    SyncError::Unavailable(format!("invalid replication metadata response: {}", e))
                })?;
                Ok(body.regions)
            }
            status => Err(SyncError::Unavailable(format!(
                "replication metadata returned {}",
                status
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpReplicationMetadata {
        HttpReplicationMetadata::new(server.uri(), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_record_posts_regions() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/replication"))
            .and(body_json(json!({ "entry_hash": "abc", "regions": ["eu-central", "eu-west"] })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let regions: BTreeSet<String> = ["eu-west", "eu-central"].iter().map(|r| r.to_string()).collect();
        client(&server).record("abc", &regions).await.unwrap();
    }

    #[tokio::test]
    async fn test_query_regions_and_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/replication/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "regions": ["eu-west"] })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/replication/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let metadata = client(&server);
        assert_eq!(metadata.query("abc").await.unwrap().len(), 1);
        assert!(metadata.query("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/replication/abc"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        assert!(matches!(client(&server).query("abc").await, Err(SyncError::Unavailable(_))));
    }
}
