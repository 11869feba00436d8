//! Client side of the orchestrator integration.
//!
//! | Method | Path | Operation |
//! |--------|------|-----------|
//! | POST   | `/vnfs` | Create, returns `{"id": ...}` |
//! | PUT    | `/vnfs/{external_id}` | Update |
//! | DELETE | `/vnfs/{external_id}` | Delete |
//!
//! The descriptor document is sent as the JSON body. The caller's token, when
//! present, is forwarded as a bearer token.

use crate::models::Descriptor;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("HTTP request to {endpoint} failed: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("{endpoint} returned an unusable response: {reason}")]
    MalformedResponse { endpoint: String, reason: String },
    #[error("descriptor {0} has no orchestrator id")]
    MissingExternalId(i64),
    #[error("orchestrator URL `{0}` cannot be used as a base")]
    InvalidBaseUrl(String),
}

/// Calls the orchestrator makes available for descriptors.
#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    /// Register the descriptor; returns the orchestrator-assigned id.
    async fn create(
        &self,
        descriptor: &Descriptor,
        token: Option<&str>,
    ) -> Result<String, OrchestratorError>;

    async fn update(
        &self,
        descriptor: &Descriptor,
        token: Option<&str>,
    ) -> Result<(), OrchestratorError>;

    async fn delete(
        &self,
        descriptor: &Descriptor,
        token: Option<&str>,
    ) -> Result<(), OrchestratorError>;
}

/// HTTP client for the orchestrator's VNF API.
#[derive(Debug, Clone)]
pub struct HttpOrchestratorClient {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpOrchestratorClient {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, OrchestratorError> {
        if base_url.cannot_be_a_base() {
            return Err(OrchestratorError::InvalidBaseUrl(base_url.to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OrchestratorError::Http {
                endpoint: "client_init".into(),
                source: e,
            })?;
        Ok(Self { http, base_url })
    }

    fn vnfs_url(&self, external_id: Option<&str>) -> Result<Url, OrchestratorError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| OrchestratorError::InvalidBaseUrl(self.base_url.to_string()))?;
            segments.pop_if_empty().push("vnfs");
            if let Some(id) = external_id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    async fn send(
        &self,
        endpoint: &str,
        request: reqwest::RequestBuilder,
        token: Option<&str>,
    ) -> Result<reqwest::Response, OrchestratorError> {
        let request = match token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let resp = request.send().await.map_err(|e| OrchestratorError::Http {
            endpoint: endpoint.into(),
            source: e,
        })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(OrchestratorError::Status {
                endpoint: endpoint.into(),
                status,
                body,
            });
        }
        Ok(resp)
    }
}

fn external_id(descriptor: &Descriptor) -> Result<&str, OrchestratorError> {
    descriptor
        .external_id
        .as_deref()
        .ok_or(OrchestratorError::MissingExternalId(descriptor.id))
}

#[async_trait]
impl OrchestratorClient for HttpOrchestratorClient {
    async fn create(
        &self,
        descriptor: &Descriptor,
        token: Option<&str>,
    ) -> Result<String, OrchestratorError> {
        let endpoint = "POST /vnfs";
        let url = self.vnfs_url(None)?;
        let resp = self
            .send(endpoint, self.http.post(url).json(&descriptor.document), token)
            .await?;

        let body: Value = resp.json().await.map_err(|e| OrchestratorError::Http {
            endpoint: endpoint.into(),
            source: e,
        })?;
        match body.get("id") {
            Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
            Some(Value::Number(id)) => Ok(id.to_string()),
            _ => Err(OrchestratorError::MalformedResponse {
                endpoint: endpoint.into(),
                reason: "missing `id`".into(),
            }),
        }
    }

    async fn update(
        &self,
        descriptor: &Descriptor,
        token: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let id = external_id(descriptor)?;
        let endpoint = format!("PUT /vnfs/{id}");
        let url = self.vnfs_url(Some(id))?;
        self.send(&endpoint, self.http.put(url).json(&descriptor.document), token)
            .await?;
        Ok(())
    }

    async fn delete(
        &self,
        descriptor: &Descriptor,
        token: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let id = external_id(descriptor)?;
        let endpoint = format!("DELETE /vnfs/{id}");
        let url = self.vnfs_url(Some(id))?;
        self.send(&endpoint, self.http.delete(url), token).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpOrchestratorClient {
        HttpOrchestratorClient::new(server.uri().parse().unwrap(), Duration::from_secs(5)).unwrap()
    }

    fn descriptor(external_id: Option<&str>) -> Descriptor {
        let now = Utc::now();
        Descriptor {
            id: 3,
            document: json!({"id": 3, "vdu": []}),
            referenced_file_names: Vec::new(),
            external_id: external_id.map(String::from),
            files: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn create_posts_document_and_reads_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/vnfs"))
            .and(header("authorization", "Bearer tok"))
            .and(body_json(json!({"id": 3, "vdu": []})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 42})))
            .expect(1)
            .mount(&server)
            .await;

        let id = client(&server).create(&descriptor(None), Some("tok")).await.unwrap();
        assert_eq!(id, "42");
    }

    #[tokio::test]
    async fn create_without_id_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let err = client(&server).create(&descriptor(None), None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn update_and_delete_target_external_id() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/vnfs/vnf-7"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/vnfs/vnf-7"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let c = client(&server);
        c.update(&descriptor(Some("vnf-7")), None).await.unwrap();
        c.delete(&descriptor(Some("vnf-7")), None).await.unwrap();
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = client(&server)
            .delete(&descriptor(Some("x")), None)
            .await
            .unwrap_err();
        match err {
            OrchestratorError::Status { status, body, .. } => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_non_hierarchical_base() {
        let base = Url::parse("mailto:ops@example.com").unwrap();
        assert!(matches!(
            HttpOrchestratorClient::new(base, Duration::from_secs(1)),
            Err(OrchestratorError::InvalidBaseUrl(_))
        ));
    }

    #[tokio::test]
    async fn update_requires_external_id() {
        let server = MockServer::start().await;
        let err = client(&server).update(&descriptor(None), None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::MissingExternalId(3)));
    }
}
