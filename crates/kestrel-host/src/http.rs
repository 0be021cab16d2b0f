//! HTTP client for a remote hosting service.

use crate::error::{HostError, NetworkFailure, Result};
use crate::service::HostingService;
use crate::types::{
    AgentInfo, ControllerBootstrap, ErrorBody, IdentifierRecord, InceptRequest, IssueRequest,
    Notification, OobiRequest, Operation, QueryRequest, RegistryRecord, RegistryRequest,
};
use async_trait::async_trait;
use kestrel_core::Credential;
use kestrel_core::event::SignedEvent;
use kestrel_core::exchange::SignedExchange;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::error::Error as _;
use std::time::{Duration, Instant};
use url::Url;

/// Header carrying the controller prefix on every call after connect.
pub const CONTROLLER_HEADER: &str = "x-kestrel-controller";

#[derive(Deserialize)]
struct PublishedSchema {
    said: String,
}

/// A [`HostingService`] reached over HTTP.
#[derive(Clone)]
pub struct HttpHost {
    base: Url,
    client: reqwest::Client,
}

impl HttpHost {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| HostError::Decode(format!("invalid host URL {base_url}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| HostError::Decode(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { base, client })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Publish a schema document on the host's network; returns its SAID.
    pub async fn publish_schema(&self, document: &Value) -> Result<String> {
        let published: PublishedSchema = self.post(&["schemas"], None, document).await?;
        Ok(published.said)
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| HostError::Decode(format!("{} cannot be a base URL", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        segments: &[&str],
        controller: Option<&str>,
        body: Option<Value>,
    ) -> Result<T> {
        let url = self.url(segments)?;
        let start = Instant::now();

        let mut request = self.client.request(method.clone(), url.clone());
        if let Some(controller) = controller {
            request = request.header(CONTROLLER_HEADER, controller);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            tracing::warn!(method = %method, url = %url, error = %e, "Host request failed");
            unreachable(&url, &e)
        })?;

        let status = response.status();
        tracing::debug!(
            method = %method,
            url = %url,
            status = status.as_u16(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Host response"
        );

        let bytes = response.bytes().await.map_err(|e| unreachable(&url, &e))?;
        if !status.is_success() {
            let message = serde_json::from_slice::<ErrorBody>(&bytes)
                .map(|body| body.error)
                .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());
            return Err(status_error(status, message));
        }

        serde_json::from_slice(&bytes)
            .map_err(|e| HostError::Decode(format!("{method} {url}: {e}")))
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str], controller: &str) -> Result<T> {
        self.call(Method::GET, segments, Some(controller), None).await
    }

    async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        segments: &[&str],
        controller: Option<&str>,
        body: &B,
    ) -> Result<T> {
        let body = serde_json::to_value(body).map_err(kestrel_core::Error::from)?;
        self.call(Method::POST, segments, controller, Some(body)).await
    }
}

fn unreachable(url: &Url, error: &reqwest::Error) -> HostError {
    let failure = if error.is_timeout() {
        NetworkFailure::Timeout
    } else if error.is_connect() {
        if looks_like_dns(error) {
            NetworkFailure::Dns
        } else {
            NetworkFailure::ConnectionRefused
        }
    } else {
        NetworkFailure::Other
    };

    HostError::Unreachable {
        endpoint: url.origin().ascii_serialization(),
        failure,
        detail: error.to_string(),
    }
}

fn looks_like_dns(error: &reqwest::Error) -> bool {
    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string().to_lowercase();
        if text.contains("dns") || text.contains("lookup") || text.contains("resolve") {
            return true;
        }
        source = cause.source();
    }
    false
}

fn status_error(status: StatusCode, message: String) -> HostError {
    match status {
        StatusCode::NOT_FOUND => HostError::NotFound(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => HostError::Unauthorized(message),
        s if s.is_server_error() => HostError::Unavailable {
            status: s.as_u16(),
            message,
        },
        s => HostError::rejected(s.as_u16(), message),
    }
}

#[async_trait]
impl HostingService for HttpHost {
    async fn connect(&self, bootstrap: &ControllerBootstrap) -> Result<AgentInfo> {
        self.post(&["connect"], None, bootstrap).await
    }

    async fn operation(&self, controller: &str, name: &str) -> Result<Operation> {
        self.get(&["operations", name], controller).await
    }

    async fn resolve_oobi(&self, controller: &str, url: &str, alias: &str) -> Result<Operation> {
        let body = OobiRequest {
            url: url.to_string(),
            alias: alias.to_string(),
        };
        self.post(&["oobis"], Some(controller), &body).await
    }

    async fn query_key_state(&self, controller: &str, prefix: &str) -> Result<Operation> {
        let body = QueryRequest {
            prefix: prefix.to_string(),
        };
        self.post(&["queries"], Some(controller), &body).await
    }

    async fn key_event_log(&self, controller: &str, prefix: &str) -> Result<Vec<SignedEvent>> {
        self.get(&["kels", prefix], controller).await
    }

    async fn identifier(&self, controller: &str, alias: &str) -> Result<IdentifierRecord> {
        self.get(&["identifiers", alias], controller).await
    }

    async fn incept(&self, controller: &str, alias: &str, event: SignedEvent) -> Result<Operation> {
        let body = InceptRequest {
            alias: alias.to_string(),
            event,
        };
        self.post(&["identifiers"], Some(controller), &body).await
    }

    async fn interact(&self, controller: &str, alias: &str, event: SignedEvent) -> Result<Operation> {
        self.post(&["identifiers", alias, "events"], Some(controller), &event)
            .await
    }

    async fn registries(&self, controller: &str, alias: &str) -> Result<Vec<RegistryRecord>> {
        self.get(&["identifiers", alias, "registries"], controller)
            .await
    }

    async fn create_registry(
        &self,
        controller: &str,
        alias: &str,
        registry: RegistryRecord,
        anchor: SignedEvent,
    ) -> Result<Operation> {
        let body = RegistryRequest { registry, anchor };
        self.post(&["identifiers", alias, "registries"], Some(controller), &body)
            .await
    }

    async fn schema(&self, controller: &str, said: &str) -> Result<Value> {
        self.get(&["schemas", said], controller).await
    }

    async fn issue_credential(
        &self,
        controller: &str,
        alias: &str,
        credential: Credential,
        anchor: SignedEvent,
    ) -> Result<Operation> {
        let body = IssueRequest { credential, anchor };
        self.post(&["identifiers", alias, "credentials"], Some(controller), &body)
            .await
    }

    async fn submit_exchange(
        &self,
        controller: &str,
        alias: &str,
        exchange: SignedExchange,
    ) -> Result<Operation> {
        self.post(&["identifiers", alias, "exchanges"], Some(controller), &exchange)
            .await
    }

    async fn exchange(&self, controller: &str, said: &str) -> Result<SignedExchange> {
        self.get(&["exchanges", said], controller).await
    }

    async fn notifications(&self, controller: &str) -> Result<Vec<Notification>> {
        self.get(&["notifications"], controller).await
    }

    async fn mark_notification(&self, controller: &str, id: &str) -> Result<()> {
        let _: Value = self
            .call(Method::PUT, &["notifications", id], Some(controller), None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_segments_are_escaped() {
        let host = HttpHost::new("http://127.0.0.1:3902/api/", Duration::from_secs(1)).unwrap();
        let url = host.url(&["identifiers", "my wallet", "events"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:3902/api/identifiers/my%20wallet/events"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, "x".into()),
            HostError::NotFound(_)
        ));
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, "x".into()),
            HostError::Unauthorized(_)
        ));
        assert!(matches!(
            status_error(StatusCode::SERVICE_UNAVAILABLE, "x".into()),
            HostError::Unavailable { status: 503, .. }
        ));
        assert!(matches!(
            status_error(StatusCode::CONFLICT, "x".into()),
            HostError::Rejected { status: 409, .. }
        ));
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(HttpHost::new("not a url", Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_refused_connection_is_unreachable() {
        let host = HttpHost::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
        let result = host.notifications("Dcontroller").await;
        match result {
            Err(HostError::Unreachable { failure, .. }) => {
                assert_ne!(failure, NetworkFailure::Dns);
            }
            other => panic!("expected unreachable, got {other:?}"),
        }
    }
}
