//! # Central Store Client
//!
//! The engine talks to the central store through the [`CentralApi`] trait.
//! [`HttpCentralClient`] is the production implementation; tests plug in
//! fakes or an in-process central store.
//!
//! ```text
//! SyncEngine ──► CentralApi::push ──► POST /v1/sync/push   (JSON, bearer)
//!            ──► CentralApi::pull ──► GET  /v1/sync/pull?deviceId&since&limit
//! ```

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

use tally_core::protocol::{PullRequest, PullResponse, PushRequest, PushResponse};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};

/// Remote side of the sync protocol.
#[async_trait]
pub trait CentralApi: Send + Sync {
    /// Submit an ordered batch of queued mutations.
    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse>;

    /// Fetch changes with a sequence number greater than `request.since`.
    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse>;
}

/// JSON-over-HTTP client for the central store.
#[derive(Debug, Clone)]
pub struct HttpCentralClient {
    http: reqwest::Client,
    base_url: Url,
    token: Option<String>,
    timeout: Duration,
}

impl HttpCentralClient {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> SyncResult<Self> {
        let base_url = Url::parse(base_url)?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Internal(format!("HTTP client: {e}")))?;

        Ok(HttpCentralClient {
            http,
            base_url,
            token,
            timeout,
        })
    }

    pub fn from_config(config: &SyncConfig) -> SyncResult<Self> {
        Self::new(
            &config.central.url,
            config.central.token.clone(),
            config.request_timeout(),
        )
    }

    fn endpoint(&self, path: &str) -> SyncResult<Url> {
        Ok(self.base_url.join(path)?)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn map_transport(&self, err: reqwest::Error) -> SyncError {
        if err.is_timeout() {
            SyncError::Timeout(self.timeout.as_secs())
        } else if err.is_decode() {
            SyncError::InvalidResponse(err.to_string())
        } else {
            SyncError::ConnectionFailed(err.to_string())
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(&self, response: Response) -> SyncResult<T> {
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::from_status(status.as_u16(), body));
        }
        response.json::<T>().await.map_err(|e| self.map_transport(e))
    }
}

#[async_trait]
impl CentralApi for HttpCentralClient {
    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        let url = self.endpoint("v1/sync/push")?;
        debug!(%url, entries = request.entries.len(), "Pushing batch");

        let response = self
            .authorize(self.http.post(url))
            .json(request)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        self.decode(response).await
    }

    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        let url = self.endpoint("v1/sync/pull")?;
        debug!(%url, since = request.since, "Pulling changes");

        let response = self
            .authorize(self.http.get(url))
            .query(&[
                ("deviceId", request.device_id.clone()),
                ("since", request.since.to_string()),
                ("limit", request.limit.to_string()),
            ])
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        self.decode(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_resolve_against_base() {
        let client =
            HttpCentralClient::new("http://central:8080", None, Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.endpoint("v1/sync/push").unwrap().as_str(),
            "http://central:8080/v1/sync/push"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let err = HttpCentralClient::new("central", None, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, SyncError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_unreachable_central_is_retryable() {
        // Port 9 (discard) on localhost is closed in test environments.
        let client =
            HttpCentralClient::new("http://127.0.0.1:9", None, Duration::from_secs(2)).unwrap();
        let err = client
            .pull(&PullRequest {
                device_id: "till-1".to_string(),
                since: 0,
                limit: 10,
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err:?}");
    }
}
