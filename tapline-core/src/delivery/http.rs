//! HTTP client for the collector API
//!
//! Endpoints:
//! - `POST /v1/init` - register a device fingerprint, returns the LID
//! - `POST /v1/batch` - deliver a batch of records
//! - `GET /health` - reachability probe

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::DeliveryClient;
use crate::config::DeliveryConfig;
use crate::error::{DeliveryError, Error, Result};
use crate::types::{DeviceFingerprint, EventRecord};

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Response from POST /v1/init
#[derive(Debug, Deserialize)]
pub struct InitResponse {
    /// Collector-assigned device/session identity
    pub lid: String,
}

/// HTTP client for the collector API
pub struct HttpDeliveryClient {
    config: DeliveryConfig,
    http_client: reqwest::Client,
    base_url: String,
    lid: RwLock<Option<String>>,
    retry_delay: Duration,
}

impl HttpDeliveryClient {
    /// Create a new client from configuration
    ///
    /// Returns an error if the configuration is invalid or missing required fields.
    pub fn new(config: DeliveryConfig) -> Result<Self> {
        config.validate()?;

        let base_url = config
            .endpoint
            .clone()
            .ok_or_else(|| Error::Config("delivery.endpoint is required".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(api_key) = &config.api_key {
            let auth_value = format!("Bearer {}", api_key);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value)
                    .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?,
            );
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http_client,
            base_url,
            lid: RwLock::new(None),
            retry_delay: INITIAL_RETRY_DELAY,
        })
    }

    /// Override the first backoff delay (doubles per attempt)
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Identity attached to batches, once registered
    pub fn lid(&self) -> Option<String> {
        self.lid
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reuse an identity from an earlier registration
    pub fn set_lid(&self, lid: impl Into<String>) {
        *self.lid.write().unwrap_or_else(PoisonError::into_inner) = Some(lid.into());
    }

    /// Register this device and remember the returned LID
    pub async fn register(
        &self,
        fingerprint: &DeviceFingerprint,
    ) -> std::result::Result<String, DeliveryError> {
        let url = format!("{}/v1/init", self.base_url);

        let response = self
            .http_client
            .post(&url)
            .json(fingerprint)
            .send()
            .await
            .map_err(|e| DeliveryError::Request(e.to_string()))?;

        let response = check_status(response).await?;
        let init: InitResponse = response
            .json()
            .await
            .map_err(|e| DeliveryError::Decode(e.to_string()))?;

        tracing::info!(lid = %init.lid, "Registered device with collector");
        self.set_lid(init.lid.clone());
        Ok(init.lid)
    }

    /// Single delivery attempt
    async fn send_batch(&self, records: &[EventRecord]) -> std::result::Result<(), DeliveryError> {
        let url = format!("{}/v1/batch", self.base_url);
        let lid = self.lid();

        let request_body = BatchRequest {
            lid: lid.as_deref(),
            events: records,
        };

        let response = self
            .http_client
            .post(&url)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| DeliveryError::Request(e.to_string()))?;

        check_status(response).await?;
        Ok(())
    }

    /// Deliver with retry logic
    ///
    /// Retries transient failures (5xx, timeouts) with exponential backoff.
    async fn send_batch_with_retry(
        &self,
        records: &[EventRecord],
    ) -> std::result::Result<(), DeliveryError> {
        let mut last_error = None;
        let mut delay = self.retry_delay;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tracing::debug!(
                    "Retrying batch delivery (attempt {}/{}), waiting {:?}",
                    attempt + 1,
                    self.config.max_retries + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, MAX_RETRY_DELAY);
            }

            match self.send_batch(records).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    tracing::warn!("Transient error delivering batch: {}", e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| DeliveryError::Request("max retries exceeded".to_string())))
    }
}

#[async_trait]
impl DeliveryClient for HttpDeliveryClient {
    async fn send(&self, records: &[EventRecord]) -> std::result::Result<(), DeliveryError> {
        if records.is_empty() {
            return Ok(());
        }
        self.send_batch_with_retry(records).await
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);

        match self.http_client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Request body for POST /v1/batch
#[derive(Serialize)]
struct BatchRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    lid: Option<&'a str>,
    events: &'a [EventRecord],
}

/// Turn a non-2xx response into a `DeliveryError::Status`
async fn check_status(
    response: reqwest::Response,
) -> std::result::Result<reqwest::Response, DeliveryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown".to_string());
    Err(DeliveryError::Status {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventKind;
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;
    use serde_json::json;

    fn config_for(server: &MockServer) -> DeliveryConfig {
        DeliveryConfig {
            enabled: true,
            endpoint: Some(server.base_url()),
            api_key: Some("tk_test".to_string()),
            max_retries: 2,
            ..Default::default()
        }
    }

    fn records() -> Vec<EventRecord> {
        vec![
            EventRecord::new(EventKind::Touch, json!({"x": 1})),
            EventRecord::new(EventKind::Touch, json!({"x": 2})),
        ]
    }

    #[test]
    fn test_client_requires_valid_config() {
        let config = DeliveryConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(HttpDeliveryClient::new(config).is_err());
    }

    #[tokio::test]
    async fn test_send_posts_batch_with_auth() {
        let server = MockServer::start();
        let batch = records();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/batch")
                .header("authorization", "Bearer tk_test")
                .header("content-type", "application/json")
                .body_contains(batch[0].id.to_string())
                .body_contains(batch[1].id.to_string());
            then.status(202);
        });

        let client = HttpDeliveryClient::new(config_for(&server)).unwrap();
        client.send(&batch).await.expect("send should succeed");

        mock.assert();
    }

    #[tokio::test]
    async fn test_register_stores_lid_and_attaches_it() {
        let server = MockServer::start();
        let init = server.mock(|when, then| {
            when.method(POST).path("/v1/init").body_contains("\"platform\":\"ios\"");
            then.status(200).json_body(json!({ "lid": "lid-123" }));
        });
        let batch = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/batch")
                .body_contains("\"lid\":\"lid-123\"");
            then.status(200);
        });

        let client = HttpDeliveryClient::new(config_for(&server)).unwrap();
        let fingerprint = DeviceFingerprint {
            platform: "ios".to_string(),
            ..Default::default()
        };
        let lid = client.register(&fingerprint).await.unwrap();
        client.send(&records()).await.unwrap();

        assert_eq!(lid, "lid-123");
        assert_eq!(client.lid().as_deref(), Some("lid-123"));
        init.assert();
        batch.assert();
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/v1/batch");
            then.status(400).body("bad payload");
        });

        let client = HttpDeliveryClient::new(config_for(&server))
            .unwrap()
            .with_retry_delay(Duration::from_millis(1));
        let err = client.send(&records()).await.unwrap_err();

        assert!(matches!(err, DeliveryError::Status { status: 400, .. }));
        mock.assert_hits(1);
    }

    #[tokio::test]
    async fn test_server_error_is_retried_then_surfaced() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/v1/batch");
            then.status(503);
        });

        let client = HttpDeliveryClient::new(config_for(&server))
            .unwrap()
            .with_retry_delay(Duration::from_millis(1));
        let err = client.send(&records()).await.unwrap_err();

        assert!(matches!(err, DeliveryError::Status { status: 503, .. }));
        mock.assert_hits(3);
    }

    #[tokio::test]
    async fn test_health_check() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/health");
            then.status(200);
        });

        let client = HttpDeliveryClient::new(config_for(&server)).unwrap();
        assert!(client.health_check().await);
    }

    #[tokio::test]
    async fn test_unreachable_collector_is_transient() {
        let config = DeliveryConfig {
            enabled: true,
            endpoint: Some("http://127.0.0.1:9".to_string()),
            api_key: Some("tk_test".to_string()),
            max_retries: 0,
            ..Default::default()
        };
        let client = HttpDeliveryClient::new(config).unwrap();

        let err = client.send(&records()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(!client.health_check().await);
    }
}
