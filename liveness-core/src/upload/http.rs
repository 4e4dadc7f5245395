//! HTTP uploader for the verification backend

use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Body, Client};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};
use url::Url;

use super::{receiver_stream, UploadEvent, UploadStream, Uploader};
use crate::config::{ConfigError, RelayConfig};
use crate::relay::RelayEnvelope;

const DEVICE_KEY_HEADER: &str = "X-Device-Key";
const TESTING_API_HEADER: &str = "X-Testing-API-Header";

/// Errors that can occur during one upload attempt
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected response (HTTP {0})")]
    Status(u16),

    #[error("Invalid response body: {0}")]
    InvalidBody(#[from] serde_json::Error),

    #[error("Response did not contain a responseBlob")]
    MissingResponseBlob,
}

impl UploadError {
    /// Only connection-level failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::Http(_))
    }
}

#[derive(Serialize)]
struct ProcessRequest<'a> {
    #[serde(rename = "requestBlob")]
    request_blob: &'a str,
    #[serde(rename = "externalDatabaseRefID", skip_serializing_if = "Option::is_none")]
    external_database_ref_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct ProcessResponse {
    #[serde(rename = "responseBlob")]
    response_blob: Option<String>,
}

/// Posts request blobs to the processing endpoint and streams upload progress
#[derive(Debug, Clone)]
pub struct HttpUploader {
    http: Client,
    endpoint: Url,
    device_key: String,
    testing_api_header: Option<String>,
    max_retries: u32,
    retry_delay: Duration,
    chunk_size: usize,
}

impl HttpUploader {
    pub fn new(config: &RelayConfig) -> Result<Self, ConfigError> {
        let endpoint = config.validate()?;

        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .expect("Failed to build HTTP client");

        Ok(Self {
            http,
            endpoint,
            device_key: config.device_key_identifier.clone(),
            testing_api_header: config.testing_api_header.clone(),
            max_retries: config.max_transport_retries,
            retry_delay: config.retry_delay(),
            chunk_size: config.upload_chunk_size as usize,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Send the request, retrying connection failures
    #[instrument(skip(self, envelope, events), fields(endpoint = %self.endpoint))]
    async fn send_with_retries(
        &self,
        request_id: u64,
        envelope: &RelayEnvelope,
        events: &mpsc::UnboundedSender<UploadEvent>,
    ) -> Result<String, UploadError> {
        let body = serde_json::to_vec(&ProcessRequest {
            request_blob: &envelope.request_blob,
            external_database_ref_id: Some(envelope.external_database_ref_id.as_str())
                .filter(|s| !s.is_empty()),
        })?;

        let mut attempt = 0;
        loop {
            match self.send_once(&body, events).await {
                Ok(blob) => return Ok(blob),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "Upload of request {} failed ({}), retry {}/{}",
                        request_id, e, attempt, self.max_retries
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(
        &self,
        body: &[u8],
        events: &mpsc::UnboundedSender<UploadEvent>,
    ) -> Result<String, UploadError> {
        let total = body.len();
        let chunks: Vec<Vec<u8>> = body.chunks(self.chunk_size).map(<[u8]>::to_vec).collect();

        // Progress is reported as each chunk is handed to the connection
        let progress_tx = events.clone();
        let mut sent = 0usize;
        let stream = futures::stream::iter(chunks).map(move |chunk| {
            sent += chunk.len();
            let _ = progress_tx.send(UploadEvent::Progress(sent as f32 / total as f32));
            Ok::<_, std::io::Error>(chunk)
        });

        let mut req = self
            .http
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(DEVICE_KEY_HEADER, &self.device_key)
            .body(Body::wrap_stream(stream));
        if let Some(header) = &self.testing_api_header {
            req = req.header(TESTING_API_HEADER, header);
        }

        let resp = req.send().await?;
        debug!("Response status: {}", resp.status());

        let status = resp.status();
        if !status.is_success() {
            return Err(UploadError::Status(status.as_u16()));
        }

        let text = resp.text().await?;
        parse_response_blob(&text)
    }
}

impl Uploader for HttpUploader {
    fn upload(&self, request_id: u64, envelope: RelayEnvelope) -> UploadStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let uploader = self.clone();

        tokio::spawn(async move {
            let event = match uploader.send_with_retries(request_id, &envelope, &tx).await {
                Ok(blob) => {
                    debug!("Request {} answered ({} bytes)", request_id, blob.len());
                    UploadEvent::Response(blob)
                }
                Err(e) => {
                    warn!("Upload of request {} failed: {}", request_id, e);
                    UploadEvent::TransportFailure(e.to_string())
                }
            };
            let _ = tx.send(event);
        });

        receiver_stream(rx)
    }
}

fn parse_response_blob(body: &str) -> Result<String, UploadError> {
    let resp: ProcessResponse = serde_json::from_str(body)?;
    resp.response_blob.ok_or(UploadError::MissingResponseBlob)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::net::SocketAddr;

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn config_for(addr: SocketAddr) -> RelayConfig {
        RelayConfig {
            retry_delay_ms: 10,
            ..RelayConfig::new(format!("http://{}/process", addr), "dev-key")
        }
        .with_testing_api_header("testing")
    }

    async fn echo(headers: HeaderMap, Json(body): Json<Value>) -> Result<Json<Value>, StatusCode> {
        if headers.get("x-device-key").and_then(|v| v.to_str().ok()) != Some("dev-key") {
            return Err(StatusCode::UNAUTHORIZED);
        }
        if headers.get("x-testing-api-header").is_none() {
            return Err(StatusCode::UNAUTHORIZED);
        }
        let blob = body["requestBlob"].as_str().unwrap_or_default();
        let ref_id = body["externalDatabaseRefID"].as_str().unwrap_or("none");
        Ok(Json(json!({ "responseBlob": format!("{}:{}", blob, ref_id) })))
    }

    fn envelope(blob: &str) -> RelayEnvelope {
        RelayEnvelope::new("abc", blob)
    }

    #[test]
    fn test_parse_response_blob() {
        assert_eq!(parse_response_blob(r#"{"responseBlob":"r"}"#).unwrap(), "r");
        assert!(matches!(
            parse_response_blob(r#"{"wasProcessed":true}"#),
            Err(UploadError::MissingResponseBlob)
        ));
        assert!(matches!(parse_response_blob("<html>"), Err(UploadError::InvalidBody(_))));
        assert!(matches!(
            parse_response_blob(r#"{"responseBlob":42}"#),
            Err(UploadError::InvalidBody(_))
        ));
    }

    #[tokio::test]
    async fn test_upload_success_sends_headers_and_ref_id() {
        let addr = serve(Router::new().route("/process", post(echo))).await;
        let uploader = HttpUploader::new(&config_for(addr)).unwrap();

        let events: Vec<UploadEvent> = uploader
            .upload(1, envelope("blobA").with_external_database_ref_id("user-1"))
            .collect()
            .await;

        assert_eq!(events.last(), Some(&UploadEvent::Response("blobA:user-1".to_string())));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_empty_ref_id_is_omitted() {
        let addr = serve(Router::new().route("/process", post(echo))).await;
        let uploader = HttpUploader::new(&config_for(addr)).unwrap();

        let events: Vec<UploadEvent> = uploader.upload(1, envelope("blobA")).collect().await;
        assert_eq!(events.last(), Some(&UploadEvent::Response("blobA:none".to_string())));
    }

    #[tokio::test]
    async fn test_missing_response_blob_is_a_transport_failure() {
        let app = Router::new().route(
            "/process",
            post(|| async { Json(json!({ "error": true })) }),
        );
        let addr = serve(app).await;
        let uploader = HttpUploader::new(&config_for(addr)).unwrap();

        let events: Vec<UploadEvent> = uploader.upload(1, envelope("blobA")).collect().await;
        assert!(matches!(events.last(), Some(UploadEvent::TransportFailure(_))));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_error_status_is_a_transport_failure() {
        let app = Router::new().route(
            "/process",
            post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        );
        let addr = serve(app).await;
        let uploader = HttpUploader::new(&config_for(addr)).unwrap();

        let events: Vec<UploadEvent> = uploader.upload(1, envelope("blobA")).collect().await;
        assert_eq!(
            events.last(),
            Some(&UploadEvent::TransportFailure("Unexpected response (HTTP 500)".to_string()))
        );
    }

    #[tokio::test]
    async fn test_unreachable_backend_fails_after_retries() {
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let uploader = HttpUploader::new(&config_for(addr)).unwrap();

        let events: Vec<UploadEvent> = uploader.upload(1, envelope("blobA")).collect().await;
        let terminals: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminals.len(), 1);
        assert!(matches!(terminals[0], UploadEvent::TransportFailure(_)));
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_reaches_one() {
        let addr = serve(Router::new().route("/process", post(echo))).await;
        let mut config = config_for(addr);
        config.upload_chunk_size = 8;
        let uploader = HttpUploader::new(&config).unwrap();

        let blob = "x".repeat(200);
        let events: Vec<UploadEvent> = uploader.upload(1, envelope(&blob)).collect().await;

        let progress: Vec<f32> = events
            .iter()
            .filter_map(|e| match e {
                UploadEvent::Progress(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert!(progress.len() > 1);
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.last(), Some(&1.0));
        assert!(matches!(events.last(), Some(UploadEvent::Response(_))));
    }
}
