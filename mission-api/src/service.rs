use crate::auth::TokenProvider;
use crate::models::{PhotoUpload, RemoteReport, UploadedPhoto};
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;

/// Error type for remote API calls
#[derive(Debug, Clone, PartialEq)]
pub enum ApiError {
    /// Connection failed, DNS, TLS, reset...
    Network(String),
    /// Request exceeded the client timeout
    Timeout,
    /// Server answered with a non-success status
    Status { status: u16, body: String },
    /// Server answered 401, credential was handed back to the auth collaborator
    Unauthorized,
    /// Response body could not be decoded
    Decode(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Network(msg) => write!(f, "Network error: {}", msg),
            ApiError::Timeout => write!(f, "Request timed out"),
            ApiError::Status { status, body } if body.is_empty() => {
                write!(f, "Server returned status {}", status)
            }
            ApiError::Status { status, body } => {
                write!(f, "Server returned status {}: {}", status, body)
            }
            ApiError::Unauthorized => write!(f, "Unauthorized"),
            ApiError::Decode(msg) => write!(f, "Invalid response: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else {
            ApiError::Network(e.to_string())
        }
    }
}

impl ApiError {
    /// Build from an HTTP status and body
    pub fn from_status(status: u16, body: String) -> Self {
        if status == 401 {
            ApiError::Unauthorized
        } else {
            ApiError::Status { status, body }
        }
    }

    /// Whether retrying later may succeed (network trouble, timeouts, 408, 429, 5xx)
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Network(_) | ApiError::Timeout | ApiError::Decode(_) => true,
            ApiError::Status { status, .. } => matches!(*status, 408 | 429 | 500..=599),
            ApiError::Unauthorized => false,
        }
    }

    /// Whether the error means the connection itself is gone
    pub fn is_connectivity(&self) -> bool {
        matches!(self, ApiError::Network(_) | ApiError::Timeout)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::Status { status: 404, .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Status { status: 409, .. })
    }
}

/// Logical operations of the mission report backend
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Create a report; the client-generated id makes retried creates idempotent
    async fn create_report(
        &self,
        id: &str,
        payload: &serde_json::Value,
    ) -> Result<RemoteReport, ApiError>;

    /// Update a report (last write wins on the server)
    async fn update_report(
        &self,
        id: &str,
        payload: &serde_json::Value,
    ) -> Result<RemoteReport, ApiError>;

    async fn delete_report(&self, id: &str) -> Result<(), ApiError>;

    /// Upload one photo, returns its remote URL
    async fn upload_photo(&self, upload: &PhotoUpload) -> Result<UploadedPhoto, ApiError>;

    /// Cheap reachability check
    async fn ping(&self) -> Result<(), ApiError>;
}

/// reqwest-backed implementation of [`RemoteApi`]
pub struct HttpRemoteApi {
    base_url: String,
    client: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpRemoteApi {
    /// Create a new client; `timeout` bounds every request
    pub fn new(
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(30))
            .user_agent(concat!("mission-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ApiError::Network(format!("Client build failed: {}", e)))?;

        Ok(Self {
            base_url: base_url.into(),
            client,
            tokens,
        })
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    /// Attaches the bearer token (if any) and sends the request
    async fn send(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let request = match self.tokens.bearer_token().await {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            self.tokens.on_unauthorized().await;
            return Err(ApiError::Unauthorized);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), body));
        }

        Ok(response)
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn create_report(
        &self,
        id: &str,
        payload: &serde_json::Value,
    ) -> Result<RemoteReport, ApiError> {
        let request = self
            .client
            .post(self.url("reports"))
            .header("Idempotency-Key", id)
            .json(payload);

        let response = self.send(request).await?;
        let report = response.json::<RemoteReport>().await?;

        log::debug!("Created report {} remotely", report.id);
        Ok(report)
    }

    async fn update_report(
        &self,
        id: &str,
        payload: &serde_json::Value,
    ) -> Result<RemoteReport, ApiError> {
        let request = self
            .client
            .patch(self.url(&format!("reports/{}", id)))
            .json(payload);

        let response = self.send(request).await?;
        Ok(response.json::<RemoteReport>().await?)
    }

    async fn delete_report(&self, id: &str) -> Result<(), ApiError> {
        let request = self.client.delete(self.url(&format!("reports/{}", id)));
        self.send(request).await?;
        Ok(())
    }

    async fn upload_photo(&self, upload: &PhotoUpload) -> Result<UploadedPhoto, ApiError> {
        let part = reqwest::multipart::Part::bytes(upload.data.clone())
            .file_name(upload.file_name())
            .mime_str(&upload.content_type)
            .map_err(|e| ApiError::Network(format!("Invalid content type: {}", e)))?;

        let form = reqwest::multipart::Form::new()
            .text("id", upload.photo_id.clone())
            .text("kind", upload.kind.clone())
            .text("order", upload.order.to_string())
            .text("checksum", upload.checksum.clone())
            .part("file", part);

        let request = self
            .client
            .post(self.url(&format!("reports/{}/photos", upload.report_id)))
            .header("Idempotency-Key", upload.photo_id.as_str())
            .multipart(form);

        let response = self.send(request).await?;
        let uploaded = response.json::<UploadedPhoto>().await?;

        log::info!(
            "Uploaded photo {} ({} bytes) for report {}",
            upload.photo_id,
            upload.data.len(),
            upload.report_id
        );
        Ok(uploaded)
    }

    async fn ping(&self) -> Result<(), ApiError> {
        let request = self.client.get(self.url("health"));
        self.send(request).await?;
        Ok(())
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
