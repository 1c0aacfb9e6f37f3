use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use monagent_error::{generic_error, ErrorContext as _, GenericError};
use reqwest::{header::CONTENT_TYPE, Client, Url};
use tracing::{debug, info};

const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

/// Where transactions are delivered.
///
/// Implementations own whatever client state they need (connections, credentials) and report every failure, whether
/// from the network, authentication, or the remote side, as an error. The transaction manager treats any error as a
/// failed attempt and retries the transaction later.
#[async_trait]
pub trait DeliveryEndpoint: Send + Sync {
    /// Returns a short name for logging.
    fn name(&self) -> &str;

    /// Delivers a single encoded batch.
    async fn post(&self, payload: Bytes) -> Result<(), GenericError>;
}

/// Delivers batches as JSON over HTTP(S).
pub struct HttpEndpoint {
    client: Client,
    url: Url,
    auth_token: Option<String>,
}

impl HttpEndpoint {
    /// Creates an endpoint posting to `url`.
    ///
    /// # Errors
    ///
    /// If `url` is not a valid URL, or the HTTP client cannot be built, an error is returned.
    pub fn new(url: &str, auth_token: Option<String>, request_timeout: Duration) -> Result<Self, GenericError> {
        let url = Url::parse(url).with_error_context(|| format!("Invalid forwarder URL '{}'.", url))?;
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .error_context("Failed to build HTTP client.")?;

        Ok(Self {
            client,
            url,
            auth_token,
        })
    }

    /// Returns the target URL.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl DeliveryEndpoint for HttpEndpoint {
    fn name(&self) -> &str {
        "http"
    }

    async fn post(&self, payload: Bytes) -> Result<(), GenericError> {
        let payload_len = payload.len();
        let mut request = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(payload);
        if let Some(token) = &self.auth_token {
            request = request.header(AUTH_TOKEN_HEADER, token);
        }

        let response = request
            .send()
            .await
            .with_error_context(|| format!("Failed to send request to {}.", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(generic_error!(
                "Endpoint {} responded with {}: {}",
                self.url,
                status,
                body.trim()
            ));
        }

        debug!(url = %self.url, %status, payload_len, "Delivered batch.");
        Ok(())
    }
}

/// Logs batches instead of delivering them.
///
/// Used when no forwarder URL is configured, so the agent can run without a backend.
#[derive(Default)]
pub struct LogEndpoint;

#[async_trait]
impl DeliveryEndpoint for LogEndpoint {
    fn name(&self) -> &str {
        "log"
    }

    async fn post(&self, payload: Bytes) -> Result<(), GenericError> {
        info!(payload = %String::from_utf8_lossy(&payload), "Discarding batch (no forwarder URL configured).");
        Ok(())
    }
}
