use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::SdkConfig;
use crate::stream::proto::PublishRequest;

const ERROR_BODY_SNIPPET_LEN: usize = 220;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PublishDefaults;

impl PublishDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
}

#[derive(Clone, Debug)]
pub struct PublishClientOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for PublishClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: PublishDefaults::CONNECT_TIMEOUT,
            request_timeout: PublishDefaults::REQUEST_TIMEOUT,
        }
    }
}

/// Client for the endpoint that emits a new update into a booking stream.
#[derive(Clone, Debug)]
pub struct PublishClient {
    http: Client,
    config: SdkConfig,
    request_timeout: Duration,
}

impl PublishClient {
    /// Builds a client with [`PublishClientOptions::default`].
    pub fn new(config: SdkConfig) -> Result<Self, PublishError> {
        Self::with_options(config, PublishClientOptions::default())
    }

    /// Builds a client with explicit connect and request timeouts.
    pub fn with_options(
        config: SdkConfig,
        options: PublishClientOptions,
    ) -> Result<Self, PublishError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(PublishError::transport)?;

        Ok(Self {
            http,
            config,
            request_timeout: options.request_timeout,
        })
    }

    /// Settings this client was built with.
    pub fn config(&self) -> &SdkConfig {
        &self.config
    }

    /// Publishes a freshly stamped update using the configured `user_id` and
    /// provenance source.
    pub async fn publish_update(&self, booking_id: &str) -> Result<PublishAck, PublishError> {
        let request = PublishRequest::fresh(self.config.user_id(), self.config.publish_source());
        self.publish(booking_id, &request).await
    }

    /// Sends one publish request. Never retries.
    pub async fn publish(
        &self,
        booking_id: &str,
        request: &PublishRequest,
    ) -> Result<PublishAck, PublishError> {
        let endpoint = self.config.publish_url(booking_id);
        let builder = self.config.authorize(
            self.http
                .post(endpoint)
                .timeout(self.request_timeout)
                .json(request),
        );

        let response = builder.send().await.map_err(|err| {
            let err = PublishError::transport(err);
            warn!(event = "publish_send_failed", booking_id, error = %err);
            err
        })?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                event = "publish_rejected",
                booking_id,
                status = status.as_u16(),
                body = %summarize_error_body(&body)
            );
            return Err(PublishError::HttpStatus { status, body });
        }

        let body = response.text().await.map_err(PublishError::transport)?;

        debug!(
            event = "publish_acknowledged",
            booking_id,
            event_id = %request.event_id,
            status = status.as_u16()
        );
        Ok(PublishAck::from_body(status, &body))
    }
}

/// Successful publish response.
#[derive(Clone, Debug, PartialEq)]
pub struct PublishAck {
    pub status: StatusCode,
    /// Parsed JSON body; a non-JSON body is kept as a string value and an
    /// empty one as `null`.
    pub body: Value,
}

impl PublishAck {
    fn from_body(status: StatusCode, body: &str) -> Self {
        let body = if body.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
        };
        Self { status, body }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    /// No usable response. The request URL is stripped, since it may carry
    /// the credential.
    #[error("publish request failed: {0}")]
    Transport(reqwest::Error),

    /// Non-success status with the full response body.
    #[error("publish http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },
}

impl PublishError {
    pub(crate) fn transport(err: reqwest::Error) -> Self {
        Self::Transport(err.without_url())
    }

    /// Whether a caller-level retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
        }
    }

    /// HTTP status behind the failure, when one was received.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Transport(err) => err.status(),
            Self::HttpStatus { status, .. } => Some(*status),
        }
    }
}

/// Short form of an error body for log lines.
pub(crate) fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message).or(parsed.reason) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use serde_json::{json, Value};

    use super::{summarize_error_body, PublishAck, PublishError, ERROR_BODY_SNIPPET_LEN};

    #[test]
    fn plain_text_error_body_is_kept_verbatim() {
        assert_eq!(summarize_error_body("server error"), "server error");
    }

    #[test]
    fn json_error_body_is_reduced_to_its_message() {
        assert_eq!(
            summarize_error_body(r#"{"error":"booking not found","code":404}"#),
            "booking not found"
        );
        assert_eq!(
            summarize_error_body(r#"{"message":"invalid api key"}"#),
            "invalid api key"
        );
    }

    #[test]
    fn long_error_body_is_truncated() {
        let body = "x".repeat(ERROR_BODY_SNIPPET_LEN * 2);
        assert_eq!(
            summarize_error_body(&body).chars().count(),
            ERROR_BODY_SNIPPET_LEN
        );
    }

    #[test]
    fn ack_keeps_json_and_tolerates_other_bodies() {
        let ack = PublishAck::from_body(StatusCode::OK, r#"{"published":true}"#);
        assert_eq!(ack.body, json!({"published": true}));

        let ack = PublishAck::from_body(StatusCode::ACCEPTED, "queued");
        assert_eq!(ack.body, Value::String("queued".to_string()));

        let ack = PublishAck::from_body(StatusCode::NO_CONTENT, "");
        assert_eq!(ack.body, Value::Null);
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        let error = PublishError::HttpStatus {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: "server error".to_string(),
        };
        assert!(error.is_retryable());
        assert_eq!(error.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));

        let error = PublishError::HttpStatus {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: String::new(),
        };
        assert!(error.is_retryable());

        let error = PublishError::HttpStatus {
            status: StatusCode::UNAUTHORIZED,
            body: "unauthorized".to_string(),
        };
        assert!(!error.is_retryable());
    }
}
