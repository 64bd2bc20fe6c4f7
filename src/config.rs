//! Process-wide SDK configuration.
//!
//! Settings are resolved once at startup, either from the environment with
//! [`SdkConfig::from_env`] or programmatically through the `with_*` builders,
//! and shared by the stream and publish clients.

use std::time::Duration;

use reqwest::header::{HeaderValue, InvalidHeaderValue};
use reqwest::{RequestBuilder, Url};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

/// Local development base URL for the booking SSE service.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8081";
/// `user_id` stamped on generated publish requests.
pub const DEFAULT_USER_ID: &str = "user-789";
/// `metadata.source` stamped on generated publish requests.
pub const DEFAULT_PUBLISH_SOURCE: &str = "rust-sdk";
/// Delay before a session's one-shot auto-publish fires.
pub const DEFAULT_AUTO_PUBLISH_DELAY: Duration = Duration::from_secs(10);

/// Query parameter used by [`CredentialPlacement::Query`].
pub const API_KEY_QUERY_PARAM: &str = "k";
/// Header used by [`CredentialPlacement::Header`].
pub const API_KEY_HEADER: &str = "x-api-key";

pub const BASE_URL_ENV: &str = "SSE_BASE_URL";
pub const API_KEY_ENV: &str = "API_KEY";
pub const CREDENTIAL_MODE_ENV: &str = "SSE_CREDENTIAL_MODE";
pub const TRANSPORT_ENV: &str = "SSE_TRANSPORT";
pub const USER_ID_ENV: &str = "SSE_USER_ID";
pub const AUTO_PUBLISH_DELAY_ENV: &str = "SSE_AUTO_PUBLISH_DELAY_MS";

/// Where the API key travels on subscribe and publish requests.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CredentialPlacement {
    /// `?k=<key>` query parameter.
    #[default]
    Query,
    /// `x-api-key` request header.
    Header,
}

impl CredentialPlacement {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "query" => Some(Self::Query),
            "header" => Some(Self::Header),
            _ => None,
        }
    }
}

/// Backend used to read the subscription body.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum StreamTransport {
    /// Raw byte chunks reassembled by [`crate::stream::decoder::FrameDecoder`].
    #[default]
    ByteStream,
    /// Full SSE event parsing, routing the default and `BOOKING_UPDATED`
    /// channels through the same handler.
    EventSource,
}

impl StreamTransport {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bytes" | "byte-stream" => Some(Self::ByteStream),
            "eventsource" | "event-source" => Some(Self::EventSource),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid base url {value:?}: {reason}")]
    InvalidBaseUrl { value: String, reason: String },

    #[error("invalid SSE_CREDENTIAL_MODE {0:?}, expected query or header")]
    InvalidCredentialMode(String),

    #[error("invalid SSE_TRANSPORT {0:?}, expected bytes or eventsource")]
    InvalidTransport(String),

    #[error("invalid SSE_AUTO_PUBLISH_DELAY_MS {value:?}: {source}")]
    InvalidDelay {
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },
}

/// Connection settings shared by [`crate::stream::client::StreamClient`] and
/// [`crate::publish::PublishClient`].
#[derive(Clone, Debug)]
pub struct SdkConfig {
    base_url: Url,
    api_key: Option<SecretString>,
    credential_placement: CredentialPlacement,
    transport: StreamTransport,
    user_id: String,
    publish_source: String,
    auto_publish_delay: Duration,
}

impl SdkConfig {
    /// Creates a configuration for `base_url` with every other setting at its
    /// default and no credential.
    pub fn new(base_url: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: parse_base_url(base_url)?,
            api_key: None,
            credential_placement: CredentialPlacement::default(),
            transport: StreamTransport::default(),
            user_id: DEFAULT_USER_ID.to_string(),
            publish_source: DEFAULT_PUBLISH_SOURCE.to_string(),
            auto_publish_delay: DEFAULT_AUTO_PUBLISH_DELAY,
        })
    }

    /// Resolves configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolves configuration through `lookup`, treating blank values as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let base_url = get(BASE_URL_ENV).unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let mut config = Self::new(&base_url)?;

        if let Some(api_key) = get(API_KEY_ENV) {
            config.api_key = Some(SecretString::new(api_key));
        }
        if let Some(mode) = get(CREDENTIAL_MODE_ENV) {
            config.credential_placement =
                CredentialPlacement::parse(&mode).ok_or(ConfigError::InvalidCredentialMode(mode))?;
        }
        if let Some(transport) = get(TRANSPORT_ENV) {
            config.transport =
                StreamTransport::parse(&transport).ok_or(ConfigError::InvalidTransport(transport))?;
        }
        if let Some(user_id) = get(USER_ID_ENV) {
            config.user_id = user_id;
        }
        if let Some(delay) = get(AUTO_PUBLISH_DELAY_ENV) {
            let millis = delay
                .trim()
                .parse::<u64>()
                .map_err(|source| ConfigError::InvalidDelay {
                    value: delay.clone(),
                    source,
                })?;
            config.auto_publish_delay = Duration::from_millis(millis);
        }

        Ok(config)
    }

    /// Sets the credential sent with subscribe and publish requests.
    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    /// Chooses between the `k` query parameter and the `x-api-key` header.
    pub fn with_credential_placement(mut self, placement: CredentialPlacement) -> Self {
        self.credential_placement = placement;
        self
    }

    /// Selects the backend used to read the subscription body.
    pub fn with_transport(mut self, transport: StreamTransport) -> Self {
        self.transport = transport;
        self
    }

    /// Overrides the `user_id` stamped on generated publish requests.
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    /// Overrides the `metadata.source` stamped on generated publish requests.
    pub fn with_publish_source(mut self, source: impl Into<String>) -> Self {
        self.publish_source = source.into();
        self
    }

    /// Sets how long a session waits after connecting before auto-publishing.
    pub fn with_auto_publish_delay(mut self, delay: Duration) -> Self {
        self.auto_publish_delay = delay;
        self
    }

    /// Validated service base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Whether a credential is configured.
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Where the credential travels on requests.
    pub fn credential_placement(&self) -> CredentialPlacement {
        self.credential_placement
    }

    /// Backend used by [`crate::stream::client::StreamClient`].
    pub fn transport(&self) -> StreamTransport {
        self.transport
    }

    /// `user_id` for generated publish requests.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Provenance source for generated publish requests.
    pub fn publish_source(&self) -> &str {
        &self.publish_source
    }

    /// Delay before a session's one-shot auto-publish.
    pub fn auto_publish_delay(&self) -> Duration {
        self.auto_publish_delay
    }

    /// `GET` endpoint for a booking's update stream.
    pub fn subscribe_url(&self, booking_id: &str) -> Url {
        self.endpoint(&["api", "sse", "subscribe", "bookings", booking_id])
    }

    /// `POST` endpoint that emits an update into a booking's stream.
    pub fn publish_url(&self, booking_id: &str) -> Url {
        self.endpoint(&["api", "sse", "events", "bookings", booking_id, "updated"])
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // Base urls are checked to be hierarchical when the config is built.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Checks that the credential can be sent as a header value.
    pub(crate) fn validate_credential(&self) -> Result<(), InvalidHeaderValue> {
        match (&self.api_key, self.credential_placement) {
            (Some(api_key), CredentialPlacement::Header) => {
                HeaderValue::from_str(api_key.expose_secret()).map(|_| ())
            }
            _ => Ok(()),
        }
    }

    /// Attaches the credential to an outgoing request.
    pub(crate) fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        let Some(api_key) = self.api_key.as_ref() else {
            return builder;
        };
        match self.credential_placement {
            CredentialPlacement::Query => {
                builder.query(&[(API_KEY_QUERY_PARAM, api_key.expose_secret().as_str())])
            }
            CredentialPlacement::Header => builder.header(API_KEY_HEADER, api_key.expose_secret()),
        }
    }
}

fn parse_base_url(value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value.trim()).map_err(|err| ConfigError::InvalidBaseUrl {
        value: value.to_string(),
        reason: err.to_string(),
    })?;
    if url.cannot_be_a_base() {
        return Err(ConfigError::InvalidBaseUrl {
            value: value.to_string(),
            reason: "url cannot carry a path".to_string(),
        });
    }
    Ok(url)
}
