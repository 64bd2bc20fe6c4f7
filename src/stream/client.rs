//! Low-level SSE subscription client.
//!
//! [`StreamClient::connect`] spawns a background worker that owns the HTTP
//! response body, decodes frames with the configured backend, and forwards
//! ordered [`StreamUpdate`]s to the returned [`StreamConnection`]. The client
//! never reconnects on its own; retry policy belongs to the caller.

use std::time::Duration;

use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::StreamExt;
use reqwest::header::{InvalidHeaderValue, ACCEPT};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{SdkConfig, StreamTransport};
use crate::publish::summarize_error_body;
use crate::stream::decoder::FrameDecoder;
use crate::stream::proto::{
    decode_frame, BookingEvent, StreamFrame, BOOKING_UPDATED_CHANNEL, DEFAULT_CHANNEL,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_STREAM_MIME: &str = "text/event-stream";

/// Subscription lifecycle as reported by the transport.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// `retryable` is false when the subscription could not be opened at all,
    /// true when an open stream failed part way through.
    Errored { retryable: bool },
}

impl ConnectionState {
    /// True only for [`ConnectionState::Connected`].
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Ordered output of a stream worker.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamUpdate {
    Status(ConnectionState),
    /// `connected` acknowledgement frame. Never a booking event.
    Handshake { message: Option<String> },
    Event(BookingEvent),
}

/// Entry point for opening booking subscriptions.
#[derive(Clone, Debug)]
pub struct StreamClient {
    http: Client,
    config: SdkConfig,
}

impl StreamClient {
    /// Builds a client with a connect timeout and no total request timeout.
    pub fn new(config: SdkConfig) -> Result<Self, StreamClientError> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(StreamClientError::transport)?;
        Ok(Self::with_http_client(config, http))
    }

    /// Uses a caller-provided HTTP client. It must not set a total request
    /// timeout, or long-lived subscriptions will be cut off.
    pub fn with_http_client(config: SdkConfig, http: Client) -> Self {
        Self { http, config }
    }

    /// Settings this client was built with.
    pub fn config(&self) -> &SdkConfig {
        &self.config
    }

    /// Opens a subscription to `booking_id`'s update stream.
    ///
    /// The returned connection starts in [`ConnectionState::Connecting`]; the
    /// outcome of the open arrives as a [`StreamUpdate::Status`]. Must be
    /// called from within a Tokio runtime.
    pub fn connect(&self, booking_id: &str) -> Result<StreamConnection, StreamClientError> {
        self.config.validate_credential()?;

        let url = self.config.subscribe_url(booking_id);
        let request = self
            .config
            .authorize(self.http.get(url.clone()).header(ACCEPT, EVENT_STREAM_MIME));

        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let transport = self.config.transport();
        let booking_id = booking_id.to_string();

        debug!(event = "stream_connecting", url = %url, ?transport);
        let worker = tokio::spawn(async move {
            stream_connection_worker(request, transport, booking_id, updates_tx).await;
        });

        Ok(StreamConnection {
            receiver: updates_rx,
            worker: Some(worker),
            state: ConnectionState::Connecting,
        })
    }
}

/// Handle to one live subscription.
///
/// Dropping the handle has the same effect as [`StreamConnection::disconnect`].
#[derive(Debug)]
pub struct StreamConnection {
    receiver: mpsc::UnboundedReceiver<StreamUpdate>,
    worker: Option<JoinHandle<()>>,
    state: ConnectionState,
}

impl StreamConnection {
    /// Receives the next update, or `None` once the worker has finished or
    /// the connection was disconnected.
    pub async fn recv(&mut self) -> Option<StreamUpdate> {
        self.worker.as_ref()?;
        match self.receiver.recv().await {
            Some(update) => {
                if let StreamUpdate::Status(state) = &update {
                    self.state = *state;
                }
                Some(update)
            }
            None => {
                // Every update has been drained and the worker has exited.
                self.worker = None;
                None
            }
        }
    }

    /// Last status observed through [`StreamConnection::recv`].
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True once the connection was disconnected or the worker has exited on
    /// its own. Updates sent before the exit can still be drained with
    /// [`StreamConnection::recv`].
    pub fn is_closed(&self) -> bool {
        self.worker.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stops the worker and discards undelivered updates. Idempotent.
    pub fn disconnect(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
            self.receiver.close();
            debug!(event = "stream_disconnected");
        }
        self.state = ConnectionState::Disconnected;
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

/// Errors produced while opening or reading a subscription.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// API key could not be converted to a valid HTTP header value.
    #[error("invalid api-key header: {0}")]
    InvalidApiKeyHeader(#[from] InvalidHeaderValue),

    /// Connection, TLS, or body read failure. The request URL is stripped,
    /// since it may carry the credential.
    #[error("stream transport error: {0}")]
    Transport(reqwest::Error),

    /// Subscribe endpoint answered with a non-success status. `body` is the
    /// full response body.
    #[error("stream http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },
}

impl StreamClientError {
    pub(crate) fn transport(err: reqwest::Error) -> Self {
        Self::Transport(err.without_url())
    }
}

enum PumpOutcome {
    Ended,
    Failed(StreamClientError),
    ReceiverDropped,
}

async fn stream_connection_worker(
    request: RequestBuilder,
    transport: StreamTransport,
    booking_id: String,
    updates: mpsc::UnboundedSender<StreamUpdate>,
) {
    let response = match open_stream(request).await {
        Ok(response) => response,
        Err(err) => {
            match &err {
                StreamClientError::HttpStatus { status, body } => warn!(
                    event = "stream_open_rejected",
                    booking_id = %booking_id,
                    status = status.as_u16(),
                    body = %summarize_error_body(body)
                ),
                _ => warn!(event = "stream_open_failed", booking_id = %booking_id, error = %err),
            }
            let _ = updates.send(StreamUpdate::Status(ConnectionState::Errored {
                retryable: false,
            }));
            return;
        }
    };

    info!(event = "stream_opened", booking_id = %booking_id, ?transport);
    if updates
        .send(StreamUpdate::Status(ConnectionState::Connected))
        .is_err()
    {
        return;
    }

    let outcome = match transport {
        StreamTransport::ByteStream => pump_byte_stream(response, &updates).await,
        StreamTransport::EventSource => pump_event_source(response, &updates).await,
    };

    let final_state = match outcome {
        PumpOutcome::Ended => {
            info!(event = "stream_closed", booking_id = %booking_id);
            ConnectionState::Disconnected
        }
        PumpOutcome::Failed(err) => {
            warn!(event = "stream_interrupted", booking_id = %booking_id, error = %err);
            ConnectionState::Errored { retryable: true }
        }
        PumpOutcome::ReceiverDropped => return,
    };
    let _ = updates.send(StreamUpdate::Status(final_state));
}

async fn open_stream(request: RequestBuilder) -> Result<Response, StreamClientError> {
    let response = request.send().await.map_err(StreamClientError::transport)?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(StreamClientError::HttpStatus { status, body });
    }
    Ok(response)
}

async fn pump_byte_stream(
    response: Response,
    updates: &mpsc::UnboundedSender<StreamUpdate>,
) -> PumpOutcome {
    let mut decoder = FrameDecoder::new();
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => return PumpOutcome::Failed(StreamClientError::transport(err)),
        };
        for payload in decoder.push(&chunk) {
            if !forward_payload(&payload, updates) {
                return PumpOutcome::ReceiverDropped;
            }
        }
    }

    if let Some(payload) = decoder.finish() {
        if !forward_payload(&payload, updates) {
            return PumpOutcome::ReceiverDropped;
        }
    }
    PumpOutcome::Ended
}

async fn pump_event_source(
    response: Response,
    updates: &mpsc::UnboundedSender<StreamUpdate>,
) -> PumpOutcome {
    let mut events = std::pin::pin!(response.bytes_stream().eventsource());

    while let Some(next) = events.next().await {
        match next {
            Ok(event) => {
                if !is_booking_channel(&event.event) {
                    debug!(event = "stream_channel_ignored", channel = %event.event);
                    continue;
                }
                if !forward_payload(&event.data, updates) {
                    return PumpOutcome::ReceiverDropped;
                }
            }
            Err(EventStreamError::Transport(err)) => {
                return PumpOutcome::Failed(StreamClientError::transport(err));
            }
            Err(err) => {
                warn!(event = "frame_decode_failed", error = %err);
            }
        }
    }
    PumpOutcome::Ended
}

fn is_booking_channel(channel: &str) -> bool {
    channel.is_empty() || channel == DEFAULT_CHANNEL || channel == BOOKING_UPDATED_CHANNEL
}

/// Decodes one payload and forwards it. Returns false once the receiving side
/// is gone.
fn forward_payload(payload: &str, updates: &mpsc::UnboundedSender<StreamUpdate>) -> bool {
    let update = match decode_frame(payload) {
        Ok(StreamFrame::Handshake { message }) => {
            debug!(event = "stream_handshake", message = ?message);
            StreamUpdate::Handshake { message }
        }
        Ok(StreamFrame::Booking(event)) => {
            debug!(event = "booking_event_decoded", event_id = %event.event_id);
            StreamUpdate::Event(event)
        }
        Err(err) => {
            warn!(event = "frame_decode_failed", error = %err, len = payload.len());
            return true;
        }
    };
    updates.send(update).is_ok()
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use reqwest::Client;
    use secrecy::SecretString;
    use tokio::sync::mpsc;

    use super::{
        forward_payload, is_booking_channel, open_stream, ConnectionState, StreamClientError,
        StreamConnection, StreamUpdate,
    };
    use crate::config::SdkConfig;
    use crate::stream::proto::{BOOKING_UPDATED_CHANNEL, DEFAULT_CHANNEL};

    const SECRET_KEY: &str = "super-secret-key";

    fn closed_port_config() -> SdkConfig {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe listener");
        let addr = listener.local_addr().expect("probe address");
        drop(listener);
        SdkConfig::new(&format!("http://{addr}"))
            .expect("config")
            .with_api_key(SecretString::new(SECRET_KEY.to_string()))
    }

    #[tokio::test]
    async fn transport_errors_never_expose_the_query_credential() {
        let config = closed_port_config();
        let request = config.authorize(Client::new().get(config.subscribe_url("booking-123")));

        let err = open_stream(request)
            .await
            .expect_err("nothing listens on the port");
        assert!(matches!(err, StreamClientError::Transport(_)));
        assert!(!err.to_string().contains(SECRET_KEY), "{err}");
        assert!(!format!("{err:?}").contains(SECRET_KEY), "{err:?}");
    }

    #[tokio::test]
    async fn connection_reports_closed_once_the_worker_exits() {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(async move {
            let _ = tx.send(StreamUpdate::Status(ConnectionState::Disconnected));
        });
        let mut connection = StreamConnection {
            receiver: rx,
            worker: Some(worker),
            state: ConnectionState::Connecting,
        };

        assert_eq!(
            connection.recv().await,
            Some(StreamUpdate::Status(ConnectionState::Disconnected))
        );
        assert_eq!(connection.recv().await, None);
        assert!(connection.is_closed());
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn default_and_named_channels_share_the_booking_handler() {
        assert!(is_booking_channel(DEFAULT_CHANNEL));
        assert!(is_booking_channel(BOOKING_UPDATED_CHANNEL));
        assert!(is_booking_channel(""));
        assert!(!is_booking_channel("heartbeat"));
    }

    #[test]
    fn malformed_payload_is_dropped_without_closing_the_stream() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(forward_payload("{oops", &tx));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn handshake_and_booking_payloads_are_forwarded_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(forward_payload(r#"{"type":"connected","message":"hi"}"#, &tx));
        assert!(forward_payload(
            r#"{"event_class":"BOOKING_UPDATED","event_id":"evt-1","booking_id":"b","updated_at":"2024-01-01T00:00:00Z"}"#,
            &tx
        ));

        assert_eq!(
            rx.try_recv().expect("handshake"),
            StreamUpdate::Handshake {
                message: Some("hi".to_string())
            }
        );
        match rx.try_recv().expect("booking") {
            StreamUpdate::Event(event) => assert_eq!(event.event_id, "evt-1"),
            other => panic!("unexpected update: {other:?}"),
        }
    }

    #[test]
    fn forwarding_reports_a_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        assert!(!forward_payload(r#"{"type":"connected"}"#, &tx));
    }

    #[test]
    fn only_connected_counts_as_connected() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(!ConnectionState::Errored { retryable: true }.is_connected());
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }
}
