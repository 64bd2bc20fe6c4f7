//! Session orchestration for a single booking subscription.
//!
//! `SessionOrchestrator` owns at most one live [`StreamConnection`], the list
//! of booking events received on it, and a one-shot auto-publish timer that
//! is armed the first time the subscription reports `Connected`. Starting a
//! new session always tears the previous one down first.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::SdkConfig;
use crate::publish::{PublishAck, PublishClient, PublishError};
use crate::stream::client::{
    ConnectionState, StreamClient, StreamClientError, StreamConnection, StreamUpdate,
};
use crate::stream::proto::BookingEvent;

/// Callback invoked for every booking event, in arrival order.
pub type EventSink = Box<dyn FnMut(&BookingEvent) + Send>;

type PublishOutcome = Result<PublishAck, PublishError>;

/// Session-level event emitted by [`SessionOrchestrator::recv`].
#[derive(Debug)]
pub enum SessionEvent {
    /// Connection status changed.
    Status(ConnectionState),
    /// Server acknowledged the subscription.
    Handshake { message: Option<String> },
    /// Booking event appended to [`SessionOrchestrator::received_events`].
    Booking(BookingEvent),
    /// The session's one-shot auto-publish ran.
    AutoPublished(PublishOutcome),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Stream(#[from] StreamClientError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Per-session state. Dropping it closes the transport and cancels the timer.
#[derive(Debug)]
struct ActiveSession {
    connection: StreamConnection,
    auto_publish_scheduled: bool,
    auto_publish: Option<JoinHandle<()>>,
    auto_publish_outcome: Option<oneshot::Receiver<PublishOutcome>>,
    stream_ended: bool,
}

impl ActiveSession {
    fn new(connection: StreamConnection) -> Self {
        Self {
            connection,
            auto_publish_scheduled: false,
            auto_publish: None,
            auto_publish_outcome: None,
            stream_ended: false,
        }
    }

    fn close(&mut self) {
        self.connection.disconnect();
        if let Some(task) = self.auto_publish.take() {
            task.abort();
        }
        self.auto_publish_outcome = None;
        self.auto_publish_scheduled = false;
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.close();
    }
}

enum Next {
    Update(Option<StreamUpdate>),
    Outcome(Option<PublishOutcome>),
}

/// Composes a [`StreamClient`] and a [`PublishClient`] around one booking.
pub struct SessionOrchestrator {
    stream: StreamClient,
    publisher: PublishClient,
    booking_id: String,
    auto_publish_delay: Duration,
    status: ConnectionState,
    received: Vec<BookingEvent>,
    sinks: Vec<EventSink>,
    session: Option<ActiveSession>,
}

impl SessionOrchestrator {
    /// Builds both clients from `config`.
    pub fn from_config(
        config: SdkConfig,
        booking_id: impl Into<String>,
    ) -> Result<Self, SessionError> {
        let stream = StreamClient::new(config.clone())?;
        let publisher = PublishClient::new(config)?;
        Ok(Self::new(stream, publisher, booking_id))
    }

    /// Composes existing clients; the auto-publish delay comes from the stream
    /// client's configuration.
    pub fn new(
        stream: StreamClient,
        publisher: PublishClient,
        booking_id: impl Into<String>,
    ) -> Self {
        let auto_publish_delay = stream.config().auto_publish_delay();
        Self {
            stream,
            publisher,
            booking_id: booking_id.into(),
            auto_publish_delay,
            status: ConnectionState::Disconnected,
            received: Vec::new(),
            sinks: Vec::new(),
            session: None,
        }
    }

    /// Booking this orchestrator subscribes to.
    pub fn booking_id(&self) -> &str {
        &self.booking_id
    }

    /// Last connection status applied by [`Self::recv`], `start` or `stop`.
    pub fn status(&self) -> ConnectionState {
        self.status
    }

    /// Booking events received so far, in arrival order.
    pub fn received_events(&self) -> &[BookingEvent] {
        &self.received
    }

    /// Drops every received event.
    pub fn clear_events(&mut self) {
        self.received.clear();
    }

    /// Registers a callback for every booking event applied by [`Self::recv`].
    pub fn on_event<F>(&mut self, sink: F)
    where
        F: FnMut(&BookingEvent) + Send + 'static,
    {
        self.sinks.push(Box::new(sink));
    }

    /// Whether a session is live.
    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Whether the live session has already armed its auto-publish.
    pub fn auto_publish_scheduled(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.auto_publish_scheduled)
    }

    /// Whether an auto-publish timer is armed and has not finished yet.
    pub fn auto_publish_pending(&self) -> bool {
        self.session
            .as_ref()
            .and_then(|session| session.auto_publish.as_ref())
            .is_some_and(|task| !task.is_finished())
    }

    /// Opens a new subscription, tearing down any live session first.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&mut self) -> Result<(), StreamClientError> {
        if self.teardown() {
            info!(event = "session_restarting", booking_id = %self.booking_id);
        }

        self.status = ConnectionState::Connecting;
        match self.stream.connect(&self.booking_id) {
            Ok(connection) => {
                self.session = Some(ActiveSession::new(connection));
                info!(event = "session_started", booking_id = %self.booking_id);
                Ok(())
            }
            Err(err) => {
                self.status = ConnectionState::Errored { retryable: false };
                warn!(
                    event = "session_start_failed",
                    booking_id = %self.booking_id,
                    error = %err
                );
                Err(err)
            }
        }
    }

    /// Closes the subscription and cancels a pending auto-publish. Idempotent.
    pub fn stop(&mut self) {
        if self.teardown() {
            info!(event = "session_stopped", booking_id = %self.booking_id);
        }
        self.status = ConnectionState::Disconnected;
    }

    /// Publishes an update right away. Independent of the auto-publish and of
    /// the session state.
    pub async fn publish_now(&self) -> Result<PublishAck, PublishError> {
        self.publisher.publish_update(&self.booking_id).await
    }

    /// Drives the live session and returns the next session event.
    ///
    /// Returns `None` when no session is active, or once the stream has ended
    /// and no auto-publish outcome is outstanding.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            let session = self.session.as_mut()?;
            if session.stream_ended && session.auto_publish_outcome.is_none() {
                return None;
            }

            let next = tokio::select! {
                update = session.connection.recv(), if !session.stream_ended => Next::Update(update),
                outcome = recv_outcome(&mut session.auto_publish_outcome) => Next::Outcome(outcome),
            };

            match next {
                Next::Update(Some(update)) => return Some(self.apply_update(update)),
                Next::Update(None) => session.stream_ended = true,
                Next::Outcome(outcome) => {
                    session.auto_publish_outcome = None;
                    session.auto_publish = None;
                    if let Some(outcome) = outcome {
                        return Some(SessionEvent::AutoPublished(outcome));
                    }
                }
            }
        }
    }

    fn apply_update(&mut self, update: StreamUpdate) -> SessionEvent {
        match update {
            StreamUpdate::Status(state) => {
                self.status = state;
                if state.is_connected() {
                    self.arm_auto_publish();
                }
                SessionEvent::Status(state)
            }
            StreamUpdate::Handshake { message } => SessionEvent::Handshake { message },
            StreamUpdate::Event(event) => {
                for sink in &mut self.sinks {
                    sink(&event);
                }
                self.received.push(event.clone());
                SessionEvent::Booking(event)
            }
        }
    }

    fn arm_auto_publish(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.auto_publish_scheduled {
            return;
        }
        session.auto_publish_scheduled = true;

        let publisher = self.publisher.clone();
        let booking_id = self.booking_id.clone();
        let delay = self.auto_publish_delay;
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let outcome = publisher.publish_update(&booking_id).await;
            match &outcome {
                Ok(ack) => info!(
                    event = "auto_publish_sent",
                    booking_id = %booking_id,
                    status = ack.status.as_u16()
                ),
                Err(err) => warn!(
                    event = "auto_publish_failed",
                    booking_id = %booking_id,
                    error = %err
                ),
            }
            let _ = outcome_tx.send(outcome);
        });

        session.auto_publish = Some(task);
        session.auto_publish_outcome = Some(outcome_rx);
        info!(
            event = "auto_publish_armed",
            booking_id = %self.booking_id,
            delay_ms = delay.as_millis() as u64
        );
    }

    fn teardown(&mut self) -> bool {
        match self.session.take() {
            Some(mut session) => {
                session.close();
                true
            }
            None => false,
        }
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn recv_outcome(
    outcome: &mut Option<oneshot::Receiver<PublishOutcome>>,
) -> Option<PublishOutcome> {
    match outcome {
        Some(rx) => rx.await.ok(),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::SessionOrchestrator;
    use crate::config::SdkConfig;
    use crate::stream::client::ConnectionState;

    fn orchestrator() -> SessionOrchestrator {
        let config = SdkConfig::new("http://127.0.0.1:9").expect("config");
        SessionOrchestrator::from_config(config, "booking-123").expect("orchestrator")
    }

    #[test]
    fn stop_before_start_is_a_no_op() {
        let mut session = orchestrator();
        session.stop();
        assert_eq!(session.status(), ConnectionState::Disconnected);
        assert!(!session.is_active());
        assert!(!session.auto_publish_scheduled());
        assert!(!session.auto_publish_pending());
    }

    #[test]
    fn stop_twice_leaves_session_disconnected() {
        let mut session = orchestrator();
        session.stop();
        session.stop();
        assert_eq!(session.status(), ConnectionState::Disconnected);
        assert!(!session.auto_publish_scheduled());
    }

    #[tokio::test]
    async fn recv_without_a_session_returns_none() {
        let mut session = orchestrator();
        assert!(session.recv().await.is_none());
        assert!(session.received_events().is_empty());
    }

    #[tokio::test]
    async fn start_then_stop_cancels_everything() {
        let mut session = orchestrator();
        session.start().expect("start");
        assert!(session.is_active());
        assert_eq!(session.status(), ConnectionState::Connecting);

        session.stop();
        session.stop();
        assert!(!session.is_active());
        assert_eq!(session.status(), ConnectionState::Disconnected);
        assert!(!session.auto_publish_pending());
        assert!(session.recv().await.is_none());
    }
}
