use std::error::Error;

use kerb_sse_sdk::config::SdkConfig;
use kerb_sse_sdk::stream::session::{SessionEvent, SessionOrchestrator};
use tracing_subscriber::EnvFilter;

const BOOKING_ID: &str = "booking-123";

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SdkConfig::from_env()?;
    let booking_id = std::env::args().nth(1).unwrap_or_else(|| BOOKING_ID.to_string());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let mut session = SessionOrchestrator::from_config(config, booking_id)?;
        session.on_event(|event| {
            println!(
                "{} {} booking={} updated_at={} metadata={}",
                event.event_class,
                event.event_id,
                event.booking_id,
                event.updated_at,
                serde_json::to_string(&event.metadata).unwrap_or_default(),
            );
        });
        session.start()?;

        loop {
            let next = tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                next = session.recv() => next,
            };
            match next {
                Some(SessionEvent::Status(status)) => println!("status: {status:?}"),
                Some(SessionEvent::Handshake { message }) => {
                    println!("handshake: {}", message.unwrap_or_default());
                }
                Some(SessionEvent::Booking(_)) => {
                    println!("received {} events", session.received_events().len());
                }
                Some(SessionEvent::AutoPublished(Ok(ack))) => {
                    println!("auto-publish acknowledged: {}", ack.body);
                }
                Some(SessionEvent::AutoPublished(Err(err))) => {
                    println!("auto-publish failed: {err}");
                }
                None => break,
            }
        }

        session.stop();
        Ok::<(), Box<dyn Error>>(())
    })
}
