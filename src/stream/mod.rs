//! Booking stream modules.
//!
//! - `client`: HTTP subscription worker with byte-stream and event-source
//!   backends.
//! - `decoder`: incremental `data:` line reassembly.
//! - `proto`: wire types shared with the booking service.
//! - `session`: orchestrator that owns one live subscription and its
//!   one-shot auto-publish.

/// Subscription client and connection handle.
pub mod client;
/// Chunk-to-frame decoder.
pub mod decoder;
/// Stream and publish wire types.
pub mod proto;
/// Session orchestrator.
pub mod session;
