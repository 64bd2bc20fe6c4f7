//! Rust SDK for the Kerb booking-update SSE stream.
//!
//! The crate is organized by concern:
//! - `config`: process-wide settings resolved once at startup.
//! - `stream`: SSE subscription client, frame decoding, and session
//!   orchestration.
//! - `publish`: HTTP client that emits a new update into a booking stream.

/// Base URL, credential, and transport settings.
pub mod config;
/// Publish endpoint client and response types.
pub mod publish;
/// Subscription client, wire types, and session orchestration.
pub mod stream;
