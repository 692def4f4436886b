//! # Voice Relay
//!
//! Everything between the browser's WebSocket and the hosted voice API.
//!
//! ## Key Components:
//! - **frame**: the data unit relayed unmodified, plus close notices
//! - **upstream**: dialing and authenticating the hosted API
//! - **bridge**: the two per-session pump tasks and the session lifetime
//! - **session**: registry of live sessions for health and metrics

pub mod bridge;
pub mod frame;
pub mod session;
pub mod upstream;
