//! # Live Endpoint Client
//!
//! Everything needed to talk to the remote bidirectional audio service:
//! - **protocol**: JSON frames exchanged over the WebSocket
//! - **transport**: the connection itself, behind a trait so sessions can be tested

pub mod protocol;    // Setup, realtime input and server message frames
pub mod transport;   // WebSocket transport and its trait seam
