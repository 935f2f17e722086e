//! Realtime chat stream modules.
//!
//! - `client`: websocket transport, outbound queue and inbound delivery.
//! - `proto`: wire messages and identifiers shared with the chat service.
//! - `state`: stream lifecycle and its terminal completion signal.

/// Websocket connection, send queue and inbound receiver.
pub mod client;
/// Stream protocol messages.
pub mod proto;
/// Stream lifecycle tracking.
pub mod state;
