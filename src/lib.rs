//! Gamelink
//!
//! WebSocket transport and session layer for a multiplayer game backend:
//! RFC 6455 framing, token-gated admission with one live connection per
//! player, and JSON event routing to application handlers.

pub mod config;
pub mod server;
pub mod ws;
