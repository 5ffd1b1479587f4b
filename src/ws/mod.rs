//! WebSocket transport
//!
//! Frame codec, opening handshake and the per-socket connection type shared
//! by the server and the outbound client.

pub mod client;
pub mod connection;
pub mod frame;
pub mod handshake;

pub use client::{ClientError, ClientOptions, WsClient};
pub use connection::{Connection, ConnectionError, ConnectionOptions, ConnectionState};
pub use frame::{Opcode, Role};
