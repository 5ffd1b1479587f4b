//! Game server module
//!
//! Authenticates upgraded connections, tracks them by player identity and
//! routes their messages to event handlers.

pub mod auth;
pub mod handler;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod websocket;

pub use auth::{AuthGate, AuthRejection, Claims};
pub use handler::builtin_router;
pub use protocol::{Envelope, ErrorCode, ProtocolError};
pub use registry::{RegistryError, SessionRegistry};
pub use router::{
    handler_fn, DispatchOutcome, EventHandler, EventRouter, HandlerContext, HandlerError,
    HandlerResult, RouterError,
};
pub use websocket::{BroadcastReport, EmitError, GameServer, ServerHandle};
