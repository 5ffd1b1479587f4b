//! Built-in transport-level handlers
//!
//! Game business handlers live outside this crate; the two here only report
//! on the transport itself.

use serde_json::{json, Value};

use super::router::{handler_fn, EventRouter, HandlerContext, HandlerResult, RouterError};

/// Liveness check event
pub const PING_EVENT: &str = "ping";

/// Connected-players query event
pub const ONLINE_EVENT: &str = "online";

/// Echo `data` back as `{"pong": data}`
pub async fn ping(data: Value, _ctx: HandlerContext) -> HandlerResult {
    Ok(Some(json!({ "pong": data })))
}

/// Report how many identities are connected and which
pub async fn online(_data: Value, ctx: HandlerContext) -> HandlerResult {
    let players = ctx.server.identities().await;
    Ok(Some(json!({ "count": players.len(), "players": players })))
}

/// Router with the built-in handlers registered
pub fn builtin_router() -> Result<EventRouter, RouterError> {
    let mut router = EventRouter::new();
    router
        .on(PING_EVENT, handler_fn(ping))?
        .on(ONLINE_EVENT, handler_fn(online))?;
    router.ensure_registered(&[PING_EVENT, ONLINE_EVENT])?;
    Ok(router)
}
