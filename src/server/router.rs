//! Event router
//!
//! Parses inbound envelopes, looks up the handler registered for the event
//! name and sends the handler's result back as a reply envelope. Every
//! application-level failure stops here: bad JSON, unknown events, handler
//! errors and handler panics are logged and never close the connection.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::protocol::Envelope;
use super::websocket::ServerHandle;
use crate::ws::Connection;

/// Errors a handler can report
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What a handler returns: `Some` value to reply, `None` for no reply
pub type HandlerResult = Result<Option<Value>, HandlerError>;

/// Errors detected while building the handler table
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Event name cannot be empty")]
    EmptyEventName,

    #[error("Handler already registered for event: {0}")]
    DuplicateEvent(String),

    #[error("No handler registered for events: {}", .0.join(", "))]
    MissingHandlers(Vec<String>),
}

/// Everything a handler can reach: the calling connection and the server views
#[derive(Clone)]
pub struct HandlerContext {
    pub connection: Arc<Connection>,
    pub server: ServerHandle,
}

impl HandlerContext {
    pub fn new(connection: Arc<Connection>, server: ServerHandle) -> Self {
        Self { connection, server }
    }

    /// Identity of the calling connection
    pub fn identity(&self) -> Option<&str> {
        self.connection.identity()
    }
}

/// Trait implemented by every event handler
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle the envelope's `data` for the calling connection
    async fn handle(&self, data: Value, ctx: HandlerContext) -> HandlerResult;
}

/// Adapter turning an async closure into an [`EventHandler`]
pub struct FnHandler<F>(F);

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Value, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Value, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, data: Value, ctx: HandlerContext) -> HandlerResult {
        (self.0)(data, ctx).await
    }
}

/// How a single dispatch ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler produced a value and the reply was queued
    Replied,
    /// The handler succeeded without a value
    NoReply,
    /// The message was not a valid envelope
    ParseError,
    /// No handler is registered for the event
    UnknownEvent(String),
    /// The handler returned an error or panicked
    HandlerFailed(String),
    /// The reply could not be queued (connection closing)
    ReplyFailed,
}

struct Route {
    handler: Arc<dyn EventHandler>,
    reply_event: Option<String>,
}

/// Typed mapping from event name to handler
#[derive(Default)]
pub struct EventRouter {
    routes: HashMap<String, Route>,
}

impl EventRouter {
    /// Create an empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler whose replies reuse the inbound event name
    pub fn on(
        &mut self,
        event: &str,
        handler: impl EventHandler + 'static,
    ) -> Result<&mut Self, RouterError> {
        self.insert(event, None, Arc::new(handler))
    }

    /// Register a handler whose replies are sent under `reply_event`
    pub fn on_with_reply(
        &mut self,
        event: &str,
        reply_event: &str,
        handler: impl EventHandler + 'static,
    ) -> Result<&mut Self, RouterError> {
        if reply_event.is_empty() {
            return Err(RouterError::EmptyEventName);
        }
        self.insert(event, Some(reply_event.to_string()), Arc::new(handler))
    }

    fn insert(
        &mut self,
        event: &str,
        reply_event: Option<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<&mut Self, RouterError> {
        if event.is_empty() {
            return Err(RouterError::EmptyEventName);
        }
        if self.routes.contains_key(event) {
            return Err(RouterError::DuplicateEvent(event.to_string()));
        }
        self.routes.insert(event.to_string(), Route { handler, reply_event });
        Ok(self)
    }

    /// Fail if any of `events` has no handler
    pub fn ensure_registered(&self, events: &[&str]) -> Result<(), RouterError> {
        let missing: Vec<String> = events
            .iter()
            .filter(|event| !self.routes.contains_key(**event))
            .map(|event| event.to_string())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(RouterError::MissingHandlers(missing))
        }
    }

    /// Registered event names (sorted)
    pub fn events(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_event(&self, event: &str) -> bool {
        self.routes.contains_key(event)
    }

    /// Dispatch one raw text message from `ctx.connection`.
    ///
    /// Waits for the handler to finish; nothing here propagates an error.
    pub async fn dispatch(&self, ctx: HandlerContext, raw: &str) -> DispatchOutcome {
        let connection = Arc::clone(&ctx.connection);
        let connection_id = connection.id();

        let envelope = match Envelope::from_json(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(connection = %connection_id, "Dropping unparseable message: {}", e);
                return DispatchOutcome::ParseError;
            }
        };

        let Some(route) = self.routes.get(&envelope.event) else {
            info!(connection = %connection_id, event = %envelope.event, "No handler for event");
            return DispatchOutcome::UnknownEvent(envelope.event);
        };

        debug!(connection = %connection_id, event = %envelope.event, "Dispatching event");

        let outcome = AssertUnwindSafe(route.handler.handle(envelope.data, ctx))
            .catch_unwind()
            .await;

        let value = match outcome {
            Ok(Ok(Some(value))) if !value.is_null() => value,
            Ok(Ok(_)) => return DispatchOutcome::NoReply,
            Ok(Err(e)) => {
                error!(
                    connection = %connection_id,
                    event = %envelope.event,
                    "Handler failed: {}", e
                );
                return DispatchOutcome::HandlerFailed(e.to_string());
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    connection = %connection_id,
                    event = %envelope.event,
                    "Handler panicked: {}", message
                );
                return DispatchOutcome::HandlerFailed(message);
            }
        };

        let reply_event = route.reply_event.clone().unwrap_or(envelope.event);
        let reply = Envelope::new(reply_event, value).with_correlation_id(envelope.correlation_id);

        let sent = match reply.to_json() {
            Ok(json) => connection.send_text(&json).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match sent {
            Ok(()) => DispatchOutcome::Replied,
            Err(e) => {
                debug!(connection = %connection_id, "Reply not sent: {}", e);
                DispatchOutcome::ReplyFailed
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
