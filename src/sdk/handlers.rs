use crate::{Error, Result};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use super::machine::ConnectionState;
use super::tools::BoxFuture;

pub type EventHandler = Box<dyn Fn(Value) -> BoxFuture<Result<()>> + Send + Sync>;
pub type ErrorHandler = Box<dyn Fn(Arc<Error>) -> BoxFuture<Result<()>> + Send + Sync>;
pub type StateHandler = Box<dyn Fn(ConnectionState) -> BoxFuture<Result<()>> + Send + Sync>;

/// Caller-supplied callbacks. Handler failures are logged and never reach the session.
#[derive(Default)]
pub struct EventHandlers {
    /// Inbound events that are not handled internally, verbatim.
    pub on_event: Option<EventHandler>,
    pub on_error: Option<ErrorHandler>,
    pub on_state_change: Option<StateHandler>,
}

impl EventHandlers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_event<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_event = Some(Box::new(move |evt| Box::pin(handler(evt))));
        self
    }

    #[must_use]
    pub fn on_error<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Arc<Error>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_error = Some(Box::new(move |err| Box::pin(handler(err))));
        self
    }

    #[must_use]
    pub fn on_state_change<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ConnectionState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_state_change = Some(Box::new(move |state| Box::pin(handler(state))));
        self
    }

    pub(crate) async fn event(&self, value: Value) {
        if let Some(handler) = &self.on_event {
            if let Err(err) = handler(value).await {
                tracing::warn!("Event handler failed: {err}");
            }
        }
    }

    pub(crate) async fn error(&self, err: Arc<Error>) {
        if let Some(handler) = &self.on_error {
            if let Err(err) = handler(err).await {
                tracing::warn!("Error handler failed: {err}");
            }
        }
    }

    pub(crate) async fn state(&self, state: ConnectionState) {
        if let Some(handler) = &self.on_state_change {
            if let Err(err) = handler(state).await {
                tracing::warn!("State handler failed: {err}");
            }
        }
    }
}

impl std::fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlers")
            .field("on_event", &self.on_event.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_state_change", &self.on_state_change.is_some())
            .finish()
    }
}
