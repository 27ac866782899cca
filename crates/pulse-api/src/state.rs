//! Shared handler state.

use std::sync::Arc;

use axum::http::HeaderMap;
use tokio::sync::watch;

use pulse_core::{Broker, Result};

use crate::auth::{CallerIdentity, CallerResolver};
use crate::stream::StreamSettings;

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<dyn Broker>,
    pub resolver: Arc<dyn CallerResolver>,
    pub stream: StreamSettings,
    /// Flips to true when the server starts shutting down.
    pub shutdown: Option<watch::Receiver<bool>>,
}

impl AppState {
    pub fn new(
        broker: Arc<dyn Broker>,
        resolver: Arc<dyn CallerResolver>,
        stream: StreamSettings,
    ) -> Self {
        Self {
            broker,
            resolver,
            stream,
            shutdown: None,
        }
    }

    /// Close open streams once `shutdown` turns true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Resolve the caller and require membership of the organization.
    pub async fn authorize(
        &self,
        headers: &HeaderMap,
        organization_id: &str,
    ) -> Result<CallerIdentity> {
        let caller = self.resolver.resolve(headers).await?;
        caller.require_member(organization_id)?;
        Ok(caller)
    }
}
