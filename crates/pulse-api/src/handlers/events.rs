//! Organization event stream over Server-Sent Events.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::Json;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tracing::info;

use pulse_core::defaults::ORGANIZATION_ID_MAX_LEN;
use pulse_core::{Error, Result};

use crate::error::ApiError;
use crate::state::AppState;
use crate::stream::{EventStream, StreamItem};

/// Reject organization ids that are blank, too long or carry control
/// characters.
pub fn validate_organization_path(organization_id: &str) -> Result<()> {
    if organization_id.trim().is_empty() {
        return Err(Error::InvalidInput(
            "organization id must not be empty".to_string(),
        ));
    }
    if organization_id.chars().count() > ORGANIZATION_ID_MAX_LEN {
        return Err(Error::InvalidInput(format!(
            "organization id longer than {} characters",
            ORGANIZATION_ID_MAX_LEN
        )));
    }
    if organization_id.chars().any(char::is_control) {
        return Err(Error::InvalidInput(
            "organization id contains control characters".to_string(),
        ));
    }
    Ok(())
}

/// `GET /events/:organization_id`
///
/// Each event is one unnamed `data:` frame carrying the event JSON, so
/// browser `onmessage` handlers receive it. Quiet periods are filled with
/// `:keepalive` comments from the stream itself, so a dead peer surfaces as a
/// failed write.
pub async fn stream_events(
    State(state): State<AppState>,
    Path(organization_id): Path<String>,
    headers: HeaderMap,
) -> std::result::Result<Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>>, ApiError>
{
    validate_organization_path(&organization_id)?;
    let caller = state.authorize(&headers, &organization_id).await?;

    let mut events =
        EventStream::open(state.broker.as_ref(), &organization_id, state.stream).await?;
    if let Some(shutdown) = state.shutdown.clone() {
        events = events.with_shutdown(shutdown);
    }
    info!(
        subsystem = "api",
        op = "stream_open",
        org_id = %organization_id,
        user_id = %caller.user_id,
        subscriber_count = state.broker.subscriber_count(&organization_id),
        "Event stream opened"
    );

    let frames = events.into_stream().map(|item| {
        Ok(match item {
            StreamItem::Frame(frame) => SseEvent::default().data(frame),
            StreamItem::KeepAlive => SseEvent::default().comment("keepalive"),
        })
    });

    Ok(Sse::new(frames))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberCount {
    pub organization_id: String,
    pub subscribers: usize,
}

/// `GET /events/:organization_id/subscribers`
pub async fn subscriber_count(
    State(state): State<AppState>,
    Path(organization_id): Path<String>,
    headers: HeaderMap,
) -> std::result::Result<Json<SubscriberCount>, ApiError> {
    validate_organization_path(&organization_id)?;
    state.authorize(&headers, &organization_id).await?;

    let subscribers = state.broker.subscriber_count(&organization_id);
    Ok(Json(SubscriberCount {
        organization_id,
        subscribers,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_organization_path() {
        assert!(validate_organization_path("org-1").is_ok());
        assert!(validate_organization_path(&"a".repeat(128)).is_ok());

        for bad in ["", "   ", "org\n1", "org\u{7}"] {
            assert!(matches!(
                validate_organization_path(bad),
                Err(Error::InvalidInput(_))
            ));
        }
        assert!(validate_organization_path(&"a".repeat(129)).is_err());
    }
}
