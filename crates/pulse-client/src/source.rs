//! Where a consumer's frames come from.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{StatusCode, Url};
use tracing::debug;

use pulse_core::{Error, Result};

use crate::frame::FrameDecoder;

/// Stream of raw frame payloads from one connection. Ends when the
/// connection does.
pub type FrameStream = BoxStream<'static, Result<String>>;

/// Opens event stream connections for an organization.
#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    async fn connect(&self, organization_id: &str) -> Result<FrameStream>;
}

/// Connects to a pulse server's `GET /events/{organizationId}` endpoint.
#[derive(Clone)]
pub struct HttpEventSource {
    client: reqwest::Client,
    base_url: Url,
    headers: HeaderMap,
}

impl HttpEventSource {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid server url {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "server url {} cannot carry a path",
                base_url
            )));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            headers: HeaderMap::new(),
        })
    }

    /// Send `Authorization: Bearer <token>` with every connect.
    pub fn with_bearer_token(self, token: &str) -> Result<Self> {
        self.with_header(AUTHORIZATION.as_str(), &format!("Bearer {}", token))
    }

    /// Send an extra header with every connect.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::InvalidInput(format!("header name {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::InvalidInput(format!("header {}: {}", name, e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Stream URL for an organization, with the id percent-encoded.
    pub fn events_url(&self, organization_id: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("server url {} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .push("events")
            .push(organization_id);
        Ok(url)
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn connect(&self, organization_id: &str) -> Result<FrameStream> {
        let url = self.events_url(organization_id)?;
        debug!(subsystem = "client", op = "connect", url = %url, "Opening event stream");

        let response = self
            .client
            .get(url)
            .headers(self.headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let mut decoder = FrameDecoder::new();
        let frames = response.bytes_stream().flat_map(move |chunk| {
            let items: Vec<Result<String>> = match chunk {
                Ok(bytes) => match decoder.push(&bytes) {
                    Ok(frames) => frames.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                },
                Err(e) => vec![Err(Error::from(e))],
            };
            stream::iter(items)
        });
        Ok(frames.boxed())
    }
}

/// Map a refused connect to the error the consumer's retry decision keys on.
fn status_error(status: StatusCode, body: String) -> Error {
    match status {
        StatusCode::UNAUTHORIZED => Error::Unauthorized(body),
        StatusCode::FORBIDDEN => Error::Forbidden(body),
        StatusCode::BAD_REQUEST => Error::InvalidInput(body),
        _ => Error::Transport(format!("server returned {}: {}", status, body)),
    }
}
