//! HTTP access to the command backend.

use super::envelope::{CommandEnvelope, CommandInfo, CommandResponse, parse_catalog};
use crate::config::BackendConfig;
use crate::error::{ConsoleError, Result};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;

/// Where device commands are sent.
#[async_trait]
pub trait CommandBackend: Send + Sync {
    async fn send(&self, envelope: &CommandEnvelope) -> Result<CommandResponse>;

    async fn available_commands(&self) -> Result<Vec<CommandInfo>>;
}

/// REST backend: POST the envelope, GET the catalog.
pub struct HttpCommandBackend {
    client: Client,
    send_url: String,
    catalog_url: String,
    token: Option<String>,
}

impl HttpCommandBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        if !config.base_url.starts_with("http://") && !config.base_url.starts_with("https://") {
            return Err(ConsoleError::Config(format!(
                "Backend URL must start with http:// or https://, got: {}",
                config.base_url
            )));
        }

        let client = Client::builder().timeout(config.timeout()).build()?;

        Ok(Self {
            client,
            send_url: config.send_url(),
            catalog_url: config.catalog_url(),
            token: config.token.clone(),
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl CommandBackend for HttpCommandBackend {
    async fn send(&self, envelope: &CommandEnvelope) -> Result<CommandResponse> {
        info!(
            "[Command] POST {} {} -> {}",
            self.send_url, envelope.command, envelope.device_id
        );

        let response = self
            .authorized(self.client.post(&self.send_url))
            .json(envelope)
            .send()
            .await?;

        let response = ensure_success(response).await?;
        Ok(response.json::<CommandResponse>().await?)
    }

    async fn available_commands(&self) -> Result<Vec<CommandInfo>> {
        debug!("[Command] GET {}", self.catalog_url);

        let response = self
            .authorized(self.client.get(&self.catalog_url))
            .send()
            .await?;

        let body = ensure_success(response).await?.bytes().await?;
        Ok(parse_catalog(&body)?)
    }
}

/// Turn a non-2xx response into a readable error.
async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = error_detail(&body).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("Request failed")
            .to_string()
    });

    Err(ConsoleError::Backend(format!(
        "{} ({})",
        detail,
        status.as_u16()
    )))
}

/// Pick the human-readable part of an error body, DRF style.
fn error_detail(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["message", "error", "detail"]
        .iter()
        .find_map(|key| value.get(key).and_then(Value::as_str))
        .map(str::to_string)
}
