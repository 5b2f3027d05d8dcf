use super::{GatewayApi, StreamStart};
use crate::config::Config;
use crate::error::GatewayError;
use crate::types::SourceId;
use async_trait::async_trait;
use reqwest::Url;

/// `GatewayApi` over the gateway's HTTP endpoints
pub struct HttpGateway {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(config: &Config) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Self::with_client(&config.gateway_url, client)
    }

    pub fn with_client(base_url: &str, client: reqwest::Client) -> Result<Self, GatewayError> {
        let base_url = Url::parse(base_url).map_err(|e| GatewayError::Url(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(GatewayError::Url(base_url.to_string()));
        }
        Ok(Self { base_url, client })
    }

    /// Append percent-encoded path segments to the base url
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn post(&self, url: Url) -> Result<reqwest::Response, GatewayError> {
        let response = self.client.post(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(GatewayError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl GatewayApi for HttpGateway {
    async fn probe_availability(&self) -> Result<bool, GatewayError> {
        let url = self.endpoint(&["availability"]);
        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(GatewayError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        // bare `true`/`false`, or an object carrying `available`
        let body: serde_json::Value = serde_json::from_slice(&response.bytes().await?)?;
        Ok(match body {
            serde_json::Value::Bool(available) => available,
            serde_json::Value::Object(map) => map
                .get("available")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false),
            _ => false,
        })
    }

    async fn start_stream(&self, source: &SourceId) -> Result<StreamStart, GatewayError> {
        let url = self.endpoint(&["stream", "start", source.as_str()]);
        let response = self.post(url).await?;
        let start = serde_json::from_slice(&response.bytes().await?)?;
        Ok(start)
    }

    async fn stop_stream(&self, source: &SourceId) -> Result<(), GatewayError> {
        let url = self.endpoint(&["stream", "stop", source.as_str()]);
        self.post(url).await?;
        Ok(())
    }
}
