use std::time::Duration;

/// Default address of the local media gateway
pub const DEFAULT_GATEWAY_URL: &str = "http://127.0.0.1:1984";

#[derive(Debug, Clone)]
pub struct Config {
    /// Base url of the gateway's HTTP api, without trailing slash
    pub gateway_url: String,
    /// Path of the gateway's push channel, relative to `gateway_url`
    pub events_path: String,
    /// Ceiling on the ICE gathering wait; gathering counts as complete after it
    pub ice_gathering_timeout: Duration,
    /// Timeout applied to every gateway HTTP request
    pub request_timeout: Duration,
    pub ice_servers: Vec<String>,
    /// Fragments held by a fallback stream buffer before new ones are dropped
    pub fallback_buffer_capacity: usize,
    /// Base rate of the shared heartbeat timer
    pub heartbeat_tick: Duration,
    /// Upper bound between push channel reconnects
    pub feed_max_backoff: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            events_path: "/events".to_string(),
            ice_gathering_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
            ice_servers: Vec::new(),
            fallback_buffer_capacity: 256,
            heartbeat_tick: Duration::from_secs(1),
            feed_max_backoff: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn new(gateway_url: &str) -> Self {
        Config {
            gateway_url: gateway_url.trim_end_matches('/').to_string(),
            ..Default::default()
        }
    }

    /// Websocket url of the push channel
    pub fn events_url(&self) -> String {
        let base = if let Some(rest) = self.gateway_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.gateway_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.gateway_url.clone()
        };
        format!("{}{}", base, self.events_path)
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
