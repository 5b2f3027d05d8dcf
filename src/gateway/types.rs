//! Wire types exchanged with the gateway

use serde::{Deserialize, Deserializer, Serialize};

/// Response to a stream start request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStart {
    pub available: bool,
    #[serde(default, deserialize_with = "non_blank")]
    pub primary_negotiation_url: Option<String>,
    #[serde(default, deserialize_with = "non_blank")]
    pub fallback_stream_url: Option<String>,
    #[serde(default)]
    pub stream_name: Option<String>,
}

impl StreamStart {
    pub fn has_endpoint(&self) -> bool {
        self.primary_negotiation_url.is_some() || self.fallback_stream_url.is_some()
    }
}

fn non_blank<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|url| !url.trim().is_empty()))
}

/// Push notification from the gateway's event channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    Status { available: bool },
}

#[derive(Deserialize)]
struct RawEvent {
    event: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Deserialize)]
struct StatusPayload {
    available: bool,
}

impl GatewayEvent {
    /// Parse one channel message; events this client doesn't know are `None`
    pub fn parse(text: &str) -> Result<Option<GatewayEvent>, serde_json::Error> {
        let raw: RawEvent = serde_json::from_str(text)?;
        match raw.event.as_str() {
            "gateway_status" => {
                let payload: StatusPayload = serde_json::from_value(raw.payload)?;
                Ok(Some(GatewayEvent::Status {
                    available: payload.available,
                }))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_start_camel_case() {
        let start: StreamStart = serde_json::from_str(
            r#"{"available":true,"primaryNegotiationUrl":"http://gw/whep/cam","streamName":"cam"}"#,
        )
        .unwrap();

        assert!(start.available);
        assert_eq!(start.primary_negotiation_url.as_deref(), Some("http://gw/whep/cam"));
        assert_eq!(start.fallback_stream_url, None);
        assert_eq!(start.stream_name.as_deref(), Some("cam"));
    }

    #[test]
    fn test_blank_endpoints_are_absent() {
        let start: StreamStart =
            serde_json::from_str(r#"{"available":true,"primaryNegotiationUrl":"","fallbackStreamUrl":"  "}"#)
                .unwrap();

        assert!(!start.has_endpoint());
    }

    #[test]
    fn test_parse_status_event() {
        let event = GatewayEvent::parse(r#"{"event":"gateway_status","payload":{"available":true}}"#).unwrap();
        assert_eq!(event, Some(GatewayEvent::Status { available: true }));

        let other = GatewayEvent::parse(r#"{"event":"scene_changed","payload":{"scene":"a"}}"#).unwrap();
        assert_eq!(other, None);

        assert!(GatewayEvent::parse(r#"{"event":"gateway_status","payload":{}}"#).is_err());
    }
}
