//! Vendor Dispatch Client
//!
//! Asks the vendor's HTTPS dispatch endpoint which cloud server a device
//! should connect to. The endpoint's certificate is not validated.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::application::ports::{CloudDiscovery, CloudEndpoint, DiscoveryError, DiscoveryRequest};
use crate::domain::protocol;
use crate::infrastructure::config::CloudSettings;

/// `CloudDiscovery` over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpCloudDiscovery {
    client: reqwest::Client,
    url: String,
}

impl HttpCloudDiscovery {
    /// Create a client for `url` with a request timeout.
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::Request` if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DiscoveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| DiscoveryError::Request(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Create a client from the cloud settings.
    ///
    /// # Errors
    ///
    /// See [`HttpCloudDiscovery::new`].
    pub fn from_settings(settings: &CloudSettings) -> Result<Self, DiscoveryError> {
        Self::new(settings.dispatch_url.clone(), settings.http_timeout)
    }
}

#[async_trait]
impl CloudDiscovery for HttpCloudDiscovery {
    async fn discover(&self, request: &DiscoveryRequest) -> Result<CloudEndpoint, DiscoveryError> {
        tracing::debug!(url = %self.url, device_id = %request.deviceid, "Requesting cloud dispatch");

        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| DiscoveryError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::Status(status.as_u16()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| DiscoveryError::Malformed(e.to_string()))?;
        parse_dispatch_reply(&body)
    }
}

/// Extract the endpoint from a dispatch reply.
///
/// # Errors
///
/// `Rejected` for a nonzero `error`, `Malformed` when `error`, `IP` or
/// `port` is missing or unusable.
pub fn parse_dispatch_reply(body: &Value) -> Result<CloudEndpoint, DiscoveryError> {
    match protocol::error_code(body) {
        Some(0) => {}
        Some(code) => return Err(DiscoveryError::Rejected(code)),
        None => return Err(DiscoveryError::Malformed("missing error field".to_string())),
    }

    let host = body
        .get("IP")
        .and_then(Value::as_str)
        .filter(|ip| !ip.is_empty())
        .ok_or_else(|| DiscoveryError::Malformed("missing IP".to_string()))?;

    let port = match body.get("port") {
        Some(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|port| *port != 0)
    .ok_or_else(|| DiscoveryError::Malformed("missing or invalid port".to_string()))?;

    Ok(CloudEndpoint {
        host: host.to_string(),
        port,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::domain::device::DeviceId;

    fn request() -> DiscoveryRequest {
        DiscoveryRequest::new(&DeviceId::from("1000abcdef"), "device-key", "PSF-B01-GL", "3.5.0", 8)
    }

    #[test]
    fn parses_endpoint() {
        let endpoint =
            parse_dispatch_reply(&json!({"error": 0, "reason": "ok", "IP": "52.1.2.3", "port": 443}))
                .unwrap();
        assert_eq!(
            endpoint,
            CloudEndpoint {
                host: "52.1.2.3".to_string(),
                port: 443
            }
        );
    }

    #[test_case(json!({"error": 406, "reason": "Authentication Failed"}) => DiscoveryError::Rejected(406); "rejected")]
    #[test_case(json!({"reason": "ok", "IP": "52.1.2.3", "port": 443}) => DiscoveryError::Malformed("missing error field".to_string()); "no error field")]
    #[test_case(json!({"error": 0, "port": 443}) => DiscoveryError::Malformed("missing IP".to_string()); "no ip")]
    #[test_case(json!({"error": 0, "IP": "52.1.2.3", "port": 70000}) => DiscoveryError::Malformed("missing or invalid port".to_string()); "port out of range")]
    fn rejects_unusable_replies(body: Value) -> DiscoveryError {
        parse_dispatch_reply(&body).unwrap_err()
    }

    #[tokio::test]
    async fn posts_request_and_returns_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/dispatch/device"))
            .and(body_partial_json(json!({
                "accept": "ws",
                "deviceid": "1000abcdef",
                "apikey": "device-key",
                "model": "PSF-B01-GL",
                "romVersion": "3.5.0",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "error": 0, "reason": "ok", "IP": "127.0.0.1", "port": 8443
            })))
            .expect(1)
            .mount(&server)
            .await;

        let discovery = HttpCloudDiscovery::new(
            format!("{}/dispatch/device", server.uri()),
            Duration::from_secs(5),
        )
        .unwrap();
        let endpoint = discovery.discover(&request()).await.unwrap();
        assert_eq!(endpoint.port, 8443);
    }

    #[tokio::test]
    async fn http_error_is_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let discovery = HttpCloudDiscovery::new(server.uri(), Duration::from_secs(5)).unwrap();
        assert_eq!(
            discovery.discover(&request()).await,
            Err(DiscoveryError::Status(503))
        );
    }

    #[tokio::test]
    async fn non_json_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let discovery = HttpCloudDiscovery::new(server.uri(), Duration::from_secs(5)).unwrap();
        assert!(matches!(
            discovery.discover(&request()).await,
            Err(DiscoveryError::Malformed(_))
        ));
    }
}
