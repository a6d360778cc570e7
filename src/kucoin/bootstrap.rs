//! Bullet token negotiation against the KuCoin REST API

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::credentials::Credential;
use super::types::StreamError;

const PUBLIC_BULLET_PATH: &str = "/api/v1/bullet-public";
const PRIVATE_BULLET_PATH: &str = "/api/v1/bullet-private";
const SUCCESS_CODE: &str = "200000";

/// Exchange codes that mean the credential itself was rejected
const AUTH_ERROR_CODES: &[&str] = &[
    "400001", "400002", "400003", "400004", "400005", "400006", "400007", "411100",
];

/// A candidate streaming server with its keep-alive parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
}

impl Endpoint {
    /// Build the streaming URL for this endpoint
    pub fn connect_url(&self, token: &str, connect_id: &str) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}token={}&connectId={}",
            self.url, separator, token, connect_id
        )
    }
}

/// Result of one bootstrap negotiation; tokens are single use
#[derive(Debug, Clone)]
pub struct BootstrapInfo {
    pub token: String,
    /// Candidate endpoints in priority order
    pub endpoints: Vec<Endpoint>,
    pub issued_at: DateTime<Utc>,
}

/// Obtains a connection token and candidate endpoints
pub trait BootstrapResolver: Send + Sync + 'static {
    fn resolve(
        &self,
        credential: &Credential,
    ) -> impl Future<Output = Result<BootstrapInfo, StreamError>> + Send;
}

impl<R: BootstrapResolver> BootstrapResolver for Arc<R> {
    fn resolve(
        &self,
        credential: &Credential,
    ) -> impl Future<Output = Result<BootstrapInfo, StreamError>> + Send {
        (**self).resolve(credential)
    }
}

/// Bootstrap resolver backed by the exchange REST surface
pub struct RestBootstrapResolver {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl RestBootstrapResolver {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            timeout,
        }
    }

    async fn request_bullet(&self, credential: &Credential) -> Result<BootstrapInfo, StreamError> {
        let path = if credential.is_private() {
            PRIVATE_BULLET_PATH
        } else {
            PUBLIC_BULLET_PATH
        };
        let url = format!("{}{}", self.base_url, path);

        debug!("Requesting bullet token from: {}", url);

        let mut request = self.client.post(&url).timeout(self.timeout);
        if credential.is_private() {
            let headers = credential.sign(Utc::now().timestamp_millis(), "POST", path, "")?;
            for (name, value) in headers.pairs() {
                request = request.header(name, value);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| StreamError::Network(format!("Failed to send bullet request: {}", e)))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| StreamError::Network(format!("Failed to read bullet response: {}", e)))?;

        parse_bullet_response(status, &body)
    }
}

impl BootstrapResolver for RestBootstrapResolver {
    async fn resolve(&self, credential: &Credential) -> Result<BootstrapInfo, StreamError> {
        let info = self.request_bullet(credential).await?;
        info!(
            "Obtained {} bullet token with {} candidate endpoints",
            if credential.is_private() { "private" } else { "public" },
            info.endpoints.len()
        );
        Ok(info)
    }
}

#[derive(Debug, Deserialize)]
struct BulletResponse {
    code: String,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<BulletData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulletData {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    instance_servers: Vec<InstanceServer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceServer {
    endpoint: String,
    #[serde(default)]
    protocol: Option<String>,
    ping_interval: u64,
    ping_timeout: u64,
}

/// Classify and parse a bullet response body
pub(crate) fn parse_bullet_response(status: u16, body: &str) -> Result<BootstrapInfo, StreamError> {
    if status == 401 || status == 403 {
        return Err(StreamError::Auth(format!("HTTP {}: {}", status, body)));
    }
    if status >= 500 {
        return Err(StreamError::Network(format!("HTTP {}: {}", status, body)));
    }

    let response: BulletResponse = serde_json::from_str(body)
        .map_err(|e| StreamError::Protocol(format!("Failed to parse bullet response: {}", e)))?;

    if response.code != SUCCESS_CODE {
        let msg = response.msg.unwrap_or_default();
        if AUTH_ERROR_CODES.contains(&response.code.as_str()) {
            return Err(StreamError::Auth(format!("{}: {}", response.code, msg)));
        }
        return Err(StreamError::Protocol(format!(
            "Bullet request rejected with code {}: {}",
            response.code, msg
        )));
    }

    let data = response
        .data
        .ok_or_else(|| StreamError::Protocol("Bullet response has no data".to_string()))?;

    let token = data
        .token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| StreamError::Protocol("Bullet response has no token".to_string()))?;

    let endpoints: Vec<Endpoint> = data
        .instance_servers
        .into_iter()
        .filter(|server| match server.protocol.as_deref() {
            None | Some("websocket") => true,
            Some(other) => {
                warn!("Skipping instance server with protocol {}", other);
                false
            }
        })
        .map(|server| Endpoint {
            url: server.endpoint,
            ping_interval_ms: server.ping_interval,
            ping_timeout_ms: server.ping_timeout,
        })
        .collect();

    if endpoints.is_empty() {
        return Err(StreamError::Protocol(
            "Bullet response has no usable endpoints".to_string(),
        ));
    }

    Ok(BootstrapInfo {
        token,
        endpoints,
        issued_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn bullet_body() -> serde_json::Value {
        serde_json::json!({
            "code": "200000",
            "data": {
                "token": "tok-123",
                "instanceServers": [
                    {
                        "endpoint": "wss://ws-api-spot.kucoin.com/",
                        "encrypt": true,
                        "protocol": "websocket",
                        "pingInterval": 18000,
                        "pingTimeout": 10000
                    },
                    {
                        "endpoint": "wss://ws-api-spot-2.kucoin.com/",
                        "encrypt": true,
                        "protocol": "websocket",
                        "pingInterval": 18000,
                        "pingTimeout": 10000
                    }
                ]
            }
        })
    }

    #[test]
    fn test_connect_url() {
        let endpoint = Endpoint {
            url: "wss://ws-api-spot.kucoin.com/".to_string(),
            ping_interval_ms: 18000,
            ping_timeout_ms: 10000,
        };
        assert_eq!(
            endpoint.connect_url("abc", "c1"),
            "wss://ws-api-spot.kucoin.com/?token=abc&connectId=c1"
        );
    }

    #[test]
    fn test_parse_preserves_endpoint_order() {
        let info = parse_bullet_response(200, &bullet_body().to_string()).unwrap();
        assert_eq!(info.token, "tok-123");
        assert_eq!(info.endpoints.len(), 2);
        assert_eq!(info.endpoints[0].url, "wss://ws-api-spot.kucoin.com/");
        assert_eq!(info.endpoints[1].url, "wss://ws-api-spot-2.kucoin.com/");
        assert_eq!(info.endpoints[0].ping_interval_ms, 18000);
    }

    #[test]
    fn test_parse_missing_token_is_protocol_error() {
        let body = serde_json::json!({
            "code": "200000",
            "data": { "instanceServers": [] }
        });
        let result = parse_bullet_response(200, &body.to_string());
        assert!(matches!(result, Err(StreamError::Protocol(_))));
    }

    #[test]
    fn test_parse_empty_endpoints_is_protocol_error() {
        let body = serde_json::json!({
            "code": "200000",
            "data": { "token": "t", "instanceServers": [] }
        });
        let result = parse_bullet_response(200, &body.to_string());
        assert!(matches!(result, Err(StreamError::Protocol(_))));
    }

    #[test]
    fn test_parse_auth_failures() {
        assert!(matches!(
            parse_bullet_response(401, "unauthorized"),
            Err(StreamError::Auth(_))
        ));

        let body = serde_json::json!({ "code": "400003", "msg": "KC-API-KEY not exists" });
        assert!(matches!(
            parse_bullet_response(200, &body.to_string()),
            Err(StreamError::Auth(_))
        ));
    }

    #[test]
    fn test_parse_server_error_is_network_error() {
        assert!(matches!(
            parse_bullet_response(503, "unavailable"),
            Err(StreamError::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_public_bullet() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(PUBLIC_BULLET_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(bullet_body()))
            .expect(1)
            .mount(&server)
            .await;

        let resolver = RestBootstrapResolver::new(server.uri(), Duration::from_secs(5));
        let info = resolver.resolve(&Credential::public()).await.unwrap();
        assert_eq!(info.token, "tok-123");
    }

    #[tokio::test]
    async fn test_resolve_private_bullet_sends_signed_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(PRIVATE_BULLET_PATH))
            .and(header_exists("KC-API-KEY"))
            .and(header_exists("KC-API-SIGN"))
            .and(header_exists("KC-API-TIMESTAMP"))
            .and(header_exists("KC-API-PASSPHRASE"))
            .respond_with(ResponseTemplate::new(200).set_body_json(bullet_body()))
            .expect(1)
            .mount(&server)
            .await;

        let resolver = RestBootstrapResolver::new(server.uri(), Duration::from_secs(5));
        let credential = Credential::private("key", "secret", "phrase");
        let info = resolver.resolve(&credential).await.unwrap();
        assert_eq!(info.endpoints.len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_unreachable_is_network_error() {
        // Nothing listens on port 9 locally
        let resolver = RestBootstrapResolver::new("http://127.0.0.1:9", Duration::from_secs(2));
        let result = resolver.resolve(&Credential::public()).await;
        assert!(matches!(result, Err(StreamError::Network(_))));
    }
}
