//! Signed transport to the remote task service.
//!
//! [`RtmClient`] is the shared HTTP client handed to the rest of the system.
//! Every request carries `api_key`, `format=json` and an `api_sig` computed by
//! [`RequestSigner`]. Authenticated calls add the installed credential as
//! `auth_token` before signing; the two bootstrap calls (`rtm.auth.getFrob`
//! and `rtm.auth.getToken`) never do.
//!
//! The installed credential is an immutable snapshot. Installing a new one
//! swaps the pointer, so concurrent requests see either the old token or the
//! new one.

use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::AuthConfig;
use crate::model::Permission;
use crate::signing::RequestSigner;
use crate::store::Secret;

/// Remote error code for an invalid or revoked auth token.
pub const INVALID_TOKEN_CODE: u32 = 98;

/// Remote error code for an invalid, unauthorized or expired frob.
pub const INVALID_TICKET_CODE: u32 = 101;

pub const METHOD_CHECK_TOKEN: &str = "rtm.auth.checkToken";
pub const METHOD_GET_FROB: &str = "rtm.auth.getFrob";
pub const METHOD_GET_TOKEN: &str = "rtm.auth.getToken";

/// Error type for remote calls.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request never produced a response.
    #[error("network error: {message}")]
    NetworkError { message: String },

    /// The service answered with a non-success HTTP status.
    #[error("unexpected HTTP status {status}")]
    HttpStatus { status: u16 },

    /// The service answered `stat="fail"`.
    #[error("remote error {code}: {message}")]
    Remote { code: u32, message: String },

    /// The response body did not have the expected shape.
    #[error("malformed response: {message}")]
    Malformed { message: String },

    /// Cancellation was requested while the call was in flight.
    #[error("request cancelled")]
    Cancelled,

    /// An authenticated call was made with no credential installed.
    #[error("no credential installed")]
    NotAuthenticated,

    /// The client could not be configured.
    #[error("client configuration error: {message}")]
    Config { message: String },
}

impl ApiError {
    /// Worth retrying: the service may answer differently next time.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::NetworkError { .. } => true,
            ApiError::HttpStatus { status } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// The service explicitly rejected the credential.
    pub fn is_credential_rejection(&self) -> bool {
        matches!(self, ApiError::Remote { code, .. } if *code == INVALID_TOKEN_CODE)
    }

    /// The service explicitly rejected the ticket.
    pub fn is_ticket_rejection(&self) -> bool {
        matches!(self, ApiError::Remote { code, .. } if *code == INVALID_TICKET_CODE)
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        ApiError::NetworkError {
            message: e.to_string(),
        }
    }
}

/// Remote account details.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub fullname: String,
}

/// Credential details returned by `checkToken` and `getToken`.
#[derive(Debug, Clone)]
pub struct AuthInfo {
    pub token: Secret,
    pub permission: Option<Permission>,
    pub user: RemoteUser,
}

#[derive(Deserialize)]
struct AuthPayload {
    token: String,
    #[serde(default)]
    perms: String,
    user: RemoteUser,
}

impl From<AuthPayload> for AuthInfo {
    fn from(payload: AuthPayload) -> Self {
        Self {
            token: Secret::new(payload.token),
            permission: payload.perms.parse().ok(),
            user: payload.user,
        }
    }
}

/// Shared, signing HTTP client for the remote service.
pub struct RtmClient {
    http: reqwest::Client,
    api_key: String,
    signer: RequestSigner,
    rest_url: String,
    auth_url: String,
    credential: RwLock<Option<Arc<Secret>>>,
    cancel: CancellationToken,
}

impl RtmClient {
    /// Build a client from configuration.
    pub fn new(config: &AuthConfig) -> Result<Self, ApiError> {
        if config.api_key.is_empty() {
            return Err(ApiError::Config {
                message: "api_key is not set".to_string(),
            });
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("milkauth/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ApiError::Config {
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            signer: RequestSigner::new(config.shared_secret.clone()),
            rest_url: config.rest_url.clone(),
            auth_url: config.auth_url.clone(),
            credential: RwLock::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Abort in-flight requests when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn signer(&self) -> &RequestSigner {
        &self.signer
    }

    pub fn auth_url(&self) -> &str {
        &self.auth_url
    }

    /// Install a credential for authenticated calls, replacing any previous one.
    pub fn install_credential(&self, token: Secret) {
        *self.credential.write() = Some(Arc::new(token));
    }

    /// Forget the installed credential.
    pub fn clear_credential(&self) {
        *self.credential.write() = None;
    }

    /// Snapshot of the installed credential.
    pub fn credential(&self) -> Option<Arc<Secret>> {
        self.credential.read().clone()
    }

    pub fn has_credential(&self) -> bool {
        self.credential.read().is_some()
    }

    /// Call an authenticated method with the installed credential.
    ///
    /// Returns the `rsp` object of a successful response.
    pub async fn call(
        &self,
        method: &str,
        params: &[(&str, &str)],
    ) -> Result<Map<String, Value>, ApiError> {
        let token = self.credential().ok_or(ApiError::NotAuthenticated)?;
        self.execute(method, params, Some(token)).await
    }

    /// Verify the installed credential (`rtm.auth.checkToken`).
    pub async fn check_credential(&self) -> Result<AuthInfo, ApiError> {
        let rsp = self.call(METHOD_CHECK_TOKEN, &[]).await?;
        parse_auth(rsp)
    }

    /// Issue an authorization ticket (`rtm.auth.getFrob`).
    pub async fn issue_ticket(&self) -> Result<String, ApiError> {
        let rsp = self.execute(METHOD_GET_FROB, &[], None).await?;
        match rsp.get("frob").and_then(Value::as_str) {
            Some(frob) if !frob.is_empty() => Ok(frob.to_string()),
            _ => Err(ApiError::Malformed {
                message: "response has no frob".to_string(),
            }),
        }
    }

    /// Exchange an authorized ticket for a credential (`rtm.auth.getToken`).
    pub async fn redeem_ticket(&self, ticket: &str) -> Result<AuthInfo, ApiError> {
        let rsp = self
            .execute(METHOD_GET_TOKEN, &[("frob", ticket)], None)
            .await?;
        parse_auth(rsp)
    }

    async fn execute(
        &self,
        method: &str,
        params: &[(&str, &str)],
        token: Option<Arc<Secret>>,
    ) -> Result<Map<String, Value>, ApiError> {
        let mut query: BTreeMap<String, String> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        query.insert("method".to_string(), method.to_string());
        query.insert("api_key".to_string(), self.api_key.clone());
        query.insert("format".to_string(), "json".to_string());
        if let Some(token) = &token {
            query.insert("auth_token".to_string(), token.expose().to_string());
        }

        let signed = self.signer.signed(query);
        tracing::debug!(method, authenticated = token.is_some(), "calling remote method");

        let request = self.http.get(&self.rest_url).query(&signed);

        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ApiError::Cancelled),
            response = request.send() => response?,
        };

        let status = response.status();
        let body = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ApiError::Cancelled),
            body = response.text() => body?,
        };

        if !status.is_success() {
            tracing::debug!(method, status = status.as_u16(), "remote returned error status");
            return Err(ApiError::HttpStatus {
                status: status.as_u16(),
            });
        }

        parse_response(&body)
    }
}

impl std::fmt::Debug for RtmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtmClient")
            .field("rest_url", &self.rest_url)
            .field("auth_url", &self.auth_url)
            .field("has_credential", &self.has_credential())
            .finish()
    }
}

/// Unwrap the `{"rsp": {...}}` envelope.
fn parse_response(body: &str) -> Result<Map<String, Value>, ApiError> {
    let value: Value = serde_json::from_str(body).map_err(|e| ApiError::Malformed {
        message: format!("invalid JSON: {}", e),
    })?;

    let Some(Value::Object(rsp)) = value.get("rsp").cloned() else {
        return Err(ApiError::Malformed {
            message: "missing rsp object".to_string(),
        });
    };

    match rsp.get("stat").and_then(Value::as_str) {
        Some("ok") => Ok(rsp),
        Some("fail") => {
            let err = rsp.get("err");
            let code = err
                .and_then(|e| e.get("code"))
                .and_then(|c| match c {
                    Value::String(s) => s.parse().ok(),
                    Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
                    _ => None,
                })
                .unwrap_or(0);
            let message = err
                .and_then(|e| e.get("msg"))
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            Err(ApiError::Remote { code, message })
        }
        other => Err(ApiError::Malformed {
            message: format!("unexpected stat {:?}", other),
        }),
    }
}

fn parse_auth(mut rsp: Map<String, Value>) -> Result<AuthInfo, ApiError> {
    let auth = rsp.remove("auth").ok_or_else(|| ApiError::Malformed {
        message: "response has no auth object".to_string(),
    })?;
    let payload: AuthPayload = serde_json::from_value(auth).map_err(|e| ApiError::Malformed {
        message: format!("invalid auth object: {}", e),
    })?;
    if payload.token.is_empty() {
        return Err(ApiError::Malformed {
            message: "auth object has an empty token".to_string(),
        });
    }
    Ok(payload.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(server: &MockServer) -> AuthConfig {
        AuthConfig::new("test-key", "test-secret")
            .with_endpoints(format!("{}/rest/", server.uri()), format!("{}/auth/", server.uri()))
    }

    fn auth_body(token: &str) -> Value {
        serde_json::json!({
            "rsp": {
                "stat": "ok",
                "auth": {
                    "token": token,
                    "perms": "delete",
                    "user": { "id": "123", "username": "alice", "fullname": "Alice A" }
                }
            }
        })
    }

    #[test]
    fn test_parse_failure_envelope() {
        let body = r#"{"rsp":{"stat":"fail","err":{"code":"98","msg":"Login failed / Invalid auth token"}}}"#;
        let err = parse_response(body).unwrap_err();
        assert!(err.is_credential_rejection());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_parse_malformed_envelope() {
        assert!(matches!(
            parse_response("not json"),
            Err(ApiError::Malformed { .. })
        ));
        assert!(matches!(
            parse_response(r#"{"other": 1}"#),
            Err(ApiError::Malformed { .. })
        ));
    }

    #[test]
    fn test_transient_classification() {
        assert!(ApiError::HttpStatus { status: 503 }.is_transient());
        assert!(ApiError::HttpStatus { status: 429 }.is_transient());
        assert!(!ApiError::HttpStatus { status: 404 }.is_transient());
        assert!(!ApiError::Cancelled.is_transient());
    }

    #[test]
    fn test_new_requires_api_key() {
        let config = AuthConfig::default();
        assert!(matches!(RtmClient::new(&config), Err(ApiError::Config { .. })));
    }

    #[tokio::test]
    async fn test_check_credential_signs_with_token() {
        let server = MockServer::start().await;
        let config = test_config(&server);
        let client = RtmClient::new(&config).unwrap();

        let expected_sig = client.signer().sign([
            ("api_key", "test-key"),
            ("auth_token", "good-token"),
            ("format", "json"),
            ("method", METHOD_CHECK_TOKEN),
        ]);

        Mock::given(method("GET"))
            .and(path("/rest/"))
            .and(query_param("method", METHOD_CHECK_TOKEN))
            .and(query_param("auth_token", "good-token"))
            .and(query_param("api_sig", expected_sig.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(auth_body("good-token")))
            .expect(1)
            .mount(&server)
            .await;

        client.install_credential(Secret::new("good-token"));
        let info = client.check_credential().await.unwrap();

        assert_eq!(info.user.username, "alice");
        assert_eq!(info.user.id, "123");
        assert_eq!(info.permission, Some(Permission::Delete));
    }

    #[tokio::test]
    async fn test_check_credential_without_token() {
        let server = MockServer::start().await;
        let client = RtmClient::new(&test_config(&server)).unwrap();

        let result = client.check_credential().await;
        assert!(matches!(result, Err(ApiError::NotAuthenticated)));
    }

    #[tokio::test]
    async fn test_bootstrap_calls_exclude_token() {
        let server = MockServer::start().await;
        let client = RtmClient::new(&test_config(&server)).unwrap();
        client.install_credential(Secret::new("should-not-be-sent"));

        let expected_sig = client.signer().sign([
            ("api_key", "test-key"),
            ("format", "json"),
            ("method", METHOD_GET_FROB),
        ]);

        Mock::given(method("GET"))
            .and(query_param("method", METHOD_GET_FROB))
            .and(query_param("api_sig", expected_sig.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "rsp": { "stat": "ok", "frob": "frob-1" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        assert_eq!(client.issue_ticket().await.unwrap(), "frob-1");

        let requests = server.received_requests().await.unwrap();
        assert!(!requests[0].url.query().unwrap_or("").contains("auth_token"));
    }

    #[tokio::test]
    async fn test_redeem_ticket_rejection() {
        let server = MockServer::start().await;
        let client = RtmClient::new(&test_config(&server)).unwrap();

        Mock::given(method("GET"))
            .and(query_param("method", METHOD_GET_TOKEN))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "rsp": { "stat": "fail", "err": { "code": "101", "msg": "Invalid frob - did you authenticate?" } }
            })))
            .mount(&server)
            .await;

        let err = client.redeem_ticket("stale").await.unwrap_err();
        assert!(err.is_ticket_rejection());
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let server = MockServer::start().await;
        let client = RtmClient::new(&test_config(&server)).unwrap();

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client.issue_ticket().await.unwrap_err();
        assert!(matches!(err, ApiError::HttpStatus { status: 503 }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_cancelled_client_returns_cancelled() {
        let server = MockServer::start().await;
        let cancel = CancellationToken::new();
        let client = RtmClient::new(&test_config(&server))
            .unwrap()
            .with_cancellation(cancel.clone());

        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(std::time::Duration::from_secs(30))
                    .set_body_json(serde_json::json!({ "rsp": { "stat": "ok", "frob": "f" } })),
            )
            .mount(&server)
            .await;

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), client.issue_ticket())
            .await
            .expect("request ignored cancellation");
        assert!(matches!(result, Err(ApiError::Cancelled)));
    }

    #[tokio::test]
    async fn test_install_replaces_snapshot() {
        let server = MockServer::start().await;
        let client = RtmClient::new(&test_config(&server)).unwrap();

        client.install_credential(Secret::new("one"));
        let snapshot = client.credential().unwrap();
        client.install_credential(Secret::new("two"));

        assert_eq!(snapshot.expose(), "one");
        assert_eq!(client.credential().unwrap().expose(), "two");

        client.clear_credential();
        assert!(!client.has_credential());
    }
}
