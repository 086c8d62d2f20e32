//! API Gateway Module
//!
//! Handles HTTP communication with the Route Master API. Every request goes
//! through [`ApiClient`], which attaches the session's bearer token when one
//! is stored and always declares a JSON body.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::Session;
use crate::config::REQUEST_TIMEOUT;
use crate::storage::StorageError;

/// Outbound request after header injection
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<serde_json::Value>,
}

/// Raw response as seen by the gateway
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Dispatches a prepared request over the network
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// Production transport backed by reqwest
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers);

        if let Some(body) = &request.body {
            let bytes = serde_json::to_vec(body).map_err(|e| TransportError::Other(e.to_string()))?;
            builder = builder.body(bytes);
        }

        let response = builder.send().await.map_err(TransportError::from_reqwest)?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(TransportError::from_reqwest)?
            .to_vec();

        Ok(ApiResponse { status, body })
    }
}

/// API client for the Route Master backend
pub struct ApiClient {
    base_url: String,
    session: Session,
    transport: Arc<dyn HttpTransport>,
}

impl ApiClient {
    /// Create a client using the network transport and the fixed request timeout
    pub fn new(base_url: &str, session: Session) -> Result<Self, TransportError> {
        let transport = ReqwestTransport::new(REQUEST_TIMEOUT)?;
        Ok(Self::with_transport(base_url, session, Arc::new(transport)))
    }

    /// Create a client over an arbitrary transport
    pub fn with_transport(
        base_url: &str,
        session: Session,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
            transport,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Log in with phone and password
    pub async fn login(&self, phone: &str, password: &str) -> Result<AuthResponse, RequestError> {
        debug!("Logging in driver");
        let response: AuthResponse = self
            .post("/api/auth/login", &LoginRequest { phone, password }, "error")
            .await?;
        response.ensure_token()?;
        info!("Login accepted");
        Ok(response)
    }

    /// Create a driver account
    pub async fn register(
        &self,
        name: &str,
        phone: &str,
        password: &str,
    ) -> Result<AuthResponse, RequestError> {
        debug!("Registering driver");
        let response: AuthResponse = self
            .post("/api/auth/register", &RegisterRequest { name, phone, password }, "error")
            .await?;
        response.ensure_token()?;
        info!("Registration accepted");
        Ok(response)
    }

    /// Register a bus and its route for the current driver.
    ///
    /// Failures report the body's `message` field, not `error`.
    pub async fn add_bus(&self, bus: &AddBusRequest<'_>) -> Result<AddBusResponse, RequestError> {
        info!("Registering bus {}: {} -> {}", bus.bus_number, bus.from_city, bus.to_city);
        self.post("/api/bus/add", bus, "message").await
    }

    /// Fetch the last reported location of a bus
    pub async fn bus_location(&self, bus_id: &str) -> Result<BusLocationResponse, RequestError> {
        let mut url = Url::parse(&format!("{}/api/passenger/bus", self.base_url))
            .map_err(|e| RequestError::new(None, RequestFailure::InvalidUrl(e.to_string())))?;
        url.path_segments_mut()
            .map_err(|_| {
                RequestError::new(None, RequestFailure::InvalidUrl(self.base_url.clone()))
            })?
            .push(bus_id);

        self.call(Method::GET, url.to_string(), None, "error").await
    }

    /// POST a JSON body to `path`. `error_field` names the body field that
    /// carries the server's reason on failure.
    async fn post<B, R>(&self, path: &str, body: &B, error_field: &str) -> Result<R, RequestError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = serde_json::to_value(body)
            .map_err(|e| RequestError::new(None, RequestFailure::Encode(e.to_string())))?;
        let url = format!("{}{}", self.base_url, path);
        self.call(Method::POST, url, Some(body), error_field).await
    }

    fn prepare(
        &self,
        method: Method,
        url: String,
        body: Option<serde_json::Value>,
    ) -> Result<ApiRequest, RequestError> {
        let mut headers = HeaderMap::new();

        let token = self
            .session
            .token()
            .map_err(|e| RequestError::new(None, RequestFailure::Storage(e)))?;
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| RequestError::new(None, RequestFailure::Encode(e.to_string())))?;
            headers.insert(AUTHORIZATION, value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(ApiRequest { method, url, headers, body })
    }

    async fn call<R: DeserializeOwned>(
        &self,
        method: Method,
        url: String,
        body: Option<serde_json::Value>,
        error_field: &str,
    ) -> Result<R, RequestError> {
        let request = self.prepare(method, url, body)?;
        debug!("{} {}", request.method, request.url);

        let response = self.transport.send(request).await.map_err(|e| {
            warn!("Request failed: {}", e);
            RequestError::new(None, RequestFailure::Transport(e))
        })?;

        if !response.is_success() {
            let server_message = server_message(&response.body, error_field);
            warn!("Server responded {}: {:?}", response.status, server_message);
            return Err(RequestError {
                status: Some(response.status),
                server_message,
                cause: RequestFailure::Status(response.status),
            });
        }

        // An empty success body is read as an empty object.
        let bytes: &[u8] = if response.body.iter().all(u8::is_ascii_whitespace) {
            b"{}"
        } else {
            &response.body
        };

        serde_json::from_slice(bytes).map_err(|e| {
            RequestError::new(Some(response.status), RequestFailure::Decode(e.to_string()))
        })
    }
}

/// Extract the non-blank string `field` from an error body
fn server_message(body: &[u8], field: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let message = value.get(field)?.as_str()?.trim();
    (!message.is_empty()).then(|| message.to_string())
}

// Request/Response types

#[derive(Serialize)]
struct LoginRequest<'a> {
    phone: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    name: &'a str,
    phone: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddBusRequest<'a> {
    pub bus_number: &'a str,
    pub from_city: &'a str,
    pub to_city: &'a str,
    pub shift_start_time: &'a str,
    pub shift_end_time: &'a str,
}

/// Reference to a server-side document
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AuthResponse {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub driver: Option<EntityRef>,
}

impl AuthResponse {
    pub fn driver_id(&self) -> Option<&str> {
        non_empty_id(self.driver.as_ref())
    }

    fn ensure_token(&self) -> Result<(), RequestError> {
        if self.token.trim().is_empty() {
            return Err(RequestError::new(
                Some(200),
                RequestFailure::Decode("response carried no token".into()),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AddBusResponse {
    #[serde(default)]
    pub bus: Option<EntityRef>,
}

impl AddBusResponse {
    pub fn bus_id(&self) -> Option<&str> {
        non_empty_id(self.bus.as_ref())
    }
}

fn non_empty_id(entity: Option<&EntityRef>) -> Option<&str> {
    entity
        .and_then(|e| e.id.as_deref())
        .filter(|id| !id.trim().is_empty())
}

#[derive(Debug, Deserialize)]
pub struct BusLocationResponse {
    #[serde(default)]
    pub location: Option<GeoPoint>,
    #[serde(rename = "lastUpdated", default, deserialize_with = "lenient_timestamp")]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Accept an RFC 3339 string or epoch milliseconds. Anything else reads as
/// absent rather than failing the whole response.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|ms| ms as i64))
            .and_then(DateTime::from_timestamp_millis),
        _ => None,
    })
}

impl BusLocationResponse {
    pub fn coordinates(&self) -> Option<Coordinates> {
        self.location.as_ref().and_then(|l| l.coordinates)
    }
}

#[derive(Debug, Deserialize)]
pub struct GeoPoint {
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
}

/// GeoJSON position. The wire order is `[longitude, latitude, altitude?]`;
/// anything after the first two is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(try_from = "Vec<f64>")]
pub struct Coordinates {
    pub longitude: f64,
    pub latitude: f64,
}

impl TryFrom<Vec<f64>> for Coordinates {
    type Error = String;

    fn try_from(position: Vec<f64>) -> Result<Self, Self::Error> {
        match position.as_slice() {
            [longitude, latitude, ..] => Ok(Self {
                longitude: *longitude,
                latitude: *latitude,
            }),
            _ => Err(format!("position needs at least 2 values, got {}", position.len())),
        }
    }
}

/// Transport-level failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Network error: {0}")]
    Other(String),
}

impl TransportError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else {
            TransportError::Other(e.to_string())
        }
    }
}

/// Why a request did not produce a usable response
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RequestFailure {
    #[error("Server responded with status {0}")]
    Status(u16),

    #[error(transparent)]
    Transport(TransportError),

    #[error("Invalid response body: {0}")]
    Decode(String),

    #[error("Could not encode request: {0}")]
    Encode(String),

    #[error("Invalid request URL: {0}")]
    InvalidUrl(String),

    #[error("Token unavailable: {0}")]
    Storage(StorageError),
}

/// A failed API call. Never retried by the gateway.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{cause}")]
pub struct RequestError {
    pub status: Option<u16>,
    pub server_message: Option<String>,
    pub cause: RequestFailure,
}

impl RequestError {
    pub fn new(status: Option<u16>, cause: RequestFailure) -> Self {
        Self { status, server_message: None, cause }
    }

    /// Message to show the user: the server's own wording when it sent one
    pub fn user_message(&self, fallback: &str) -> String {
        self.server_message
            .clone()
            .unwrap_or_else(|| fallback.to_string())
    }
}
