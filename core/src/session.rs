//! Courier sessions against the remote tracking service.
//!
//! [`TrackingApi`] is the narrow seam to the service (login, delivery
//! snapshot, location report). [`HttpTrackingApi`] speaks the service's JSON
//! over HTTP; tests substitute scripted implementations. A
//! [`CourierSession`] binds one authenticated identity to its bearer token.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{CourierCredential, SimulatorConfig};
use crate::delivery::{DeliveryRecord, DeliverySnapshot, LocationAck, LocationReport};
use crate::geo::GeoPoint;
use crate::retry::RetryClassifiable;

const LOGIN_ENDPOINT: &str = "/auth/login";
const DELIVERIES_ENDPOINT: &str = "/deliveries";
const LOCATIONS_ENDPOINT: &str = "/locations";

/// Opaque bearer credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(***)")
    }
}

/// Login failure. Fatal for that identity until the next attempt.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("login rejected (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("parse error: {0}")]
    Parse(String),
}

/// Delivery snapshot failure. The current sweep is skipped.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("session token rejected")]
    Unauthorized,

    #[error("delivery fetch failed (HTTP {status}): {body}")]
    Status { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("no courier session available")]
    NoSession,
}

/// Coarse classification of a failed location report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportErrorKind {
    /// Network trouble or a server-side failure; worth retrying.
    Transient,
    /// The delivery is gone, finished, or no longer this courier's.
    Rejected,
    /// The bearer token expired or was revoked.
    Unauthorized,
    /// The service refused the payload itself.
    Invalid,
}

#[derive(Debug, Error, PartialEq)]
pub enum ReportError {
    #[error("transient report failure: {0}")]
    Transient(String),

    #[error("report rejected (HTTP {status})")]
    Rejected { status: u16 },

    #[error("session token rejected")]
    Unauthorized,

    #[error("report refused (HTTP {status}): {body}")]
    Invalid { status: u16, body: String },
}

impl ReportError {
    pub fn kind(&self) -> ReportErrorKind {
        match self {
            Self::Transient(_) => ReportErrorKind::Transient,
            Self::Rejected { .. } => ReportErrorKind::Rejected,
            Self::Unauthorized => ReportErrorKind::Unauthorized,
            Self::Invalid { .. } => ReportErrorKind::Invalid,
        }
    }

    /// Map a non-success HTTP status to its report error.
    pub fn from_status(status: StatusCode, body: String) -> Self {
        match status {
            StatusCode::UNAUTHORIZED => Self::Unauthorized,
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => Self::Rejected {
                status: status.as_u16(),
            },
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                Self::Transient(format!("HTTP {status}"))
            }
            s if s.is_server_error() => Self::Transient(format!("HTTP {status}: {body}")),
            _ => Self::Invalid {
                status: status.as_u16(),
                body,
            },
        }
    }
}

impl RetryClassifiable for ReportError {
    fn is_retryable(&self) -> bool {
        self.kind() == ReportErrorKind::Transient
    }
}

/// The remote tracking service, as seen by the engine.
#[async_trait]
pub trait TrackingApi: Send + Sync {
    /// One login call. No retry.
    async fn login(&self, credential: &CourierCredential) -> Result<SessionToken, AuthError>;

    /// Every delivery visible to the token's owner.
    async fn fetch_deliveries(
        &self,
        token: &SessionToken,
    ) -> Result<Vec<DeliveryRecord>, FetchError>;

    /// Report one position for a delivery.
    async fn report_location(
        &self,
        token: &SessionToken,
        delivery_id: &str,
        point: GeoPoint,
    ) -> Result<LocationAck, ReportError>;
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

/// JSON-over-HTTP client for the tracking service.
#[derive(Debug, Clone)]
pub struct HttpTrackingApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTrackingApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tracksim/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn from_config(config: &SimulatorConfig) -> reqwest::Result<Self> {
        Self::new(config.base_url.clone(), config.request_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl TrackingApi for HttpTrackingApi {
    async fn login(&self, credential: &CourierCredential) -> Result<SessionToken, AuthError> {
        let response = self
            .client
            .post(self.endpoint_url(LOGIN_ENDPOINT))
            .json(&LoginRequest {
                email: &credential.identity,
                password: &credential.secret,
            })
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: LoginResponse =
            serde_json::from_str(&body).map_err(|e| AuthError::Parse(e.to_string()))?;
        Ok(SessionToken::new(parsed.token))
    }

    async fn fetch_deliveries(
        &self,
        token: &SessionToken,
    ) -> Result<Vec<DeliveryRecord>, FetchError> {
        let response = self
            .client
            .get(self.endpoint_url(DELIVERIES_ENDPOINT))
            .bearer_auth(token.as_str())
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(FetchError::Unauthorized);
        }
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| FetchError::Parse(e.to_string()))
    }

    async fn report_location(
        &self,
        token: &SessionToken,
        delivery_id: &str,
        point: GeoPoint,
    ) -> Result<LocationAck, ReportError> {
        let response = self
            .client
            .post(self.endpoint_url(LOCATIONS_ENDPOINT))
            .bearer_auth(token.as_str())
            .json(&LocationReport {
                delivery_id,
                latitude: point.latitude,
                longitude: point.longitude,
            })
            .send()
            .await
            .map_err(|e| ReportError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReportError::from_status(status, body));
        }

        // The ack body is informational; a 2xx is what counts.
        Ok(response.json::<LocationAck>().await.unwrap_or_default())
    }
}

/// One authenticated courier identity.
///
/// Read-only after authentication and shared (via `Arc`) by every task
/// driving a delivery for this courier. An expired token is handled by
/// replacing the session, never by mutating it.
#[derive(Clone)]
pub struct CourierSession {
    identity: String,
    token: SessionToken,
    api: Arc<dyn TrackingApi>,
    acquired_at: Instant,
}

impl fmt::Debug for CourierSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CourierSession")
            .field("identity", &self.identity)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl CourierSession {
    /// Log in once with `credential`. Failures are returned, not retried.
    pub async fn authenticate(
        api: Arc<dyn TrackingApi>,
        credential: &CourierCredential,
    ) -> Result<Self, AuthError> {
        let token = api.login(credential).await?;
        tracing::info!(courier = %credential.identity, "Courier authenticated");
        Ok(Self::from_token(api, credential.identity.clone(), token))
    }

    pub fn from_token(api: Arc<dyn TrackingApi>, identity: String, token: SessionToken) -> Self {
        Self {
            identity,
            token,
            api,
            acquired_at: Instant::now(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// When the token was obtained.
    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    pub async fn report_location(
        &self,
        delivery_id: &str,
        point: GeoPoint,
    ) -> Result<LocationAck, ReportError> {
        self.api
            .report_location(&self.token, delivery_id, point)
            .await
    }

    /// Current snapshot of deliveries visible to this courier's token.
    pub async fn fetch_active_deliveries(&self) -> Result<DeliverySnapshot, FetchError> {
        self.api
            .fetch_deliveries(&self.token)
            .await
            .map(DeliverySnapshot::new)
    }
}
