//! In-memory stand-in for the tracking service.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracksim_core::config::{CourierCredential, PacingConfig, RetryConfig, SimulatorConfig};
use tracksim_core::delivery::{CourierRef, LocationAck};
use tracksim_core::session::{AuthError, FetchError, ReportError, SessionToken};
use tracksim_core::{DeliveryRecord, DeliveryStatus, GeoPoint, TrackingApi};

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub token: String,
    pub delivery_id: String,
    pub point: GeoPoint,
}

/// Scripted service. Reports succeed unless a failure was queued for that
/// delivery; logins succeed unless the identity was refused.
#[derive(Default)]
pub struct ScriptedApi {
    deliveries: Mutex<Vec<DeliveryRecord>>,
    refused_logins: Mutex<HashSet<String>>,
    fetch_failures: Mutex<VecDeque<FetchError>>,
    report_failures: Mutex<HashMap<String, VecDeque<ReportError>>>,
    /// Tokens numbered up to this value are answered with 401.
    revoked_up_to: AtomicUsize,
    reports: Mutex<Vec<Report>>,
    logins: AtomicUsize,
}

impl ScriptedApi {
    pub fn new(deliveries: Vec<DeliveryRecord>) -> Self {
        let api = Self::default();
        api.set_deliveries(deliveries);
        api
    }

    pub fn set_deliveries(&self, deliveries: Vec<DeliveryRecord>) {
        *self.deliveries.lock().unwrap() = deliveries;
    }

    pub fn set_status(&self, delivery_id: &str, status: DeliveryStatus) {
        for record in self.deliveries.lock().unwrap().iter_mut() {
            if record.id == delivery_id {
                record.status = status;
            }
        }
    }

    pub fn refuse_login(&self, identity: &str) {
        self.refused_logins
            .lock()
            .unwrap()
            .insert(identity.to_string());
    }

    pub fn fail_next_fetch(&self, err: FetchError) {
        self.fetch_failures.lock().unwrap().push_back(err);
    }

    /// Queue failures returned, in order, by the next reports for `delivery_id`.
    pub fn fail_reports(&self, delivery_id: &str, errors: impl IntoIterator<Item = ReportError>) {
        self.report_failures
            .lock()
            .unwrap()
            .entry(delivery_id.to_string())
            .or_default()
            .extend(errors);
    }

    /// Every token handed out so far is answered with 401 from now on.
    pub fn revoke_issued_tokens(&self) {
        self.revoked_up_to
            .store(self.logins.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    fn is_revoked(&self, token: &SessionToken) -> bool {
        let serial = token
            .as_str()
            .rsplit('-')
            .next()
            .and_then(|n| n.parse::<usize>().ok())
            .unwrap_or(0);
        serial <= self.revoked_up_to.load(Ordering::SeqCst)
    }

    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().unwrap().clone()
    }

    pub fn reports_for(&self, delivery_id: &str) -> Vec<GeoPoint> {
        self.reports()
            .into_iter()
            .filter(|r| r.delivery_id == delivery_id)
            .map(|r| r.point)
            .collect()
    }

    pub fn login_count(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TrackingApi for ScriptedApi {
    async fn login(&self, credential: &CourierCredential) -> Result<SessionToken, AuthError> {
        if self
            .refused_logins
            .lock()
            .unwrap()
            .contains(&credential.identity)
        {
            return Err(AuthError::Rejected {
                status: 401,
                body: "invalid credentials".to_string(),
            });
        }
        let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionToken::new(format!("token-{}-{n}", credential.identity)))
    }

    async fn fetch_deliveries(
        &self,
        token: &SessionToken,
    ) -> Result<Vec<DeliveryRecord>, FetchError> {
        if self.is_revoked(token) {
            return Err(FetchError::Unauthorized);
        }
        if let Some(err) = self.fetch_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self.deliveries.lock().unwrap().clone())
    }

    async fn report_location(
        &self,
        token: &SessionToken,
        delivery_id: &str,
        point: GeoPoint,
    ) -> Result<LocationAck, ReportError> {
        if self.is_revoked(token) {
            return Err(ReportError::Unauthorized);
        }
        let scripted = self
            .report_failures
            .lock()
            .unwrap()
            .get_mut(delivery_id)
            .and_then(VecDeque::pop_front);
        if let Some(err) = scripted {
            return Err(err);
        }
        self.reports.lock().unwrap().push(Report {
            token: token.as_str().to_string(),
            delivery_id: delivery_id.to_string(),
            point,
        });
        Ok(LocationAck {
            delivery_id: Some(delivery_id.to_string()),
            ..LocationAck::default()
        })
    }
}

pub fn record(id: &str, courier: Option<&str>, status: DeliveryStatus) -> DeliveryRecord {
    DeliveryRecord {
        id: id.to_string(),
        courier_id: courier.map(|c| format!("id-{c}")),
        courier: courier.map(|email| CourierRef {
            email: email.to_string(),
            name: None,
        }),
        destination: GeoPoint::new(-23.541, -46.624),
        last_known_location: Some(GeoPoint::new(-23.5605, -46.6433)),
        status,
    }
}

/// Config with fast retries and the given per-waypoint pacing.
pub fn config(couriers: &[&str], pacing: Duration, point_count: usize) -> SimulatorConfig {
    let pacing_ms = u64::try_from(pacing.as_millis()).unwrap();
    let mut config = SimulatorConfig {
        couriers: couriers
            .iter()
            .map(|c| CourierCredential::new(*c, "123456"))
            .collect(),
        pacing: PacingConfig {
            min_ms: pacing_ms,
            max_ms: pacing_ms,
            proximity_scaling: false,
        },
        retry: RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            factor: 2.0,
        },
        shutdown_grace_secs: 1,
        ..SimulatorConfig::default()
    };
    config.path.point_count = point_count;
    config
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
