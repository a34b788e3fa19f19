use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;
use tracksim_core::config::CourierCredential;
use tracksim_core::session::ReportError;
use tracksim_core::task::{AbortReason, TaskProgress};
use tracksim_core::{
    CourierSession, DeliveryStatus, SimulationTask, TaskOutcome, TaskSettings, TaskState,
    TrackingApi,
};

use super::support::{ScriptedApi, config, eventually, record};

const COURIER: &str = "entregador1@exemplo.com";

async fn prepared(api: &Arc<ScriptedApi>, pacing: Duration) -> SimulationTask {
    let dyn_api: Arc<dyn TrackingApi> = api.clone();
    let session = CourierSession::authenticate(dyn_api, &CourierCredential::new(COURIER, "123456"))
        .await
        .unwrap();
    let settings = TaskSettings::from(&config(&[COURIER], pacing, 5));
    SimulationTask::prepare(
        &record("d-1", Some(COURIER), DeliveryStatus::InTransit),
        Arc::new(session),
        &settings,
    )
    .unwrap()
}

#[tokio::test]
async fn transient_failures_resend_the_same_waypoint() {
    let api = Arc::new(ScriptedApi::default());
    api.fail_reports(
        "d-1",
        [
            ReportError::Transient("connection reset".to_string()),
            ReportError::Transient("HTTP 503".to_string()),
        ],
    );
    let task = prepared(&api, Duration::from_millis(1)).await;
    let path: Vec<_> = task.path().iter().collect();

    let outcome = task.run(CancellationToken::new()).await;

    assert_eq!(outcome, TaskOutcome::Completed { reported: 5 });
    assert_eq!(api.reports_for("d-1"), path);
}

#[tokio::test]
async fn exhausted_retries_abort_without_skipping() {
    let api = Arc::new(ScriptedApi::default());
    api.fail_reports(
        "d-1",
        (0..3).map(|_| ReportError::Transient("HTTP 502".to_string())),
    );
    let task = prepared(&api, Duration::from_millis(1)).await;

    let outcome = task.run(CancellationToken::new()).await;

    match outcome {
        TaskOutcome::Aborted {
            cursor: 0,
            reason: AbortReason::RetriesExhausted { attempts, .. },
        } => assert_eq!(attempts, 3),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(api.reports_for("d-1").is_empty());
}

#[tokio::test]
async fn rejection_stops_immediately() {
    let api = Arc::new(ScriptedApi::default());
    api.fail_reports("d-1", [ReportError::Rejected { status: 403 }]);
    let task = prepared(&api, Duration::from_millis(1)).await;
    let progress = task.subscribe();

    let outcome = task.run(CancellationToken::new()).await;

    assert_eq!(
        outcome,
        TaskOutcome::Rejected {
            cursor: 0,
            status: 403
        }
    );
    assert!(api.reports_for("d-1").is_empty());
    assert_eq!(progress.borrow().state, TaskState::Rejected);
}

#[tokio::test]
async fn revoked_token_ends_as_session_expired() {
    let api = Arc::new(ScriptedApi::default());
    let task = prepared(&api, Duration::from_millis(1)).await;
    api.revoke_issued_tokens();

    let outcome = task.run(CancellationToken::new()).await;

    assert_eq!(
        outcome,
        TaskOutcome::Aborted {
            cursor: 0,
            reason: AbortReason::SessionExpired
        }
    );
}

#[tokio::test]
async fn refused_payload_is_not_retried() {
    let api = Arc::new(ScriptedApi::default());
    api.fail_reports(
        "d-1",
        [ReportError::Invalid {
            status: 400,
            body: "latitude and longitude are required".to_string(),
        }],
    );
    let task = prepared(&api, Duration::from_millis(1)).await;

    let outcome = task.run(CancellationToken::new()).await;

    assert!(matches!(
        outcome,
        TaskOutcome::Aborted {
            cursor: 0,
            reason: AbortReason::InvalidReport { status: 400, .. }
        }
    ));
    assert!(api.reports_for("d-1").is_empty());
}

#[tokio::test]
async fn cancellation_interrupts_pacing() {
    let api = Arc::new(ScriptedApi::default());
    let task = prepared(&api, Duration::from_secs(3600)).await;
    let progress = task.subscribe();
    let cancel = CancellationToken::new();
    let handle = task.spawn(cancel.clone());

    assert!(eventually(|| progress.borrow().cursor == 1).await);
    cancel.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("task should stop promptly")
        .unwrap();

    assert_eq!(outcome, TaskOutcome::Cancelled { cursor: 1 });
    assert_eq!(api.reports_for("d-1").len(), 1);
    assert_eq!(
        *progress.borrow(),
        TaskProgress {
            state: TaskState::Cancelled,
            cursor: 1,
            total: 5,
        }
    );
}

#[tokio::test]
async fn final_report_is_the_exact_destination() {
    let api = Arc::new(ScriptedApi::default());
    let task = prepared(&api, Duration::ZERO).await;
    let destination = task.path().destination();

    task.run(CancellationToken::new()).await;

    assert_eq!(api.reports_for("d-1").last().copied(), Some(destination));
}
