//! End-to-end tests against the `proclink-fixture` child program.

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use proclink::{
    ControllerConfig, ControllerError, ExitOutcome, LifecycleState, LinkError,
    ProcessController, RequestError,
};

const FIXTURE: &str = env!("CARGO_BIN_EXE_proclink-fixture");
const WAIT: Duration = Duration::from_secs(10);

fn config() -> ControllerConfig {
    ControllerConfig::new().with_ready_timeout(Some(WAIT))
}

/// `"stop"` alone must end the child, with a clean exit and no kill.
async fn stop_cooperatively(controller: &mut ProcessController) -> ExitOutcome {
    controller.stop_child().await.unwrap();
    let outcome = tokio::time::timeout(WAIT, controller.wait_for_completion())
        .await
        .expect("child should exit after stop")
        .unwrap();
    assert!(outcome.success(), "unexpected exit: {outcome}");
    assert_eq!(controller.state(), LifecycleState::Terminated);
    outcome
}

async fn start(mode: &str) -> ProcessController {
    let args: Vec<String> = std::iter::once(mode.to_string())
        .chain(["1", "2", "3"].map(String::from))
        .collect();
    ProcessController::spawn(FIXTURE, args, config())
        .await
        .expect("fixture should start")
}

#[tokio::test]
async fn starts_exchanges_events_and_stops() {
    let mut controller = start("child-event").await;
    assert_eq!(controller.state(), LifecycleState::Running);
    assert!(controller.process().and_then(|p| p.pid).is_some());

    let link = controller.link().unwrap().clone();
    let (tx, mut rx) = mpsc::unbounded_channel();
    link.subscribe("myChildEvent", move |data| {
        let _ = tx.send(data);
    });

    link.send("myMainEvent", json!({"some": "data"})).await.unwrap();
    let data = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(data, json!({"some": "child data", "args": ["1", "2", "3"]}));

    let outcome = stop_cooperatively(&mut controller).await;

    // Waiting again observes the same outcome.
    assert_eq!(controller.wait_for_completion().await.unwrap(), outcome);
}

#[tokio::test]
async fn request_reply_round_trip() {
    let mut controller = start("echo").await;
    let link = controller.link().unwrap().clone();

    let data = json!({"foo": "1760975325994::0.1234"});
    let reply = link.send_request("myApiCall", &data).await.unwrap();
    assert_eq!(reply, data);

    stop_cooperatively(&mut controller).await;
}

#[tokio::test]
async fn concurrent_requests_are_correlated() {
    let mut controller = start("echo").await;
    let link = controller.link().unwrap().clone();

    let payloads: Vec<_> = (0..10).map(|i| json!({"foo": format!("request-{i}")})).collect();
    let replies =
        futures::future::join_all(payloads.iter().map(|p| link.send_request("myApiCall", p)))
            .await;

    for (expected, reply) in payloads.iter().zip(replies) {
        assert_eq!(&reply.unwrap(), expected);
    }
    assert_eq!(link.pending_requests(), 0);

    stop_cooperatively(&mut controller).await;
}

#[tokio::test]
async fn remote_errors_become_messages() {
    let mut controller = start("errors").await;
    let link = controller.link().unwrap().clone();
    let data = json!({"foo": "bar"});

    let err = link
        .send_request("myApiCallErrorString", &data)
        .await
        .unwrap_err();
    assert_eq!(err.remote_message(), Some("something went wrong"));

    let err = link.send_request("myApiCallError", &data).await.unwrap_err();
    assert_eq!(err.remote_message(), Some("something went wrong"));

    stop_cooperatively(&mut controller).await;
}

#[tokio::test]
async fn second_start_is_rejected() {
    let mut controller = start("echo").await;
    let err = controller.start(FIXTURE, ["echo"]).await.unwrap_err();
    assert!(matches!(
        err,
        ControllerError::InvalidState {
            state: LifecycleState::Running,
            ..
        }
    ));
    assert_eq!(controller.state(), LifecycleState::Running);
    stop_cooperatively(&mut controller).await;
}

#[tokio::test]
async fn kill_closes_link_and_spends_controller() {
    let mut controller = start("echo").await;
    let link = controller.link().unwrap().clone();

    controller.kill_child().await.unwrap();
    assert_eq!(controller.state(), LifecycleState::Killed);
    assert!(controller.link().is_err());

    assert!(matches!(
        link.send("myApiCall", json!({})).await,
        Err(LinkError::Closed)
    ));
    assert!(matches!(
        link.send_request("myApiCall", json!({})).await,
        Err(RequestError::Link(LinkError::Closed))
    ));
    assert!(controller.stop_child().await.is_err());
    assert!(controller.kill_child().await.is_err());
    assert!(controller.start(FIXTURE, ["echo"]).await.is_err());

    // The echo child treats SIGTERM as a shutdown request, so only completion
    // is asserted here.
    tokio::time::timeout(WAIT, controller.wait_for_completion())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(controller.state(), LifecycleState::Killed);
}

#[tokio::test]
async fn silent_child_times_out_waiting_for_ready() {
    let mut controller =
        ProcessController::new(config().with_ready_timeout(Some(Duration::from_millis(300))));
    let err = controller.start(FIXTURE, ["silent"]).await.unwrap_err();
    assert!(matches!(err, ControllerError::ReadyTimeout(_)));
    assert_eq!(controller.state(), LifecycleState::Starting);

    controller.kill_child().await.unwrap();
    tokio::time::timeout(WAIT, controller.wait_for_completion())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn crash_before_ready_fails_start() {
    let mut controller = ProcessController::new(config());
    let err = controller.start(FIXTURE, ["crash"]).await.unwrap_err();
    match err {
        ControllerError::ExitedBeforeReady(Some(outcome)) => assert_eq!(outcome.code, Some(3)),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(controller.state(), LifecycleState::Terminated);
    assert!(controller.stop_child().await.is_err());
}

#[tokio::test]
async fn stop_and_wait_kills_a_child_that_ignores_stop() {
    let mut controller = start("ignore-stop").await;
    let outcome = controller
        .stop_and_wait(Duration::from_millis(300))
        .await
        .unwrap();
    assert!(!outcome.success());
    assert_eq!(controller.state(), LifecycleState::Killed);
}

#[tokio::test]
async fn exit_on_stop_policy_ends_the_child() {
    let mut controller = start("exit-on-stop").await;
    let outcome = stop_cooperatively(&mut controller).await;
    assert_eq!(outcome.code, Some(0));
}

#[tokio::test]
async fn stop_and_wait_returns_the_clean_exit() {
    let mut controller = start("echo").await;
    let outcome = controller.stop_and_wait(WAIT).await.unwrap();
    assert!(outcome.success(), "unexpected exit: {outcome}");
    assert_eq!(controller.state(), LifecycleState::Terminated);
}
