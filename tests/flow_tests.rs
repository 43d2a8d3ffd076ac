//! Tests for the join-and-open-channel flow: token exchange, channel
//! lifecycle, message delivery, cancellation and timeouts.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use hangout_cards::error::WidgetError;
use hangout_cards::flow::{FlowSettings, FlowState, JoinFlow};
use hangout_cards::memory_host::MemoryHost;

struct Rig {
    flow: Arc<JoinFlow<ScriptedJoin, PeerOpener>>,
    join: ScriptedJoin,
    opener: PeerOpener,
    renderer: Arc<RecordingRenderer>,
    observer: Arc<RecordingObserver>,
}

fn rig_with(host: MemoryHost, reply: Reply, settings: FlowSettings) -> Rig {
    let join = ScriptedJoin::new(reply);
    let opener = PeerOpener::default();
    let renderer = Arc::new(RecordingRenderer::default());
    let observer = Arc::new(RecordingObserver::default());
    let flow = JoinFlow::new(join.clone(), opener.clone(), Arc::new(host), renderer.clone())
        .with_observer(observer.clone())
        .with_settings(settings);
    Rig {
        flow: Arc::new(flow),
        join,
        opener,
        renderer,
        observer,
    }
}

fn rig(reply: Reply) -> Rig {
    rig_with(host_with_local_player(), reply, FlowSettings::default())
}

fn spawn_run(
    flow: &Arc<JoinFlow<ScriptedJoin, PeerOpener>>,
) -> tokio::task::JoinHandle<Result<(), WidgetError>> {
    let flow = Arc::clone(flow);
    tokio::spawn(async move { flow.run().await })
}

// ---------------------------------------------------------------------------
// Token exchange
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_token_opens_channel_with_exact_token() {
    let rig = rig(Reply::Token("abc123"));
    let handle = rig.flow.handle();
    let _task = spawn_run(&rig.flow);

    assert_eq!(handle.wait_for(FlowState::ChannelOpening).await, FlowState::ChannelOpening);
    assert_eq!(rig.opener.tokens(), vec!["abc123".to_string()]);
}

#[tokio::test]
async fn test_join_request_carries_session_and_person_id() {
    let rig = rig(Reply::Token("abc123"));
    let handle = rig.flow.handle();
    let _task = spawn_run(&rig.flow);
    handle.wait_for(FlowState::ChannelOpening).await;

    let calls = rig.join.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].session_id, "hangout-1");
    assert_eq!(calls[0].participant_id, "plus-1");

    let (request, response) = handle.joined().expect("token was issued");
    assert_eq!(request, calls[0]);
    assert_eq!(response.channel_token.as_str(), "abc123");
}

#[tokio::test]
async fn test_http_error_fails_without_opening_channel() {
    let rig = rig(Reply::Status(500));
    let err = rig.flow.run().await.unwrap_err();

    assert!(err.is_join_failure(), "got {err}");
    assert!(matches!(err, WidgetError::JoinStatus { status: 500, .. }));
    assert_eq!(rig.flow.state(), FlowState::Failed);
    assert!(rig.opener.tokens().is_empty());
    assert_eq!(
        rig.observer.states(),
        vec![FlowState::TokenRequested, FlowState::Failed]
    );
    assert_eq!(rig.observer.failures.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unresolved_identity_sends_no_request() {
    // Session exists but nobody is marked as local.
    let host = MemoryHost::new("hangout-1");
    host.add_person("plus-1", "Bob");
    let rig = rig_with(host, Reply::Token("abc123"), FlowSettings::default());

    let err = rig.flow.run().await.unwrap_err();
    assert!(matches!(err, WidgetError::IdentityResolution { .. }));
    assert_eq!(rig.join.call_count(), 0);
    assert_eq!(rig.flow.state(), FlowState::Failed);
    assert!(rig.opener.tokens().is_empty());
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let rig = rig(Reply::Status(503));
    assert!(rig.flow.run().await.is_err());
    assert!(rig.flow.run().await.is_ok());
    assert_eq!(rig.join.call_count(), 1);
    assert_eq!(rig.flow.state(), FlowState::Failed);
}

// ---------------------------------------------------------------------------
// Channel lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_open_message_close_sequence() {
    let rig = rig(Reply::Token("abc123"));
    let handle = rig.flow.handle();
    let task = spawn_run(&rig.flow);
    handle.wait_for(FlowState::ChannelOpening).await;

    let peer = rig.opener.take_peer();
    peer.open();
    assert_eq!(handle.wait_for(FlowState::ChannelOpen).await, FlowState::ChannelOpen);

    peer.message(r#"{"content":"Bob played King of Snark"}"#);
    peer.close();

    task.await.unwrap().unwrap();
    assert_eq!(rig.renderer.messages(), vec!["Bob played King of Snark".to_string()]);
    assert_eq!(handle.state(), FlowState::Closed);
    assert_eq!(
        rig.observer.states(),
        vec![
            FlowState::TokenRequested,
            FlowState::ChannelOpening,
            FlowState::ChannelOpen,
            FlowState::Closed,
        ]
    );
}

#[tokio::test]
async fn test_invalid_payload_is_discarded_and_channel_stays_open() {
    let rig = rig(Reply::Token("abc123"));
    let handle = rig.flow.handle();
    let _task = spawn_run(&rig.flow);
    handle.wait_for(FlowState::ChannelOpening).await;

    let peer = rig.opener.take_peer();
    peer.open();
    peer.message("not-json");
    peer.message(r#"{"content":"still here"}"#);

    let renderer = Arc::clone(&rig.renderer);
    eventually("valid message", move || !renderer.messages().is_empty()).await;

    assert_eq!(rig.renderer.messages(), vec!["still here".to_string()]);
    assert_eq!(rig.observer.discarded.load(Ordering::SeqCst), 1);
    assert_eq!(handle.state(), FlowState::ChannelOpen);
}

#[tokio::test]
async fn test_message_before_open_is_still_rendered() {
    let rig = rig(Reply::Token("abc123"));
    let handle = rig.flow.handle();
    let _task = spawn_run(&rig.flow);
    handle.wait_for(FlowState::ChannelOpening).await;

    let peer = rig.opener.take_peer();
    peer.message(r#"{"content":"early"}"#);

    let renderer = Arc::clone(&rig.renderer);
    eventually("early message", move || !renderer.messages().is_empty()).await;
    assert_eq!(handle.state(), FlowState::ChannelOpening);
}

#[tokio::test]
async fn test_channel_error_fails_flow() {
    let rig = rig(Reply::Token("abc123"));
    let handle = rig.flow.handle();
    let task = spawn_run(&rig.flow);
    handle.wait_for(FlowState::ChannelOpening).await;

    let peer = rig.opener.take_peer();
    peer.open();
    handle.wait_for(FlowState::ChannelOpen).await;
    peer.error("socket reset");

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, WidgetError::Channel { ref detail } if detail == "socket reset"));
    assert_eq!(handle.state(), FlowState::Failed);
    assert!(matches!(handle.send("x"), Err(WidgetError::ChannelClosed)));
}

#[tokio::test]
async fn test_transport_dropped_counts_as_close() {
    let rig = rig(Reply::Token("abc123"));
    let handle = rig.flow.handle();
    let task = spawn_run(&rig.flow);
    handle.wait_for(FlowState::ChannelOpening).await;

    drop(rig.opener.take_peer());
    task.await.unwrap().unwrap();
    assert_eq!(handle.state(), FlowState::Closed);
}

#[tokio::test]
async fn test_send_reaches_transport_only_while_open() {
    let rig = rig(Reply::Token("abc123"));
    let handle = rig.flow.handle();
    let _task = spawn_run(&rig.flow);
    handle.wait_for(FlowState::ChannelOpening).await;

    let mut peer = rig.opener.take_peer();
    assert!(matches!(handle.send("too early"), Err(WidgetError::ChannelClosed)));

    peer.open();
    handle.wait_for(FlowState::ChannelOpen).await;
    handle.send("hello table").unwrap();
    assert_eq!(peer.recv_outbound().await.as_deref(), Some("hello table"));
}

// ---------------------------------------------------------------------------
// Cancellation and timeouts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cancel_during_token_request() {
    let rig = rig(Reply::Hang);
    let handle = rig.flow.handle();
    let task = spawn_run(&rig.flow);
    handle.wait_for(FlowState::TokenRequested).await;

    handle.cancel();
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, WidgetError::Cancelled { stage: "token request" }));
    assert_eq!(handle.state(), FlowState::Failed);
    assert!(rig.opener.tokens().is_empty());
}

#[tokio::test]
async fn test_cancel_after_open_closes_locally() {
    let rig = rig(Reply::Token("abc123"));
    let handle = rig.flow.handle();
    let task = spawn_run(&rig.flow);
    handle.wait_for(FlowState::ChannelOpening).await;

    let peer = rig.opener.take_peer();
    peer.open();
    handle.wait_for(FlowState::ChannelOpen).await;

    handle.cancel();
    task.await.unwrap().unwrap();
    assert_eq!(handle.state(), FlowState::Closed);
    assert!(handle.send("late").is_err());
}

#[tokio::test]
async fn test_join_timeout_fails_flow() {
    let settings = FlowSettings {
        join_timeout: Some(Duration::from_millis(50)),
        open_timeout: None,
    };
    let rig = rig_with(host_with_local_player(), Reply::Hang, settings);

    let err = rig.flow.run().await.unwrap_err();
    assert!(matches!(
        err,
        WidgetError::Timeout { stage: "token request", after } if after == Duration::from_millis(50)
    ));
    assert_eq!(rig.flow.state(), FlowState::Failed);
}

#[tokio::test]
async fn test_open_timeout_reports_configured_limit() {
    let settings = FlowSettings {
        join_timeout: None,
        open_timeout: Some(Duration::from_millis(50)),
    };
    let rig = rig_with(host_with_local_player(), Reply::Token("abc123"), settings);

    // The peer stays parked in the opener and never reports `open`.
    let err = rig.flow.run().await.unwrap_err();
    assert!(matches!(
        err,
        WidgetError::Timeout { stage: "channel open", after } if after == Duration::from_millis(50)
    ));
    assert_eq!(rig.flow.state(), FlowState::Failed);
}
