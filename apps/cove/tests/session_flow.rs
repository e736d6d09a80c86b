mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Party, connected_pair, is_capability};
use cove_core::config::SessionConfig;
use cove_core::peer::{ChannelState, ConnectionState, LoopbackNetwork};
use cove_core::protocol::{ParticipantRole, SessionState};
use cove_core::session::{
    CallState, SessionContext, SessionError, SessionEvent, SessionOrchestrator,
};
use cove_core::signaling::{EndReason, MemoryRelay};
use tokio::sync::mpsc;

#[test_timeout::session_test(timeout = 30, paused)]
async fn host_says_hi_and_guest_acknowledges() {
    let (_relay, _network, mut host, mut guest) = connected_pair("say-hi").await;

    let sent = host.handle.send_text("hi").await.unwrap();
    assert_eq!(sent.role, ParticipantRole::Host);

    let SessionEvent::MessageReceived(received) = guest
        .wait_for(|event| matches!(event, SessionEvent::MessageReceived(_)))
        .await
    else {
        unreachable!()
    };
    assert_eq!(received.content, "hi");
    assert_eq!(received.participant_id, "host-1");

    host.wait_for(|event| {
        matches!(event, SessionEvent::Delivered { message_id } if *message_id == sent.message_id)
    })
    .await;
    let snapshot = host.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.awaiting_ack, 0);
    assert_eq!(snapshot.messages.len(), 1);

    let guest_view = guest.handle.snapshot().await.unwrap();
    assert_eq!(guest_view.messages, vec![received]);
}

#[test_timeout::session_test(timeout = 30, paused)]
async fn transcript_is_ordered_by_creation_time() {
    let (_relay, _network, mut host, mut guest) = connected_pair("ordering").await;

    host.handle.send_text("one").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    guest.handle.send_text("two").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    host.handle.send_text("three").await.unwrap();

    for _ in 0..2 {
        guest
            .wait_for(|event| matches!(event, SessionEvent::MessageReceived(_)))
            .await;
    }
    host.wait_for(|event| matches!(event, SessionEvent::MessageReceived(_)))
        .await;

    let contents = |messages: Vec<cove_core::protocol::Message>| {
        messages
            .into_iter()
            .map(|message| message.content)
            .collect::<Vec<_>>()
    };
    let host_view = host.handle.snapshot().await.unwrap();
    let guest_view = guest.handle.snapshot().await.unwrap();
    assert_eq!(contents(host_view.messages.clone()), vec!["one", "two", "three"]);
    assert_eq!(contents(guest_view.messages), contents(host_view.messages));
}

#[test_timeout::session_test(timeout = 30, paused)]
async fn author_deletes_propagate_as_tombstones() {
    let (_relay, _network, mut host, mut guest) = connected_pair("deletes").await;

    let sent = host.handle.send_text("regrettable").await.unwrap();
    guest
        .wait_for(|event| matches!(event, SessionEvent::MessageReceived(_)))
        .await;

    assert_eq!(
        guest.handle.delete_message(sent.message_id.clone()).await,
        Err(SessionError::NotAuthor)
    );
    assert_eq!(
        host.handle.delete_message("missing").await,
        Err(SessionError::UnknownMessage("missing".into()))
    );

    host.handle
        .delete_message(sent.message_id.clone())
        .await
        .unwrap();
    let deleted = guest
        .wait_for(|event| matches!(event, SessionEvent::MessageDeleted { .. }))
        .await;
    assert_eq!(
        deleted,
        SessionEvent::MessageDeleted {
            message_id: sent.message_id.clone()
        }
    );

    let guest_view = guest.handle.snapshot().await.unwrap();
    assert!(guest_view.messages.is_empty());
    let host_view = host.handle.snapshot().await.unwrap();
    assert!(host_view.messages.is_empty());

    // Deleting twice is a no-op.
    host.handle.delete_message(sent.message_id).await.unwrap();
}

#[test_timeout::session_test(timeout = 30, paused)]
async fn guest_call_is_accepted_and_hung_up() {
    let (_relay, network, mut host, mut guest) = connected_pair("calls").await;

    assert_eq!(
        guest.handle.request_call().await.unwrap(),
        CallState::Requesting
    );
    host.wait_for(|event| *event == SessionEvent::CallState(CallState::Incoming))
        .await;
    assert_eq!(
        host.handle.accept_call().await.unwrap(),
        CallState::Connecting
    );

    host.wait_for(|event| *event == SessionEvent::CallState(CallState::Active))
        .await;
    guest
        .wait_for(|event| *event == SessionEvent::CallState(CallState::Active))
        .await;
    let host_peer = network.latest("host").unwrap();
    assert!(host_peer.media_attached());
    assert_eq!(host_peer.offers_created(), 2);
    assert!(network.latest("guest").unwrap().media_attached());
    assert_eq!(network.created("host"), 1);

    host.handle.end_call().await.unwrap();
    guest
        .wait_for(|event| *event == SessionEvent::CallState(CallState::Idle))
        .await;
    assert!(!host_peer.media_attached());
    assert!(!network.latest("guest").unwrap().media_attached());

    // The message channel survived the renegotiation.
    host.handle.send_text("still here").await.unwrap();
    guest
        .wait_for(|event| matches!(event, SessionEvent::MessageReceived(_)))
        .await;
}

#[test_timeout::session_test(timeout = 30, paused)]
async fn busy_and_invalid_call_actions() {
    let (_relay, _network, mut host, mut guest) = connected_pair("busy").await;

    assert_eq!(
        host.handle.accept_call().await,
        Err(SessionError::InvalidCallAction {
            state: CallState::Idle,
            action: cove_core::protocol::CallAction::Accept
        })
    );

    host.handle.request_call().await.unwrap();
    guest
        .wait_for(|event| *event == SessionEvent::CallState(CallState::Incoming))
        .await;
    guest.handle.reject_call().await.unwrap();
    host.wait_for(|event| *event == SessionEvent::CallState(CallState::Idle))
        .await;
}

#[test_timeout::session_test(timeout = 60, paused)]
async fn guest_rebuilds_its_link_after_failure() {
    let (_relay, network, mut host, mut guest) = connected_pair("self-heal").await;
    let first_host_link = network.latest("host").unwrap();

    network.latest("guest").unwrap().sever();
    guest
        .wait_for(|event| matches!(event, SessionEvent::LinkRecreated { .. }))
        .await;
    host.wait_for(is_capability).await;
    guest.wait_for(is_capability).await;

    assert_eq!(network.created("guest"), 2);
    assert_eq!(network.created("host"), 2);
    assert_eq!(first_host_link.ice_restarts(), 0);
    assert!(first_host_link.is_closed());

    host.handle.send_text("back again").await.unwrap();
    let SessionEvent::MessageReceived(received) = guest
        .wait_for(|event| matches!(event, SessionEvent::MessageReceived(_)))
        .await
    else {
        unreachable!()
    };
    assert_eq!(received.content, "back again");
}

#[test_timeout::session_test(timeout = 30, paused)]
async fn host_restarts_ice_while_the_channel_survives() {
    let (_relay, network, mut host, mut guest) = connected_pair("ice-restart").await;
    let host_link = network.latest("host").unwrap();

    host_link.inject_connection_state(ConnectionState::Failed);
    host.wait_for(|event| *event == SessionEvent::Connection(ConnectionState::Failed))
        .await;
    host.wait_for(|event| *event == SessionEvent::Connection(ConnectionState::Connected))
        .await;

    assert_eq!(host_link.ice_restarts(), 1);
    assert_eq!(host_link.offers_created(), 2);
    assert_eq!(network.created("host"), 1);
    assert_eq!(network.created("guest"), 1);
    let snapshot = host.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.link_generation, 1);
    assert_eq!(
        snapshot.link.map(|link| link.channel),
        Some(ChannelState::Open)
    );

    host.handle.send_text("after restart").await.unwrap();
    let SessionEvent::MessageReceived(received) = guest
        .wait_for(|event| matches!(event, SessionEvent::MessageReceived(_)))
        .await
    else {
        unreachable!()
    };
    assert_eq!(received.content, "after restart");
}

#[test_timeout::session_test(timeout = 60, paused)]
async fn guest_only_heals_while_session_is_active() {
    let (relay, network, mut host, mut guest) = connected_pair("inactive").await;

    relay.set_status("inactive", SessionState::Issued);
    guest
        .wait_for(|event| {
            matches!(event, SessionEvent::Status(status) if status.status == SessionState::Issued)
        })
        .await;
    host.wait_for(|event| {
        matches!(event, SessionEvent::Status(status) if status.status == SessionState::Issued)
    })
    .await;

    network.latest("guest").unwrap().sever();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(network.created("guest"), 1);
    assert_eq!(network.created("host"), 1);
    assert!(
        !guest
            .drain()
            .iter()
            .any(|event| matches!(event, SessionEvent::LinkRecreated { .. }))
    );

    relay.set_status("inactive", SessionState::Active);
    host.wait_for(is_capability).await;
    guest.wait_for(is_capability).await;
    assert_eq!(network.created("guest"), 2);
    assert!(network.latest("guest").unwrap().is_connected());
}

#[test_timeout::session_test(timeout = 30, paused)]
async fn relay_lifecycle_frame_ends_both_sessions() {
    let (relay, network, mut host, mut guest) = connected_pair("expiry").await;

    relay.end("expiry", SessionState::Expired);
    for party in [&mut host, &mut guest] {
        let ended = party
            .wait_for(|event| matches!(event, SessionEvent::Error(_)))
            .await;
        assert_eq!(
            ended,
            SessionEvent::Error(SessionError::SessionEnded {
                reason: EndReason::Expired
            })
        );
        party.wait_for(|event| *event == SessionEvent::Closed).await;
    }

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(relay.dial_count("host-1"), 1);
    assert_eq!(relay.dial_count("guest-1"), 1);
    assert!(network.latest("host").unwrap().is_closed());

    let snapshot = host.handle.snapshot().await.unwrap();
    assert!(snapshot.ended);
    assert_eq!(snapshot.pending_timers, 0);
    assert_eq!(
        host.handle.send_text("anyone?").await,
        Err(SessionError::Closed)
    );
}

#[test_timeout::session_test(timeout = 30, paused)]
async fn unknown_token_is_rejected_without_retry() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let (tx, mut events) = mpsc::unbounded_channel();
    let (handle, _task) = SessionOrchestrator::spawn(
        SessionContext::new("no-such-token", "stranger", ParticipantRole::Guest),
        SessionConfig::default(),
        Arc::new(relay.clone()),
        Arc::new(network.factory("guest")),
        tx,
    );

    let mut saw_rejection = false;
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Error(SessionError::SessionEnded {
                reason: EndReason::Rejected,
            }) => saw_rejection = true,
            SessionEvent::Closed => break,
            _ => {}
        }
    }
    assert!(saw_rejection);
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(relay.dial_count("stranger"), 1);
    handle.end().await;
}

#[test_timeout::session_test(timeout = 30, paused)]
async fn teardown_is_idempotent_from_any_handle() {
    let (_relay, network, mut host, _guest) = connected_pair("teardown").await;
    let second = host.handle.clone();

    tokio::join!(host.handle.end(), second.end());
    host.handle.end().await;

    let closed = host
        .drain()
        .into_iter()
        .filter(|event| *event == SessionEvent::Closed)
        .count();
    assert_eq!(closed, 1);
    let snapshot = second.snapshot().await.unwrap();
    assert!(snapshot.ended);
    assert_eq!(snapshot.pending_timers, 0);
    assert!(snapshot.link.is_none());
    assert!(network.latest("host").unwrap().is_closed());
}

#[test_timeout::session_test(timeout = 30, paused)]
async fn messages_over_the_limit_are_refused() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    relay.issue_with_limit("short", 8);
    let mut host = Party::join(&relay, &network, "short", "host-1", SessionConfig::default());
    let _guest = Party::join(&relay, &network, "short", "guest-1", SessionConfig::default());
    host.wait_for(is_capability).await;

    assert_eq!(
        host.handle.send_text("far too long").await,
        Err(SessionError::MessageTooLong {
            limit: 8,
            length: 12
        })
    );
    assert!(
        !network
            .latest("host")
            .unwrap()
            .sent_messages()
            .iter()
            .any(|text| text.contains("\"type\":\"message\""))
    );
    assert!(host.handle.send_text("ok").await.is_ok());
    let snapshot = host.handle.snapshot().await.unwrap();
    assert_eq!(
        snapshot.link.map(|link| link.channel),
        Some(ChannelState::Open)
    );
}
