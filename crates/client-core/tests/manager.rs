//! Lifecycle tests for the peer connection manager, driven through the
//! relay channel seam so no server or network is involved. The "relay"
//! here is the test body reading `ClientEvent`s and injecting
//! `ServerEvent`s.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use televisit_client_core::{
    ClientError, ClientEvent, ClinicalIntegration, InMemoryClinical, JoinPolicy, JoinProgress,
    LocalMedia, MediaDevices, ParticipantRole, ParticipantSummary, PeerConnectionManager,
    PeerEvent, PeerSessionConfig, PeerState, RelayLink, SampleMediaDevices, ServerEvent,
    SessionDetails,
};
use tokio::sync::mpsc;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Device source that counts acquisitions, for asserting that a resumed
/// consent-gated join does not reacquire media.
struct CountingDevices {
    user_media_calls: AtomicUsize,
    deny: bool,
}

impl CountingDevices {
    fn granting() -> Arc<Self> {
        Arc::new(Self {
            user_media_calls: AtomicUsize::new(0),
            deny: false,
        })
    }

    fn denying() -> Arc<Self> {
        Arc::new(Self {
            user_media_calls: AtomicUsize::new(0),
            deny: true,
        })
    }

    fn calls(&self) -> usize {
        self.user_media_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for CountingDevices {
    async fn open_user_media(&self) -> Result<LocalMedia, ClientError> {
        self.user_media_calls.fetch_add(1, Ordering::SeqCst);
        if self.deny {
            return Err(ClientError::MediaAccess("permission denied".into()));
        }
        SampleMediaDevices.open_user_media().await
    }

    async fn open_display_media(&self) -> Result<Arc<TrackLocalStaticSample>, ClientError> {
        SampleMediaDevices.open_display_media().await
    }
}

struct Harness {
    manager: Arc<PeerConnectionManager>,
    devices: Arc<CountingDevices>,
    clinical: Arc<InMemoryClinical>,
    from_client: mpsc::UnboundedReceiver<ClientEvent>,
    to_client: mpsc::UnboundedSender<ServerEvent>,
}

fn harness(role: ParticipantRole, devices: Arc<CountingDevices>) -> Harness {
    let (client_tx, from_client) = mpsc::unbounded_channel();
    let (to_client, server_rx) = mpsc::unbounded_channel();
    let clinical = Arc::new(InMemoryClinical::new());
    let mut cfg = PeerSessionConfig::new("session-1", "user-1", role);
    cfg.join_ack_timeout = Duration::from_secs(5);
    let manager = PeerConnectionManager::new(
        cfg,
        JoinPolicy::for_role(role),
        Arc::clone(&clinical) as Arc<dyn ClinicalIntegration>,
        Arc::clone(&devices) as Arc<dyn MediaDevices>,
        RelayLink::new(client_tx, server_rx),
    );
    Harness {
        manager,
        devices,
        clinical,
        from_client,
        to_client,
    }
}

async fn expect_client_event(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for client event")
        .expect("client channel closed")
}

#[tokio::test]
async fn media_denial_leaves_the_machine_idle() {
    let h = harness(ParticipantRole::Therapist, CountingDevices::denying());
    let err = h.manager.initialize_local_media().await.unwrap_err();
    assert!(matches!(err, ClientError::MediaAccess(_)));
    assert_eq!(h.manager.state(), PeerState::Idle);

    // Joining without media is refused without touching the relay.
    let err = h.manager.join_session().await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidState(_)));
}

#[tokio::test]
async fn therapist_join_first_becomes_offerer() {
    let mut h = harness(ParticipantRole::Therapist, CountingDevices::granting());
    h.manager.initialize_local_media().await.unwrap();

    let manager = Arc::clone(&h.manager);
    let join = tokio::spawn(async move { manager.join_session().await });

    match expect_client_event(&mut h.from_client).await {
        ClientEvent::JoinSession { session_id, role } => {
            assert_eq!(session_id, "session-1");
            assert_eq!(role, ParticipantRole::Therapist);
        }
        other => panic!("expected join-session, got {other:?}"),
    }
    h.to_client
        .send(ServerEvent::SessionJoined {
            session_id: "session-1".into(),
            user_id: "user-1".into(),
            role: ParticipantRole::Therapist,
            participants: vec![],
        })
        .unwrap();

    match join.await.unwrap().unwrap() {
        JoinProgress::Joined {
            offerer,
            participants,
        } => {
            assert!(offerer);
            assert!(participants.is_empty());
        }
        other => panic!("expected joined, got {other:?}"),
    }
    assert_eq!(h.manager.state(), PeerState::Signaling);
    assert!(h.manager.is_offerer());
}

#[tokio::test]
async fn second_arrival_answers_instead_of_offering() {
    let mut h = harness(ParticipantRole::Therapist, CountingDevices::granting());
    h.manager.initialize_local_media().await.unwrap();

    let manager = Arc::clone(&h.manager);
    let join = tokio::spawn(async move { manager.join_session().await });

    expect_client_event(&mut h.from_client).await;
    h.to_client
        .send(ServerEvent::SessionJoined {
            session_id: "session-1".into(),
            user_id: "user-1".into(),
            role: ParticipantRole::Therapist,
            participants: vec![ParticipantSummary {
                id: "user-2".into(),
                role: ParticipantRole::Patient,
            }],
        })
        .unwrap();

    match join.await.unwrap().unwrap() {
        JoinProgress::Joined {
            offerer,
            participants,
        } => {
            assert!(!offerer);
            assert_eq!(participants[0].id, "user-2");
        }
        other => panic!("expected joined, got {other:?}"),
    }
    assert!(!h.manager.is_offerer());
}

#[tokio::test]
async fn join_times_out_back_to_idle_when_unacknowledged() {
    let h = harness(ParticipantRole::Therapist, CountingDevices::granting());
    h.manager.initialize_local_media().await.unwrap();

    let (client_tx, mut from_client) = mpsc::unbounded_channel();
    let (_to_client, server_rx) = mpsc::unbounded_channel();
    let mut cfg = PeerSessionConfig::new("session-1", "user-1", ParticipantRole::Therapist);
    cfg.join_ack_timeout = Duration::from_millis(100);
    let manager = PeerConnectionManager::new(
        cfg,
        JoinPolicy::Direct,
        Arc::clone(&h.clinical) as Arc<dyn ClinicalIntegration>,
        Arc::clone(&h.devices) as Arc<dyn MediaDevices>,
        RelayLink::new(client_tx, server_rx),
    );
    manager.initialize_local_media().await.unwrap();

    let err = manager.join_session().await.unwrap_err();
    assert!(matches!(err, ClientError::JoinTimeout));
    assert_eq!(manager.state(), PeerState::Idle);
    // The join request itself did go out.
    assert!(matches!(
        from_client.try_recv(),
        Ok(ClientEvent::JoinSession { .. })
    ));
}

#[tokio::test]
async fn relay_rejection_during_join_surfaces_and_resets() {
    let mut h = harness(ParticipantRole::Therapist, CountingDevices::granting());
    h.manager.initialize_local_media().await.unwrap();

    let manager = Arc::clone(&h.manager);
    let join = tokio::spawn(async move { manager.join_session().await });

    expect_client_event(&mut h.from_client).await;
    h.to_client
        .send(ServerEvent::Error {
            message: "already in a session".into(),
        })
        .unwrap();

    let err = join.await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::Relay(_)));
    assert_eq!(h.manager.state(), PeerState::Idle);
}

#[tokio::test]
async fn consent_gate_parks_the_join_and_resumes_without_reacquiring_media() {
    let mut h = harness(ParticipantRole::Patient, CountingDevices::granting());
    h.manager.initialize_local_media().await.unwrap();
    assert_eq!(h.devices.calls(), 1);

    // No consent on record: the join parks, nothing reaches the relay.
    match h.manager.join_session().await.unwrap() {
        JoinProgress::AwaitingConsent => {}
        other => panic!("expected consent gate, got {other:?}"),
    }
    assert_eq!(h.manager.state(), PeerState::AwaitingConsent);
    assert!(h.from_client.try_recv().is_err());

    // Resuming before consent exists is refused and stays parked.
    let err = h.manager.consent_recorded().await.unwrap_err();
    assert!(matches!(err, ClientError::Clinical(_)));
    assert_eq!(h.manager.state(), PeerState::AwaitingConsent);

    h.clinical
        .record_consent("session-1", "user-1", true)
        .await
        .unwrap();

    let manager = Arc::clone(&h.manager);
    let resume = tokio::spawn(async move { manager.consent_recorded().await });

    match expect_client_event(&mut h.from_client).await {
        ClientEvent::JoinSession { role, .. } => assert_eq!(role, ParticipantRole::Patient),
        other => panic!("expected join-session, got {other:?}"),
    }
    h.to_client
        .send(ServerEvent::SessionJoined {
            session_id: "session-1".into(),
            user_id: "user-1".into(),
            role: ParticipantRole::Patient,
            participants: vec![],
        })
        .unwrap();

    assert!(matches!(
        resume.await.unwrap().unwrap(),
        JoinProgress::Joined { .. }
    ));
    // Media from the original attempt was reused.
    assert_eq!(h.devices.calls(), 1);
}

#[tokio::test]
async fn toggles_are_local_and_never_signal() {
    let mut h = harness(ParticipantRole::Therapist, CountingDevices::granting());
    h.manager.initialize_local_media().await.unwrap();

    assert!(!h.manager.toggle_video().await.unwrap());
    assert!(h.manager.toggle_video().await.unwrap());
    assert!(!h.manager.toggle_audio().await.unwrap());

    assert!(h.from_client.try_recv().is_err());
}

#[tokio::test]
async fn leave_is_idempotent_from_any_state() {
    let mut h = harness(ParticipantRole::Therapist, CountingDevices::granting());

    // Never joined: no leave-session goes out, state still closes.
    h.manager.leave_session().await.unwrap();
    assert_eq!(h.manager.state(), PeerState::Closed);
    assert!(h.from_client.try_recv().is_err());
    h.manager.leave_session().await.unwrap();
    assert_eq!(h.manager.state(), PeerState::Closed);
}

#[tokio::test]
async fn leave_after_join_notifies_the_relay_and_releases_media() {
    let mut h = harness(ParticipantRole::Therapist, CountingDevices::granting());
    h.manager.initialize_local_media().await.unwrap();

    let manager = Arc::clone(&h.manager);
    let join = tokio::spawn(async move { manager.join_session().await });
    expect_client_event(&mut h.from_client).await;
    h.to_client
        .send(ServerEvent::SessionJoined {
            session_id: "session-1".into(),
            user_id: "user-1".into(),
            role: ParticipantRole::Therapist,
            participants: vec![],
        })
        .unwrap();
    join.await.unwrap().unwrap();

    h.manager.leave_session().await.unwrap();
    assert_eq!(h.manager.state(), PeerState::Closed);
    match expect_client_event(&mut h.from_client).await {
        ClientEvent::LeaveSession => {}
        other => panic!("expected leave-session, got {other:?}"),
    }
    // Media is gone, so media-dependent calls now refuse.
    assert!(matches!(
        h.manager.toggle_audio().await.unwrap_err(),
        ClientError::InvalidState(_)
    ));
}

#[tokio::test]
async fn leave_during_join_wait_cancels_the_join() {
    let mut h = harness(ParticipantRole::Therapist, CountingDevices::granting());
    h.manager.initialize_local_media().await.unwrap();

    let manager = Arc::clone(&h.manager);
    let join = tokio::spawn(async move { manager.join_session().await });
    // The join request is out; the acknowledgment has not arrived yet.
    match expect_client_event(&mut h.from_client).await {
        ClientEvent::JoinSession { .. } => {}
        other => panic!("expected join-session, got {other:?}"),
    }

    h.manager.leave_session().await.unwrap();
    assert_eq!(h.manager.state(), PeerState::Closed);

    // The acknowledgment lands after the user already left: the leave
    // wins, and the membership the join created is rolled back.
    h.to_client
        .send(ServerEvent::SessionJoined {
            session_id: "session-1".into(),
            user_id: "user-1".into(),
            role: ParticipantRole::Therapist,
            participants: vec![],
        })
        .unwrap();

    let err = join.await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::InvalidState(_)));
    assert_eq!(h.manager.state(), PeerState::Closed);
    match expect_client_event(&mut h.from_client).await {
        ClientEvent::LeaveSession => {}
        other => panic!("expected leave-session rollback, got {other:?}"),
    }
    assert!(h.from_client.try_recv().is_err());
}

#[tokio::test]
async fn transport_failure_retries_with_restarted_offers_then_terminates() {
    let devices = CountingDevices::granting();
    let clinical = Arc::new(InMemoryClinical::new());
    let (client_tx, mut from_client) = mpsc::unbounded_channel();
    let (to_client, server_rx) = mpsc::unbounded_channel();
    let mut cfg = PeerSessionConfig::new("session-1", "user-1", ParticipantRole::Therapist);
    cfg.backoff_base = Duration::from_millis(5);
    cfg.backoff_cap = Duration::from_millis(10);
    let manager = PeerConnectionManager::new(
        cfg,
        JoinPolicy::Direct,
        clinical as Arc<dyn ClinicalIntegration>,
        devices as Arc<dyn MediaDevices>,
        RelayLink::new(client_tx, server_rx),
    );
    manager.initialize_local_media().await.unwrap();
    let mut events = manager.events();
    let mut states = manager.state_changes();

    let joining = Arc::clone(&manager);
    let join = tokio::spawn(async move { joining.join_session().await });
    expect_client_event(&mut from_client).await;
    to_client
        .send(ServerEvent::SessionJoined {
            session_id: "session-1".into(),
            user_id: "user-1".into(),
            role: ParticipantRole::Therapist,
            participants: vec![],
        })
        .unwrap();
    join.await.unwrap().unwrap();

    // Peer arrives; the offerer opens negotiation.
    to_client
        .send(ServerEvent::ParticipantJoined {
            user_id: "user-2".into(),
            role: ParticipantRole::Patient,
        })
        .unwrap();
    match expect_client_event(&mut from_client).await {
        ClientEvent::Offer { target_user_id, .. } => assert_eq!(target_user_id, "user-2"),
        other => panic!("expected offer, got {other:?}"),
    }

    // Three transport failures each back off and re-offer with a
    // restarted negotiation.
    for _ in 0..3 {
        manager
            .notify_transport_state(RTCPeerConnectionState::Failed)
            .await
            .unwrap();
        states
            .wait_for(|s| *s == PeerState::Reconnecting)
            .await
            .unwrap();
        match expect_client_event(&mut from_client).await {
            ClientEvent::Offer { target_user_id, .. } => assert_eq!(target_user_id, "user-2"),
            other => panic!("expected restarted offer, got {other:?}"),
        }
    }

    // The fourth failure exhausts the budget: terminal Failed, no
    // further offers, and a terminated notification on the event bus.
    manager
        .notify_transport_state(RTCPeerConnectionState::Failed)
        .await
        .unwrap();
    states
        .wait_for(|s| *s == PeerState::Failed)
        .await
        .unwrap();
    assert!(from_client.try_recv().is_err());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("timed out waiting for terminated event")
            .expect("event bus closed");
        if let PeerEvent::Terminated { .. } = event {
            break;
        }
    }
}

#[tokio::test]
async fn complete_session_passes_through_to_the_clinical_integration() {
    let h = harness(ParticipantRole::Therapist, CountingDevices::granting());
    h.clinical
        .insert_session(SessionDetails {
            session_id: "session-1".into(),
            appointment_id: None,
            therapist_id: "user-1".into(),
            patient_id: "user-2".into(),
            scheduled_at: None,
            completed: false,
        })
        .await;

    assert!(h.manager.complete_session(Some("notes")).await.unwrap());
    assert!(
        h.clinical
            .get_session_details("session-1")
            .await
            .unwrap()
            .completed
    );
}
