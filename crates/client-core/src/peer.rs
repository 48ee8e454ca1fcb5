//! Connection lifecycle for one participant in one session.
//!
//! The manager owns the local media, the RTCPeerConnection, and the
//! relay channel pair, and drives the whole join/negotiate/monitor/
//! reconnect lifecycle. Callers observe it through a [`watch`] channel
//! of [`PeerState`] and a [`broadcast`] stream of [`PeerEvent`]s.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use signal_proto::{
    ClientEvent, IceCandidatePayload, ParticipantRole, ParticipantSummary, QualityLevel,
    QualityMetrics, ServerEvent,
};
use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::clinical::ClinicalIntegration;
use crate::error::ClientError;
use crate::media::{LocalMedia, MediaDevices};
use crate::monitor::{spawn_monitor, RtcStatsProbe};
use crate::signaling::RelayLink;

/// Lifecycle of a managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    AcquiringMedia,
    /// Patient join held until consent is on record.
    AwaitingConsent,
    CreatingConnection,
    Signaling,
    Connected,
    Reconnecting,
    /// Negotiation retries exhausted. Terminal until a fresh join.
    Failed,
    Closed,
}

/// Everything observable about the session, delivered over a broadcast
/// channel. Slow subscribers may miss events; the state watch channel
/// never does.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    State(PeerState),
    RemoteTrack {
        kind: String,
    },
    AudioToggled {
        enabled: bool,
    },
    VideoToggled {
        enabled: bool,
    },
    ScreenShareStarted,
    ScreenShareStopped,
    ParticipantJoined {
        user_id: String,
        role: ParticipantRole,
    },
    ParticipantLeft {
        user_id: String,
    },
    /// The other participant's self-reported quality.
    RemoteQuality {
        user_id: String,
        level: QualityLevel,
        metrics: Option<QualityMetrics>,
    },
    /// Our own measured quality, mirrored from what we report upstream.
    LocalQuality {
        level: QualityLevel,
        metrics: Option<QualityMetrics>,
    },
    RelayError {
        message: String,
    },
    /// The connection is gone for good; a fresh join is required.
    Terminated {
        reason: String,
    },
}

/// Whether joining requires patient consent on record first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPolicy {
    Direct,
    ConsentGated,
}

impl JoinPolicy {
    /// Patients are consent-gated; therapists join directly.
    pub fn for_role(role: ParticipantRole) -> Self {
        match role {
            ParticipantRole::Therapist => JoinPolicy::Direct,
            ParticipantRole::Patient => JoinPolicy::ConsentGated,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerSessionConfig {
    pub session_id: String,
    pub user_id: String,
    pub role: ParticipantRole,
    pub ice_servers: Vec<RTCIceServer>,
    pub join_ack_timeout: Duration,
    pub monitor_interval: Duration,
    /// Reconnect attempts after a transport failure before giving up.
    pub max_reconnect_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl PeerSessionConfig {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        role: ParticipantRole,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            role,
            ice_servers: vec![RTCIceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_owned()],
                ..Default::default()
            }],
            join_ack_timeout: Duration::from_secs(10),
            monitor_interval: Duration::from_secs(3),
            max_reconnect_attempts: 3,
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(8),
        }
    }
}

/// Outcome of a join attempt.
#[derive(Debug)]
pub enum JoinProgress {
    /// Consent is not yet on record. Media stays acquired; call
    /// [`PeerConnectionManager::consent_recorded`] to resume.
    AwaitingConsent,
    Joined {
        /// First into the room creates offers; later arrivals answer.
        offerer: bool,
        participants: Vec<ParticipantSummary>,
    },
}

struct LiveConnection {
    pc: Arc<RTCPeerConnection>,
    video_sender: Arc<RTCRtpSender>,
    transport: mpsc::UnboundedSender<RTCPeerConnectionState>,
    pump: JoinHandle<()>,
}

pub struct PeerConnectionManager {
    cfg: PeerSessionConfig,
    policy: JoinPolicy,
    clinical: Arc<dyn ClinicalIntegration>,
    devices: Arc<dyn MediaDevices>,
    relay_tx: mpsc::UnboundedSender<ClientEvent>,
    relay_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,
    state_tx: watch::Sender<PeerState>,
    events: broadcast::Sender<PeerEvent>,
    media: AsyncMutex<Option<Arc<LocalMedia>>>,
    screen: AsyncMutex<Option<Arc<TrackLocalStaticSample>>>,
    conn: AsyncMutex<Option<LiveConnection>>,
    monitor: std::sync::Mutex<Option<JoinHandle<()>>>,
    retry_timer: std::sync::Mutex<Option<JoinHandle<()>>>,
    // Shared with the on_ice_candidate callback, which cannot await.
    remote_user: Arc<std::sync::Mutex<Option<String>>>,
    pending_out: Arc<std::sync::Mutex<Vec<IceCandidatePayload>>>,
    pending_in: AsyncMutex<Vec<IceCandidatePayload>>,
    offerer: AtomicBool,
    attempts: AtomicU32,
    // Bumped by leave_session; an in-flight join commits only if the
    // epoch it started under is still current.
    join_epoch: AtomicU64,
}

impl PeerConnectionManager {
    pub fn new(
        cfg: PeerSessionConfig,
        policy: JoinPolicy,
        clinical: Arc<dyn ClinicalIntegration>,
        devices: Arc<dyn MediaDevices>,
        link: RelayLink,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(PeerState::Idle);
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            cfg,
            policy,
            clinical,
            devices,
            relay_tx: link.tx,
            relay_rx: AsyncMutex::new(Some(link.rx)),
            state_tx,
            events,
            media: AsyncMutex::new(None),
            screen: AsyncMutex::new(None),
            conn: AsyncMutex::new(None),
            monitor: std::sync::Mutex::new(None),
            retry_timer: std::sync::Mutex::new(None),
            remote_user: Arc::new(std::sync::Mutex::new(None)),
            pending_out: Arc::new(std::sync::Mutex::new(Vec::new())),
            pending_in: AsyncMutex::new(Vec::new()),
            offerer: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            join_epoch: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> PeerState {
        *self.state_tx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<PeerState> {
        self.state_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    pub fn is_offerer(&self) -> bool {
        self.offerer.load(Ordering::SeqCst)
    }

    /// Acquire camera and microphone. Denial leaves the machine in
    /// `Idle`; nothing is retried automatically.
    pub async fn initialize_local_media(&self) -> Result<(), ClientError> {
        self.set_state(PeerState::AcquiringMedia);
        match self.devices.open_user_media().await {
            Ok(media) => {
                *self.media.lock().await = Some(Arc::new(media));
                Ok(())
            }
            Err(err) => {
                self.set_state(PeerState::Idle);
                Err(err)
            }
        }
    }

    /// Join the configured session. Requires local media. A
    /// consent-gated join without consent on record parks the machine
    /// in `AwaitingConsent` without touching the relay.
    pub async fn join_session(self: &Arc<Self>) -> Result<JoinProgress, ClientError> {
        self.release_connection().await;
        if self.media.lock().await.is_none() {
            return Err(ClientError::InvalidState("local media not initialized"));
        }
        if self.policy == JoinPolicy::ConsentGated {
            let granted = self
                .clinical
                .check_consent(&self.cfg.session_id, &self.cfg.user_id)
                .await?;
            if !granted {
                self.set_state(PeerState::AwaitingConsent);
                return Ok(JoinProgress::AwaitingConsent);
            }
        }
        self.establish().await
    }

    /// Resume a consent-gated join after consent was recorded. Consent
    /// is re-checked; media acquired earlier is reused as-is.
    pub async fn consent_recorded(self: &Arc<Self>) -> Result<JoinProgress, ClientError> {
        if self.state() != PeerState::AwaitingConsent {
            return Err(ClientError::InvalidState("not awaiting consent"));
        }
        let granted = self
            .clinical
            .check_consent(&self.cfg.session_id, &self.cfg.user_id)
            .await?;
        if !granted {
            return Err(ClientError::Clinical("consent has not been granted".into()));
        }
        self.establish().await
    }

    async fn establish(self: &Arc<Self>) -> Result<JoinProgress, ClientError> {
        let epoch = self.join_epoch.load(Ordering::SeqCst);
        self.set_state(PeerState::CreatingConnection);
        let media = {
            let guard = self.media.lock().await;
            guard.as_ref().cloned()
        };
        let Some(media) = media else {
            return Err(self.settle_failed_join(
                epoch,
                ClientError::InvalidState("local media not initialized"),
            ));
        };
        let (pc, video_sender, transport_tx, pc_state_rx) =
            match self.build_connection(&media).await {
                Ok(parts) => parts,
                Err(err) => return Err(self.settle_failed_join(epoch, err)),
            };

        let mut relay_rx = {
            let mut guard = self.relay_rx.lock().await;
            match guard.take() {
                Some(rx) => rx,
                None => {
                    let _ = pc.close().await;
                    return Err(self.settle_failed_join(
                        epoch,
                        ClientError::InvalidState("session already active"),
                    ));
                }
            }
        };

        if self
            .relay_tx
            .send(ClientEvent::JoinSession {
                session_id: self.cfg.session_id.clone(),
                role: self.cfg.role,
            })
            .is_err()
        {
            *self.relay_rx.lock().await = Some(relay_rx);
            let _ = pc.close().await;
            return Err(self.settle_failed_join(epoch, ClientError::ChannelClosed));
        }

        // Wait for the room acknowledgment; anything else that arrives
        // first is replayed to the pump after the join completes.
        let mut backlog = Vec::new();
        let deadline = tokio::time::Instant::now() + self.cfg.join_ack_timeout;
        let participants = loop {
            let event = tokio::time::timeout_at(deadline, relay_rx.recv()).await;
            match event {
                Err(_) => {
                    *self.relay_rx.lock().await = Some(relay_rx);
                    let _ = pc.close().await;
                    return Err(self.settle_failed_join(epoch, ClientError::JoinTimeout));
                }
                Ok(None) => {
                    *self.relay_rx.lock().await = Some(relay_rx);
                    let _ = pc.close().await;
                    return Err(self.settle_failed_join(epoch, ClientError::ChannelClosed));
                }
                Ok(Some(ServerEvent::SessionJoined { participants, .. })) => break participants,
                Ok(Some(ServerEvent::Error { message })) => {
                    *self.relay_rx.lock().await = Some(relay_rx);
                    let _ = pc.close().await;
                    return Err(self.settle_failed_join(epoch, ClientError::Relay(message)));
                }
                Ok(Some(other)) => backlog.push(other),
            }
        };

        // Commit under the connection lock, re-checking the epoch there:
        // a leave that raced the acknowledgment wins over the join, and
        // the membership it created is rolled back instead of committed.
        // `leave_session` takes the same lock, so a leave that lands
        // after this commit tears the stored connection down normally.
        {
            let mut conn = self.conn.lock().await;
            if self.join_cancelled(epoch) {
                drop(conn);
                *self.relay_rx.lock().await = Some(relay_rx);
                let _ = pc.close().await;
                return Err(self.settle_failed_join(
                    epoch,
                    ClientError::InvalidState("session closed during join"),
                ));
            }

            let offerer = participants.is_empty();
            self.offerer.store(offerer, Ordering::SeqCst);
            self.attempts.store(0, Ordering::SeqCst);
            if let Some(first) = participants.first() {
                self.set_remote(first.id.clone());
            }
            self.set_state(PeerState::Signaling);

            *self.relay_rx.lock().await = Some(relay_rx);
            let pump = {
                let this = Arc::clone(self);
                let pc = Arc::clone(&pc);
                tokio::spawn(async move { this.pump(pc, pc_state_rx, backlog).await })
            };
            *conn = Some(LiveConnection {
                pc,
                video_sender,
                transport: transport_tx,
                pump,
            });

            Ok(JoinProgress::Joined {
                offerer,
                participants,
            })
        }
    }

    fn join_cancelled(&self, epoch: u64) -> bool {
        self.join_epoch.load(Ordering::SeqCst) != epoch
    }

    /// Resolve a join that did not commit. A concurrent leave wins over
    /// whatever else went wrong: the relay gets a best-effort
    /// `leave-session` to roll back any membership the join created and
    /// the machine stays `Closed`. Otherwise the machine returns to
    /// `Idle` carrying the original error.
    fn settle_failed_join(&self, epoch: u64, err: ClientError) -> ClientError {
        if self.join_cancelled(epoch) {
            let _ = self.relay_tx.send(ClientEvent::LeaveSession);
            self.set_state(PeerState::Closed);
            ClientError::InvalidState("session closed during join")
        } else {
            self.set_state(PeerState::Idle);
            err
        }
    }

    async fn build_connection(
        &self,
        media: &Arc<LocalMedia>,
    ) -> Result<
        (
            Arc<RTCPeerConnection>,
            Arc<RTCRtpSender>,
            mpsc::UnboundedSender<RTCPeerConnectionState>,
            mpsc::UnboundedReceiver<RTCPeerConnectionState>,
        ),
        ClientError,
    > {
        let mut engine = MediaEngine::default();
        engine.register_default_codecs()?;
        let api = APIBuilder::new().with_media_engine(engine).build();
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: self.cfg.ice_servers.clone(),
                ..Default::default()
            })
            .await?,
        );

        let _audio_sender = pc
            .add_track(Arc::clone(&media.audio) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        let video_sender = pc
            .add_track(Arc::clone(&media.video) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Trickle candidates out as they are gathered, queueing any
        // found before we know who to send them to.
        let remote_user = Arc::clone(&self.remote_user);
        let pending_out = Arc::clone(&self.pending_out);
        let relay_tx = self.relay_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let remote_user = Arc::clone(&remote_user);
            let pending_out = Arc::clone(&pending_out);
            let relay_tx = relay_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let Ok(init) = candidate.to_json() else { return };
                let payload = IceCandidatePayload {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index.map(u32::from),
                };
                let target = remote_user.lock().ok().and_then(|r| r.clone());
                match target {
                    Some(target_user_id) => {
                        let _ = relay_tx.send(ClientEvent::IceCandidate {
                            target_user_id,
                            candidate: payload,
                        });
                    }
                    None => {
                        if let Ok(mut queue) = pending_out.lock() {
                            queue.push(payload);
                        }
                    }
                }
            })
        }));

        let (pc_state_tx, pc_state_rx) = mpsc::unbounded_channel();
        let callback_tx = pc_state_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let _ = callback_tx.send(state);
            Box::pin(async {})
        }));

        let events = self.events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let _ = events.send(PeerEvent::RemoteTrack {
                kind: track.kind().to_string(),
            });
            Box::pin(async {})
        }));

        Ok((pc, video_sender, pc_state_tx, pc_state_rx))
    }

    /// Feed a transport state observation into the lifecycle loop, the
    /// same path the peer connection's own state callback uses. Lets an
    /// embedder surface externally detected conditions such as an OS
    /// network change.
    pub async fn notify_transport_state(
        &self,
        state: RTCPeerConnectionState,
    ) -> Result<(), ClientError> {
        let guard = self.conn.lock().await;
        let live = guard
            .as_ref()
            .ok_or(ClientError::InvalidState("no active connection"))?;
        live.transport
            .send(state)
            .map_err(|_| ClientError::ChannelClosed)
    }

    /// Event loop for one live connection. Borrows the relay receiver
    /// per iteration so an aborted pump leaves it with the manager for
    /// the next join.
    async fn pump(
        self: Arc<Self>,
        pc: Arc<RTCPeerConnection>,
        mut pc_state_rx: mpsc::UnboundedReceiver<RTCPeerConnectionState>,
        backlog: Vec<ServerEvent>,
    ) {
        enum Input {
            Relay(Option<ServerEvent>),
            Transport(Option<RTCPeerConnectionState>),
        }

        for event in backlog {
            self.handle_server_event(&pc, event).await;
        }
        loop {
            let input = {
                let mut guard = self.relay_rx.lock().await;
                let Some(rx) = guard.as_mut() else { break };
                tokio::select! {
                    event = rx.recv() => Input::Relay(event),
                    state = pc_state_rx.recv() => Input::Transport(state),
                }
            };
            match input {
                Input::Relay(Some(event)) => self.handle_server_event(&pc, event).await,
                Input::Relay(None) => {
                    self.stop_monitor();
                    self.set_state(PeerState::Failed);
                    let _ = self.events.send(PeerEvent::Terminated {
                        reason: "signaling channel closed".into(),
                    });
                    break;
                }
                Input::Transport(Some(state)) => self.handle_transport_state(&pc, state).await,
                Input::Transport(None) => break,
            }
        }
    }

    async fn handle_server_event(self: &Arc<Self>, pc: &Arc<RTCPeerConnection>, event: ServerEvent) {
        match event {
            ServerEvent::ParticipantJoined { user_id, role } => {
                self.set_remote(user_id.clone());
                let _ = self.events.send(PeerEvent::ParticipantJoined {
                    user_id: user_id.clone(),
                    role,
                });
                if self.is_offerer() {
                    if let Err(err) = self.send_offer(pc, &user_id, false).await {
                        warn!(target = "peer", error = %err, "offer failed");
                    }
                }
            }
            ServerEvent::ParticipantLeft { user_id } => {
                let was_remote = self
                    .remote_user
                    .lock()
                    .map(|r| r.as_deref() == Some(user_id.as_str()))
                    .unwrap_or(false);
                let _ = self.events.send(PeerEvent::ParticipantLeft { user_id });
                if was_remote {
                    if let Ok(mut remote) = self.remote_user.lock() {
                        *remote = None;
                    }
                    self.stop_monitor();
                    if self.state() == PeerState::Connected {
                        self.set_state(PeerState::Signaling);
                    }
                }
            }
            ServerEvent::Offer { user_id, sdp } => {
                self.set_remote(user_id.clone());
                if let Err(err) = self.answer_offer(pc, &user_id, sdp).await {
                    warn!(target = "peer", error = %err, "answering offer failed");
                }
            }
            ServerEvent::Answer { sdp, .. } => {
                if let Err(err) = self.accept_answer(pc, sdp).await {
                    warn!(target = "peer", error = %err, "applying answer failed");
                }
            }
            ServerEvent::IceCandidate { candidate, .. } => {
                if pc.remote_description().await.is_some() {
                    if let Err(err) = add_candidate(pc, candidate).await {
                        warn!(target = "peer", error = %err, "ice candidate rejected");
                    }
                } else {
                    self.pending_in.lock().await.push(candidate);
                }
            }
            ServerEvent::ParticipantConnectionQuality {
                user_id,
                level,
                metrics,
            } => {
                let _ = self.events.send(PeerEvent::RemoteQuality {
                    user_id,
                    level,
                    metrics,
                });
            }
            ServerEvent::Error { message } => {
                warn!(target = "peer", message, "relay error");
                let _ = self.events.send(PeerEvent::RelayError { message });
            }
            ServerEvent::SessionJoined { .. } => {
                debug!(target = "peer", "unexpected session-joined while joined");
            }
        }
    }

    async fn handle_transport_state(
        self: &Arc<Self>,
        pc: &Arc<RTCPeerConnection>,
        state: RTCPeerConnectionState,
    ) {
        match state {
            RTCPeerConnectionState::Connected => {
                self.attempts.store(0, Ordering::SeqCst);
                self.replace_retry_timer(None);
                self.set_state(PeerState::Connected);
                self.stop_monitor();
                let handle = spawn_monitor(
                    Arc::new(RtcStatsProbe::new(Arc::clone(pc))),
                    self.cfg.monitor_interval,
                    self.relay_tx.clone(),
                    self.events.clone(),
                );
                if let Ok(mut monitor) = self.monitor.lock() {
                    *monitor = Some(handle);
                }
            }
            RTCPeerConnectionState::Failed => {
                self.stop_monitor();
                let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt > self.cfg.max_reconnect_attempts {
                    self.set_state(PeerState::Failed);
                    let _ = self.events.send(PeerEvent::Terminated {
                        reason: format!(
                            "transport failed after {} reconnect attempts",
                            self.cfg.max_reconnect_attempts
                        ),
                    });
                    return;
                }
                self.set_state(PeerState::Reconnecting);
                // The offerer restarts ICE; the answerer waits for the
                // restarted offer to arrive. The delayed re-offer runs
                // on its own timer so the pump keeps draining relay
                // events through the backoff.
                if !self.is_offerer() {
                    return;
                }
                let delay = backoff_delay(attempt, self.cfg.backoff_base, self.cfg.backoff_cap);
                let this = Arc::clone(self);
                let pc = Arc::clone(pc);
                let timer = tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let target = this.remote_user.lock().ok().and_then(|r| r.clone());
                    if let Some(target) = target {
                        if let Err(err) = this.send_offer(&pc, &target, true).await {
                            warn!(target = "peer", error = %err, "ice restart offer failed");
                        }
                    }
                });
                self.replace_retry_timer(Some(timer));
            }
            other => {
                debug!(target = "peer", state = %other, "transport state");
            }
        }
    }

    async fn send_offer(
        &self,
        pc: &Arc<RTCPeerConnection>,
        target: &str,
        ice_restart: bool,
    ) -> Result<(), ClientError> {
        let offer = pc
            .create_offer(Some(RTCOfferOptions {
                ice_restart,
                ..Default::default()
            }))
            .await?;
        pc.set_local_description(offer).await?;
        let sdp = pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| ClientError::Negotiation("local description missing after offer".into()))?;
        self.relay_tx
            .send(ClientEvent::Offer {
                target_user_id: target.to_owned(),
                sdp,
            })
            .map_err(|_| ClientError::ChannelClosed)
    }

    async fn answer_offer(
        &self,
        pc: &Arc<RTCPeerConnection>,
        from: &str,
        sdp: String,
    ) -> Result<(), ClientError> {
        let offer = RTCSessionDescription::offer(sdp)?;
        pc.set_remote_description(offer).await?;
        self.flush_pending_in(pc).await;
        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer).await?;
        let sdp = pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| {
                ClientError::Negotiation("local description missing after answer".into())
            })?;
        self.relay_tx
            .send(ClientEvent::Answer {
                target_user_id: from.to_owned(),
                sdp,
            })
            .map_err(|_| ClientError::ChannelClosed)
    }

    async fn accept_answer(
        &self,
        pc: &Arc<RTCPeerConnection>,
        sdp: String,
    ) -> Result<(), ClientError> {
        let answer = RTCSessionDescription::answer(sdp)?;
        pc.set_remote_description(answer).await?;
        self.flush_pending_in(pc).await;
        Ok(())
    }

    async fn flush_pending_in(&self, pc: &Arc<RTCPeerConnection>) {
        let queued = std::mem::take(&mut *self.pending_in.lock().await);
        for candidate in queued {
            if let Err(err) = add_candidate(pc, candidate).await {
                warn!(target = "peer", error = %err, "queued ice candidate rejected");
            }
        }
    }

    /// Record who we are negotiating with and flush candidates that
    /// were gathered before the peer was known.
    fn set_remote(&self, user_id: String) {
        if let Ok(mut remote) = self.remote_user.lock() {
            *remote = Some(user_id.clone());
        }
        let queued = self
            .pending_out
            .lock()
            .map(|mut q| std::mem::take(&mut *q))
            .unwrap_or_default();
        for candidate in queued {
            let _ = self.relay_tx.send(ClientEvent::IceCandidate {
                target_user_id: user_id.clone(),
                candidate,
            });
        }
    }

    /// Flip the microphone flag. Purely local, no signaling.
    pub async fn toggle_audio(&self) -> Result<bool, ClientError> {
        let guard = self.media.lock().await;
        let media = guard
            .as_ref()
            .ok_or(ClientError::InvalidState("local media not initialized"))?;
        let enabled = media.toggle_audio();
        let _ = self.events.send(PeerEvent::AudioToggled { enabled });
        Ok(enabled)
    }

    pub async fn toggle_video(&self) -> Result<bool, ClientError> {
        let guard = self.media.lock().await;
        let media = guard
            .as_ref()
            .ok_or(ClientError::InvalidState("local media not initialized"))?;
        let enabled = media.toggle_video();
        let _ = self.events.send(PeerEvent::VideoToggled { enabled });
        Ok(enabled)
    }

    /// Swap the outgoing video track for a display capture. No
    /// renegotiation; the sender keeps its SSRC. A failure to open the
    /// capture leaves the camera track in place. No-op when already
    /// sharing.
    pub async fn start_screen_share(&self) -> Result<(), ClientError> {
        let conn = self.conn.lock().await;
        let live = conn
            .as_ref()
            .ok_or(ClientError::InvalidState("no active connection"))?;
        let mut screen = self.screen.lock().await;
        if screen.is_some() {
            return Ok(());
        }
        let track = self.devices.open_display_media().await?;
        live.video_sender
            .replace_track(Some(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>))
            .await?;
        *screen = Some(track);
        let _ = self.events.send(PeerEvent::ScreenShareStarted);
        Ok(())
    }

    /// Restore the camera track. No-op when not sharing.
    pub async fn stop_screen_share(&self) -> Result<(), ClientError> {
        let conn = self.conn.lock().await;
        let mut screen = self.screen.lock().await;
        if screen.is_none() {
            return Ok(());
        }
        let live = conn
            .as_ref()
            .ok_or(ClientError::InvalidState("no active connection"))?;
        let camera = {
            let guard = self.media.lock().await;
            guard
                .as_ref()
                .map(|m| Arc::clone(&m.video))
                .ok_or(ClientError::InvalidState("local media not initialized"))?
        };
        live.video_sender
            .replace_track(Some(camera as Arc<dyn TrackLocal + Send + Sync>))
            .await?;
        *screen = None;
        let _ = self.events.send(PeerEvent::ScreenShareStopped);
        Ok(())
    }

    /// Tear everything down: notify the relay (best effort), close the
    /// transport, stop and release local tracks. Safe from any state
    /// and idempotent.
    pub async fn leave_session(&self) -> Result<(), ClientError> {
        // Invalidates any join still waiting on its acknowledgment.
        self.join_epoch.fetch_add(1, Ordering::SeqCst);
        let had_connection = self.release_connection().await;
        *self.screen.lock().await = None;
        *self.media.lock().await = None;
        if had_connection {
            let _ = self.relay_tx.send(ClientEvent::LeaveSession);
        }
        self.set_state(PeerState::Closed);
        Ok(())
    }

    /// Mark the clinical session complete. Pass-through to the
    /// integration; does not touch the connection.
    pub async fn complete_session(&self, notes: Option<&str>) -> Result<bool, ClientError> {
        self.clinical
            .complete_session(&self.cfg.session_id, notes)
            .await
    }

    async fn release_connection(&self) -> bool {
        self.stop_monitor();
        self.replace_retry_timer(None);
        let live = self.conn.lock().await.take();
        let had = live.is_some();
        if let Some(live) = live {
            live.pump.abort();
            let _ = live.pc.close().await;
        }
        if let Ok(mut remote) = self.remote_user.lock() {
            *remote = None;
        }
        if let Ok(mut queue) = self.pending_out.lock() {
            queue.clear();
        }
        self.pending_in.lock().await.clear();
        self.attempts.store(0, Ordering::SeqCst);
        had
    }

    fn replace_retry_timer(&self, next: Option<JoinHandle<()>>) {
        if let Ok(mut timer) = self.retry_timer.lock() {
            if let Some(old) = timer.take() {
                old.abort();
            }
            *timer = next;
        }
    }

    fn stop_monitor(&self) {
        if let Ok(mut monitor) = self.monitor.lock() {
            if let Some(handle) = monitor.take() {
                handle.abort();
            }
        }
    }

    fn set_state(&self, next: PeerState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            let _ = self.events.send(PeerEvent::State(next));
        }
    }
}

async fn add_candidate(
    pc: &Arc<RTCPeerConnection>,
    candidate: IceCandidatePayload,
) -> Result<(), ClientError> {
    pc.add_ice_candidate(RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index.map(|i| i as u16),
        username_fragment: None,
    })
    .await?;
    Ok(())
}

/// First retry is immediate, then the delay doubles up to the cap.
fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }
    let factor = 1u32 << (attempt - 2).min(16);
    base.saturating_mul(factor).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_immediate_then_doubles_to_the_cap() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(8);
        assert_eq!(backoff_delay(1, base, cap), Duration::ZERO);
        assert_eq!(backoff_delay(2, base, cap), Duration::from_secs(2));
        assert_eq!(backoff_delay(3, base, cap), Duration::from_secs(4));
        assert_eq!(backoff_delay(4, base, cap), Duration::from_secs(8));
        assert_eq!(backoff_delay(9, base, cap), Duration::from_secs(8));
    }

    #[test]
    fn patients_are_consent_gated() {
        assert_eq!(
            JoinPolicy::for_role(ParticipantRole::Patient),
            JoinPolicy::ConsentGated
        );
        assert_eq!(
            JoinPolicy::for_role(ParticipantRole::Therapist),
            JoinPolicy::Direct
        );
    }
}
