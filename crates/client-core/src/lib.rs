//! Client-side session core for the televisit platform: local media,
//! relay signaling, the peer connection lifecycle, quality monitoring,
//! and the clinical-workflow seam.
//!
//! The entry point is [`PeerConnectionManager`]; everything else
//! exists to feed it or observe it.

pub mod clinical;
pub mod error;
pub mod media;
pub mod monitor;
pub mod peer;
pub mod signaling;

pub use clinical::{ClinicalIntegration, InMemoryClinical, SessionDetails};
pub use error::ClientError;
pub use media::{LocalMedia, MediaDevices, SampleMediaDevices};
pub use monitor::{score, RtcStatsProbe, StatsProbe, TransportStats};
pub use peer::{
    JoinPolicy, JoinProgress, PeerConnectionManager, PeerEvent, PeerSessionConfig, PeerState,
};
pub use signaling::{RelayClient, RelayLink};

pub use signal_proto::{
    ClientEvent, IceCandidatePayload, ParticipantRole, ParticipantSummary, QualityLevel,
    QualityMetrics, ServerEvent,
};
