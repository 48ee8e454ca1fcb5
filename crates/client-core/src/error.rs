use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Camera/microphone access was denied or unavailable. Not retried
    /// automatically; the caller surfaces it to the user.
    #[error("media access failed: {0}")]
    MediaAccess(String),
    /// Display capture was rejected (e.g. the user cancelled the
    /// picker). The prior outgoing track stays active.
    #[error("screen share failed: {0}")]
    ScreenShare(String),
    /// The relay did not acknowledge join-session within the configured
    /// window. The caller may retry `join_session`.
    #[error("timed out waiting for join acknowledgment")]
    JoinTimeout,
    /// Offer/answer negotiation exhausted its retries.
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error("relay reported: {0}")]
    Relay(String),
    #[error("invalid state for this call: {0}")]
    InvalidState(&'static str),
    #[error("clinical integration error: {0}")]
    Clinical(String),
    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
}
