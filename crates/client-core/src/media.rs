//! Local media acquisition and track ownership.
//!
//! Device access sits behind the [`MediaDevices`] trait so the manager
//! can be driven by real capture pipelines in the application and by
//! stubs (including denial) in tests. Tracks are the `webrtc` crate's
//! sample-based local tracks; the capture pipeline feeding them is the
//! embedding application's concern.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::ClientError;

/// The client's camera/microphone pair. Exclusively owned by one peer
/// connection manager; dropped (and thereby stopped) on leave.
pub struct LocalMedia {
    pub audio: Arc<TrackLocalStaticSample>,
    pub video: Arc<TrackLocalStaticSample>,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
}

impl LocalMedia {
    pub fn new(audio: Arc<TrackLocalStaticSample>, video: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            audio,
            video,
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(true),
        }
    }

    /// Flip the audio-enabled flag and return the new value. Purely
    /// local: the capture pipeline feeds silence while disabled, no
    /// signaling round-trip happens.
    pub fn toggle_audio(&self) -> bool {
        !self.audio_enabled.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn toggle_video(&self) -> bool {
        !self.video_enabled.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst)
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::SeqCst)
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Request camera + microphone. Denial maps to
    /// [`ClientError::MediaAccess`].
    async fn open_user_media(&self) -> Result<LocalMedia, ClientError>;

    /// Request a display-capture video track. Rejection maps to
    /// [`ClientError::ScreenShare`].
    async fn open_display_media(&self) -> Result<Arc<TrackLocalStaticSample>, ClientError>;
}

/// Device source producing sample-fed tracks with the default codec
/// pairing (Opus audio, VP8 video). The embedding application pumps
/// captured samples into the returned tracks.
#[derive(Default)]
pub struct SampleMediaDevices;

fn audio_track() -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            ..Default::default()
        },
        "audio".to_owned(),
        "televisit".to_owned(),
    ))
}

fn video_track(id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            ..Default::default()
        },
        id.to_owned(),
        "televisit".to_owned(),
    ))
}

#[async_trait]
impl MediaDevices for SampleMediaDevices {
    async fn open_user_media(&self) -> Result<LocalMedia, ClientError> {
        Ok(LocalMedia::new(audio_track(), video_track("video")))
    }

    async fn open_display_media(&self) -> Result<Arc<TrackLocalStaticSample>, ClientError> {
        Ok(video_track("screen"))
    }
}
