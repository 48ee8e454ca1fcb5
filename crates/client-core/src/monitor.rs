//! Connection quality scoring and the periodic monitor task.
//!
//! Scoring is a pure function over a transport sample so the thresholds
//! can be tested without a peer connection. The monitor polls a
//! [`StatsProbe`] on a fixed cadence and reports only on level changes,
//! both locally and to the relay for the remote participant's UI.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use signal_proto::{ClientEvent, QualityLevel, QualityMetrics};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use crate::peer::PeerEvent;

/// One sample of the transport's health.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportStats {
    pub rtt_ms: f64,
    /// Packet loss over the sampling interval, as a fraction in `[0, 1]`.
    pub packet_loss: f64,
    pub jitter_ms: f64,
    pub available_kbps: f64,
}

impl TransportStats {
    pub fn metrics(&self) -> QualityMetrics {
        QualityMetrics {
            rtt_ms: self.rtt_ms,
            packet_loss: self.packet_loss,
            jitter_ms: self.jitter_ms,
            available_kbps: self.available_kbps,
        }
    }
}

/// Source of transport samples. `None` means the transport produced no
/// usable statistics, which scores as [`QualityLevel::Disconnected`].
#[async_trait]
pub trait StatsProbe: Send + Sync {
    async fn sample(&self) -> Option<TransportStats>;
}

fn score_rtt(rtt_ms: f64) -> QualityLevel {
    match rtt_ms {
        r if r < 50.0 => QualityLevel::Excellent,
        r if r < 100.0 => QualityLevel::Good,
        r if r < 200.0 => QualityLevel::Fair,
        r if r < 300.0 => QualityLevel::Poor,
        _ => QualityLevel::Disconnected,
    }
}

fn score_loss(fraction: f64) -> QualityLevel {
    match fraction * 100.0 {
        p if p < 1.0 => QualityLevel::Excellent,
        p if p < 5.0 => QualityLevel::Good,
        p if p < 10.0 => QualityLevel::Fair,
        p if p < 15.0 => QualityLevel::Poor,
        _ => QualityLevel::Disconnected,
    }
}

fn score_jitter(jitter_ms: f64) -> QualityLevel {
    match jitter_ms {
        j if j < 10.0 => QualityLevel::Excellent,
        j if j < 30.0 => QualityLevel::Good,
        j if j < 50.0 => QualityLevel::Fair,
        j if j < 100.0 => QualityLevel::Poor,
        _ => QualityLevel::Disconnected,
    }
}

/// Grade a sample. The overall level is the worst of the per-metric
/// grades, so a single degraded dimension drags the whole score down.
pub fn score(stats: &TransportStats) -> QualityLevel {
    score_rtt(stats.rtt_ms)
        .worst(score_loss(stats.packet_loss))
        .worst(score_jitter(stats.jitter_ms))
}

/// Poll the probe every `interval` and emit on level changes only. The
/// first sample always emits. Runs until aborted.
pub(crate) fn spawn_monitor(
    probe: Arc<dyn StatsProbe>,
    interval: Duration,
    relay_tx: mpsc::UnboundedSender<ClientEvent>,
    events: broadcast::Sender<PeerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last: Option<QualityLevel> = None;
        loop {
            ticker.tick().await;
            let sample = probe.sample().await;
            let level = sample.as_ref().map(score).unwrap_or(QualityLevel::Disconnected);
            if last == Some(level) {
                continue;
            }
            last = Some(level);
            let metrics = sample.map(|s| s.metrics());
            debug!(target = "monitor", ?level, "connection quality changed");
            let _ = relay_tx.send(ClientEvent::ConnectionQuality { level, metrics });
            let _ = events.send(PeerEvent::LocalQuality { level, metrics });
        }
    })
}

/// Probe over a live peer connection's RTCP statistics. Loss is
/// computed per interval from the remote's cumulative packets-lost
/// against our packets-sent counters.
pub struct RtcStatsProbe {
    pc: Arc<RTCPeerConnection>,
    counters: std::sync::Mutex<(u64, i64)>,
}

impl RtcStatsProbe {
    pub fn new(pc: Arc<RTCPeerConnection>) -> Self {
        Self {
            pc,
            counters: std::sync::Mutex::new((0, 0)),
        }
    }
}

#[async_trait]
impl StatsProbe for RtcStatsProbe {
    async fn sample(&self) -> Option<TransportStats> {
        let report = self.pc.get_stats().await;

        let mut packets_sent: u64 = 0;
        let mut packets_lost: i64 = 0;
        let mut rtt_sum = 0.0_f64;
        let mut rtt_count = 0u32;
        let mut saw_remote = false;

        for (_id, stat) in report.reports.iter() {
            match stat {
                StatsReportType::OutboundRTP(rtp) => {
                    packets_sent += rtp.packets_sent;
                }
                StatsReportType::RemoteInboundRTP(remote) => {
                    saw_remote = true;
                    packets_lost += remote.packets_lost;
                    if let Some(rtt) = remote.round_trip_time {
                        rtt_sum += rtt;
                        rtt_count += 1;
                    }
                }
                _ => {}
            }
        }

        if !saw_remote {
            return None;
        }

        let (interval_sent, interval_lost) = {
            let mut counters = self.counters.lock().ok()?;
            let sent = packets_sent.saturating_sub(counters.0);
            let lost = (packets_lost - counters.1).max(0) as u64;
            *counters = (packets_sent, packets_lost);
            (sent, lost)
        };

        let packet_loss = if interval_sent > 0 {
            interval_lost as f64 / interval_sent as f64
        } else {
            0.0
        };
        let rtt_ms = if rtt_count > 0 {
            rtt_sum / rtt_count as f64 * 1000.0
        } else {
            0.0
        };

        Some(TransportStats {
            rtt_ms,
            packet_loss,
            jitter_ms: 0.0,
            available_kbps: 0.0,
        })
    }
}
