//! Connection quality stats, computed from `RTCPeerConnection::get_stats`
//! via a trait so the computation is testable without real ICE.

use async_trait::async_trait;

use crate::error::SignalingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionStats {
    pub rtt_ms: f64,
    pub packet_loss_pct: f64,
    pub jitter_ms: f64,
    pub quality: ConnectionQuality,
}

/// Minimal slice of an RTC stats report this crate needs: whichever
/// candidate pair is selected (or, lacking that, nominated), plus the
/// cumulative inbound counters needed for delta packet loss.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawStatsSample {
    pub round_trip_time_s: f64,
    pub packets_lost: u64,
    pub packets_received: u64,
    pub jitter_s: f64,
}

#[async_trait]
pub trait StatsProvider: Send + Sync {
    async fn sample(&self) -> Result<RawStatsSample, SignalingError>;
}

fn quality_for(rtt_ms: f64, packet_loss_pct: f64) -> ConnectionQuality {
    if rtt_ms < 100.0 && packet_loss_pct < 1.0 {
        ConnectionQuality::Excellent
    } else if rtt_ms < 250.0 && packet_loss_pct < 3.0 {
        ConnectionQuality::Good
    } else if rtt_ms < 500.0 && packet_loss_pct < 8.0 {
        ConnectionQuality::Fair
    } else {
        ConnectionQuality::Poor
    }
}

/// Compute `ConnectionStats` from a fresh sample and, when available, the
/// prior one (for delta packet loss).
pub fn compute_stats(sample: RawStatsSample, previous: Option<RawStatsSample>) -> ConnectionStats {
    let rtt_ms = sample.round_trip_time_s * 1000.0;
    let jitter_ms = sample.jitter_s * 1000.0;

    let packet_loss_pct = match previous {
        Some(prev) => {
            let delta_lost = sample.packets_lost.saturating_sub(prev.packets_lost) as f64;
            let delta_received = sample.packets_received.saturating_sub(prev.packets_received) as f64;
            let denom = delta_lost + delta_received;
            if denom > 0.0 {
                (delta_lost / denom) * 100.0
            } else {
                0.0
            }
        }
        None => {
            let denom = (sample.packets_lost + sample.packets_received) as f64;
            if denom > 0.0 {
                (sample.packets_lost as f64 / denom) * 100.0
            } else {
                0.0
            }
        }
    };

    ConnectionStats {
        rtt_ms,
        packet_loss_pct,
        jitter_ms,
        quality: quality_for(rtt_ms, packet_loss_pct),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cumulative_loss_used_when_no_prior_sample() {
        let sample = RawStatsSample { round_trip_time_s: 0.05, packets_lost: 1, packets_received: 99, jitter_s: 0.01 };
        let stats = compute_stats(sample, None);
        assert!((stats.packet_loss_pct - 1.0).abs() < 1e-9);
        assert_eq!(stats.quality, ConnectionQuality::Excellent);
    }

    #[test]
    fn delta_loss_used_when_prior_sample_present() {
        let prev = RawStatsSample { round_trip_time_s: 0.05, packets_lost: 10, packets_received: 990, jitter_s: 0.01 };
        let next = RawStatsSample { round_trip_time_s: 0.05, packets_lost: 20, packets_received: 1080, jitter_s: 0.01 };
        let stats = compute_stats(next, Some(prev));
        // delta_lost=10, delta_received=90 -> 10/100 = 10%
        assert!((stats.packet_loss_pct - 10.0).abs() < 1e-9);
        assert_eq!(stats.quality, ConnectionQuality::Poor);
    }

    #[test]
    fn poor_quality_on_high_rtt() {
        let sample = RawStatsSample { round_trip_time_s: 0.8, packets_lost: 0, packets_received: 100, jitter_s: 0.0 };
        assert_eq!(compute_stats(sample, None).quality, ConnectionQuality::Poor);
    }
}
