use std::collections::HashMap;
use std::sync::Arc;

use util::sync::Mutex;

use crate::buffer::{Buffer, BufferStats};
use crate::track::MediaKind;

/// Per-stream accounting and cross-stream A/V drift, enabled by the
/// with_stats router option. Streams sharing a CNAME belong to one user;
/// their sender reports pin each RTP clock to NTP time, and the difference
/// between those anchors is the lip-sync drift a subscriber would see.
pub struct StatsCollector {
    streams: Mutex<HashMap<u32, StreamStats>>,
}

struct StreamStats {
    kind: MediaKind,
    clock_rate: u32,
    cname: String,
    buffer: Arc<Buffer>,
    /// NTP time (16.16 fixed seconds would lose precision, keep 32.32)
    /// corresponding to RTP timestamp zero, from the last sender report.
    ntp_at_rtp_zero: Option<f64>,
}

/// Snapshot returned to the embedding server.
#[derive(Debug, Default, Clone)]
pub struct StreamSnapshot {
    pub ssrc: u32,
    pub cname: String,
    pub stats: BufferStats,
    pub bitrate: u64,
}

impl Default for StatsCollector {
    fn default() -> Self {
        StatsCollector::new()
    }
}

impl StatsCollector {
    pub fn new() -> Self {
        StatsCollector {
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_stream(&self, ssrc: u32, kind: MediaKind, clock_rate: u32, buffer: Arc<Buffer>) {
        self.streams.lock().entry(ssrc).or_insert(StreamStats {
            kind,
            clock_rate,
            cname: String::new(),
            buffer,
            ntp_at_rtp_zero: None,
        });
    }

    pub fn remove_stream(&self, ssrc: u32) {
        self.streams.lock().remove(&ssrc);
    }

    pub fn set_cname(&self, ssrc: u32, cname: String) {
        if let Some(s) = self.streams.lock().get_mut(&ssrc) {
            s.cname = cname;
        }
    }

    /// Records a sender report and returns the audio/video drift in
    /// milliseconds across the reporting stream's CNAME group, when both
    /// kinds have reported.
    pub fn on_sender_report(&self, ssrc: u32, ntp_time: u64, rtp_time: u32) -> Option<i64> {
        let mut streams = self.streams.lock();
        let (cname, kind) = {
            let s = streams.get_mut(&ssrc)?;
            if s.clock_rate == 0 {
                return None;
            }
            s.ntp_at_rtp_zero =
                Some(ntp_to_seconds(ntp_time) - rtp_time as f64 / s.clock_rate as f64);
            (s.cname.clone(), s.kind)
        };
        if cname.is_empty() {
            return None;
        }

        let other_kind = match kind {
            MediaKind::Audio => MediaKind::Video,
            MediaKind::Video => MediaKind::Audio,
        };
        let own = streams.get(&ssrc)?.ntp_at_rtp_zero?;
        let other = streams
            .values()
            .find(|s| s.cname == cname && s.kind == other_kind)?
            .ntp_at_rtp_zero?;
        let drift_ms = ((own - other) * 1000.0) as i64;
        log::debug!("cname {cname}: a/v drift {drift_ms} ms");
        Some(drift_ms)
    }

    pub fn snapshots(&self) -> Vec<StreamSnapshot> {
        self.streams
            .lock()
            .iter()
            .map(|(ssrc, s)| StreamSnapshot {
                ssrc: *ssrc,
                cname: s.cname.clone(),
                stats: s.buffer.stats(),
                bitrate: s.buffer.bitrate(),
            })
            .collect()
    }
}

fn ntp_to_seconds(ntp: u64) -> f64 {
    (ntp >> 32) as f64 + (ntp & 0xffff_ffff) as f64 / (1u64 << 32) as f64
}

#[cfg(test)]
mod test {
    use super::*;

    fn ntp(seconds: f64) -> u64 {
        let whole = seconds.trunc() as u64;
        let frac = ((seconds.fract()) * (1u64 << 32) as f64) as u64;
        (whole << 32) | frac
    }

    #[test]
    fn test_drift_between_cname_streams() {
        let c = StatsCollector::new();
        let audio = Arc::new(Buffer::new(1));
        let video = Arc::new(Buffer::new(2));
        c.add_stream(1, MediaKind::Audio, 48_000, audio);
        c.add_stream(2, MediaKind::Video, 90_000, video);
        c.set_cname(1, "user-a".to_owned());
        c.set_cname(2, "user-a".to_owned());

        // Both clocks anchored to the same NTP instant: no drift.
        assert!(c.on_sender_report(1, ntp(1000.0), 48_000).is_none());
        let drift = c.on_sender_report(2, ntp(1000.0), 90_000).unwrap();
        assert_eq!(drift, 0);

        // Video claims its timestamp maps 40 ms later than audio's.
        let drift = c.on_sender_report(2, ntp(1000.04), 90_000).unwrap();
        assert_eq!(drift, 40);
    }

    #[test]
    fn test_no_drift_without_cname() {
        let c = StatsCollector::new();
        c.add_stream(1, MediaKind::Audio, 48_000, Arc::new(Buffer::new(1)));
        assert!(c.on_sender_report(1, ntp(5.0), 0).is_none());
    }
}
