use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use rtcp::receiver_report::ReceiverReport;
use rtcp::reception_report::ReceptionReport;
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use rtp::extension::audio_level_extension::AudioLevelExtension;
use rtp::extension::transport_cc_extension::TransportCcExtension;
use tokio::sync::Notify;
use util::marshal::Unmarshal;
use util::sync::Mutex;

use crate::buffer::bucket::Bucket;
use crate::buffer::helpers::{is_h264_key_frame, parse_vp8, Vp8Meta};
use crate::buffer::nack::NackQueue;
use crate::error::{Error, Result};
use crate::track::{CodecParameters, AUDIO_LEVEL_URI, TRANSPORT_CC_URI};

/// Bucket slots retained for a video SSRC by default.
pub const VIDEO_BUCKET_SLOTS: usize = 500;
/// Bucket slots retained for an audio SSRC.
pub const AUDIO_BUCKET_SLOTS: usize = 25;

/// Packets held back waiting for a gap to fill before delivery gives up on
/// the missing sequence numbers.
const MAX_REORDER: u32 = 100;

/// Pre-bind packets buffered until codec parameters arrive.
const MAX_PENDING: usize = 500;

const FEEDBACK_INTERVAL_MS: u64 = 500;
const REPORT_EVERY_TICKS: u32 = 2;

pub type RtcpPackets = Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>;

pub type OnFeedbackHdlrFn = Box<
    dyn (FnMut(RtcpPackets) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync,
>;
pub type OnAudioLevelHdlrFn = Box<dyn Fn(bool, u8) + Send + Sync>;
pub type OnTransportCcHdlrFn = Box<dyn Fn(u16, i64, bool) + Send + Sync>;
pub type OnCloseHdlrFn = Box<dyn Fn() + Send + Sync>;

/// A packet leaving the jitter buffer, annotated with what the forwarding
/// path needs to know about it.
#[derive(Debug, Clone)]
pub struct ExtPacket {
    /// Whether this packet advanced the stream head when it arrived.
    pub head: bool,
    /// Cycle bits of the extended sequence number at arrival.
    pub cycle: u32,
    /// Arrival wall clock, nanoseconds since the unix epoch.
    pub arrival: i64,
    pub packet: rtp::packet::Packet,
    pub key_frame: bool,
    /// RFC 6464 level when the stream negotiated the extension.
    pub audio_level: Option<u8>,
    /// Parsed VP8 descriptor for video/VP8 payloads.
    pub vp8: Option<Vp8Meta>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BufferStats {
    pub packet_count: u32,
    pub total_bytes: u64,
    pub jitter: f64,
    pub lost_rate: f32,
    pub total_lost: u32,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BufferOptions {
    /// Ingest cap in bits per second; 0 leaves the stream unlimited.
    pub max_bitrate: u64,
    /// Bucket slots for a video SSRC; 0 picks the default.
    pub max_packet_track: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CodecKind {
    Vp8,
    H264,
    OtherVideo,
    Audio,
}

struct BufferInternal {
    bucket: Option<Bucket>,
    nacker: Option<NackQueue>,
    pending_packets: Vec<(Bytes, i64)>,

    codec: CodecKind,
    clock_rate: u32,
    audio_ext_id: u8,
    twcc_ext_id: u8,
    remb: bool,
    max_bitrate: u64,

    started: bool,
    base_sn: u16,
    max_seq_no: u16,
    cycles: u32,

    ext_packets: BTreeMap<u32, ExtPacket>,
    deliver_started: bool,
    next_deliver: u32,

    stats: BufferStats,
    last_transit: u32,
    last_expected: u32,
    last_received: u32,
    bytes_since_report: u64,
    last_report_ns: i64,

    sr_rtp: u32,
    sr_ntp: u64,
    sr_recv_ns: i64,
}

struct CalcEffects {
    audio: Option<(bool, u8)>,
    twcc: Option<(u16, i64, bool)>,
    delivered: bool,
}

/// Per-SSRC ingest buffer: reorders arrivals, tracks loss for NACK and
/// receiver reports, inspects payloads for keyframes and extensions, and
/// retains raw packets for retransmission.
pub struct Buffer {
    media_ssrc: u32,
    bound: AtomicBool,
    closed: AtomicBool,
    bitrate: AtomicU64,
    notify: Notify,
    internal: Mutex<BufferInternal>,

    on_feedback_handler: tokio::sync::Mutex<Option<OnFeedbackHdlrFn>>,
    on_audio_level_handler: Mutex<Option<OnAudioLevelHdlrFn>>,
    on_transport_cc_handler: Mutex<Option<OnTransportCcHdlrFn>>,
    on_close_handler: Mutex<Option<OnCloseHdlrFn>>,
}

pub(crate) fn unix_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

impl Buffer {
    pub fn new(media_ssrc: u32) -> Self {
        Buffer {
            media_ssrc,
            bound: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            bitrate: AtomicU64::new(0),
            notify: Notify::new(),
            internal: Mutex::new(BufferInternal {
                bucket: None,
                nacker: None,
                pending_packets: Vec::new(),
                codec: CodecKind::Audio,
                clock_rate: 0,
                audio_ext_id: 0,
                twcc_ext_id: 0,
                remb: false,
                max_bitrate: 0,
                started: false,
                base_sn: 0,
                max_seq_no: 0,
                cycles: 0,
                ext_packets: BTreeMap::new(),
                deliver_started: false,
                next_deliver: 0,
                stats: BufferStats::default(),
                last_transit: 0,
                last_expected: 0,
                last_received: 0,
                bytes_since_report: 0,
                last_report_ns: 0,
                sr_rtp: 0,
                sr_ntp: 0,
                sr_recv_ns: 0,
            }),
            on_feedback_handler: tokio::sync::Mutex::new(None),
            on_audio_level_handler: Mutex::new(None),
            on_transport_cc_handler: Mutex::new(None),
            on_close_handler: Mutex::new(None),
        }
    }

    pub fn media_ssrc(&self) -> u32 {
        self.media_ssrc
    }

    /// Attaches codec parameters and starts the feedback loop. Packets
    /// written before bind are replayed through the regular ingest path.
    pub fn bind(self: &Arc<Self>, params: &CodecParameters, options: BufferOptions) {
        let mut effects = Vec::new();
        {
            let mut b = self.internal.lock();
            let mime = params.mime_type.to_lowercase();
            b.codec = if mime == "video/vp8" {
                CodecKind::Vp8
            } else if mime == "video/h264" {
                CodecKind::H264
            } else if mime.starts_with("video/") {
                CodecKind::OtherVideo
            } else {
                CodecKind::Audio
            };
            b.clock_rate = params.clock_rate;
            b.max_bitrate = options.max_bitrate;
            for ext in &params.header_extensions {
                match ext.uri.as_str() {
                    AUDIO_LEVEL_URI => b.audio_ext_id = ext.id,
                    TRANSPORT_CC_URI => b.twcc_ext_id = ext.id,
                    _ => {}
                }
            }
            if b.codec == CodecKind::Audio {
                b.bucket = Some(Bucket::new(AUDIO_BUCKET_SLOTS));
            } else {
                let slots = if options.max_packet_track == 0 {
                    VIDEO_BUCKET_SLOTS
                } else {
                    options.max_packet_track
                };
                b.bucket = Some(Bucket::new(slots));
                for fb in &params.rtcp_feedback {
                    match (fb.typ.as_str(), fb.parameter.as_str()) {
                        ("nack", "") => b.nacker = Some(NackQueue::new()),
                        ("goog-remb", _) => b.remb = true,
                        // transport-cc feedback is assembled by the router's
                        // TWCC responder, the buffer only extracts sequence
                        // numbers for it.
                        _ => {}
                    }
                }
                // Without transport-cc the remb estimate is the only brake.
                if b.twcc_ext_id != 0 {
                    b.remb = false;
                }
            }
            b.last_report_ns = unix_ns();

            let pending = std::mem::take(&mut b.pending_packets);
            for (pkt, arrival) in pending {
                if let Ok(e) = b.calc(&pkt, arrival, self.media_ssrc) {
                    effects.push(e);
                }
            }
        }
        self.bound.store(true, Ordering::SeqCst);
        for e in effects {
            self.apply_effects(e);
        }

        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            buffer.feedback_loop().await;
        });
    }

    /// Ingest entry point for the transport.
    pub fn write(&self, pkt: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ErrIoEof);
        }
        self.write_at(pkt, unix_ns())
    }

    pub(crate) fn write_at(&self, pkt: &[u8], arrival: i64) -> Result<usize> {
        if !self.bound.load(Ordering::SeqCst) {
            let mut b = self.internal.lock();
            if b.pending_packets.len() >= MAX_PENDING {
                return Err(Error::ErrBufferTooSmall);
            }
            b.pending_packets.push((Bytes::copy_from_slice(pkt), arrival));
            return Ok(pkt.len());
        }

        let effects = {
            let mut b = self.internal.lock();
            b.calc(pkt, arrival, self.media_ssrc)
        };
        match effects {
            Ok(e) => {
                self.apply_effects(e);
                Ok(pkt.len())
            }
            Err(e @ (Error::ErrRtxPacket | Error::ErrPacketTooOld)) => {
                log::debug!("ssrc {} dropped write: {}", self.media_ssrc, e);
                Ok(pkt.len())
            }
            Err(e) => Err(e),
        }
    }

    fn apply_effects(&self, e: CalcEffects) {
        if let Some((voice, level)) = e.audio {
            if let Some(f) = &*self.on_audio_level_handler.lock() {
                f(voice, level);
            }
        }
        if let Some((sn, arrival, marker)) = e.twcc {
            if let Some(f) = &*self.on_transport_cc_handler.lock() {
                f(sn, arrival, marker);
            }
        }
        if e.delivered {
            self.notify.notify_one();
        }
    }

    /// Next in-order packet. Blocks until one is deliverable or the buffer
    /// closes. A gap is skipped once the stream head has run MAX_REORDER
    /// packets past it, the nack queue has long since escalated by then.
    pub async fn read_extended(&self) -> Result<ExtPacket> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::ErrIoEof);
            }
            let notified = self.notify.notified();
            {
                let mut b = self.internal.lock();
                if let Some(pkt) = b.pop_ready() {
                    return Ok(pkt);
                }
            }
            notified.await;
        }
    }

    /// Copies the raw packet stored under sn into buf for retransmission.
    pub fn get_packet(&self, buf: &mut [u8], sn: u16) -> Result<usize> {
        let b = self.internal.lock();
        match &b.bucket {
            Some(bucket) => bucket.get_packet(buf, sn),
            None => Err(Error::ErrPacketNotFound),
        }
    }

    pub fn set_sender_report_data(&self, rtp_time: u32, ntp_time: u64) {
        let mut b = self.internal.lock();
        b.sr_rtp = rtp_time;
        b.sr_ntp = ntp_time;
        b.sr_recv_ns = unix_ns();
    }

    /// Last upstream sender report as (rtp time, ntp time, local receive ns).
    pub fn sender_report_data(&self) -> Option<(u32, u64, i64)> {
        let b = self.internal.lock();
        if b.sr_recv_ns == 0 {
            None
        } else {
            Some((b.sr_rtp, b.sr_ntp, b.sr_recv_ns))
        }
    }

    pub fn bitrate(&self) -> u64 {
        self.bitrate.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> BufferStats {
        self.internal.lock().stats
    }

    pub fn clock_rate(&self) -> u32 {
        self.internal.lock().clock_rate
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.notify.notify_waiters();
        let handler = self.on_close_handler.lock().take();
        if let Some(f) = handler {
            f();
        }
    }

    pub async fn on_feedback(&self, f: OnFeedbackHdlrFn) {
        *self.on_feedback_handler.lock().await = Some(f);
    }

    pub fn on_audio_level(&self, f: OnAudioLevelHdlrFn) {
        *self.on_audio_level_handler.lock() = Some(f);
    }

    pub fn on_transport_wide_cc(&self, f: OnTransportCcHdlrFn) {
        *self.on_transport_cc_handler.lock() = Some(f);
    }

    pub fn on_close(&self, f: OnCloseHdlrFn) {
        *self.on_close_handler.lock() = Some(f);
    }

    async fn feedback_loop(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_millis(FEEDBACK_INTERVAL_MS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tick = 0u32;
        loop {
            ticker.tick().await;
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            tick = tick.wrapping_add(1);
            let pkts = self.build_feedback(tick % REPORT_EVERY_TICKS == 0, unix_ns());
            if pkts.is_empty() {
                continue;
            }
            let mut handler = self.on_feedback_handler.lock().await;
            if let Some(f) = &mut *handler {
                f(pkts).await;
            }
        }
    }

    /// Collects the RTCP due this tick: NACKs every tick, receiver report
    /// and REMB on report ticks.
    pub(crate) fn build_feedback(&self, report_due: bool, now_ns: i64) -> RtcpPackets {
        let mut b = self.internal.lock();
        if !b.started {
            return Vec::new();
        }
        let mut pkts: RtcpPackets = Vec::new();

        let head = b.cycles | b.max_seq_no as u32;
        if let Some(nacker) = b.nacker.as_mut() {
            let (pairs, ask_keyframe) = nacker.pairs(head);
            if !pairs.is_empty() {
                pkts.push(Box::new(TransportLayerNack {
                    sender_ssrc: 0,
                    media_ssrc: self.media_ssrc,
                    nacks: pairs,
                }));
            }
            if ask_keyframe {
                pkts.push(Box::new(PictureLossIndication {
                    sender_ssrc: 0,
                    media_ssrc: self.media_ssrc,
                }));
            }
        }

        if report_due {
            let elapsed = now_ns.saturating_sub(b.last_report_ns);
            if elapsed > 0 {
                let br = b.bytes_since_report * 8 * 1_000_000_000 / elapsed as u64;
                self.bitrate.store(br, Ordering::Relaxed);
            }
            b.bytes_since_report = 0;
            b.last_report_ns = now_ns;

            pkts.push(Box::new(ReceiverReport {
                ssrc: 0,
                reports: vec![b.reception_report(self.media_ssrc, now_ns)],
                ..Default::default()
            }));
            if b.remb {
                let mut br = self.bitrate.load(Ordering::Relaxed) as f64;
                let lost_rate = b.stats.lost_rate;
                if lost_rate < 0.02 {
                    br = br * 1.09 + 2000.0;
                }
                if lost_rate > 0.1 {
                    br *= 1.0 - 0.5 * lost_rate as f64;
                }
                if b.max_bitrate > 0 && br > b.max_bitrate as f64 {
                    br = b.max_bitrate as f64;
                }
                if br < 100_000.0 {
                    br = 100_000.0;
                }
                pkts.push(Box::new(ReceiverEstimatedMaximumBitrate {
                    sender_ssrc: 0,
                    bitrate: br as f32,
                    ssrcs: vec![self.media_ssrc],
                }));
            }
        }
        pkts
    }
}

impl BufferInternal {
    fn calc(&mut self, pkt: &[u8], arrival: i64, media_ssrc: u32) -> Result<CalcEffects> {
        let mut raw = pkt;
        let packet = rtp::packet::Packet::unmarshal(&mut raw).map_err(Error::Util)?;
        let sn = packet.header.sequence_number;

        let mut head = false;
        let ext_sn;
        if !self.started {
            self.started = true;
            self.base_sn = sn;
            self.max_seq_no = sn;
            self.next_deliver = sn as u32;
            head = true;
            ext_sn = sn as u32;
        } else {
            let diff = sn.wrapping_sub(self.max_seq_no);
            if diff != 0 && diff < 0x8000 {
                head = true;
                if sn < self.max_seq_no {
                    self.cycles += 1 << 16;
                }
                ext_sn = self.cycles | sn as u32;
                if diff > 1 {
                    if let Some(nacker) = self.nacker.as_mut() {
                        for missing in 1..diff {
                            let m = self.max_seq_no.wrapping_add(missing);
                            // m > sn only when the gap straddles the wrap,
                            // those sequence numbers belong to the previous
                            // cycle.
                            let m_ext = if m > sn {
                                (self.cycles - (1 << 16)) | m as u32
                            } else {
                                self.cycles | m as u32
                            };
                            nacker.push(m_ext);
                        }
                    }
                }
                self.max_seq_no = sn;
            } else {
                // Late arrival, possibly from before the last wrap.
                ext_sn = if sn > self.max_seq_no && self.cycles >= 1 << 16 {
                    (self.cycles - (1 << 16)) | sn as u32
                } else {
                    self.cycles | sn as u32
                };
                if let Some(nacker) = self.nacker.as_mut() {
                    nacker.remove(ext_sn);
                }
            }
        }

        if let Some(bucket) = self.bucket.as_mut() {
            bucket.add_packet(pkt, sn, head)?;
        }

        self.stats.packet_count += 1;
        self.stats.total_bytes += pkt.len() as u64;
        self.bytes_since_report += pkt.len() as u64;
        if self.clock_rate > 0 {
            let arrival_rtp =
                (arrival as i128 * self.clock_rate as i128 / 1_000_000_000) as u32;
            let transit = arrival_rtp.wrapping_sub(packet.header.timestamp);
            if self.last_transit != 0 {
                let d = transit.wrapping_sub(self.last_transit);
                let d = (d as i32).unsigned_abs();
                self.stats.jitter += (d as f64 - self.stats.jitter) / 16.0;
            }
            self.last_transit = transit;
        }

        let mut audio = None;
        let mut twcc = None;
        let mut key_frame = false;
        let mut vp8 = None;

        match self.codec {
            CodecKind::Audio => {
                if self.audio_ext_id != 0 {
                    if let Some(ext) = packet.header.get_extension(self.audio_ext_id) {
                        let mut buf = &ext[..];
                        if let Ok(al) = AudioLevelExtension::unmarshal(&mut buf) {
                            audio = Some((al.voice, al.level));
                        }
                    }
                }
            }
            CodecKind::Vp8 => match parse_vp8(&packet.payload) {
                Ok(meta) => {
                    key_frame = meta.is_key_frame;
                    vp8 = Some(meta);
                }
                Err(e) => {
                    log::trace!("ssrc {} vp8 descriptor: {}", media_ssrc, e);
                }
            },
            CodecKind::H264 => {
                key_frame = is_h264_key_frame(&packet.payload);
            }
            CodecKind::OtherVideo => {}
        }
        if self.codec != CodecKind::Audio && self.twcc_ext_id != 0 {
            if let Some(ext) = packet.header.get_extension(self.twcc_ext_id) {
                let mut buf = &ext[..];
                if let Ok(tcc) = TransportCcExtension::unmarshal(&mut buf) {
                    twcc = Some((tcc.transport_sequence, arrival, packet.header.marker));
                }
            }
        }

        self.ext_packets.insert(
            ext_sn,
            ExtPacket {
                head,
                cycle: self.cycles,
                arrival,
                packet,
                key_frame,
                audio_level: audio.map(|(_, level)| level),
                vp8,
            },
        );
        // A stalled reader must not let the pending map grow without bound.
        while self.ext_packets.len() > MAX_PENDING {
            let (&oldest, _) = self.ext_packets.iter().next().unwrap();
            self.ext_packets.remove(&oldest);
        }

        Ok(CalcEffects {
            audio,
            twcc,
            delivered: true,
        })
    }

    fn pop_ready(&mut self) -> Option<ExtPacket> {
        loop {
            let (&first, _) = self.ext_packets.iter().next()?;
            if !self.deliver_started || first == self.next_deliver {
                self.deliver_started = true;
                let pkt = self.ext_packets.remove(&first)?;
                self.next_deliver = first.wrapping_add(1);
                return Some(pkt);
            }
            if first < self.next_deliver {
                self.ext_packets.remove(&first);
                continue;
            }
            let head = self.cycles | self.max_seq_no as u32;
            if head.wrapping_sub(self.next_deliver) >= MAX_REORDER {
                let pkt = self.ext_packets.remove(&first)?;
                self.next_deliver = first.wrapping_add(1);
                return Some(pkt);
            }
            return None;
        }
    }

    /// RFC 3550 interval statistics since the previous report.
    fn reception_report(&mut self, media_ssrc: u32, now_ns: i64) -> ReceptionReport {
        let ext_max = self.cycles | self.max_seq_no as u32;
        let expected = ext_max.wrapping_sub(self.base_sn as u32).wrapping_add(1);
        let lost = expected.saturating_sub(self.stats.packet_count);
        self.stats.total_lost = lost.min(0xFFFFFF);

        let expected_interval = expected.saturating_sub(self.last_expected);
        let received_interval = self.stats.packet_count.saturating_sub(self.last_received);
        let lost_interval = expected_interval.saturating_sub(received_interval);
        self.last_expected = expected;
        self.last_received = self.stats.packet_count;
        let fraction_lost = if expected_interval == 0 {
            self.stats.lost_rate = 0.0;
            0
        } else {
            self.stats.lost_rate = lost_interval as f32 / expected_interval as f32;
            ((lost_interval * 256 / expected_interval).min(255)) as u8
        };

        let (last_sender_report, delay) = if self.sr_recv_ns > 0 {
            let dlsr_ns = now_ns.saturating_sub(self.sr_recv_ns);
            (
                (self.sr_ntp >> 16) as u32,
                (dlsr_ns as f64 / 1e9 * 65536.0) as u32,
            )
        } else {
            (0, 0)
        };

        ReceptionReport {
            ssrc: media_ssrc,
            fraction_lost,
            total_lost: self.stats.total_lost,
            last_sequence_number: ext_max,
            jitter: self.stats.jitter as u32,
            last_sender_report,
            delay,
        }
    }
}
