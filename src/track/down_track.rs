use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::sender_report::SenderReport;
use rtcp::source_description::{
    SdesType, SourceDescription, SourceDescriptionChunk, SourceDescriptionItem,
};
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use util::marshal::Unmarshal;
use util::sync::Mutex;

use crate::buffer::{unix_ns, ExtPacket, Vp8Meta};
use crate::config::Vp8PictureIdPolicy;
use crate::error::{Error, Result};
use crate::sequencer::{PacketMeta, Sequencer};
use crate::track::receiver::Receiver;
use crate::track::{BindContext, CodecParameters, MediaKind, TrackLocalWriter};

/// Minimum spacing between keyframe requests forwarded upstream for one
/// down track.
const PLI_THROTTLE_NS: i64 = 500_000_000;

/// Hysteresis after a committed layer move.
const SPATIAL_SWITCH_DELAY_NS: i64 = 10_000_000_000;
const TEMPORAL_SWITCH_DELAY_NS: i64 = 3_000_000_000;

pub type OnCloseHdlrFn = Box<
    dyn (FnMut() -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync + 'static,
>;
pub type OnBindHdlrFn = Box<
    dyn (FnMut() -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync + 'static,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownTrackType {
    Simple,
    Simulcast,
}

/// Rewrite bookkeeping, touched on every forwarded packet.
#[derive(Default)]
struct WriteState {
    last_ssrc: u32,
    sn_offset: u16,
    ts_offset: u32,
    last_sn: u16,
    last_ts: u32,
    last_marker: bool,
    last_arrival: i64,
    octet_count: u32,
    packet_count: u32,
    vp8: Vp8MungerState,
}

/// Output PictureID/TL0PICIDX continuity across drops and layer switches.
/// A forwarded packet whose incoming id differs from the previous forwarded
/// one advances the outgoing id by exactly one, so holes never reach the
/// subscriber.
#[derive(Default)]
struct Vp8MungerState {
    started: bool,
    in_pid: u16,
    out_pid: u16,
    in_tl0: u8,
    out_tl0: u8,
    /// Per-SSRC anchors for the assume-continuous policy.
    saved: HashMap<u32, (u16, u16, u8, u8)>,
}

impl Vp8MungerState {
    /// Maps one incoming descriptor to outgoing ids and advances the state.
    fn munge(&mut self, meta: &Vp8Meta) -> (u16, u8) {
        if !self.started {
            self.started = true;
            self.in_pid = meta.picture_id;
            self.in_tl0 = meta.tl0_pic_idx;
            self.out_pid = meta.picture_id;
            self.out_tl0 = meta.tl0_pic_idx;
            return (self.out_pid, self.out_tl0);
        }
        if meta.picture_id_present && meta.picture_id != self.in_pid {
            self.out_pid = (self.out_pid + 1) & 0x7fff;
            self.in_pid = meta.picture_id;
        }
        if meta.tl0_present && meta.tl0_pic_idx != self.in_tl0 {
            self.out_tl0 = self.out_tl0.wrapping_add(1);
            self.in_tl0 = meta.tl0_pic_idx;
        }
        (self.out_pid, self.out_tl0)
    }

    fn anchor(&mut self, old_ssrc: u32, new_ssrc: u32, meta: &Vp8Meta, policy: Vp8PictureIdPolicy) {
        if !self.started {
            return;
        }
        self.saved
            .insert(old_ssrc, (self.in_pid, self.out_pid, self.in_tl0, self.out_tl0));
        if policy == Vp8PictureIdPolicy::AssumeContinuous {
            if let Some((in_pid, out_pid, in_tl0, out_tl0)) = self.saved.get(&new_ssrc).copied() {
                self.in_pid = in_pid;
                self.out_pid = out_pid;
                self.in_tl0 = in_tl0;
                self.out_tl0 = out_tl0;
                return;
            }
        }
        // Fresh anchor: the first packet of the new layer continues right
        // after the last forwarded picture.
        self.in_pid = meta.picture_id.wrapping_sub(1) & 0x7fff;
        self.in_tl0 = meta.tl0_pic_idx.wrapping_sub(1);
    }
}

/// Outgoing track toward one subscriber for one source track. Rewrites
/// SSRC, sequence numbers and timestamps, drives simulcast layer selection,
/// and turns subscriber RTCP back into upstream feedback.
pub struct DownTrack {
    id: String,
    stream_id: String,
    peer_id: String,
    codec: CodecParameters,
    kind: MediaKind,
    typ: DownTrackType,

    ssrc: AtomicU32,
    payload_type: AtomicU8,
    bound: AtomicBool,
    enabled: AtomicBool,
    closed: AtomicBool,
    re_sync: AtomicBool,

    current_spatial_layer: AtomicI32,
    target_spatial_layer: AtomicI32,
    max_spatial_layer: AtomicI32,
    current_temporal_layer: AtomicI32,
    target_temporal_layer: AtomicI32,
    max_temporal_layer: AtomicI32,
    switch_delay_until: AtomicI64,
    temporal_delay_until: AtomicI64,
    last_pli: AtomicI64,

    enable_temporal: bool,
    picture_id_policy: Vp8PictureIdPolicy,

    state: Mutex<WriteState>,
    sequencer: Sequencer,
    receiver: Weak<Receiver>,
    write_stream: Mutex<Option<Arc<dyn TrackLocalWriter>>>,

    on_close_handler: tokio::sync::Mutex<Option<OnCloseHdlrFn>>,
    on_bind_handler: tokio::sync::Mutex<Option<OnBindHdlrFn>>,
}

impl std::fmt::Debug for DownTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("peer_id", &self.peer_id)
            .field("ssrc", &self.ssrc)
            .finish()
    }
}

impl DownTrack {
    pub fn new(
        codec: CodecParameters,
        receiver: Weak<Receiver>,
        peer_id: String,
        id: String,
        stream_id: String,
        typ: DownTrackType,
        enable_temporal: bool,
        picture_id_policy: Vp8PictureIdPolicy,
    ) -> Self {
        let kind = codec.kind();
        DownTrack {
            id,
            stream_id,
            peer_id,
            codec,
            kind,
            typ,
            ssrc: AtomicU32::new(0),
            payload_type: AtomicU8::new(0),
            bound: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            re_sync: AtomicBool::new(kind == MediaKind::Video),
            current_spatial_layer: AtomicI32::new(0),
            target_spatial_layer: AtomicI32::new(0),
            max_spatial_layer: AtomicI32::new(0),
            current_temporal_layer: AtomicI32::new(0),
            target_temporal_layer: AtomicI32::new(0),
            max_temporal_layer: AtomicI32::new(2),
            switch_delay_until: AtomicI64::new(0),
            temporal_delay_until: AtomicI64::new(0),
            last_pli: AtomicI64::new(0),
            enable_temporal,
            picture_id_policy,
            state: Mutex::new(WriteState::default()),
            sequencer: Sequencer::new(),
            receiver,
            write_stream: Mutex::new(None),
            on_close_handler: tokio::sync::Mutex::new(None),
            on_bind_handler: tokio::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn codec(&self) -> &CodecParameters {
        &self.codec
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn track_type(&self) -> DownTrackType {
        self.typ
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc.load(Ordering::Relaxed)
    }

    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::SeqCst)
    }

    pub fn current_spatial_layer(&self) -> i32 {
        self.current_spatial_layer.load(Ordering::Relaxed)
    }

    pub fn target_spatial_layer(&self) -> i32 {
        self.target_spatial_layer.load(Ordering::Relaxed)
    }

    pub fn current_temporal_layer(&self) -> i32 {
        self.current_temporal_layer.load(Ordering::Relaxed)
    }

    pub fn target_temporal_layer(&self) -> i32 {
        self.target_temporal_layer.load(Ordering::Relaxed)
    }

    /// The transport attached the negotiated stream; forwarding can start.
    pub async fn bind(&self, ctx: BindContext) {
        self.ssrc.store(ctx.ssrc, Ordering::SeqCst);
        self.payload_type.store(ctx.payload_type, Ordering::SeqCst);
        *self.write_stream.lock() = Some(ctx.write_stream);
        self.bound.store(true, Ordering::SeqCst);
        let mut handler = self.on_bind_handler.lock().await;
        if let Some(f) = &mut *handler {
            f().await;
        }
    }

    /// Pauses or resumes forwarding without renegotiation. Resuming video
    /// waits for the next keyframe so the subscriber can decode from the
    /// first delivered packet.
    pub fn mute(&self, muted: bool) {
        if self.enabled.swap(!muted, Ordering::SeqCst) != muted {
            return;
        }
        if !muted && self.kind == MediaKind::Video {
            self.re_sync.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn set_initial_layers(&self, spatial: i32, max_spatial: i32) {
        self.current_spatial_layer.store(spatial, Ordering::SeqCst);
        self.target_spatial_layer.store(spatial, Ordering::SeqCst);
        self.max_spatial_layer.store(max_spatial, Ordering::SeqCst);
    }

    pub(crate) fn set_max_spatial_layer(&self, max: i32) {
        self.max_spatial_layer.store(max, Ordering::SeqCst);
    }

    pub fn set_max_temporal_layer(&self, max: i32) {
        self.max_temporal_layer.store(max, Ordering::SeqCst);
    }

    /// Requests a move to another spatial layer. The receiver commits it on
    /// the next keyframe of the target layer.
    pub fn switch_spatial_layer(self: &Arc<Self>, target: i32) -> Result<()> {
        if self.typ != DownTrackType::Simulcast {
            return Err(Error::Other("not a simulcast track".to_owned()));
        }
        let receiver = self.receiver.upgrade().ok_or(Error::ErrIoEof)?;
        if !receiver.has_spatial_layer(target) {
            return Err(Error::Other(format!("spatial layer {target} not available")));
        }
        let current = self.current_spatial_layer.load(Ordering::SeqCst);
        if target == current || target == self.target_spatial_layer.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.target_spatial_layer.store(target, Ordering::SeqCst);
        receiver.switch_down_track(self, target as usize);
        Ok(())
    }

    /// Called by the receiver once the move committed at a keyframe.
    pub(crate) fn switch_spatial_layer_done(&self, layer: i32) {
        self.current_spatial_layer.store(layer, Ordering::SeqCst);
    }

    pub fn switch_temporal_layer(&self, target: i32) {
        if !self.enable_temporal {
            return;
        }
        let max = self.max_temporal_layer.load(Ordering::SeqCst);
        self.target_temporal_layer
            .store(target.clamp(0, max), Ordering::SeqCst);
    }

    /// Forwards one packet read from the receiver's layer fan-out.
    pub(crate) async fn write_rtp(self: &Arc<Self>, ext: &ExtPacket, layer: usize) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ErrClosedPipe);
        }
        if !self.enabled.load(Ordering::SeqCst) || !self.bound.load(Ordering::SeqCst) {
            return Ok(());
        }
        match self.typ {
            DownTrackType::Simple => self.write_simple_rtp(ext).await,
            DownTrackType::Simulcast => self.write_simulcast_rtp(ext, layer).await,
        }
    }

    async fn write_simple_rtp(self: &Arc<Self>, ext: &ExtPacket) -> Result<()> {
        if self.re_sync.load(Ordering::SeqCst) {
            if self.kind == MediaKind::Video && !ext.key_frame {
                self.request_key_frame(ext.packet.header.ssrc).await;
                return Ok(());
            }
            {
                let mut s = self.state.lock();
                if s.packet_count > 0 {
                    s.sn_offset = ext.packet.header.sequence_number.wrapping_sub(s.last_sn).wrapping_sub(1);
                    s.ts_offset = ext.packet.header.timestamp.wrapping_sub(s.last_ts).wrapping_sub(1);
                }
                s.last_ssrc = ext.packet.header.ssrc;
            }
            self.re_sync.store(false, Ordering::SeqCst);
        }

        let (new_sn, new_ts) = {
            let mut s = self.state.lock();
            if s.last_ssrc == 0 {
                s.last_ssrc = ext.packet.header.ssrc;
            }
            let new_sn = ext.packet.header.sequence_number.wrapping_sub(s.sn_offset);
            let new_ts = ext.packet.header.timestamp.wrapping_sub(s.ts_offset);
            s.octet_count += ext.packet.payload.len() as u32;
            s.packet_count += 1;
            if ext.head {
                s.last_sn = new_sn;
                s.last_ts = new_ts;
                s.last_marker = ext.packet.header.marker;
            }
            (new_sn, new_ts)
        };
        self.sequencer.push(PacketMeta {
            source_seq: ext.packet.header.sequence_number,
            target_seq: new_sn,
            timestamp: new_ts,
            layer: 0,
            ..Default::default()
        });
        self.forward(ext, new_sn, new_ts, None).await
    }

    async fn write_simulcast_rtp(self: &Arc<Self>, ext: &ExtPacket, layer: usize) -> Result<()> {
        let csl = self.current_spatial_layer.load(Ordering::SeqCst);
        if csl != layer as i32 {
            // Not our layer; the receiver is still staging the switch.
            return Ok(());
        }

        let src_ssrc = ext.packet.header.ssrc;
        let needs_anchor = {
            let s = self.state.lock();
            s.last_ssrc != src_ssrc
        };
        if needs_anchor {
            // The source behind this track changed, only a keyframe gives
            // the decoder a clean entry point.
            if !ext.key_frame {
                self.request_key_frame(src_ssrc).await;
                return Ok(());
            }
            let mut s = self.state.lock();
            let old_ssrc = s.last_ssrc;
            if s.packet_count > 0 {
                s.sn_offset = ext.packet.header.sequence_number.wrapping_sub(s.last_sn).wrapping_sub(1);
                let elapsed = ext.arrival.saturating_sub(s.last_arrival).max(0);
                let ts_jump =
                    (elapsed as i128 * self.codec.clock_rate as i128 / 1_000_000_000).max(1) as u32;
                s.ts_offset = ext
                    .packet
                    .header
                    .timestamp
                    .wrapping_sub(s.last_ts.wrapping_add(ts_jump));
            }
            if let Some(meta) = &ext.vp8 {
                s.vp8.anchor(old_ssrc, src_ssrc, meta, self.picture_id_policy);
            }
            s.last_ssrc = src_ssrc;
            self.re_sync.store(false, Ordering::SeqCst);
        } else if self.re_sync.load(Ordering::SeqCst) {
            if !ext.key_frame {
                self.request_key_frame(src_ssrc).await;
                return Ok(());
            }
            self.re_sync.store(false, Ordering::SeqCst);
        }

        // Temporal layer handling, VP8 only.
        let mut vp8_rewrite = None;
        if let Some(meta) = &ext.vp8 {
            if self.enable_temporal && meta.tid_present {
                let ttl = self.target_temporal_layer.load(Ordering::SeqCst);
                let mut ctl = self.current_temporal_layer.load(Ordering::SeqCst);
                if ttl != ctl && meta.layer_sync && (meta.tid as i32) <= ttl {
                    self.current_temporal_layer.store(ttl, Ordering::SeqCst);
                    ctl = ttl;
                }
                if (meta.tid as i32) > ctl {
                    // Dropped: close the gap so the output stays contiguous.
                    let mut s = self.state.lock();
                    s.sn_offset = s.sn_offset.wrapping_add(1);
                    return Ok(());
                }
            }
            if meta.picture_id_present || meta.tl0_present {
                let mut s = self.state.lock();
                vp8_rewrite = Some(s.vp8.munge(meta));
            }
        }

        let (new_sn, new_ts) = {
            let mut s = self.state.lock();
            let new_sn = ext.packet.header.sequence_number.wrapping_sub(s.sn_offset);
            let new_ts = ext.packet.header.timestamp.wrapping_sub(s.ts_offset);
            s.octet_count += ext.packet.payload.len() as u32;
            s.packet_count += 1;
            if ext.head {
                s.last_sn = new_sn;
                s.last_ts = new_ts;
                s.last_marker = ext.packet.header.marker;
                s.last_arrival = ext.arrival;
            }
            (new_sn, new_ts)
        };

        let (pid, tl0) = vp8_rewrite.unwrap_or_default();
        self.sequencer.push(PacketMeta {
            source_seq: ext.packet.header.sequence_number,
            target_seq: new_sn,
            timestamp: new_ts,
            layer: layer as u8,
            temporal_supported: vp8_rewrite.is_some(),
            picture_id: pid,
            tl0_pic_idx: tl0,
        });
        self.forward(ext, new_sn, new_ts, vp8_rewrite.map(|r| (r, ext.vp8.unwrap())))
            .await
    }

    async fn forward(
        &self,
        ext: &ExtPacket,
        new_sn: u16,
        new_ts: u32,
        vp8: Option<((u16, u8), Vp8Meta)>,
    ) -> Result<()> {
        let mut header = ext.packet.header.clone();
        header.ssrc = self.ssrc.load(Ordering::Relaxed);
        header.payload_type = self.payload_type.load(Ordering::Relaxed);
        header.sequence_number = new_sn;
        header.timestamp = new_ts;

        let payload = match vp8 {
            Some(((pid, tl0), meta)) => {
                let mut buf = BytesMut::from(&ext.packet.payload[..]);
                crate::buffer::rewrite_vp8(&mut buf, &meta, pid, tl0);
                buf.freeze()
            }
            None => ext.packet.payload.clone(),
        };

        let stream = self.write_stream.lock().clone();
        match stream {
            Some(stream) => {
                stream
                    .write_rtp(&rtp::packet::Packet { header, payload })
                    .await
                    .map(|_| ())
            }
            None => Err(Error::ErrBindFailed),
        }
    }

    /// Serves a retransmission request the receiver's worker resolved from
    /// the bucket, reapplying exactly the rewrite the original forward used.
    pub(crate) async fn write_retransmit(&self, meta: &PacketMeta, raw: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) || !self.bound.load(Ordering::SeqCst) {
            return Err(Error::ErrClosedPipe);
        }
        let mut buf = raw;
        let mut pkt = rtp::packet::Packet::unmarshal(&mut buf).map_err(Error::Util)?;
        pkt.header.ssrc = self.ssrc.load(Ordering::Relaxed);
        pkt.header.payload_type = self.payload_type.load(Ordering::Relaxed);
        pkt.header.sequence_number = meta.target_seq;
        pkt.header.timestamp = meta.timestamp;
        if meta.temporal_supported {
            if let Ok(desc) = crate::buffer::parse_vp8(&pkt.payload) {
                let mut payload = BytesMut::from(&pkt.payload[..]);
                crate::buffer::rewrite_vp8(&mut payload, &desc, meta.picture_id, meta.tl0_pic_idx);
                pkt.payload = payload.freeze();
            }
        }
        let stream = self.write_stream.lock().clone().ok_or(Error::ErrBindFailed)?;
        stream.write_rtp(&pkt).await.map(|_| ())
    }

    /// Subscriber RTCP entry point.
    pub async fn handle_rtcp(self: &Arc<Self>, raw: &[u8]) -> Result<()> {
        if !self.bound.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut buf = raw;
        let pkts = rtcp::packet::unmarshal(&mut buf).map_err(Error::Rtcp)?;

        let mut fwd: crate::buffer::RtcpPackets = Vec::new();
        let mut max_rate_packet_loss = 0u8;
        let mut expected_min_bitrate = 0u64;

        let upstream_ssrc = self.state.lock().last_ssrc;
        let local_ssrc = self.ssrc.load(Ordering::Relaxed);

        for pkt in pkts {
            let any = pkt.as_any();
            if any.downcast_ref::<PictureLossIndication>().is_some() {
                if self.should_send_pli() {
                    fwd.push(Box::new(PictureLossIndication {
                        sender_ssrc: local_ssrc,
                        media_ssrc: upstream_ssrc,
                    }));
                }
            } else if let Some(fir) = any.downcast_ref::<FullIntraRequest>() {
                if self.should_send_pli() {
                    let mut fir = fir.clone();
                    fir.media_ssrc = upstream_ssrc;
                    fir.sender_ssrc = local_ssrc;
                    fwd.push(Box::new(fir));
                }
            } else if let Some(remb) =
                any.downcast_ref::<rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate>()
            {
                let br = remb.bitrate as u64;
                if expected_min_bitrate == 0 || br < expected_min_bitrate {
                    expected_min_bitrate = br;
                }
            } else if let Some(rr) = any.downcast_ref::<rtcp::receiver_report::ReceiverReport>() {
                for report in &rr.reports {
                    if report.ssrc == local_ssrc && report.fraction_lost > max_rate_packet_loss {
                        max_rate_packet_loss = report.fraction_lost;
                    }
                }
            } else if let Some(nack) = any.downcast_ref::<TransportLayerNack>() {
                let mut seqs = Vec::new();
                for pair in &nack.nacks {
                    seqs.extend(pair.packet_list());
                }
                let metas = self.sequencer.get_meta(&seqs);
                if !metas.is_empty() {
                    if let Some(receiver) = self.receiver.upgrade() {
                        receiver.retransmit_packets(Arc::clone(self), metas).await;
                    }
                }
            }
        }

        if self.typ == DownTrackType::Simulcast
            && (max_rate_packet_loss != 0 || expected_min_bitrate != 0)
        {
            self.handle_layer_change(max_rate_packet_loss, expected_min_bitrate);
        }

        if !fwd.is_empty() {
            if let Some(receiver) = self.receiver.upgrade() {
                receiver.send_rtcp(fwd).await;
            }
        }
        Ok(())
    }

    /// Loss- and bandwidth-driven layer selection; actual spatial moves are
    /// staged through the receiver and commit on a keyframe.
    fn handle_layer_change(self: &Arc<Self>, max_rate_packet_loss: u8, expected_min_bitrate: u64) {
        let now = unix_ns();
        let csl = self.current_spatial_layer.load(Ordering::SeqCst);
        let tsl = self.target_spatial_layer.load(Ordering::SeqCst);
        let receiver = match self.receiver.upgrade() {
            Some(r) => r,
            None => return,
        };

        if csl == tsl && now > self.switch_delay_until.load(Ordering::SeqCst) {
            // fraction_lost is u8/256: 64 is 25 %, 13 is 5 %.
            if max_rate_packet_loss >= 64 && csl > 0 {
                if self.switch_spatial_layer(csl - 1).is_ok() {
                    self.switch_delay_until
                        .store(now + SPATIAL_SWITCH_DELAY_NS, Ordering::SeqCst);
                }
            } else if max_rate_packet_loss <= 13
                && csl < self.max_spatial_layer.load(Ordering::SeqCst)
                && receiver.has_spatial_layer(csl + 1)
                && expected_min_bitrate >= receiver.get_bitrate(csl as usize) * 3 / 2
            {
                if self.switch_spatial_layer(csl + 1).is_ok() {
                    self.switch_delay_until
                        .store(now + SPATIAL_SWITCH_DELAY_NS, Ordering::SeqCst);
                }
            }
        }

        if self.enable_temporal && now > self.temporal_delay_until.load(Ordering::SeqCst) {
            let ctl = self.current_temporal_layer.load(Ordering::SeqCst);
            let mtl = self.max_temporal_layer.load(Ordering::SeqCst);
            if max_rate_packet_loss >= 64 && ctl > 0 {
                self.switch_temporal_layer(ctl - 1);
                self.temporal_delay_until
                    .store(now + TEMPORAL_SWITCH_DELAY_NS, Ordering::SeqCst);
            } else if max_rate_packet_loss <= 13 && ctl < mtl {
                self.switch_temporal_layer(ctl + 1);
                self.temporal_delay_until
                    .store(now + TEMPORAL_SWITCH_DELAY_NS, Ordering::SeqCst);
            }
        }
    }

    fn should_send_pli(&self) -> bool {
        let now = unix_ns();
        let last = self.last_pli.load(Ordering::SeqCst);
        if now - last < PLI_THROTTLE_NS {
            return false;
        }
        self.last_pli
            .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    async fn request_key_frame(&self, media_ssrc: u32) {
        if !self.should_send_pli() {
            return;
        }
        if let Some(receiver) = self.receiver.upgrade() {
            receiver
                .send_rtcp(vec![Box::new(PictureLossIndication {
                    sender_ssrc: self.ssrc.load(Ordering::Relaxed),
                    media_ssrc,
                })])
                .await;
        }
    }

    /// Sender report for the subscriber leg, extrapolated from the upstream
    /// report the receiver last saw on the forwarded layer.
    pub fn create_sender_report(&self) -> Option<SenderReport> {
        if !self.bound.load(Ordering::SeqCst) {
            return None;
        }
        let receiver = self.receiver.upgrade()?;
        let layer = match self.typ {
            DownTrackType::Simple => 0,
            DownTrackType::Simulcast => self.current_spatial_layer.load(Ordering::SeqCst) as usize,
        };
        let (sr_rtp, sr_ntp, recv_ns) = receiver.get_sender_report_time(layer)?;
        let elapsed_ns = (unix_ns() - recv_ns).max(0);

        let (ts_offset, octet_count, packet_count) = {
            let s = self.state.lock();
            (s.ts_offset, s.octet_count, s.packet_count)
        };
        let rtp_now = sr_rtp
            .wrapping_add((elapsed_ns as i128 * self.codec.clock_rate as i128 / 1_000_000_000) as u32)
            .wrapping_sub(ts_offset);
        let ntp_now = sr_ntp.wrapping_add((((elapsed_ns as u128) << 32) / 1_000_000_000) as u64);

        Some(SenderReport {
            ssrc: self.ssrc.load(Ordering::Relaxed),
            ntp_time: ntp_now,
            rtp_time: rtp_now,
            packet_count,
            octet_count,
            ..Default::default()
        })
    }

    /// SDES CNAME chunk advertising the stream this track belongs to.
    pub fn create_source_description_chunk(&self) -> SourceDescriptionChunk {
        SourceDescriptionChunk {
            source: self.ssrc.load(Ordering::Relaxed),
            items: vec![SourceDescriptionItem {
                sdes_type: SdesType::SdesCname,
                text: Bytes::copy_from_slice(self.stream_id.as_bytes()),
            }],
        }
    }

    pub fn create_source_description(&self) -> SourceDescription {
        SourceDescription {
            chunks: vec![self.create_source_description_chunk()],
        }
    }

    pub async fn on_close(&self, f: OnCloseHdlrFn) {
        *self.on_close_handler.lock().await = Some(f);
    }

    pub async fn on_bind(&self, f: OnBindHdlrFn) {
        *self.on_bind_handler.lock().await = Some(f);
    }

    /// Idempotent close; fires the close handler exactly once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut handler = self.on_close_handler.lock().await;
        if let Some(f) = &mut *handler {
            f().await;
        }
    }
}
