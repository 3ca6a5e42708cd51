use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use tokio::sync::mpsc;
use util::sync::Mutex;

use crate::buffer::{Buffer, RtcpPackets, PACKET_POOL};
use crate::sequencer::PacketMeta;
use crate::track::down_track::DownTrack;
use crate::track::{layer_for_rid, CodecParameters, MediaKind, RemoteTrack};

pub type OnCloseHdlrFn = Box<
    dyn (FnMut() -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync + 'static,
>;

/// Minimum spacing between keyframe requests sent toward the publisher for
/// one receiver.
const PLI_THROTTLE_NS: i64 = 500_000_000;

/// Pending retransmission batches per receiver before new requests are shed.
const RTX_QUEUE_SIZE: usize = 128;

struct RtxJob {
    dt: Arc<DownTrack>,
    metas: Vec<PacketMeta>,
}

/// Per-incoming-track fan-out: owns up to three simulcast layer slots, each
/// with a jitter buffer and an atomically published list of consuming down
/// tracks. One task per active layer reads the buffer in order and writes to
/// every down track; layer switches stage in pending lists and commit on
/// keyframes, the only packets a decoder can join on.
pub struct Receiver {
    peer_id: String,
    track_id: String,
    stream_id: String,
    kind: MediaKind,
    codec: CodecParameters,
    is_simulcast: bool,

    closed: AtomicBool,
    active_layers: AtomicUsize,
    last_pli: AtomicI64,

    available: [AtomicBool; 3],
    pending: [AtomicBool; 3],
    buffers: Mutex<[Option<Arc<Buffer>>; 3]>,
    up_tracks: Mutex<[Option<RemoteTrack>; 3]>,
    down_tracks: [ArcSwap<Vec<Arc<DownTrack>>>; 3],
    /// Guards every list mutation; the fan-out read side never takes it.
    pending_tracks: Mutex<[Vec<Arc<DownTrack>>; 3]>,

    rtcp_tx: mpsc::Sender<RtcpPackets>,
    rtx_tx: Mutex<Option<mpsc::Sender<RtxJob>>>,

    on_close_handler: tokio::sync::Mutex<Option<OnCloseHdlrFn>>,
}

impl Receiver {
    /// track describes the first layer the transport announced; further
    /// simulcast layers arrive through add_up_track.
    pub fn new(peer_id: String, track: &RemoteTrack, rtcp_tx: mpsc::Sender<RtcpPackets>) -> Arc<Self> {
        let receiver = Arc::new(Receiver {
            peer_id,
            track_id: track.id.clone(),
            stream_id: track.stream_id.clone(),
            kind: track.codec.kind(),
            codec: track.codec.clone(),
            is_simulcast: !track.rid.is_empty(),
            closed: AtomicBool::new(false),
            active_layers: AtomicUsize::new(0),
            last_pli: AtomicI64::new(0),
            available: Default::default(),
            pending: Default::default(),
            buffers: Mutex::new([None, None, None]),
            up_tracks: Mutex::new([None, None, None]),
            down_tracks: [
                ArcSwap::from_pointee(Vec::new()),
                ArcSwap::from_pointee(Vec::new()),
                ArcSwap::from_pointee(Vec::new()),
            ],
            pending_tracks: Mutex::new([Vec::new(), Vec::new(), Vec::new()]),
            rtcp_tx,
            rtx_tx: Mutex::new(None),
            on_close_handler: tokio::sync::Mutex::new(None),
        });
        receiver.start_rtx_worker();
        receiver
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn codec(&self) -> &CodecParameters {
        &self.codec
    }

    pub fn is_simulcast(&self) -> bool {
        self.is_simulcast
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn ssrc(&self, layer: usize) -> Option<u32> {
        self.buffers.lock()[layer].as_ref().map(|b| b.media_ssrc())
    }

    pub async fn on_close(&self, f: OnCloseHdlrFn) {
        *self.on_close_handler.lock().await = Some(f);
    }

    /// Attaches one upstream layer and starts its fan-out task. Returns the
    /// slot the RID mapped to, or None for a duplicate announcement.
    pub fn add_up_track(
        self: &Arc<Self>,
        track: RemoteTrack,
        buffer: Arc<Buffer>,
        best_quality_first: bool,
    ) -> Option<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let layer = if self.is_simulcast {
            layer_for_rid(&track.rid)
        } else {
            0
        };
        {
            let mut up_tracks = self.up_tracks.lock();
            if up_tracks[layer].is_some() {
                return None;
            }
            up_tracks[layer] = Some(track);
            self.buffers.lock()[layer] = Some(Arc::clone(&buffer));
        }
        self.available[layer].store(true, Ordering::SeqCst);
        self.active_layers.fetch_add(1, Ordering::SeqCst);

        if self.is_simulcast {
            let max = self.max_available_layer();
            for list in &self.down_tracks {
                for dt in list.load().iter() {
                    dt.set_max_spatial_layer(max);
                    if best_quality_first && (layer as i32) > dt.current_spatial_layer() {
                        let _ = dt.switch_spatial_layer(layer as i32);
                    }
                }
            }
        }

        self.start_fanout(layer, buffer);
        Some(layer)
    }

    /// Subscribes a down track, picking its starting layer. A keyframe is
    /// requested right away so a late joiner gets decodable video promptly.
    pub async fn add_down_track(self: &Arc<Self>, dt: Arc<DownTrack>, best_quality_first: bool) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let layer = {
            let mut lists = self.pending_tracks.lock();
            if self.subscribed(&dt) {
                return;
            }
            let layer = if self.is_simulcast {
                let l = if best_quality_first {
                    self.max_available_layer()
                } else {
                    self.min_available_layer()
                };
                dt.set_initial_layers(l, self.max_available_layer());
                l as usize
            } else {
                dt.set_initial_layers(0, 0);
                0
            };
            self.insert_locked(&mut lists, layer, dt);
            layer
        };
        if self.kind == MediaKind::Video {
            if let Some(ssrc) = self.ssrc(layer) {
                self.send_rtcp(vec![Box::new(PictureLossIndication {
                    sender_ssrc: 0,
                    media_ssrc: ssrc,
                })])
                .await;
            }
        }
    }

    /// Stages a layer move; the fan-out loop of the target layer completes
    /// it at the next keyframe.
    pub fn switch_down_track(self: &Arc<Self>, dt: &Arc<DownTrack>, layer: usize) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut lists = self.pending_tracks.lock();
        lists[layer].push(Arc::clone(dt));
        self.pending[layer].store(true, Ordering::SeqCst);
    }

    /// Snapshot of the down tracks currently fed from one layer slot.
    pub fn down_tracks(&self, layer: usize) -> Vec<Arc<DownTrack>> {
        self.down_tracks[layer].load().iter().cloned().collect()
    }

    pub fn has_spatial_layer(&self, layer: i32) -> bool {
        (0..3).contains(&layer) && self.available[layer as usize].load(Ordering::SeqCst)
    }

    pub fn get_bitrate(&self, layer: usize) -> u64 {
        self.buffers.lock()[layer]
            .as_ref()
            .map(|b| b.bitrate())
            .unwrap_or(0)
    }

    pub fn get_sender_report_time(&self, layer: usize) -> Option<(u32, u64, i64)> {
        self.buffers.lock()[layer]
            .as_ref()
            .and_then(|b| b.sender_report_data())
    }

    /// Forwards RTCP toward the publisher through the router channel.
    /// Keyframe requests are deduplicated across all down tracks.
    pub async fn send_rtcp(&self, pkts: RtcpPackets) {
        if pkts
            .first()
            .map(|p| p.as_any().downcast_ref::<PictureLossIndication>().is_some())
            .unwrap_or(false)
        {
            let now = crate::buffer::unix_ns();
            let last = self.last_pli.load(Ordering::SeqCst);
            if now - last < PLI_THROTTLE_NS {
                return;
            }
            self.last_pli.store(now, Ordering::SeqCst);
        }
        if self.rtcp_tx.send(pkts).await.is_err() {
            log::trace!("receiver {}: rtcp channel closed", self.track_id);
        }
    }

    /// Hands a batch of retransmission requests to the worker; sheds load
    /// when the queue is full, the subscriber will simply nack again.
    pub async fn retransmit_packets(&self, dt: Arc<DownTrack>, metas: Vec<PacketMeta>) {
        let tx = self.rtx_tx.lock().clone();
        if let Some(tx) = tx {
            if tx.try_send(RtxJob { dt, metas }).is_err() {
                log::debug!("receiver {}: rtx queue full", self.track_id);
            }
        }
    }

    /// Tears the receiver down: stops every layer task, closes every down
    /// track, fires the close handler.
    pub async fn close(&self) {
        let buffers = self.buffers.lock().clone();
        for buffer in buffers.into_iter().flatten() {
            buffer.close();
        }
        // Layer tasks observe the closed buffers and run close_internal.
        if self.active_layers.load(Ordering::SeqCst) == 0 {
            self.close_internal().await;
        }
    }

    fn subscribed(&self, dt: &Arc<DownTrack>) -> bool {
        self.down_tracks.iter().any(|list| {
            list.load()
                .iter()
                .any(|d| d.peer_id() == dt.peer_id() && d.id() == dt.id())
        })
    }

    fn max_available_layer(&self) -> i32 {
        (0..3)
            .rev()
            .find(|&l| self.available[l].load(Ordering::SeqCst))
            .unwrap_or(0) as i32
    }

    fn min_available_layer(&self) -> i32 {
        (0..3)
            .find(|&l| self.available[l].load(Ordering::SeqCst))
            .unwrap_or(0) as i32
    }

    fn insert_locked(
        &self,
        _lists: &mut [Vec<Arc<DownTrack>>; 3],
        layer: usize,
        dt: Arc<DownTrack>,
    ) {
        let mut next = (**self.down_tracks[layer].load()).clone();
        next.push(dt);
        self.down_tracks[layer].store(Arc::new(next));
    }

    fn remove_locked(&self, _lists: &mut [Vec<Arc<DownTrack>>; 3], layer: usize, dt: &Arc<DownTrack>) {
        let current = self.down_tracks[layer].load();
        if !current.iter().any(|d| Arc::ptr_eq(d, dt)) {
            return;
        }
        let next: Vec<Arc<DownTrack>> = current
            .iter()
            .filter(|d| !Arc::ptr_eq(d, dt))
            .cloned()
            .collect();
        self.down_tracks[layer].store(Arc::new(next));
    }

    /// Removes a down track from every slot, live and pending.
    pub fn delete_down_track(&self, dt: &Arc<DownTrack>) {
        let mut lists = self.pending_tracks.lock();
        for layer in 0..3 {
            self.remove_locked(&mut lists, layer, dt);
            lists[layer].retain(|d| !Arc::ptr_eq(d, dt));
        }
    }

    fn start_fanout(self: &Arc<Self>, layer: usize, buffer: Arc<Buffer>) {
        let receiver = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let ext = match buffer.read_extended().await {
                    Ok(ext) => ext,
                    Err(_) => break,
                };
                if receiver.closed.load(Ordering::SeqCst) {
                    break;
                }
                if receiver.pending[layer].load(Ordering::SeqCst) {
                    if ext.key_frame {
                        receiver.commit_pending(layer);
                    } else {
                        receiver
                            .send_rtcp(vec![Box::new(PictureLossIndication {
                                sender_ssrc: 0,
                                media_ssrc: buffer.media_ssrc(),
                            })])
                            .await;
                    }
                }
                let snapshot = receiver.down_tracks[layer].load_full();
                for dt in snapshot.iter() {
                    if let Err(err) = dt.write_rtp(&ext, layer).await {
                        if err.is_dying_track() {
                            log::debug!("down track {} is gone: {}", dt.id(), err);
                            receiver.delete_down_track(dt);
                            let dying = Arc::clone(dt);
                            tokio::spawn(async move {
                                dying.close().await;
                            });
                        } else {
                            log::error!("down track {} write failed: {}", dt.id(), err);
                        }
                    }
                }
            }
            if receiver.active_layers.fetch_sub(1, Ordering::SeqCst) == 1 {
                receiver.close_internal().await;
            }
        });
    }

    /// Moves every staged down track into this layer, called on a keyframe.
    fn commit_pending(&self, layer: usize) {
        let moved = {
            let mut lists = self.pending_tracks.lock();
            let moved = std::mem::take(&mut lists[layer]);
            for dt in &moved {
                for l in 0..3 {
                    if l != layer {
                        self.remove_locked(&mut lists, l, dt);
                    }
                }
                self.insert_locked(&mut lists, layer, Arc::clone(dt));
            }
            self.pending[layer].store(false, Ordering::SeqCst);
            moved
        };
        for dt in moved {
            dt.switch_spatial_layer_done(layer as i32);
        }
    }

    async fn close_internal(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Stop accepting retransmit work and let the worker drain out.
        self.rtx_tx.lock().take();
        let buffers = self.buffers.lock().clone();
        for buffer in buffers.into_iter().flatten() {
            buffer.close();
        }
        let mut all = Vec::new();
        {
            let mut lists = self.pending_tracks.lock();
            for layer in 0..3 {
                all.extend(self.down_tracks[layer].load().iter().cloned());
                self.down_tracks[layer].store(Arc::new(Vec::new()));
                lists[layer].clear();
            }
        }
        for dt in all {
            dt.close().await;
        }
        let mut handler = self.on_close_handler.lock().await;
        if let Some(f) = &mut *handler {
            f().await;
        }
    }

    fn start_rtx_worker(self: &Arc<Self>) {
        let (tx, mut rx) = mpsc::channel::<RtxJob>(RTX_QUEUE_SIZE);
        *self.rtx_tx.lock() = Some(tx);
        let receiver = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let receiver = match receiver.upgrade() {
                    Some(r) => r,
                    None => break,
                };
                for meta in &job.metas {
                    let buffer = receiver.buffers.lock()[meta.layer as usize].clone();
                    let Some(buffer) = buffer else { continue };
                    let mut scratch = PACKET_POOL.get();
                    match buffer.get_packet(&mut scratch, meta.source_seq) {
                        Ok(n) => {
                            if let Err(err) = job.dt.write_retransmit(meta, &scratch[..n]).await {
                                log::debug!(
                                    "retransmit seq {} to {}: {}",
                                    meta.target_seq,
                                    job.dt.id(),
                                    err
                                );
                            }
                        }
                        Err(err) => {
                            log::debug!("retransmit seq {} lookup: {}", meta.source_seq, err);
                        }
                    }
                    PACKET_POOL.put(scratch);
                }
            }
        });
    }
}
