use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use util::sync::Mutex;

use crate::buffer::RtcpPackets;
use crate::track::down_track::DownTrack;
use crate::track::RtcpWriter;

/// Joins and leaves arrive in bursts; one renegotiation covers them all.
const NEGOTIATE_DEBOUNCE: Duration = Duration::from_millis(250);

/// Sender report cadence toward the subscriber.
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

pub type OnNegotiateHdlrFn = Box<
    dyn (FnMut() -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync + 'static,
>;
pub type OnAddDownTrackHdlrFn = Box<
    dyn (FnMut(Arc<DownTrack>) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>)
        + Send
        + Sync
        + 'static,
>;

/// Subscriber half of a peer: the down tracks it consumes, keyed by stream
/// id, with renegotiation coalesced behind a debounce timer.
pub struct Subscriber {
    id: String,
    no_auto_subscribe: bool,
    closed: AtomicBool,

    tracks: Mutex<HashMap<String, Vec<Arc<DownTrack>>>>,
    rtcp_writer: Arc<dyn RtcpWriter>,
    negotiate_notify: Arc<Notify>,

    on_negotiate_handler: Arc<tokio::sync::Mutex<Option<OnNegotiateHdlrFn>>>,
    on_add_down_track_handler: tokio::sync::Mutex<Option<OnAddDownTrackHdlrFn>>,
}

impl Subscriber {
    pub fn new(id: String, rtcp_writer: Arc<dyn RtcpWriter>, no_auto_subscribe: bool) -> Arc<Self> {
        let subscriber = Arc::new(Subscriber {
            id,
            no_auto_subscribe,
            closed: AtomicBool::new(false),
            tracks: Mutex::new(HashMap::new()),
            rtcp_writer,
            negotiate_notify: Arc::new(Notify::new()),
            on_negotiate_handler: Arc::new(tokio::sync::Mutex::new(None)),
            on_add_down_track_handler: tokio::sync::Mutex::new(None),
        });
        subscriber.start_debounce_task();
        subscriber.start_reports_task();
        subscriber
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn no_auto_subscribe(&self) -> bool {
        self.no_auto_subscribe
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn on_negotiate(&self, f: OnNegotiateHdlrFn) {
        *self.on_negotiate_handler.lock().await = Some(f);
    }

    /// Installed by the transport; responsible for adding the sendonly
    /// transceiver and eventually binding the down track.
    pub async fn on_add_down_track(&self, f: OnAddDownTrackHdlrFn) {
        *self.on_add_down_track_handler.lock().await = Some(f);
    }

    /// Requests an SDP renegotiation; bursts collapse into one round.
    pub fn negotiate(&self) {
        if !self.closed.load(Ordering::SeqCst) {
            self.negotiate_notify.notify_one();
        }
    }

    pub async fn add_down_track(self: &Arc<Self>, dt: Arc<DownTrack>) {
        {
            let mut tracks = self.tracks.lock();
            tracks
                .entry(dt.stream_id().to_owned())
                .or_default()
                .push(Arc::clone(&dt));
        }
        let mut handler = self.on_add_down_track_handler.lock().await;
        if let Some(f) = &mut *handler {
            f(dt).await;
        }
    }

    pub fn remove_down_track(&self, dt: &Arc<DownTrack>) {
        let mut tracks = self.tracks.lock();
        if let Some(list) = tracks.get_mut(dt.stream_id()) {
            list.retain(|d| !Arc::ptr_eq(d, dt));
            if list.is_empty() {
                tracks.remove(dt.stream_id());
            }
        }
    }

    pub fn get_down_track(&self, stream_id: &str, track_id: &str) -> Option<Arc<DownTrack>> {
        self.tracks
            .lock()
            .get(stream_id)?
            .iter()
            .find(|d| d.id() == track_id)
            .cloned()
    }

    pub fn get_down_track_by_ssrc(&self, ssrc: u32) -> Option<Arc<DownTrack>> {
        self.tracks
            .lock()
            .values()
            .flatten()
            .find(|d| d.ssrc() == ssrc)
            .cloned()
    }

    pub fn down_tracks(&self) -> Vec<Arc<DownTrack>> {
        self.tracks.lock().values().flatten().cloned().collect()
    }

    /// RTCP arriving from the subscribing client, routed to the down track
    /// it concerns.
    pub async fn handle_rtcp(&self, ssrc: u32, raw: &[u8]) -> crate::error::Result<()> {
        match self.get_down_track_by_ssrc(ssrc) {
            Some(dt) => dt.handle_rtcp(raw).await,
            None => Ok(()),
        }
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.negotiate_notify.notify_waiters();
        for dt in self.down_tracks() {
            dt.close().await;
        }
    }

    fn start_debounce_task(self: &Arc<Self>) {
        let subscriber = Arc::downgrade(self);
        let notify = Arc::clone(&self.negotiate_notify);
        tokio::spawn(async move {
            loop {
                notify.notified().await;
                {
                    let Some(s) = subscriber.upgrade() else { return };
                    if s.is_closed() {
                        return;
                    }
                }
                tokio::time::sleep(NEGOTIATE_DEBOUNCE).await;
                let Some(s) = subscriber.upgrade() else { return };
                if s.is_closed() {
                    return;
                }
                let mut handler = s.on_negotiate_handler.lock().await;
                if let Some(f) = &mut *handler {
                    f().await;
                }
            }
        });
    }

    /// Sender reports and SDES for every bound down track, every five
    /// seconds, so subscribers can lip-sync and identify streams.
    fn start_reports_task(self: &Arc<Self>) {
        let subscriber = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(REPORT_INTERVAL).await;
                let Some(s) = subscriber.upgrade() else { return };
                if s.is_closed() {
                    return;
                }
                let mut pkts: RtcpPackets = Vec::new();
                let mut chunks = Vec::new();
                for dt in s.down_tracks() {
                    if !dt.is_bound() {
                        continue;
                    }
                    if let Some(sr) = dt.create_sender_report() {
                        pkts.push(Box::new(sr));
                        chunks.push(dt.create_source_description_chunk());
                    }
                }
                if pkts.is_empty() {
                    continue;
                }
                pkts.push(Box::new(rtcp::source_description::SourceDescription {
                    chunks,
                }));
                if let Err(err) = s.rtcp_writer.write_rtcp(&pkts).await {
                    log::debug!("subscriber {}: reports: {}", s.id, err);
                }
            }
        });
    }
}
