use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use util::sync::Mutex;

use crate::audio_observer::AudioObserver;
use crate::buffer::{BufferOptions, Factory, RtcpPackets};
use crate::config::RouterConfig;
use crate::error::Result;
use crate::stats::StatsCollector;
use crate::subscriber::Subscriber;
use crate::track::down_track::{DownTrack, DownTrackType};
use crate::track::receiver::Receiver;
use crate::track::{MediaKind, RemoteTrack, RtcpWriter};
use crate::twcc::Responder;

/// RTCP batches queued toward the publisher before producers block.
const RTCP_CHANNEL_SIZE: usize = 10;

/// Per-publisher routing hub: owns the track receivers, the RTCP fan-in
/// channel toward the publisher transport, and the transport-wide CC
/// responder shared by all of the publisher's video streams.
pub struct Router {
    id: String,
    config: RouterConfig,
    factory: Arc<Factory>,
    stopped: AtomicBool,
    stop_notify: Arc<Notify>,

    receivers: Mutex<HashMap<String, Arc<Receiver>>>,
    rtcp_tx: mpsc::Sender<RtcpPackets>,
    twcc: Mutex<Option<Arc<Responder>>>,
    audio_observer: Arc<AudioObserver>,
    audio_streams: Mutex<Vec<String>>,
    stats: Option<Arc<StatsCollector>>,
}

impl Router {
    pub fn new(
        id: String,
        factory: Arc<Factory>,
        config: RouterConfig,
        rtcp_writer: Arc<dyn RtcpWriter>,
        audio_observer: Arc<AudioObserver>,
    ) -> Arc<Self> {
        let (rtcp_tx, mut rtcp_rx) = mpsc::channel::<RtcpPackets>(RTCP_CHANNEL_SIZE);
        let stop_notify = Arc::new(Notify::new());
        let stats = config.with_stats.then(|| Arc::new(StatsCollector::new()));

        let stop = Arc::clone(&stop_notify);
        let router_id = id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    pkts = rtcp_rx.recv() => match pkts {
                        Some(pkts) => {
                            if let Err(err) = rtcp_writer.write_rtcp(&pkts).await {
                                log::error!("router {router_id}: write rtcp: {err}");
                            }
                        }
                        None => return,
                    },
                    _ = stop.notified() => return,
                }
            }
        });

        Arc::new(Router {
            id,
            config,
            factory,
            stopped: AtomicBool::new(false),
            stop_notify,
            receivers: Mutex::new(HashMap::new()),
            rtcp_tx,
            twcc: Mutex::new(None),
            audio_observer,
            audio_streams: Mutex::new(Vec::new()),
            stats,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn stats(&self) -> Option<&Arc<StatsCollector>> {
        self.stats.as_ref()
    }

    pub fn get_receiver(&self, track_id: &str) -> Option<Arc<Receiver>> {
        self.receivers.lock().get(track_id).cloned()
    }

    pub fn receivers(&self) -> Vec<Arc<Receiver>> {
        self.receivers.lock().values().cloned().collect()
    }

    /// Wires one announced upstream stream: allocates its buffer pair,
    /// installs the feedback hooks, and attaches it to the track's receiver,
    /// creating the receiver on first sight. The caller publishes the
    /// receiver to the session when created is true.
    pub async fn add_receiver(self: &Arc<Self>, track: RemoteTrack) -> (Arc<Receiver>, bool) {
        let (buffer, rtcp_reader) = self.factory.get_or_new(track.ssrc);

        // Feedback produced by the buffer flows into the publisher channel.
        let tx = self.rtcp_tx.clone();
        buffer
            .on_feedback(Box::new(move |pkts| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(pkts).await;
                })
            }))
            .await;

        match track.codec.kind() {
            MediaKind::Audio => {
                let observer = Arc::clone(&self.audio_observer);
                let stream_id = track.stream_id.clone();
                observer.add_stream(stream_id.clone());
                self.audio_streams.lock().push(stream_id.clone());
                buffer.on_audio_level(Box::new(move |voice, level| {
                    if voice {
                        observer.observe(&stream_id, level);
                    }
                }));
            }
            MediaKind::Video => {
                let responder = {
                    let mut twcc = self.twcc.lock();
                    match &*twcc {
                        Some(r) => Arc::clone(r),
                        None => {
                            let r = Arc::new(Responder::new(track.ssrc));
                            let tx = self.rtcp_tx.clone();
                            r.on_feedback(Box::new(move |pkt| {
                                if tx.try_send(vec![pkt]).is_err() {
                                    log::debug!("twcc feedback dropped, channel full");
                                }
                            }));
                            *twcc = Some(Arc::clone(&r));
                            r
                        }
                    }
                };
                buffer.on_transport_wide_cc(Box::new(move |sn, time_ns, marker| {
                    responder.push(sn, time_ns, marker);
                }));
            }
        }

        // Sender reports from the publisher feed A/V sync and, when stats
        // are on, the drift accounting.
        {
            let buffer = Arc::clone(&buffer);
            let stats = self.stats.clone();
            let ssrc = track.ssrc;
            if let Some(stats) = &stats {
                stats.add_stream(ssrc, track.codec.kind(), track.codec.clock_rate, Arc::clone(&buffer));
            }
            rtcp_reader.on_packet(Box::new(move |raw| {
                let mut buf = raw;
                let pkts = match rtcp::packet::unmarshal(&mut buf) {
                    Ok(pkts) => pkts,
                    Err(err) => {
                        log::debug!("ssrc {ssrc}: bad rtcp from publisher: {err}");
                        return;
                    }
                };
                for pkt in pkts {
                    let any = pkt.as_any();
                    if let Some(sr) = any.downcast_ref::<rtcp::sender_report::SenderReport>() {
                        buffer.set_sender_report_data(sr.rtp_time, sr.ntp_time);
                        if let Some(stats) = &stats {
                            stats.on_sender_report(ssrc, sr.ntp_time, sr.rtp_time);
                        }
                    } else if let Some(sdes) =
                        any.downcast_ref::<rtcp::source_description::SourceDescription>()
                    {
                        if let Some(stats) = &stats {
                            for chunk in &sdes.chunks {
                                for item in &chunk.items {
                                    if item.sdes_type
                                        == rtcp::source_description::SdesType::SdesCname
                                    {
                                        stats.set_cname(
                                            chunk.source,
                                            String::from_utf8_lossy(&item.text).into_owned(),
                                        );
                                    }
                                }
                            }
                        }
                    }
                }
            }));
        }

        buffer.bind(
            &track.codec,
            BufferOptions {
                max_bitrate: self.config.max_bandwidth * 1000,
                max_packet_track: self.config.max_packet_track,
            },
        );

        let (receiver, created) = {
            let mut receivers = self.receivers.lock();
            match receivers.get(&track.id) {
                Some(r) => (Arc::clone(r), false),
                None => {
                    let r = Receiver::new(self.id.clone(), &track, self.rtcp_tx.clone());
                    receivers.insert(track.id.clone(), Arc::clone(&r));
                    (r, true)
                }
            }
        };
        if created {
            let router = Arc::downgrade(self);
            let track_id = track.id.clone();
            let recv = Arc::downgrade(&receiver);
            receiver
                .on_close(Box::new(move || {
                    let router = router.clone();
                    let track_id = track_id.clone();
                    let recv = recv.clone();
                    Box::pin(async move {
                        let Some(router) = router.upgrade() else { return };
                        router.receivers.lock().remove(&track_id);
                        if let (Some(recv), Some(stats)) = (recv.upgrade(), &router.stats) {
                            for layer in 0..3 {
                                if let Some(ssrc) = recv.ssrc(layer) {
                                    stats.remove_stream(ssrc);
                                }
                            }
                        }
                    })
                }))
                .await;
        }
        receiver.add_up_track(track, buffer, self.config.simulcast.best_quality_first);
        (receiver, created)
    }

    /// Subscribes a subscriber to one receiver, or to everything this
    /// router publishes. Renegotiation fires once at the end, not per track.
    pub async fn add_down_tracks(
        self: &Arc<Self>,
        subscriber: &Arc<Subscriber>,
        recv: Option<Arc<Receiver>>,
    ) -> Result<()> {
        if subscriber.no_auto_subscribe() {
            return Ok(());
        }
        let mut added = false;
        match recv {
            Some(recv) => {
                added |= self.add_down_track(subscriber, recv).await?.is_some();
            }
            None => {
                for recv in self.receivers() {
                    added |= self.add_down_track(subscriber, recv).await?.is_some();
                }
            }
        }
        if added {
            subscriber.negotiate();
        }
        Ok(())
    }

    /// Creates (or returns the existing) down track binding one subscriber
    /// to one receiver. Idempotent per (stream id, track id).
    pub async fn add_down_track(
        self: &Arc<Self>,
        subscriber: &Arc<Subscriber>,
        recv: Arc<Receiver>,
    ) -> Result<Option<Arc<DownTrack>>> {
        if let Some(existing) = subscriber.get_down_track(recv.stream_id(), recv.track_id()) {
            return Ok(Some(existing));
        }

        let typ = if recv.is_simulcast() {
            DownTrackType::Simulcast
        } else {
            DownTrackType::Simple
        };
        let dt = Arc::new(DownTrack::new(
            recv.codec().clone(),
            Arc::downgrade(&recv),
            subscriber.id().to_owned(),
            recv.track_id().to_owned(),
            recv.stream_id().to_owned(),
            typ,
            self.config.simulcast.enable_temporal_layer,
            self.config.simulcast.picture_id_policy,
        ));

        // Close discipline: leave both owners and renegotiate the
        // subscriber, whichever side initiated the close.
        {
            let subscriber_weak = Arc::downgrade(subscriber);
            let recv_weak = Arc::downgrade(&recv);
            let dt_weak = Arc::downgrade(&dt);
            dt.on_close(Box::new(move || {
                let subscriber_weak = subscriber_weak.clone();
                let recv_weak = recv_weak.clone();
                let dt_weak = dt_weak.clone();
                Box::pin(async move {
                    let Some(dt) = dt_weak.upgrade() else { return };
                    if let Some(recv) = recv_weak.upgrade() {
                        recv.delete_down_track(&dt);
                    }
                    if let Some(subscriber) = subscriber_weak.upgrade() {
                        subscriber.remove_down_track(&dt);
                        subscriber.negotiate();
                    }
                })
            }))
            .await;
        }

        subscriber.add_down_track(Arc::clone(&dt)).await;
        recv.add_down_track(Arc::clone(&dt), self.config.simulcast.best_quality_first)
            .await;
        Ok(Some(dt))
    }

    /// Stops the RTCP drain and tears down every receiver.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(twcc) = self.twcc.lock().as_ref() {
            twcc.flush();
        }
        let receivers: Vec<Arc<Receiver>> = {
            let mut map = self.receivers.lock();
            map.drain().map(|(_, r)| r).collect()
        };
        for r in receivers {
            r.close().await;
        }
        for stream_id in self.audio_streams.lock().drain(..) {
            self.audio_observer.remove_stream(&stream_id);
        }
        self.stop_notify.notify_waiters();
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.stop_notify.notify_waiters();
    }
}
