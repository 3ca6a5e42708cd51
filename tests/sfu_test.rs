use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use util::marshal::Marshal;
use util::sync::Mutex;

use sfu::peer::Peer;
use sfu::track::{
    BindContext, CodecParameters, RemoteTrack, RtcpFeedback, RtcpWriter, TrackLocalWriter,
};
use sfu::{Result, RouterConfig, Sfu};

#[derive(Debug)]
struct MockRtcpWriter {
    batches: Mutex<Vec<usize>>,
}

impl MockRtcpWriter {
    fn new() -> Arc<Self> {
        Arc::new(MockRtcpWriter {
            batches: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl RtcpWriter for MockRtcpWriter {
    async fn write_rtcp(
        &self,
        pkts: &[Box<dyn rtcp::packet::Packet + Send + Sync>],
    ) -> Result<usize> {
        self.batches.lock().push(pkts.len());
        Ok(pkts.len())
    }
}

#[derive(Debug)]
struct MockTrackWriter {
    packets: Mutex<Vec<rtp::packet::Packet>>,
}

impl MockTrackWriter {
    fn new() -> Arc<Self> {
        Arc::new(MockTrackWriter {
            packets: Mutex::new(Vec::new()),
        })
    }

    fn written(&self) -> Vec<rtp::packet::Packet> {
        self.packets.lock().clone()
    }
}

#[async_trait]
impl TrackLocalWriter for MockTrackWriter {
    async fn write_rtp(&self, p: &rtp::packet::Packet) -> Result<usize> {
        self.packets.lock().push(p.clone());
        Ok(p.payload.len())
    }

    async fn write(&self, b: &[u8]) -> Result<usize> {
        Ok(b.len())
    }
}

/// Transport stand-in for one subscriber: binds every added down track to a
/// mock writer and counts negotiation rounds.
struct SubscriberHarness {
    writers: Arc<Mutex<Vec<(String, Arc<MockTrackWriter>)>>>,
    negotiations: Arc<AtomicUsize>,
    added: Arc<AtomicUsize>,
}

impl SubscriberHarness {
    async fn install(peer: &Arc<Peer>) -> Self {
        let writers: Arc<Mutex<Vec<(String, Arc<MockTrackWriter>)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let negotiations = Arc::new(AtomicUsize::new(0));
        let added = Arc::new(AtomicUsize::new(0));

        let writers_in = Arc::clone(&writers);
        let added_in = Arc::clone(&added);
        peer.subscriber()
            .on_add_down_track(Box::new(move |dt| {
                let writers = Arc::clone(&writers_in);
                let added = Arc::clone(&added_in);
                Box::pin(async move {
                    let n = added.fetch_add(1, Ordering::SeqCst);
                    let writer = MockTrackWriter::new();
                    writers.lock().push((dt.id().to_owned(), Arc::clone(&writer)));
                    dt.bind(BindContext {
                        ssrc: 50_000 + n as u32,
                        payload_type: 102,
                        write_stream: writer,
                    })
                    .await;
                })
            }))
            .await;

        let negotiations_in = Arc::clone(&negotiations);
        peer.subscriber()
            .on_negotiate(Box::new(move || {
                let negotiations = Arc::clone(&negotiations_in);
                Box::pin(async move {
                    negotiations.fetch_add(1, Ordering::SeqCst);
                })
            }))
            .await;

        SubscriberHarness {
            writers,
            negotiations,
            added,
        }
    }

    fn writer_for(&self, track_id: &str) -> Option<Arc<MockTrackWriter>> {
        self.writers
            .lock()
            .iter()
            .find(|(id, _)| id == track_id)
            .map(|(_, w)| Arc::clone(w))
    }
}

fn opus_params() -> CodecParameters {
    CodecParameters {
        mime_type: "audio/opus".to_owned(),
        clock_rate: 48_000,
        channels: 2,
        payload_type: 111,
        rtcp_feedback: vec![],
        header_extensions: vec![],
    }
}

fn vp8_params() -> CodecParameters {
    CodecParameters {
        mime_type: "video/VP8".to_owned(),
        clock_rate: 90_000,
        channels: 0,
        payload_type: 96,
        rtcp_feedback: vec![RtcpFeedback {
            typ: "nack".to_owned(),
            parameter: String::new(),
        }],
        header_extensions: vec![],
    }
}

fn audio_track(ssrc: u32) -> RemoteTrack {
    RemoteTrack {
        id: "audio0".to_owned(),
        stream_id: "stream-p".to_owned(),
        ssrc,
        rid: String::new(),
        codec: opus_params(),
    }
}

fn video_track(ssrc: u32) -> RemoteTrack {
    RemoteTrack {
        id: "video0".to_owned(),
        stream_id: "stream-p".to_owned(),
        ssrc,
        rid: String::new(),
        codec: vp8_params(),
    }
}

const KEYFRAME: &[u8] = &[0x10, 0x00];
const INTERFRAME: &[u8] = &[0x10, 0x01];

fn raw_packet(ssrc: u32, pt: u8, sn: u16, ts: u32, payload: &[u8]) -> Vec<u8> {
    rtp::packet::Packet {
        header: rtp::header::Header {
            version: 2,
            payload_type: pt,
            sequence_number: sn,
            timestamp: ts,
            ssrc,
            ..Default::default()
        },
        payload: Bytes::copy_from_slice(payload),
    }
    .marshal()
    .unwrap()
    .to_vec()
}

async fn create_peer(sfu: &Arc<Sfu>, session: &str, id: &str) -> Arc<Peer> {
    sfu.create_peer(session, id, MockRtcpWriter::new(), MockRtcpWriter::new(), false)
        .await
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within two seconds");
}

#[tokio::test]
async fn test_late_subscribers_get_all_tracks() -> Result<()> {
    let sfu = Sfu::new(RouterConfig::default());
    let publisher = create_peer(&sfu, "room", "pub").await;
    publisher.publisher().on_track(audio_track(100)).await;
    publisher.publisher().on_track(video_track(200)).await;

    // Media flows before anyone subscribes; none of it may reach the late
    // joiners below.
    let factory = sfu.buffer_factory();
    let audio_buf = factory.get_buffer(100).unwrap();
    let video_buf = factory.get_buffer(200).unwrap();
    for sn in 0u16..5 {
        audio_buf.write(&raw_packet(100, 111, sn, sn as u32 * 960, &[0xaa]))?;
        video_buf.write(&raw_packet(200, 96, 1000 + sn, sn as u32 * 3000, KEYFRAME))?;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let sub_a = create_peer(&sfu, "room", "a").await;
    let harness_a = SubscriberHarness::install(&sub_a).await;
    sub_a.join().await;
    let sub_b = create_peer(&sfu, "room", "b").await;
    let harness_b = SubscriberHarness::install(&sub_b).await;
    sub_b.join().await;

    wait_until(|| harness_a.added.load(Ordering::SeqCst) == 2).await;
    wait_until(|| harness_b.added.load(Ordering::SeqCst) == 2).await;
    wait_until(|| harness_a.negotiations.load(Ordering::SeqCst) >= 1).await;
    assert_eq!(sub_a.subscriber().down_tracks().len(), 2);
    assert_eq!(sub_b.subscriber().down_tracks().len(), 2);

    // New media: an interframe first (must be withheld), then a keyframe.
    video_buf.write(&raw_packet(200, 96, 1005, 15_000, INTERFRAME))?;
    video_buf.write(&raw_packet(200, 96, 1006, 18_000, KEYFRAME))?;
    video_buf.write(&raw_packet(200, 96, 1007, 21_000, INTERFRAME))?;
    audio_buf.write(&raw_packet(100, 111, 5, 4800, &[0xbb]))?;

    for harness in [&harness_a, &harness_b] {
        let video_writer = harness.writer_for("video0").unwrap();
        wait_until(|| video_writer.packets.lock().len() == 2).await;
        let written = video_writer.written();
        // First delivered video packet is a keyframe, nothing pre-join
        // leaked out of the bucket.
        assert_eq!(written[0].payload, Bytes::from_static(KEYFRAME));
        assert_eq!(
            written[1]
                .header
                .sequence_number
                .wrapping_sub(written[0].header.sequence_number),
            1
        );
        let audio_writer = harness.writer_for("audio0").unwrap();
        wait_until(|| !audio_writer.packets.lock().is_empty()).await;
        assert_eq!(audio_writer.written()[0].payload, Bytes::from_static(&[0xbb]));
    }
    Ok(())
}

#[tokio::test]
async fn test_add_down_track_is_idempotent() -> Result<()> {
    let sfu = Sfu::new(RouterConfig::default());
    let publisher = create_peer(&sfu, "room", "pub").await;
    publisher.publisher().on_track(video_track(200)).await;

    let sub = create_peer(&sfu, "room", "a").await;
    let harness = SubscriberHarness::install(&sub).await;
    sub.join().await;
    wait_until(|| harness.added.load(Ordering::SeqCst) == 1).await;

    let router = publisher.publisher().router();
    let recv = router.get_receiver("video0").unwrap();
    let dt1 = router
        .add_down_track(sub.subscriber(), Arc::clone(&recv))
        .await?
        .unwrap();
    let dt2 = router.add_down_track(sub.subscriber(), recv).await?.unwrap();
    assert!(Arc::ptr_eq(&dt1, &dt2));
    // No second transceiver was added for the duplicate.
    assert_eq!(harness.added.load(Ordering::SeqCst), 1);
    assert_eq!(sub.subscriber().down_tracks().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_peer_teardown_and_session_recycling() -> Result<()> {
    let sfu = Sfu::new(RouterConfig::default());
    let publisher = create_peer(&sfu, "room", "pub").await;
    publisher.publisher().on_track(video_track(200)).await;

    let sub = create_peer(&sfu, "room", "a").await;
    let harness = SubscriberHarness::install(&sub).await;
    sub.join().await;
    wait_until(|| harness.added.load(Ordering::SeqCst) == 1).await;
    wait_until(|| harness.negotiations.load(Ordering::SeqCst) >= 1).await;
    let negotiated_before = harness.negotiations.load(Ordering::SeqCst);

    // Publisher leaves: its receiver dies, the subscriber loses the down
    // track and renegotiates with the track removed.
    publisher.close().await;
    wait_until(|| sub.subscriber().down_tracks().is_empty()).await;
    wait_until(|| harness.negotiations.load(Ordering::SeqCst) > negotiated_before).await;

    // Last peer leaves: the session unregisters itself.
    sub.close().await;
    assert!(sfu.get_session("room").is_none());

    // The id is reusable and yields a fresh, empty session.
    let session = sfu.get_or_create_session("room").await;
    assert!(session.peers().is_empty());
    Ok(())
}
