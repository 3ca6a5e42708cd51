use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use rtcp::receiver_report::ReceiverReport;
use rtcp::reception_report::ReceptionReport;
use rtcp::transport_feedbacks::transport_layer_nack::{
    nack_pairs_from_sequence_numbers, TransportLayerNack,
};
use tokio::sync::mpsc;
use util::marshal::Marshal;
use util::sync::Mutex;

use crate::buffer::{Buffer, BufferOptions, RtcpPackets};
use crate::config::Vp8PictureIdPolicy;
use crate::error::{Error, Result};
use crate::track::down_track::{DownTrack, DownTrackType};
use crate::track::receiver::Receiver;
use crate::track::{
    BindContext, CodecParameters, RemoteTrack, RtcpFeedback, TrackLocalWriter,
};

#[derive(Debug)]
struct MockWriter {
    packets: Mutex<Vec<rtp::packet::Packet>>,
    fail: AtomicBool,
}

impl MockWriter {
    fn new() -> Arc<Self> {
        Arc::new(MockWriter {
            packets: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    fn written(&self) -> Vec<rtp::packet::Packet> {
        self.packets.lock().clone()
    }

    fn count(&self) -> usize {
        self.packets.lock().len()
    }
}

#[async_trait]
impl TrackLocalWriter for MockWriter {
    async fn write_rtp(&self, p: &rtp::packet::Packet) -> Result<usize> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::ErrClosedPipe);
        }
        self.packets.lock().push(p.clone());
        Ok(p.payload.len())
    }

    async fn write(&self, b: &[u8]) -> Result<usize> {
        Ok(b.len())
    }
}

fn vp8_params() -> CodecParameters {
    CodecParameters {
        mime_type: "video/VP8".to_owned(),
        clock_rate: 90000,
        channels: 0,
        payload_type: 96,
        rtcp_feedback: vec![RtcpFeedback {
            typ: "nack".to_owned(),
            parameter: String::new(),
        }],
        header_extensions: vec![],
    }
}

fn remote_track(ssrc: u32, rid: &str) -> RemoteTrack {
    RemoteTrack {
        id: "video-track".to_owned(),
        stream_id: "stream-a".to_owned(),
        ssrc,
        rid: rid.to_owned(),
        codec: vp8_params(),
    }
}

const KEYFRAME: &[u8] = &[0x10, 0x00];
const INTERFRAME: &[u8] = &[0x10, 0x01];

fn raw_packet(ssrc: u32, sn: u16, ts: u32, payload: &[u8]) -> Vec<u8> {
    rtp::packet::Packet {
        header: rtp::header::Header {
            version: 2,
            payload_type: 96,
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

fn bound_buffer(ssrc: u32) -> Arc<Buffer> {
    let b = Arc::new(Buffer::new(ssrc));
    b.bind(&vp8_params(), BufferOptions::default());
    b
}

fn down_track(receiver: &Arc<Receiver>, typ: DownTrackType) -> Arc<DownTrack> {
    Arc::new(DownTrack::new(
        vp8_params(),
        Arc::downgrade(receiver),
        "sub-peer".to_owned(),
        "video-track".to_owned(),
        "stream-a".to_owned(),
        typ,
        false,
        Vp8PictureIdPolicy::default(),
    ))
}

fn temporal_down_track(receiver: &Arc<Receiver>) -> Arc<DownTrack> {
    Arc::new(DownTrack::new(
        vp8_params(),
        Arc::downgrade(receiver),
        "sub-peer".to_owned(),
        "video-track".to_owned(),
        "stream-a".to_owned(),
        DownTrackType::Simulcast,
        true,
        Vp8PictureIdPolicy::default(),
    ))
}

async fn bind(dt: &Arc<DownTrack>, ssrc: u32) -> Arc<MockWriter> {
    let writer = MockWriter::new();
    dt.bind(BindContext {
        ssrc,
        payload_type: 102,
        write_stream: Arc::clone(&writer) as Arc<dyn TrackLocalWriter>,
    })
    .await;
    writer
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within a second");
}

async fn expect_pli(rx: &mut mpsc::Receiver<RtcpPackets>) {
    let pkts = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("rtcp expected")
        .expect("channel open");
    assert!(pkts
        .iter()
        .any(|p| p.as_any().downcast_ref::<PictureLossIndication>().is_some()));
}

#[tokio::test]
async fn test_simple_forwarding_rewrites_header() -> Result<()> {
    let (tx, mut rx) = mpsc::channel(10);
    let track = remote_track(111, "");
    let receiver = Receiver::new("pub-peer".to_owned(), &track, tx);
    let buffer = bound_buffer(111);
    receiver.add_up_track(track, Arc::clone(&buffer), false);

    let dt = down_track(&receiver, DownTrackType::Simple);
    let writer = bind(&dt, 9999).await;
    receiver.add_down_track(Arc::clone(&dt), false).await;
    expect_pli(&mut rx).await;

    buffer.write(&raw_packet(111, 1000, 30_000, KEYFRAME))?;
    buffer.write(&raw_packet(111, 1001, 33_000, INTERFRAME))?;
    buffer.write(&raw_packet(111, 1002, 36_000, INTERFRAME))?;
    wait_until(|| writer.count() == 3).await;

    let written = writer.written();
    for (i, p) in written.iter().enumerate() {
        assert_eq!(p.header.ssrc, 9999);
        assert_eq!(p.header.payload_type, 102);
        assert_eq!(p.header.timestamp, 30_000 + i as u32 * 3000);
    }
    // Monotonic, gap-free rewritten sequence numbers.
    for w in written.windows(2) {
        assert_eq!(
            w[1].header.sequence_number.wrapping_sub(w[0].header.sequence_number),
            1
        );
    }
    // First delivered packet is the keyframe.
    assert_eq!(written[0].payload, Bytes::from_static(KEYFRAME));
    Ok(())
}

#[tokio::test]
async fn test_non_keyframe_start_requests_pli() -> Result<()> {
    let (tx, mut rx) = mpsc::channel(10);
    let track = remote_track(111, "");
    let receiver = Receiver::new("pub-peer".to_owned(), &track, tx);
    let buffer = bound_buffer(111);
    receiver.add_up_track(track, Arc::clone(&buffer), false);

    let dt = down_track(&receiver, DownTrackType::Simple);
    let writer = bind(&dt, 9999).await;
    receiver.add_down_track(Arc::clone(&dt), false).await;
    // Keyframe request fired at subscribe time.
    expect_pli(&mut rx).await;

    // Interframes are withheld until a keyframe shows up.
    buffer.write(&raw_packet(111, 1000, 30_000, INTERFRAME))?;
    buffer.write(&raw_packet(111, 1001, 33_000, INTERFRAME))?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(writer.count(), 0);

    buffer.write(&raw_packet(111, 1002, 36_000, KEYFRAME))?;
    buffer.write(&raw_packet(111, 1003, 39_000, INTERFRAME))?;
    wait_until(|| writer.count() == 2).await;
    assert_eq!(writer.written()[0].payload, Bytes::from_static(KEYFRAME));
    Ok(())
}

#[tokio::test]
async fn test_duplicate_down_track_ignored() -> Result<()> {
    let (tx, _rx) = mpsc::channel(10);
    let track = remote_track(111, "");
    let receiver = Receiver::new("pub-peer".to_owned(), &track, tx);
    let buffer = bound_buffer(111);
    receiver.add_up_track(track, Arc::clone(&buffer), false);

    let dt = down_track(&receiver, DownTrackType::Simple);
    let writer = bind(&dt, 9999).await;
    receiver.add_down_track(Arc::clone(&dt), false).await;
    receiver.add_down_track(Arc::clone(&dt), false).await;

    buffer.write(&raw_packet(111, 1000, 30_000, KEYFRAME))?;
    wait_until(|| writer.count() >= 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(writer.count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_nack_retransmits_from_bucket() -> Result<()> {
    let (tx, mut rx) = mpsc::channel(10);
    let track = remote_track(111, "");
    let receiver = Receiver::new("pub-peer".to_owned(), &track, tx);
    let buffer = bound_buffer(111);
    receiver.add_up_track(track, Arc::clone(&buffer), false);

    let dt = down_track(&receiver, DownTrackType::Simple);
    let writer = bind(&dt, 9999).await;
    receiver.add_down_track(Arc::clone(&dt), false).await;
    expect_pli(&mut rx).await;

    buffer.write(&raw_packet(111, 1000, 30_000, KEYFRAME))?;
    buffer.write(&raw_packet(111, 1001, 33_000, INTERFRAME))?;
    wait_until(|| writer.count() == 2).await;
    let lost_target = writer.written()[1].header.sequence_number;

    let nack = TransportLayerNack {
        sender_ssrc: 9999,
        media_ssrc: 9999,
        nacks: nack_pairs_from_sequence_numbers(&[lost_target]),
    };
    let raw = nack.marshal().unwrap();
    dt.handle_rtcp(&raw).await?;

    wait_until(|| writer.count() == 3).await;
    let rtx = &writer.written()[2];
    assert_eq!(rtx.header.sequence_number, lost_target);
    assert_eq!(rtx.header.ssrc, 9999);
    assert_eq!(rtx.payload, Bytes::from_static(INTERFRAME));
    Ok(())
}

#[tokio::test]
async fn test_simulcast_switch_commits_on_keyframe() -> Result<()> {
    let (tx, mut rx) = mpsc::channel(10);
    let low = remote_track(111, "q");
    let receiver = Receiver::new("pub-peer".to_owned(), &low, tx);
    let low_buffer = bound_buffer(111);
    receiver.add_up_track(low, Arc::clone(&low_buffer), false);
    let full = remote_track(333, "f");
    let full_buffer = bound_buffer(333);
    receiver.add_up_track(full, Arc::clone(&full_buffer), false);

    let dt = down_track(&receiver, DownTrackType::Simulcast);
    let writer = bind(&dt, 9999).await;
    receiver.add_down_track(Arc::clone(&dt), false).await;
    expect_pli(&mut rx).await;
    assert_eq!(dt.current_spatial_layer(), 0);

    low_buffer.write(&raw_packet(111, 1000, 30_000, KEYFRAME))?;
    low_buffer.write(&raw_packet(111, 1001, 33_000, INTERFRAME))?;
    wait_until(|| writer.count() == 2).await;

    dt.switch_spatial_layer(2)?;
    assert_eq!(dt.target_spatial_layer(), 2);

    // An interframe on the target layer cannot commit the move, it only
    // triggers a keyframe request upstream.
    full_buffer.write(&raw_packet(333, 5000, 90_000, INTERFRAME))?;
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(dt.current_spatial_layer(), 0);

    full_buffer.write(&raw_packet(333, 5001, 93_000, KEYFRAME))?;
    wait_until(|| dt.current_spatial_layer() == 2).await;
    // Exactly one live slot holds the track after the commit.
    assert_eq!(receiver.down_tracks(0).len(), 0);
    assert_eq!(receiver.down_tracks(2).len(), 1);
    full_buffer.write(&raw_packet(333, 5002, 96_000, INTERFRAME))?;
    wait_until(|| writer.count() >= 4).await;

    let written = writer.written();
    // Continuous sequence numbers and SSRC across the switch.
    for w in written.windows(2) {
        assert_eq!(
            w[1].header.sequence_number.wrapping_sub(w[0].header.sequence_number),
            1
        );
        assert_eq!(w[1].header.ssrc, 9999);
    }
    // The first packet after the switch is the layer 2 keyframe.
    assert_eq!(written[2].payload, Bytes::from_static(KEYFRAME));
    Ok(())
}

#[tokio::test]
async fn test_loss_report_drives_spatial_downswitch() -> Result<()> {
    let (tx, mut rx) = mpsc::channel(10);
    let low = remote_track(111, "q");
    let receiver = Receiver::new("pub-peer".to_owned(), &low, tx);
    let low_buffer = bound_buffer(111);
    receiver.add_up_track(low, Arc::clone(&low_buffer), false);
    let mid = remote_track(222, "h");
    let mid_buffer = bound_buffer(222);
    receiver.add_up_track(mid, Arc::clone(&mid_buffer), false);
    let full = remote_track(333, "f");
    let full_buffer = bound_buffer(333);
    receiver.add_up_track(full, Arc::clone(&full_buffer), false);

    let dt = down_track(&receiver, DownTrackType::Simulcast);
    let writer = bind(&dt, 9999).await;
    // Best quality first puts the subscriber on the full layer.
    receiver.add_down_track(Arc::clone(&dt), true).await;
    expect_pli(&mut rx).await;
    assert_eq!(dt.current_spatial_layer(), 2);

    full_buffer.write(&raw_packet(333, 5000, 90_000, KEYFRAME))?;
    wait_until(|| writer.count() == 1).await;

    // A receiver report with 37 % loss against the rewritten stream: the
    // track must ask for the next layer down.
    let rr = ReceiverReport {
        ssrc: 1,
        reports: vec![ReceptionReport {
            ssrc: 9999,
            fraction_lost: 96,
            ..Default::default()
        }],
        ..Default::default()
    };
    dt.handle_rtcp(&rr.marshal().unwrap()).await?;
    assert_eq!(dt.target_spatial_layer(), 1);
    // Staged only: the move commits on the target layer's next keyframe.
    assert_eq!(dt.current_spatial_layer(), 2);

    mid_buffer.write(&raw_packet(222, 8000, 120_000, KEYFRAME))?;
    wait_until(|| dt.current_spatial_layer() == 1).await;
    wait_until(|| writer.count() == 2).await;
    let written = writer.written();
    assert_eq!(
        written[1].header.sequence_number.wrapping_sub(written[0].header.sequence_number),
        1
    );
    assert_eq!(written[1].payload, Bytes::from_static(KEYFRAME));
    Ok(())
}

#[tokio::test]
async fn test_remb_headroom_drives_upswitch() -> Result<()> {
    let (tx, mut rx) = mpsc::channel(10);
    let low = remote_track(111, "q");
    let receiver = Receiver::new("pub-peer".to_owned(), &low, tx);
    let low_buffer = bound_buffer(111);
    receiver.add_up_track(low, Arc::clone(&low_buffer), false);
    let mid = remote_track(222, "h");
    let mid_buffer = bound_buffer(222);
    receiver.add_up_track(mid, Arc::clone(&mid_buffer), false);

    let dt = temporal_down_track(&receiver);
    let writer = bind(&dt, 9999).await;
    receiver.add_down_track(Arc::clone(&dt), false).await;
    expect_pli(&mut rx).await;
    assert_eq!(dt.current_spatial_layer(), 0);

    low_buffer.write(&raw_packet(111, 1000, 30_000, KEYFRAME))?;
    wait_until(|| writer.count() == 1).await;

    // Loss-free interval with bandwidth estimate well above 1.5x the
    // current layer bitrate: step one spatial layer up.
    let remb = ReceiverEstimatedMaximumBitrate {
        sender_ssrc: 1,
        bitrate: 1_000_000.0,
        ssrcs: vec![9999],
    };
    dt.handle_rtcp(&remb.marshal().unwrap()).await?;
    assert_eq!(dt.target_spatial_layer(), 1);
    // The clean report also raises the temporal target.
    assert_eq!(dt.target_temporal_layer(), 1);

    mid_buffer.write(&raw_packet(222, 8000, 120_000, KEYFRAME))?;
    wait_until(|| dt.current_spatial_layer() == 1).await;
    Ok(())
}

#[tokio::test]
async fn test_dying_down_track_is_removed_and_closed() -> Result<()> {
    let (tx, mut rx) = mpsc::channel(10);
    let track = remote_track(111, "");
    let receiver = Receiver::new("pub-peer".to_owned(), &track, tx);
    let buffer = bound_buffer(111);
    receiver.add_up_track(track, Arc::clone(&buffer), false);

    let dt = down_track(&receiver, DownTrackType::Simple);
    let writer = bind(&dt, 9999).await;
    receiver.add_down_track(Arc::clone(&dt), false).await;
    expect_pli(&mut rx).await;

    let closed = Arc::new(AtomicBool::new(false));
    let closed_in = Arc::clone(&closed);
    dt.on_close(Box::new(move || {
        let closed = Arc::clone(&closed_in);
        Box::pin(async move {
            closed.store(true, Ordering::SeqCst);
        })
    }))
    .await;

    writer.fail.store(true, Ordering::SeqCst);
    buffer.write(&raw_packet(111, 1000, 30_000, KEYFRAME))?;
    wait_until(|| closed.load(Ordering::SeqCst)).await;
    Ok(())
}

#[tokio::test]
async fn test_receiver_close_closes_down_tracks() -> Result<()> {
    let (tx, mut rx) = mpsc::channel(10);
    let track = remote_track(111, "");
    let receiver = Receiver::new("pub-peer".to_owned(), &track, tx);
    let buffer = bound_buffer(111);
    receiver.add_up_track(track, Arc::clone(&buffer), false);

    let dt = down_track(&receiver, DownTrackType::Simple);
    let _writer = bind(&dt, 9999).await;
    receiver.add_down_track(Arc::clone(&dt), false).await;
    expect_pli(&mut rx).await;

    let closed = Arc::new(AtomicBool::new(false));
    let closed_in = Arc::clone(&closed);
    dt.on_close(Box::new(move || {
        let closed = Arc::clone(&closed_in);
        Box::pin(async move {
            closed.store(true, Ordering::SeqCst);
        })
    }))
    .await;

    receiver.close().await;
    wait_until(|| closed.load(Ordering::SeqCst)).await;
    assert!(receiver.is_closed());
    Ok(())
}
