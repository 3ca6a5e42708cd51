#[allow(clippy::module_inception)]
mod buffer;
mod bucket;
mod factory;
mod helpers;
mod nack;


pub use bucket::{Bucket, MAX_PKT_SIZE};
pub use buffer::{
    Buffer, BufferOptions, BufferStats, ExtPacket, OnAudioLevelHdlrFn, OnCloseHdlrFn,
    OnFeedbackHdlrFn, OnTransportCcHdlrFn, RtcpPackets, AUDIO_BUCKET_SLOTS, VIDEO_BUCKET_SLOTS,
};
pub use factory::{Factory, OnRtcpPacketHdlrFn, RtcpReader};
pub use helpers::{is_h264_key_frame, parse_vp8, rewrite_vp8, Vp8Meta};
pub use nack::NackQueue;

pub(crate) use buffer::unix_ns;
pub(crate) use factory::PACKET_POOL;
