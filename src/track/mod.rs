pub mod down_track;
pub mod receiver;

#[cfg(test)]
mod receiver_test;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

pub const AUDIO_LEVEL_URI: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";
pub const TRANSPORT_CC_URI: &str =
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";

/// Simulcast RID values as negotiated by the transport. An empty RID means a
/// plain single-layer track.
pub const QUARTER_RESOLUTION: &str = "q";
pub const HALF_RESOLUTION: &str = "h";
pub const FULL_RESOLUTION: &str = "f";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// RTCP feedback capability negotiated for a codec, e.g. ("nack", "") or
/// ("nack", "pli").
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RtcpFeedback {
    pub typ: String,
    pub parameter: String,
}

#[derive(Debug, Default, Clone)]
pub struct RtpHeaderExtensionParameter {
    pub uri: String,
    pub id: u8,
}

#[derive(Debug, Default, Clone)]
pub struct CodecParameters {
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: u16,
    pub payload_type: u8,
    pub rtcp_feedback: Vec<RtcpFeedback>,
    pub header_extensions: Vec<RtpHeaderExtensionParameter>,
}

impl CodecParameters {
    pub fn kind(&self) -> MediaKind {
        if self.mime_type.to_lowercase().starts_with("audio/") {
            MediaKind::Audio
        } else {
            MediaKind::Video
        }
    }
}

/// Descriptor of one upstream RTP stream as the transport hands it over:
/// decrypted RTP for this SSRC will be written into the buffer the factory
/// allocated for it.
#[derive(Debug, Default, Clone)]
pub struct RemoteTrack {
    /// Track id, stable across the simulcast layers of one source.
    pub id: String,
    pub stream_id: String,
    pub ssrc: u32,
    pub rid: String,
    pub codec: CodecParameters,
}

/// Sink for a down track's rewritten RTP, installed by the transport when it
/// attaches the stream.
#[async_trait]
pub trait TrackLocalWriter: fmt::Debug + Send + Sync {
    /// write_rtp encrypts and sends one rewritten packet.
    async fn write_rtp(&self, p: &rtp::packet::Packet) -> Result<usize>;

    /// write sends pre-marshaled RTP bytes as they are.
    async fn write(&self, b: &[u8]) -> Result<usize>;
}

/// Batch RTCP sink, either toward a publisher (feedback, NACK, PLI) or
/// toward a subscriber (sender reports).
#[async_trait]
pub trait RtcpWriter: Send + Sync {
    async fn write_rtcp(&self, pkts: &[Box<dyn rtcp::packet::Packet + Send + Sync>])
        -> Result<usize>;
}

/// Everything a down track learns when the subscriber transport binds it.
#[derive(Clone)]
pub struct BindContext {
    /// Local SSRC the transport allocated for the outgoing stream.
    pub ssrc: u32,
    /// Negotiated payload type on the subscriber leg.
    pub payload_type: u8,
    pub write_stream: Arc<dyn TrackLocalWriter>,
}

impl fmt::Debug for BindContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindContext")
            .field("ssrc", &self.ssrc)
            .field("payload_type", &self.payload_type)
            .finish()
    }
}

/// Slot index for a simulcast RID.
pub(crate) fn layer_for_rid(rid: &str) -> usize {
    match rid {
        HALF_RESOLUTION => 1,
        FULL_RESOLUTION => 2,
        _ => 0,
    }
}
