use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// ErrPacketNotFound indicates that the requested sequence number is no
    /// longer held by the packet bucket.
    #[error("packet not found in cache")]
    ErrPacketNotFound,

    /// ErrBufferTooSmall indicates a caller-provided output buffer smaller
    /// than the stored packet. This is a programming error, not a transient
    /// condition.
    #[error("buffer too small")]
    ErrBufferTooSmall,

    /// ErrPacketTooOld indicates a sequence number that fell out of the
    /// bucket window before it arrived.
    #[error("received packet too old")]
    ErrPacketTooOld,

    /// ErrRtxPacket indicates a retransmission of a packet the bucket
    /// already holds.
    #[error("packet already received")]
    ErrRtxPacket,

    /// ErrIoEof indicates the upstream source reached end of stream.
    #[error("EOF")]
    ErrIoEof,

    /// ErrClosedPipe indicates a write to a track whose transport has shut
    /// down. The down track is considered dying.
    #[error("io: read/write on closed pipe")]
    ErrClosedPipe,

    /// ErrBindFailed indicates a down track write before the transport
    /// attached the stream.
    #[error("track not bound")]
    ErrBindFailed,

    /// ErrShortPacket indicates an RTP payload too short to carry the
    /// expected codec header.
    #[error("packet is too short")]
    ErrShortPacket,

    #[error("{0}")]
    Util(#[from] util::Error),

    #[error("{0}")]
    Rtcp(#[from] rtcp::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether a write error means the receiving transport is gone and the
    /// down track should be removed rather than retried.
    pub fn is_dying_track(&self) -> bool {
        matches!(self, Error::ErrIoEof | Error::ErrClosedPipe)
    }
}
