#![warn(rust_2018_idioms)]

//! Media routing core of a WebRTC selective forwarding unit.
//!
//! The crate receives decrypted RTP/RTCP from a transport it does not own,
//! fans every publisher track out to the down tracks of the subscribed
//! peers without transcoding, and produces the feedback the publisher needs
//! to adapt: NACKs, keyframe requests, receiver reports and transport-wide
//! congestion control. Per-subscriber quality is driven by simulcast layer
//! switching committed only on keyframe boundaries.

// re-export the wire-format crates
pub use rtcp;
pub use rtp;
pub use util;

pub mod audio_observer;
pub mod buffer;
pub mod config;
mod error;
pub mod peer;
pub mod publisher;
pub mod router;
pub mod sequencer;
pub mod session;
pub mod sfu;
pub mod stats;
pub mod subscriber;
pub mod track;
pub mod twcc;

pub use config::{AudioLevelConfig, RouterConfig, SimulcastConfig, Vp8PictureIdPolicy};
pub use error::{Error, Result};
pub use peer::Peer;
pub use publisher::Publisher;
pub use router::Router;
pub use session::Session;
pub use sfu::Sfu;
pub use subscriber::Subscriber;
pub use track::{BindContext, CodecParameters, MediaKind, RemoteTrack, RtcpWriter, TrackLocalWriter};
