//! Session capabilities as seen by a stream group
//!
//! The network layer owns every session: its socket, its read/write task and
//! its teardown. A group only holds routing references through the traits
//! below and asks sessions to go away with [`SessionControl::dispose`].
//!
//! Producer and consumer variants are closed sum types ([`Producer`],
//! [`Consumer`]) so routing code can match exhaustively on the protocol.

pub mod channel;
pub mod customize;
pub mod key;
pub mod stat;
pub mod variant;

pub use channel::{ChannelSink, RtspEvent};
pub use customize::CustomizePubSession;
pub use key::{gen_unique_key, SessionKind, SessionRole};
pub use stat::{SessionStat, TrafficCounter};
pub use variant::{Consumer, Producer};

use crate::media::{AvPacket, FlvTag};
use crate::remux::{SdpInfo, TsFrame};

/// Operations every session supports
///
/// All methods take `&self` and may be called from the group while the
/// session's own I/O context is running.
pub trait SessionControl: Send + Sync {
    /// Key whose prefix encodes (protocol, role)
    fn unique_key(&self) -> &str;

    /// (read activity, write activity) since the previous call
    fn is_alive(&self) -> (bool, bool);

    /// Recompute bitrates over the last `interval_sec` seconds
    fn update_stat(&self, interval_sec: u32);

    fn stat(&self) -> SessionStat;

    /// Request teardown. Must be idempotent, must not block, and must not
    /// call back into the group (it runs under the group lock).
    fn dispose(&self);
}

/// Consumer of internal messages (RTMP, HTTP-FLV, push relay)
pub trait MessageSink: SessionControl {
    fn write_message(&self, msg: &FlvTag);
}

/// Consumer of segment-ready frames (HTTP-TS)
pub trait TsSink: SessionControl {
    fn write_ts_frame(&self, frame: &TsFrame);
}

/// Consumer of RTSP output
pub trait RtspSink: SessionControl {
    /// Called once before the first packet
    fn set_sdp(&self, sdp: &SdpInfo);

    fn write_packet(&self, pkt: &AvPacket);
}
