//! Session unique keys
//!
//! Every key is `<PREFIX><n>`, where the prefix names the protocol and role
//! and `n` comes from one process-wide counter. Kicking a session by id
//! starts by parsing the prefix.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Which side of the group a session sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionRole {
    Producer,
    Consumer,
}

/// (protocol, role) pair encoded in a unique key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionKind {
    RtmpPub,
    RtmpSub,
    RtspPub,
    RtspSub,
    FlvSub,
    TsSub,
    PsPub,
    CustomizePub,
    RtmpPull,
    RtmpPush,
    Group,
}

impl SessionKind {
    const ALL: [SessionKind; 11] = [
        SessionKind::RtmpPub,
        SessionKind::RtmpSub,
        SessionKind::RtspPub,
        SessionKind::RtspSub,
        SessionKind::FlvSub,
        SessionKind::TsSub,
        SessionKind::PsPub,
        SessionKind::CustomizePub,
        SessionKind::RtmpPull,
        SessionKind::RtmpPush,
        SessionKind::Group,
    ];

    pub fn prefix(&self) -> &'static str {
        match self {
            SessionKind::RtmpPub => "RTMPPUB",
            SessionKind::RtmpSub => "RTMPSUB",
            SessionKind::RtspPub => "RTSPPUB",
            SessionKind::RtspSub => "RTSPSUB",
            SessionKind::FlvSub => "FLVSUB",
            SessionKind::TsSub => "TSSUB",
            SessionKind::PsPub => "PSPUB",
            SessionKind::CustomizePub => "CUSTOMIZEPUB",
            SessionKind::RtmpPull => "RTMPPULL",
            SessionKind::RtmpPush => "RTMPPUSH",
            SessionKind::Group => "GROUP",
        }
    }

    /// `None` for the group itself
    pub fn role(&self) -> Option<SessionRole> {
        match self {
            SessionKind::RtmpPub
            | SessionKind::RtspPub
            | SessionKind::PsPub
            | SessionKind::CustomizePub
            | SessionKind::RtmpPull => Some(SessionRole::Producer),
            SessionKind::RtmpSub
            | SessionKind::RtspSub
            | SessionKind::FlvSub
            | SessionKind::TsSub
            | SessionKind::RtmpPush => Some(SessionRole::Consumer),
            SessionKind::Group => None,
        }
    }

    /// Protocol name as reported in stats
    pub fn protocol(&self) -> &'static str {
        match self {
            SessionKind::RtmpPub
            | SessionKind::RtmpSub
            | SessionKind::RtmpPull
            | SessionKind::RtmpPush => "RTMP",
            SessionKind::RtspPub | SessionKind::RtspSub => "RTSP",
            SessionKind::FlvSub => "FLV",
            SessionKind::TsSub => "TS",
            SessionKind::PsPub => "PS",
            SessionKind::CustomizePub => "CUSTOMIZE",
            SessionKind::Group => "GROUP",
        }
    }

    /// Parse the kind from a key such as `RTMPSUB12`
    ///
    /// The prefix must be followed by at least one digit and nothing else.
    pub fn from_unique_key(key: &str) -> Option<SessionKind> {
        Self::ALL.into_iter().find(|kind| {
            key.strip_prefix(kind.prefix())
                .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
        })
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Allocate a fresh key for `kind`
pub fn gen_unique_key(kind: SessionKind) -> String {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    format!("{}{}", kind.prefix(), id)
}
