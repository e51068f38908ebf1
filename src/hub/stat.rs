//! Group statistics snapshot

use serde::Serialize;

use crate::session::SessionStat;

/// Snapshot returned by [`StreamGroup::get_stat`](super::StreamGroup::get_stat)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupStat {
    pub unique_key: String,
    pub app_name: String,
    pub stream_name: String,
    /// "H264", "H265" or empty
    pub video_codec: String,
    /// "AAC" or empty
    pub audio_codec: String,
    /// Local producer (relay pulls are reported in `stat_pull`)
    pub stat_pub: Option<SessionStat>,
    pub stat_pull: Option<SessionStat>,
    /// Consumers, each protocol family capped separately
    pub stat_subs: Vec<SessionStat>,
    pub stat_pushes: Vec<SessionStat>,
}
