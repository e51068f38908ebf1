//! Stream-group core for live media relay servers
//!
//! One [`StreamGroup`] per stream name accepts a single producer, converts
//! its media for each consumer protocol, caches recent GOPs so consumers can
//! join mid-stream, and relays the stream to and from other servers.
//!
//! Wire protocols stay outside this crate. Sessions plug in through the
//! capability traits in [`session`], and relay clients through
//! [`RelayConnector`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use relay_hub::{ChannelSink, Consumer, GroupManager, HubConfig, SessionKind};
//! use relay_hub::media::FlvTag;
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = Arc::new(GroupManager::new(HubConfig::default()));
//!     let _ticker = manager.spawn_ticker();
//!
//!     let group = manager.get_or_create("live", "room_1");
//!     let (sink, mut rx) = ChannelSink::<FlvTag>::new(SessionKind::FlvSub, 256);
//!     group.attach_consumer(Consumer::HttpFlv(sink)).unwrap();
//!
//!     while let Some(tag) = rx.recv().await {
//!         // write tag to the HTTP response
//!         let _ = tag;
//!     }
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod hub;
pub mod media;
pub mod relay;
pub mod remux;
pub mod session;

pub use config::HubConfig;
pub use error::{Error, HubError, MediaError, RelayError, Result};
pub use hub::{GroupManager, GroupObserver, GroupStat, IngestHandle, NoopObserver, StreamGroup, StreamKey};
pub use relay::{RelayConnector, RelayState};
pub use session::{
    ChannelSink, Consumer, CustomizePubSession, MessageSink, Producer, RtspEvent, RtspSink,
    SessionControl, SessionKind, SessionStat, TsSink,
};
