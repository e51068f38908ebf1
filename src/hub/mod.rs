//! Stream-group hub
//!
//! A [`StreamGroup`] routes one stream: it accepts a single producer, remuxes
//! its output for every consumer protocol, keeps GOP history for late joiners
//! and drives relay pull/push. [`GroupManager`] keeps the groups of a server.

pub mod group;
pub mod ingest;
pub mod manager;
pub mod observer;
pub mod stat;
pub mod stream_key;

pub use group::StreamGroup;
pub use ingest::IngestHandle;
pub use manager::GroupManager;
pub use observer::{GroupObserver, NoopObserver};
pub use stat::GroupStat;
pub use stream_key::StreamKey;
