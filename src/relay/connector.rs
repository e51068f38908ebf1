//! Outbound relay connections
//!
//! The wire protocol client lives outside this crate. A server plugs it in by
//! implementing [`RelayConnector`]; the group calls it from a spawned task and
//! applies the result under its lock.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RelayError;
use crate::hub::IngestHandle;
use crate::session::{MessageSink, SessionControl};

#[async_trait]
pub trait RelayConnector: Send + Sync {
    /// Connect to a remote producer
    ///
    /// Resolves once the remote stream is playing. The returned session must
    /// report `session_key` as its unique key and push what it receives
    /// through `ingest`. Messages fed before this resolves are held by the
    /// group and delivered right after the pull takes the producer slot.
    async fn pull(
        &self,
        url: &str,
        session_key: &str,
        ingest: IngestHandle,
    ) -> Result<Arc<dyn SessionControl>, RelayError>;

    /// Connect to a remote consumer
    ///
    /// Resolves once the remote side accepts publishing. `session_key` is a
    /// fresh `RTMPPUSH` key the sink may adopt; kicks address the sink by
    /// whatever key it reports.
    async fn push(&self, url: &str, session_key: &str) -> Result<Arc<dyn MessageSink>, RelayError>;
}
