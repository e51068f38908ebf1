//! Relay pull and push
//!
//! Both proxies are plain state owned by a [`StreamGroup`](crate::hub::StreamGroup)
//! and advanced from its tick. Connects run on spawned tasks through a
//! [`RelayConnector`]; the group applies their results under its lock.

pub mod connector;
pub mod pull;
pub mod push;
pub mod state;

pub use connector::RelayConnector;
pub use pull::{PullAction, PullProxy};
pub use push::PushProxy;
pub use state::{RelayMachine, RelayState};
