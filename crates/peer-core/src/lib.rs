//! peer-core: Transport-agnostic peer connection management.
//!
//! This crate provides the core functionality for:
//! - Peers with a continuously monitored connection status
//! - Per-peer connection maintainers with retry backoff
//! - Reference-counted peer tables shared by many peer lists
//! - The PeerList selection seam and a round-robin implementation
//! - Transport and Connector trait abstractions

pub mod backoff;
pub mod bind;
pub mod error;
pub mod identifier;
pub mod list;
pub mod maintainer;
pub mod peer;
pub mod roundrobin;
pub mod signal;
pub mod status;
pub mod table;
pub mod transport;

#[cfg(test)]
mod testing;

pub use backoff::{Backoff, MIN_RETRY_DELAY, RetryPolicy};
pub use bind::{BoundList, bind};
pub use error::{ConnectError, MembershipFailure, PeerError};
pub use identifier::{IdentifierError, PeerIdentifier};
pub use list::{ListIntrospection, OnFinish, PeerIntrospection, PeerList};
pub use peer::{Peer, Subscriber, SubscriberHandle, SubscriberKey};
pub use roundrobin::RoundRobin;
pub use signal::{ChangeSignal, Lifecycle, LifecycleState};
pub use status::ConnectionStatus;
pub use table::PeerTable;
pub use transport::{Connector, Transport};
