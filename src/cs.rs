//! Talking to chunkservers: typed messages, pooled connections, and the
//! wire client used by the read executor and the write coordinator.

pub mod client;
pub mod connector;
pub mod messages;

pub use client::ChunkserverClient;
pub use connector::{ConnectionPool, CsChannel, CsConnector};
pub use messages::{CsReply, CsRequest};
