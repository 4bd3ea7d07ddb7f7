//! Typed interface to the master server.
//!
//! The core never frames packets itself; it talks to an injected
//! [`transport::MasterTransport`] that exchanges typed requests and
//! responses. [`transport::Master`] wraps the transport with the
//! credentials-refresh retry required for supplementary-group handling.

pub mod messages;
pub mod session;
pub mod transport;

pub use messages::{MasterRequest, MasterResponse};
pub use transport::{Master, MasterTransport};
