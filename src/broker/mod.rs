//! Broker-side plumbing: the external-facing SSH listener (C6) and the
//! bridge state machine (C7) that pairs each accepted client connection
//! with a dialed-out agent connection.

pub mod banners;
pub mod frontend;
pub mod session;

pub use frontend::BrokerSshServer;
