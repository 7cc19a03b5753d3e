//! Core library shared by the `minibroker-ssh` broker and `minibroker-agent`
//! binaries.
//!
//! The broker exposes a standard SSH listener to the outside world and a
//! websocket ingress endpoint that agents dial inbound through NAT. Once an
//! agent is registered, external SSH sessions are bridged onto a fresh
//! multiplexed stream inside that agent's tunnel; see [`broker::session`]
//! for the bridge state machine.

pub mod agent;
pub mod broker;
pub mod error;
pub mod handshake;
pub mod ingress;
pub mod registry;
pub mod sshid;
pub mod tunnel;

pub use broker::BrokerSshServer;
pub use error::BrokerError;
