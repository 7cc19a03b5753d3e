//! Transport plumbing for the agent<->broker tunnel.
//!
//! [`framed`] turns the websocket the agent dials in on into a plain byte
//! stream; [`mux`] multiplexes that byte stream into many independent
//! streams, one per bridged SSH session.

pub mod framed;
pub mod mux;

pub use framed::WsFramedIo;
pub use mux::{MuxConnection, MuxRole};
