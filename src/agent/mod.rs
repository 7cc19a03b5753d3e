//! Agent-side plumbing: dialing the broker, accepting bridged streams, and
//! running a minimal SSH server over each one.

pub mod auth;
pub mod client;
pub mod info;
pub mod pty;
pub mod ssh_server;
pub mod stream_dispatch;

pub use auth::Authenticator;
pub use client::{AgentClient, AgentClientConfig};
pub use info::AgentInfo;
