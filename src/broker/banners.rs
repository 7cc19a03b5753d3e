//! The three fixed banner messages the broker can show a client before
//! closing the connection. Embedded at compile time, matching the
//! original's `//go:embed` directives -- these never need to vary at
//! runtime, so there's no templating or formatting beyond appending the
//! line ending the SSH banner callback expects.

/// Shown when the SSH username can't be parsed as `user@device` or
/// `device`. Logged and otherwise non-fatal -- see [`crate::sshid`].
pub const INVALID_SSH_ID: &str = include_str!("banners/invalid_ssh_id.txt");

/// Shown when the target device can't be reached: not registered, or the
/// dial/handshake onto its tunnel failed.
pub const CONNECTION_FAILED: &str = include_str!("banners/connection_failed.txt");

/// Shown when the `Evaluate` policy hook rejects the session. The hook is
/// a no-op in this core, so this banner is currently unreachable in
/// practice but is kept wired up per spec.
pub const ACCESS_DENIED: &str = include_str!("banners/access_denied.txt");
