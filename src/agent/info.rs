//! Static information about the host this agent is running on.
//!
//! Mirrors the original agent's `HostMode::GetInfo`, which reports
//! `runtime.GOOS` as both the device's id and display name. This build only
//! ever runs in host mode (the connector/Docker mode the original also
//! supports is out of scope here), so there is exactly one implementation.

/// Identifies the operating system this agent process is running on, for
/// logging at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
}

impl AgentInfo {
    /// Builds the info for the current host, sourced from
    /// [`std::env::consts::OS`] -- the Rust equivalent of Go's `runtime.GOOS`.
    pub fn current() -> Self {
        Self {
            id: std::env::consts::OS.to_string(),
            name: std::env::consts::OS.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_reports_a_nonempty_os_name() {
        let info = AgentInfo::current();
        assert!(!info.id.is_empty());
        assert_eq!(info.id, info.name);
    }
}
