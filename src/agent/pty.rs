//! PTY-backed shell sessions for agent SSH connections.
//!
//! Mirrors the original host mode's shell command construction: the
//! session's `$SHELL` (falling back to `/bin/bash`), started as a login
//! shell, with the client's negotiated `TERM` and exactly the environment
//! the client sent via SSH `env` channel requests, plus `SSH_AUTH_SOCK`
//! forwarded through so agent forwarding keeps working inside the session.
//! The agent process's own environment is not inherited -- only what the
//! client explicitly asked for ends up in the shell.

use std::io::{Read, Write};

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

/// The shell to launch for an interactive session: `$SHELL`, or
/// `/bin/bash` if it isn't set.
pub fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
}

/// A running PTY-backed shell.
///
/// Output is delivered on `output_rx` (drained by a background thread doing
/// blocking reads off the PTY master, since `portable-pty` is sync-only);
/// input is written with [`PtySession::write_input`].
pub struct PtySession {
    writer: Box<dyn Write + Send>,
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
}

impl PtySession {
    /// Spawns a login shell attached to a new PTY of the given size, with
    /// an environment built from exactly `client_env` (the `env` channel
    /// requests the client sent) plus `TERM` and any `SSH_AUTH_SOCK` the
    /// agent process itself has -- not the agent's full environment.
    /// Returns the session handle alongside the channel its output arrives
    /// on, since the reader runs on its own blocking thread.
    pub fn spawn(
        term: &str,
        rows: u16,
        cols: u16,
        client_env: &[(String, String)],
    ) -> Result<(Self, mpsc::Receiver<Vec<u8>>)> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open pty")?;

        let mut cmd = CommandBuilder::new(default_shell());
        cmd.arg("--login");
        cmd.env_clear();
        for (key, value) in client_env {
            cmd.env(key, value);
        }
        cmd.env("TERM", term);
        if let Ok(auth_sock) = std::env::var("SSH_AUTH_SOCK") {
            cmd.env("SSH_AUTH_SOCK", auth_sock);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .context("failed to spawn shell")?;
        // the slave side belongs to the child now; drop our copy so the
        // master's reader gets EOF once the child exits.
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone pty reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("failed to take pty writer")?;

        let (tx, rx) = mpsc::channel(64);
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::debug!("pty reader exiting: {e}");
                        break;
                    }
                }
            }
        });

        let session = Self {
            writer,
            master: pair.master,
            child,
        };
        Ok((session, rx))
    }

    pub fn write_input(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data).context("pty write failed")
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("pty resize failed")
    }

    /// Non-blocking check for whether the shell has exited.
    pub fn try_wait(&mut self) -> Result<Option<u32>> {
        Ok(self
            .child
            .try_wait()
            .context("pty wait failed")?
            .map(|status| status.exit_code()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_shell_falls_back_to_bash() {
        std::env::remove_var("SHELL");
        assert_eq!(default_shell(), "/bin/bash");
    }

    #[test]
    fn default_shell_honors_env() {
        std::env::set_var("SHELL", "/usr/bin/zsh");
        assert_eq!(default_shell(), "/usr/bin/zsh");
        std::env::remove_var("SHELL");
    }
}
