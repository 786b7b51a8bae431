//! Inter-process bootstrap state.
//!
//! A small JSON file at a well-known runtime path holding the server
//! port and the list of currently-cast device addresses, so auxiliary
//! processes (frame producers, chart viewers) can bootstrap without
//! talking to the main process.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BootstrapState {
    /// Port the frame bus registry listens on.
    pub server_port: u16,
    /// Addresses of all devices currently receiving a cast.
    pub all_hosts: Vec<String>,
}

impl BootstrapState {
    /// Load state, falling back to defaults when the file is missing
    /// or unreadable. A missing file is the normal first run; anything
    /// else gets a log line.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "bootstrap state corrupt, using defaults");
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "bootstrap state unreadable, using defaults");
                Self::default()
            }
        }
    }

    pub fn store(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)
    }

    pub fn add_host(&mut self, host: &str) {
        if !self.all_hosts.iter().any(|h| h == host) {
            self.all_hosts.push(host.to_string());
        }
    }

    pub fn remove_host(&mut self, host: &str) {
        self.all_hosts.retain(|h| h != host);
    }
}

/// Canonical state file location.
pub fn default_path() -> PathBuf {
    let dir = match std::env::var_os("LEDCAST_RUNTIME_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => std::env::temp_dir().join("ledcast"),
    };
    dir.join("state.json")
}
