//! Configuration snapshot for the transfer core.
//!
//! The persisted key/value store itself is owned by the surrounding
//! application; the core only ever sees a read-only [`ConfigSnapshot`] and
//! consults it during the acceptance decision. The snapshot may go stale
//! between reads - that is acceptable for a LAN tool and the core never
//! writes configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::TransferRequest;

/// Default cap on auto-accepted transfer size (100 MiB).
const DEFAULT_MAX_AUTO_ACCEPT_SIZE: u64 = 100 * 1024 * 1024;

/// A read-only view of the user's transfer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigSnapshot {
    /// Whether auto-accept is enabled at all
    pub auto_accept: bool,
    /// Senders whose transfers may be auto-accepted
    pub auto_accept_senders: HashSet<String>,
    /// Maximum size in bytes eligible for auto-accept
    pub max_auto_accept_size: u64,
    /// Directory where received files are written
    pub default_download_dir: PathBuf,
    /// Seconds to wait for an acceptance decision before declining
    pub request_timeout: u64,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            auto_accept: false,
            auto_accept_senders: HashSet::new(),
            max_auto_accept_size: DEFAULT_MAX_AUTO_ACCEPT_SIZE,
            default_download_dir: default_download_dir(),
            request_timeout: crate::DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl ConfigSnapshot {
    /// Read a snapshot from a JSON file written by the external store.
    ///
    /// Missing keys take their defaults, so partial files work.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&data)
            .map_err(|e| Error::ConfigError(format!("invalid config {}: {e}", path.display())))
    }

    /// Apply the auto-accept policy to an incoming request.
    ///
    /// A transfer is auto-accepted when auto-accept is enabled, the sender is
    /// on the trusted list, and the declared size is within the cap. Anything
    /// else falls through to the interactive prompt.
    #[must_use]
    pub fn should_auto_accept(&self, request: &TransferRequest) -> bool {
        self.auto_accept
            && self.auto_accept_senders.contains(&request.sender)
            && request.file_size <= self.max_auto_accept_size
    }
}

fn default_download_dir() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}
