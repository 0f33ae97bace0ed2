use std::path::Path;
use std::time::Duration;

use callcore::types::IceServer;
use thiserror::Error;

/// Configuration for the call controller.
#[derive(Clone, Debug)]
pub struct CallControllerConfig {
    /// Whether frame encryption is offered and accepted.
    pub encryption_supported: bool,
    /// Servers used when a command carries none. Falls back to the built-in
    /// list when unset.
    pub ice_servers: Option<Vec<IceServer>>,
    /// How long `start` waits for the first local candidate.
    pub ice_gathering_timeout: Duration,
    /// Poll interval of that wait.
    pub ice_gathering_step: Duration,
    /// ICE inactivity before the transport reports disconnected.
    pub inactivity_timeout: Duration,
    /// Forward candidates gathered after the offer or answer as `ice`
    /// responses.
    pub trickle_ice: bool,
}

impl Default for CallControllerConfig {
    fn default() -> Self {
        Self {
            encryption_supported: true,
            ice_servers: None,
            ice_gathering_timeout: Duration::from_secs(10),
            ice_gathering_step: Duration::from_secs(1),
            inactivity_timeout: Duration::from_secs(30),
            trickle_ice: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid ICE server list: {0}")]
    Json(#[from] serde_json::Error),
    #[error("ICE server list is empty")]
    Empty,
}

/// Reads a JSON array of ICE servers, e.g.
/// `[{"urls": ["stun:stun.example.org:3478"]}]`.
pub async fn load_ice_servers(path: impl AsRef<Path>) -> Result<Vec<IceServer>, ConfigError> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
    let servers: Vec<IceServer> = serde_json::from_str(&text)?;
    if servers.is_empty() {
        return Err(ConfigError::Empty);
    }
    Ok(servers)
}
