use std::path::PathBuf;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,
    /// Directory holding the server database
    pub data_dir: PathBuf,
    /// Interval between heartbeat frames on open change streams
    pub heartbeat_interval: Duration,
    /// Frames buffered per stream connection before it is dropped
    pub stream_buffer: usize,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let port = lookup("TODOSYNC_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let data_dir = lookup("TODOSYNC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("todosync-server")
            });

        let heartbeat_secs = lookup("TODOSYNC_HEARTBEAT_SECS")
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|s| *s > 0)
            .unwrap_or(30);

        let stream_buffer = lookup("TODOSYNC_STREAM_BUFFER")
            .and_then(|s| s.parse().ok())
            .filter(|s| *s > 0)
            .unwrap_or(64);

        Self {
            port,
            data_dir,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            stream_buffer,
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("server.db")
    }
}
