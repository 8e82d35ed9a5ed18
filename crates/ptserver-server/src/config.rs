use serde::Deserialize;

/// Server configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// IP address to bind on (default "0.0.0.0").
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port clients connect to.
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    /// Path to the SQLite database file, created and seeded on first run.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Maximum concurrent connections (source's `MAX_CONNECTIONS`).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Override for the `tracing` env-filter (e.g. "debug", "ptserver_server=trace").
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_tcp_port() -> u16 {
    5001
}

fn default_db_path() -> String {
    "ptserver.db".into()
}

fn default_max_connections() -> u32 {
    10240
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            tcp_port: default_tcp_port(),
            db_path: default_db_path(),
            max_connections: default_max_connections(),
            log_level: default_log_level(),
        }
    }
}
