//! Server configuration.

use torii_api::*;

/// Configuration for running a [crate::DomainSrv].
#[derive(Debug, Clone)]
pub struct Config {
    /// The application data directory: the settings file, the entities
    /// file, uploaded scripts, and backup archives live under it.
    pub data_dir: std::path::PathBuf,

    /// The address the datagram endpoint binds.
    ///
    /// Defaults:
    /// - `testing = "127.0.0.1:0"`
    /// - `production = "0.0.0.0:40102"`
    pub listen_addr: std::net::SocketAddr,

    /// The address the admin HTTP server binds.
    ///
    /// Defaults:
    /// - `testing = "127.0.0.1:0"`
    /// - `production = "0.0.0.0:40100"`
    pub http_addr: std::net::SocketAddr,

    /// The path to a TLS certificate file (PEM). When provided together
    /// with `tls_key`, an HTTPS server is started as well.
    pub tls_cert: Option<std::path::PathBuf>,

    /// The path to a TLS key file (PEM).
    pub tls_key: Option<std::path::PathBuf>,

    /// The address the HTTPS server binds, when TLS is configured.
    pub https_addr: std::net::SocketAddr,

    /// The ice-server to heartbeat, as `(hostname, port)`.
    pub ice_server: (String, u16),

    /// The metaverse API base url.
    pub metaverse_url: String,

    /// Domain id override (the `-d` flag). `None` reads the settings
    /// store, falling back to a temporary domain.
    pub domain_id: Option<DomainId>,

    /// Exit when this parent process dies.
    pub parent_pid: Option<u32>,
}

impl Config {
    /// A configuration suitable for tests: ephemeral ports, a
    /// caller-provided scratch directory.
    pub fn testing(data_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            listen_addr: "127.0.0.1:0".parse().expect("static addr"),
            http_addr: "127.0.0.1:0".parse().expect("static addr"),
            tls_cert: None,
            tls_key: None,
            https_addr: "127.0.0.1:0".parse().expect("static addr"),
            ice_server: ("ice.example.test".into(), 7337),
            metaverse_url: "http://127.0.0.1:1".into(),
            domain_id: Some(DomainId::generate()),
            parent_pid: None,
        }
    }

    /// A configuration suitable for production deployment.
    pub fn production(data_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            listen_addr: "0.0.0.0:40102".parse().expect("static addr"),
            http_addr: "0.0.0.0:40100".parse().expect("static addr"),
            tls_cert: None,
            tls_key: None,
            https_addr: "0.0.0.0:40101".parse().expect("static addr"),
            ice_server: ("ice.highfidelity.com".into(), 7337),
            metaverse_url: "https://metaverse.highfidelity.com".into(),
            domain_id: None,
            parent_pid: None,
        }
    }

    /// The settings file path.
    pub fn settings_path(&self) -> std::path::PathBuf {
        self.data_dir.join("settings.json")
    }

    /// The entities directory.
    pub fn entities_dir(&self) -> std::path::PathBuf {
        self.data_dir.join("entities")
    }

    /// The backup archive directory.
    pub fn backups_dir(&self) -> std::path::PathBuf {
        self.data_dir.join("backups")
    }

    /// The uploaded-script directory.
    pub fn scripts_dir(&self) -> std::path::PathBuf {
        self.data_dir.join("scripts")
    }

    /// The asset blob directory.
    pub fn assets_dir(&self) -> std::path::PathBuf {
        self.data_dir.join("assets")
    }
}
