use std::time::Duration;

use parser::FromYaml;
use parser_derive::FromYaml;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_SESS: usize = 1024;
pub const DEFAULT_SESS_WORKSPACE: usize = 16 * 1024;
pub const DEFAULT_HTTP_MAX_HDR: usize = 64;
pub const DEFAULT_HTTP_REQ_SIZE: usize = 8 * 1024;
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 600_000;
pub const DEFAULT_LRU_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_RESTARTS: u32 = 4;
pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Clone, FromYaml)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            host: "127.0.0.1".to_string(),
            port: 80,
            connect_timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, FromYaml)]
pub struct ServerConfig {
    pub host: String,
    pub ports: Vec<u16>,
    pub backend: BackendConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: DEFAULT_HOST.to_string(),
            ports: vec![DEFAULT_PORT],
            backend: BackendConfig::default(),
        }
    }
}

/// The cache-proxy equivalent of `cache_param`: the tunables that
/// `SessionPool`/`OutputBuffer`/`Engine` are built from.
#[derive(Debug, Clone, FromYaml)]
pub struct CacheParams {
    pub max_sess: usize,
    pub sess_workspace: usize,
    pub http_max_hdr: usize,
    pub http_req_size: usize,
    pub send_timeout_ms: u64,
    pub lru_timeout_secs: u64,
    pub max_restarts: u32,
    pub workers: usize,
    /// Corresponds to `cache_param->diag_bitmap`'s per-state trace bit.
    pub trace_steps: bool,
}

impl Default for CacheParams {
    fn default() -> Self {
        CacheParams {
            max_sess: DEFAULT_MAX_SESS,
            sess_workspace: DEFAULT_SESS_WORKSPACE,
            http_max_hdr: DEFAULT_HTTP_MAX_HDR,
            http_req_size: DEFAULT_HTTP_REQ_SIZE,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            lru_timeout_secs: DEFAULT_LRU_TIMEOUT_SECS,
            max_restarts: DEFAULT_MAX_RESTARTS,
            workers: DEFAULT_WORKERS,
            trace_steps: false,
        }
    }
}

impl CacheParams {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn lru_timeout(&self) -> Duration {
        Duration::from_secs(self.lru_timeout_secs)
    }
}

#[derive(Debug, Clone, FromYaml)]
pub struct AppConfig {
    pub servers: Vec<ServerConfig>,
    pub params: CacheParams,
    pub debug_socket: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            servers: vec![ServerConfig::default()],
            params: CacheParams::default(),
            debug_socket: None,
        }
    }
}

impl AppConfig {
    pub fn load(path: &str) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = AppConfig::from_str(&content)?;
        validate(&config)?;
        Ok(config)
    }

    pub fn display_config(&self) {
        println!("{self}");
    }
}

/// Reject configs with no listen ports, or backend ports of 0.
/// Grounded on the teacher's `config/validate.rs` conflict-dropping
/// approach, narrowed to a single pass returning the first error
/// instead of silently dropping conflicting entries: a cache proxy with
/// a misconfigured backend should refuse to start, not run degraded.
fn validate(config: &AppConfig) -> crate::error::Result<()> {
    if config.servers.is_empty() {
        return Err("config must declare at least one server".into());
    }
    for server in &config.servers {
        if server.ports.is_empty() {
            return Err(format!("server '{}' declares no ports", server.host).into());
        }
        if server.backend.port == 0 {
            return Err(format!("server '{}' has backend port 0", server.host).into());
        }
    }
    if config.params.max_sess == 0 {
        return Err("params.max_sess must be > 0".into());
    }
    Ok(())
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "  \x1b[38;5;244m───────────────────────────────────────────────\x1b[0m")?;
        for server in &self.servers {
            writeln!(
                f,
                "  \x1b[1;34m⦿\x1b[0m \x1b[1;37mListen:\x1b[0m \x1b[32m{}\x1b[0m on \x1b[1;32m{:?}\x1b[0m -> backend \x1b[36m{}:{}\x1b[0m",
                server.host, server.ports, server.backend.host, server.backend.port
            )?;
        }
        writeln!(
            f,
            "  \x1b[1;34m⦿\x1b[0m \x1b[1;37mSessions:\x1b[0m max \x1b[33m{}\x1b[0m, workspace \x1b[33m{}B\x1b[0m, workers \x1b[33m{}\x1b[0m",
            self.params.max_sess, self.params.sess_workspace, self.params.workers
        )?;
        writeln!(
            f,
            "  \x1b[1;34m⦿\x1b[0m \x1b[1;37mTimeouts:\x1b[0m send \x1b[33m{}ms\x1b[0m, lru \x1b[33m{}s\x1b[0m, max_restarts \x1b[33m{}\x1b[0m",
            self.params.send_timeout_ms, self.params.lru_timeout_secs, self.params.max_restarts
        )?;
        writeln!(f, "  \x1b[38;5;244m───────────────────────────────────────────────\x1b[0m")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
servers:
  - host: 0.0.0.0
    ports: [8080, 8081]
    backend:
      host: 127.0.0.1
      port: 9000
      connect_timeout_ms: 500
params:
  max_sess: 256
  sess_workspace: 4096
  http_max_hdr: 32
  http_req_size: 4096
  send_timeout_ms: 60000
  lru_timeout_secs: 30
  max_restarts: 2
  workers: 2
  trace_steps: true
debug_socket: /tmp/proxy.sock
";

    #[test]
    fn parses_full_config() {
        let config = AppConfig::from_str(SAMPLE).expect("config should parse");
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].ports, vec![8080, 8081]);
        assert_eq!(config.servers[0].backend.port, 9000);
        assert_eq!(config.params.max_sess, 256);
        assert!(config.params.trace_steps);
        assert_eq!(config.debug_socket.as_deref(), Some("/tmp/proxy.sock"));
    }

    #[test]
    fn rejects_zero_backend_port() {
        let bad = SAMPLE.replace("port: 9000", "port: 0");
        let config = AppConfig::from_str(&bad).expect("should still parse syntactically");
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_empty_servers() {
        let config = AppConfig {
            servers: Vec::new(),
            ..AppConfig::default()
        };
        assert!(validate(&config).is_err());
    }
}
