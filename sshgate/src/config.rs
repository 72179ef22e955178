//! Layered configuration (§6.3, §2a): environment variables first, an optional
//! TOML file second, hard defaults last. Mirrors the shape of the teacher's own
//! `db::get_settings`/`save_settings` pair, minus the persistence (out of scope,
//! §1) — this is the in-process view of the same knobs.

use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    Local,
    Docker,
    Other,
}

impl Default for DeploymentMode {
    fn default() -> Self {
        DeploymentMode::Other
    }
}

impl std::str::FromStr for DeploymentMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "local" => DeploymentMode::Local,
            "docker" => DeploymentMode::Docker,
            _ => DeploymentMode::Other,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub deployment_mode: DeploymentMode,
    pub rdp_service_url_local: String,
    pub rdp_service_url_docker: String,
    pub docker_status_interval_secs: u64,
    pub status_sampler_interval_secs: u64,
    pub ssh_connect_timeout_secs: u64,
    pub sftp_transcode_buffer_kb: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7890".parse().unwrap(),
            deployment_mode: DeploymentMode::Other,
            rdp_service_url_local: "ws://localhost:8081".to_string(),
            rdp_service_url_docker: "ws://rdp:8081".to_string(),
            docker_status_interval_secs: 2,
            status_sampler_interval_secs: 1,
            ssh_connect_timeout_secs: 20,
            sftp_transcode_buffer_kb: 512,
        }
    }
}

impl Config {
    /// Build a `Config` from, in increasing precedence: hard defaults, an
    /// optional TOML file at `path`, then environment variables.
    pub fn load(path: Option<&str>) -> Self {
        let mut cfg = Config::default();

        if let Some(path) = path {
            if let Ok(raw) = std::fs::read_to_string(path) {
                match toml::from_str::<Config>(&raw) {
                    Ok(from_file) => cfg = from_file,
                    Err(e) => tracing::warn!(error = %e, path, "failed to parse config file, using defaults"),
                }
            }
        }

        if let Ok(v) = std::env::var("BIND_ADDR") {
            if let Ok(addr) = v.parse() {
                cfg.bind_addr = addr;
            }
        }
        if let Ok(v) = std::env::var("DEPLOYMENT_MODE") {
            cfg.deployment_mode = v.parse().unwrap_or(DeploymentMode::Other);
        }
        if let Ok(v) = std::env::var("RDP_SERVICE_URL_LOCAL") {
            cfg.rdp_service_url_local = v;
        }
        if let Ok(v) = std::env::var("RDP_SERVICE_URL_DOCKER") {
            cfg.rdp_service_url_docker = v;
        }
        if let Ok(v) = std::env::var("dockerStatusIntervalSeconds") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.docker_status_interval_secs = n.max(1);
            }
        }
        if let Ok(v) = std::env::var("STATUS_SAMPLER_INTERVAL_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.status_sampler_interval_secs = n.max(1);
            }
        }
        if let Ok(v) = std::env::var("SSH_CONNECT_TIMEOUT_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.ssh_connect_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("SFTP_TRANSCODE_BUFFER_KB") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.sftp_transcode_buffer_kb = n;
            }
        }

        cfg
    }

    pub fn rdp_upstream_base(&self) -> &str {
        match self.deployment_mode {
            DeploymentMode::Local => &self.rdp_service_url_local,
            DeploymentMode::Docker => &self.rdp_service_url_docker,
            DeploymentMode::Other => &self.rdp_service_url_local,
        }
    }

    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout_secs)
    }

    pub fn status_sampler_interval(&self) -> Duration {
        Duration::from_secs(self.status_sampler_interval_secs.max(1))
    }

    pub fn docker_status_interval(&self) -> Duration {
        Duration::from_secs(self.docker_status_interval_secs.max(1))
    }

    pub fn sftp_buffer_size(&self) -> usize {
        self.sftp_transcode_buffer_kb * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rdp_upstream_base_picks_mode() {
        let mut cfg = Config::default();
        cfg.deployment_mode = DeploymentMode::Docker;
        assert_eq!(cfg.rdp_upstream_base(), "ws://rdp:8081");
        cfg.deployment_mode = DeploymentMode::Local;
        assert_eq!(cfg.rdp_upstream_base(), "ws://localhost:8081");
    }

    #[test]
    fn deployment_mode_parses_case_insensitively() {
        assert_eq!("Docker".parse::<DeploymentMode>().unwrap(), DeploymentMode::Docker);
        assert_eq!("bogus".parse::<DeploymentMode>().unwrap(), DeploymentMode::Other);
    }

    #[test]
    fn load_reads_a_toml_file_and_falls_back_to_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sshgate.toml");
        std::fs::write(&path, "bind_addr = \"127.0.0.1:9000\"\ndeployment_mode = \"docker\"\n").unwrap();

        let cfg = Config::load(Some(path.to_str().unwrap()));
        assert_eq!(cfg.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(cfg.deployment_mode, DeploymentMode::Docker);
        // Fields absent from the file keep their hard defaults.
        assert_eq!(cfg.ssh_connect_timeout_secs, Config::default().ssh_connect_timeout_secs);
    }

    #[test]
    fn load_falls_back_to_defaults_when_the_file_is_missing() {
        let cfg = Config::load(Some("/nonexistent/path/sshgate.toml"));
        assert_eq!(cfg.bind_addr, Config::default().bind_addr);
    }
}
