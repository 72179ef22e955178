use serde::{Deserialize, Serialize};

/// Authentication method for an SSH connection spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Password,
    Key,
}

/// Proxy configuration carried alongside a connection spec (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProxyConfig {
    Socks5 {
        host: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
    },
    HttpConnect {
        host: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
    },
}

/// A fully decrypted connection spec, as handed to the Transport Adapter.
/// `connection_id` ties it back to the external profile store; persistence of
/// the profile itself is out of scope (§1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSpec {
    pub connection_id: i64,
    pub connection_name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_method: AuthMethod,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
    pub proxy: Option<ProxyConfig>,
}

/// A decoded `stat`/`lstat` result, exposed over the wire as `attrs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAttrs {
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    /// milliseconds since epoch
    pub atime: i64,
    /// milliseconds since epoch
    pub mtime: i64,
    pub is_directory: bool,
    pub is_file: bool,
    pub is_symbolic_link: bool,
}

/// A directory entry as returned by `sftp:readdir` (§4.5.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub filename: String,
    pub longname: String,
    pub attrs: FileAttrs,
    /// best-effort uid -> username resolution, kept from the teacher's
    /// directory-listing owner cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// One chunked-upload transfer in flight (§4.5.5, §3 `ActiveUpload`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    pub upload_id: String,
    pub remote_path: String,
    pub total_size: u64,
    pub bytes_written: u64,
}

/// Previous-tick network counters for a session's status sampler (§3 `NetworkRateCache`).
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkSample {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub at: Option<std::time::Instant>,
}

/// One port mapping as reported by `docker ps` (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DockerPort {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub private_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_port: Option<u16>,
    #[serde(rename = "Type")]
    pub port_type: String,
}

/// Per-container live resource usage from `docker stats` (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DockerStats {
    pub cpu_perc: String,
    pub mem_usage: String,
    pub mem_perc: String,
    pub net_io: String,
    pub block_io: String,
    pub pids: String,
}

/// One entry of `docker ps -a`, enriched with `stats` for running containers (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DockerContainer {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub command: String,
    pub state: String,
    pub status: String,
    pub ports: Vec<DockerPort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<DockerStats>,
}

/// The common envelope every message over the client channel is framed in (§6.1).
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(rename = "requestId", default)]
    pub request_id: Option<String>,
}

/// Outbound frames are built ad hoc per handler via `OutboundEnvelope::new`, since
/// payload shapes are operation-specific; this just fixes the envelope's serialized
/// shape so every call site produces the same field names.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl OutboundEnvelope {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: None,
            request_id: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }
}
