//! Per-session machinery (§3, §4.1-§4.6, §5): the Transport Adapter, the
//! session actor thread, the async-facing handle wrapping it, the Session
//! Registry, and the periodic Status Sampler / Docker Inspector that ride
//! alongside a live session.

pub mod actor;
pub mod docker;
pub mod handle;
pub mod registry;
pub mod sftp;
pub mod status;
pub mod transport;
pub mod utils;

pub use handle::{SessionHandle, SessionState};
pub use registry::Registry;

/// Session identifiers are server-minted UUIDv4s (§4.1), never supplied by
/// the client.
pub type SessionId = uuid::Uuid;
