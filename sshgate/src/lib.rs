//! Library surface for the `sshgate` binary: configuration, the error
//! taxonomy, the typed event bus, the client-channel message router and its
//! SFTP dispatch, the RDP tunnel proxy, and the session actor machinery
//! underneath them all.

pub mod config;
pub mod error;
pub mod events;
pub mod ip;
pub mod models;
pub mod profiles;
pub mod rdp;
pub mod router;
pub mod session;
