//! External seam (§1 out-of-scope): persistent connection-profile storage
//! and the credential decryption primitive. The gateway only ever depends on
//! the two traits below — `ProfileStore` and `Decryptor` — the same way the
//! spec treats them as opaque collaborators (`Decrypt(ciphertext)->plaintext`,
//! a CRUD-only profile table). A real deployment wires in a database-backed
//! store and a KMS-backed decryptor; `StaticProfileStore` and
//! `PassthroughDecryptor` are the trivial stand-ins this crate ships so the
//! gateway is runnable standalone.

use crate::error::GatewayError;
use crate::models::{AuthMethod, ConnectionSpec, ProxyConfig};
use std::collections::HashMap;
use std::sync::RwLock;

/// A connection profile exactly as the external store persists it: secrets
/// are still ciphertext. Mirrors `ConnectionSpec` (§3) field-for-field,
/// swapping the plaintext secret fields for their encrypted form.
#[derive(Debug, Clone)]
pub struct EncryptedConnectionSpec {
    pub connection_id: i64,
    pub connection_name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_method: AuthMethod,
    pub password_ciphertext: Option<String>,
    pub private_key_ciphertext: Option<String>,
    pub passphrase_ciphertext: Option<String>,
    pub proxy: Option<ProxyConfig>,
}

/// Lookup seam for the connection-profile table (CRUD itself is out of
/// scope, §1). `connection_id` must be a valid non-negative integer (§3).
pub trait ProfileStore: Send + Sync {
    fn load(&self, connection_id: i64) -> Result<EncryptedConnectionSpec, GatewayError>;
}

/// The opaque decryption primitive from §1: `Decrypt(ciphertext) -> plaintext`.
pub trait Decryptor: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<String, GatewayError>;
}

/// Stand-in decryptor that treats stored values as already-plaintext. Only
/// appropriate for local/standalone deployments or tests; a production
/// gateway injects a real KMS/AEAD-backed implementation instead.
pub struct PassthroughDecryptor;

impl Decryptor for PassthroughDecryptor {
    fn decrypt(&self, ciphertext: &str) -> Result<String, GatewayError> {
        Ok(ciphertext.to_string())
    }
}

/// In-memory profile table, guarded by an `RwLock` the same way the
/// teacher's settings store serializes reads against occasional writes.
/// Fine for tests and single-process deployments; a production store is a
/// thin read-through cache over the external database instead.
#[derive(Default)]
pub struct StaticProfileStore {
    profiles: RwLock<HashMap<i64, EncryptedConnectionSpec>>,
}

impl StaticProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: EncryptedConnectionSpec) {
        self.profiles.write().unwrap().insert(profile.connection_id, profile);
    }
}

impl ProfileStore for StaticProfileStore {
    fn load(&self, connection_id: i64) -> Result<EncryptedConnectionSpec, GatewayError> {
        self.profiles
            .read()
            .unwrap()
            .get(&connection_id)
            .cloned()
            .ok_or_else(|| GatewayError::precondition(format!("unknown connectionId {connection_id}")))
    }
}

/// Decrypt every secret field of `encrypted` through `decryptor`, producing
/// the plaintext `ConnectionSpec` the Transport Adapter (C2) consumes.
pub fn decrypt_spec(encrypted: EncryptedConnectionSpec, decryptor: &dyn Decryptor) -> Result<ConnectionSpec, GatewayError> {
    Ok(ConnectionSpec {
        connection_id: encrypted.connection_id,
        connection_name: encrypted.connection_name,
        host: encrypted.host,
        port: encrypted.port,
        username: encrypted.username,
        auth_method: encrypted.auth_method,
        password: encrypted.password_ciphertext.map(|c| decryptor.decrypt(&c)).transpose()?,
        private_key: encrypted.private_key_ciphertext.map(|c| decryptor.decrypt(&c)).transpose()?,
        passphrase: encrypted.passphrase_ciphertext.map(|c| decryptor.decrypt(&c)).transpose()?,
        proxy: encrypted.proxy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_connection_id_is_a_precondition_error() {
        let store = StaticProfileStore::new();
        assert!(matches!(store.load(99), Err(GatewayError::Precondition { .. })));
    }

    #[test]
    fn decrypt_spec_passes_through_plaintext_fields() {
        let encrypted = EncryptedConnectionSpec {
            connection_id: 1,
            connection_name: "box".into(),
            host: "example.com".into(),
            port: 22,
            username: "root".into(),
            auth_method: AuthMethod::Password,
            password_ciphertext: Some("secret".into()),
            private_key_ciphertext: None,
            passphrase_ciphertext: None,
            proxy: None,
        };
        let spec = decrypt_spec(encrypted, &PassthroughDecryptor).unwrap();
        assert_eq!(spec.password.as_deref(), Some("secret"));
        assert_eq!(spec.host, "example.com");
    }

    #[test]
    fn store_round_trip() {
        let store = StaticProfileStore::new();
        store.insert(EncryptedConnectionSpec {
            connection_id: 42,
            connection_name: "prod".into(),
            host: "10.0.0.1".into(),
            port: 22,
            username: "deploy".into(),
            auth_method: AuthMethod::Key,
            password_ciphertext: None,
            private_key_ciphertext: Some("key-cipher".into()),
            passphrase_ciphertext: None,
            proxy: None,
        });
        let loaded = store.load(42).unwrap();
        assert_eq!(loaded.host, "10.0.0.1");
    }
}
