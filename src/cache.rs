//! # Session Cache
//!
//! Committed session material per device, read by the control layer before
//! it sends encrypted commands.
//!
//! - Last write wins: a renegotiated session replaces the previous one
//! - Entries live until removed; there is no implicit expiry
//! - Cheap to clone and safe for concurrent readers

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

/// Keys and randoms of an established v3.5 session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMaterial {
    pub device_id: String,
    pub session_key: [u8; 16],
    /// First 12 bytes of the client random
    pub session_iv: [u8; 12],
    pub client_random: [u8; 16],
    pub device_random: [u8; 16],
    /// Address the device answered from
    pub peer: SocketAddr,
    pub established_at: SystemTime,
}

impl SessionMaterial {
    pub fn new(
        device_id: &str,
        session_key: [u8; 16],
        client_random: [u8; 16],
        device_random: [u8; 16],
        peer: SocketAddr,
    ) -> Self {
        let mut session_iv = [0u8; 12];
        session_iv.copy_from_slice(&client_random[..12]);
        Self {
            device_id: device_id.to_string(),
            session_key,
            session_iv,
            client_random,
            device_random,
            peer,
            established_at: SystemTime::now(),
        }
    }
}

/// Thread-safe map of device id to [`SessionMaterial`].
#[derive(Clone, Default)]
pub struct SessionCache {
    inner: Arc<RwLock<HashMap<String, SessionMaterial>>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device_id: &str) -> Option<SessionMaterial> {
        self.inner.read().get(device_id).cloned()
    }

    /// Stores `material` under its device id, returning the replaced entry.
    pub fn insert(&self, material: SessionMaterial) -> Option<SessionMaterial> {
        self.inner
            .write()
            .insert(material.device_id.clone(), material)
    }

    pub fn remove(&self, device_id: &str) -> Option<SessionMaterial> {
        self.inner.write().remove(device_id)
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.inner.read().contains_key(device_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material(id: &str, key_byte: u8) -> SessionMaterial {
        SessionMaterial::new(
            id,
            [key_byte; 16],
            [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16],
            [9; 16],
            "10.0.0.2:6669".parse().unwrap(),
        )
    }

    #[test]
    fn test_session_iv_is_client_random_prefix() {
        let m = material("dev", 0);
        assert_eq!(m.session_iv, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn test_last_write_wins() {
        let cache = SessionCache::new();
        assert!(cache.insert(material("dev", 1)).is_none());
        let previous = cache.insert(material("dev", 2)).unwrap();
        assert_eq!(previous.session_key, [1; 16]);
        assert_eq!(cache.get("dev").unwrap().session_key, [2; 16]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_clones_share_state() {
        let cache = SessionCache::new();
        let reader = cache.clone();
        cache.insert(material("a", 1));
        cache.insert(material("b", 1));
        assert!(reader.contains("a"));

        let mut ids = reader.device_ids();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(reader.remove("a").is_some());
        assert!(!cache.contains("a"));
        cache.clear();
        assert!(reader.is_empty());
    }
}
