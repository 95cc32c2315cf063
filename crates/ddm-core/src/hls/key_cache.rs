//! Per-task decryption key cache.
//!
//! Keys are small (16 bytes) and a media playlist typically reuses the same
//! `EXT-X-KEY` URI across many segments; caching avoids refetching it once
//! per segment.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct KeyCache {
    keys: Mutex<HashMap<String, [u8; 16]>>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uri: &str) -> Option<[u8; 16]> {
        self.keys.lock().unwrap().get(uri).copied()
    }

    pub fn insert(&self, uri: impl Into<String>, key: [u8; 16]) {
        self.keys.lock().unwrap().insert(uri.into(), key);
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_and_returns_keys() {
        let cache = KeyCache::new();
        assert!(cache.get("https://cdn.example.com/key1.bin").is_none());
        cache.insert("https://cdn.example.com/key1.bin", [7u8; 16]);
        assert_eq!(cache.get("https://cdn.example.com/key1.bin"), Some([7u8; 16]));
        assert_eq!(cache.len(), 1);
    }
}
