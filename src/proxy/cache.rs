//! Per-route response cache
//!
//! Each route with caching enabled gets its own LRU bounded by
//! `max_entries`, with a TTL per entry. Keys are derived only from the
//! sanitized request, so a hit can never hand back a response produced for
//! unredacted content.

use crate::domain::{canonical_json, GatewayRequest, Route, RouteName};
use crate::policy::params::is_volatile;
use crate::providers::ResponseMetadata;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// A buffered upstream response, replayed byte for byte on a hit
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: u16,
    pub body: Bytes,
    pub metadata: ResponseMetadata,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    response: CachedResponse,
    expires_at: Instant,
}

/// LRU with per-entry TTL for a single route
#[derive(Debug)]
pub struct ResponseCache {
    ttl: Duration,
    max_entries: usize,
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn touch(&mut self, key: &str) {
        self.order.retain(|candidate| candidate != key);
        self.order.push_back(key.to_string());
    }

    pub fn get(&mut self, key: &str, now: Instant) -> Option<CachedResponse> {
        let expires_at = self.entries.get(key)?.expires_at;
        if now >= expires_at {
            self.entries.remove(key);
            self.order.retain(|candidate| candidate != key);
            return None;
        }
        self.touch(key);
        self.entries.get(key).map(|entry| entry.response.clone())
    }

    pub fn insert(&mut self, key: String, response: CachedResponse, now: Instant) {
        if self.ttl.is_zero() || self.max_entries == 0 {
            return;
        }
        let entry = CacheEntry {
            response,
            expires_at: now + self.ttl,
        };
        self.entries.insert(key.clone(), entry);
        self.touch(&key);

        while self.entries.len() > self.max_entries {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }
}

/// Caches created lazily, one per route
#[derive(Debug, Default)]
pub struct CacheRegistry {
    caches: Mutex<HashMap<RouteName, ResponseCache>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, route: &Route, key: &str) -> Option<CachedResponse> {
        let mut caches = self.caches.lock();
        caches
            .get_mut(&route.name)?
            .get(key, Instant::now())
    }

    pub fn insert(&self, route: &Route, key: String, response: CachedResponse) {
        let Some(settings) = route.cache_settings() else {
            return;
        };
        let mut caches = self.caches.lock();
        caches
            .entry(route.name.clone())
            .or_insert_with(|| {
                ResponseCache::new(
                    Duration::from_millis(settings.ttl_ms),
                    settings.max_entries,
                )
            })
            .insert(key, response, Instant::now());
    }

    pub fn entries(&self, route: &RouteName) -> usize {
        self.caches.lock().get(route).map_or(0, ResponseCache::len)
    }
}

/// Stable key over everything that determines the upstream response.
///
/// Parameters only take part when `include_params` is set, and volatile
/// correlation keys never do.
pub fn build_cache_key(route: &Route, request: &GatewayRequest, include_params: bool) -> String {
    let mut material = Map::new();
    material.insert("route".into(), Value::String(route.name.to_string()));
    material.insert(
        "provider".into(),
        Value::String(route.provider.kind.as_str().to_string()),
    );
    material.insert(
        "endpoint_type".into(),
        Value::String(route.provider.endpoint_type.as_str().to_string()),
    );
    material.insert(
        "model".into(),
        Value::String(route.provider.model.to_string()),
    );
    material.insert(
        "redaction_mode".into(),
        Value::String(route.redaction_mode().as_str().to_string()),
    );
    material.insert(
        "payload".into(),
        Value::Object(request.payload.to_json_fields()),
    );
    if include_params {
        let params: Map<String, Value> = request
            .params
            .iter()
            .filter(|(key, _)| !is_volatile(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        material.insert("params".into(), Value::Object(params));
    }

    let canonical = canonical_json(&Value::Object(material));
    hex::encode(Sha256::digest(canonical.as_bytes()))
}
