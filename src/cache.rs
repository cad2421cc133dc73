//! Content-addressed memoisation of node outputs.
//!
//! A [`ResultCache`] stores opaque strings keyed by `(node name, key)`.
//! The runner derives the key from a fingerprint of the node plus the
//! canonical JSON of its inputs and the run's root input, so re-running a
//! deterministic node with identical inputs skips its body entirely.
//!
//! Cache failures are never fatal to a workflow: the node runner logs and
//! falls through to executing the body.

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors surfaced by cache backends.
#[derive(Debug, Error, Diagnostic)]
pub enum CacheError {
    /// The backing store failed; callers treat this as a miss.
    #[error("cache backend error: {0}")]
    #[diagnostic(code(trellis::cache::backend))]
    Backend(String),
}

/// Narrow interface the runners consume for result memoisation.
///
/// Values are opaque strings; callers caching structured data serialise
/// it themselves. Implementations must be safe for concurrent access.
#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Look up a cached value. A miss is `Ok(None)`.
    async fn get(&self, node: &str, key: &str) -> Result<Option<String>, CacheError>;

    /// Store a value.
    async fn set(&self, node: &str, key: &str, value: String) -> Result<(), CacheError>;

    /// Drop all entries for `node`, or everything when `node` is `None`.
    async fn clear(&self, node: Option<&str>) -> Result<(), CacheError>;
}

/// Associative-map cache, suitable for tests and single-process runs.
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<FxHashMap<String, FxHashMap<String, String>>>,
}

impl InMemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries stored for `node`.
    #[must_use]
    pub fn len(&self, node: &str) -> usize {
        self.entries.lock().get(node).map_or(0, FxHashMap::len)
    }

    #[must_use]
    pub fn is_empty(&self, node: &str) -> bool {
        self.len(node) == 0
    }
}

#[async_trait]
impl ResultCache for InMemoryCache {
    async fn get(&self, node: &str, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self
            .entries
            .lock()
            .get(node)
            .and_then(|bucket| bucket.get(key))
            .cloned())
    }

    async fn set(&self, node: &str, key: &str, value: String) -> Result<(), CacheError> {
        self.entries
            .lock()
            .entry(node.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn clear(&self, node: Option<&str>) -> Result<(), CacheError> {
        let mut entries = self.entries.lock();
        match node {
            Some(node) => {
                entries.remove(node);
            }
            None => entries.clear(),
        }
        Ok(())
    }
}

/// Render a value as JSON with object keys sorted recursively.
///
/// Deterministic key ordering is what makes the cache key stable across
/// runs and processes.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Derive the cache key for one node invocation.
///
/// `fingerprint` is the node's stable identity (name plus declared
/// version); inputs and root input are canonicalised so key ordering in
/// the input bag cannot produce distinct keys.
#[must_use]
pub fn cache_key(fingerprint: &str, inputs: &Value, root_input: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.as_bytes());
    hasher.update([0x1f]);
    hasher.update(canonical_json(inputs).as_bytes());
    hasher.update([0x1f]);
    hasher.update(canonical_json(root_input).as_bytes());
    format!("{:x}", hasher.finalize())
}
