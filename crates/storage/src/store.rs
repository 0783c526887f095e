// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tiered result storage.
//!
//! Tool outputs above the inline threshold are externalized here; events
//! carry only the [`ResultRef`]. Tier selection follows the `auto` rule on
//! payload size and scope.

use crate::kv::{KvError, KvStore};
use async_trait::async_trait;
use base64::Engine as _;
use noetl_core::{ResultRef, ResultScope, StoreTier};
use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("result not found: {0}")]
    NotFound(String),
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("kv tier error: {0}")]
    Kv(#[from] KvError),
    #[error("corrupt stored payload at {uri}: {reason}")]
    Corrupt { uri: String, reason: String },
    #[error("no backend for tier {0}")]
    NoBackend(StoreTier),
}

/// Storage backend for one tier.
#[async_trait]
pub trait ResultBackend: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String, StoreError>;
    async fn get(&self, uri: &str) -> Result<Vec<u8>, StoreError>;
    async fn delete(&self, uri: &str) -> Result<(), StoreError>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Process-memory tier.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultBackend for MemoryBackend {
    async fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<String, StoreError> {
        let uri = format!("mem://{key}");
        self.entries.lock().insert(uri.clone(), bytes.to_vec());
        Ok(uri)
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>, StoreError> {
        self.entries
            .lock()
            .get(uri)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(uri.to_string()))
    }

    async fn delete(&self, uri: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(uri);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let full = format!("mem://{prefix}");
        Ok(self.entries.lock().keys().filter(|k| k.starts_with(&full)).cloned().collect())
    }
}

/// KV-backed tier for payloads up to ~1 MiB. Bytes are base64-wrapped
/// since the KV speaks JSON values.
pub struct KvBackend {
    kv: Arc<dyn KvStore>,
}

impl KvBackend {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn kv_key(uri: &str) -> &str {
        uri.strip_prefix("kv://").unwrap_or(uri)
    }
}

#[async_trait]
impl ResultBackend for KvBackend {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String, StoreError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        let uri = format!("kv://result:{key}");
        self.kv
            .put(
                Self::kv_key(&uri),
                serde_json::json!({"content_type": content_type, "data": encoded}),
                None,
            )
            .await?;
        Ok(uri)
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>, StoreError> {
        let entry = self
            .kv
            .get(Self::kv_key(uri))
            .await?
            .ok_or_else(|| StoreError::NotFound(uri.to_string()))?;
        let encoded = entry
            .0
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Corrupt {
                uri: uri.to_string(),
                reason: "missing data field".into(),
            })?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| StoreError::Corrupt { uri: uri.to_string(), reason: e.to_string() })
    }

    async fn delete(&self, uri: &str) -> Result<(), StoreError> {
        self.kv.delete(Self::kv_key(uri)).await?;
        Ok(())
    }

    async fn list(&self, _prefix: &str) -> Result<Vec<String>, StoreError> {
        // The KV contract has no scan; refs are tracked engine-side.
        Ok(Vec::new())
    }
}

/// Filesystem object tier (serves the `object` and `cloud` tiers locally).
pub struct FsObjectBackend {
    root: PathBuf,
}

impl FsObjectBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn file_name(key: &str) -> String {
        key.replace([':', '/'], "_")
    }

    fn path_for(&self, uri: &str) -> PathBuf {
        let name = uri.strip_prefix("obj://").unwrap_or(uri);
        self.root.join(name)
    }
}

#[async_trait]
impl ResultBackend for FsObjectBackend {
    async fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<String, StoreError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let name = Self::file_name(key);
        tokio::fs::write(self.root.join(&name), bytes).await?;
        Ok(format!("obj://{name}"))
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(uri);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(uri.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, uri: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(uri)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let wanted = Self::file_name(prefix);
        let mut out = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&wanted) {
                out.push(format!("obj://{name}"));
            }
        }
        Ok(out)
    }
}

/// Result store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Compress payloads at or above this size (zstd)
    pub compress_min_bytes: usize,
    pub compression_level: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { compress_min_bytes: 4 * 1024, compression_level: 3 }
    }
}

/// Tier-routing store: picks a backend per the `auto` rule and mints
/// [`ResultRef`]s with digests and compression tags.
pub struct TieredStore {
    memory: MemoryBackend,
    kv: Option<KvBackend>,
    object: Option<FsObjectBackend>,
    cloud: Option<Arc<dyn ResultBackend>>,
    config: StoreConfig,
}

impl TieredStore {
    /// Memory-only store (tests, embedded use). Higher tiers fall back to
    /// process memory.
    pub fn in_memory() -> Self {
        Self {
            memory: MemoryBackend::new(),
            kv: None,
            object: None,
            cloud: None,
            config: StoreConfig::default(),
        }
    }

    pub fn new(config: StoreConfig) -> Self {
        Self { memory: MemoryBackend::new(), kv: None, object: None, cloud: None, config }
    }

    pub fn with_kv(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(KvBackend::new(kv));
        self
    }

    pub fn with_object_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.object = Some(FsObjectBackend::new(root));
        self
    }

    pub fn with_cloud(mut self, cloud: Arc<dyn ResultBackend>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    fn backend_for(&self, tier: StoreTier) -> &dyn ResultBackend {
        match tier {
            StoreTier::Memory => &self.memory,
            StoreTier::Kv => self.kv.as_ref().map(|b| b as &dyn ResultBackend).unwrap_or(&self.memory),
            StoreTier::Object => {
                self.object.as_ref().map(|b| b as &dyn ResultBackend).unwrap_or(&self.memory)
            }
            StoreTier::Cloud => self
                .cloud
                .as_deref()
                .or(self.object.as_ref().map(|b| b as &dyn ResultBackend))
                .unwrap_or(&self.memory),
        }
    }

    fn backend_for_uri(&self, uri: &str) -> &dyn ResultBackend {
        if uri.starts_with("kv://") {
            self.backend_for(StoreTier::Kv)
        } else if uri.starts_with("obj://") {
            self.backend_for(StoreTier::Object)
        } else if uri.starts_with("mem://") {
            &self.memory
        } else {
            self.backend_for(StoreTier::Cloud)
        }
    }

    /// Externalize a JSON payload and mint its ref, picking the tier by
    /// the `auto` rule.
    ///
    /// `extracted` and `preview` are filled by the caller (selection
    /// happens before externalization, worker-side).
    pub async fn put_payload(
        &self,
        key: &str,
        payload: &Value,
        scope: ResultScope,
        ttl_ms: Option<u64>,
        now_ms: u64,
    ) -> Result<ResultRef, StoreError> {
        let size = serde_json::to_vec(payload)?.len();
        self.put_payload_in(key, payload, StoreTier::auto(size, scope), scope, ttl_ms, now_ms)
            .await
    }

    /// Externalize into an explicitly chosen tier.
    pub async fn put_payload_in(
        &self,
        key: &str,
        payload: &Value,
        tier: StoreTier,
        scope: ResultScope,
        ttl_ms: Option<u64>,
        now_ms: u64,
    ) -> Result<ResultRef, StoreError> {
        let raw = serde_json::to_vec(payload)?;
        let sha256 = format!("{:x}", Sha256::digest(&raw));
        let size = raw.len();

        let (bytes, compression) = if size >= self.config.compress_min_bytes {
            (zstd::encode_all(raw.as_slice(), self.config.compression_level)?, Some("zstd"))
        } else {
            (raw, None)
        };

        let uri = self.backend_for(tier).put(key, &bytes, "application/json").await?;

        Ok(ResultRef {
            uri,
            store: tier,
            scope,
            expires_at_ms: ttl_ms.map(|ttl| now_ms + ttl),
            bytes: size as u64,
            sha256,
            compression: compression.map(String::from),
            extracted: Default::default(),
            preview: None,
        })
    }

    /// Load and decode a previously stored payload.
    pub async fn fetch(&self, reference: &ResultRef) -> Result<Value, StoreError> {
        let bytes = self.backend_for_uri(&reference.uri).get(&reference.uri).await?;
        let raw = match reference.compression.as_deref() {
            Some("zstd") => zstd::decode_all(bytes.as_slice())?,
            _ => bytes,
        };
        Ok(serde_json::from_slice(&raw)?)
    }

    pub async fn delete(&self, reference: &ResultRef) -> Result<(), StoreError> {
        self.backend_for_uri(&reference.uri).delete(&reference.uri).await
    }

    /// Scope finalizer: delete every ref whose scope just ended.
    /// `Permanent` refs are never collected.
    pub async fn sweep_scope(&self, refs: &[ResultRef], ended: ResultScope) {
        for reference in refs {
            if reference.scope == ended && reference.scope != ResultScope::Permanent {
                if let Err(e) = self.delete(reference).await {
                    tracing::warn!(uri = %reference.uri, error = %e, "scope sweep delete failed");
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
