// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Credential resolution with proactive keychain refresh.
//!
//! Credentials are cached per scope; a token whose TTL falls below the
//! refresh threshold is renewed through the credential's renew hook
//! before the tool runs, not after it fails.

use async_trait::async_trait;
use noetl_core::{Clock, ToolError, ToolErrorKind};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Default refresh threshold: renew when less than 300 s of TTL remain.
pub const REFRESH_THRESHOLD_MS: u64 = 300_000;

/// A stored credential: opaque data plus lifetime metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub data: Map<String, Value>,
    pub expires_at_ms: Option<u64>,
}

impl Credential {
    pub fn new(data: Map<String, Value>) -> Self {
        Self { data, expires_at_ms: None }
    }

    pub fn expiring(data: Map<String, Value>, expires_at_ms: u64) -> Self {
        Self { data, expires_at_ms: Some(expires_at_ms) }
    }
}

/// External credential store contract.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_credential(&self, name: &str) -> Result<Credential, ToolError>;
    async fn put_credential(&self, name: &str, credential: Credential) -> Result<(), ToolError>;
}

/// Renewal hook for expiring credentials (typically an HTTP token grant).
#[async_trait]
pub trait Renewer: Send + Sync {
    async fn renew(&self, name: &str, current: &Credential) -> Result<Credential, ToolError>;
}

/// In-process [`CredentialStore`].
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<String, Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, credential: Credential) {
        self.entries.lock().insert(name.into(), credential);
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get_credential(&self, name: &str) -> Result<Credential, ToolError> {
        self.entries.lock().get(name).cloned().ok_or_else(|| {
            ToolError::new(ToolErrorKind::Auth, format!("unknown credential: {name}"))
        })
    }

    async fn put_credential(&self, name: &str, credential: Credential) -> Result<(), ToolError> {
        self.entries.lock().insert(name.to_string(), credential);
        Ok(())
    }
}

/// Resolves `auth` references, refreshing near-expiry tokens first.
pub struct KeychainResolver<C: Clock> {
    store: Arc<dyn CredentialStore>,
    renewer: Option<Arc<dyn Renewer>>,
    clock: C,
    refresh_threshold_ms: u64,
}

impl<C: Clock> KeychainResolver<C> {
    pub fn new(store: Arc<dyn CredentialStore>, clock: C) -> Self {
        Self { store, renewer: None, clock, refresh_threshold_ms: REFRESH_THRESHOLD_MS }
    }

    pub fn with_renewer(mut self, renewer: Arc<dyn Renewer>) -> Self {
        self.renewer = Some(renewer);
        self
    }

    pub fn refresh_threshold_ms(mut self, threshold: u64) -> Self {
        self.refresh_threshold_ms = threshold;
        self
    }

    /// Resolve a credential, renewing when its TTL is below the threshold.
    /// The refreshed credential is written back to the store.
    pub async fn resolve(&self, name: &str) -> Result<Credential, ToolError> {
        let credential = self.store.get_credential(name).await?;

        let Some(expires_at) = credential.expires_at_ms else {
            return Ok(credential);
        };
        let remaining = expires_at.saturating_sub(self.clock.epoch_ms());
        if remaining >= self.refresh_threshold_ms {
            return Ok(credential);
        }

        let Some(renewer) = &self.renewer else {
            tracing::warn!(credential = name, remaining_ms = remaining, "credential near expiry, no renewer");
            return Ok(credential);
        };

        tracing::info!(credential = name, remaining_ms = remaining, "proactively renewing credential");
        let renewed = renewer.renew(name, &credential).await?;
        self.store.put_credential(name, renewed.clone()).await?;
        Ok(renewed)
    }
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
