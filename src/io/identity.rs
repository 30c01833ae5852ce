//! Identity provisioning collaborator
//!
//! Creates login identities for guardians and operators. The returned id is
//! used as the document id of the record that owns the login.

use crate::domain::error::IdentityError;
use crate::domain::types::generate_id;
use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::time::Duration;
use tracing::debug;

/// Credentials shorter than this are rejected
pub const MIN_CREDENTIAL_LEN: usize = 6;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Create a login for `login_key`; returns the new identity id
    ///
    /// A key that is already registered fails with `IdentityError::AlreadyExists`.
    async fn create_identity(&self, login_key: &str, credential: &str)
        -> Result<String, IdentityError>;
}

/// Identity provider holding accounts in memory
#[derive(Default)]
pub struct MemoryIdentityProvider {
    /// login key -> identity id
    accounts: Mutex<FxHashMap<String, String>>,
    /// login key -> failure returned on every attempt
    forced_failures: Mutex<FxHashMap<String, IdentityError>>,
    latency: Duration,
}

impl MemoryIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed keys that already have an identity (e.g. loaded from the store)
    pub fn with_existing<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let provider = Self::new();
        {
            let mut accounts = provider.accounts.lock();
            for key in keys {
                let key = key.into().to_lowercase();
                accounts.insert(key, generate_id("uid"));
            }
        }
        provider
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make every attempt for `login_key` fail with `error`
    pub fn fail_for(&self, login_key: &str, error: IdentityError) {
        self.forced_failures.lock().insert(login_key.to_lowercase(), error);
    }

    pub fn contains(&self, login_key: &str) -> bool {
        self.accounts.lock().contains_key(&login_key.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.accounts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentityProvider {
    async fn create_identity(
        &self,
        login_key: &str,
        credential: &str,
    ) -> Result<String, IdentityError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let key = login_key.trim().to_lowercase();
        if let Some(err) = self.forced_failures.lock().get(&key) {
            return Err(err.clone());
        }
        let well_formed = key
            .split_once('@')
            .map(|(local, domain)| !local.is_empty() && domain.contains('.'))
            .unwrap_or(false);
        if !well_formed {
            return Err(IdentityError::Rejected(format!("malformed login key \"{login_key}\"")));
        }
        if credential.len() < MIN_CREDENTIAL_LEN {
            return Err(IdentityError::Rejected("credential too short".to_string()));
        }

        let mut accounts = self.accounts.lock();
        if accounts.contains_key(&key) {
            return Err(IdentityError::AlreadyExists(key));
        }
        let id = generate_id("uid");
        accounts.insert(key.clone(), id.clone());
        debug!(login_key = %key, identity_id = %id, "identity_created");
        Ok(id)
    }
}
