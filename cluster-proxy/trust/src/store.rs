use crate::pki::CertKeyPair;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_KEY_KEY: &str = "tls.key";
pub const CA_BUNDLE_KEY: &str = "ca-bundle.crt";

/// Persists trust material.
///
/// TLS pairs are stored as `tls.crt`/`tls.key` secrets and CA bundles as a
/// `ca-bundle.crt` config map entry. A stored object that lacks the expected
/// keys reads as absent.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn get_tls(&self, name: &str) -> Result<Option<CertKeyPair>, StoreError>;

    async fn put_tls(&self, name: &str, pair: &CertKeyPair) -> Result<(), StoreError>;

    async fn get_bundle(&self, name: &str) -> Result<Option<String>, StoreError>;

    async fn put_bundle(&self, name: &str, pem: &str) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
#[error("{op} {name} failed: {source}")]
pub struct StoreError {
    pub op: &'static str,
    pub name: String,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

/// An in-process store.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    tls: Arc<Mutex<HashMap<String, CertKeyPair>>>,
    bundles: Arc<Mutex<HashMap<String, String>>>,
}

// === impl StoreError ===

impl StoreError {
    pub fn new(
        op: &'static str,
        name: impl ToString,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Self {
            op,
            name: name.to_string(),
            source: source.into(),
        }
    }
}

// === impl MemoryStore ===

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get_tls(&self, name: &str) -> Result<Option<CertKeyPair>, StoreError> {
        Ok(self.tls.lock().get(name).cloned())
    }

    async fn put_tls(&self, name: &str, pair: &CertKeyPair) -> Result<(), StoreError> {
        self.tls.lock().insert(name.to_string(), pair.clone());
        Ok(())
    }

    async fn get_bundle(&self, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self.bundles.lock().get(name).cloned())
    }

    async fn put_bundle(&self, name: &str, pem: &str) -> Result<(), StoreError> {
        self.bundles.lock().insert(name.to_string(), pem.to_string());
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S: Store + ?Sized> Store for Arc<S> {
    async fn get_tls(&self, name: &str) -> Result<Option<CertKeyPair>, StoreError> {
        (**self).get_tls(name).await
    }

    async fn put_tls(&self, name: &str, pair: &CertKeyPair) -> Result<(), StoreError> {
        (**self).put_tls(name, pair).await
    }

    async fn get_bundle(&self, name: &str) -> Result<Option<String>, StoreError> {
        (**self).get_bundle(name).await
    }

    async fn put_bundle(&self, name: &str, pem: &str) -> Result<(), StoreError> {
        (**self).put_bundle(name, pem).await
    }
}
