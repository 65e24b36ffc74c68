//! Trust material persisted as namespaced `Secret`s and `ConfigMap`s.

use crate::FIELD_MANAGER;
use cluster_proxy_trust::{
    pki::CertKeyPair,
    store::{Store, StoreError, CA_BUNDLE_KEY, TLS_CERT_KEY, TLS_KEY_KEY},
};
use k8s_openapi::{
    api::core::v1::{ConfigMap, Secret},
    ByteString,
};
use kube::{
    api::{ObjectMeta, Patch, PatchParams},
    Api, Client,
};
use std::collections::BTreeMap;

const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

#[derive(Clone)]
pub struct KubeStore {
    secrets: Api<Secret>,
    config_maps: Api<ConfigMap>,
    namespace: String,
}

// === impl KubeStore ===

impl KubeStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            secrets: Api::namespaced(client.clone(), namespace),
            config_maps: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    fn meta(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            ..Default::default()
        }
    }

    fn params() -> PatchParams {
        PatchParams::apply(FIELD_MANAGER).force()
    }
}

#[async_trait::async_trait]
impl Store for KubeStore {
    async fn get_tls(&self, name: &str) -> Result<Option<CertKeyPair>, StoreError> {
        let secret = self
            .secrets
            .get_opt(name)
            .await
            .map_err(|e| StoreError::new("get secret", name, e))?;
        Ok(secret.and_then(|s| pair_from_secret(&s)))
    }

    async fn put_tls(&self, name: &str, pair: &CertKeyPair) -> Result<(), StoreError> {
        let secret = Secret {
            metadata: self.meta(name),
            type_: Some(TLS_SECRET_TYPE.to_string()),
            data: Some(secret_data(pair)),
            ..Default::default()
        };
        self.secrets
            .patch(name, &Self::params(), &Patch::Apply(secret))
            .await
            .map_err(|e| StoreError::new("apply secret", name, e))?;
        tracing::debug!(namespace = %self.namespace, secret = %name, "Applied TLS secret");
        Ok(())
    }

    async fn get_bundle(&self, name: &str) -> Result<Option<String>, StoreError> {
        let cm = self
            .config_maps
            .get_opt(name)
            .await
            .map_err(|e| StoreError::new("get configmap", name, e))?;
        Ok(cm
            .and_then(|cm| cm.data)
            .and_then(|mut data| data.remove(CA_BUNDLE_KEY)))
    }

    async fn put_bundle(&self, name: &str, pem: &str) -> Result<(), StoreError> {
        let cm = ConfigMap {
            metadata: self.meta(name),
            data: Some(BTreeMap::from([(CA_BUNDLE_KEY.to_string(), pem.to_string())])),
            ..Default::default()
        };
        self.config_maps
            .patch(name, &Self::params(), &Patch::Apply(cm))
            .await
            .map_err(|e| StoreError::new("apply configmap", name, e))?;
        tracing::debug!(namespace = %self.namespace, configmap = %name, "Applied CA bundle");
        Ok(())
    }
}

/// Reads a `tls.crt`/`tls.key` pair. Secrets missing either key, or holding
/// non-UTF-8 data, read as absent.
fn pair_from_secret(secret: &Secret) -> Option<CertKeyPair> {
    let data = secret.data.as_ref()?;
    let text = |key: &str| {
        data.get(key)
            .and_then(|ByteString(bytes)| String::from_utf8(bytes.clone()).ok())
    };
    Some(CertKeyPair {
        cert_pem: text(TLS_CERT_KEY)?,
        key_pem: text(TLS_KEY_KEY)?,
    })
}

fn secret_data(pair: &CertKeyPair) -> BTreeMap<String, ByteString> {
    BTreeMap::from([
        (
            TLS_CERT_KEY.to_string(),
            ByteString(pair.cert_pem.clone().into_bytes()),
        ),
        (
            TLS_KEY_KEY.to_string(),
            ByteString(pair.key_pem.clone().into_bytes()),
        ),
    ])
}
