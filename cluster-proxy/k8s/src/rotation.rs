//! Drives certificate rotation from the lease holder.
//!
//! A sync runs at startup, on every resync interval, and whenever one of the
//! managed objects changes. Only the replica holding the lease writes; the
//! others count the pass as skipped. Failed syncs are retried with an
//! exponential backoff capped at the resync interval.

use crate::ReconcileMetrics;
use cluster_proxy_trust::{
    pki::Authority,
    rotation::{CertRotation, RotationConfig, RotationError},
    store::Store,
};
use futures::{stream::BoxStream, Stream, StreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{
    runtime::{watcher, WatchStreamExt},
    Api, Client, Resource,
};
use kubert::lease::Claim;
use serde::de::DeserializeOwned;
use std::{fmt, sync::Arc};
use tokio::{sync::watch, time};
use tracing::{debug, info, warn};

const MIN_BACKOFF: time::Duration = time::Duration::from_secs(1);

/// Decides whether this replica may write trust material.
pub trait Leadership: Send + Sync {
    fn is_leader(&self) -> bool;
}

/// Leadership backed by a `kubert` lease.
#[derive(Clone, Debug)]
pub struct LeaseClaim {
    claims: watch::Receiver<Arc<Claim>>,
    claimant: String,
}

pub struct RotationController<S, L> {
    rotation: CertRotation<S>,
    leader: L,
    metrics: ReconcileMetrics,
}

// === impl LeaseClaim ===

impl LeaseClaim {
    pub fn new(claims: watch::Receiver<Arc<Claim>>, claimant: impl Into<String>) -> Self {
        Self {
            claims,
            claimant: claimant.into(),
        }
    }
}

impl Leadership for LeaseClaim {
    fn is_leader(&self) -> bool {
        self.claims.borrow().is_current_for(&self.claimant)
    }
}

impl Leadership for watch::Receiver<bool> {
    fn is_leader(&self) -> bool {
        *self.borrow()
    }
}

// === impl RotationController ===

impl<S: Store, L: Leadership> RotationController<S, L> {
    pub fn new(rotation: CertRotation<S>, leader: L, metrics: ReconcileMetrics) -> Self {
        Self {
            rotation,
            leader,
            metrics,
        }
    }

    /// Runs until the process exits. `triggers` wakes the loop early; when it
    /// ends, syncs continue on the resync interval alone.
    pub async fn run<T>(self, triggers: T)
    where
        T: Stream<Item = ()> + Send,
    {
        let resync = self.rotation.config().resync_interval;
        let triggers = triggers.fuse();
        tokio::pin!(triggers);

        let mut backoff = MIN_BACKOFF;
        loop {
            let delay = match self.reconcile().await {
                Ok(_) => {
                    backoff = MIN_BACKOFF;
                    resync
                }
                Err(error) => {
                    let delay = backoff;
                    backoff = std::cmp::min(backoff * 2, resync);
                    warn!(%error, retry_in = ?delay, "Failed to rotate certificates");
                    delay
                }
            };

            tokio::select! {
                _ = time::sleep(delay) => {}
                Some(()) = triggers.next() => {
                    debug!("Managed object changed");
                }
            }
        }
    }

    /// Performs a single sync if this replica leads. Returns the current
    /// signer, or `None` when another replica holds the lease.
    pub async fn reconcile(&self) -> Result<Option<Authority>, RotationError> {
        if !self.leader.is_leader() {
            debug!("Not the lease holder; skipping rotation");
            self.metrics.skipped();
            return Ok(None);
        }

        match self.rotation.sync().await {
            Ok(authority) => {
                self.metrics.ok();
                info!(
                    signer = ?authority.info().common_name,
                    expiry = %authority.info().not_after,
                    "Certificates are up to date"
                );
                Ok(Some(authority))
            }
            Err(error) => {
                self.metrics.error();
                Err(error)
            }
        }
    }
}

/// Emits an item whenever the signer secret, a target secret, or the CA bundle
/// config map changes.
pub fn triggers(
    client: Client,
    namespace: &str,
    config: &RotationConfig,
) -> impl Stream<Item = ()> + Send + 'static {
    let secrets = Api::<Secret>::namespaced(client.clone(), namespace);
    let config_maps = Api::<ConfigMap>::namespaced(client, namespace);

    let mut streams = std::iter::once(&config.signer_secret)
        .chain(config.targets.iter().map(|t| &t.secret))
        .map(|name| changes(secrets.clone(), name))
        .collect::<Vec<_>>();
    streams.push(changes(config_maps, &config.ca_bundle));
    futures::stream::select_all(streams)
}

fn changes<K>(api: Api<K>, name: &str) -> BoxStream<'static, ()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + 'static,
{
    let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
    watcher(api, config)
        .default_backoff()
        .filter_map(|event| {
            futures::future::ready(match event {
                Ok(_) => Some(()),
                Err(error) => {
                    debug!(%error, "Watch failed");
                    None
                }
            })
        })
        .boxed()
}
