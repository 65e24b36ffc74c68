use anyhow::Result;
use k8s_openapi::api::coordination::v1::Lease;
use kube::api::{Api, ObjectMeta, PostParams};
use kubert::lease::{Claim, ClaimParams, LeaseManager};
use std::sync::Arc;
use tokio::{sync::watch, time};
use tracing::{debug, info};

const LEASE_DURATION: time::Duration = time::Duration::from_secs(30);
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(1);

const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
const COMPONENT: &str = "cluster-proxy-controller";

/// Ensures the controller's write lease exists and starts competing for it.
pub async fn init<T>(
    runtime: &kubert::Runtime<T>,
    ns: &str,
    name: &str,
    hostname: &str,
) -> Result<watch::Receiver<Arc<Claim>>> {
    let api = Api::<Lease>::namespaced(runtime.client(), ns);
    create_if_absent(&api, name).await?;

    let params = ClaimParams {
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
    };
    let (claims, _task) = LeaseManager::init(api, name)
        .await?
        .spawn(hostname, params)
        .await?;
    Ok(claims)
}

async fn create_if_absent(api: &Api<Lease>, name: &str) -> kube::Result<()> {
    let params = PostParams {
        field_manager: Some(cluster_proxy_k8s::FIELD_MANAGER.to_string()),
        ..Default::default()
    };
    match api.create(&params, &empty_lease(name)).await {
        Ok(_) => info!(lease = %name, "Created write lease"),
        Err(kube::Error::Api(rsp)) if rsp.code == 409 => {
            debug!(lease = %name, "Write lease exists")
        }
        Err(error) => return Err(error),
    }
    Ok(())
}

/// An unclaimed lease; the lease manager fills in the spec.
fn empty_lease(name: &str) -> Lease {
    Lease {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some([(COMPONENT_LABEL.to_string(), COMPONENT.to_string())].into()),
            ..Default::default()
        },
        spec: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_lease_is_unclaimed() {
        let lease = empty_lease("cluster-proxy-controller-write");
        assert_eq!(
            lease.metadata.name.as_deref(),
            Some("cluster-proxy-controller-write")
        );
        assert_eq!(
            lease
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(COMPONENT_LABEL))
                .map(String::as_str),
            Some(COMPONENT)
        );
        assert!(lease.spec.is_none());
    }
}
