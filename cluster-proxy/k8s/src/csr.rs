//! Approves and signs add-on agent certificate signing requests.
//!
//! Requests are watched by the add-on label. An admitted request is first
//! approved; once it is observed approved, requests for the add-on's own
//! signer are signed with the current signing authority and the certificate
//! is written to the request's status.

use cluster_proxy_trust::{
    csr::{Csr, Denial, Registration, SignError, SIGNER_NAME},
    pki::{Authority, PkiError},
    store::{Store, StoreError},
};
use futures::StreamExt;
use k8s_openapi::{
    api::certificates::v1::{CertificateSigningRequest, CertificateSigningRequestStatus},
    ByteString,
};
use kube::{
    api::{Patch, PatchParams},
    runtime::{controller::Action, watcher, Controller},
    Api, Client, ResourceExt,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

pub const ADDON_NAME_LABEL: &str = "open-cluster-management.io/addon-name";
pub const CLUSTER_NAME_LABEL: &str = "open-cluster-management.io/cluster-name";

const APPROVED: &str = "Approved";
const DENIED: &str = "Denied";
const FAILED: &str = "Failed";
const APPROVAL_REASON: &str = "AutoApprovedByHubCSRApprovingController";
const RETRY: Duration = Duration::from_secs(10);

pub struct CsrController {
    api: Api<CertificateSigningRequest>,
    addon: String,
    registration: Arc<dyn Registration>,
    signer: Arc<dyn Store>,
    signer_secret: String,
    approval: bool,
}

/// What to do with an observed request.
#[derive(Debug, PartialEq)]
pub enum Decision {
    Ignore(&'static str),
    Deny {
        cluster: String,
        denial: Denial,
    },
    Admit {
        cluster: String,
        csr: Csr,
        /// The request still needs the `Approved` condition.
        approve: bool,
        /// The request is approved and names the add-on signer.
        sign: bool,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("signer secret {0} does not exist")]
    NoSigner(String),

    #[error("invalid signer: {0}")]
    Signer(#[from] PkiError),

    #[error(transparent)]
    Sign(#[from] SignError),
}

// === impl CsrController ===

impl CsrController {
    pub fn new(
        client: Client,
        addon: impl Into<String>,
        registration: Arc<dyn Registration>,
        signer: Arc<dyn Store>,
        signer_secret: impl Into<String>,
        approval: bool,
    ) -> Self {
        Self {
            api: Api::all(client),
            addon: addon.into(),
            registration,
            signer,
            signer_secret: signer_secret.into(),
            approval,
        }
    }

    pub async fn run(self) {
        let config =
            watcher::Config::default().labels(&format!("{ADDON_NAME_LABEL}={}", self.addon));
        Controller::new(self.api.clone(), config)
            .run(reconcile, error_policy, Arc::new(self))
            .for_each(|res| {
                match res {
                    Ok((obj, action)) => debug!(csr = %obj.name, ?action, "Reconciled"),
                    Err(error) => warn!(%error, "Certificate request reconciliation failed"),
                }
                futures::future::ready(())
            })
            .await
    }

    async fn approve(&self, name: &str) -> Result<(), Error> {
        let patch = serde_json::json!({
            "status": {
                "conditions": [{
                    "type": APPROVED,
                    "status": "True",
                    "reason": APPROVAL_REASON,
                    "message": "Auto approving add-on agent certificate.",
                }],
            },
        });
        self.api
            .patch_approval(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn write_certificate(&self, name: &str, cert: String) -> Result<(), Error> {
        let status = CertificateSigningRequestStatus {
            certificate: Some(ByteString(cert.into_bytes())),
            ..Default::default()
        };
        let patch = serde_json::json!({ "status": status });
        self.api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }
}

async fn reconcile(
    obj: Arc<CertificateSigningRequest>,
    ctx: Arc<CsrController>,
) -> Result<Action, Error> {
    let name = obj.name_any();
    match decide(&obj, &*ctx.registration, ctx.approval) {
        Decision::Ignore(reason) => debug!(csr = %name, reason, "Ignoring certificate request"),
        Decision::Deny { cluster, denial } => {
            info!(csr = %name, %cluster, %denial, "Not approving certificate request")
        }
        Decision::Admit {
            cluster,
            csr,
            approve,
            sign,
        } => {
            if approve {
                ctx.approve(&name).await?;
                info!(csr = %name, %cluster, "Approved certificate request");
            }
            if sign {
                let cert = issue(&*ctx.signer, &ctx.signer_secret, &csr).await?;
                ctx.write_certificate(&name, cert).await?;
                info!(csr = %name, %cluster, "Signed certificate request");
            }
        }
    }
    Ok(Action::await_change())
}

fn error_policy(
    obj: Arc<CertificateSigningRequest>,
    error: &Error,
    _ctx: Arc<CsrController>,
) -> Action {
    warn!(csr = %obj.name_any(), %error, "Failed to process certificate request");
    Action::requeue(RETRY)
}

/// Classifies a request against the registration policy.
pub fn decide(
    obj: &CertificateSigningRequest,
    registration: &dyn Registration,
    approval: bool,
) -> Decision {
    let status = obj.status.as_ref();
    if status.and_then(|s| s.certificate.as_ref()).is_some_and(|c| !c.0.is_empty()) {
        return Decision::Ignore("already issued");
    }
    if has_condition(obj, DENIED) || has_condition(obj, FAILED) {
        return Decision::Ignore("denied");
    }
    let Some(cluster) = obj.labels().get(CLUSTER_NAME_LABEL).cloned() else {
        return Decision::Ignore("missing cluster name label");
    };

    let csr = to_csr(obj);
    if let Err(denial) = registration.admit(&cluster, &csr) {
        return Decision::Deny { cluster, denial };
    }

    let approved = has_condition(obj, APPROVED);
    if !approved && !approval {
        return Decision::Ignore("awaiting approval");
    }
    let sign = approved && csr.signer_name == SIGNER_NAME;
    Decision::Admit {
        cluster,
        csr,
        approve: !approved,
        sign,
    }
}

fn to_csr(obj: &CertificateSigningRequest) -> Csr {
    Csr {
        name: obj.name_any(),
        signer_name: obj.spec.signer_name.clone(),
        usages: obj.spec.usages.clone().unwrap_or_default(),
        request: obj.spec.request.0.clone(),
        username: obj.spec.username.clone(),
    }
}

fn has_condition(obj: &CertificateSigningRequest, type_: &str) -> bool {
    obj.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == type_ && c.status == "True")
        })
}

/// Signs `csr` with the authority stored in `secret`.
async fn issue(store: &dyn Store, secret: &str, csr: &Csr) -> Result<String, Error> {
    let pair = store
        .get_tls(secret)
        .await?
        .ok_or_else(|| Error::NoSigner(secret.to_string()))?;
    let authority = Authority::from_pair(pair)?;
    Ok(csr.sign(&authority)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_proxy_trust::{
        csr::{AgentRegistration, KUBE_CLIENT_SIGNER},
        pki::CertInfo,
        store::MemoryStore,
    };
    use k8s_openapi::api::certificates::v1::{
        CertificateSigningRequestCondition, CertificateSigningRequestSpec,
    };
    use kube::api::ObjectMeta;
    use time::OffsetDateTime;

    const CLUSTER: &str = "cluster1";

    /// cluster1's agent identity in all three groups.
    const AGENT_REQUEST: &str = include_str!("../../trust/testdata/agent-cluster1.csr");

    fn request(signer: &str) -> CertificateSigningRequest {
        CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some("addon-cluster1-cluster-proxy-abcde".to_string()),
                labels: Some(
                    [
                        (ADDON_NAME_LABEL.to_string(), "cluster-proxy".to_string()),
                        (CLUSTER_NAME_LABEL.to_string(), CLUSTER.to_string()),
                    ]
                    .into_iter()
                    .collect(),
                ),
                ..Default::default()
            },
            spec: CertificateSigningRequestSpec {
                signer_name: signer.to_string(),
                request: ByteString(AGENT_REQUEST.as_bytes().to_vec()),
                usages: Some(vec![
                    "digital signature".to_string(),
                    "key encipherment".to_string(),
                    "client auth".to_string(),
                ]),
                username: Some(format!(
                    "system:open-cluster-management:{CLUSTER}:agent-bootstrap"
                )),
                ..Default::default()
            },
            status: None,
        }
    }

    fn with_condition(mut obj: CertificateSigningRequest, type_: &str) -> CertificateSigningRequest {
        obj.status = Some(CertificateSigningRequestStatus {
            conditions: Some(vec![CertificateSigningRequestCondition {
                type_: type_.to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        obj
    }

    #[test]
    fn admitted_requests_are_approved_first() {
        let obj = request(SIGNER_NAME);
        match decide(&obj, &AgentRegistration::default(), true) {
            Decision::Admit {
                cluster,
                csr,
                approve,
                sign,
            } => {
                assert_eq!(cluster, CLUSTER);
                assert_eq!(csr.signer_name, SIGNER_NAME);
                assert!(approve);
                assert!(!sign);
            }
            decision => panic!("unexpected decision: {decision:?}"),
        }
    }

    #[test]
    fn approved_requests_for_the_addon_signer_are_signed() {
        let obj = with_condition(request(SIGNER_NAME), APPROVED);
        assert!(matches!(
            decide(&obj, &AgentRegistration::default(), true),
            Decision::Admit {
                approve: false,
                sign: true,
                ..
            }
        ));

        // The API server signs client certificates itself.
        let obj = with_condition(request(KUBE_CLIENT_SIGNER), APPROVED);
        assert!(matches!(
            decide(&obj, &AgentRegistration::default(), true),
            Decision::Admit {
                approve: false,
                sign: false,
                ..
            }
        ));
    }

    #[test]
    fn approval_can_be_left_to_others() {
        let obj = request(SIGNER_NAME);
        assert_eq!(
            decide(&obj, &AgentRegistration::default(), false),
            Decision::Ignore("awaiting approval")
        );

        let obj = with_condition(request(SIGNER_NAME), APPROVED);
        assert!(matches!(
            decide(&obj, &AgentRegistration::default(), false),
            Decision::Admit { sign: true, .. }
        ));
    }

    #[test]
    fn finished_requests_are_ignored() {
        let mut obj = with_condition(request(SIGNER_NAME), APPROVED);
        if let Some(status) = obj.status.as_mut() {
            status.certificate = Some(ByteString(b"cert".to_vec()));
        }
        assert_eq!(
            decide(&obj, &AgentRegistration::default(), true),
            Decision::Ignore("already issued")
        );

        for type_ in [DENIED, FAILED] {
            let obj = with_condition(request(SIGNER_NAME), type_);
            assert_eq!(
                decide(&obj, &AgentRegistration::default(), true),
                Decision::Ignore("denied")
            );
        }
    }

    #[test]
    fn requests_need_a_cluster() {
        let mut obj = request(SIGNER_NAME);
        obj.labels_mut().remove(CLUSTER_NAME_LABEL);
        assert_eq!(
            decide(&obj, &AgentRegistration::default(), true),
            Decision::Ignore("missing cluster name label")
        );
    }

    #[test]
    fn requests_from_other_clusters_are_denied() {
        let mut obj = request(SIGNER_NAME);
        obj.labels_mut()
            .insert(CLUSTER_NAME_LABEL.to_string(), "cluster2".to_string());
        assert!(matches!(
            decide(&obj, &AgentRegistration::default(), true),
            Decision::Deny { cluster, .. } if cluster == "cluster2"
        ));
    }

    #[tokio::test]
    async fn issues_with_the_stored_signer() {
        let store = MemoryStore::default();
        let csr = to_csr(&request(SIGNER_NAME));
        assert!(matches!(
            issue(&store, "signer", &csr).await,
            Err(Error::NoSigner(_))
        ));

        let ca = Authority::generate(
            "cluster-proxy-addon@1",
            Duration::from_secs(365 * 24 * 60 * 60),
            OffsetDateTime::now_utc(),
        )
        .unwrap();
        store.put_tls("signer", ca.pair()).await.unwrap();

        let cert = issue(&store, "signer", &csr).await.unwrap();
        let info = CertInfo::from_pem(&cert).unwrap();
        assert!(info.is_signed_by(ca.info()));
        assert_eq!(
            info.common_name.as_deref(),
            Some(AgentRegistration::default().agent_user(CLUSTER).as_str())
        );
    }
}
