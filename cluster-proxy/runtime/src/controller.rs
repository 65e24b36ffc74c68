use crate::{args::Common, lease};
use anyhow::{bail, Context, Result};
use cluster_proxy_core::ADDON_NAME;
use cluster_proxy_k8s::{
    rotation, CsrController, KubeStore, LeaseClaim, ReconcileMetrics, RotationController,
};
use cluster_proxy_trust::{AgentRegistration, CertRotation, RotationConfig, TargetConfig};
use std::{sync::Arc, time::Duration};
use tracing::{info, info_span, Instrument};

#[derive(Debug, clap::Args)]
pub struct ControllerArgs {
    /// The namespace holding the signer, CA bundle and serving certificates.
    #[clap(long, env = "POD_NAMESPACE", default_value = "open-cluster-management-addon")]
    namespace: String,

    #[clap(long, default_value = "cluster-proxy-signer")]
    signer_secret: String,

    #[clap(long, default_value = "cluster-proxy-ca-bundle")]
    ca_bundle_configmap: String,

    #[clap(long, default_value = "cluster-proxy-user-serving-cert")]
    server_cert_secret: String,

    /// Host names of the user proxy's serving certificate. May be repeated;
    /// when absent no serving certificate is issued.
    #[clap(long = "server-hostname")]
    server_hostnames: Vec<String>,

    #[clap(long, default_value = "cluster-proxy-addon")]
    signer_name: String,

    /// Defaults to 365 days.
    #[clap(long, default_value = "31536000")]
    signing_validity_secs: u64,

    /// Defaults to 30 days.
    #[clap(long, default_value = "2592000")]
    target_validity_secs: u64,

    #[clap(long, default_value = "300")]
    resync_interval_secs: u64,

    #[clap(long, default_value = ADDON_NAME)]
    addon_name: String,

    #[clap(long, default_value = "cluster-proxy-addon-agent")]
    agent_name: String,

    #[clap(long, default_value = "cluster-proxy-controller-write")]
    lease_name: String,

    /// Leaves approval of agent requests to another approver.
    #[clap(long)]
    csr_approval_disabled: bool,
}

impl ControllerArgs {
    pub(crate) async fn run(self, common: Common) -> Result<()> {
        let config = self.rotation_config();
        config
            .validate()
            .context("invalid certificate rotation configuration")?;

        let Common {
            log_level,
            log_format,
            client,
            admin,
            mut prom,
        } = common;
        let metrics = ReconcileMetrics::register(prom.sub_registry_with_prefix("cluster_proxy"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let hostname = std::env::var("HOSTNAME").context("HOSTNAME is not set")?;
        let claims = lease::init(&runtime, &self.namespace, &self.lease_name, &hostname).await?;

        let store = KubeStore::new(runtime.client(), &self.namespace);
        let triggers = rotation::triggers(runtime.client(), &self.namespace, &config);
        let rotation = RotationController::new(
            CertRotation::new(store.clone(), config)?,
            LeaseClaim::new(claims, hostname),
            metrics,
        );
        tokio::spawn(
            rotation
                .run(triggers)
                .instrument(info_span!("cert_rotation", ns = %self.namespace)),
        );

        let registration = AgentRegistration::new(&self.addon_name, &self.agent_name);
        let csrs = CsrController::new(
            runtime.client(),
            &self.addon_name,
            Arc::new(registration),
            Arc::new(store),
            &self.signer_secret,
            !self.csr_approval_disabled,
        );
        tokio::spawn(csrs.run().instrument(info_span!("csr_controller")));
        info!(
            addon = %self.addon_name,
            approval = !self.csr_approval_disabled,
            "Managing add-on certificates"
        );

        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }

    fn rotation_config(&self) -> RotationConfig {
        let targets = if self.server_hostnames.is_empty() {
            vec![]
        } else {
            vec![TargetConfig {
                secret: self.server_cert_secret.clone(),
                hostnames: self.server_hostnames.clone(),
            }]
        };
        RotationConfig {
            signer_secret: self.signer_secret.clone(),
            signer_name_prefix: self.signer_name.clone(),
            signing_validity: Duration::from_secs(self.signing_validity_secs),
            ca_bundle: self.ca_bundle_configmap.clone(),
            target_validity: Duration::from_secs(self.target_validity_secs),
            targets,
            resync_interval: Duration::from_secs(self.resync_interval_secs),
        }
    }
}
