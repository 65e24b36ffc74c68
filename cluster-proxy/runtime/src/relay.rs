use crate::args::Common;
use anyhow::{bail, Result};
use cluster_proxy_http::{tls, ProxyMetrics, Relay, TlsClient};
use cluster_proxy_tunnel::{TcpConnect, Timeout};
use std::{path::PathBuf, time::Duration};
use tracing::info;

const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

#[derive(Debug, clap::Args)]
pub struct RelayArgs {
    #[clap(flatten)]
    server: kubert::ServerArgs,

    /// Trust roots for `https` backends. May be repeated.
    #[clap(long = "root-ca", default_value = SERVICE_ACCOUNT_CA)]
    root_cas: Vec<PathBuf>,

    #[clap(long, default_value = "30")]
    dial_timeout_secs: u64,
}

impl RelayArgs {
    pub(crate) async fn run(self, common: Common) -> Result<()> {
        let Common {
            log_level,
            log_format,
            client,
            admin,
            mut prom,
        } = common;

        let metrics = ProxyMetrics::register(prom.sub_registry_with_prefix("cluster_proxy"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let roots = tls::load_roots(&self.root_cas).await?;
        info!(roots = roots.len(), "Loaded backend trust roots");
        let relay = Relay::new(
            Timeout::new(
                TcpConnect::default(),
                Duration::from_secs(self.dial_timeout_secs),
            ),
            TlsClient::verified(roots)?,
            metrics,
        );

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_server(self.server)
            .build()
            .await?
            .spawn_server(relay);

        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
