use crate::args::Common;
use anyhow::{bail, Context, Result};
use cluster_proxy_core::{APISERVER_HOST, APISERVER_PROXY_PORT, SERVICE_PROXY_PORT};
use cluster_proxy_http::{tls, ApiServerUpstream, Hub, ProxyMetrics, ServiceUpstream, TlsClient};
use cluster_proxy_tunnel::{
    grpc::{ChannelPolicy, TunnelConfig},
    Dial, GrpcTunnel, Timeout, UdsConnect,
};
use std::{path::PathBuf, time::Duration};
use tracing::info;

const HTTPS_PORT: u16 = 443;

#[derive(Debug, clap::Args)]
pub struct HubArgs {
    #[clap(flatten)]
    server: kubert::ServerArgs,

    /// How connections reach managed clusters.
    #[clap(long, value_enum, default_value = "grpc")]
    tunnel: Tunnel,

    /// The local socket of the CONNECT proxy, for `--tunnel=uds`.
    #[clap(long, default_value = "/tmp/socket")]
    proxy_uds: PathBuf,

    #[clap(long, default_value = "localhost")]
    proxy_server_host: String,

    #[clap(long, default_value = "8090")]
    proxy_server_port: u16,

    #[clap(long, default_value = "/etc/ca/ca.crt")]
    proxy_ca_cert: PathBuf,

    #[clap(long, default_value = "/etc/tls/tls.crt")]
    proxy_cert: PathBuf,

    #[clap(long, default_value = "/etc/tls/tls.key")]
    proxy_key: PathBuf,

    /// How long a proxy server channel is shared across dials. Zero dials a
    /// new channel for every request.
    #[clap(long, default_value = "0")]
    tunnel_channel_max_age_secs: u64,

    #[clap(long, default_value = "30")]
    dial_timeout_secs: u64,

    /// Defaults to 8080 for `--tunnel=uds` and 443 for `--tunnel=grpc`.
    #[clap(long)]
    apiserver_port: Option<u16>,

    /// Verifies managed API servers. When unset, their certificates are not
    /// checked.
    #[clap(long)]
    apiserver_ca: Option<PathBuf>,

    #[clap(long, default_value_t = SERVICE_PROXY_PORT)]
    service_proxy_port: u16,

    /// The CA bundle that signed the agents' service relay certificates.
    #[clap(long)]
    service_proxy_ca: PathBuf,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
enum Tunnel {
    /// A CONNECT proxy listening on a local socket.
    Uds,
    /// A konnectivity proxy server.
    Grpc,
}

impl HubArgs {
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

        let timeout = Duration::from_secs(self.dial_timeout_secs);
        let dial: Box<dyn Dial> = match self.tunnel {
            Tunnel::Uds => Box::new(Timeout::new(UdsConnect::new(&self.proxy_uds), timeout)),
            Tunnel::Grpc => Box::new(Timeout::new(
                GrpcTunnel::new(self.tunnel_config()),
                timeout,
            )),
        };
        let apiserver = self.apiserver().await?;
        let service = ServiceUpstream {
            port: self.service_proxy_port,
            tls: TlsClient::verified(tls::load_roots(&[&self.service_proxy_ca]).await?)?,
        };
        info!(
            tunnel = ?self.tunnel,
            apiserver.port = apiserver.port,
            service.port = service.port,
            "Proxying to managed clusters"
        );
        let hub = Hub::new(dial, apiserver, service, metrics);

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_server(self.server)
            .build()
            .await?
            .spawn_server(hub);

        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }

    fn tunnel_config(&self) -> TunnelConfig {
        TunnelConfig {
            host: self.proxy_server_host.clone(),
            port: self.proxy_server_port,
            ca_cert: self.proxy_ca_cert.clone(),
            cert: self.proxy_cert.clone(),
            key: self.proxy_key.clone(),
            channel: ChannelPolicy::from_max_age(Duration::from_secs(
                self.tunnel_channel_max_age_secs,
            )),
        }
    }

    async fn apiserver(&self) -> Result<ApiServerUpstream> {
        if self.tunnel == Tunnel::Uds {
            return Ok(ApiServerUpstream {
                port: self.apiserver_port.unwrap_or(APISERVER_PROXY_PORT),
                tls: None,
            });
        }

        let tls = match &self.apiserver_ca {
            Some(ca) => TlsClient::verified(tls::load_roots(&[ca]).await?)?
                .with_server_name(APISERVER_HOST)
                .context("invalid API server name")?,
            None => TlsClient::insecure()?,
        };
        Ok(ApiServerUpstream {
            port: self.apiserver_port.unwrap_or(HTTPS_PORT),
            tls: Some(tls),
        })
    }
}
