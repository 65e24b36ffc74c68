use crate::{controller::ControllerArgs, hub::HubArgs, relay::RelayArgs};
use anyhow::Result;
use clap::{Parser, Subcommand};
use prometheus_client::registry::Registry;

#[derive(Debug, Parser)]
#[clap(name = "cluster-proxy", about = "Proxies hub requests into managed clusters")]
pub struct Args {
    #[clap(
        long,
        default_value = "cluster_proxy=info,warn",
        env = "CLUSTER_PROXY_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serves the hub-side user proxy.
    Hub(HubArgs),

    /// Serves the agent-side relay to in-cluster services.
    Relay(RelayArgs),

    /// Rotates the add-on's certificates and signs agent requests.
    Controller(ControllerArgs),
}

/// Process-wide settings shared by every subcommand.
pub(crate) struct Common {
    pub log_level: kubert::LogFilter,
    pub log_format: kubert::LogFormat,
    pub client: kubert::ClientArgs,
    pub admin: kubert::AdminArgs,
    pub prom: Registry,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            command,
        } = self;

        let common = Common {
            log_level,
            log_format,
            client,
            admin,
            prom: Registry::default(),
        };
        match command {
            Command::Hub(args) => args.run(common).await,
            Command::Relay(args) => args.run(common).await,
            Command::Controller(args) => args.run(common).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_subcommands() {
        let args = Args::try_parse_from([
            "cluster-proxy",
            "hub",
            "--tunnel=uds",
            "--service-proxy-ca=/etc/service-proxy/ca.crt",
        ])
        .unwrap();
        assert!(matches!(args.command, Command::Hub(_)));

        let args = Args::try_parse_from(["cluster-proxy", "relay"]).unwrap();
        assert!(matches!(args.command, Command::Relay(_)));

        let args = Args::try_parse_from(["cluster-proxy", "controller"]).unwrap();
        assert!(matches!(args.command, Command::Controller(_)));
    }

    #[test]
    fn requires_a_subcommand() {
        assert!(Args::try_parse_from(["cluster-proxy"]).is_err());
    }
}
