//! Tunnels through a konnectivity proxy server.
//!
//! Each dial opens a new `Proxy` stream on an mTLS-authenticated channel to the
//! proxy server, which forwards it to the agent connected from the target
//! cluster. Streams carry exactly one connection and are never reused.

pub mod proto;
mod stream;

use self::{proto::Packet, stream::PendingDial};
use crate::{Connection, Dial, DialError};
use parking_lot::Mutex;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, info};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

const PACKET_BUFFER: usize = 16;

#[derive(Clone, Debug)]
pub struct TunnelConfig {
    /// The proxy server's host name. Also used as the TLS server name.
    pub host: String,
    pub port: u16,
    pub ca_cert: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub channel: ChannelPolicy,
}

/// Controls whether the authenticated channel to the proxy server is shared
/// across dials.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelPolicy {
    /// Every dial establishes (and authenticates) its own channel.
    PerDial,

    /// Dials share a channel until it reaches `max_age`, after which a new one
    /// is established with freshly loaded credentials.
    Shared { max_age: Duration },
}

#[derive(Debug)]
pub struct GrpcTunnel {
    config: TunnelConfig,
    cached: Mutex<Option<Cached>>,
}

#[derive(Debug)]
struct Cached {
    channel: Channel,
    created: Instant,
}

// === impl ChannelPolicy ===

impl ChannelPolicy {
    /// A zero `max_age` disables sharing.
    pub fn from_max_age(max_age: Duration) -> Self {
        if max_age.is_zero() {
            Self::PerDial
        } else {
            Self::Shared { max_age }
        }
    }
}

// === impl GrpcTunnel ===

impl GrpcTunnel {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            cached: Mutex::new(None),
        }
    }

    async fn channel(&self) -> Result<Channel, DialError> {
        let ChannelPolicy::Shared { max_age } = self.config.channel else {
            return self.connect().await;
        };

        let cached = self
            .cached
            .lock()
            .as_ref()
            .filter(|c| c.created.elapsed() < max_age)
            .map(|c| c.channel.clone());
        if let Some(channel) = cached {
            return Ok(channel);
        }

        let channel = self.connect().await?;
        *self.cached.lock() = Some(Cached {
            channel: channel.clone(),
            created: Instant::now(),
        });
        Ok(channel)
    }

    fn evict(&self) {
        if self.cached.lock().take().is_some() {
            debug!("Evicted shared tunnel channel");
        }
    }

    /// Establishes a new channel. Credentials are read on each call so that
    /// rotated certificates are picked up.
    async fn connect(&self) -> Result<Channel, DialError> {
        let TunnelConfig {
            host,
            port,
            ca_cert,
            cert,
            key,
            ..
        } = &self.config;

        let tls = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(read(ca_cert).await?))
            .identity(Identity::from_pem(read(cert).await?, read(key).await?))
            .domain_name(host.clone());

        let channel = Endpoint::from_shared(format!("https://{host}:{port}"))?
            .tls_config(tls)?
            .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
            .keep_alive_while_idle(true)
            .connect()
            .await?;
        info!(%host, %port, "Connected to proxy server");
        Ok(channel)
    }
}

#[async_trait::async_trait]
impl Dial for GrpcTunnel {
    async fn dial(&self, network: &str, address: &str) -> Result<Connection, DialError> {
        let channel = self.channel().await?;
        let mut grpc = tonic::client::Grpc::new(channel);

        // The dial request is queued before the stream is opened so that it is
        // sent along with the stream's headers.
        let (tx, rx) = mpsc::channel::<Packet>(PACKET_BUFFER);
        let pending = PendingDial::start(tx, network, address, rand::random()).await?;

        if let Err(error) = grpc.ready().await {
            self.evict();
            return Err(DialError::Channel(error));
        }
        let rsp = grpc
            .streaming(
                tonic::Request::new(ReceiverStream::new(rx)),
                http::uri::PathAndQuery::from_static(proto::PROXY_PATH),
                tonic::codec::ProstCodec::<Packet, Packet>::default(),
            )
            .await;
        let inbound = match rsp {
            Ok(rsp) => rsp.into_inner(),
            Err(status) => {
                if status.code() == tonic::Code::Unavailable {
                    self.evict();
                }
                return Err(status.into());
            }
        };

        pending.establish(inbound, address).await
    }
}

async fn read(path: &Path) -> Result<Vec<u8>, DialError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| DialError::Credentials {
            path: path.display().to_string(),
            source,
        })
}
