#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Byte-stream tunnels into a managed cluster's network.

mod direct;
pub mod grpc;
mod uds;

pub use self::{direct::TcpConnect, grpc::GrpcTunnel, uds::UdsConnect};

use std::{sync::Arc, time::Duration};
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream returned by a [`Dial`].
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

pub type Connection = Box<dyn Io>;

/// Opens connections to addresses inside a cluster's network.
///
/// Dials are never retried; each call either yields a fresh connection or an
/// error. Dropping the returned future aborts the dial and releases anything
/// it had acquired.
#[async_trait::async_trait]
pub trait Dial: Send + Sync {
    async fn dial(&self, network: &str, address: &str) -> Result<Connection, DialError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("dialing proxy {socket:?} failed: {source}")]
    Socket {
        socket: String,
        #[source]
        source: std::io::Error,
    },

    #[error("proxy error while dialing {address}: {status}")]
    ConnectStatus { address: String, status: String },

    #[error("reading CONNECT response for {address} failed: {reason}")]
    ConnectResponse { address: String, reason: String },

    #[error("unexpected {0} bytes of buffered data from CONNECT proxy")]
    UnexpectedBufferedData(usize),

    #[error("failed to load tunnel credentials from {path}: {source}")]
    Credentials {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to establish tunnel channel: {0}")]
    Channel(#[from] tonic::transport::Error),

    #[error("tunnel stream failed: {0}")]
    Stream(#[from] tonic::Status),

    #[error("proxy server rejected dial to {address}: {reason}")]
    Rejected { address: String, reason: String },

    #[error("tunnel closed before dial to {0} completed")]
    Closed(String),

    #[error("dial timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Bounds every dial of the inner strategy by a timeout.
#[derive(Clone, Debug)]
pub struct Timeout<D> {
    inner: D,
    timeout: Duration,
}

// === impl Timeout ===

impl<D> Timeout<D> {
    pub fn new(inner: D, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait::async_trait]
impl<D: Dial> Dial for Timeout<D> {
    async fn dial(&self, network: &str, address: &str) -> Result<Connection, DialError> {
        match tokio::time::timeout(self.timeout, self.inner.dial(network, address)).await {
            Ok(res) => res,
            Err(_) => Err(DialError::Timeout(self.timeout)),
        }
    }
}

#[async_trait::async_trait]
impl<D: Dial + ?Sized> Dial for Arc<D> {
    async fn dial(&self, network: &str, address: &str) -> Result<Connection, DialError> {
        (**self).dial(network, address).await
    }
}

#[async_trait::async_trait]
impl<D: Dial + ?Sized> Dial for Box<D> {
    async fn dial(&self, network: &str, address: &str) -> Result<Connection, DialError> {
        (**self).dial(network, address).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Never;

    #[async_trait::async_trait]
    impl Dial for Never {
        async fn dial(&self, _: &str, _: &str) -> Result<Connection, DialError> {
            futures::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_bounds_dial() {
        let dial = Timeout::new(Never, Duration::from_secs(30));
        let err = dial.dial("tcp", "cluster1:443").await.err().unwrap();
        assert!(matches!(err, DialError::Timeout(d) if d == Duration::from_secs(30)));
    }
}
