//! The agent-side service relay.

use crate::{
    error_response,
    forward::{dial_and_forward, Upstream},
    metrics::{Mode, Outcome, ProxyMetrics},
    tls::TlsClient,
    Body,
};
use cluster_proxy_core::ServiceRef;
use cluster_proxy_tunnel::Dial;
use futures::future;
use http::{Request, Response, StatusCode};
use std::{
    convert::Infallible,
    sync::Arc,
    task::{Context, Poll},
};
use tracing::{debug, info_span, Instrument};

/// Forwards tunneled service requests to the in-cluster service named by
/// their side-channel headers.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<Inner>,
}

struct Inner {
    dial: Box<dyn Dial>,
    tls: TlsClient,
    metrics: ProxyMetrics,
}

// === impl Relay ===

impl Relay {
    /// `tls` authenticates `https` backends.
    pub fn new(dial: impl Dial + 'static, tls: TlsClient, metrics: ProxyMetrics) -> Self {
        Self {
            inner: Arc::new(Inner {
                dial: Box::new(dial),
                tls,
                metrics,
            }),
        }
    }
}

impl<B> tower::Service<Request<B>> for Relay
where
    B: http_body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let inner = self.inner.clone();
        Box::pin(async move { Ok(inner.relay(req).await) })
    }
}

// === impl Inner ===

impl Inner {
    async fn relay<B>(&self, mut req: Request<B>) -> Response<Body>
    where
        B: http_body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let service = match ServiceRef::from_headers(req.headers()) {
            Ok(service) => service,
            Err(error) => {
                debug!(%error, "Invalid relay request");
                return self.reject(error.to_string());
            }
        };
        let Some(port) = service.backend_port() else {
            return self.reject(format!("invalid request headers: bad port {:?}", service.port));
        };
        let tls = match service.protocol.as_str() {
            "https" => Some(self.tls.clone()),
            "http" => None,
            proto => return self.reject(format!("unsupported protocol {proto:?}")),
        };
        ServiceRef::remove(req.headers_mut());

        let host = service.backend_host();
        let address = format!("{host}:{port}");
        let upstream = Upstream {
            authority: service.backend_authority(),
            host,
            tls,
        };
        let span = info_span!(
            "relay",
            namespace = %service.namespace,
            service = %service.name,
            port,
        );
        dial_and_forward(&*self.dial, &self.metrics, Mode::Relay, &address, &upstream, req)
            .instrument(span)
            .await
    }

    fn reject(&self, message: String) -> Response<Body> {
        self.metrics.request(Mode::Relay, Outcome::InvalidTarget);
        error_response(StatusCode::BAD_REQUEST, message)
    }
}
