//! The hub-side user proxy.

use crate::{
    error_response,
    forward::{dial_and_forward, set_origin_form, Upstream},
    metrics::{Mode, Outcome, ProxyMetrics},
    tls::TlsClient,
    Body,
};
use cluster_proxy_core::{resolve, RoutingTarget, ServiceRef};
use cluster_proxy_tunnel::Dial;
use futures::future;
use http::{Request, Response, StatusCode};
use std::{
    convert::Infallible,
    sync::Arc,
    task::{Context, Poll},
};
use tracing::{debug, info_span, Instrument};

/// Resolves each request to a managed cluster and forwards it through a
/// freshly dialed tunnel.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<Inner>,
}

/// How a cluster's API server is reached through its tunnel.
#[derive(Clone, Debug)]
pub struct ApiServerUpstream {
    pub port: u16,
    pub tls: Option<TlsClient>,
}

/// How the service relay of a cluster is reached through its tunnel.
#[derive(Clone, Debug)]
pub struct ServiceUpstream {
    pub port: u16,
    pub tls: TlsClient,
}

struct Inner {
    dial: Box<dyn Dial>,
    apiserver: ApiServerUpstream,
    service: ServiceUpstream,
    metrics: ProxyMetrics,
}

// === impl Hub ===

impl Hub {
    pub fn new(
        dial: impl Dial + 'static,
        apiserver: ApiServerUpstream,
        service: ServiceUpstream,
        metrics: ProxyMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                dial: Box::new(dial),
                apiserver,
                service,
                metrics,
            }),
        }
    }
}

impl<B> tower::Service<Request<B>> for Hub
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
        Box::pin(async move { Ok(inner.proxy(req).await) })
    }
}

// === impl Inner ===

impl Inner {
    async fn proxy<B>(&self, mut req: Request<B>) -> Response<Body>
    where
        B: http_body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let target = match resolve(req.uri().path()) {
            Ok(target) => target,
            Err(error) => {
                debug!(uri = %req.uri(), %error, "Invalid request target");
                return self.reject(Mode::Unresolved, error.to_string());
            }
        };

        let (mode, address, upstream) = match &target {
            RoutingTarget::ApiServer(t) => {
                let address = format!("{}:{}", t.cluster, self.apiserver.port);
                let upstream = Upstream {
                    authority: address.clone(),
                    host: t.cluster.clone(),
                    tls: self.apiserver.tls.clone(),
                };
                (Mode::ApiServer, address, upstream)
            }
            RoutingTarget::Service(t) => {
                if let Err(error) = ServiceRef::from(t).apply(req.headers_mut()) {
                    return self.reject(Mode::Service, error.to_string());
                }
                let host = t.identity().to_string();
                let address = format!("{host}:{}", self.service.port);
                let upstream = Upstream {
                    authority: address.clone(),
                    host,
                    tls: Some(self.service.tls.clone()),
                };
                (Mode::Service, address, upstream)
            }
        };
        if let Err(error) = set_origin_form(&mut req, target.path()) {
            return self.reject(mode, error.to_string());
        }
        debug!(%target, %address, "Resolved request target");

        let span = match &target {
            RoutingTarget::ApiServer(t) => info_span!("apiserver", cluster = %t.cluster),
            RoutingTarget::Service(t) => info_span!(
                "service",
                cluster = %t.cluster,
                namespace = %t.namespace,
                service = %t.name,
                port = %t.port,
            ),
        };
        dial_and_forward(&*self.dial, &self.metrics, mode, &address, &upstream, req)
            .instrument(span)
            .await
    }

    fn reject(&self, mode: Mode, message: String) -> Response<Body> {
        self.metrics.request(mode, Outcome::InvalidTarget);
        error_response(StatusCode::BAD_REQUEST, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{serve_io, tls_server, Backend, FakeDial};
    use bytes::Bytes;
    use cluster_proxy_tunnel::Timeout;
    use http_body_util::{BodyExt, Empty, Full};
    use hyper::body::Incoming;
    use hyper_util::rt::TokioIo;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const SERVICE_HOST: &str = "cluster-proxy-61c2553c2384ff09d319698cacb5fbc664b50a6a4015d88c2";

    fn hub(dial: impl Dial + 'static) -> Hub {
        hub_with(dial, TlsClient::insecure().unwrap())
    }

    fn hub_with(dial: impl Dial + 'static, service_tls: TlsClient) -> Hub {
        Hub::new(
            dial,
            ApiServerUpstream {
                port: 8080,
                tls: None,
            },
            ServiceUpstream {
                port: 7443,
                tls: service_tls,
            },
            ProxyMetrics::default(),
        )
    }

    async fn call(hub: &Hub, req: Request<Full<Bytes>>) -> (StatusCode, http::HeaderMap, Bytes) {
        let rsp = tower::Service::call(&mut hub.clone(), req).await.unwrap();
        let (parts, body) = rsp.into_parts();
        let body = body.collect().await.unwrap().to_bytes();
        (parts.status, parts.headers, body)
    }

    fn get(uri: &str) -> Request<Full<Bytes>> {
        Request::get(uri).body(Full::default()).unwrap()
    }

    #[tokio::test]
    async fn forwards_api_server_requests() {
        let dial = FakeDial::new(Backend::Echo);
        let hub = hub(dial.clone());

        let (status, headers, _) = call(&hub, get("/cluster1/api/v1/pods?timeout=32s")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["x-req-uri"], "/api/v1/pods?timeout=32s");
        assert_eq!(headers["x-req-host"], "cluster1:8080");
        assert!(!headers.contains_key("x-req-cluster-proxy-service"));
        assert_eq!(dial.dialed(), ["tcp/cluster1:8080"]);
    }

    #[tokio::test]
    async fn forwards_service_requests_to_the_relay() {
        let (roots, server) = tls_server(SERVICE_HOST);
        let dial = FakeDial::new(Backend::TlsEcho(server));
        let hub = hub_with(dial.clone(), TlsClient::verified(roots).unwrap());

        let req = Request::post(
            "/cluster1/api/v1/namespaces/default/services/nginx/proxy-service/hello/world?x=1",
        )
        .header("cluster-proxy-service", "spoofed")
        .body(Full::new(Bytes::from_static(b"payload")))
        .unwrap();
        let (status, headers, body) = call(&hub, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"payload");
        assert_eq!(headers["x-req-uri"], "/hello/world?x=1");
        assert_eq!(headers["x-req-cluster-proxy-proto"], "https");
        assert_eq!(headers["x-req-cluster-proxy-namespace"], "default");
        assert_eq!(headers["x-req-cluster-proxy-service"], "nginx");
        assert_eq!(headers["x-req-cluster-proxy-port"], "443");
        assert_eq!(dial.dialed(), [format!("tcp/{SERVICE_HOST}:7443")]);
    }

    #[tokio::test]
    async fn untrusted_relay_is_a_bad_gateway() {
        let (_, server) = tls_server(SERVICE_HOST);
        let (other_roots, _) = tls_server(SERVICE_HOST);
        let hub = hub_with(
            FakeDial::new(Backend::TlsEcho(server)),
            TlsClient::verified(other_roots).unwrap(),
        );

        let (status, _, body) = call(
            &hub,
            get("/cluster1/api/v1/namespaces/default/services/nginx/proxy-service/"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(String::from_utf8_lossy(&body).starts_with(&format!(
            "proxy to {SERVICE_HOST}:7443 failed because TLS handshake"
        )));
    }

    #[tokio::test]
    async fn rejects_invalid_targets() {
        let dial = FakeDial::new(Backend::Echo);
        let hub = hub(dial.clone());

        let (status, _, _) = call(&hub, get("/cluster1")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, body) = call(
            &hub,
            get("/cluster1/api/v1/namespaces/default/services/http:nginx:80/proxy-service/hello"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(String::from_utf8_lossy(&body).contains("http"));
        assert!(dial.dialed().is_empty());
    }

    #[tokio::test]
    async fn dial_failures_are_bad_gateways() {
        let hub = hub(FakeDial::new(Backend::Refuse));
        let (status, _, body) = call(&hub, get("/cluster1/api/pods")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(
            String::from_utf8_lossy(&body),
            "proxy to cluster1:8080 failed because proxy error while dialing cluster1:8080: 503 Service Unavailable"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dial_timeouts_are_gateway_timeouts() {
        let dial = Timeout::new(FakeDial::new(Backend::Hang), Duration::from_secs(30));
        let (status, _, _) = call(&hub(dial), get("/cluster1/api/pods")).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn upgrades_are_spliced() {
        let hub = hub(FakeDial::new(Backend::UpgradeEcho));

        // Serve the hub to a real client so that upgrades can complete.
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve_io(server_io, move |req: Request<Incoming>| {
            let mut hub = hub.clone();
            async move {
                let rsp = tower::Service::call(&mut hub, req).await.unwrap();
                // Only the head of the upgrade response matters here.
                Ok::<_, hyper::Error>(rsp.map(|_| Full::default()))
            }
        }));

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(client_io))
            .await
            .unwrap();
        tokio::spawn(conn.with_upgrades());

        let req = Request::get("/cluster1/api/v1/namespaces/default/pods/web/exec")
            .header("connection", "Upgrade")
            .header("upgrade", "SPDY/3.1")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let rsp = sender.send_request(req).await.unwrap();
        assert_eq!(rsp.status(), StatusCode::SWITCHING_PROTOCOLS);

        let mut upgraded = TokioIo::new(hyper::upgrade::on(rsp).await.unwrap());
        upgraded.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upgraded.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
