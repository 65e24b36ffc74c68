//! Forwards one HTTP/1.1 exchange over a tunneled connection.

use crate::{
    empty, error_response,
    metrics::{Mode, Outcome, ProxyMetrics},
    tls::{TlsClient, TlsError},
    Body,
};
use bytes::Bytes;
use cluster_proxy_tunnel::{Connection, Dial, DialError};
use http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode, Uri};
use http_body::{Frame, SizeHint};
use http_body_util::BodyExt;
use hyper::{body::Incoming, upgrade::OnUpgrade};
use hyper_util::rt::TokioIo;
use std::{
    pin::Pin,
    task::{Context, Poll},
};
use tokio::task::AbortHandle;
use tracing::{debug, warn, Instrument};

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP: [&str; 7] = [
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
];

/// Where a tunneled connection leads.
#[derive(Clone, Debug)]
pub struct Upstream {
    /// Sent as the `Host` header.
    pub authority: String,
    /// The name the upstream is authenticated as when `tls` is set.
    pub host: String,
    pub tls: Option<TlsClient>,
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error(transparent)]
    Dial(#[from] DialError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("invalid upstream request: {0}")]
    Request(#[from] http::Error),

    #[error("invalid upstream authority {0:?}")]
    Authority(String),

    #[error("upstream exchange failed: {0}")]
    Http(#[from] hyper::Error),
}

/// A response body that keeps the upstream connection alive until it is
/// dropped.
struct GuardedBody {
    inner: Incoming,
    _driver: AbortOnDrop,
}

struct AbortOnDrop(AbortHandle);

// === impl ForwardError ===

impl ForwardError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Dial(DialError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Sends `req` to `upstream` over `io` and returns its response.
///
/// Bodies are streamed in both directions. The connection is closed once the
/// returned response body is dropped, or immediately if the exchange fails.
/// When the upstream accepts a protocol upgrade, the upgraded connection is
/// spliced onto the client's upgraded connection.
pub async fn forward<B>(
    io: Connection,
    upstream: &Upstream,
    mut req: Request<B>,
) -> Result<Response<Body>, ForwardError>
where
    B: http_body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let io = match &upstream.tls {
        Some(tls) => tls.connect(&upstream.host, io).await?,
        None => io,
    };

    let client_upgrade = if is_upgrade(req.headers()) {
        strip_hop_by_hop(req.headers_mut(), true);
        Some(hyper::upgrade::on(&mut req))
    } else {
        strip_hop_by_hop(req.headers_mut(), false);
        None
    };
    let host = HeaderValue::from_str(&upstream.authority)
        .map_err(|_| ForwardError::Authority(upstream.authority.clone()))?;
    req.headers_mut().insert(header::HOST, host);

    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .handshake(TokioIo::new(io))
        .await?;
    let driver = tokio::spawn(
        async move {
            if let Err(error) = conn.with_upgrades().await {
                debug!(%error, "Upstream connection failed");
            }
        }
        .in_current_span(),
    );
    let driver = AbortOnDrop(driver.abort_handle());

    let mut rsp = sender.send_request(req).await?;
    if rsp.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(client) = client_upgrade {
            let upgrade = hyper::upgrade::on(&mut rsp);
            tokio::spawn(splice(client, upgrade, driver).in_current_span());
            return Ok(rsp.map(|_| empty()));
        }
    }

    strip_hop_by_hop(rsp.headers_mut(), false);
    Ok(rsp.map(|inner| {
        GuardedBody {
            inner,
            _driver: driver,
        }
        .boxed()
    }))
}

/// Dials `address` and forwards `req` to `upstream` over the new
/// connection, converting failures into diagnostic responses.
pub(crate) async fn dial_and_forward<B>(
    dial: &dyn Dial,
    metrics: &ProxyMetrics,
    mode: Mode,
    address: &str,
    upstream: &Upstream,
    req: Request<B>,
) -> Response<Body>
where
    B: http_body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let io = match dial.dial("tcp", address).await {
        Ok(io) => io,
        Err(error) => {
            let error = ForwardError::from(error);
            warn!(%address, %error, "Failed to dial upstream");
            metrics.request(mode, Outcome::DialFailed);
            return failure(address, &error);
        }
    };

    match forward(io, upstream, req).await {
        Ok(rsp) => {
            debug!(%address, status = %rsp.status(), "Forwarded");
            metrics.request(mode, Outcome::Forwarded);
            rsp
        }
        Err(error) => {
            warn!(%address, %error, "Failed to forward request");
            metrics.request(mode, Outcome::ForwardFailed);
            failure(address, &error)
        }
    }
}

fn failure(address: &str, error: &ForwardError) -> Response<Body> {
    error_response(
        error.status(),
        format!("proxy to {address} failed because {error}"),
    )
}

/// Replaces the request target with `/<path>`, keeping the original query.
pub(crate) fn set_origin_form<B>(req: &mut Request<B>, path: &str) -> Result<(), ForwardError> {
    let target = match req.uri().query() {
        Some(query) => format!("/{path}?{query}"),
        None => format!("/{path}"),
    };
    *req.uri_mut() = Uri::try_from(target).map_err(http::Error::from)?;
    Ok(())
}

fn is_upgrade(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        && headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

fn strip_hop_by_hop(headers: &mut HeaderMap, upgrade: bool) {
    if !upgrade {
        // A `Connection` header may list other headers that apply only to
        // this connection.
        if let Some(conn) = headers.remove(header::CONNECTION) {
            if let Ok(names) = conn.to_str() {
                for name in names.split(',') {
                    headers.remove(name.trim());
                }
            }
        }
        headers.remove(header::UPGRADE);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

async fn splice(client: OnUpgrade, upstream: OnUpgrade, _driver: AbortOnDrop) {
    let (client, upstream) = match tokio::try_join!(client, upstream) {
        Ok(upgraded) => upgraded,
        Err(error) => {
            debug!(%error, "Upgrade failed");
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => debug!(sent, received, "Upgraded connection closed"),
        Err(error) => debug!(%error, "Upgraded connection failed"),
    }
}

// === impl GuardedBody ===

impl http_body::Body for GuardedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
