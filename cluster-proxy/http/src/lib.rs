#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Reverse proxies that carry HTTP requests through cluster tunnels.
//!
//! [`Hub`] serves users on the hub: it resolves each request into a cluster
//! target, dials that target through a tunnel, and forwards the exchange.
//! [`Relay`] runs inside the managed cluster and forwards service-mode
//! requests to the in-cluster backend named by their side-channel headers.

mod forward;
mod hub;
pub mod metrics;
mod relay;
pub mod tls;

#[cfg(test)]
mod test_util;

pub use self::{
    forward::{forward, ForwardError, Upstream},
    hub::{ApiServerUpstream, Hub, ServiceUpstream},
    metrics::ProxyMetrics,
    relay::Relay,
    tls::{TlsClient, TlsError},
};

use bytes::Bytes;
use http::{header, HeaderValue, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};

pub type Body = BoxBody<Bytes, hyper::Error>;

fn empty() -> Body {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn error_response(status: StatusCode, message: String) -> Response<Body> {
    let mut rsp = Response::new(
        Full::new(Bytes::from(message))
            .map_err(|never| match never {})
            .boxed(),
    );
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    rsp
}
