//! Resolves an inbound request URI into the cluster resource it addresses.
//!
//! Two URL conventions are recognized:
//!
//! - `<prefix>/<cluster>/<kube-api-path>[?query]` addresses the cluster's API
//!   server.
//! - `<prefix>/<cluster>/api/v1/namespaces/<ns>/services/<[proto:]svc[:port]>/proxy-service/<path>[?query]`
//!   addresses a namespaced service in the cluster.
//!
//! Query strings are dropped from resolved paths; the forwarder reattaches the
//! original query when it rewrites the request.

use crate::identity::{service_identity_hash, ServiceIdentityHash};
use std::fmt;

/// The only protocol a service target may be reached with.
pub const HTTPS: &str = "https";

/// The port assumed when a service spec omits one.
pub const DEFAULT_SERVICE_PORT: &str = "443";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoutingTarget {
    ApiServer(ApiServerTarget),
    Service(ServiceTarget),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiServerTarget {
    pub cluster: String,
    pub path: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceTarget {
    pub cluster: String,
    pub protocol: String,
    pub name: String,
    pub namespace: String,
    pub port: String,
    pub path: String,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("request URL {0:?} is malformed: at least a cluster and a path are required")]
    Malformed(String),

    #[error("invalid service name {0:?}")]
    InvalidService(String),

    #[error("for security reasons only https is supported, unsupported protocol: {0}")]
    UnsupportedProtocol(String),
}

/// Parses a raw request URI into a [`RoutingTarget`].
pub fn resolve(uri: &str) -> Result<RoutingTarget, ResolveError> {
    let path = strip_query(uri);
    let segments = path.split('/').collect::<Vec<_>>();
    if segments.len() < 3 {
        return Err(ResolveError::Malformed(uri.to_string()));
    }

    if is_service_request(&segments) {
        return resolve_service(&segments).map(RoutingTarget::Service);
    }

    Ok(RoutingTarget::ApiServer(ApiServerTarget {
        cluster: segments[1].to_string(),
        path: segments[2..].join("/"),
    }))
}

fn strip_query(uri: &str) -> &str {
    match uri.split_once('?') {
        Some((path, _)) => path,
        None => uri,
    }
}

fn is_service_request(segments: &[&str]) -> bool {
    segments.len() >= 9
        && segments[2] == "api"
        && segments[3] == "v1"
        && segments[4] == "namespaces"
        && segments[6] == "services"
        && segments[8] == "proxy-service"
}

fn resolve_service(segments: &[&str]) -> Result<ServiceTarget, ResolveError> {
    let ServiceSpec { scheme, name, port } = ServiceSpec::parse(segments[7])?;
    let protocol = match scheme {
        "" => HTTPS,
        HTTPS => HTTPS,
        other => return Err(ResolveError::UnsupportedProtocol(other.to_string())),
    };

    Ok(ServiceTarget {
        cluster: segments[1].to_string(),
        protocol: protocol.to_string(),
        name: name.to_string(),
        namespace: segments[5].to_string(),
        port: if port.is_empty() {
            DEFAULT_SERVICE_PORT.to_string()
        } else {
            port.to_string()
        },
        path: segments[9..].join("/"),
    })
}

/// A `[scheme:]name[:port]` service reference, as accepted by the Kubernetes
/// service proxy subresource.
#[derive(Debug, PartialEq, Eq)]
struct ServiceSpec<'a> {
    scheme: &'a str,
    name: &'a str,
    port: &'a str,
}

impl<'a> ServiceSpec<'a> {
    fn parse(spec: &'a str) -> Result<Self, ResolveError> {
        let parts = spec.split(':').collect::<Vec<_>>();
        let (scheme, name, port) = match parts.as_slice() {
            [name] => ("", *name, ""),
            [name, port] => ("", *name, *port),
            [scheme, name, port] => (*scheme, *name, *port),
            _ => return Err(ResolveError::InvalidService(spec.to_string())),
        };

        if name.is_empty() || !matches!(scheme, "" | "http" | HTTPS) {
            return Err(ResolveError::InvalidService(spec.to_string()));
        }

        Ok(Self { scheme, name, port })
    }
}

// === impl RoutingTarget ===

impl RoutingTarget {
    pub fn cluster(&self) -> &str {
        match self {
            Self::ApiServer(t) => &t.cluster,
            Self::Service(t) => &t.cluster,
        }
    }

    /// The path the request is forwarded with, without a leading slash.
    pub fn path(&self) -> &str {
        match self {
            Self::ApiServer(t) => &t.path,
            Self::Service(t) => &t.path,
        }
    }
}

impl fmt::Display for RoutingTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiServer(t) => write!(f, "{}/{}", t.cluster, t.path),
            Self::Service(t) => write!(
                f,
                "{}/{}/{}:{}/{}",
                t.cluster, t.namespace, t.name, t.port, t.path
            ),
        }
    }
}

// === impl ServiceTarget ===

impl ServiceTarget {
    pub fn identity(&self) -> ServiceIdentityHash {
        service_identity_hash(&self.cluster, &self.namespace, &self.name)
    }
}
