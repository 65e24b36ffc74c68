#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod headers;
mod identity;
pub mod target;

pub use self::{
    headers::ServiceRef,
    identity::{service_identity_hash, ServiceIdentityHash},
    target::{resolve, ApiServerTarget, ResolveError, RoutingTarget, ServiceTarget},
};

/// The name under which the add-on is registered on the hub.
pub const ADDON_NAME: &str = "cluster-proxy";

/// The port on which the agent-side service relay accepts tunneled connections.
pub const SERVICE_PROXY_PORT: u16 = 7443;

/// The port on which the agent exposes the cluster's API server to the tunnel.
pub const APISERVER_PROXY_PORT: u16 = 8080;

/// The in-cluster service name of the API server.
pub const APISERVER_HOST: &str = "kubernetes.default.svc";
