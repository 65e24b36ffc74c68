#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use cluster_proxy_core as core;
pub use cluster_proxy_http as http;
pub use cluster_proxy_k8s as k8s;
pub use cluster_proxy_trust as trust;
pub use cluster_proxy_tunnel as tunnel;

mod args;
mod controller;
mod hub;
mod lease;
mod relay;

pub use self::args::Args;
