#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Kubernetes bindings for the trust controllers.

pub mod csr;
mod metrics;
pub mod rotation;
pub mod store;

pub use self::{
    csr::{CsrController, Decision},
    metrics::ReconcileMetrics,
    rotation::{LeaseClaim, Leadership, RotationController},
    store::KubeStore,
};
pub use kube::{Api, Client};

/// The field manager used for all server-side applies.
pub const FIELD_MANAGER: &str = "cluster-proxy-controller";
