#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Certificate authority rotation and agent CSR admission.

pub mod csr;
pub mod pki;
pub mod rotation;
pub mod store;

pub use self::{
    csr::{AgentRegistration, Csr, Denial, Registration, RegistrationConfig, SignError},
    pki::{Authority, CertInfo, CertKeyPair, PkiError},
    rotation::{CertRotation, ConfigError, RotationConfig, RotationError, TargetConfig},
    store::{MemoryStore, Store, StoreError},
};
