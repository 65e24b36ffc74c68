//! Keeps the signing authority, its trust bundle, and the serving
//! certificates it issues fresh.
//!
//! Each sync is idempotent: it inspects the stored material and replaces only
//! what is missing, invalid, or nearing expiry. A certificate is replaced once
//! less than a fifth of its lifetime remains, so the validity windows must
//! leave at least two resync intervals of slack (see
//! [`RotationConfig::validate`]).

use crate::{
    pki::{Authority, CertInfo, PkiError},
    store::{Store, StoreError},
};
use std::{collections::BTreeSet, time::Duration};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone, Debug)]
pub struct RotationConfig {
    /// The secret holding the current signer's `tls.crt`/`tls.key`.
    pub signer_secret: String,
    /// Signers are named `<prefix>@<unix-seconds>`.
    pub signer_name_prefix: String,
    pub signing_validity: Duration,
    /// The config map publishing the trust bundle.
    pub ca_bundle: String,
    pub target_validity: Duration,
    pub targets: Vec<TargetConfig>,
    pub resync_interval: Duration,
}

/// A serving certificate issued by the signer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetConfig {
    pub secret: String,
    pub hostnames: Vec<String>,
}

pub struct CertRotation<S> {
    store: S,
    config: RotationConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("signing validity {validity:?} leaves less than two resync intervals ({resync:?}) of slack")]
    SigningValidity { validity: Duration, resync: Duration },

    #[error("target validity {validity:?} leaves less than two resync intervals ({resync:?}) of slack")]
    TargetValidity { validity: Duration, resync: Duration },

    #[error("resync interval must be positive")]
    ResyncInterval,

    #[error("target {0} has no host names")]
    NoHostnames(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RotationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid CA bundle {name}: {source}")]
    Bundle {
        name: String,
        #[source]
        source: PkiError,
    },

    #[error(transparent)]
    Pki(#[from] PkiError),

    #[error("failed to rotate target certificates: {}", display_failures(.0))]
    Targets(Vec<(String, RotationError)>),
}

fn display_failures(failures: &[(String, RotationError)]) -> String {
    failures
        .iter()
        .map(|(secret, error)| format!("{secret}: {error}"))
        .collect::<Vec<_>>()
        .join("; ")
}

// === impl RotationConfig ===

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            signer_secret: "cluster-proxy-signer".to_string(),
            signer_name_prefix: "cluster-proxy-addon".to_string(),
            signing_validity: 365 * DAY,
            ca_bundle: "cluster-proxy-ca-bundle".to_string(),
            target_validity: 30 * DAY,
            targets: Vec::new(),
            resync_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl RotationConfig {
    /// Checks that each certificate is refreshed at least two resyncs before
    /// it expires.
    ///
    /// A signer's refresh window is a fifth of its lifetime, and the leaves it
    /// issues are themselves refreshed within a fifth of theirs, so the signer
    /// needs `validity / 25 > 2 * resync`. Leaves need `validity / 5 > 2 * resync`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let resync = self.resync_interval;
        if resync.is_zero() {
            return Err(ConfigError::ResyncInterval);
        }
        if self.signing_validity / 25 <= resync * 2 {
            return Err(ConfigError::SigningValidity {
                validity: self.signing_validity,
                resync,
            });
        }
        if self.target_validity / 5 <= resync * 2 {
            return Err(ConfigError::TargetValidity {
                validity: self.target_validity,
                resync,
            });
        }
        if let Some(t) = self.targets.iter().find(|t| t.hostnames.is_empty()) {
            return Err(ConfigError::NoHostnames(t.secret.clone()));
        }
        Ok(())
    }
}

// === impl CertRotation ===

impl<S: Store> CertRotation<S> {
    pub fn new(store: S, config: RotationConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { store, config })
    }

    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    pub async fn sync(&self) -> Result<Authority, RotationError> {
        self.sync_at(OffsetDateTime::now_utc()).await
    }

    /// Reconciles all managed material as of `now`, returning the current
    /// signer.
    ///
    /// Every target is attempted even if others fail.
    pub async fn sync_at(&self, now: OffsetDateTime) -> Result<Authority, RotationError> {
        let signer = self.ensure_signing_pair(now).await?;
        let bundle = self.ensure_ca_bundle(&signer, now).await?;

        let mut failures = Vec::new();
        for target in &self.config.targets {
            if let Err(error) = self.ensure_target_pair(target, &signer, &bundle, now).await {
                warn!(secret = %target.secret, %error, "Failed to rotate target certificate");
                failures.push((target.secret.clone(), error));
            }
        }
        if !failures.is_empty() {
            return Err(RotationError::Targets(failures));
        }

        Ok(signer)
    }

    async fn ensure_signing_pair(&self, now: OffsetDateTime) -> Result<Authority, RotationError> {
        let name = &self.config.signer_secret;
        if let Some(pair) = self.store.get_tls(name).await? {
            match Authority::from_pair(pair) {
                Ok(ca) if !ca.info().needs_refresh(now) => return Ok(ca),
                Ok(ca) => info!(secret = %name, not_after = %ca.info().not_after, "Signer is nearing expiry"),
                Err(error) => warn!(secret = %name, %error, "Replacing unreadable signer"),
            }
        }

        let cn = format!(
            "{}@{}",
            self.config.signer_name_prefix,
            now.unix_timestamp()
        );
        let ca = Authority::generate(&cn, self.config.signing_validity, now)?;
        self.store.put_tls(name, ca.pair()).await?;
        info!(secret = %name, %cn, not_after = %ca.info().not_after, "Generated signer");
        Ok(ca)
    }

    /// Publishes the current signer ahead of every previously published CA
    /// that has not yet expired.
    ///
    /// Leaves never outlive their issuer, so an expired CA can no longer
    /// verify any live certificate and is safe to drop.
    async fn ensure_ca_bundle(
        &self,
        signer: &Authority,
        now: OffsetDateTime,
    ) -> Result<Vec<CertInfo>, RotationError> {
        let name = &self.config.ca_bundle;
        let current = self.store.get_bundle(name).await?;
        let existing = match current.as_deref() {
            Some(pem) => CertInfo::parse_bundle(pem).map_err(|source| RotationError::Bundle {
                name: name.clone(),
                source,
            })?,
            None => Vec::new(),
        };

        let mut certs = vec![signer.info().clone()];
        for cert in existing {
            if cert.is_expired(now) {
                debug!(cn = ?cert.common_name, "Dropping expired CA from bundle");
                continue;
            }
            if !certs.contains(&cert) {
                certs.push(cert);
            }
        }

        let pem = certs.iter().map(CertInfo::to_pem).collect::<String>();
        if current.as_deref() != Some(pem.as_str()) {
            self.store.put_bundle(name, &pem).await?;
            info!(configmap = %name, cas = certs.len(), "Updated CA bundle");
        }
        Ok(certs)
    }

    async fn ensure_target_pair(
        &self,
        target: &TargetConfig,
        signer: &Authority,
        bundle: &[CertInfo],
        now: OffsetDateTime,
    ) -> Result<(), RotationError> {
        let reason = match self.store.get_tls(&target.secret).await? {
            None => "missing",
            Some(pair) => match CertInfo::from_pem(&pair.cert_pem) {
                Err(_) => "unreadable",
                Ok(cert) => match reissue_reason(&cert, target, bundle, now) {
                    Some(reason) => reason,
                    None => return Ok(()),
                },
            },
        };

        let pair = signer.issue_server(&target.hostnames, self.config.target_validity, now)?;
        self.store.put_tls(&target.secret, &pair).await?;
        info!(secret = %target.secret, %reason, "Issued target certificate");
        Ok(())
    }
}

fn reissue_reason(
    cert: &CertInfo,
    target: &TargetConfig,
    bundle: &[CertInfo],
    now: OffsetDateTime,
) -> Option<&'static str> {
    if !bundle.iter().any(|ca| cert.is_signed_by(ca)) {
        return Some("issuer is not trusted");
    }
    if cert.is_expired(now) {
        return Some("expired");
    }
    if cert.needs_refresh(now) {
        return Some("nearing expiry");
    }
    let hostnames = target.hostnames.iter().cloned().collect::<BTreeSet<_>>();
    if cert.hostnames != hostnames {
        return Some("host names changed");
    }
    None
}
