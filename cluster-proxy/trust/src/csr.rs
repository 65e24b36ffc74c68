//! Agent certificate signing requests: registration, admission and signing.

use crate::pki::{Authority, PkiError};
use rcgen::{ExtendedKeyUsagePurpose, KeyUsagePurpose};
use std::{collections::BTreeSet, time::Duration};
use time::OffsetDateTime;
use x509_parser::{certification_request::X509CertificationRequest, prelude::FromDer};

/// The add-on's own signer.
pub const SIGNER_NAME: &str = "github.com/open-cluster-management/cluster-proxy-addon";

/// The built-in signer for API server client certificates.
pub const KUBE_CLIENT_SIGNER: &str = "kubernetes.io/kube-apiserver-client";

const AUTHENTICATED_GROUP: &str = "system:authenticated";
const CERTIFICATE_REQUEST: &str = "CERTIFICATE REQUEST";
const SIGNED_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A certificate signing request as submitted by an agent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Csr {
    pub name: String,
    pub signer_name: String,
    pub usages: Vec<String>,
    /// The PEM-encoded PKCS#10 request.
    pub request: Vec<u8>,
    /// The authenticated principal that submitted the request.
    pub username: Option<String>,
}

/// The subject an agent must request for a given signer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrationConfig {
    pub signer_name: String,
    pub user: String,
    pub groups: Vec<String>,
}

/// Per-add-on registration policy.
pub trait Registration: Send + Sync {
    /// The certificates an agent on `cluster` should request.
    fn configure(&self, cluster: &str) -> Vec<RegistrationConfig>;

    /// Decides whether a request from `cluster` may be approved.
    fn admit(&self, cluster: &str, csr: &Csr) -> Result<(), Denial>;
}

/// Admits requests whose subject is exactly the add-on agent identity for the
/// requesting cluster.
#[derive(Clone, Debug)]
pub struct AgentRegistration {
    addon: String,
    agent: String,
}

/// The reason a request was not approved. Checks run in declaration order and
/// the first failure wins.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Denial {
    #[error("unsupported signer {0:?}")]
    Signer(String),

    #[error("request is not PEM encoded")]
    NotPem,

    #[error("unexpected PEM block {0:?}")]
    BlockType(String),

    #[error("invalid certificate request: {0}")]
    Malformed(String),

    #[error("unexpected organizations {0:?}")]
    Organizations(BTreeSet<String>),

    #[error("unexpected common name {0:?}")]
    CommonName(Option<String>),

    #[error("requester {0:?} does not belong to the cluster")]
    Requester(Option<String>),
}

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("signer has expired at {0}")]
    SignerExpired(OffsetDateTime),

    #[error("unsupported key usage {0:?}")]
    UnsupportedUsage(String),

    #[error("request is not valid UTF-8 PEM")]
    Encoding,

    #[error(transparent)]
    Pki(#[from] PkiError),
}

// === impl AgentRegistration ===

impl Default for AgentRegistration {
    fn default() -> Self {
        Self::new("cluster-proxy", "cluster-proxy-addon-agent")
    }
}

impl AgentRegistration {
    pub fn new(addon: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            addon: addon.into(),
            agent: agent.into(),
        }
    }

    pub fn addon(&self) -> &str {
        &self.addon
    }

    /// `system:open-cluster-management:cluster:<cluster>:addon:<addon>:agent:<agent>`
    pub fn agent_user(&self, cluster: &str) -> String {
        format!(
            "system:open-cluster-management:cluster:{cluster}:addon:{}:agent:{}",
            self.addon, self.agent
        )
    }

    pub fn groups(&self, cluster: &str) -> Vec<String> {
        vec![
            format!(
                "system:open-cluster-management:cluster:{cluster}:addon:{}",
                self.addon
            ),
            format!("system:open-cluster-management:addon:{}", self.addon),
            AUTHENTICATED_GROUP.to_string(),
        ]
    }

    fn requester_prefix(cluster: &str) -> String {
        format!("system:open-cluster-management:{cluster}:")
    }
}

impl Registration for AgentRegistration {
    fn configure(&self, cluster: &str) -> Vec<RegistrationConfig> {
        [KUBE_CLIENT_SIGNER, SIGNER_NAME]
            .into_iter()
            .map(|signer| RegistrationConfig {
                signer_name: signer.to_string(),
                user: self.agent_user(cluster),
                groups: self.groups(cluster),
            })
            .collect()
    }

    fn admit(&self, cluster: &str, csr: &Csr) -> Result<(), Denial> {
        if csr.signer_name != SIGNER_NAME && csr.signer_name != KUBE_CLIENT_SIGNER {
            return Err(Denial::Signer(csr.signer_name.clone()));
        }

        let block = pem::parse(&csr.request).map_err(|_| Denial::NotPem)?;
        if block.tag() != CERTIFICATE_REQUEST {
            return Err(Denial::BlockType(block.tag().to_string()));
        }
        let (_, req) = X509CertificationRequest::from_der(block.contents())
            .map_err(|e| Denial::Malformed(e.to_string()))?;
        let subject = &req.certification_request_info.subject;

        let orgs = subject
            .iter_organization()
            .filter_map(|o| o.as_str().ok())
            .map(str::to_string)
            .collect::<BTreeSet<_>>();
        let expected = self.groups(cluster).into_iter().collect::<BTreeSet<_>>();
        if orgs != expected {
            return Err(Denial::Organizations(orgs));
        }

        let cn = subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok());
        if cn != Some(self.agent_user(cluster).as_str()) {
            return Err(Denial::CommonName(cn.map(str::to_string)));
        }

        let prefix = Self::requester_prefix(cluster);
        match csr.username.as_deref() {
            Some(user) if user.starts_with(&prefix) => Ok(()),
            user => Err(Denial::Requester(user.map(str::to_string))),
        }
    }
}

// === impl Csr ===

impl Csr {
    pub fn sign(&self, ca: &Authority) -> Result<String, SignError> {
        self.sign_at(ca, OffsetDateTime::now_utc())
    }

    /// Issues a certificate for this request under `ca`, returning it PEM
    /// encoded. The certificate expires after a year or with the CA,
    /// whichever comes first.
    pub fn sign_at(&self, ca: &Authority, now: OffsetDateTime) -> Result<String, SignError> {
        let ca_expiry = ca.info().not_after;
        if ca.info().is_expired(now) {
            return Err(SignError::SignerExpired(ca_expiry));
        }

        let (key_usages, extended) = usages(&self.usages)?;
        let request = std::str::from_utf8(&self.request).map_err(|_| SignError::Encoding)?;
        let not_after = std::cmp::min(now + SIGNED_VALIDITY, ca_expiry);
        let cert = ca.sign_request(request, key_usages, extended, now, not_after)?;
        tracing::debug!(csr = %self.name, %not_after, "Signed certificate request");
        Ok(cert)
    }
}

/// Maps Kubernetes key usage names onto X.509 key and extended key usages.
fn usages(
    names: &[String],
) -> Result<(Vec<KeyUsagePurpose>, Vec<ExtendedKeyUsagePurpose>), SignError> {
    let mut key = Vec::new();
    let mut extended = Vec::new();
    for name in names {
        match name.as_str() {
            "signing" | "digital signature" => key.push(KeyUsagePurpose::DigitalSignature),
            "content commitment" => key.push(KeyUsagePurpose::ContentCommitment),
            "key encipherment" => key.push(KeyUsagePurpose::KeyEncipherment),
            "key agreement" => key.push(KeyUsagePurpose::KeyAgreement),
            "data encipherment" => key.push(KeyUsagePurpose::DataEncipherment),
            "cert sign" => key.push(KeyUsagePurpose::KeyCertSign),
            "crl sign" => key.push(KeyUsagePurpose::CrlSign),
            "encipher only" => key.push(KeyUsagePurpose::EncipherOnly),
            "decipher only" => key.push(KeyUsagePurpose::DecipherOnly),
            "any" => extended.push(ExtendedKeyUsagePurpose::Any),
            "server auth" => extended.push(ExtendedKeyUsagePurpose::ServerAuth),
            "client auth" => extended.push(ExtendedKeyUsagePurpose::ClientAuth),
            "code signing" => extended.push(ExtendedKeyUsagePurpose::CodeSigning),
            "email protection" | "s/mime" => {
                extended.push(ExtendedKeyUsagePurpose::EmailProtection)
            }
            "timestamping" => extended.push(ExtendedKeyUsagePurpose::TimeStamping),
            "ocsp signing" => extended.push(ExtendedKeyUsagePurpose::OcspSigning),
            other => return Err(SignError::UnsupportedUsage(other.to_string())),
        }
    }
    Ok((key, extended))
}
