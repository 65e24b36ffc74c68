//! Certificate generation and inspection.

use rand::Rng;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};
use std::{
    collections::BTreeSet,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    time::Duration,
};
use time::OffsetDateTime;
use x509_parser::{certificate::X509Certificate, extensions::GeneralName, prelude::FromDer};

const CERTIFICATE: &str = "CERTIFICATE";

/// PEM-encoded certificate and private key, as stored in a TLS secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertKeyPair {
    pub cert_pem: String,
    pub key_pem: String,
}

/// The parts of a certificate that rotation decisions depend on.
#[derive(Clone, Debug)]
pub struct CertInfo {
    der: Vec<u8>,
    pub common_name: Option<String>,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    /// DNS names and IP addresses from the subject alternative names.
    pub hostnames: BTreeSet<String>,
}

/// A certificate authority able to issue leaf certificates.
#[derive(Clone, Debug)]
pub struct Authority {
    pair: CertKeyPair,
    info: CertInfo,
}

#[derive(Debug, thiserror::Error)]
pub enum PkiError {
    #[error("failed to generate certificate: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("failed to decode PEM: {0}")]
    Pem(#[from] pem::PemError),

    #[error("expected a {expected} PEM block, found {found}")]
    PemTag {
        expected: &'static str,
        found: String,
    },

    #[error("no certificate found")]
    NoCertificate,

    #[error("failed to parse certificate: {0}")]
    Parse(String),

    #[error("invalid DNS name {0:?}")]
    DnsName(String),
}

// === impl CertInfo ===

impl CertInfo {
    pub fn from_der(der: Vec<u8>) -> Result<Self, PkiError> {
        let (_, cert) =
            X509Certificate::from_der(&der).map_err(|e| PkiError::Parse(e.to_string()))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);
        let not_before = cert.validity().not_before.to_datetime();
        let not_after = cert.validity().not_after.to_datetime();

        let mut hostnames = BTreeSet::new();
        let san = cert
            .subject_alternative_name()
            .map_err(|e| PkiError::Parse(e.to_string()))?;
        for name in san.iter().flat_map(|san| san.value.general_names.iter()) {
            match name {
                GeneralName::DNSName(dns) => {
                    hostnames.insert(dns.to_string());
                }
                GeneralName::IPAddress(octets) => {
                    if let Some(ip) = ip_from_octets(octets) {
                        hostnames.insert(ip.to_string());
                    }
                }
                _ => {}
            }
        }

        drop(cert);
        Ok(Self {
            der,
            common_name,
            not_before,
            not_after,
            hostnames,
        })
    }

    /// Parses every certificate in a PEM bundle, ignoring other block types.
    pub fn parse_bundle(pem: &str) -> Result<Vec<Self>, PkiError> {
        pem::parse_many(pem)?
            .into_iter()
            .filter(|p| p.tag() == CERTIFICATE)
            .map(|p| Self::from_der(p.into_contents()))
            .collect()
    }

    /// Parses the first certificate in a PEM document.
    pub fn from_pem(pem: &str) -> Result<Self, PkiError> {
        Self::parse_bundle(pem)?
            .into_iter()
            .next()
            .ok_or(PkiError::NoCertificate)
    }

    pub fn to_pem(&self) -> String {
        pem::encode_config(
            &pem::Pem::new(CERTIFICATE, self.der.clone()),
            pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
        )
    }

    pub fn lifetime(&self) -> time::Duration {
        self.not_after - self.not_before
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.not_after
    }

    /// Certificates are refreshed once less than a fifth of their lifetime
    /// remains.
    pub fn needs_refresh(&self, now: OffsetDateTime) -> bool {
        now > self.not_after - self.lifetime() / 5
    }

    /// Returns true if this certificate's signature verifies with `ca`'s key.
    pub fn is_signed_by(&self, ca: &CertInfo) -> bool {
        let (Ok((_, cert)), Ok((_, ca))) = (
            X509Certificate::from_der(&self.der),
            X509Certificate::from_der(&ca.der),
        ) else {
            return false;
        };
        cert.verify_signature(Some(ca.public_key())).is_ok()
    }
}

impl PartialEq for CertInfo {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

fn ip_from_octets(octets: &[u8]) -> Option<IpAddr> {
    match octets.len() {
        4 => <[u8; 4]>::try_from(octets)
            .ok()
            .map(|o| IpAddr::V4(Ipv4Addr::from(o))),
        16 => <[u8; 16]>::try_from(octets)
            .ok()
            .map(|o| IpAddr::V6(Ipv6Addr::from(o))),
        _ => None,
    }
}

// === impl Authority ===

impl Authority {
    /// Generates a self-signed authority valid from `now` for `validity`.
    pub fn generate(
        common_name: &str,
        validity: Duration,
        now: OffsetDateTime,
    ) -> Result<Self, PkiError> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.not_before = now;
        params.not_after = now + validity;
        params.serial_number = Some(serial_number());

        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;
        let info = CertInfo::from_der(cert.der().to_vec())?;
        Ok(Self {
            pair: CertKeyPair {
                cert_pem: cert.pem(),
                key_pem: key.serialize_pem(),
            },
            info,
        })
    }

    /// Loads an authority from stored material, validating both halves.
    pub fn from_pair(pair: CertKeyPair) -> Result<Self, PkiError> {
        KeyPair::from_pem(&pair.key_pem)?;
        let info = CertInfo::from_pem(&pair.cert_pem)?;
        Ok(Self { pair, info })
    }

    pub fn pair(&self) -> &CertKeyPair {
        &self.pair
    }

    pub fn info(&self) -> &CertInfo {
        &self.info
    }

    /// Issues a serving certificate for `hostnames`. The certificate never
    /// outlives this authority.
    pub fn issue_server(
        &self,
        hostnames: &[String],
        validity: Duration,
        now: OffsetDateTime,
    ) -> Result<CertKeyPair, PkiError> {
        let mut params = CertificateParams::default();
        params.distinguished_name = hostnames
            .first()
            .map(|cn| distinguished_name(cn))
            .unwrap_or_else(DistinguishedName::new);
        params.subject_alt_names = hostnames
            .iter()
            .map(|name| subject_alt_name(name))
            .collect::<Result<_, _>>()?;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.not_before = now;
        params.not_after = std::cmp::min(now + validity, self.info.not_after);
        params.serial_number = Some(serial_number());

        let key = KeyPair::generate()?;
        let ca_key = KeyPair::from_pem(&self.pair.key_pem)?;
        let issuer = Issuer::from_ca_cert_pem(&self.pair.cert_pem, &ca_key)?;
        let cert = params.signed_by(&key, &issuer)?;
        Ok(CertKeyPair {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    /// Signs a PKCS#10 request, keeping its subject and public key.
    pub fn sign_request(
        &self,
        csr_pem: &str,
        key_usages: Vec<KeyUsagePurpose>,
        extended_key_usages: Vec<ExtendedKeyUsagePurpose>,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
    ) -> Result<String, PkiError> {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)?;
        csr.params.is_ca = IsCa::NoCa;
        csr.params.key_usages = key_usages;
        csr.params.extended_key_usages = extended_key_usages;
        csr.params.not_before = not_before;
        csr.params.not_after = not_after;
        csr.params.serial_number = Some(serial_number());

        let ca_key = KeyPair::from_pem(&self.pair.key_pem)?;
        let issuer = Issuer::from_ca_cert_pem(&self.pair.cert_pem, &ca_key)?;
        Ok(csr.signed_by(&issuer)?.pem())
    }
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn
}

fn subject_alt_name(name: &str) -> Result<SanType, PkiError> {
    if let Ok(ip) = name.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    Ia5String::try_from(name.to_string())
        .map(SanType::DnsName)
        .map_err(|_| PkiError::DnsName(name.to_string()))
}

/// A random, positive 128-bit serial number.
fn serial_number() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes[..]);
    bytes[0] &= 0x7f;
    SerialNumber::from(bytes.to_vec())
}
