use sha2::{Digest, Sha256};
use std::fmt;

const PREFIX: &str = "cluster-proxy-";

/// Kubernetes limits DNS labels to 63 characters.
const MAX_LEN: usize = 63;

/// A stable, DNS-label-safe name identifying a service in a managed cluster.
///
/// The agent exposes each proxied service under this name, so it must be
/// computed identically by every hub and agent process.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceIdentityHash(String);

/// Computes the identity of `service` in `namespace` on `cluster`.
///
/// The SHA-256 digest of `"<cluster> <namespace> <service>"` is hex-encoded,
/// prefixed, and truncated to fit a DNS label.
pub fn service_identity_hash(cluster: &str, namespace: &str, service: &str) -> ServiceIdentityHash {
    let digest = Sha256::digest(format!("{cluster} {namespace} {service}"));
    let mut name = format!("{PREFIX}{}", hex::encode(digest));
    name.truncate(MAX_LEN);
    ServiceIdentityHash(name)
}

// === impl ServiceIdentityHash ===

impl ServiceIdentityHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceIdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for ServiceIdentityHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    #[test]
    fn known_vectors() {
        assert_eq!(
            service_identity_hash("cluster1", "default", "nginx").as_str(),
            "cluster-proxy-61c2553c2384ff09d319698cacb5fbc664b50a6a4015d88c2"
        );
        assert_eq!(
            service_identity_hash("cluster1", "default", "kubernetes").as_str(),
            "cluster-proxy-322eadf654d33e5b88400868958753e69a934b09fd2aa01b4"
        );
        assert_eq!(
            service_identity_hash("local-cluster", "open-cluster-management", "hello-world")
                .as_str(),
            "cluster-proxy-13f98a231a5e08dda5105239d279268e4c8b4262f9c96a503"
        );
    }

    #[test]
    fn deterministic() {
        let a = service_identity_hash("cluster1", "default", "nginx");
        let b = service_identity_hash("cluster1", "default", "nginx");
        assert_eq!(a, b);
        assert_ne!(a, service_identity_hash("cluster2", "default", "nginx"));
    }

    quickcheck! {
        fn is_dns_label(cluster: String, namespace: String, service: String) -> bool {
            let name = service_identity_hash(&cluster, &namespace, &service);
            let name = name.as_str();
            name.len() == MAX_LEN
                && name.starts_with(PREFIX)
                && name.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        }
    }
}
