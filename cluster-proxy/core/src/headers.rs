//! Side-channel headers carrying a resolved service target to the relay that
//! runs inside the managed cluster.

use crate::target::{ServiceTarget, HTTPS};
use http::header::{HeaderMap, HeaderName, HeaderValue};

pub static PROTO: HeaderName = HeaderName::from_static("cluster-proxy-proto");
pub static NAMESPACE: HeaderName = HeaderName::from_static("cluster-proxy-namespace");
pub static SERVICE: HeaderName = HeaderName::from_static("cluster-proxy-service");
pub static PORT: HeaderName = HeaderName::from_static("cluster-proxy-port");

/// The service coordinates a relay needs to reach its backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceRef {
    pub protocol: String,
    pub namespace: String,
    pub name: String,
    pub port: String,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid request headers: missing {0}")]
    Missing(&'static HeaderName),

    #[error("invalid request headers: {0} is not a valid header value")]
    Invalid(&'static HeaderName),
}

// === impl ServiceRef ===

impl ServiceRef {
    /// Reads the side-channel headers. Every header must be present and
    /// non-empty.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, Error> {
        fn get(headers: &HeaderMap, name: &'static HeaderName) -> Result<String, Error> {
            let v = headers.get(name).ok_or(Error::Missing(name))?;
            let v = v.to_str().map_err(|_| Error::Invalid(name))?;
            if v.is_empty() {
                return Err(Error::Missing(name));
            }
            Ok(v.to_string())
        }

        Ok(Self {
            protocol: get(headers, &PROTO)?,
            namespace: get(headers, &NAMESPACE)?,
            name: get(headers, &SERVICE)?,
            port: get(headers, &PORT)?,
        })
    }

    /// Sets the side-channel headers, replacing any the client supplied.
    pub fn apply(&self, headers: &mut HeaderMap) -> Result<(), Error> {
        fn value(v: &str, name: &'static HeaderName) -> Result<HeaderValue, Error> {
            HeaderValue::from_str(v).map_err(|_| Error::Invalid(name))
        }

        headers.insert(PROTO.clone(), value(&self.protocol, &PROTO)?);
        headers.insert(NAMESPACE.clone(), value(&self.namespace, &NAMESPACE)?);
        headers.insert(SERVICE.clone(), value(&self.name, &SERVICE)?);
        headers.insert(PORT.clone(), value(&self.port, &PORT)?);
        Ok(())
    }

    pub fn remove(headers: &mut HeaderMap) {
        for name in [&PROTO, &NAMESPACE, &SERVICE, &PORT] {
            headers.remove(name);
        }
    }

    /// The in-cluster `host[:port]` of the backend.
    ///
    /// The API server is addressed through its well-known service name
    /// without a port so that the name matches its serving certificate.
    pub fn backend_authority(&self) -> String {
        if self.is_kube_apiserver() {
            return crate::APISERVER_HOST.to_string();
        }
        format!("{}.{}.svc:{}", self.name, self.namespace, self.port)
    }

    pub fn backend_host(&self) -> String {
        format!("{}.{}.svc", self.name, self.namespace)
    }

    pub fn backend_port(&self) -> Option<u16> {
        self.port.parse().ok()
    }

    fn is_kube_apiserver(&self) -> bool {
        self.protocol == HTTPS
            && self.name == "kubernetes"
            && self.namespace == "default"
            && self.port == "443"
    }
}

impl From<&ServiceTarget> for ServiceRef {
    fn from(t: &ServiceTarget) -> Self {
        Self {
            protocol: t.protocol.clone(),
            namespace: t.namespace.clone(),
            name: t.name.clone(),
            port: t.port.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nginx() -> ServiceRef {
        ServiceRef {
            protocol: "https".to_string(),
            namespace: "default".to_string(),
            name: "nginx".to_string(),
            port: "8443".to_string(),
        }
    }

    #[test]
    fn apply_then_read() {
        let mut headers = HeaderMap::new();
        headers.insert(PORT.clone(), HeaderValue::from_static("1"));
        nginx().apply(&mut headers).unwrap();
        assert_eq!(headers.get(&PORT).unwrap(), "8443");
        assert_eq!(ServiceRef::from_headers(&headers).unwrap(), nginx());

        ServiceRef::remove(&mut headers);
        assert!(headers.is_empty());
    }

    #[test]
    fn rejects_missing_or_empty() {
        let mut headers = HeaderMap::new();
        nginx().apply(&mut headers).unwrap();
        headers.remove(&NAMESPACE);
        assert!(matches!(
            ServiceRef::from_headers(&headers),
            Err(Error::Missing(n)) if *n == NAMESPACE
        ));

        nginx().apply(&mut headers).unwrap();
        headers.insert(SERVICE.clone(), HeaderValue::from_static(""));
        assert!(matches!(
            ServiceRef::from_headers(&headers),
            Err(Error::Missing(n)) if *n == SERVICE
        ));

        assert!(ServiceRef::from_headers(&HeaderMap::new()).is_err());
    }

    #[test]
    fn backend_authority() {
        assert_eq!(nginx().backend_authority(), "nginx.default.svc:8443");
        assert_eq!(nginx().backend_host(), "nginx.default.svc");
        assert_eq!(nginx().backend_port(), Some(8443));

        let kube = ServiceRef {
            protocol: "https".to_string(),
            namespace: "default".to_string(),
            name: "kubernetes".to_string(),
            port: "443".to_string(),
        };
        assert_eq!(kube.backend_authority(), "kubernetes.default.svc");

        let kube_alt_port = ServiceRef {
            port: "6443".to_string(),
            ..kube
        };
        assert_eq!(
            kube_alt_port.backend_authority(),
            "kubernetes.default.svc:6443"
        );
    }
}
