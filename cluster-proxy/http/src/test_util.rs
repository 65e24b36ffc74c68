use bytes::Bytes;
use cluster_proxy_tunnel::{Connection, Dial, DialError};
use http::{header, HeaderName, HeaderValue, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, service::service_fn};
use hyper_util::rt::TokioIo;
use std::{
    future::Future,
    sync::{Arc, Mutex},
};
use tokio::io::{AsyncRead, AsyncWrite};

pub(crate) type TestResponse = Result<Response<Full<Bytes>>, hyper::Error>;

/// Serves `handler` on the far end of an in-memory connection.
pub(crate) fn serve<F, Fut>(handler: F) -> Connection
where
    F: Fn(Request<Incoming>) -> Fut + Send + 'static,
    Fut: Future<Output = TestResponse> + Send + 'static,
{
    let (client, server) = tokio::io::duplex(64 * 1024);
    tokio::spawn(serve_io(server, handler));
    Box::new(client)
}

pub(crate) async fn serve_io<I, F, Fut>(io: I, handler: F)
where
    I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    F: Fn(Request<Incoming>) -> Fut + Send + 'static,
    Fut: Future<Output = TestResponse> + Send + 'static,
{
    let _ = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(io), service_fn(handler))
        .with_upgrades()
        .await;
}

/// Responds with the request body, describing the request in `x-req-*`
/// headers.
pub(crate) async fn echo(req: Request<Incoming>) -> TestResponse {
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();
    let mut rsp = Response::new(Full::new(body));
    let headers = rsp.headers_mut();
    headers.insert(
        "x-req-uri",
        HeaderValue::from_str(&parts.uri.to_string()).unwrap(),
    );
    headers.insert(
        "x-req-method",
        HeaderValue::from_str(parts.method.as_str()).unwrap(),
    );
    for (name, value) in &parts.headers {
        let name = HeaderName::from_bytes(format!("x-req-{name}").as_bytes()).unwrap();
        headers.append(name, value.clone());
    }
    Ok(rsp)
}

/// Accepts any upgrade and echoes bytes on the upgraded connection.
pub(crate) async fn upgrade_echo(mut req: Request<Incoming>) -> TestResponse {
    let upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        if let Ok(upgraded) = upgrade.await {
            let (mut rx, mut tx) = tokio::io::split(TokioIo::new(upgraded));
            let _ = tokio::io::copy(&mut rx, &mut tx).await;
        }
    });

    let mut rsp = Response::new(Full::default());
    *rsp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    rsp.headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    rsp.headers_mut()
        .insert(header::UPGRADE, HeaderValue::from_static("echo"));
    Ok(rsp)
}

#[derive(Clone)]
pub(crate) enum Backend {
    Echo,
    UpgradeEcho,
    TlsEcho(Arc<rustls::ServerConfig>),
    Refuse,
    Hang,
}

/// Dials in-memory backends, recording each address.
#[derive(Clone)]
pub(crate) struct FakeDial {
    backend: Backend,
    dialed: Arc<Mutex<Vec<String>>>,
}

impl FakeDial {
    pub(crate) fn new(backend: Backend) -> Self {
        Self {
            backend,
            dialed: Default::default(),
        }
    }

    pub(crate) fn dialed(&self) -> Vec<String> {
        self.dialed.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Dial for FakeDial {
    async fn dial(&self, network: &str, address: &str) -> Result<Connection, DialError> {
        self.dialed
            .lock()
            .unwrap()
            .push(format!("{network}/{address}"));
        match &self.backend {
            Backend::Echo => Ok(serve(echo)),
            Backend::UpgradeEcho => Ok(serve(upgrade_echo)),
            Backend::TlsEcho(config) => {
                let acceptor = tokio_rustls::TlsAcceptor::from(config.clone());
                let (client, server) = tokio::io::duplex(64 * 1024);
                tokio::spawn(async move {
                    if let Ok(tls) = acceptor.accept(server).await {
                        serve_io(tls, echo).await;
                    }
                });
                Ok(Box::new(client))
            }
            Backend::Refuse => Err(DialError::ConnectStatus {
                address: address.to_string(),
                status: "503 Service Unavailable".to_string(),
            }),
            Backend::Hang => futures::future::pending().await,
        }
    }
}

/// A CA and a server configuration presenting a certificate it issued for
/// `name`.
pub(crate) fn tls_server(name: &str) -> (rustls::RootCertStore, Arc<rustls::ServerConfig>) {
    use rcgen::{BasicConstraints, CertificateParams, IsCa, Issuer, KeyPair};
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "test ca");
    let ca_key = KeyPair::generate().unwrap();
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let key = KeyPair::generate().unwrap();
    let issuer = Issuer::from_ca_cert_pem(&ca_cert.pem(), &ca_key).unwrap();
    let cert = CertificateParams::new(vec![name.to_string()])
        .unwrap()
        .signed_by(&key, &issuer)
        .unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(ca_cert.der().clone()).unwrap();

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(
        vec![cert.der().clone()],
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
    )
    .unwrap();
    (roots, Arc::new(config))
}
