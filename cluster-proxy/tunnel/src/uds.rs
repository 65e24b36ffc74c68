use crate::{Connection, Dial, DialError};
use bytes::BytesMut;
use std::path::PathBuf;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
};
use tracing::debug;

/// The largest CONNECT response header block that will be read.
const MAX_RESPONSE_LEN: usize = 8 * 1024;

const MAX_HEADERS: usize = 32;

/// Dials through a local multiplexing proxy by issuing `CONNECT` requests
/// over a Unix domain socket.
#[derive(Clone, Debug)]
pub struct UdsConnect {
    socket: PathBuf,
}

// === impl UdsConnect ===

impl UdsConnect {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }
}

#[async_trait::async_trait]
impl Dial for UdsConnect {
    async fn dial(&self, _network: &str, address: &str) -> Result<Connection, DialError> {
        let mut stream =
            UnixStream::connect(&self.socket)
                .await
                .map_err(|source| DialError::Socket {
                    socket: self.socket.display().to_string(),
                    source,
                })?;

        let req = format!(
            "CONNECT {address} HTTP/1.1\r\nHost: 127.0.0.1\r\nUser-Agent: user-agent\r\n\r\n"
        );
        stream.write_all(req.as_bytes()).await?;

        let mut buf = BytesMut::with_capacity(1024);
        loop {
            if stream.read_buf(&mut buf).await? == 0 {
                return Err(DialError::ConnectResponse {
                    address: address.to_string(),
                    reason: "connection closed before response".to_string(),
                });
            }

            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut rsp = httparse::Response::new(&mut headers);
            match rsp.parse(&buf) {
                Ok(httparse::Status::Complete(len)) => {
                    let code = rsp.code.unwrap_or_default();
                    if code != 200 {
                        return Err(DialError::ConnectStatus {
                            address: address.to_string(),
                            status: format!("{code} {}", rsp.reason.unwrap_or_default()),
                        });
                    }

                    // The caller speaks first on the tunneled connection, so
                    // anything read past the response indicates a confused
                    // peer.
                    if buf.len() > len {
                        return Err(DialError::UnexpectedBufferedData(buf.len() - len));
                    }

                    debug!(%address, socket = %self.socket.display(), "Connected");
                    return Ok(Box::new(stream));
                }
                Ok(httparse::Status::Partial) if buf.len() < MAX_RESPONSE_LEN => continue,
                Ok(httparse::Status::Partial) => {
                    return Err(DialError::ConnectResponse {
                        address: address.to_string(),
                        reason: "response headers too large".to_string(),
                    })
                }
                Err(error) => {
                    return Err(DialError::ConnectResponse {
                        address: address.to_string(),
                        reason: error.to_string(),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    /// Serves a single CONNECT request on a fresh socket, replying with `rsp`,
    /// and returns the request that was received.
    fn serve_once(rsp: &'static [u8]) -> (tempfile::TempDir, PathBuf, tokio::task::JoinHandle<String>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let task = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut req = Vec::new();
            let mut buf = [0u8; 256];
            while !req.ends_with(b"\r\n\r\n") {
                let n = conn.read(&mut buf).await.unwrap();
                req.extend_from_slice(&buf[..n]);
            }
            conn.write_all(rsp).await.unwrap();

            // Echo whatever the client sends after the handshake.
            let n = conn.read(&mut buf).await.unwrap();
            let _ = conn.write_all(&buf[..n]).await;
            String::from_utf8(req).unwrap()
        });
        (dir, path, task)
    }

    #[tokio::test]
    async fn connects() {
        let (_dir, path, server) = serve_once(b"HTTP/1.1 200 Connection established\r\n\r\n");
        let mut conn = UdsConnect::new(&path)
            .dial("tcp", "cluster1:8080")
            .await
            .unwrap();

        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert_eq!(
            server.await.unwrap(),
            "CONNECT cluster1:8080 HTTP/1.1\r\nHost: 127.0.0.1\r\nUser-Agent: user-agent\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn rejects_non_200() {
        let (_dir, path, _server) = serve_once(b"HTTP/1.1 503 Service Unavailable\r\n\r\n");
        let err = UdsConnect::new(&path)
            .dial("tcp", "cluster1:8080")
            .await
            .err()
            .unwrap();
        match err {
            DialError::ConnectStatus { address, status } => {
                assert_eq!(address, "cluster1:8080");
                assert_eq!(status, "503 Service Unavailable");
            }
            err => panic!("unexpected error: {err}"),
        }
    }

    #[tokio::test]
    async fn rejects_buffered_data() {
        let (_dir, path, _server) = serve_once(b"HTTP/1.1 200 OK\r\n\r\nhello");
        let err = UdsConnect::new(&path)
            .dial("tcp", "cluster1:8080")
            .await
            .err()
            .unwrap();
        assert!(
            matches!(err, DialError::UnexpectedBufferedData(5)),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn abandoned_dial_closes_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            // Never respond; wait for the client to hang up.
            let mut req = Vec::new();
            let mut buf = [0u8; 256];
            loop {
                let n = conn.read(&mut buf).await.unwrap();
                if n == 0 {
                    return req;
                }
                req.extend_from_slice(&buf[..n]);
            }
        });

        let dial = crate::Timeout::new(UdsConnect::new(&path), std::time::Duration::from_millis(50));
        let err = dial.dial("tcp", "cluster1:8080").await.err().unwrap();
        assert!(matches!(err, DialError::Timeout(_)), "unexpected error: {err}");

        let req = server.await.unwrap();
        assert!(req.starts_with(b"CONNECT cluster1:8080 HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let err = UdsConnect::new(dir.path().join("absent.sock"))
            .dial("tcp", "cluster1:8080")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DialError::Socket { .. }), "unexpected error: {err}");
    }
}
