use crate::{Connection, Dial, DialError};
use tokio::net::TcpStream;

/// Dials addresses directly over TCP, for use where the backend is already
/// reachable (i.e. inside the managed cluster).
#[derive(Clone, Debug, Default)]
pub struct TcpConnect(());

#[async_trait::async_trait]
impl Dial for TcpConnect {
    async fn dial(&self, _network: &str, address: &str) -> Result<Connection, DialError> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
