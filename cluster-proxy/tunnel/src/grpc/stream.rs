use super::proto::{packet::Payload, Packet};
use crate::{Connection, DialError};
use bytes::{Bytes, BytesMut};
use futures::prelude::*;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::mpsc,
    time,
};
use tracing::{debug, debug_span, trace, warn, Instrument};

/// The amount of tunneled data buffered between the caller and the pump.
const IO_BUFFER: usize = 64 * 1024;

const READ_CAPACITY: usize = 16 * 1024;

/// How long a closed connection waits for the proxy server to acknowledge.
const CLOSE_TIMEOUT: time::Duration = time::Duration::from_secs(10);

/// A dial request that has been sent but not yet answered.
///
/// If dropped before the dial completes, e.g. because the caller gave up, the
/// proxy server is told to abandon the dial.
pub(super) struct PendingDial {
    tx: mpsc::Sender<Packet>,
    random: i64,
    done: bool,
}

enum Inbound {
    Data(Bytes),
    Closed,
    Ignore,
}

// === impl PendingDial ===

impl PendingDial {
    pub(super) async fn start(
        tx: mpsc::Sender<Packet>,
        protocol: &str,
        address: &str,
        random: i64,
    ) -> Result<Self, DialError> {
        tx.send(Packet::dial_request(protocol, address, random))
            .await
            .map_err(|_| DialError::Closed(address.to_string()))?;
        Ok(Self {
            tx,
            random,
            done: false,
        })
    }

    fn complete(mut self) -> mpsc::Sender<Packet> {
        self.done = true;
        self.tx.clone()
    }

    /// Waits for the proxy server to answer the dial and, once connected,
    /// spawns a task relaying data between the returned connection and the
    /// tunnel stream.
    pub(super) async fn establish<S>(
        mut self,
        mut rx: S,
        address: &str,
    ) -> Result<Connection, DialError>
    where
        S: Stream<Item = Result<Packet, tonic::Status>> + Send + Unpin + 'static,
    {
        let connect_id = loop {
            let packet = match rx.next().await {
                Some(Ok(packet)) => packet,
                Some(Err(status)) => return Err(status.into()),
                None => return Err(DialError::Closed(address.to_string())),
            };

            match packet.payload {
                Some(Payload::DialResponse(rsp)) if rsp.random == self.random => {
                    if !rsp.error.is_empty() {
                        self.done = true;
                        return Err(DialError::Rejected {
                            address: address.to_string(),
                            reason: rsp.error,
                        });
                    }
                    break rsp.connect_id;
                }
                Some(Payload::CloseDial(cls)) if cls.random == self.random => {
                    self.done = true;
                    return Err(DialError::Closed(address.to_string()));
                }
                payload => trace!(?payload, "Ignoring packet while dialing"),
            }
        };

        let tx = self.complete();
        let (conn, io) = tokio::io::duplex(IO_BUFFER);
        tokio::spawn(
            pump(io, tx, rx, connect_id).instrument(debug_span!("tunnel", %address, connect_id)),
        );
        debug!(%address, connect_id, "Dial completed");
        Ok(Box::new(conn))
    }
}

impl Drop for PendingDial {
    fn drop(&mut self) {
        if !self.done {
            debug!(random = self.random, "Abandoning dial");
            let _ = self.tx.try_send(Packet::close_dial(self.random));
        }
    }
}

/// Relays bytes between `io` and the tunnel stream until either side closes.
async fn pump<S>(mut io: DuplexStream, tx: mpsc::Sender<Packet>, mut rx: S, connect_id: i64)
where
    S: Stream<Item = Result<Packet, tonic::Status>> + Unpin,
{
    let mut buf = BytesMut::new();
    let closed_by_server = loop {
        buf.reserve(READ_CAPACITY);
        tokio::select! {
            res = io.read_buf(&mut buf) => match res {
                Ok(0) => break false,
                Ok(_) => {
                    let data = buf.split().freeze();
                    if tx.send(Packet::data(connect_id, data)).await.is_err() {
                        return;
                    }
                }
                Err(error) => {
                    debug!(%error, "Connection read failed");
                    break false;
                }
            },
            next = rx.next() => match inbound(next, connect_id) {
                Inbound::Data(data) => {
                    if let Err(error) = io.write_all(&data).await {
                        debug!(%error, "Connection write failed");
                        break false;
                    }
                }
                Inbound::Closed => break true,
                Inbound::Ignore => {}
            },
        }
    };

    if closed_by_server {
        debug!("Closed by proxy server");
        let _ = io.shutdown().await;
        return;
    }

    debug!("Closing");
    if tx.send(Packet::close_request(connect_id)).await.is_err() {
        return;
    }
    let drain = async {
        loop {
            match inbound(rx.next().await, connect_id) {
                Inbound::Data(data) => {
                    let _ = io.write_all(&data).await;
                }
                Inbound::Closed => return,
                Inbound::Ignore => {}
            }
        }
    };
    if time::timeout(CLOSE_TIMEOUT, drain).await.is_err() {
        debug!("Timed out waiting for the proxy server to close");
    }
}

fn inbound(next: Option<Result<Packet, tonic::Status>>, connect_id: i64) -> Inbound {
    let packet = match next {
        Some(Ok(packet)) => packet,
        Some(Err(status)) => {
            debug!(%status, "Tunnel stream failed");
            return Inbound::Closed;
        }
        None => return Inbound::Closed,
    };

    match packet.payload {
        Some(Payload::Data(data)) if data.connect_id == connect_id => {
            if data.error.is_empty() {
                Inbound::Data(data.data)
            } else {
                warn!(error = %data.error, "Proxy server reported a connection error");
                Inbound::Closed
            }
        }
        Some(Payload::CloseResponse(rsp)) if rsp.connect_id == connect_id => {
            if !rsp.error.is_empty() {
                debug!(error = %rsp.error, "Close failed");
            }
            Inbound::Closed
        }
        payload => {
            trace!(?payload, "Ignoring packet");
            Inbound::Ignore
        }
    }
}
