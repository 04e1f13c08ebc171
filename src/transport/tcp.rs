//! TCP binding of the transport capability contract.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::error::{SetupError, TransportError};

use super::{Acceptor, Endpoint, RawSession, SessionReader, SessionWriter, Transport, TransportKind};

const READ_BUF: usize = 8 * 1024;

/// Stream-socket transport over tokio TCP.
#[derive(Debug, Default, Clone)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn bind(&self, endpoint: &Endpoint) -> Result<Box<dyn Acceptor>, SetupError> {
        let listener = TcpListener::bind(endpoint.as_str())
            .await
            .map_err(|source| SetupError::Bind {
                endpoint: endpoint.clone(),
                source,
            })?;
        let local = listener
            .local_addr()
            .map_err(|source| SetupError::Bind {
                endpoint: endpoint.clone(),
                source,
            })?;
        debug!("tcp transport bound to {local}");
        Ok(Box::new(TcpAcceptor {
            listener,
            local: Endpoint::new(local.to_string()),
        }))
    }

    async fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Box<dyn RawSession>, SetupError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint.as_str()))
            .await
            .map_err(|_| SetupError::ConnectTimeout {
                endpoint: endpoint.clone(),
            })?
            .map_err(|source| SetupError::Connect {
                endpoint: endpoint.clone(),
                source,
            })?;
        TcpSession::new(stream).map_err(|source| SetupError::Connect {
            endpoint: endpoint.clone(),
            source,
        })
    }
}

struct TcpAcceptor {
    listener: TcpListener,
    local: Endpoint,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> Result<Box<dyn RawSession>, TransportError> {
        let (stream, peer) = self.listener.accept().await?;
        debug!("accepted tcp session from {peer}");
        Ok(TcpSession::new(stream)?)
    }

    fn local_endpoint(&self) -> Endpoint {
        self.local.clone()
    }
}

struct TcpSession {
    stream: TcpStream,
    local: Endpoint,
    remote: Endpoint,
}

impl TcpSession {
    fn new(stream: TcpStream) -> std::io::Result<Box<dyn RawSession>> {
        let local = Endpoint::new(stream.local_addr()?.to_string());
        let remote = Endpoint::new(stream.peer_addr()?.to_string());
        Ok(Box::new(Self {
            stream,
            local,
            remote,
        }))
    }
}

impl RawSession for TcpSession {
    fn local_endpoint(&self) -> Endpoint {
        self.local.clone()
    }

    fn remote_endpoint(&self) -> Endpoint {
        self.remote.clone()
    }

    fn into_split(self: Box<Self>) -> (Box<dyn SessionReader>, Box<dyn SessionWriter>) {
        let (read, write) = self.stream.into_split();
        (
            Box::new(TcpSessionReader { read }),
            Box::new(TcpSessionWriter {
                write,
                shut: false,
            }),
        )
    }
}

struct TcpSessionReader {
    read: OwnedReadHalf,
}

#[async_trait]
impl SessionReader for TcpSessionReader {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        let mut buf = BytesMut::with_capacity(READ_BUF);
        let n = self.read.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(buf.freeze()))
    }
}

struct TcpSessionWriter {
    write: OwnedWriteHalf,
    shut: bool,
}

#[async_trait]
impl SessionWriter for TcpSessionWriter {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.shut {
            return Err(TransportError::Closed);
        }
        self.write.write_all(bytes).await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        if self.shut {
            return Ok(());
        }
        self.shut = true;
        // Peer may already be gone; shutdown failure is not interesting.
        let _ = self.write.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_connect_and_echo_bytes() {
        let transport = TcpTransport;
        let mut acceptor = transport
            .bind(&Endpoint::new("127.0.0.1:0"))
            .await
            .unwrap();
        let addr = acceptor.local_endpoint();

        let client = tokio::spawn(async move {
            let session = TcpTransport
                .connect(&addr, Duration::from_secs(5))
                .await
                .unwrap();
            let (mut rx, mut tx) = session.into_split();
            tx.send(b"ping").await.unwrap();
            let echoed = rx.recv().await.unwrap().unwrap();
            tx.shutdown().await.unwrap();
            echoed
        });

        let session = acceptor.accept().await.unwrap();
        let (mut rx, mut tx) = session.into_split();
        let got = rx.recv().await.unwrap().unwrap();
        tx.send(&got).await.unwrap();
        assert_eq!(&got[..], b"ping");

        assert_eq!(&client.await.unwrap()[..], b"ping");
        // After the client's shutdown the read side sees graceful close.
        assert!(rx.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn connect_to_dead_port_is_a_setup_error() {
        // Bind then immediately drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = Endpoint::new(listener.local_addr().unwrap().to_string());
        drop(listener);

        let err = TcpTransport
            .connect(&addr, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, SetupError::Connect { .. }));
    }
}
