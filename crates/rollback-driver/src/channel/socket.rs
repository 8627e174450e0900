//! Point-to-point TCP transport.
//!
//! One listener per host. A client connects, writes a single frame
//! (u16 big-endian length followed by the token) and disconnects.

use async_trait::async_trait;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::timeout;

use rollback_common::constants::{
    MAX_FRAME_LEN, SOCKET_CONNECT_TIMEOUT_SECS, SOCKET_READ_TIMEOUT_SECS, thread_names,
};
use rollback_common::{ProtocolError, Signal, TransportError};

use super::listener::{ListenerHandle, spawn_listener};
use super::{ControlChannel, deliver};
use crate::config::SocketTarget;
use crate::registry::CoordinationRegistry;

const ACCEPT_BACKOFF_MS: u64 = 100;

/// Sends signals to the single listener at `host:port`
#[derive(Debug, Clone)]
pub struct PointToPointChannel {
    target: SocketTarget,
}

impl PointToPointChannel {
    pub fn new(target: SocketTarget) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &SocketTarget {
        &self.target
    }

    /// Accept signals on `port` on all interfaces
    pub fn start_listening(
        port: u16,
        registry: &Arc<CoordinationRegistry>,
    ) -> Result<ListenerHandle, TransportError> {
        let registry = Arc::downgrade(registry);
        spawn_listener(
            thread_names::SOCKET,
            move || {
                let listener = std::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))?;
                into_tokio(listener)
            },
            move |listener, shutdown| accept_loop(listener, registry, shutdown),
        )
    }

    /// Accept signals on an already bound listener
    pub fn start_listening_on(
        listener: std::net::TcpListener,
        registry: &Arc<CoordinationRegistry>,
    ) -> Result<ListenerHandle, TransportError> {
        let registry = Arc::downgrade(registry);
        spawn_listener(
            thread_names::SOCKET,
            move || into_tokio(listener),
            move |listener, shutdown| accept_loop(listener, registry, shutdown),
        )
    }
}

fn into_tokio(listener: std::net::TcpListener) -> io::Result<(TcpListener, SocketAddr)> {
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;
    Ok((TcpListener::from_std(listener)?, addr))
}

#[async_trait]
impl ControlChannel for PointToPointChannel {
    fn name(&self) -> &'static str {
        "point_to_point"
    }

    async fn send(&self, signal: Signal) -> Result<(), TransportError> {
        let addr = format!("{}:{}", self.target.host, self.target.port);
        let connect = TcpStream::connect((self.target.host.as_str(), self.target.port));

        let mut stream = match timeout(Duration::from_secs(SOCKET_CONNECT_TIMEOUT_SECS), connect).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(TransportError::Connect { addr, source }),
            Err(_) => return Err(TransportError::Timeout("connecting to signal listener")),
        };

        write_frame(&mut stream, signal.token().as_bytes()).await?;
        stream
            .shutdown()
            .await
            .map_err(|source| TransportError::Io {
                action: "closing signal connection",
                source,
            })?;

        tracing::debug!(signal = %signal, target = %addr, "Signal sent");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Weak<CoordinationRegistry>,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<(), TransportError> {
    // connections in flight; dropped (and aborted) with the loop
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => match classify_accept_error(&e) {
                        AcceptError::Connection => {
                            tracing::warn!(error = %e, "Failed to accept signal connection");
                            continue;
                        }
                        AcceptError::Exhausted => {
                            tracing::warn!(error = %e, "Out of file descriptors, backing off");
                            tokio::time::sleep(Duration::from_millis(ACCEPT_BACKOFF_MS)).await;
                            continue;
                        }
                        AcceptError::Fatal => {
                            return Err(TransportError::Io {
                                action: "accepting signal connection",
                                source: e,
                            });
                        }
                    },
                };

                if registry.strong_count() == 0 {
                    tracing::info!("Registry dropped, listener has nothing left to deliver to");
                    return Ok(());
                }
                connections.spawn(handle_connection(stream, peer, registry.clone()));
                while connections.try_join_next().is_some() {}
            }
            _ = &mut shutdown => return Ok(()),
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    registry: Weak<CoordinationRegistry>,
) {
    let read = timeout(
        Duration::from_secs(SOCKET_READ_TIMEOUT_SECS),
        read_signal(&mut stream),
    )
    .await;

    match read {
        Ok(Ok(signal)) => {
            deliver(&registry, signal, peer);
        }
        Ok(Err(e)) => {
            tracing::warn!(peer = %peer, error = %e, "Discarding malformed signal");
        }
        Err(_) => {
            tracing::warn!(peer = %peer, "Timed out waiting for signal frame");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptError {
    /// Only the pending connection is affected
    Connection,
    /// Descriptor limit reached; retry after a pause
    Exhausted,
    /// The listening socket itself is unusable
    Fatal,
}

fn classify_accept_error(e: &io::Error) -> AcceptError {
    // EMFILE / ENFILE
    if matches!(e.raw_os_error(), Some(23 | 24)) {
        return AcceptError::Exhausted;
    }
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => AcceptError::Connection,
        _ => AcceptError::Fatal,
    }
}

async fn read_signal<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Signal, TransportError> {
    let payload = read_frame(reader).await?;
    Ok(Signal::from_payload(&payload)?)
}

/// Write one length-prefixed frame
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), TransportError> {
    let len = u16::try_from(payload.len())
        .ok()
        .filter(|len| usize::from(*len) <= MAX_FRAME_LEN)
        .ok_or(ProtocolError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        })?;

    let write = async {
        writer.write_u16(len).await?;
        writer.write_all(payload).await?;
        writer.flush().await
    };
    write.await.map_err(|source| TransportError::Io {
        action: "writing signal frame",
        source,
    })
}

/// Read one length-prefixed frame
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, TransportError> {
    let len = reader
        .read_u16()
        .await
        .map_err(|e| read_error("reading frame header", e))?;
    let len = usize::from(len);
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        }
        .into());
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| read_error("reading frame payload", e))?;
    Ok(payload)
}

fn read_error(action: &'static str, source: io::Error) -> TransportError {
    if source.kind() == io::ErrorKind::UnexpectedEof {
        ProtocolError::Truncated.into()
    } else {
        TransportError::Io { action, source }
    }
}
