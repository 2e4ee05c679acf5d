//! # TCP Transport
//!
//! Length-framed messages over TCP.
//!
//! ## Framing
//!
//! ```text
//! ┌──────────────────┬───────────────────────────┐
//! │ length: u32 (BE) │ payload: `length` bytes    │
//! └──────────────────┴───────────────────────────┘
//! ```
//!
//! Frames larger than [`MAX_FRAME_SIZE`] are refused on both sides; a peer
//! announcing one is disconnected before any buffer is allocated.
//!
//! ## Tasks
//!
//! ```text
//! accept loop ──┐
//!               ├─ per connection: reader task ──▶ bounded inbound queue
//! connect() ────┘                  writer task ◀── bounded outbound queue
//! ```
//!
//! Each task owns its half of the socket and watches the shutdown channel.
//! `close()` flips the channel and aborts every handle, so no task outlives
//! the transport. A reader that hits EOF or an I/O error removes its peer
//! and reports `PeerDisconnected`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::transport::{Inbound, NetAddr, Rpc, Transport, TransportError};
use crate::config::{
    DIAL_TIMEOUT, INBOUND_QUEUE_CAPACITY, MAX_FRAME_SIZE, PEER_OUTBOUND_CAPACITY, SEND_TIMEOUT,
};

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(TransportError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. `Ok(None)` on a clean EOF at a frame
/// boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: len as usize,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Some(Bytes::from(buf)))
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// A live connection.
struct Peer {
    outbound: mpsc::Sender<Bytes>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct Shared {
    addr: NetAddr,
    inbound: mpsc::Sender<Inbound>,
    peers: DashMap<NetAddr, Peer>,
    shutdown: watch::Receiver<bool>,
}

impl Shared {
    /// Spawn reader and writer tasks for `stream` and register the peer.
    async fn register(self: &Arc<Self>, stream: TcpStream, addr: NetAddr) {
        let _ = stream.set_nodelay(true);
        let (mut read_half, mut write_half) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(PEER_OUTBOUND_CAPACITY);
        // The reader starts once the peer is registered and announced.
        let (ready_tx, ready_rx) = oneshot::channel::<()>();

        let reader = {
            let shared = Arc::clone(self);
            let addr = addr.clone();
            let mut shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                if ready_rx.await.is_err() {
                    return;
                }
                loop {
                    tokio::select! {
                        frame = read_frame(&mut read_half) => match frame {
                            Ok(Some(payload)) => {
                                let rpc = Rpc { from: addr.clone(), payload };
                                if shared.inbound.send(Inbound::Message(rpc)).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {
                                debug!(peer = %addr, "peer closed connection");
                                break;
                            }
                            Err(err) => {
                                warn!(peer = %addr, error = %err, "read failed");
                                break;
                            }
                        },
                        _ = shutdown.changed() => return,
                    }
                }
                shared.drop_peer(&addr);
            })
        };

        let writer = {
            let shared = Arc::clone(self);
            let addr = addr.clone();
            let mut shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        next = out_rx.recv() => {
                            let Some(payload) = next else { return };
                            if let Err(err) = write_frame(&mut write_half, &payload).await {
                                warn!(peer = %addr, error = %err, "write failed");
                                break;
                            }
                        }
                        _ = shutdown.changed() => return,
                    }
                }
                shared.drop_peer(&addr);
            })
        };

        self.peers.insert(
            addr.clone(),
            Peer {
                outbound: out_tx,
                reader,
                writer,
            },
        );

        if self
            .inbound
            .send(Inbound::PeerConnected(addr.clone()))
            .await
            .is_err()
        {
            debug!(peer = %addr, "inbound queue closed");
        }
        // PeerConnected is queued before any of the peer's messages.
        let _ = ready_tx.send(());
    }

    fn drop_peer(&self, addr: &NetAddr) {
        if let Some((_, peer)) = self.peers.remove(addr) {
            if self
                .inbound
                .try_send(Inbound::PeerDisconnected(addr.clone()))
                .is_err()
            {
                debug!(peer = %addr, "could not report disconnect");
            }
            peer.reader.abort();
            peer.writer.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// TcpTransport
// ---------------------------------------------------------------------------

/// A transport listening on a TCP socket.
pub struct TcpTransport {
    shared: Arc<Shared>,
    /// Handed out by `consume`.
    inbound: Mutex<Option<mpsc::Receiver<Inbound>>>,
    shutdown: watch::Sender<bool>,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Bind `addr` and start accepting connections. Port 0 picks a free
    /// port; [`addr`](Transport::addr) reports the one actually bound.
    pub async fn bind(addr: &str) -> Result<Arc<Self>, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local = NetAddr::new(listener.local_addr()?.to_string());

        let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            addr: local.clone(),
            inbound: in_tx,
            peers: DashMap::new(),
            shutdown: shutdown_rx,
        });

        let accept = {
            let shared = Arc::clone(&shared);
            let mut shutdown = shared.shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        accepted = listener.accept() => match accepted {
                            Ok((stream, remote)) => {
                                debug!(remote = %remote, "accepted connection");
                                shared.register(stream, NetAddr::new(remote.to_string())).await;
                            }
                            Err(err) => warn!(error = %err, "accept failed"),
                        },
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        info!(addr = %local, "tcp transport listening");
        Ok(Arc::new(Self {
            shared,
            inbound: Mutex::new(Some(in_rx)),
            shutdown: shutdown_tx,
            accept: Mutex::new(Some(accept)),
        }))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn consume(&self) -> Result<mpsc::Receiver<Inbound>, TransportError> {
        self.inbound.lock().take().ok_or(TransportError::AlreadyConsumed)
    }

    async fn connect(&self, addr: &NetAddr) -> Result<(), TransportError> {
        if *addr == self.shared.addr || self.shared.peers.contains_key(addr) {
            return Ok(());
        }
        if *self.shutdown.borrow() {
            return Err(TransportError::Closed);
        }
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| TransportError::Timeout(addr.clone()))??;
        debug!(remote = %addr, "dialed peer");
        self.shared.register(stream, addr.clone()).await;
        Ok(())
    }

    async fn send_message(&self, to: &NetAddr, payload: Bytes) -> Result<(), TransportError> {
        if *to == self.shared.addr {
            return Ok(());
        }
        if payload.len() > MAX_FRAME_SIZE as usize {
            return Err(TransportError::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        let outbound = self
            .shared
            .peers
            .get(to)
            .map(|p| p.outbound.clone())
            .ok_or_else(|| TransportError::PeerNotFound(to.clone()))?;

        match tokio::time::timeout(SEND_TIMEOUT, outbound.send(payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout(to.clone())),
        }
    }

    fn addr(&self) -> NetAddr {
        self.shared.addr.clone()
    }

    fn peers(&self) -> Vec<NetAddr> {
        self.shared.peers.iter().map(|p| p.key().clone()).collect()
    }

    async fn close(&self) {
        let _ = self.shutdown.send(true);
        if let Some(accept) = self.accept.lock().take() {
            accept.abort();
        }
        let addrs: Vec<NetAddr> = self.peers();
        for addr in addrs {
            if let Some((_, peer)) = self.shared.peers.remove(&addr) {
                peer.reader.abort();
                peer.writer.abort();
            }
        }
        info!(addr = %self.shared.addr, "tcp transport closed");
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("addr", &self.shared.addr)
            .field("peers", &self.shared.peers.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
