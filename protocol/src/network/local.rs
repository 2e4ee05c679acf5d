//! # In-Process Transport
//!
//! Nodes in the same process talk through a shared [`LocalNetwork`]
//! registry. Sending a message is a bounded channel send straight into the
//! recipient's inbound queue; there is no serialization layer beyond the
//! bytes the server already produced.
//!
//! ```text
//!  LocalNetwork { addr → endpoint }
//!        │
//!   ┌────┴─────┐  connect   ┌──────────┐
//!   │ node A   │ ─────────▶ │ node B   │   both: links += other,
//!   │ inbound ◀┼────────────┼─ inbound │         PeerConnected(other)
//!   └──────────┘            └──────────┘
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::transport::{Inbound, NetAddr, Rpc, Transport, TransportError};
use crate::config::{LOCAL_QUEUE_CAPACITY, SEND_TIMEOUT};

/// One registered transport, as seen by the others.
#[derive(Debug)]
struct Endpoint {
    /// Sender side of the transport's inbound queue.
    inbound: mpsc::Sender<Inbound>,
    /// Connected peers and their inbound senders.
    links: DashMap<NetAddr, mpsc::Sender<Inbound>>,
}

/// Registry of in-process transports, keyed by address.
#[derive(Debug, Default)]
pub struct LocalNetwork {
    endpoints: DashMap<NetAddr, Arc<Endpoint>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new transport at `addr`.
    pub fn transport(
        self: &Arc<Self>,
        addr: impl Into<NetAddr>,
    ) -> Result<Arc<LocalTransport>, TransportError> {
        let addr = addr.into();
        let (tx, rx) = mpsc::channel(LOCAL_QUEUE_CAPACITY);
        let endpoint = Arc::new(Endpoint {
            inbound: tx,
            links: DashMap::new(),
        });

        match self.endpoints.entry(addr.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TransportError::AddrInUse(addr))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&endpoint));
            }
        }

        Ok(Arc::new(LocalTransport {
            addr,
            network: Arc::clone(self),
            endpoint,
            inbound: Mutex::new(Some(rx)),
        }))
    }

    fn lookup(&self, addr: &NetAddr) -> Option<Arc<Endpoint>> {
        self.endpoints.get(addr).map(|e| Arc::clone(e.value()))
    }

    /// Number of registered transports.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// A transport registered on a [`LocalNetwork`].
#[derive(Debug)]
pub struct LocalTransport {
    addr: NetAddr,
    network: Arc<LocalNetwork>,
    endpoint: Arc<Endpoint>,
    /// Handed out by `consume`.
    inbound: Mutex<Option<mpsc::Receiver<Inbound>>>,
}

async fn deliver(
    to: &NetAddr,
    sender: &mpsc::Sender<Inbound>,
    event: Inbound,
) -> Result<(), TransportError> {
    match tokio::time::timeout(SEND_TIMEOUT, sender.send(event)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(TransportError::Closed),
        Err(_) => Err(TransportError::Timeout(to.clone())),
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn consume(&self) -> Result<mpsc::Receiver<Inbound>, TransportError> {
        self.inbound.lock().take().ok_or(TransportError::AlreadyConsumed)
    }

    async fn connect(&self, addr: &NetAddr) -> Result<(), TransportError> {
        if *addr == self.addr || self.endpoint.links.contains_key(addr) {
            return Ok(());
        }
        let remote = self
            .network
            .lookup(addr)
            .ok_or_else(|| TransportError::PeerNotFound(addr.clone()))?;

        self.endpoint
            .links
            .insert(addr.clone(), remote.inbound.clone());
        remote
            .links
            .insert(self.addr.clone(), self.endpoint.inbound.clone());

        deliver(
            &self.addr,
            &self.endpoint.inbound,
            Inbound::PeerConnected(addr.clone()),
        )
        .await?;
        deliver(addr, &remote.inbound, Inbound::PeerConnected(self.addr.clone())).await?;

        debug!(local = %self.addr, remote = %addr, "local peers linked");
        Ok(())
    }

    async fn send_message(&self, to: &NetAddr, payload: Bytes) -> Result<(), TransportError> {
        if *to == self.addr {
            return Ok(());
        }
        let sender = self
            .endpoint
            .links
            .get(to)
            .map(|s| s.value().clone())
            .ok_or_else(|| TransportError::PeerNotFound(to.clone()))?;

        let rpc = Rpc {
            from: self.addr.clone(),
            payload,
        };
        deliver(to, &sender, Inbound::Message(rpc)).await
    }

    fn addr(&self) -> NetAddr {
        self.addr.clone()
    }

    fn peers(&self) -> Vec<NetAddr> {
        self.endpoint.links.iter().map(|e| e.key().clone()).collect()
    }

    async fn close(&self) {
        self.network.endpoints.remove(&self.addr);

        let peers: Vec<NetAddr> = self.peers();
        self.endpoint.links.clear();
        for peer in peers {
            if let Some(remote) = self.network.lookup(&peer) {
                remote.links.remove(&self.addr);
                // Best effort: a full or closed queue just misses the notice.
                let _ = remote
                    .inbound
                    .try_send(Inbound::PeerDisconnected(self.addr.clone()));
            }
        }
        debug!(addr = %self.addr, "local transport closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<LocalNetwork>, Arc<LocalTransport>, Arc<LocalTransport>) {
        let net = LocalNetwork::new();
        let a = net.transport("A").unwrap();
        let b = net.transport("B").unwrap();
        (net, a, b)
    }

    #[tokio::test]
    async fn connect_notifies_both_sides() {
        let (_net, a, b) = setup();
        let mut a_rx = a.consume().unwrap();
        let mut b_rx = b.consume().unwrap();

        a.connect(&b.addr()).await.unwrap();

        assert_eq!(a_rx.recv().await, Some(Inbound::PeerConnected("B".into())));
        assert_eq!(b_rx.recv().await, Some(Inbound::PeerConnected("A".into())));
        assert_eq!(a.peers(), vec![NetAddr::from("B")]);
        assert_eq!(b.peers(), vec![NetAddr::from("A")]);
    }

    #[tokio::test]
    async fn send_message_delivers_with_sender() {
        let (_net, a, b) = setup();
        let mut b_rx = b.consume().unwrap();
        a.connect(&b.addr()).await.unwrap();
        let _ = b_rx.recv().await; // PeerConnected

        a.send_message(&b.addr(), Bytes::from_static(b"hello"))
            .await
            .unwrap();

        match b_rx.recv().await {
            Some(Inbound::Message(rpc)) => {
                assert_eq!(rpc.from, NetAddr::from("A"));
                assert_eq!(rpc.payload, Bytes::from_static(b"hello"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_peer_is_not_found() {
        let (_net, a, _b) = setup();
        let err = a
            .send_message(&"C".into(), Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::PeerNotFound(addr) if addr.as_str() == "C"));
        assert!(matches!(
            a.connect(&"C".into()).await,
            Err(TransportError::PeerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn send_to_self_is_noop() {
        let (_net, a, _b) = setup();
        let mut rx = a.consume().unwrap();
        a.send_message(&a.addr(), Bytes::from_static(b"me"))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn consume_only_once() {
        let (_net, a, _b) = setup();
        assert!(a.consume().is_ok());
        assert!(matches!(a.consume(), Err(TransportError::AlreadyConsumed)));
    }

    #[tokio::test]
    async fn duplicate_address_rejected() {
        let (net, _a, _b) = setup();
        assert!(matches!(net.transport("A"), Err(TransportError::AddrInUse(_))));
        assert_eq!(net.len(), 2);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_peer() {
        let net = LocalNetwork::new();
        let hub = net.transport("hub").unwrap();
        let mut rxs = Vec::new();
        for name in ["x", "y", "z"] {
            let t = net.transport(name).unwrap();
            let mut rx = t.consume().unwrap();
            hub.connect(&t.addr()).await.unwrap();
            let _ = rx.recv().await;
            rxs.push((t, rx));
        }

        hub.broadcast(Bytes::from_static(b"all")).await;

        for (_t, rx) in rxs.iter_mut() {
            assert!(matches!(rx.recv().await, Some(Inbound::Message(rpc)) if rpc.payload == "all"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_times_out() {
        let (_net, a, b) = setup();
        let _b_rx = b.consume().unwrap(); // never drained
        a.connect(&b.addr()).await.unwrap();

        // One slot went to PeerConnected.
        for _ in 0..LOCAL_QUEUE_CAPACITY - 1 {
            a.send_message(&b.addr(), Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
        let err = a
            .send_message(&b.addr(), Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn close_notifies_peers_and_unregisters() {
        let (net, a, b) = setup();
        let mut b_rx = b.consume().unwrap();
        a.connect(&b.addr()).await.unwrap();
        let _ = b_rx.recv().await;

        a.close().await;

        assert_eq!(b_rx.recv().await, Some(Inbound::PeerDisconnected("A".into())));
        assert!(b.peers().is_empty());
        assert_eq!(net.len(), 1);
    }
}
