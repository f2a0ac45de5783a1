//! KCP endpoint: one transport shared by many conversations.
//!
//! A single receive task reads datagrams from the transport and routes them
//! by conversation id (the first four bytes of every datagram) to the actor
//! that owns the matching engine. Conversations are created explicitly with
//! [`KcpEndpoint::open`] or, for a datagram carrying an unknown id, on first
//! use; the latter surface through [`KcpEndpoint::accept`].

use crate::actor::{run_engine_actor, ActorSettings, EngineCmd, EngineHandle};
use crate::config::KcpConfig;
use crate::error::{ConnectionError, KcpError, Result};
use crate::metrics::global_metrics;
use crate::transport::{Transport, UdpTransport};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use ukcp_core::{peek_conv, ConvId, KcpEngine, KcpHeader, KcpStats, SegmentIter};

/// Lock-free route for datagram delivery: just a channel sender.
struct Route {
    input_tx: mpsc::Sender<Bytes>,
}

type RouteTable = Arc<DashMap<ConvId, Route>>;

/// One conversation on an endpoint.
///
/// Dropping the session closes the conversation.
pub struct KcpSession<T: Transport = UdpTransport> {
    conv: ConvId,
    peer_addr: T::Addr,
    handle: EngineHandle,
    data_rx: mpsc::Receiver<Bytes>,
}

impl<T: Transport> KcpSession<T> {
    pub fn conv(&self) -> ConvId {
        self.conv
    }

    pub fn peer_addr(&self) -> &T::Addr {
        &self.peer_addr
    }

    /// Queue one message. It is split into segments and sent reliably.
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        self.handle.send(data.into()).await
    }

    /// Wait for the next complete message.
    pub async fn recv(&mut self) -> Result<Bytes> {
        self.data_rx
            .recv()
            .await
            .ok_or_else(|| KcpError::connection(ConnectionError::Closed))
    }

    /// Like [`recv`](Self::recv), giving up after `timeout`.
    pub async fn recv_timeout(&mut self, timeout: std::time::Duration) -> Result<Bytes> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| KcpError::timeout(timeout.as_millis() as u64))?
    }

    /// Force an immediate flush of pending ACKs and data.
    pub async fn flush(&self) -> Result<()> {
        self.handle.flush().await
    }

    pub async fn stats(&self) -> Result<KcpStats> {
        self.handle.stats().await
    }

    /// False once the link is declared dead or the conversation has closed.
    pub async fn is_alive(&self) -> bool {
        self.handle.is_alive().await
    }

    /// Close the conversation; its engine is released by the actor.
    pub fn close(&self) {
        self.handle.close();
    }
}

impl<T: Transport> Drop for KcpSession<T> {
    fn drop(&mut self) {
        self.handle.close();
    }
}

impl<T: Transport> std::fmt::Debug for KcpSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KcpSession")
            .field("conv", &self.conv)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

/// Endpoint multiplexing conversations over one transport.
pub struct KcpEndpoint<T: Transport = UdpTransport> {
    transport: Arc<T>,
    config: KcpConfig,
    local_addr: T::Addr,
    routes: RouteTable,
    incoming: mpsc::Receiver<KcpSession<T>>,
    recv_task: Option<tokio::task::JoinHandle<()>>,
}

// --- UDP-specific convenience methods ---

impl KcpEndpoint<UdpTransport> {
    /// Bind a UDP endpoint to the specified address
    pub async fn bind(addr: SocketAddr, config: KcpConfig) -> Result<Self> {
        let transport = UdpTransport::bind(addr).await.map_err(KcpError::Io)?;
        Self::with_transport(Arc::new(transport), config)
    }
}

// --- Generic methods for any Transport ---

impl<T: Transport> KcpEndpoint<T> {
    /// Create an endpoint over a custom [`Transport`] and start its receive task.
    pub fn with_transport(transport: Arc<T>, config: KcpConfig) -> Result<Self> {
        config.validate()?;
        let local_addr = transport.local_addr().map_err(KcpError::Io)?;
        let routes: RouteTable = Arc::new(DashMap::new());
        let (incoming_tx, incoming) = mpsc::channel(config.accept_backlog);

        let recv_task = tokio::spawn(Self::receive_loop(
            transport.clone(),
            routes.clone(),
            config.clone(),
            incoming_tx,
        ));

        info!(addr = %local_addr, "KCP endpoint started");

        Ok(Self {
            transport,
            config,
            local_addr,
            routes,
            incoming,
            recv_task: Some(recv_task),
        })
    }

    /// Start a conversation with `peer` using an id both sides agreed on.
    pub fn open(&self, conv: ConvId, peer: T::Addr) -> Result<KcpSession<T>> {
        let (session, _) = spawn_session(&self.transport, &self.routes, &self.config, conv, peer)?;
        Ok(session)
    }

    /// Wait for a conversation created by an unknown conv id arriving.
    pub async fn accept(&mut self) -> Result<KcpSession<T>> {
        self.incoming
            .recv()
            .await
            .ok_or_else(|| KcpError::connection(ConnectionError::Closed))
    }

    pub fn local_addr(&self) -> &T::Addr {
        &self.local_addr
    }

    /// Number of conversations currently routed
    pub fn conversation_count(&self) -> usize {
        self.routes.len()
    }

    /// Stop receiving; live sessions stop when their input channel closes.
    pub fn close(&mut self) {
        if let Some(task) = self.recv_task.take() {
            task.abort();
            info!(addr = %self.local_addr, "KCP endpoint closed");
        }
        self.routes.clear();
    }

    async fn receive_loop(
        transport: Arc<T>,
        routes: RouteTable,
        config: KcpConfig,
        incoming_tx: mpsc::Sender<KcpSession<T>>,
    ) {
        let mut buf = vec![0u8; 65536];

        loop {
            let (size, peer_addr) = match transport.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                    trace!(error = %e, "Ignoring ICMP reset");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Transport receive failed, stopping endpoint");
                    break;
                }
            };

            let datagram = &buf[..size];
            let Some(conv) = peek_conv(datagram) else {
                global_metrics().datagram_dropped();
                continue;
            };
            let data = Bytes::copy_from_slice(datagram);

            // Known conversation (lock-free lookup)
            if let Some(route) = routes.get(&conv) {
                if route.input_tx.try_send(data).is_err() {
                    global_metrics().datagram_dropped();
                    trace!(conv = %conv, "Input queue full, datagram dropped");
                }
                continue;
            }

            // Unknown conversation: only well-formed datagrams may create one
            if size < KcpHeader::SIZE || SegmentIter::new(&data).any(|s| s.is_err()) {
                global_metrics().datagram_dropped();
                trace!(conv = %conv, peer = %peer_addr, "Dropping malformed datagram");
                continue;
            }

            if incoming_tx.capacity() == 0 {
                global_metrics().datagram_dropped();
                warn!(conv = %conv, "Accept backlog full, ignoring new conversation");
                continue;
            }

            match spawn_session(&transport, &routes, &config, conv, peer_addr.clone()) {
                Ok((session, input_tx)) => {
                    debug!(conv = %conv, peer = %peer_addr, "Conversation created on first datagram");
                    let _ = input_tx.try_send(data);
                    if incoming_tx.try_send(session).is_err() {
                        // endpoint dropped; the session closes itself
                        break;
                    }
                }
                Err(e) => warn!(conv = %conv, error = %e, "Failed to create conversation"),
            }
        }
    }
}

impl<T: Transport> Drop for KcpEndpoint<T> {
    fn drop(&mut self) {
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
    }
}

/// Create the engine, register its route, and spawn its actor.
fn spawn_session<T: Transport>(
    transport: &Arc<T>,
    routes: &RouteTable,
    config: &KcpConfig,
    conv: ConvId,
    peer_addr: T::Addr,
) -> Result<(KcpSession<T>, mpsc::Sender<Bytes>)> {
    let engine = KcpEngine::new(conv, config.core())?;

    let capacity = config.channel_capacity;
    let (cmd_tx, cmd_rx) = mpsc::channel::<EngineCmd>(capacity);
    let (input_tx, input_rx) = mpsc::channel(capacity);
    let (data_tx, data_rx) = mpsc::channel(capacity);

    match routes.entry(conv) {
        Entry::Occupied(_) => return Err(KcpError::connection(ConnectionError::InvalidConv)),
        Entry::Vacant(slot) => {
            slot.insert(Route {
                input_tx: input_tx.clone(),
            });
        }
    }
    global_metrics().conversation_opened();
    info!(conv = %conv, peer = %peer_addr, "Conversation opened");

    let settings = ActorSettings {
        keep_alive: config.keep_alive,
        idle_timeout: config.idle_timeout,
    };
    let actor_routes = routes.clone();
    let actor_peer = peer_addr.clone();
    let actor_transport = transport.clone();
    tokio::spawn(async move {
        run_engine_actor(
            engine,
            cmd_rx,
            input_rx,
            data_tx,
            actor_transport,
            actor_peer,
            settings,
        )
        .await;
        // the actor's input receiver is gone; drop the stale route unless a
        // new conversation already took the id
        actor_routes.remove_if(&conv, |_, route| route.input_tx.is_closed());
    });

    let session = KcpSession {
        conv,
        peer_addr,
        handle: EngineHandle::new(cmd_tx),
        data_rx,
    };
    Ok((session, input_tx))
}
