//! In-process telecontrol link
//!
//! This module provides the narrow `connect`/`listen` surface the device
//! layer consumes, backed by tokio channels instead of a TCP transport.
//! The external protocol engine owns framing and windowing; here a
//! [`LinkNetwork`] plays the role of its connection layer so controlling
//! and controlled endpoints can be wired together in one process.
//!
//! Each accepted connection gets its own request-dispatch task which
//! invokes the listener's [`ServerHandler`] callbacks and replies over
//! `oneshot` channels. A shared `watch` flag carries the closed state of a
//! connection, so every pending suspension (receive, interrogate, command)
//! resolves to [`LinkError::ConnectionClosed`] instead of hanging when
//! either side closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tracing::{debug, info};

use crate::error::LinkError;
use crate::types::{Address, Command, Data, FreezeCode, LinkOptions};

/// Buffer size for the per-connection data and request channels
const CHANNEL_BUFFER: usize = 64;

/// Callbacks a listening endpoint provides to the link
///
/// The link invokes these from the per-connection dispatch task; request
/// handlers run synchronously and return their result set directly.
pub trait ServerHandler: Send + Sync + 'static {
    /// A new connection was accepted
    fn on_connection(&self, conn: Connection);

    /// The peer requested a station interrogation
    fn on_interrogate(&self, asdu: u16) -> Vec<Data>;

    /// The peer requested a counter interrogation
    fn on_counter_interrogate(&self, asdu: u16, freeze: FreezeCode) -> Vec<Data>;

    /// The peer sent a command batch; returns overall success
    fn on_command(&self, commands: Vec<Command>) -> bool;
}

/// Requests flowing in the control direction (client -> server)
#[derive(Debug)]
enum PeerRequest {
    Interrogate {
        asdu: u16,
        reply: oneshot::Sender<Vec<Data>>,
    },
    CounterInterrogate {
        asdu: u16,
        freeze: FreezeCode,
        reply: oneshot::Sender<Vec<Data>>,
    },
    Command {
        commands: Vec<Command>,
        reply: oneshot::Sender<bool>,
    },
}

/// Metadata describing one side of a link connection
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    /// Process-unique connection id
    pub id: u64,
    /// Listener address this connection belongs to
    pub address: Address,
    /// Link parameters the connection was opened with
    pub options: LinkOptions,
}

/// One endpoint of an established link connection
///
/// Cloneable handle; all clones share the underlying channels and closed
/// flag. Closing any clone closes the connection for both sides.
#[derive(Debug, Clone)]
pub struct Connection {
    meta: ConnectionMeta,
    data_rx: Arc<AsyncMutex<mpsc::Receiver<Vec<Data>>>>,
    data_tx: mpsc::Sender<Vec<Data>>,
    request_tx: mpsc::Sender<PeerRequest>,
    closed: Arc<watch::Sender<bool>>,
}

impl Connection {
    /// Build a cross-wired connection pair
    ///
    /// Returns (controlling side, controlled side, request stream for the
    /// controlled side's dispatch task). Requests sent from the controlled
    /// side have no consumer and fail with `ConnectionClosed`.
    fn pair(
        id: u64,
        address: Address,
        options: LinkOptions,
    ) -> (Connection, Connection, mpsc::Receiver<PeerRequest>) {
        let (to_client_tx, to_client_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (to_server_tx, to_server_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (request_tx, request_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (idle_request_tx, _) = mpsc::channel(1);

        let (closed_tx, _) = watch::channel(false);
        let closed = Arc::new(closed_tx);

        let meta = ConnectionMeta {
            id,
            address,
            options,
        };

        let client = Connection {
            meta: meta.clone(),
            data_rx: Arc::new(AsyncMutex::new(to_client_rx)),
            data_tx: to_server_tx,
            request_tx,
            closed: closed.clone(),
        };
        let server = Connection {
            meta,
            data_rx: Arc::new(AsyncMutex::new(to_server_rx)),
            data_tx: to_client_tx,
            request_tx: idle_request_tx,
            closed,
        };
        (client, server, request_rx)
    }

    /// Metadata for this connection
    pub fn meta(&self) -> &ConnectionMeta {
        &self.meta
    }

    /// Whether the connection is still open
    pub fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Close the connection
    ///
    /// Idempotent; unblocks every pending receive/request on both sides.
    pub fn close(&self) {
        let was_closed = self.closed.send_replace(true);
        if !was_closed {
            debug!(id = self.meta.id, "link connection closed");
        }
    }

    /// Resolves once the connection is closed
    pub async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        wait_closed_flag(&mut closed).await;
    }

    /// Await the next pushed data batch
    ///
    /// Batches arrive in send order. Returns `ConnectionClosed` once the
    /// connection closes or the peer goes away.
    pub async fn receive(&self) -> Result<Vec<Data>, LinkError> {
        let mut closed = self.closed.subscribe();
        let mut rx = self.data_rx.lock().await;
        if *closed.borrow() {
            return Err(LinkError::ConnectionClosed);
        }
        tokio::select! {
            batch = rx.recv() => batch.ok_or(LinkError::ConnectionClosed),
            _ = wait_closed_flag(&mut closed) => Err(LinkError::ConnectionClosed),
        }
    }

    /// Send a station interrogation request and await the response set
    pub async fn interrogate(&self, asdu: u16) -> Result<Vec<Data>, LinkError> {
        let (reply, reply_rx) = oneshot::channel();
        self.round_trip(PeerRequest::Interrogate { asdu, reply }, reply_rx)
            .await
    }

    /// Send a counter interrogation request and await the response set
    pub async fn counter_interrogate(
        &self,
        asdu: u16,
        freeze: FreezeCode,
    ) -> Result<Vec<Data>, LinkError> {
        let (reply, reply_rx) = oneshot::channel();
        self.round_trip(
            PeerRequest::CounterInterrogate { asdu, freeze, reply },
            reply_rx,
        )
        .await
    }

    /// Send a command and await the peer's success result
    pub async fn send_command(&self, command: Command) -> Result<bool, LinkError> {
        let (reply, reply_rx) = oneshot::channel();
        self.round_trip(
            PeerRequest::Command {
                commands: vec![command],
                reply,
            },
            reply_rx,
        )
        .await
    }

    /// Push an unsolicited data change toward the peer
    pub async fn notify_data_change(&self, data: Vec<Data>) -> Result<(), LinkError> {
        if !self.is_open() {
            return Err(LinkError::ConnectionClosed);
        }
        self.data_tx
            .send(data)
            .await
            .map_err(|_| LinkError::ConnectionClosed)
    }

    fn closed_receiver(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    async fn round_trip<R>(
        &self,
        request: PeerRequest,
        reply_rx: oneshot::Receiver<R>,
    ) -> Result<R, LinkError> {
        if !self.is_open() {
            return Err(LinkError::ConnectionClosed);
        }
        self.request_tx
            .send(request)
            .await
            .map_err(|_| LinkError::ConnectionClosed)?;
        let mut closed = self.closed.subscribe();
        tokio::select! {
            reply = reply_rx => reply.map_err(|_| LinkError::ConnectionClosed),
            _ = wait_closed_flag(&mut closed) => Err(LinkError::ConnectionClosed),
        }
    }
}

/// An accepted connection handed to a listener's accept loop
#[derive(Debug)]
struct Accepted {
    conn: Connection,
    request_rx: mpsc::Receiver<PeerRequest>,
}

type ListenerMap = HashMap<Address, mpsc::Sender<Accepted>>;

/// In-process registry of listening endpoints
///
/// Stands in for the protocol engine's TCP layer: servers register under an
/// [`Address`], clients connect to it. Cloneable; clones share the registry.
#[derive(Debug, Clone, Default)]
pub struct LinkNetwork {
    listeners: Arc<Mutex<ListenerMap>>,
    next_conn_id: Arc<AtomicU64>,
}

impl LinkNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection to the listener at `address`
    pub async fn connect(
        &self,
        address: Address,
        options: LinkOptions,
    ) -> Result<Connection, LinkError> {
        let accept_tx = lock(&self.listeners)
            .get(&address)
            .cloned()
            .ok_or_else(|| LinkError::ConnectionRefused(address.clone()))?;

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (client, server_side, request_rx) =
            Connection::pair(id, address.clone(), options);

        accept_tx
            .send(Accepted {
                conn: server_side,
                request_rx,
            })
            .await
            .map_err(|_| LinkError::ConnectionRefused(address.clone()))?;

        debug!(id, address = %address, "link connection established");
        Ok(client)
    }

    /// Start listening at `address`
    ///
    /// `handler.on_connection` is invoked for every accepted connection;
    /// the three request callbacks serve interrogation and command requests
    /// from that connection's dispatch task.
    pub fn listen(
        &self,
        address: Address,
        handler: Arc<dyn ServerHandler>,
        options: LinkOptions,
    ) -> Result<Server, LinkError> {
        let mut accept_rx = {
            let mut listeners = lock(&self.listeners);
            if listeners.contains_key(&address) {
                return Err(LinkError::AddressInUse(address));
            }
            let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
            listeners.insert(address.clone(), tx);
            rx
        };

        let (closed_tx, _) = watch::channel(false);
        let connections = Arc::new(Mutex::new(Vec::new()));

        let inner = Arc::new(ServerInner {
            address: address.clone(),
            options,
            registry: Arc::downgrade(&self.listeners),
            connections: connections.clone(),
            closed: closed_tx,
        });

        let mut closed = inner.closed.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = accept_rx.recv() => {
                        let Some(Accepted { conn, request_rx }) = accepted else {
                            break;
                        };
                        info!(
                            id = conn.meta().id,
                            address = %address,
                            "link connection accepted"
                        );
                        lock(&connections).push(conn.clone());
                        handler.on_connection(conn.clone());

                        let handler = handler.clone();
                        let connections = connections.clone();
                        tokio::spawn(async move {
                            let id = conn.meta().id;
                            dispatch_requests(conn, request_rx, handler).await;
                            lock(&connections).retain(|c| c.meta().id != id);
                        });
                    }
                    _ = wait_closed_flag(&mut closed) => break,
                }
            }
            debug!(address = %address, "accept loop ended");
        });

        Ok(Server { inner })
    }
}

/// Serve requests from one accepted connection until it closes
async fn dispatch_requests(
    conn: Connection,
    mut request_rx: mpsc::Receiver<PeerRequest>,
    handler: Arc<dyn ServerHandler>,
) {
    let mut closed = conn.closed_receiver();
    loop {
        tokio::select! {
            request = request_rx.recv() => {
                // The peer dropping its side of the connection ends the
                // request stream; treat it like a close.
                let Some(request) = request else { break };
                match request {
                    PeerRequest::Interrogate { asdu, reply } => {
                        let _ = reply.send(handler.on_interrogate(asdu));
                    }
                    PeerRequest::CounterInterrogate { asdu, freeze, reply } => {
                        let _ = reply.send(handler.on_counter_interrogate(asdu, freeze));
                    }
                    PeerRequest::Command { commands, reply } => {
                        let _ = reply.send(handler.on_command(commands));
                    }
                }
            }
            _ = wait_closed_flag(&mut closed) => break,
        }
    }
    conn.close();
}

#[derive(Debug)]
struct ServerInner {
    address: Address,
    #[allow(dead_code)]
    options: LinkOptions,
    registry: Weak<Mutex<ListenerMap>>,
    connections: Arc<Mutex<Vec<Connection>>>,
    closed: watch::Sender<bool>,
}

impl ServerInner {
    fn close(&self) {
        let was_closed = self.closed.send_replace(true);
        if was_closed {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).remove(&self.address);
        }
        let connections = std::mem::take(&mut *lock(&self.connections));
        for conn in &connections {
            conn.close();
        }
        info!(address = %self.address, "link server closed");
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handle to a listening link endpoint
///
/// Cloneable; the listener stops accepting and closes every live connection
/// on [`Server::close`] or when the last handle drops.
#[derive(Debug, Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Address this server listens at
    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    /// Whether the server still accepts connections
    pub fn is_open(&self) -> bool {
        !*self.inner.closed.borrow()
    }

    /// Number of currently live accepted connections
    pub fn connection_count(&self) -> usize {
        lock(&self.inner.connections).len()
    }

    /// Stop accepting and close every live connection (idempotent)
    pub fn close(&self) {
        self.inner.close();
    }

    /// Resolves once the server is closed
    pub async fn wait_closed(&self) {
        let mut closed = self.inner.closed.subscribe();
        wait_closed_flag(&mut closed).await;
    }
}

/// Wait until the closed flag becomes true
///
/// A dropped sender also counts as closed.
async fn wait_closed_flag(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
