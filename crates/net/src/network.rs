use std::hash::Hash;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::config::NetworkConfig;
use crate::error::NetError;
use crate::events::SessionEvent;
use crate::handle::{IdError, NetworkId, NetworkIdAllocator, SyncTimestamps};
use crate::manager::ConnectionManager;
use crate::message::{Message, MessageKind, PoolStats};
use crate::peer::ConnectionState;
use crate::route::{MessageRouter, Outbox};

/// Accepts `"host"` (paired with the configured server port) as well as an
/// explicit `"host:port"`.
fn resolve_server_addr(host: &str, port: u16) -> Result<SocketAddr, NetError> {
    if let Ok(mut addrs) = host.to_socket_addrs() {
        if let Some(addr) = addrs.next() {
            return Ok(addr);
        }
    }
    (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| NetError::InvalidAddress(host.to_string()))
}

/// The one object game logic talks to. Composes the connection manager,
/// the message router and the id allocator, and translates session events
/// into the registered notification callbacks.
///
/// `E` is the application's replicated-entity key, anything cheap to copy
/// and hashable. Everything here runs on the caller's thread; drive it by
/// calling [`NetworkManager::update`] once per tick.
pub struct NetworkManager<E: Copy + Eq + Hash = u64> {
    connections: ConnectionManager,
    router: MessageRouter,
    ids: NetworkIdAllocator<E>,
    on_connected: Vec<Box<dyn FnMut()>>,
    on_disconnected: Vec<Box<dyn FnMut()>>,
    on_client_connected: Vec<Box<dyn FnMut(usize)>>,
    on_client_disconnected: Vec<Box<dyn FnMut(usize)>>,
}

impl<E: Copy + Eq + Hash> NetworkManager<E> {
    /// Binds the client socket and sizes the message pools. Transport
    /// initialization failure here is fatal to the caller's startup.
    pub fn new(config: NetworkConfig) -> Result<Self, NetError> {
        Ok(Self {
            connections: ConnectionManager::new(config)?,
            router: MessageRouter::new(),
            ids: NetworkIdAllocator::new(),
            on_connected: Vec::new(),
            on_disconnected: Vec::new(),
            on_client_connected: Vec::new(),
            on_client_disconnected: Vec::new(),
        })
    }

    /// Drives one network tick and fires any notification callbacks for
    /// state transitions that happened during it.
    pub fn update(&mut self, dt: f64) {
        self.connections.update(dt, &mut self.router);

        for event in self.connections.drain_events() {
            match event {
                SessionEvent::ConnectedToServer => {
                    for callback in &mut self.on_connected {
                        callback();
                    }
                }
                SessionEvent::DisconnectedFromServer { .. } => {
                    for callback in &mut self.on_disconnected {
                        callback();
                    }
                }
                SessionEvent::ClientConnected { client_index } => {
                    for callback in &mut self.on_client_connected {
                        callback(client_index);
                    }
                }
                SessionEvent::ClientDisconnected { client_index, .. } => {
                    for callback in &mut self.on_client_disconnected {
                        callback(client_index);
                    }
                }
            }
        }
    }

    pub fn start_server(&mut self, host: &str) -> Result<(), NetError> {
        self.connections.create_server(host)
    }

    pub fn stop_server(&mut self) -> Result<(), NetError> {
        self.connections.close_server()
    }

    pub fn start_client(&mut self, host: &str) -> Result<(), NetError> {
        let addr = resolve_server_addr(host, self.connections.config().server_port)?;
        self.connections.connect(addr, None)
    }

    /// Like [`NetworkManager::start_client`], with a one-shot callback
    /// reporting whether the connect attempt succeeded.
    pub fn start_client_with<F>(&mut self, host: &str, on_started: F) -> Result<(), NetError>
    where
        F: FnOnce(bool) + 'static,
    {
        let addr = resolve_server_addr(host, self.connections.config().server_port)?;
        self.connections.connect(addr, Some(Box::new(on_started)))
    }

    pub fn stop_client(&mut self) -> Result<(), NetError> {
        self.connections.disconnect()
    }

    /// Server plus a local client connected to it, in one call.
    pub fn start_host(&mut self, host: &str) -> Result<(), NetError> {
        self.connections.create_server(host)?;
        let addr = self
            .connections
            .server_addr()
            .ok_or(NetError::ServerNotRunning)?;
        self.connections.connect(addr, None)
    }

    pub fn stop_host(&mut self) -> Result<(), NetError> {
        self.connections.disconnect()?;
        self.connections.close_server()
    }

    pub fn create_client_message(&mut self, kind: MessageKind) -> Option<Message> {
        self.connections.create_client_message(kind)
    }

    pub fn create_server_message(
        &mut self,
        client_index: usize,
        kind: MessageKind,
    ) -> Option<Message> {
        self.connections.create_server_message(client_index, kind)
    }

    pub fn send_from_client(&mut self, msg: Message) {
        self.connections.send_from_client(msg);
    }

    pub fn send_from_server(&mut self, client_index: usize, msg: Message) {
        self.connections.send_to_client(client_index, msg);
    }

    pub fn register_client_callback<F>(&mut self, kind: MessageKind, handler: F)
    where
        F: FnMut(&mut Outbox, &Message) + 'static,
    {
        self.router.register_client(kind, handler);
    }

    pub fn register_server_callback<F>(&mut self, kind: MessageKind, handler: F)
    where
        F: FnMut(&mut Outbox, usize, &Message) + 'static,
    {
        self.router.register_server(kind, handler);
    }

    pub fn on_connected_to_server<F: FnMut() + 'static>(&mut self, callback: F) {
        self.on_connected.push(Box::new(callback));
    }

    pub fn on_disconnected_from_server<F: FnMut() + 'static>(&mut self, callback: F) {
        self.on_disconnected.push(Box::new(callback));
    }

    pub fn on_client_connected<F: FnMut(usize) + 'static>(&mut self, callback: F) {
        self.on_client_connected.push(Box::new(callback));
    }

    pub fn on_client_disconnected<F: FnMut(usize) + 'static>(&mut self, callback: F) {
        self.on_client_disconnected.push(Box::new(callback));
    }

    /// Mints a fresh id for a server-side replicated entity. Only the
    /// server endpoint may mint; everyone else gets the id assigned.
    pub fn create_network_id(&mut self, entity: E) -> Result<NetworkId, IdError> {
        if !self.connections.server_running() {
            return Err(IdError::NotServer);
        }
        self.ids.register(entity)
    }

    /// Binds a server-issued id received over the wire.
    pub fn assign_network_id(&mut self, id: NetworkId, entity: E) -> Result<(), IdError> {
        self.ids.bind(id, entity)
    }

    /// Unbinds a destroyed entity and recycles its handle.
    pub fn remove_network_id(&mut self, entity: E) -> Result<NetworkId, IdError> {
        self.ids.release(entity)
    }

    pub fn network_entity(&self, id: NetworkId) -> Option<E> {
        self.ids.entity(id)
    }

    pub fn network_id(&self, entity: E) -> Option<NetworkId> {
        self.ids.id_of(entity)
    }

    pub fn sync_timestamps_mut(&mut self, id: NetworkId) -> Option<&mut SyncTimestamps> {
        self.ids.timestamps_mut(id)
    }

    pub fn local_client_is_connected(&self) -> bool {
        self.connections.local_client_connected()
    }

    pub fn client_is_connected(&self, client_index: usize) -> bool {
        self.connections.is_client_connected(client_index)
    }

    pub fn server_is_running(&self) -> bool {
        self.connections.server_running()
    }

    pub fn client_state(&self) -> ConnectionState {
        self.connections.client_state()
    }

    /// The slot index the server assigned to the local client, once
    /// connected.
    pub fn client_index(&self) -> Option<usize> {
        self.connections.client_index()
    }

    pub fn max_clients(&self) -> usize {
        self.connections.max_clients()
    }

    pub fn connected_count(&self) -> usize {
        self.connections.connected_count()
    }

    pub fn is_client(&self) -> bool {
        self.client_state() != ConnectionState::Disconnected && !self.server_is_running()
    }

    pub fn is_server(&self) -> bool {
        self.server_is_running() && self.client_state() == ConnectionState::Disconnected
    }

    pub fn is_host(&self) -> bool {
        self.server_is_running() && self.client_state() != ConnectionState::Disconnected
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.connections.server_addr()
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.connections.client_addr()
    }

    pub fn client_pool_stats(&self) -> PoolStats {
        self.connections.client_pool_stats()
    }

    pub fn server_pool_stats(&self) -> PoolStats {
        self.connections.server_pool_stats()
    }

    /// Simulated outgoing packet loss on the client socket, for tests.
    pub fn set_client_loss(&mut self, loss: f32) {
        self.connections.set_client_loss(loss);
    }

    /// Simulated outgoing packet loss on the server socket, for tests.
    pub fn set_server_loss(&mut self, loss: f32) {
        self.connections.set_server_loss(loss);
    }
}
