use std::net::SocketAddr;

use log::{debug, warn};

use crate::config::NetworkConfig;
use crate::endpoint::LossConditioner;
use crate::error::NetError;
use crate::events::SessionEvent;
use crate::message::{Message, MessageKind, MessagePool, PoolStats};
use crate::peer::{ClientPeer, ConnectionState, ServerPeer};
use crate::route::{MessageRouter, Outbox};

/// Owns both endpoint roles and drives them through the per-tick pump.
///
/// The client endpoint always exists; its socket is bound once at startup
/// and survives connect/disconnect cycles. The server endpoint is created
/// on demand and dropped on close. All processing happens inside `update`,
/// on the caller's thread.
pub struct ConnectionManager {
    config: NetworkConfig,
    clock: f64,
    client: ClientPeer,
    server: Option<ServerPeer>,
    client_pool: MessagePool,
    server_pool: MessagePool,
    events: Vec<SessionEvent>,
}

impl ConnectionManager {
    pub fn new(config: NetworkConfig) -> Result<Self, NetError> {
        let client = ClientPeer::new(&config)?;
        let client_pool = MessagePool::new(config.client_message_budget);
        let server_pool = MessagePool::new(config.server_message_budget);

        Ok(Self {
            config,
            clock: 0.0,
            client,
            server: None,
            client_pool,
            server_pool,
            events: Vec::new(),
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn clock(&self) -> f64 {
        self.clock
    }

    /// One network tick: pump, flush the outbound queues, pump again, then
    /// dispatch what arrived. The first pump moves handshake traffic and
    /// last tick's leftovers; flushing between pumps puts freshly queued
    /// messages on the wire this tick; the second pump picks up replies so
    /// handler latency stays bounded to one tick.
    pub fn update(&mut self, dt: f64, router: &mut MessageRouter) {
        self.clock += dt;
        let now = self.clock;

        self.pump(now);
        self.client.flush();
        if let Some(server) = &mut self.server {
            server.flush();
        }
        self.pump(now);
        self.dispatch(router);
    }

    fn pump(&mut self, now: f64) {
        self.client.send_phase(now, &mut self.client_pool);
        if let Some(server) = &mut self.server {
            server.send_phase(now, &mut self.server_pool);
        }
        self.client
            .receive_phase(now, &mut self.client_pool, &mut self.events);
        if let Some(server) = &mut self.server {
            server.receive_phase(now, &mut self.server_pool, &mut self.events);
        }
        self.client
            .advance(now, &mut self.client_pool, &mut self.events);
        if let Some(server) = &mut self.server {
            server.advance(now, &mut self.server_pool, &mut self.events);
        }
    }

    /// Runs every inbound message through the router, releasing it back to
    /// its pool afterwards, then turns staged handler replies into regular
    /// outbound messages.
    fn dispatch(&mut self, router: &mut MessageRouter) {
        let mut outbox = Outbox::default();

        while let Some(msg) = self.client.next_inbound() {
            if router.dispatch_client(&mut outbox, &msg) == 0 {
                debug!("no client handler for message kind {}", msg.kind.0);
            }
            self.client_pool.release(msg);
        }
        if let Some(server) = &mut self.server {
            while let Some((index, msg)) = server.next_inbound() {
                if router.dispatch_server(&mut outbox, index, &msg) == 0 {
                    debug!("no server handler for message kind {}", msg.kind.0);
                }
                self.server_pool.release(msg);
            }
        }

        let Outbox {
            to_server,
            to_clients,
        } = outbox;
        for staged in to_server {
            let mut msg = self.client_pool.acquire(staged.kind);
            msg.channel = staged.channel;
            msg.payload = staged.payload;
            self.client.enqueue(msg, &mut self.client_pool);
        }
        for (index, staged) in to_clients {
            let Some(server) = &mut self.server else {
                warn!("handler reply dropped, server is not running");
                continue;
            };
            let mut msg = self.server_pool.acquire(staged.kind);
            msg.channel = staged.channel;
            msg.payload = staged.payload;
            server.enqueue(index, msg, &mut self.server_pool);
        }
    }

    /// Starting a server that is already running is a warned no-op; callers
    /// watch `server_running` rather than an error return.
    pub fn create_server(&mut self, host: &str) -> Result<(), NetError> {
        if self.server.is_some() {
            warn!("server is already running, ignoring start request");
            return Ok(());
        }
        self.server = Some(ServerPeer::start(host, &self.config)?);
        Ok(())
    }

    pub fn close_server(&mut self) -> Result<(), NetError> {
        match self.server.take() {
            Some(mut server) => {
                server.close(&mut self.server_pool);
                Ok(())
            }
            None => Err(NetError::ServerNotRunning),
        }
    }

    pub fn connect(
        &mut self,
        addr: SocketAddr,
        on_started: Option<Box<dyn FnOnce(bool)>>,
    ) -> Result<(), NetError> {
        self.client.connect(addr, self.clock, on_started)
    }

    pub fn disconnect(&mut self) -> Result<(), NetError> {
        self.client.disconnect(&mut self.client_pool, &mut self.events)
    }

    pub fn create_client_message(&mut self, kind: MessageKind) -> Option<Message> {
        if self.client.state() != ConnectionState::Connected {
            warn!("cannot create message, client is not running");
            return None;
        }
        Some(self.client_pool.acquire(kind))
    }

    pub fn create_server_message(
        &mut self,
        client_index: usize,
        kind: MessageKind,
    ) -> Option<Message> {
        let Some(server) = &self.server else {
            warn!("cannot create message, server is not running");
            return None;
        };
        if !server.is_client_connected(client_index) {
            warn!("cannot create message, client index {client_index} is not connected");
            return None;
        }
        Some(self.server_pool.acquire(kind))
    }

    pub fn send_from_client(&mut self, msg: Message) {
        self.client.enqueue(msg, &mut self.client_pool);
    }

    pub fn send_to_client(&mut self, client_index: usize, msg: Message) {
        match &mut self.server {
            Some(server) => server.enqueue(client_index, msg, &mut self.server_pool),
            None => {
                warn!("cannot queue message, server is not running");
                self.server_pool.release(msg);
            }
        }
    }

    pub fn client_state(&self) -> ConnectionState {
        self.client.state()
    }

    pub fn local_client_connected(&self) -> bool {
        self.client.state() == ConnectionState::Connected
    }

    pub fn is_client_connected(&self, client_index: usize) -> bool {
        self.server
            .as_ref()
            .is_some_and(|server| server.is_client_connected(client_index))
    }

    pub fn server_running(&self) -> bool {
        self.server.is_some()
    }

    pub fn client_index(&self) -> Option<usize> {
        self.client.client_index()
    }

    pub fn max_clients(&self) -> usize {
        self.config.max_clients
    }

    pub fn connected_count(&self) -> usize {
        self.server
            .as_ref()
            .map_or(0, |server| server.connected_count())
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|server| server.local_addr())
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client.local_addr()
    }

    pub fn client_pool_stats(&self) -> PoolStats {
        self.client_pool.stats()
    }

    pub fn server_pool_stats(&self) -> PoolStats {
        self.server_pool.stats()
    }

    pub fn set_client_loss(&mut self, loss: f32) {
        self.client.set_conditioner(LossConditioner {
            enabled: loss > 0.0,
            loss,
        });
    }

    pub fn set_server_loss(&mut self, loss: f32) {
        if let Some(server) = &mut self.server {
            server.set_conditioner(LossConditioner {
                enabled: loss > 0.0,
                loss,
            });
        }
    }

    pub(crate) fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }
}
