use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use log::{debug, info, warn};

use crate::channel::{ReliableReceiver, ReliableSender, UnreliableSender};
use crate::config::NetworkConfig;
use crate::endpoint::UdpEndpoint;
use crate::error::NetError;
use crate::events::{DisconnectReason, SessionEvent};
use crate::message::{ChannelKind, Message, MessageKind, MessagePool};
use crate::protocol::{Frame, WireMessage, MAX_MESSAGE_SIZE, MAX_PACKET_SIZE};
use crate::ring::RingBuffer;

/// Externally visible connection lifecycle. The handshake sub-steps inside
/// `Connecting` are not observable from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakePhase {
    Idle,
    AwaitingChallenge,
    AwaitingAccept,
}

const FRAME_BUDGET: usize = MAX_PACKET_SIZE - 128;
const MESSAGE_OVERHEAD: usize = 32;

fn random_key(len: usize) -> Vec<u8> {
    (0..len).map(|_| fastrand::u8(..)).collect()
}

fn xor_keys(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

/// Splits a batch into frame-sized chunks so no packet outgrows the MTU.
fn chunk_by_size<T>(items: Vec<T>, payload_len: impl Fn(&T) -> usize) -> Vec<Vec<T>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut used = 0usize;

    for item in items {
        let cost = payload_len(&item) + MESSAGE_OVERHEAD;
        if !current.is_empty() && used + cost > FRAME_BUDGET {
            chunks.push(std::mem::take(&mut current));
            used = 0;
        }
        used += cost;
        current.push(item);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn pooled_from_wire(pool: &mut MessagePool, wire: WireMessage, channel: ChannelKind) -> Message {
    let mut msg = pool.acquire(MessageKind(wire.kind));
    msg.channel = channel;
    msg.payload.extend_from_slice(&wire.payload);
    msg
}

/// The client role: one socket, one server, one outbound queue. Driven by
/// the pump in three phases mirroring the update order of the session
/// manager: send, receive, advance.
pub struct ClientPeer {
    endpoint: UdpEndpoint,
    config: NetworkConfig,
    state: ConnectionState,
    phase: HandshakePhase,
    server_addr: Option<SocketAddr>,
    client_id: u64,
    client_key: Vec<u8>,
    proof: Vec<u8>,
    client_index: Option<usize>,
    outbound: RingBuffer<Message>,
    reliable_tx: ReliableSender,
    reliable_rx: ReliableReceiver,
    unreliable_tx: UnreliableSender,
    inbound: VecDeque<Message>,
    connect_deadline: Option<f64>,
    last_handshake_send: f64,
    last_send: f64,
    last_receive: f64,
    on_started: Option<Box<dyn FnOnce(bool)>>,
}

impl ClientPeer {
    pub fn new(config: &NetworkConfig) -> Result<Self, NetError> {
        let endpoint = UdpEndpoint::bind(("0.0.0.0", config.client_port))?;

        Ok(Self {
            endpoint,
            config: config.clone(),
            state: ConnectionState::Disconnected,
            phase: HandshakePhase::Idle,
            server_addr: None,
            client_id: 0,
            client_key: Vec::new(),
            proof: Vec::new(),
            client_index: None,
            outbound: RingBuffer::new(config.client_queue_size),
            reliable_tx: ReliableSender::new(config.reliable_window, config.resend_interval),
            reliable_rx: ReliableReceiver::new(config.reliable_window),
            unreliable_tx: UnreliableSender::new(config.client_queue_size),
            inbound: VecDeque::new(),
            connect_deadline: None,
            last_handshake_send: 0.0,
            last_send: 0.0,
            last_receive: 0.0,
            on_started: None,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn client_index(&self) -> Option<usize> {
        self.client_index
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn set_conditioner(&mut self, conditioner: crate::endpoint::LossConditioner) {
        self.endpoint.set_conditioner(conditioner);
    }

    pub fn connect(
        &mut self,
        addr: SocketAddr,
        now: f64,
        on_started: Option<Box<dyn FnOnce(bool)>>,
    ) -> Result<(), NetError> {
        if self.state != ConnectionState::Disconnected {
            return Err(NetError::ClientAlreadyActive);
        }

        self.client_id = fastrand::u64(..);
        self.client_key = random_key(self.config.key_bytes);
        self.proof.clear();
        self.server_addr = Some(addr);
        self.state = ConnectionState::Connecting;
        self.phase = HandshakePhase::AwaitingChallenge;
        self.connect_deadline = Some(now + self.config.timeout);
        self.last_receive = now;
        self.on_started = on_started;

        info!("connecting to {addr}");
        let frame = Frame::ConnectionRequest {
            client_id: self.client_id,
            key: self.client_key.clone(),
        };
        if let Err(e) = self.endpoint.send_to(frame, addr) {
            warn!("connection request failed to send: {e}");
        }
        self.last_handshake_send = now;
        self.last_send = now;

        Ok(())
    }

    /// Graceful stop. Stopping mid-handshake is refused; stopping an
    /// already stopped client is a quiet no-op.
    pub fn disconnect(
        &mut self,
        pool: &mut MessagePool,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), NetError> {
        match self.state {
            ConnectionState::Connected => {
                if let Some(addr) = self.server_addr {
                    if let Err(e) = self.endpoint.send_to(Frame::Disconnect, addr) {
                        debug!("disconnect notice failed to send: {e}");
                    }
                }
                self.reset(pool);
                events.push(SessionEvent::DisconnectedFromServer {
                    reason: DisconnectReason::Graceful,
                });
                info!("disconnected from server");
                Ok(())
            }
            ConnectionState::Connecting => Err(NetError::ClientNotConnected),
            ConnectionState::Disconnected => Ok(()),
        }
    }

    /// Queues a message for the server. Running means Connected; a client
    /// mid-handshake refuses just like a stopped one. Refusals release the
    /// message back to the pool; a full queue evicts and releases its
    /// oldest entry.
    pub fn enqueue(&mut self, msg: Message, pool: &mut MessagePool) {
        if self.state != ConnectionState::Connected {
            warn!("cannot queue message, client is not running");
            pool.release(msg);
            return;
        }
        if msg.payload.len() > MAX_MESSAGE_SIZE {
            warn!(
                "dropping {} byte message, limit is {MAX_MESSAGE_SIZE}",
                msg.payload.len()
            );
            pool.release(msg);
            return;
        }
        if let Some(evicted) = self.outbound.push(msg) {
            pool.release(evicted);
        }
    }

    /// Drains the outbound queue into the channels in strict FIFO order,
    /// stopping as soon as the head message's channel has no capacity.
    pub fn flush(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        while let Some(head) = self.outbound.peek() {
            let ready = match head.channel {
                ChannelKind::ReliableOrdered => self.reliable_tx.can_send(),
                ChannelKind::UnreliableUnordered => self.unreliable_tx.can_send(),
            };
            if !ready {
                break;
            }
            if let Some(msg) = self.outbound.pop() {
                match msg.channel {
                    ChannelKind::ReliableOrdered => {
                        self.reliable_tx.send(msg);
                    }
                    ChannelKind::UnreliableUnordered => self.unreliable_tx.stage(msg),
                }
            }
        }
    }

    pub fn send_phase(&mut self, now: f64, pool: &mut MessagePool) {
        match self.state {
            ConnectionState::Disconnected => {}
            ConnectionState::Connecting => {
                if now - self.last_handshake_send < self.config.handshake_resend_interval {
                    return;
                }
                let Some(addr) = self.server_addr else { return };
                let frame = match self.phase {
                    HandshakePhase::AwaitingChallenge => Frame::ConnectionRequest {
                        client_id: self.client_id,
                        key: self.client_key.clone(),
                    },
                    HandshakePhase::AwaitingAccept => Frame::ChallengeResponse {
                        proof: self.proof.clone(),
                    },
                    HandshakePhase::Idle => return,
                };
                if let Err(e) = self.endpoint.send_to(frame, addr) {
                    warn!("handshake resend failed: {e}");
                }
                self.last_handshake_send = now;
                self.last_send = now;
            }
            ConnectionState::Connected => {
                let Some(addr) = self.server_addr else { return };

                let due = self.reliable_tx.collect_due(now);
                if !due.is_empty() {
                    for chunk in chunk_by_size(due, |m| m.message.payload.len()) {
                        if let Err(e) =
                            self.endpoint.send_to(Frame::Reliable { messages: chunk }, addr)
                        {
                            warn!("reliable send failed: {e}");
                        }
                    }
                    self.last_send = now;
                }

                let staged = self.unreliable_tx.take();
                if !staged.is_empty() {
                    let mut wires = Vec::with_capacity(staged.len());
                    for mut msg in staged {
                        wires.push(WireMessage {
                            kind: msg.kind.0,
                            payload: std::mem::take(&mut msg.payload),
                        });
                        pool.release(msg);
                    }
                    for chunk in chunk_by_size(wires, |w| w.payload.len()) {
                        if let Err(e) = self
                            .endpoint
                            .send_to(Frame::Unreliable { messages: chunk }, addr)
                        {
                            warn!("unreliable send failed: {e}");
                        }
                    }
                    self.last_send = now;
                }

                if now - self.last_send >= self.config.keepalive_interval {
                    if let Err(e) = self.endpoint.send_to(Frame::KeepAlive, addr) {
                        debug!("keepalive failed to send: {e}");
                    }
                    self.last_send = now;
                }
            }
        }
    }

    pub fn receive_phase(
        &mut self,
        now: f64,
        pool: &mut MessagePool,
        events: &mut Vec<SessionEvent>,
    ) {
        let frames = match self.endpoint.receive() {
            Ok(frames) => frames,
            Err(e) => {
                warn!("client receive failed: {e}");
                return;
            }
        };

        for (frame, addr) in frames {
            if self.server_addr != Some(addr) {
                continue;
            }
            self.last_receive = now;

            match frame {
                Frame::Challenge { key } => {
                    if self.state != ConnectionState::Connecting
                        || self.phase != HandshakePhase::AwaitingChallenge
                    {
                        continue;
                    }
                    debug!("received challenge from {addr}");
                    self.proof = xor_keys(&self.client_key, &key);
                    self.phase = HandshakePhase::AwaitingAccept;
                    let response = Frame::ChallengeResponse {
                        proof: self.proof.clone(),
                    };
                    if let Err(e) = self.endpoint.send_to(response, addr) {
                        warn!("challenge response failed to send: {e}");
                    }
                    self.last_handshake_send = now;
                    self.last_send = now;
                }
                Frame::Accepted { client_index } => {
                    if self.state != ConnectionState::Connecting {
                        continue;
                    }
                    self.state = ConnectionState::Connected;
                    self.phase = HandshakePhase::Idle;
                    self.client_index = Some(client_index as usize);
                    self.connect_deadline = None;
                    info!("connected to server as client {client_index}");
                    events.push(SessionEvent::ConnectedToServer);
                    if let Some(callback) = self.on_started.take() {
                        callback(true);
                    }
                }
                Frame::Denied { reason } => {
                    if self.state != ConnectionState::Connecting {
                        continue;
                    }
                    warn!("connection denied: {reason}");
                    if let Some(callback) = self.on_started.take() {
                        callback(false);
                    }
                    self.reset(pool);
                }
                Frame::Disconnect => {
                    if self.state != ConnectionState::Connected {
                        continue;
                    }
                    info!("server closed the connection");
                    self.reset(pool);
                    events.push(SessionEvent::DisconnectedFromServer {
                        reason: DisconnectReason::Remote,
                    });
                }
                Frame::KeepAlive => {}
                Frame::Unreliable { messages } => {
                    if self.state != ConnectionState::Connected {
                        continue;
                    }
                    for wire in messages {
                        self.inbound.push_back(pooled_from_wire(
                            pool,
                            wire,
                            ChannelKind::UnreliableUnordered,
                        ));
                    }
                }
                Frame::Reliable { messages } => {
                    if self.state != ConnectionState::Connected {
                        continue;
                    }
                    let delivered = self.reliable_rx.ingest(messages);
                    let cumulative = self.reliable_rx.cumulative_ack();
                    for wire in delivered {
                        self.inbound.push_back(pooled_from_wire(
                            pool,
                            wire,
                            ChannelKind::ReliableOrdered,
                        ));
                    }
                    if let Err(e) = self.endpoint.send_to(Frame::Ack { cumulative }, addr) {
                        debug!("ack failed to send: {e}");
                    }
                    self.last_send = now;
                }
                Frame::Ack { cumulative } => {
                    for msg in self.reliable_tx.ack(cumulative) {
                        pool.release(msg);
                    }
                }
                Frame::ConnectionRequest { .. } | Frame::ChallengeResponse { .. } => {}
            }
        }
    }

    pub fn advance(&mut self, now: f64, pool: &mut MessagePool, events: &mut Vec<SessionEvent>) {
        match self.state {
            ConnectionState::Connecting => {
                if self.connect_deadline.is_some_and(|deadline| now > deadline) {
                    warn!("connect attempt timed out");
                    if let Some(callback) = self.on_started.take() {
                        callback(false);
                    }
                    self.reset(pool);
                }
            }
            ConnectionState::Connected => {
                if now - self.last_receive > self.config.timeout {
                    warn!("server connection lost");
                    self.reset(pool);
                    events.push(SessionEvent::DisconnectedFromServer {
                        reason: DisconnectReason::Timeout,
                    });
                }
            }
            ConnectionState::Disconnected => {}
        }
    }

    pub fn next_inbound(&mut self) -> Option<Message> {
        self.inbound.pop_front()
    }

    fn reset(&mut self, pool: &mut MessagePool) {
        while let Some(msg) = self.outbound.pop() {
            pool.release(msg);
        }
        for msg in self.reliable_tx.drain() {
            pool.release(msg);
        }
        for msg in self.unreliable_tx.take() {
            pool.release(msg);
        }
        while let Some(msg) = self.inbound.pop_front() {
            pool.release(msg);
        }
        self.reliable_tx =
            ReliableSender::new(self.config.reliable_window, self.config.resend_interval);
        self.reliable_rx = ReliableReceiver::new(self.config.reliable_window);
        self.state = ConnectionState::Disconnected;
        self.phase = HandshakePhase::Idle;
        self.server_addr = None;
        self.client_index = None;
        self.connect_deadline = None;
        self.on_started = None;
        self.proof.clear();
        self.client_key.clear();
    }
}

struct ClientSlot {
    addr: SocketAddr,
    client_id: u64,
    state: ConnectionState,
    server_key: Vec<u8>,
    expected_proof: Vec<u8>,
    outbound: RingBuffer<Message>,
    reliable_tx: ReliableSender,
    reliable_rx: ReliableReceiver,
    unreliable_tx: UnreliableSender,
    last_receive: f64,
    last_send: f64,
}

fn release_slot_resources(slot: &mut ClientSlot, pool: &mut MessagePool) {
    while let Some(msg) = slot.outbound.pop() {
        pool.release(msg);
    }
    for msg in slot.reliable_tx.drain() {
        pool.release(msg);
    }
    for msg in slot.unreliable_tx.take() {
        pool.release(msg);
    }
}

/// The server role: one socket and a fixed slot table. A slot's index is
/// the client index handed to the application; the lowest free slot is
/// reserved when a handshake starts and freed when the connection ends.
pub struct ServerPeer {
    endpoint: UdpEndpoint,
    config: NetworkConfig,
    slots: Vec<Option<ClientSlot>>,
    addr_to_slot: HashMap<SocketAddr, usize>,
    inbound: VecDeque<(usize, Message)>,
}

impl ServerPeer {
    pub fn start(host: &str, config: &NetworkConfig) -> Result<Self, NetError> {
        let addr = format!("{host}:{}", config.server_port);
        let endpoint = UdpEndpoint::bind(&addr).map_err(|source| NetError::ServerBind {
            addr: addr.clone(),
            source,
        })?;
        info!("server listening on {}", endpoint.local_addr());

        Ok(Self {
            endpoint,
            config: config.clone(),
            slots: (0..config.max_clients).map(|_| None).collect(),
            addr_to_slot: HashMap::new(),
            inbound: VecDeque::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn set_conditioner(&mut self, conditioner: crate::endpoint::LossConditioner) {
        self.endpoint.set_conditioner(conditioner);
    }

    pub fn is_client_connected(&self, index: usize) -> bool {
        self.slots
            .get(index)
            .and_then(|slot| slot.as_ref())
            .is_some_and(|slot| slot.state == ConnectionState::Connected)
    }

    pub fn connected_count(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|slot| slot.state == ConnectionState::Connected)
            .count()
    }

    pub fn enqueue(&mut self, index: usize, msg: Message, pool: &mut MessagePool) {
        if msg.payload.len() > MAX_MESSAGE_SIZE {
            warn!(
                "dropping {} byte message, limit is {MAX_MESSAGE_SIZE}",
                msg.payload.len()
            );
            pool.release(msg);
            return;
        }
        let Some(slot) = self.slots.get_mut(index).and_then(|s| s.as_mut()) else {
            warn!("cannot queue message, client index {index} is not in use");
            pool.release(msg);
            return;
        };
        if slot.state != ConnectionState::Connected {
            warn!("cannot queue message, client {index} has not finished connecting");
            pool.release(msg);
            return;
        }
        if let Some(evicted) = slot.outbound.push(msg) {
            pool.release(evicted);
        }
    }

    pub fn flush(&mut self) {
        for slot in self.slots.iter_mut().flatten() {
            if slot.state != ConnectionState::Connected {
                continue;
            }
            while let Some(head) = slot.outbound.peek() {
                let ready = match head.channel {
                    ChannelKind::ReliableOrdered => slot.reliable_tx.can_send(),
                    ChannelKind::UnreliableUnordered => slot.unreliable_tx.can_send(),
                };
                if !ready {
                    break;
                }
                if let Some(msg) = slot.outbound.pop() {
                    match msg.channel {
                        ChannelKind::ReliableOrdered => {
                            slot.reliable_tx.send(msg);
                        }
                        ChannelKind::UnreliableUnordered => slot.unreliable_tx.stage(msg),
                    }
                }
            }
        }
    }

    pub fn send_phase(&mut self, now: f64, pool: &mut MessagePool) {
        for index in 0..self.slots.len() {
            let Some(slot) = self.slots[index].as_mut() else {
                continue;
            };
            if slot.state != ConnectionState::Connected {
                continue;
            }
            let addr = slot.addr;

            let due = slot.reliable_tx.collect_due(now);
            if !due.is_empty() {
                for chunk in chunk_by_size(due, |m| m.message.payload.len()) {
                    if let Err(e) = self.endpoint.send_to(Frame::Reliable { messages: chunk }, addr)
                    {
                        warn!("reliable send to client {index} failed: {e}");
                    }
                }
                slot.last_send = now;
            }

            let staged = slot.unreliable_tx.take();
            if !staged.is_empty() {
                let mut wires = Vec::with_capacity(staged.len());
                for mut msg in staged {
                    wires.push(WireMessage {
                        kind: msg.kind.0,
                        payload: std::mem::take(&mut msg.payload),
                    });
                    pool.release(msg);
                }
                for chunk in chunk_by_size(wires, |w| w.payload.len()) {
                    if let Err(e) = self
                        .endpoint
                        .send_to(Frame::Unreliable { messages: chunk }, addr)
                    {
                        warn!("unreliable send to client {index} failed: {e}");
                    }
                }
                slot.last_send = now;
            }

            if now - slot.last_send >= self.config.keepalive_interval {
                if let Err(e) = self.endpoint.send_to(Frame::KeepAlive, addr) {
                    debug!("keepalive to client {index} failed: {e}");
                }
                slot.last_send = now;
            }
        }
    }

    pub fn receive_phase(
        &mut self,
        now: f64,
        pool: &mut MessagePool,
        events: &mut Vec<SessionEvent>,
    ) {
        let frames = match self.endpoint.receive() {
            Ok(frames) => frames,
            Err(e) => {
                warn!("server receive failed: {e}");
                return;
            }
        };

        for (frame, addr) in frames {
            if let Some(&index) = self.addr_to_slot.get(&addr) {
                if let Some(slot) = self.slots[index].as_mut() {
                    slot.last_receive = now;
                }
            }

            match frame {
                Frame::ConnectionRequest { client_id, key } => {
                    self.handle_connection_request(addr, client_id, key, now, pool, events);
                }
                Frame::ChallengeResponse { proof } => {
                    self.handle_challenge_response(addr, proof, now, events);
                }
                Frame::Disconnect => {
                    if let Some(&index) = self.addr_to_slot.get(&addr) {
                        self.drop_slot(index, pool, events, DisconnectReason::Graceful);
                    }
                }
                Frame::KeepAlive => {}
                Frame::Unreliable { messages } => {
                    let Some(&index) = self.addr_to_slot.get(&addr) else {
                        continue;
                    };
                    let connected = self.slots[index]
                        .as_ref()
                        .is_some_and(|slot| slot.state == ConnectionState::Connected);
                    if !connected {
                        continue;
                    }
                    for wire in messages {
                        self.inbound.push_back((
                            index,
                            pooled_from_wire(pool, wire, ChannelKind::UnreliableUnordered),
                        ));
                    }
                }
                Frame::Reliable { messages } => {
                    let Some(&index) = self.addr_to_slot.get(&addr) else {
                        continue;
                    };
                    let Some(slot) = self.slots[index].as_mut() else {
                        continue;
                    };
                    if slot.state != ConnectionState::Connected {
                        continue;
                    }
                    let delivered = slot.reliable_rx.ingest(messages);
                    let cumulative = slot.reliable_rx.cumulative_ack();
                    for wire in delivered {
                        self.inbound.push_back((
                            index,
                            pooled_from_wire(pool, wire, ChannelKind::ReliableOrdered),
                        ));
                    }
                    if let Err(e) = self.endpoint.send_to(Frame::Ack { cumulative }, addr) {
                        debug!("ack to client {index} failed: {e}");
                    }
                    if let Some(slot) = self.slots[index].as_mut() {
                        slot.last_send = now;
                    }
                }
                Frame::Ack { cumulative } => {
                    let Some(&index) = self.addr_to_slot.get(&addr) else {
                        continue;
                    };
                    let Some(slot) = self.slots[index].as_mut() else {
                        continue;
                    };
                    for msg in slot.reliable_tx.ack(cumulative) {
                        pool.release(msg);
                    }
                }
                Frame::Challenge { .. } | Frame::Accepted { .. } | Frame::Denied { .. } => {}
            }
        }
    }

    pub fn advance(&mut self, now: f64, pool: &mut MessagePool, events: &mut Vec<SessionEvent>) {
        let timed_out: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.as_ref()
                    .filter(|slot| now - slot.last_receive > self.config.timeout)
                    .map(|_| index)
            })
            .collect();

        for index in timed_out {
            warn!("client {index} timed out");
            self.drop_slot(index, pool, events, DisconnectReason::Timeout);
        }
    }

    pub fn next_inbound(&mut self) -> Option<(usize, Message)> {
        self.inbound.pop_front()
    }

    /// Best-effort teardown: notify every live client, then release all
    /// queued resources. Send failures are swallowed so shutdown always
    /// completes.
    pub fn close(&mut self, pool: &mut MessagePool) {
        for index in 0..self.slots.len() {
            if let Some(mut slot) = self.slots[index].take() {
                if slot.state == ConnectionState::Connected {
                    if let Err(e) = self.endpoint.send_to(Frame::Disconnect, slot.addr) {
                        debug!("disconnect notice to client {index} failed: {e}");
                    }
                }
                release_slot_resources(&mut slot, pool);
            }
        }
        self.addr_to_slot.clear();
        while let Some((_, msg)) = self.inbound.pop_front() {
            pool.release(msg);
        }
        info!("server stopped");
    }

    fn handle_connection_request(
        &mut self,
        addr: SocketAddr,
        client_id: u64,
        client_key: Vec<u8>,
        now: f64,
        pool: &mut MessagePool,
        events: &mut Vec<SessionEvent>,
    ) {
        if let Some(&index) = self.addr_to_slot.get(&addr) {
            if let Some(slot) = self.slots[index].as_ref() {
                if slot.client_id == client_id {
                    let key = slot.server_key.clone();
                    if let Err(e) = self.endpoint.send_to(Frame::Challenge { key }, addr) {
                        warn!("challenge resend to {addr} failed: {e}");
                    }
                    return;
                }
            }
            // Same address with a fresh client id: the peer restarted.
            debug!("replacing stale session for {addr}");
            self.drop_slot(index, pool, events, DisconnectReason::Remote);
        }

        let Some(index) = self.slots.iter().position(|slot| slot.is_none()) else {
            warn!("denied connection from {addr}: server full");
            let denied = Frame::Denied {
                reason: "server full".to_string(),
            };
            if let Err(e) = self.endpoint.send_to(denied, addr) {
                warn!("denial to {addr} failed to send: {e}");
            }
            return;
        };

        let server_key = random_key(self.config.key_bytes);
        let expected_proof = xor_keys(&client_key, &server_key);

        self.slots[index] = Some(ClientSlot {
            addr,
            client_id,
            state: ConnectionState::Connecting,
            server_key: server_key.clone(),
            expected_proof,
            outbound: RingBuffer::new(self.config.server_queue_size_per_client),
            reliable_tx: ReliableSender::new(
                self.config.reliable_window,
                self.config.resend_interval,
            ),
            reliable_rx: ReliableReceiver::new(self.config.reliable_window),
            unreliable_tx: UnreliableSender::new(self.config.server_queue_size_per_client),
            last_receive: now,
            last_send: now,
        });
        self.addr_to_slot.insert(addr, index);

        debug!("challenging {addr} for slot {index}");
        if let Err(e) = self
            .endpoint
            .send_to(Frame::Challenge { key: server_key }, addr)
        {
            warn!("challenge to {addr} failed to send: {e}");
        }
    }

    fn handle_challenge_response(
        &mut self,
        addr: SocketAddr,
        proof: Vec<u8>,
        now: f64,
        events: &mut Vec<SessionEvent>,
    ) {
        let Some(&index) = self.addr_to_slot.get(&addr) else {
            return;
        };
        let Some(slot) = self.slots[index].as_mut() else {
            return;
        };

        if proof != slot.expected_proof {
            warn!("invalid challenge response from {addr}");
            return;
        }

        if slot.state != ConnectionState::Connected {
            slot.state = ConnectionState::Connected;
            info!("client {index} connected from {addr}");
            events.push(SessionEvent::ClientConnected {
                client_index: index,
            });
        }

        let accepted = Frame::Accepted {
            client_index: index as u32,
        };
        if let Err(e) = self.endpoint.send_to(accepted, addr) {
            warn!("accept to {addr} failed to send: {e}");
        }
        if let Some(slot) = self.slots[index].as_mut() {
            slot.last_send = now;
        }
    }

    fn drop_slot(
        &mut self,
        index: usize,
        pool: &mut MessagePool,
        events: &mut Vec<SessionEvent>,
        reason: DisconnectReason,
    ) {
        if let Some(mut slot) = self.slots[index].take() {
            self.addr_to_slot.remove(&slot.addr);
            release_slot_resources(&mut slot, pool);
            if slot.state == ConnectionState::Connected {
                info!("client {index} {}", reason.as_str());
                events.push(SessionEvent::ClientDisconnected {
                    client_index: index,
                    reason,
                });
            }
        }
    }
}
