use std::collections::HashMap;

use crate::message::{ChannelKind, Message, MessageKind};

#[derive(Debug)]
pub(crate) struct Staged {
    pub kind: MessageKind,
    pub channel: ChannelKind,
    pub payload: Vec<u8>,
}

/// Reply surface handed to handlers. Sends staged here are drained into the
/// regular outbound queues right after the dispatch pass, so a handler can
/// answer within the same tick.
#[derive(Default)]
pub struct Outbox {
    pub(crate) to_server: Vec<Staged>,
    pub(crate) to_clients: Vec<(usize, Staged)>,
}

impl Outbox {
    pub fn send_to_server(&mut self, kind: MessageKind, channel: ChannelKind, payload: &[u8]) {
        self.to_server.push(Staged {
            kind,
            channel,
            payload: payload.to_vec(),
        });
    }

    pub fn send_to_client(
        &mut self,
        client_index: usize,
        kind: MessageKind,
        channel: ChannelKind,
        payload: &[u8],
    ) {
        self.to_clients.push((
            client_index,
            Staged {
                kind,
                channel,
                payload: payload.to_vec(),
            },
        ));
    }

    pub fn is_empty(&self) -> bool {
        self.to_server.is_empty() && self.to_clients.is_empty()
    }
}

type ClientHandler = Box<dyn FnMut(&mut Outbox, &Message)>;
type ServerHandler = Box<dyn FnMut(&mut Outbox, usize, &Message)>;

/// Maps a message kind to the ordered handlers subscribed to it, with
/// separate registries for the client and server roles. Handlers run in
/// registration order and stay registered for the life of the router;
/// there is no unregistration.
#[derive(Default)]
pub struct MessageRouter {
    client: HashMap<MessageKind, Vec<ClientHandler>>,
    server: HashMap<MessageKind, Vec<ServerHandler>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_client<F>(&mut self, kind: MessageKind, handler: F)
    where
        F: FnMut(&mut Outbox, &Message) + 'static,
    {
        self.client.entry(kind).or_default().push(Box::new(handler));
    }

    pub fn register_server<F>(&mut self, kind: MessageKind, handler: F)
    where
        F: FnMut(&mut Outbox, usize, &Message) + 'static,
    {
        self.server.entry(kind).or_default().push(Box::new(handler));
    }

    /// Runs every client handler registered for the message's kind.
    /// Returns how many handlers ran; a kind nobody subscribed to is simply
    /// dropped by the caller.
    pub fn dispatch_client(&mut self, outbox: &mut Outbox, msg: &Message) -> usize {
        let Some(handlers) = self.client.get_mut(&msg.kind) else {
            return 0;
        };
        for handler in handlers.iter_mut() {
            handler(outbox, msg);
        }
        handlers.len()
    }

    pub fn dispatch_server(&mut self, outbox: &mut Outbox, client_index: usize, msg: &Message) -> usize {
        let Some(handlers) = self.server.get_mut(&msg.kind) else {
            return 0;
        };
        for handler in handlers.iter_mut() {
            handler(outbox, client_index, msg);
        }
        handlers.len()
    }
}
