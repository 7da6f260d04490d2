use log::warn;

/// Application-level message type tag, routed through the registries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKind(pub u16);

/// Delivery quality a message is sent over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelKind {
    #[default]
    UnreliableUnordered,
    ReliableOrdered,
}

#[derive(Debug)]
pub struct Message {
    pub kind: MessageKind,
    pub channel: ChannelKind,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub acquired: u64,
    pub released: u64,
    pub outstanding: u64,
    pub available: usize,
}

/// Recycles message allocations per role. The budget is soft: exceeding it
/// logs a warning but never refuses an acquire.
pub struct MessagePool {
    free: Vec<Message>,
    budget: usize,
    acquired: u64,
    released: u64,
}

impl MessagePool {
    pub fn new(budget: usize) -> Self {
        Self {
            free: Vec::new(),
            budget,
            acquired: 0,
            released: 0,
        }
    }

    pub fn acquire(&mut self, kind: MessageKind) -> Message {
        self.acquired += 1;
        let outstanding = self.acquired.saturating_sub(self.released);
        if outstanding == self.budget as u64 + 1 {
            warn!(
                "message pool over budget: {outstanding} live messages, budget {}",
                self.budget
            );
        }
        match self.free.pop() {
            Some(mut msg) => {
                msg.kind = kind;
                msg.channel = ChannelKind::default();
                msg
            }
            None => Message {
                kind,
                channel: ChannelKind::default(),
                payload: Vec::new(),
            },
        }
    }

    pub fn release(&mut self, mut msg: Message) {
        self.released += 1;
        if self.free.len() < self.budget {
            msg.payload.clear();
            self.free.push(msg);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            acquired: self.acquired,
            released: self.released,
            outstanding: self.acquired.saturating_sub(self.released),
            available: self.free.len(),
        }
    }
}
