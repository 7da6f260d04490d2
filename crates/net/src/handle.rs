use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::num::NonZeroU32;

use thiserror::Error;

/// Identifier binding a replicated object across client and server.
/// Raw value 0 is reserved to mean "unassigned" and never exists as an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkId(NonZeroU32);

impl NetworkId {
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("network ids are minted by the server endpoint only")]
    NotServer,
    #[error("network id {0} is already bound to another entity")]
    IdInUse(NetworkId),
    #[error("entity already holds network id {0}")]
    AlreadyBound(NetworkId),
    #[error("entity has no network id bound")]
    Unbound,
}

/// Per-id replication clocks, reset to zero whenever an id is handed out.
/// Updated by the replication layer, not by this crate.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SyncTimestamps {
    pub position: f64,
    pub rotation: f64,
    pub scale: f64,
}

/// Recyclable id pool with bidirectional id/entity maps. Released handles
/// are reused before the counter grows, keeping the id space dense.
pub struct NetworkIdAllocator<E> {
    next: NonZeroU32,
    free: VecDeque<NetworkId>,
    entities: HashMap<NetworkId, E>,
    ids: HashMap<E, NetworkId>,
    timestamps: HashMap<NetworkId, SyncTimestamps>,
}

impl<E: Copy + Eq + Hash> NetworkIdAllocator<E> {
    pub fn new() -> Self {
        Self {
            next: NonZeroU32::MIN,
            free: VecDeque::new(),
            entities: HashMap::new(),
            ids: HashMap::new(),
            timestamps: HashMap::new(),
        }
    }

    /// Mints (or recycles) an id and binds it to `entity`.
    pub fn register(&mut self, entity: E) -> Result<NetworkId, IdError> {
        if let Some(existing) = self.ids.get(&entity) {
            return Err(IdError::AlreadyBound(*existing));
        }
        let id = match self.free.pop_front() {
            Some(id) => id,
            None => {
                let id = NetworkId(self.next);
                self.next = self.next.checked_add(1).unwrap_or(NonZeroU32::MIN);
                id
            }
        };
        self.entities.insert(id, entity);
        self.ids.insert(entity, id);
        self.timestamps.insert(id, SyncTimestamps::default());
        Ok(id)
    }

    /// Binds a server-issued id on the receiving side. Rebinding the same
    /// id to the same entity is an accepted no-op.
    pub fn bind(&mut self, id: NetworkId, entity: E) -> Result<(), IdError> {
        match self.entities.get(&id) {
            Some(existing) if *existing != entity => return Err(IdError::IdInUse(id)),
            Some(_) => return Ok(()),
            None => {}
        }
        if let Some(existing) = self.ids.get(&entity) {
            return Err(IdError::AlreadyBound(*existing));
        }
        self.free.retain(|f| *f != id);
        self.entities.insert(id, entity);
        self.ids.insert(entity, id);
        self.timestamps.insert(id, SyncTimestamps::default());
        Ok(())
    }

    /// Unbinds `entity` and returns its handle to the free pool.
    pub fn release(&mut self, entity: E) -> Result<NetworkId, IdError> {
        let Some(id) = self.ids.remove(&entity) else {
            return Err(IdError::Unbound);
        };
        self.entities.remove(&id);
        self.timestamps.remove(&id);
        self.free.push_back(id);
        Ok(id)
    }

    pub fn entity(&self, id: NetworkId) -> Option<E> {
        self.entities.get(&id).copied()
    }

    pub fn id_of(&self, entity: E) -> Option<NetworkId> {
        self.ids.get(&entity).copied()
    }

    pub fn timestamps_mut(&mut self, id: NetworkId) -> Option<&mut SyncTimestamps> {
        self.timestamps.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn free_handles(&self) -> usize {
        self.free.len()
    }
}

impl<E: Copy + Eq + Hash> Default for NetworkIdAllocator<E> {
    fn default() -> Self {
        Self::new()
    }
}
