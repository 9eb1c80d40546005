//! Live-entity registry
//!
//! The mutation queue only touches the world through [`EntityRegistry`];
//! [`World`] is the in-memory implementation used by the host and tests.

use std::fmt;

use hashbrown::HashMap;
use smallvec::SmallVec;
use tracing::debug;

use crate::game::constants::world::{DEFAULT_CONTAINER_CAPACITY, MAX_ENTITIES};
use crate::net::codec::{DecodeError, FieldKind, WireType, WireValue};
use crate::util::identifier::Identifier;
use crate::util::vec2::Vec2;

/// Network entity id. 0 is reserved as "none".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u16);

impl EntityId {
    pub const NONE: EntityId = EntityId(0);
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl WireType for EntityId {
    fn kind() -> FieldKind {
        FieldKind::U16
    }

    fn to_value(&self) -> WireValue {
        WireValue::UInt(self.0 as u64)
    }

    fn from_value(value: WireValue) -> Result<Self, DecodeError> {
        u16::from_value(value).map(EntityId)
    }
}

/// Where a contained entity sits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub container: EntityId,
    pub slot: u8,
}

/// What to create when a queued spawn is applied
#[derive(Debug, Clone, PartialEq)]
pub enum SpawnDescriptor {
    ItemAt {
        prefab: Identifier,
        position: Vec2,
    },
    ItemInContainer {
        prefab: Identifier,
        container: EntityId,
        slot: Option<u8>,
        /// Spawn even when the container is full; the item drops loose
        force: bool,
    },
    Creature {
        species: Identifier,
        position: Vec2,
    },
    Vessel {
        name: String,
        position: Vec2,
    },
}

impl SpawnDescriptor {
    pub fn identifier(&self) -> &str {
        match self {
            SpawnDescriptor::ItemAt { prefab, .. }
            | SpawnDescriptor::ItemInContainer { prefab, .. } => prefab.as_str(),
            SpawnDescriptor::Creature { species, .. } => species.as_str(),
            SpawnDescriptor::Vessel { name, .. } => name,
        }
    }

    pub fn container(&self) -> Option<EntityId> {
        match self {
            SpawnDescriptor::ItemInContainer { container, .. } => Some(*container),
            _ => None,
        }
    }

    pub fn position(&self) -> Option<Vec2> {
        match self {
            SpawnDescriptor::ItemAt { position, .. }
            | SpawnDescriptor::Creature { position, .. }
            | SpawnDescriptor::Vessel { position, .. } => Some(*position),
            SpawnDescriptor::ItemInContainer { .. } => None,
        }
    }

    pub fn is_forced(&self) -> bool {
        matches!(self, SpawnDescriptor::ItemInContainer { force: true, .. })
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            SpawnDescriptor::ItemAt { .. } | SpawnDescriptor::ItemInContainer { .. } => {
                EntityKind::Item
            }
            SpawnDescriptor::Creature { .. } => EntityKind::Creature,
            SpawnDescriptor::Vessel { .. } => EntityKind::Vessel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Item,
    Creature,
    Vessel,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpawnError {
    #[error("Container {0} does not exist")]
    ContainerMissing(EntityId),
    #[error("Container {0} is full")]
    ContainerFull(EntityId),
    #[error("Entity {0} cannot hold other entities")]
    NotAContainer(EntityId),
    #[error("Entity id {0} is already in use")]
    IdInUse(EntityId),
    #[error("No free entity ids")]
    IdsExhausted,
}

/// Registry mutated by the mutation queue during a drain
pub trait EntityRegistry {
    /// Create an entity, with `requested` as its id when given
    fn spawn(
        &mut self,
        descriptor: &SpawnDescriptor,
        requested: Option<EntityId>,
    ) -> Result<EntityId, SpawnError>;

    fn contains(&self, id: EntityId) -> bool;

    fn is_container_full(&self, container: EntityId) -> bool;

    /// Entities directly inside `id`
    fn contained(&self, id: EntityId) -> SmallVec<[EntityId; 8]>;

    fn placement(&self, id: EntityId) -> Option<Placement>;

    /// Send any network updates still queued for `id`
    fn flush_pending_updates(&mut self, id: EntityId);

    fn remove(&mut self, id: EntityId) -> bool;
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub identifier: Identifier,
    pub position: Vec2,
    pub placement: Option<Placement>,
    pub capacity: usize,
    /// Slot-indexed contents
    pub slots: Vec<Option<EntityId>>,
    pub pending_updates: u32,
}

/// In-memory entity registry
#[derive(Debug)]
pub struct World {
    entities: HashMap<EntityId, Entity>,
    next_id: u16,
    container_capacity: usize,
    flushed: Vec<EntityId>,
}

impl World {
    pub fn new() -> Self {
        Self::with_container_capacity(DEFAULT_CONTAINER_CAPACITY)
    }

    pub fn with_container_capacity(capacity: usize) -> Self {
        Self {
            entities: HashMap::new(),
            next_id: 1,
            container_capacity: capacity.min(u8::MAX as usize + 1),
            flushed: Vec::new(),
        }
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys().copied()
    }

    /// Note a network update queued for `id`
    pub fn mark_dirty(&mut self, id: EntityId) {
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.pending_updates += 1;
        }
    }

    /// Entities whose updates were flushed, in flush order
    pub fn flushed(&self) -> &[EntityId] {
        &self.flushed
    }

    fn allocate_id(&mut self) -> Result<EntityId, SpawnError> {
        if self.entities.len() >= MAX_ENTITIES {
            return Err(SpawnError::IdsExhausted);
        }
        loop {
            let id = EntityId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.entities.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    /// Free slot in `container`, preferring `preferred`
    fn free_slot(&self, container: &Entity, preferred: Option<u8>) -> Option<u8> {
        if let Some(slot) = preferred {
            if matches!(container.slots.get(slot as usize), Some(None)) {
                return Some(slot);
            }
        }
        container
            .slots
            .iter()
            .position(Option::is_none)
            .map(|slot| slot as u8)
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityRegistry for World {
    fn spawn(
        &mut self,
        descriptor: &SpawnDescriptor,
        requested: Option<EntityId>,
    ) -> Result<EntityId, SpawnError> {
        let mut placement = None;
        let mut position = descriptor.position().unwrap_or(Vec2::ZERO);

        if let SpawnDescriptor::ItemInContainer {
            container,
            slot,
            force,
            ..
        } = descriptor
        {
            let parent = self
                .entities
                .get(container)
                .ok_or(SpawnError::ContainerMissing(*container))?;
            if parent.kind == EntityKind::Creature {
                return Err(SpawnError::NotAContainer(*container));
            }
            match self.free_slot(parent, *slot) {
                Some(free) => {
                    placement = Some(Placement {
                        container: *container,
                        slot: free,
                    })
                }
                None if *force => {
                    debug!(container = %container, "Container full, spawning item loose");
                    position = parent.position;
                }
                None => return Err(SpawnError::ContainerFull(*container)),
            }
        }

        let id = match requested {
            Some(id) if id == EntityId::NONE || self.entities.contains_key(&id) => {
                return Err(SpawnError::IdInUse(id))
            }
            Some(id) => id,
            None => self.allocate_id()?,
        };

        let capacity = match descriptor.kind() {
            EntityKind::Creature => 0,
            EntityKind::Item | EntityKind::Vessel => self.container_capacity,
        };
        if let Some(Placement { container, slot }) = placement {
            if let Some(parent) = self.entities.get_mut(&container) {
                parent.slots[slot as usize] = Some(id);
                position = parent.position;
            }
        }

        self.entities.insert(
            id,
            Entity {
                id,
                kind: descriptor.kind(),
                identifier: Identifier::new(descriptor.identifier()),
                position,
                placement,
                capacity,
                slots: vec![None; capacity],
                pending_updates: 0,
            },
        );
        Ok(id)
    }

    fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    fn is_container_full(&self, container: EntityId) -> bool {
        self.entities
            .get(&container)
            .map_or(false, |entity| entity.slots.iter().all(Option::is_some))
    }

    fn contained(&self, id: EntityId) -> SmallVec<[EntityId; 8]> {
        self.entities
            .get(&id)
            .map(|entity| entity.slots.iter().flatten().copied().collect())
            .unwrap_or_default()
    }

    fn placement(&self, id: EntityId) -> Option<Placement> {
        self.entities.get(&id).and_then(|entity| entity.placement)
    }

    fn flush_pending_updates(&mut self, id: EntityId) {
        if let Some(entity) = self.entities.get_mut(&id) {
            if entity.pending_updates > 0 {
                entity.pending_updates = 0;
                self.flushed.push(id);
            }
        }
    }

    fn remove(&mut self, id: EntityId) -> bool {
        let Some(entity) = self.entities.remove(&id) else {
            return false;
        };

        if let Some(Placement { container, slot }) = entity.placement {
            if let Some(parent) = self.entities.get_mut(&container) {
                parent.slots[slot as usize] = None;
            }
        }
        // Anything still inside falls out of the removed container
        for child in entity.slots.into_iter().flatten() {
            if let Some(child) = self.entities.get_mut(&child) {
                child.placement = None;
            }
        }
        true
    }
}
