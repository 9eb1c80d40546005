//! Deferred entity spawns and removals
//!
//! Gameplay code never creates or destroys entities directly. Requests are
//! queued here and applied by [`MutationQueue::drain`] once per tick, spawns
//! first and then removals, each in the order they were queued. Every
//! applied mutation is reported as a [`SpawnOrRemove`] record for
//! replication.

use std::collections::VecDeque;

use hashbrown::HashSet;
use smallvec::{smallvec, SmallVec};
use tracing::{debug, warn};

use crate::game::world::{EntityId, EntityRegistry, Placement, SpawnDescriptor, SpawnError};
use crate::util::identifier::Identifier;
use crate::util::vec2::Vec2;
use crate::{wire_enum, wire_record};

/// Which side of the session may create and destroy entities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    Server,
    Client,
}

/// Runs right after the entity is created. Removals requested through
/// [`FollowUp`] are applied in the same drain's removal phase.
pub type SpawnCallback = Box<dyn FnOnce(EntityId, &mut FollowUp) + Send>;

/// Removals requested from a spawn callback
#[derive(Debug, Default)]
pub struct FollowUp {
    removals: SmallVec<[EntityId; 4]>,
}

impl FollowUp {
    pub fn remove(&mut self, entity: EntityId) {
        self.removals.push(entity);
    }
}

wire_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DescriptorKind {
        ItemAt = 0,
        ItemInContainer = 1,
        Creature = 2,
        Vessel = 3,
    }
}

wire_record! {
    /// Replicated form of a [`SpawnDescriptor`]
    #[derive(Debug, Clone, PartialEq)]
    pub struct SpawnInfo {
        pub kind: DescriptorKind,
        pub identifier: Identifier,
        pub position: Option<Vec2>,
        pub force: bool,
    }
}

wire_record! {
    /// One applied spawn or removal
    #[derive(Debug, Clone, PartialEq)]
    pub struct SpawnOrRemove {
        pub remove: bool,
        pub entity_id: EntityId,
        /// Id the entity was created or queued under
        pub original_id: EntityId,
        pub container_id: Option<EntityId>,
        pub slot: Option<u8>,
        pub spawn: Option<SpawnInfo>,
    }
}

impl SpawnOrRemove {
    pub fn spawned(
        id: EntityId,
        original_id: EntityId,
        descriptor: &SpawnDescriptor,
        placement: Option<Placement>,
    ) -> Self {
        let kind = match descriptor {
            SpawnDescriptor::ItemAt { .. } => DescriptorKind::ItemAt,
            SpawnDescriptor::ItemInContainer { .. } => DescriptorKind::ItemInContainer,
            SpawnDescriptor::Creature { .. } => DescriptorKind::Creature,
            SpawnDescriptor::Vessel { .. } => DescriptorKind::Vessel,
        };
        Self {
            remove: false,
            entity_id: id,
            original_id,
            container_id: placement.map(|p| p.container),
            slot: placement.map(|p| p.slot),
            spawn: Some(SpawnInfo {
                kind,
                identifier: Identifier::new(descriptor.identifier()),
                position: descriptor.position(),
                force: descriptor.is_forced(),
            }),
        }
    }

    pub fn removed(id: EntityId, placement: Option<Placement>) -> Self {
        Self {
            remove: true,
            entity_id: id,
            original_id: id,
            container_id: placement.map(|p| p.container),
            slot: placement.map(|p| p.slot),
            spawn: None,
        }
    }

    /// Rebuild the descriptor of a replicated spawn
    pub fn descriptor(&self) -> Option<SpawnDescriptor> {
        let info = self.spawn.as_ref()?;
        let position = info.position.unwrap_or(Vec2::ZERO);
        Some(match info.kind {
            DescriptorKind::ItemAt => SpawnDescriptor::ItemAt {
                prefab: info.identifier.clone(),
                position,
            },
            DescriptorKind::ItemInContainer => SpawnDescriptor::ItemInContainer {
                prefab: info.identifier.clone(),
                container: self.container_id?,
                slot: self.slot,
                force: info.force,
            },
            DescriptorKind::Creature => SpawnDescriptor::Creature {
                species: info.identifier.clone(),
                position,
            },
            DescriptorKind::Vessel => SpawnDescriptor::Vessel {
                name: info.identifier.to_string(),
                position,
            },
        })
    }
}

struct SpawnEntry {
    descriptor: SpawnDescriptor,
    on_spawned: Option<SpawnCallback>,
    /// Server id of a replicated spawn
    requested: Option<EntityId>,
}

/// Order-preserving queue of pending world mutations
pub struct MutationQueue {
    authority: Authority,
    spawns: VecDeque<SpawnEntry>,
    removals: VecDeque<EntityId>,
    queued_removals: HashSet<EntityId>,
}

impl MutationQueue {
    pub fn new(authority: Authority) -> Self {
        Self {
            authority,
            spawns: VecDeque::new(),
            removals: VecDeque::new(),
            queued_removals: HashSet::new(),
        }
    }

    pub fn authority(&self) -> Authority {
        self.authority
    }

    /// Queue a spawn. Only the authority may create entities.
    pub fn enqueue_spawn(
        &mut self,
        descriptor: SpawnDescriptor,
        on_spawned: Option<SpawnCallback>,
    ) -> bool {
        if self.authority != Authority::Server {
            warn!(
                identifier = descriptor.identifier(),
                "Rejected spawn request on a client"
            );
            return false;
        }
        self.spawns.push_back(SpawnEntry {
            descriptor,
            on_spawned,
            requested: None,
        });
        true
    }

    /// Queue `entity` and everything inside it for removal.
    ///
    /// Returns false when the entity is unknown or already queued.
    pub fn enqueue_removal<R: EntityRegistry + ?Sized>(
        &mut self,
        entity: EntityId,
        registry: &R,
    ) -> bool {
        if self.authority != Authority::Server {
            warn!(entity = %entity, "Rejected removal request on a client");
            return false;
        }
        if !registry.contains(entity) {
            debug!(entity = %entity, "Ignoring removal of unknown entity");
            return false;
        }
        if !self.queued_removals.insert(entity) {
            return false;
        }
        self.removals.push_back(entity);

        let mut worklist: SmallVec<[EntityId; 16]> = registry.contained(entity).into_iter().collect();
        while let Some(child) = worklist.pop() {
            if self.queued_removals.insert(child) {
                self.removals.push_back(child);
                worklist.extend(registry.contained(child));
            }
        }
        true
    }

    /// Queue a mutation replicated from the server
    pub fn enqueue_remote(&mut self, record: SpawnOrRemove) -> bool {
        if self.authority != Authority::Client {
            warn!(entity = %record.entity_id, "Ignoring replicated mutation on the server");
            return false;
        }

        if record.remove {
            if self.queued_removals.insert(record.entity_id) {
                self.removals.push_back(record.entity_id);
            }
            return true;
        }

        let Some(descriptor) = record.descriptor() else {
            warn!(entity = %record.entity_id, "Replicated spawn without a descriptor");
            return false;
        };
        self.spawns.push_back(SpawnEntry {
            descriptor,
            on_spawned: None,
            requested: Some(record.entity_id),
        });
        true
    }

    pub fn is_queued<F: Fn(&SpawnDescriptor) -> bool>(&self, predicate: F) -> bool {
        self.spawns.iter().any(|entry| predicate(&entry.descriptor))
    }

    pub fn count_queued<F: Fn(&SpawnDescriptor) -> bool>(&self, predicate: F) -> usize {
        self.spawns
            .iter()
            .filter(|entry| predicate(&entry.descriptor))
            .count()
    }

    pub fn is_removal_queued(&self, entity: EntityId) -> bool {
        self.queued_removals.contains(&entity)
    }

    pub fn len(&self) -> usize {
        self.spawns.len() + self.removals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spawns.is_empty() && self.removals.is_empty()
    }

    /// Drop everything queued without applying it
    pub fn reset(&mut self) {
        self.spawns.clear();
        self.removals.clear();
        self.queued_removals.clear();
    }

    /// Apply queued spawns, then queued removals
    pub fn drain<R: EntityRegistry + ?Sized>(&mut self, registry: &mut R) -> Vec<SpawnOrRemove> {
        let mut applied = Vec::with_capacity(self.len());

        while let Some(entry) = self.spawns.pop_front() {
            if let Some(record) = self.apply_spawn(entry, registry) {
                applied.push(record);
            }
        }

        while let Some(entity) = self.removals.pop_front() {
            self.queued_removals.remove(&entity);
            if !registry.contains(entity) {
                continue;
            }

            // Contents go first so their placement is still reported
            let mut order: SmallVec<[EntityId; 8]> = smallvec![];
            let mut stack: SmallVec<[EntityId; 8]> = smallvec![entity];
            while let Some(next) = stack.pop() {
                order.push(next);
                stack.extend(registry.contained(next));
            }
            for id in order.into_iter().rev() {
                let placement = registry.placement(id);
                registry.flush_pending_updates(id);
                if registry.remove(id) {
                    applied.push(SpawnOrRemove::removed(id, placement));
                }
            }
        }

        applied
    }

    fn apply_spawn<R: EntityRegistry + ?Sized>(
        &mut self,
        entry: SpawnEntry,
        registry: &mut R,
    ) -> Option<SpawnOrRemove> {
        let SpawnEntry {
            descriptor,
            on_spawned,
            requested,
        } = entry;

        if let Some(container) = descriptor.container() {
            if !registry.contains(container) {
                debug!(container = %container, "Skipping spawn into missing container");
                return None;
            }
            if !descriptor.is_forced() && registry.is_container_full(container) {
                debug!(container = %container, "Skipping spawn into full container");
                return None;
            }
        }

        let result = match registry.spawn(&descriptor, requested) {
            Err(SpawnError::IdInUse(id)) => {
                warn!(entity = %id, "Replicated id in use, assigning a local one");
                registry.spawn(&descriptor, None)
            }
            other => other,
        };

        match result {
            Ok(id) => {
                let record = SpawnOrRemove::spawned(
                    id,
                    requested.unwrap_or(id),
                    &descriptor,
                    registry.placement(id),
                );
                if let Some(callback) = on_spawned {
                    let mut follow_up = FollowUp::default();
                    callback(id, &mut follow_up);
                    for entity in follow_up.removals {
                        self.enqueue_removal(entity, &*registry);
                    }
                }
                Some(record)
            }
            Err(e) => {
                warn!(identifier = descriptor.identifier(), error = %e, "Spawn failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::world::World;
    use crate::net::codec;
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::sync::Arc;

    fn item_at(prefab: &str) -> SpawnDescriptor {
        SpawnDescriptor::ItemAt {
            prefab: prefab.into(),
            position: Vec2::new(1.0, 2.0),
        }
    }

    fn spawn_now(world: &mut World, descriptor: SpawnDescriptor) -> EntityId {
        world.spawn(&descriptor, None).unwrap()
    }

    #[test]
    fn test_drain_order() {
        let mut world = World::new();
        let r1 = spawn_now(&mut world, item_at("r1"));
        let r2 = spawn_now(&mut world, item_at("r2"));

        let mut queue = MutationQueue::new(Authority::Server);
        assert!(queue.enqueue_spawn(item_at("s1"), None));
        assert!(queue.enqueue_removal(r1, &world));
        assert!(queue.enqueue_spawn(item_at("s2"), None));
        assert!(queue.enqueue_removal(r2, &world));
        assert_eq!(queue.len(), 4);

        let applied = queue.drain(&mut world);
        let summary: Vec<(bool, String)> = applied
            .iter()
            .map(|r| {
                let name = match &r.spawn {
                    Some(info) => info.identifier.to_string(),
                    None => r.entity_id.0.to_string(),
                };
                (r.remove, name)
            })
            .collect();

        assert_eq!(
            summary,
            vec![
                (false, "s1".to_string()),
                (false, "s2".to_string()),
                (true, r1.0.to_string()),
                (true, r2.0.to_string()),
            ]
        );
        assert!(queue.is_empty());
        assert!(!world.contains(r1));
        assert_eq!(world.len(), 2);
    }

    #[test]
    fn test_spawn_callback_receives_id() {
        let mut world = World::new();
        let mut queue = MutationQueue::new(Authority::Server);
        let seen = Arc::new(AtomicU16::new(0));
        let sink = Arc::clone(&seen);
        queue.enqueue_spawn(
            item_at("flare"),
            Some(Box::new(move |id: EntityId, _: &mut FollowUp| {
                sink.store(id.0, Ordering::SeqCst)
            })),
        );

        let applied = queue.drain(&mut world);
        assert_eq!(seen.load(Ordering::SeqCst), applied[0].entity_id.0);
        assert!(world.contains(applied[0].entity_id));
    }

    #[test]
    fn test_callback_removal_applies_in_same_drain() {
        let mut world = World::new();
        let mut queue = MutationQueue::new(Authority::Server);
        queue.enqueue_spawn(
            item_at("a"),
            Some(Box::new(|id: EntityId, follow_up: &mut FollowUp| follow_up.remove(id))),
        );
        queue.enqueue_spawn(item_at("b"), None);

        let applied = queue.drain(&mut world);
        let a = applied[0].entity_id;
        let b = applied[1].entity_id;
        let summary: Vec<(bool, EntityId)> = applied.iter().map(|r| (r.remove, r.entity_id)).collect();
        assert_eq!(summary, vec![(false, a), (false, b), (true, a)]);
        assert!(!world.contains(a));
        assert!(world.contains(b));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_client_rejects_local_mutations() {
        let mut world = World::new();
        let existing = spawn_now(&mut world, item_at("crate"));
        let mut queue = MutationQueue::new(Authority::Client);

        assert!(!queue.enqueue_spawn(item_at("wrench"), None));
        assert!(!queue.enqueue_removal(existing, &world));
        assert!(queue.is_empty());
        assert!(queue.drain(&mut world).is_empty());
        assert!(world.contains(existing));
    }

    #[test]
    fn test_removal_is_idempotent_and_cascades() {
        let mut world = World::new();
        let chest = spawn_now(&mut world, item_at("chest"));
        let pouch = spawn_now(
            &mut world,
            SpawnDescriptor::ItemInContainer {
                prefab: "pouch".into(),
                container: chest,
                slot: None,
                force: false,
            },
        );
        let coin = spawn_now(
            &mut world,
            SpawnDescriptor::ItemInContainer {
                prefab: "coin".into(),
                container: pouch,
                slot: Some(3),
                force: false,
            },
        );
        world.mark_dirty(coin);

        let mut queue = MutationQueue::new(Authority::Server);
        assert!(queue.enqueue_removal(chest, &world));
        assert!(!queue.enqueue_removal(chest, &world));
        assert!(!queue.enqueue_removal(pouch, &world));
        assert!(queue.is_removal_queued(coin));
        assert!(!queue.enqueue_removal(EntityId(999), &world));

        let applied = queue.drain(&mut world);
        let removed: Vec<EntityId> = applied.iter().map(|r| r.entity_id).collect();
        assert_eq!(removed, vec![coin, pouch, chest]);
        assert_eq!(applied[0].container_id, Some(pouch));
        assert_eq!(applied[0].slot, Some(3));
        assert_eq!(world.flushed(), &[coin]);
        assert!(world.is_empty());
        assert!(!queue.is_removal_queued(coin));
    }

    #[test]
    fn test_full_container_skipped_unless_forced() {
        let mut world = World::with_container_capacity(1);
        let locker = spawn_now(&mut world, item_at("locker"));
        let mut queue = MutationQueue::new(Authority::Server);

        let into_locker = |force| SpawnDescriptor::ItemInContainer {
            prefab: "suit".into(),
            container: locker,
            slot: None,
            force,
        };
        queue.enqueue_spawn(into_locker(false), None);
        queue.enqueue_spawn(into_locker(false), None);
        queue.enqueue_spawn(into_locker(true), None);

        let applied = queue.drain(&mut world);
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0].container_id, Some(locker));
        assert_eq!(applied[1].container_id, None);
    }

    #[test]
    fn test_queries_and_reset() {
        let mut world = World::new();
        let target = spawn_now(&mut world, item_at("target"));
        let mut queue = MutationQueue::new(Authority::Server);
        queue.enqueue_spawn(item_at("oxygentank"), None);
        queue.enqueue_spawn(item_at("OxygenTank"), None);
        queue.enqueue_spawn(
            SpawnDescriptor::Creature {
                species: "crawler".into(),
                position: Vec2::ZERO,
            },
            None,
        );
        queue.enqueue_removal(target, &world);

        assert!(queue.is_queued(|d| d.identifier().eq_ignore_ascii_case("crawler")));
        assert_eq!(queue.count_queued(|d| d.identifier().eq_ignore_ascii_case("oxygentank")), 2);
        assert!(!queue.is_queued(|d| matches!(d, SpawnDescriptor::Vessel { .. })));

        queue.reset();
        assert!(queue.is_empty());
        assert!(!queue.is_removal_queued(target));
        assert!(queue.drain(&mut world).is_empty());
        assert!(world.contains(target));
    }

    #[test]
    fn test_replicated_mutations_apply_on_drain() {
        let mut server_world = World::new();
        let mut server = MutationQueue::new(Authority::Server);
        server.enqueue_spawn(
            SpawnDescriptor::Vessel {
                name: "Dugong".into(),
                position: Vec2::new(10.0, -20.0),
            },
            None,
        );
        let spawned = server.drain(&mut server_world);

        let mut client_world = World::new();
        let mut client = MutationQueue::new(Authority::Client);
        for record in &spawned {
            let bytes = codec::encode(record).unwrap();
            assert!(client.enqueue_remote(codec::decode(&bytes).unwrap()));
        }
        assert!(client_world.is_empty());

        let replayed = client.drain(&mut client_world);
        let vessel = spawned[0].entity_id;
        assert_eq!(replayed[0].entity_id, vessel);
        assert_eq!(client_world.get(vessel).unwrap().position, Vec2::new(10.0, -20.0));

        server.enqueue_removal(vessel, &server_world);
        for record in server.drain(&mut server_world) {
            client.enqueue_remote(record);
        }
        client.drain(&mut client_world);
        assert!(client_world.is_empty());

        assert!(!server.enqueue_remote(SpawnOrRemove::removed(vessel, None)));
    }

    #[test]
    fn test_replicated_id_collision_falls_back() {
        let mut world = World::new();
        let local = spawn_now(&mut world, item_at("local"));
        let mut client = MutationQueue::new(Authority::Client);

        let mut record = SpawnOrRemove::spawned(local, local, &item_at("remote"), None);
        record.entity_id = local;
        client.enqueue_remote(record);

        let applied = client.drain(&mut world);
        assert_ne!(applied[0].entity_id, local);
        assert_eq!(applied[0].original_id, local);
    }
}
