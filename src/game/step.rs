//! Per-tick ordering of world mutations and reconciliation
//!
//! Each tick drains the mutation queue before any reconciliation timer is
//! advanced, so corrections never target an entity that was removed in the
//! same tick. Buffers are registered against the entity that owns them and
//! are discarded when that entity is removed.

use std::sync::Arc;
use std::time::Instant;

use crate::game::reconcile::{Reconcilable, ReconcileOutcome, ReconciliationBuffer};
use crate::game::spawner::{MutationQueue, SpawnOrRemove};
use crate::game::world::{EntityId, EntityRegistry};
use crate::metrics::TickStats;
use crate::net::codec::WireRecord;

/// What one tick did
#[derive(Debug, Default)]
pub struct StepReport {
    pub tick: u64,
    pub mutations: Vec<SpawnOrRemove>,
    pub corrections_applied: usize,
    pub corrections_dropped: usize,
}

impl StepReport {
    pub fn spawns(&self) -> usize {
        self.mutations.iter().filter(|m| !m.remove).count()
    }

    pub fn removals(&self) -> usize {
        self.mutations.iter().filter(|m| m.remove).count()
    }
}

pub struct SimulationStep {
    queue: MutationQueue,
    buffers: Vec<(EntityId, Box<dyn Reconcilable>)>,
    stats: Option<Arc<TickStats>>,
    tick: u64,
}

impl SimulationStep {
    pub fn new(queue: MutationQueue) -> Self {
        Self {
            queue,
            buffers: Vec::new(),
            stats: None,
            tick: 0,
        }
    }

    pub fn with_stats(mut self, stats: Arc<TickStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut MutationQueue {
        &mut self.queue
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Register a buffer owned by `owner`; advanced every tick from now on
    pub fn register<T: WireRecord + Send>(&mut self, owner: EntityId, buffer: ReconciliationBuffer<T>) {
        self.buffers.push((owner, Box::new(buffer)));
    }

    pub fn buffer<T: WireRecord + Send>(&self, owner: EntityId) -> Option<&ReconciliationBuffer<T>> {
        self.buffers
            .iter()
            .filter(|(id, _)| *id == owner)
            .find_map(|(_, buffer)| buffer.as_any().downcast_ref())
    }

    pub fn buffer_mut<T: WireRecord + Send>(
        &mut self,
        owner: EntityId,
    ) -> Option<&mut ReconciliationBuffer<T>> {
        self.buffers
            .iter_mut()
            .filter(|(id, _)| *id == owner)
            .find_map(|(_, buffer)| buffer.as_any_mut().downcast_mut())
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Run one tick: drain mutations, then advance reconciliation
    pub fn step<R: EntityRegistry + ?Sized>(&mut self, registry: &mut R, dt: f32) -> StepReport {
        let started = Instant::now();
        let mutations = self.queue.drain(registry);

        for removed in mutations.iter().filter(|m| m.remove) {
            self.buffers.retain_mut(|(owner, buffer)| {
                if *owner == removed.entity_id {
                    buffer.discard_pending();
                    false
                } else {
                    true
                }
            });
        }

        let mut report = StepReport {
            tick: self.tick,
            mutations,
            ..Default::default()
        };
        for (_, buffer) in &mut self.buffers {
            match buffer.update(dt) {
                ReconcileOutcome::Applied => report.corrections_applied += 1,
                ReconcileOutcome::Dropped => report.corrections_dropped += 1,
                _ => {}
            }
        }

        if let Some(stats) = &self.stats {
            stats.record_mutations(report.spawns(), report.removals());
            stats.record_corrections(report.corrections_applied, report.corrections_dropped);
            stats.record_tick_time(started.elapsed());
        }
        self.tick += 1;
        report
    }
}
