//! Supervisor and simulation halves of the host binary
//!
//! The supervisor launches the simulation as a child process and accepts its
//! connection on a loopback listener. The simulation owns the world: it
//! applies spawns and removals, replicates each one, and periodically sends
//! authoritative trim state for every vessel. The supervisor replays the
//! mutations into its own world and predicts trim locally. Each prediction
//! is sent back as input once, and the simulation's corrections settle in
//! after the correction delay.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::game::reconcile::ReconciliationBuffer;
use crate::game::spawner::{Authority, DescriptorKind, MutationQueue, SpawnOrRemove};
use crate::game::step::{SimulationStep, StepReport};
use crate::game::world::{EntityId, EntityKind, SpawnDescriptor, World};
use crate::metrics::TickStats;
use crate::net::codec::{self, EncodeError};
use crate::net::relay::ProcessRelay;
use crate::net::sequence::SequenceId;
use crate::util::vec2::Vec2;
use crate::{wire_enum, wire_record};

const ITEM_PREFABS: &[&str] = &["oxygentank", "wrench", "weldingfuel", "divingmask", "flare"];
const CREATURES: &[&str] = &["crawler", "mudraptor", "hammerhead"];
/// Seconds between authoritative trim broadcasts
const TRIM_BROADCAST_INTERVAL: f64 = 0.5;

wire_record! {
    /// Ballast and throttle of a vessel
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct TrimState {
        #[wire(min = 0, max = 100)]
        pub ballast: i32,
        #[wire(min = -1.0, max = 1.0, bits = 12)]
        pub throttle: f32,
    }
}

wire_record! {
    #[derive(Debug, Clone, PartialEq)]
    pub struct Correction {
        pub owner: EntityId,
        pub sequence: SequenceId,
        pub sent_at: f64,
        #[wire(array_max = 256)]
        pub payload: Vec<u8>,
    }
}

wire_record! {
    /// Trim set on the supervisor
    #[derive(Debug, Clone, PartialEq)]
    pub struct TrimInput {
        pub owner: EntityId,
        #[wire(array_max = 256)]
        pub payload: Vec<u8>,
    }
}

wire_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MessageKind {
        Mutation = 0,
        Correction = 1,
        Input = 2,
    }
}

wire_record! {
    /// Frame payload exchanged between supervisor and simulation
    #[derive(Debug, Clone, PartialEq)]
    pub struct HostMessage {
        pub kind: MessageKind,
        pub mutation: Option<SpawnOrRemove>,
        pub correction: Option<Correction>,
        pub input: Option<TrimInput>,
    }
}

impl HostMessage {
    pub fn mutation(record: SpawnOrRemove) -> Self {
        Self {
            kind: MessageKind::Mutation,
            mutation: Some(record),
            correction: None,
            input: None,
        }
    }

    pub fn correction(correction: Correction) -> Self {
        Self {
            kind: MessageKind::Correction,
            mutation: None,
            correction: Some(correction),
            input: None,
        }
    }

    pub fn input(input: TrimInput) -> Self {
        Self {
            kind: MessageKind::Input,
            mutation: None,
            correction: None,
            input: Some(input),
        }
    }
}

fn is_vessel_spawn(record: &SpawnOrRemove) -> bool {
    matches!(&record.spawn, Some(info) if info.kind == DescriptorKind::Vessel)
}

/// Register trim buffers for new vessels
fn track_vessels(step: &mut SimulationStep, report: &StepReport, correction_delay: f32) {
    for record in report.mutations.iter().filter(|r| is_vessel_spawn(r)) {
        step.register(
            record.entity_id,
            ReconciliationBuffer::with_delay(TrimState::default(), correction_delay),
        );
    }
}

fn vessel_ids(world: &World) -> Vec<EntityId> {
    let mut ids: Vec<EntityId> = world
        .ids()
        .filter(|id| {
            world
                .get(*id)
                .is_some_and(|e| e.kind == EntityKind::Vessel)
        })
        .collect();
    ids.sort();
    ids
}

fn random_position(rng: &mut StdRng) -> Vec2 {
    Vec2::new(rng.gen_range(-5000.0..5000.0), rng.gen_range(-3000.0..0.0))
}

fn random_trim(rng: &mut StdRng) -> TrimState {
    TrimState {
        ballast: rng.gen_range(0..=100),
        throttle: rng.gen_range(-1.0..=1.0),
    }
}

/// Queue some random gameplay for this tick
fn enqueue_gameplay(queue: &mut MutationQueue, world: &World, vessels: &[EntityId], rng: &mut StdRng) {
    if vessels.len() < 3 && rng.gen_bool(0.02) {
        queue.enqueue_spawn(
            SpawnDescriptor::Vessel {
                name: format!("Vessel-{}", rng.gen_range(100..1000)),
                position: random_position(rng),
            },
            None,
        );
    }

    if rng.gen_bool(0.1) {
        let prefab = ITEM_PREFABS[rng.gen_range(0..ITEM_PREFABS.len())];
        let descriptor = match vessels.get(rng.gen_range(0..=vessels.len())) {
            Some(&container) => SpawnDescriptor::ItemInContainer {
                prefab: prefab.into(),
                container,
                slot: None,
                force: rng.gen_bool(0.1),
            },
            None => SpawnDescriptor::ItemAt {
                prefab: prefab.into(),
                position: random_position(rng),
            },
        };
        queue.enqueue_spawn(descriptor, None);
    }

    if rng.gen_bool(0.03) {
        let species = CREATURES[rng.gen_range(0..CREATURES.len())];
        queue.enqueue_spawn(
            SpawnDescriptor::Creature {
                species: species.into(),
                position: random_position(rng),
            },
            None,
        );
    }

    if rng.gen_bool(0.05) && world.len() > 8 {
        let ids: Vec<EntityId> = world.ids().collect();
        let target = ids[rng.gen_range(0..ids.len())];
        queue.enqueue_removal(target, world);
    }
}

/// Input messages for every vessel whose trim changed since the last call
fn collect_inputs(step: &mut SimulationStep, world: &World) -> Result<Vec<HostMessage>, EncodeError> {
    let mut inputs = Vec::new();
    for vessel in vessel_ids(world) {
        let Some(buffer) = step.buffer_mut::<TrimState>(vessel) else {
            continue;
        };
        if let Some(payload) = buffer.take_unsent()? {
            inputs.push(HostMessage::input(TrimInput {
                owner: vessel,
                payload,
            }));
        }
    }
    Ok(inputs)
}

/// Apply supervisor input to the authoritative trim
fn apply_input(step: &mut SimulationStep, frame: &[u8]) {
    let input = match codec::decode::<HostMessage>(frame) {
        Ok(HostMessage {
            kind: MessageKind::Input,
            input: Some(input),
            ..
        }) => input,
        Ok(message) => {
            warn!(kind = ?message.kind, "Unexpected message from supervisor");
            return;
        }
        Err(e) => {
            warn!(error = %e, "Discarding malformed frame");
            return;
        }
    };

    let trim = match codec::decode::<TrimState>(&input.payload) {
        Ok(trim) => trim,
        Err(e) => {
            warn!(owner = %input.owner, error = %e, "Discarding malformed trim input");
            return;
        }
    };
    match step.buffer_mut::<TrimState>(input.owner) {
        Some(buffer) => buffer.predict(trim),
        None => debug!(owner = %input.owner, "Input for unknown vessel"),
    }
}

fn send(relay: &ProcessRelay, message: &HostMessage) -> anyhow::Result<()> {
    let bytes = codec::encode(message)?;
    relay.write(&bytes)?;
    Ok(())
}

/// Authoritative simulation loop
pub async fn run_simulation(config: HostConfig) -> anyhow::Result<()> {
    let address = config
        .relay_address
        .clone()
        .context("simulation role requires a relay address")?;
    let stream = std::net::TcpStream::connect(&address)
        .with_context(|| format!("failed to connect to supervisor at {address}"))?;

    let relay = ProcessRelay::new(config.relay());
    relay.start(stream)?;
    info!(%address, "Connected to supervisor");

    let stats = Arc::new(TickStats::new());
    let mut world = World::new();
    let mut step = SimulationStep::new(MutationQueue::new(Authority::Server)).with_stats(Arc::clone(&stats));
    let mut rng = StdRng::from_entropy();
    let mut sequence = SequenceId::ZERO;
    let mut last_broadcast = 0.0f64;
    let dt = 1.0 / config.tick_rate as f32;

    let mut interval = tokio::time::interval(config.tick_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                while let Some(frame) = relay.try_read() {
                    if !frame.is_empty() {
                        apply_input(&mut step, &frame);
                    }
                }

                let vessels = vessel_ids(&world);
                enqueue_gameplay(step.queue_mut(), &world, &vessels, &mut rng);
                for &vessel in &vessels {
                    if rng.gen_bool(0.05) {
                        if let Some(buffer) = step.buffer_mut::<TrimState>(vessel) {
                            buffer.predict(random_trim(&mut rng));
                        }
                    }
                }

                let report = step.step(&mut world, dt);
                track_vessels(&mut step, &report, 0.0);
                for record in &report.mutations {
                    debug!(entity = %record.entity_id, remove = record.remove, "Replicating mutation");
                    send(&relay, &HostMessage::mutation(record.clone()))?;
                }

                let now = step.tick() as f64 * dt as f64;
                if now - last_broadcast >= TRIM_BROADCAST_INTERVAL {
                    last_broadcast = now;
                    for vessel in vessel_ids(&world) {
                        let Some(buffer) = step.buffer::<TrimState>(vessel) else {
                            continue;
                        };
                        sequence = sequence.next();
                        let payload = codec::encode(buffer.value())?;
                        send(&relay, &HostMessage::correction(Correction {
                            owner: vessel,
                            sequence,
                            sent_at: now,
                            payload,
                        }))?;
                    }
                }

                if relay.has_shut_down() {
                    warn!("Relay to supervisor closed");
                    break;
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    relay.shutdown();
    info!(ticks = step.tick(), entities = world.len(), "Simulation stopped");
    debug!("\n{}{}", stats.render(), relay.stats().render());
    Ok(())
}

/// Apply one frame from the simulation
fn handle_message(step: &mut SimulationStep, frame: &[u8]) {
    let message = match codec::decode::<HostMessage>(frame) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Discarding malformed frame");
            return;
        }
    };

    match (message.kind, message.mutation, message.correction) {
        (MessageKind::Mutation, Some(record), _) => {
            info!(
                entity = %record.entity_id,
                remove = record.remove,
                identifier = record.spawn.as_ref().map(|s| s.identifier.as_str()).unwrap_or(""),
                container = ?record.container_id,
                "Replicated mutation"
            );
            step.queue_mut().enqueue_remote(record);
        }
        (MessageKind::Correction, _, Some(correction)) => {
            match step.buffer_mut::<TrimState>(correction.owner) {
                Some(buffer) => {
                    buffer.receive(correction.payload, correction.sequence, correction.sent_at);
                }
                None => debug!(owner = %correction.owner, "Correction for untracked vessel"),
            }
        }
        (kind, _, _) => warn!(?kind, "Unexpected message from simulation"),
    }
}

/// Launch the simulation child and mirror its world
pub async fn run_supervisor(config: HostConfig) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;

    let mut child = tokio::process::Command::new(std::env::current_exe()?)
        .env("RELAY_ROLE", "simulation")
        .env("RELAY_ADDRESS", address.to_string())
        .kill_on_drop(true)
        .spawn()
        .context("failed to launch simulation process")?;
    info!(%address, pid = child.id(), "Simulation launched");

    let stream = tokio::select! {
        accepted = listener.accept() => accepted?.0,
        status = child.wait() => {
            anyhow::bail!("simulation exited before connecting: {:?}", status?);
        }
        _ = tokio::time::sleep(Duration::from_secs(config.read_timeout_secs)) => {
            anyhow::bail!("simulation did not connect within {}s", config.read_timeout_secs);
        }
    };
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;

    let relay = ProcessRelay::new(config.relay());
    relay.start(stream)?;

    let stats = Arc::new(TickStats::new());
    let mut world = World::new();
    let mut step = SimulationStep::new(MutationQueue::new(Authority::Client)).with_stats(Arc::clone(&stats));
    let mut rng = StdRng::from_entropy();
    let dt = 1.0 / config.tick_rate as f32;
    let correction_delay = config.correction_delay();

    let mut interval = tokio::time::interval(config.tick_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                while let Some(frame) = relay.try_read() {
                    if !frame.is_empty() {
                        handle_message(&mut step, &frame);
                    }
                }

                // Local input on the vessels we know about
                for vessel in vessel_ids(&world) {
                    if rng.gen_bool(0.02) {
                        if let Some(buffer) = step.buffer_mut::<TrimState>(vessel) {
                            buffer.predict(random_trim(&mut rng));
                        }
                    }
                }

                for input in collect_inputs(&mut step, &world)? {
                    send(&relay, &input)?;
                }

                let report = step.step(&mut world, dt);
                track_vessels(&mut step, &report, correction_delay);
                if report.corrections_applied > 0 {
                    debug!(applied = report.corrections_applied, "Trim corrections applied");
                }

                if relay.has_shut_down() {
                    warn!("Relay to simulation closed");
                    break;
                }
            }
            status = child.wait() => {
                let status = status?;
                info!(?status, "Simulation exited");
                break;
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    relay.shutdown();
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Simulation already stopped");
    }
    info!(ticks = step.tick(), entities = world.len(), "Supervisor stopped");
    debug!("\n{}{}", stats.render(), relay.stats().render());
    Ok(())
}

/// Encoded size of a mutation message, for logging and benches
pub fn message_size(record: &SpawnOrRemove) -> Result<usize, EncodeError> {
    Ok(codec::encode(&HostMessage::mutation(record.clone()))?.len())
}
