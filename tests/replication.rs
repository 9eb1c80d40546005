//! End-to-end replication across a relay pair

use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use abyss_replication::game::reconcile::{ReconcileState, ReconciliationBuffer};
use abyss_replication::game::spawner::{Authority, MutationQueue};
use abyss_replication::game::step::SimulationStep;
use abyss_replication::game::world::{EntityRegistry, SpawnDescriptor, World};
use abyss_replication::host::{Correction, HostMessage, MessageKind, TrimState};
use abyss_replication::net::codec;
use abyss_replication::net::relay::{ProcessRelay, RelayConfig};
use abyss_replication::net::sequence::SequenceId;
use abyss_replication::util::vec2::Vec2;

fn relay_pair() -> (ProcessRelay, ProcessRelay) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();

    let config = RelayConfig {
        heartbeat_interval: Duration::from_millis(50),
        read_timeout: Duration::from_secs(5),
        write_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
    };
    let simulation = ProcessRelay::new(config);
    let supervisor = ProcessRelay::new(config);
    simulation.start(server).unwrap();
    supervisor.start(client).unwrap();
    (simulation, supervisor)
}

/// Collect `count` non-heartbeat messages
fn receive(relay: &ProcessRelay, count: usize) -> Vec<HostMessage> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut messages = Vec::new();
    while messages.len() < count {
        assert!(Instant::now() < deadline, "only {} of {count} messages arrived", messages.len());
        match relay.try_read() {
            Some(frame) if frame.is_empty() => {}
            Some(frame) => messages.push(codec::decode(&frame).unwrap()),
            None => thread::sleep(Duration::from_millis(5)),
        }
    }
    messages
}

fn replay(step: &mut SimulationStep, messages: Vec<HostMessage>) {
    for message in messages {
        assert_eq!(message.kind, MessageKind::Mutation);
        step.queue_mut().enqueue_remote(message.mutation.unwrap());
    }
}

#[test]
fn test_world_mirrors_through_relay() {
    let (relay_out, relay_in) = relay_pair();
    let mut server_world = World::new();
    let mut server = SimulationStep::new(MutationQueue::new(Authority::Server));
    let mut client_world = World::new();
    let mut client = SimulationStep::new(MutationQueue::new(Authority::Client));

    server.queue_mut().enqueue_spawn(
        SpawnDescriptor::Vessel {
            name: "Humpback".into(),
            position: Vec2::new(10.0, -20.0),
        },
        None,
    );
    let report = server.step(&mut server_world, 0.0);
    let vessel = report.mutations[0].entity_id;

    for prefab in ["wrench", "flare", "oxygentank"] {
        server.queue_mut().enqueue_spawn(
            SpawnDescriptor::ItemInContainer {
                prefab: prefab.into(),
                container: vessel,
                slot: None,
                force: false,
            },
            None,
        );
    }
    let items = server.step(&mut server_world, 0.0).mutations;

    for record in report.mutations.iter().chain(&items) {
        relay_out.write(&codec::encode(&HostMessage::mutation(record.clone())).unwrap()).unwrap();
    }

    replay(&mut client, receive(&relay_in, 4));
    let mirrored = client.step(&mut client_world, 0.0);
    assert_eq!(mirrored.spawns(), 4);
    assert_eq!(client_world.len(), server_world.len());
    for item in &items {
        assert_eq!(
            client_world.placement(item.entity_id),
            server_world.placement(item.entity_id)
        );
    }
    assert_eq!(client_world.get(vessel).unwrap().identifier, "Humpback");

    // Removing the vessel takes its contents with it
    server.queue_mut().enqueue_removal(vessel, &server_world);
    let removals = server.step(&mut server_world, 0.0).mutations;
    assert_eq!(removals.len(), 4);
    assert_eq!(removals.last().unwrap().entity_id, vessel);
    for record in &removals {
        relay_out.write(&codec::encode(&HostMessage::mutation(record.clone())).unwrap()).unwrap();
    }

    replay(&mut client, receive(&relay_in, 4));
    let mirrored = client.step(&mut client_world, 0.0);
    assert_eq!(mirrored.removals(), 4);
    assert!(client_world.is_empty());
    assert!(server_world.is_empty());

    relay_out.shutdown();
    relay_in.shutdown();
}

#[test]
fn test_corrections_settle_after_delay() {
    let (relay_out, relay_in) = relay_pair();
    let mut world = World::new();
    let mut client = SimulationStep::new(MutationQueue::new(Authority::Client));

    let vessel = abyss_replication::game::spawner::SpawnOrRemove::spawned(
        abyss_replication::game::world::EntityId(7),
        abyss_replication::game::world::EntityId(7),
        &SpawnDescriptor::Vessel {
            name: "Remora".into(),
            position: Vec2::ZERO,
        },
        None,
    );
    client.queue_mut().enqueue_remote(vessel.clone());
    client.step(&mut world, 0.0);
    client.register(vessel.entity_id, ReconciliationBuffer::with_delay(TrimState::default(), 0.5));

    let predicted = TrimState {
        ballast: 20,
        throttle: 0.5,
    };
    client.buffer_mut::<TrimState>(vessel.entity_id).unwrap().predict(predicted.clone());

    let authoritative = TrimState {
        ballast: 80,
        throttle: -1.0,
    };
    for (sequence, ballast) in [(1u16, 10), (2, authoritative.ballast)] {
        let payload = codec::encode(&TrimState {
            ballast,
            throttle: authoritative.throttle,
        })
        .unwrap();
        let message = HostMessage::correction(Correction {
            owner: vessel.entity_id,
            sequence: SequenceId(sequence),
            sent_at: sequence as f64,
            payload,
        });
        relay_out.write(&codec::encode(&message).unwrap()).unwrap();
    }

    for message in receive(&relay_in, 2) {
        let correction = message.correction.unwrap();
        client
            .buffer_mut::<TrimState>(correction.owner)
            .unwrap()
            .receive(correction.payload, correction.sequence, correction.sent_at);
    }

    let buffer = client.buffer::<TrimState>(vessel.entity_id).unwrap();
    assert_eq!(buffer.state(), ReconcileState::CorrectionPending);
    assert_eq!(buffer.pending().unwrap().sequence, SequenceId(2));
    assert_eq!(buffer.value(), &predicted);

    let report = client.step(&mut world, 0.25);
    assert_eq!(report.corrections_applied, 0);
    let report = client.step(&mut world, 0.25);
    assert_eq!(report.corrections_applied, 1);
    assert_eq!(client.buffer::<TrimState>(vessel.entity_id).unwrap().value(), &authoritative);

    relay_out.shutdown();
    relay_in.shutdown();
}
