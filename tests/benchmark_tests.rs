//! Performance benchmarks for the session layer's hot paths

use client::config::ClientConfig;
use client::snapshots::apply_entity_deltas;
use client::state::{ClientState, ConnState};
use server::config::ServerConfig;
use server::game::LocalGame;
use server::snapshot::delta_entities;
use server::state::ServerState;
use shared::message::{EntityState, ServerMessage, ServerOp, SnapshotMessage};
use shared::netchan::{NetChan, NetSource};
use shared::reliable::{ReliableReceiver, ReliableSender};
use shared::{Args, InfoMap, NetAddress};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;

fn address(last: u8, port: u16) -> NetAddress {
    NetAddress::Ip(SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, last), port))
}

fn entities(count: u16, shift: i32) -> Vec<EntityState> {
    (0..count)
        .map(|number| EntityState {
            number,
            entity_type: 2,
            origin: [i32::from(number) * 10 + shift, 0, 0],
            ..Default::default()
        })
        .collect()
}

/// Benchmarks entity delta encoding and decoding
#[test]
fn benchmark_entity_deltas() {
    let baselines: BTreeMap<u16, EntityState> = entities(256, 0).into_iter().map(|e| (e.number, e)).collect();
    let old = entities(256, 0);
    let new = entities(256, 5);

    let iterations = 1_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let deltas = delta_entities(&old, &new, &baselines);
        let rebuilt = apply_entity_deltas(&old, &deltas, &baselines);
        assert_eq!(rebuilt.len(), new.len());
    }

    let duration = start.elapsed();
    println!(
        "Entity deltas: {} iterations of 256 entities in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks server message encoding with a full snapshot
#[test]
fn benchmark_message_encoding() {
    let message = ServerMessage {
        reliable_acknowledge: 10,
        ops: vec![ServerOp::Snapshot(SnapshotMessage {
            server_time: 123_456,
            delta_num: 0,
            snap_flags: 0,
            player_state: Default::default(),
            entities: delta_entities(&[], &entities(128, 1), &BTreeMap::new()),
        })],
    };

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let bytes = message.encode().unwrap();
        let decoded = ServerMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.ops.len(), 1);
    }

    let duration = start.elapsed();
    println!(
        "Message encoding: {} round trips in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 3000);
}

/// Benchmarks sequenced channel framing
#[test]
fn benchmark_netchan_throughput() {
    let mut sender = NetChan::new(NetSource::Client, address(1, 27960), 4242);
    let mut receiver = NetChan::new(NetSource::Server, address(2, 27961), 4242);
    let payload = vec![0xabu8; 1200];

    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let packet = sender.transmit(&payload);
        let received = receiver.process(&packet).unwrap();
        assert_eq!(received.map(<[u8]>::len), Some(payload.len()));
    }

    let duration = start.elapsed();
    println!(
        "Netchan: {} packets in {:?} ({:.2} ns/packet)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert_eq!(receiver.dropped, 0);
    assert!(duration.as_millis() < 2000);
}

/// Stress test: keeps the reliable window full while acknowledging
#[test]
fn stress_test_reliable_window() {
    let mut sender = ReliableSender::new();
    let mut receiver = ReliableReceiver::new();

    let iterations = 200_000;
    let start = Instant::now();

    for n in 0..iterations {
        let sequence = sender.push(&format!("cmd {}", n)).unwrap();
        receiver.store(sequence, &format!("cmd {}", n));
        // acknowledge in bursts so the backlog keeps moving
        if n % 64 == 63 {
            assert!(sender.set_acknowledge(receiver.sequence()));
        }
    }

    let duration = start.elapsed();
    println!("Reliable window: {} commands in {:?}", iterations, duration);

    assert_eq!(receiver.sequence(), iterations);
    assert!(duration.as_millis() < 3000);
}

/// Benchmarks userinfo parsing and command tokenizing
#[test]
fn benchmark_text_parsing() {
    let mut info = InfoMap::new();
    for n in 0..16 {
        info.set(&format!("key{}", n), &format!("value {}", n));
    }
    let userinfo = info.to_string();
    let line = format!("connect {}", shared::args::escape(&userinfo));

    let iterations = 50_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let args = Args::parse(&line);
        let parsed = InfoMap::parse(args.argv(1));
        assert_eq!(parsed.value_for("key15"), "value 15");
    }

    let duration = start.elapsed();
    println!(
        "Text parsing: {} connect lines in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 3000);
}

/// Stress test: a full server with sixteen clients for ten seconds
#[test]
fn stress_test_full_server() {
    let config = ServerConfig {
        max_clients: 16,
        ..Default::default()
    };
    let mut server = ServerState::new(config, Box::new(LocalGame::new()), 0).unwrap();
    let server_address = address(1, 27960);
    let mut clients: Vec<(NetAddress, ClientState)> = (0..16u16)
        .map(|n| {
            let mut client = ClientState::new(ClientConfig {
                name: format!("Bot{}", n),
                qport: n,
                ..Default::default()
            });
            client.connect(server_address, 0);
            (address(100 + n as u8, 30000 + n), client)
        })
        .collect();

    let start = Instant::now();
    let mut now = 0;
    while now < 10_000 {
        now += 10;
        server.frame(now).unwrap();
        for packet in server.drain_outgoing() {
            if let Some((_, client)) = clients.iter_mut().find(|(addr, _)| *addr == packet.to) {
                client.packet_event(server_address, &packet.data, now);
            }
        }
        for (addr, client) in clients.iter_mut() {
            client.frame(now);
            client.drain_events();
            for packet in client.drain_outgoing() {
                if packet.to == server_address {
                    server.packet_event(*addr, &packet.data, now);
                }
            }
        }
    }

    let duration = start.elapsed();
    println!("Full server: 10s of game time for 16 clients in {:?}", duration);

    assert!(clients.iter().all(|(_, c)| c.state() == ConnState::Active));
    assert!(duration.as_millis() < 10_000);
}
