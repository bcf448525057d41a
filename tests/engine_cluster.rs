//! End-to-end engine tests against a mock three-master cluster.

mod common;

use bytes::Bytes;
use common::MockServer;

use rdbshift::{
    EngineOptions, Event, MigrationEngine, RecordType, Target, VecSource,
};

/// Three masters with the canonical even slot split.
async fn three_master_cluster() -> (Vec<MockServer>, Target) {
    let mocks = vec![
        MockServer::start().await,
        MockServer::start().await,
        MockServer::start().await,
    ];
    let ranges = ["0-5460", "5461-10922", "10923-16383"];
    let conf: String = mocks
        .iter()
        .zip(ranges)
        .enumerate()
        .map(|(i, (mock, range))| {
            format!(
                "node{} 127.0.0.1:{} master - 0 0 {} connected {}\n",
                i,
                mock.port(),
                i + 1,
                range
            )
        })
        .collect();
    let target = Target::cluster_from_conf(&conf).expect("cluster conf");
    (mocks, target)
}

fn kv(key: &'static str) -> Event {
    Event::KeyValue {
        db: 0,
        key: Bytes::from_static(key.as_bytes()),
        rtype: RecordType::String,
        ttl_ms: 0,
        dump: vec![Bytes::from_static(b"v")],
    }
}

#[tokio::test]
async fn test_hash_tag_keys_land_on_one_owner_and_lane() {
    let (mocks, target) = three_master_cluster().await;
    let mut options = EngineOptions::new(target);
    options.config.migrate_threads = 2;

    // {u} hashes to slot 5474 → the second master.
    let events = vec![
        Event::BeginRdb,
        kv("{u}:a"),
        kv("{u}:b"),
        Event::EndRdb,
    ];
    let report = MigrationEngine::new(options)
        .unwrap()
        .run(VecSource::new(events))
        .await
        .unwrap();

    assert_eq!(report.restored, 2);
    assert!(mocks[0].commands_named("RESTORE").is_empty());
    assert!(mocks[2].commands_named("RESTORE").is_empty());

    let restores = mocks[1].commands_named("RESTORE");
    assert_eq!(restores.len(), 2);
    // Same slot → same lane → same connection, in submission order.
    assert_eq!(restores[0].conn, restores[1].conn);
    assert_eq!(restores[0].arg(1), b"{u}:a");
    assert_eq!(restores[1].arg(1), b"{u}:b");
}

#[tokio::test]
async fn test_cross_slot_command_is_dropped() {
    let (mocks, target) = three_master_cluster().await;
    let options = EngineOptions::new(target);

    let events = vec![
        Event::BeginRdb,
        // "a" and "b" hash to different slots: rejected in cluster mode.
        Event::Command {
            db: 0,
            argv: vec![
                Bytes::from("MSET"),
                Bytes::from("a"),
                Bytes::from("1"),
                Bytes::from("b"),
                Bytes::from("2"),
            ],
        },
        // Same-slot traffic keeps flowing.
        kv("{u}:x"),
        Event::EndRdb,
    ];
    let report = MigrationEngine::new(options)
        .unwrap()
        .run(VecSource::new(events))
        .await
        .unwrap();

    assert_eq!(report.dropped_cross_slot, 1);
    assert!(report.failures >= 1);
    assert_eq!(report.commands, 0);
    assert_eq!(report.restored, 1);
    assert!(!report.is_clean());

    for mock in &mocks {
        assert!(mock.commands_named("MSET").is_empty());
    }
    assert_eq!(mocks[1].commands_named("RESTORE").len(), 1);
}

#[tokio::test]
async fn test_same_slot_multikey_command_routes_to_owner() {
    let (mocks, target) = three_master_cluster().await;
    let options = EngineOptions::new(target);

    let events = vec![
        Event::Command {
            db: 0,
            argv: vec![
                Bytes::from("MSET"),
                Bytes::from("{u}:a"),
                Bytes::from("1"),
                Bytes::from("{u}:b"),
                Bytes::from("2"),
            ],
        },
    ];
    let report = MigrationEngine::new(options)
        .unwrap()
        .run(VecSource::new(events))
        .await
        .unwrap();

    assert_eq!(report.commands, 1);
    assert_eq!(report.dropped_cross_slot, 0);
    assert_eq!(mocks[1].commands_named("MSET").len(), 1);
}

#[tokio::test]
async fn test_keyless_command_pins_to_default_owner() {
    let (mocks, target) = three_master_cluster().await;
    let options = EngineOptions::new(target);

    let events = vec![Event::Command {
        db: 0,
        argv: vec![Bytes::from("FLUSHALL")],
    }];
    let report = MigrationEngine::new(options)
        .unwrap()
        .run(VecSource::new(events))
        .await
        .unwrap();

    assert_eq!(report.commands, 1);
    // Slot 0's owner is the first master.
    assert_eq!(mocks[0].commands_named("FLUSHALL").len(), 1);
    assert!(mocks[1].commands_named("FLUSHALL").is_empty());
    assert!(mocks[2].commands_named("FLUSHALL").is_empty());
}
