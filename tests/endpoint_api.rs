//! Direct endpoint API tests: handshake, batching, FIFO drains.

mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::{Behavior, MockServer};

use rdbshift::metrics::EngineStats;
use rdbshift::resp::{Arg, Reply};
use rdbshift::{Endpoint, EndpointOptions};

fn plain(parts: &[&'static str]) -> Vec<Arg> {
    parts.iter().map(|s| Arg::from(*s)).collect()
}

async fn open(mock: &MockServer, opts: EndpointOptions) -> Endpoint {
    Endpoint::open("127.0.0.1", mock.port(), 0, opts, Arc::new(EngineStats::default()))
        .await
        .expect("open endpoint")
}

#[tokio::test]
async fn test_handshake_pings_and_selects() {
    let mock = MockServer::start().await;
    let endpoint = open(&mock, EndpointOptions::default()).await;
    assert_eq!(endpoint.db(), 0);
    assert_eq!(mock.command_names(), vec!["PING", "SELECT"]);
    assert_eq!(endpoint.address(), format!("127_0_0_1_{}", mock.port()));
}

#[tokio::test]
async fn test_auth_error_reply_is_fatal() {
    let mock = MockServer::start_scripted(|argv| {
        if argv[0].eq_ignore_ascii_case(b"AUTH") {
            Behavior::Error("WRONGPASS invalid username-password pair")
        } else {
            Behavior::Default
        }
    })
    .await;
    let opts = EndpointOptions {
        auth_password: Some("nope".into()),
        ..EndpointOptions::default()
    };
    let err = Endpoint::open(
        "127.0.0.1",
        mock.port(),
        0,
        opts,
        Arc::new(EngineStats::default()),
    )
    .await
    .unwrap_err();
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_sync_returns_replies_in_fifo_order() {
    let mock = MockServer::start_scripted(|argv| {
        if argv[0].eq_ignore_ascii_case(b"INCR") {
            let n = match argv[1].as_ref() {
                b"a" => 1,
                b"b" => 2,
                _ => 3,
            };
            Behavior::Integer(n)
        } else {
            Behavior::Default
        }
    })
    .await;

    let opts = EndpointOptions {
        pipe_budget: -1,
        flush_per_command: false,
        ..EndpointOptions::default()
    };
    let mut endpoint = open(&mock, opts).await;

    endpoint.batch(false, &plain(&["INCR", "a"])).await.unwrap();
    endpoint.batch(false, &plain(&["INCR", "b"])).await.unwrap();
    endpoint.batch(false, &plain(&["INCR", "c"])).await.unwrap();
    assert_eq!(endpoint.inflight(), 3);

    let replies = endpoint.sync().await.unwrap();
    assert_eq!(
        replies,
        vec![Reply::Integer(1), Reply::Integer(2), Reply::Integer(3)]
    );
    assert_eq!(endpoint.inflight(), 0);
}

#[tokio::test]
async fn test_pipe_budget_bounds_inflight() {
    let mock = MockServer::start().await;
    let opts = EndpointOptions {
        pipe_budget: 2,
        flush_per_command: false,
        ..EndpointOptions::default()
    };
    let mut endpoint = open(&mock, opts).await;

    for i in 0..7u8 {
        let key = Bytes::from(format!("k{}", i));
        let argv = [Arg::from("SET"), Arg::Plain(key), Arg::from("v")];
        endpoint.batch(false, &argv).await.unwrap();
        // Auto-drain keeps the batch within budget at every step.
        assert!(endpoint.inflight() <= 2);
    }
    endpoint.flush().await.unwrap();
    assert_eq!(endpoint.inflight(), 0);
    assert_eq!(mock.commands_named("SET").len(), 7);
}

#[tokio::test]
async fn test_send_drains_pending_batch_first() {
    let mock = MockServer::start().await;
    let opts = EndpointOptions {
        pipe_budget: -1,
        flush_per_command: false,
        ..EndpointOptions::default()
    };
    let mut endpoint = open(&mock, opts).await;

    endpoint.batch(false, &plain(&["SET", "k", "v"])).await.unwrap();
    // The single-shot reply must be PING's, not the batched SET's.
    let reply = endpoint.send(&[Bytes::from_static(b"PING")]).await.unwrap();
    assert_eq!(reply, Reply::Simple(Bytes::from("PONG")));
    assert_eq!(endpoint.inflight(), 0);

    let names = mock.command_names();
    assert_eq!(names[names.len() - 2..].to_vec(), vec!["SET", "PING"]);
}

#[tokio::test]
async fn test_error_reply_does_not_break_the_batch() {
    let mock = MockServer::start_scripted(|argv| {
        if argv[0].eq_ignore_ascii_case(b"SET") && argv[1].as_ref() == b"bad" {
            Behavior::Error("WRONGTYPE Operation against a key holding the wrong kind of value")
        } else {
            Behavior::Default
        }
    })
    .await;
    let stats = Arc::new(EngineStats::default());
    let opts = EndpointOptions {
        pipe_budget: -1,
        flush_per_command: false,
        ..EndpointOptions::default()
    };
    let mut endpoint = Endpoint::open("127.0.0.1", mock.port(), 0, opts, stats.clone())
        .await
        .unwrap();

    endpoint.batch(false, &plain(&["SET", "ok1", "v"])).await.unwrap();
    endpoint.batch(false, &plain(&["SET", "bad", "v"])).await.unwrap();
    endpoint.batch(false, &plain(&["SET", "ok2", "v"])).await.unwrap();
    endpoint.flush().await.unwrap();

    let snap = stats.snapshot();
    assert_eq!(snap.successes, 2);
    assert_eq!(snap.failures, 1);
}
