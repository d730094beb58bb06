//! Integration tests for the daemon and client over loopback QUIC.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test daemon_client -- --nocapture

use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use serde_json::json;
use tns::{
    Client, ClientOptions, Command, Daemon, DaemonStores, HostConfig, Identity, Keypair,
    MemoryContentStore, MemoryKeyStore, MemoryZoneStore, NOT_MANAGED, QueryResponse, Request,
    StaticResolver, TnsError, ZoneCreation, ZoneRequest,
};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("warn")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct Harness {
    daemon: Arc<Daemon>,
    daemon_id: Identity,
    client: Client,
    cancel: CancellationToken,
    run: JoinHandle<tns::Result<()>>,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(HostConfig::default()).await
    }

    async fn start_with(daemon_config: HostConfig) -> Self {
        init_tracing();

        let content = Arc::new(MemoryContentStore::new());
        let stores = DaemonStores {
            keys: Arc::new(MemoryKeyStore::new()),
            content: content.clone(),
            zones: Arc::new(MemoryZoneStore::new()),
        };
        let daemon = Arc::new(
            Daemon::new(Keypair::generate(), daemon_config, stores)
                .await
                .expect("daemon bind failed"),
        );
        daemon.bind_handlers().await;

        let cancel = CancellationToken::new();
        let run = {
            let daemon = daemon.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { daemon.run(cancel).await })
        };

        let opts = ClientOptions::new(content).with_resolver(Arc::new(StaticResolver::new()));
        let client = Client::new(opts).await.expect("client bind failed");

        let address = daemon.reachable_address(0).expect("daemon address");
        let daemon_id = client.add_peer(&address.to_string()).await.expect("add daemon");
        assert_eq!(daemon_id, daemon.peer_id());

        Self {
            daemon,
            daemon_id,
            client,
            cancel,
            run,
        }
    }

    async fn create(&self, name: &str) -> tns::CreatedZone {
        self.daemon
            .create_zone(&ZoneCreation {
                name: name.to_string(),
                manager_key_name: "postables-3072".to_string(),
                zone_key_name: format!("{name}-key"),
            })
            .await
            .expect("create_zone failed")
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        self.run.await.expect("run task panicked").expect("run failed");
        self.client.close().await;
    }
}

fn zone_request(name: &str) -> Request {
    Request::Zone(ZoneRequest {
        user_name: "postables".to_string(),
        zone_name: name.to_string(),
        zone_manager_key_name: "postables-3072".to_string(),
    })
}

#[tokio::test]
async fn echo_repeats_payload() {
    let h = Harness::start().await;

    let response = timeout(
        TEST_TIMEOUT,
        h.client.query_tns(&h.daemon_id, "echo", Some(json!("ping"))),
    )
    .await
    .expect("echo timed out")
    .expect("echo failed");

    let QueryResponse::Echo(text) = response else {
        panic!("expected echo response, got {:?}", response);
    };
    assert!(text.starts_with("echo test...\n"));
    assert!(text.contains("you sent: \"ping\"\n"));

    h.shutdown().await;
}

#[tokio::test]
async fn echo_uses_default_text() {
    let h = Harness::start().await;

    let response = h.client.query_tns(&h.daemon_id, "echo", None).await.unwrap();
    assert!(matches!(response, QueryResponse::Echo(ref t) if t.contains("hello from tns client")));

    h.shutdown().await;
}

#[tokio::test]
async fn zone_request_returns_created_hash() {
    let h = Harness::start().await;
    let created = h.create("example").await;

    let raw = h
        .client
        .query_raw(&h.daemon_id, &zone_request("example"))
        .await
        .unwrap();
    assert_eq!(String::from_utf8(raw).unwrap(), created.hash);

    let response = h.client.query(&h.daemon_id, zone_request("example")).await.unwrap();
    let QueryResponse::Zone { hash, zone } = response else {
        panic!("expected zone response, got {:?}", response);
    };
    assert_eq!(hash, created.hash);
    assert_eq!(zone.name, "example");
    assert_eq!(zone.public_key, created.zone_id.to_hex());
    assert_eq!(zone.manager.public_key, h.daemon_id.to_hex());

    h.shutdown().await;
}

#[tokio::test]
async fn default_zone_request_finds_default_zone() {
    let h = Harness::start().await;
    let created = h.create("myzone").await;

    let response = h.client.query_tns(&h.daemon_id, "zone-request", None).await.unwrap();
    assert!(matches!(response, QueryResponse::Zone { ref hash, .. } if *hash == created.hash));

    h.shutdown().await;
}

#[tokio::test]
async fn unknown_zone_yields_not_managed() {
    let h = Harness::start().await;

    let raw = h
        .client
        .query_raw(&h.daemon_id, &zone_request("nowhere"))
        .await
        .unwrap();
    assert_eq!(raw, NOT_MANAGED.as_bytes());

    let response = h.client.query(&h.daemon_id, zone_request("nowhere")).await.unwrap();
    assert_eq!(response, QueryResponse::NotManaged);

    h.shutdown().await;
}

#[tokio::test]
async fn duplicate_creation_keeps_first_hash() {
    let h = Harness::start().await;
    let first = h.create("example").await;

    let err = h
        .daemon
        .create_zone(&ZoneCreation {
            name: "example".to_string(),
            manager_key_name: "postables-3072".to_string(),
            zone_key_name: "other-key".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TnsError::AlreadyManaged(_)));

    let raw = h
        .client
        .query_raw(&h.daemon_id, &zone_request("example"))
        .await
        .unwrap();
    assert_eq!(String::from_utf8(raw).unwrap(), first.hash);

    h.shutdown().await;
}

#[tokio::test]
async fn record_request_is_not_implemented() {
    let h = Harness::start().await;

    let err = timeout(
        TEST_TIMEOUT,
        h.client.query_tns(&h.daemon_id, "record-request", None),
    )
    .await
    .expect("record request timed out")
    .unwrap_err();
    assert!(matches!(err, TnsError::NotImplemented), "got {:?}", err);

    h.shutdown().await;
}

#[tokio::test]
async fn malformed_zone_request_resets_stream() {
    let h = Harness::start().await;

    let mut stream = h
        .client
        .host()
        .open_stream(&h.daemon_id, Command::ZoneRequest.protocol_id())
        .await
        .unwrap();
    stream.write_all(b"{not json\n").await.unwrap();
    stream.close().unwrap();

    let err = stream.read_to_end().await.unwrap_err();
    assert!(
        matches!(err, TnsError::Transport(ref m) if m.contains("code 3")),
        "got {:?}",
        err
    );

    h.shutdown().await;
}

#[tokio::test]
async fn concurrent_creations_are_all_registered() {
    const N: usize = 16;
    let h = Harness::start().await;

    let tasks: Vec<_> = (0..N)
        .map(|i| {
            let daemon = h.daemon.clone();
            tokio::spawn(async move {
                daemon
                    .create_zone(&ZoneCreation {
                        name: format!("zone-{i}"),
                        manager_key_name: "postables-3072".to_string(),
                        zone_key_name: format!("zone-{i}-key"),
                    })
                    .await
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let zones = h.daemon.zones().await;
    assert_eq!(zones.len(), N);

    for i in 0..N {
        let name = format!("zone-{i}");
        let raw = h.client.query_raw(&h.daemon_id, &zone_request(&name)).await.unwrap();
        assert_eq!(String::from_utf8(raw).unwrap(), zones[&name]);
    }

    h.shutdown().await;
}

#[tokio::test]
async fn same_name_race_has_one_winner() {
    const N: usize = 8;
    let h = Harness::start().await;

    let tasks: Vec<_> = (0..N)
        .map(|i| {
            let daemon = h.daemon.clone();
            tokio::spawn(async move {
                daemon
                    .create_zone(&ZoneCreation {
                        name: "contested".to_string(),
                        manager_key_name: "postables-3072".to_string(),
                        zone_key_name: format!("contested-{i}"),
                    })
                    .await
            })
        })
        .collect();

    let mut winners = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => winners += 1,
            Err(TnsError::AlreadyManaged(_)) => {}
            Err(e) => panic!("unexpected error {:?}", e),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(h.daemon.zones().await.len(), 1);

    h.shutdown().await;
}

#[tokio::test]
async fn queries_run_concurrently_with_creation() {
    let h = Harness::start().await;
    h.create("stable").await;

    let creator = {
        let daemon = h.daemon.clone();
        tokio::spawn(async move {
            for i in 0..8 {
                daemon
                    .create_zone(&ZoneCreation {
                        name: format!("late-{i}"),
                        manager_key_name: "postables-3072".to_string(),
                        zone_key_name: format!("late-{i}-key"),
                    })
                    .await
                    .unwrap();
            }
        })
    };

    let stable = || h.client.query(&h.daemon_id, zone_request("stable"));
    let (a, b, c, d) = tokio::join!(stable(), stable(), stable(), stable());
    for response in [a, b, c, d] {
        assert!(matches!(response, Ok(QueryResponse::Zone { .. })));
    }

    creator.await.unwrap();
    assert_eq!(h.daemon.zones().await.len(), 9);

    h.shutdown().await;
}

#[tokio::test]
async fn unsupported_protocol_is_refused() {
    let h = Harness::start().await;

    let err = h
        .client
        .host()
        .open_stream(&h.daemon_id, "/zone/delete/0.0.1")
        .await
        .unwrap_err();
    assert!(
        matches!(err, TnsError::Transport(ref m) if m.contains("not supported")),
        "got {:?}",
        err
    );

    h.shutdown().await;
}

#[tokio::test]
async fn silent_peer_hits_stream_deadline() {
    let config = HostConfig::default().with_stream_timeout(Duration::from_millis(300));
    let h = Harness::start_with(config).await;

    let mut stream = h
        .client
        .host()
        .open_stream(&h.daemon_id, Command::Echo.protocol_id())
        .await
        .unwrap();

    // Never send the request line; the daemon gives up and resets.
    let err = timeout(TEST_TIMEOUT, stream.read_to_end())
        .await
        .expect("client read should end once the daemon resets")
        .unwrap_err();
    assert!(matches!(err, TnsError::Transport(_)), "got {:?}", err);

    h.shutdown().await;
}

#[tokio::test]
async fn cancellation_closes_host() {
    let h = Harness::start().await;
    h.client.query_tns(&h.daemon_id, "echo", None).await.unwrap();

    h.cancel.cancel();
    timeout(TEST_TIMEOUT, h.run)
        .await
        .expect("run should return after cancellation")
        .unwrap()
        .unwrap();
    assert!(h.daemon.host().is_closed());

    let err = timeout(2 * TEST_TIMEOUT, h.client.query_tns(&h.daemon_id, "echo", None))
        .await
        .expect("query against closed daemon should fail promptly")
        .unwrap_err();
    assert!(matches!(err, TnsError::Transport(_)), "got {:?}", err);

    h.client.close().await;
}

#[tokio::test]
async fn end_to_end_scenario() {
    let h = Harness::start().await;

    let QueryResponse::Echo(text) = h
        .client
        .query_tns(&h.daemon_id, "echo", Some(json!("hello")))
        .await
        .unwrap()
    else {
        panic!("expected echo");
    };
    assert!(text.contains("hello"));

    let created = h.create("example").await;
    let response = h
        .client
        .query_tns(
            &h.daemon_id,
            "zone-request",
            Some(json!({
                "user_name": "postables",
                "zone_name": "example",
                "zone_manager_key_name": "postables-3072"
            })),
        )
        .await
        .unwrap();
    let QueryResponse::Zone { hash, zone } = response else {
        panic!("expected zone");
    };
    assert_eq!(hash, created.hash);
    assert_eq!(zone.name, "example");
    assert!(zone.records.is_empty());

    let err = h
        .client
        .query_tns(&h.daemon_id, "record-request", None)
        .await
        .unwrap_err();
    assert!(matches!(err, TnsError::NotImplemented));

    assert_eq!(h.client.host().list_peers().await, vec![h.daemon_id]);
    h.shutdown().await;
}
