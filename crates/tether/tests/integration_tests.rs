//! End-to-end tests for the bridge pipeline.
//!
//! Assemble a real stream listener, event router, and relay against a
//! mocked platform and an in-memory runtime, and drive the scenarios
//! the bridge exists for: relay round-trips, resume after disconnect,
//! credential revocation, and degraded-mode polling.

use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::RwLock;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tether::config::Config;
use tether::router::{EventRouter, RouterContext};
use tether_platform::{
    ConnectionState, PlatformClient, Secret, StreamConfig, StreamListener,
};
use tether_runtime::testing::{MockRuntime, StaticProvider};
use tether_runtime::{CommandRouter, DeliveryPolicy, MessageRelay, SessionMapper, SubAgentManager};
use tether_store::StateStore;
use tether_web::Metrics;

struct Pipeline {
    runtime: Arc<MockRuntime>,
    store: Arc<StateStore>,
    shutdown_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<ConnectionState>,
    listener_handle: tokio::task::JoinHandle<Result<(), tether_platform::PlatformError>>,
    router_handle: tokio::task::JoinHandle<()>,
}

/// Wire a listener and router together against a mock platform.
async fn start_pipeline(
    server: &MockServer,
    initial_cursor: i64,
    stream_config: StreamConfig,
) -> Pipeline {
    let client =
        Arc::new(PlatformClient::new(server.uri(), Secret::new("tok_agent"), true).unwrap());
    let runtime = Arc::new(MockRuntime::default());
    let store = Arc::new(StateStore::open_in_memory().await.unwrap());
    if initial_cursor > 0 {
        store
            .commit_cursor("marvin", "acme", initial_cursor)
            .await
            .unwrap();
    }

    let mapper = Arc::new(SessionMapper::new(
        "marvin",
        client.clone(),
        runtime.clone(),
        store.clone(),
        50,
    ));
    let provider = Arc::new(StaticProvider::default().with("SUB_TOKEN", "tok_sub"));
    let sub_agents = Arc::new(SubAgentManager::new(mapper.clone(), store.clone(), provider));

    let (signal_tx, _signal_rx) = mpsc::channel(4);
    let relay = Arc::new(MessageRelay::new(
        "marvin",
        client.clone(),
        runtime.clone(),
        DeliveryPolicy {
            retry_delays: vec![Duration::from_millis(5)],
            inject_timeout: Duration::from_millis(500),
            queue_capacity: 32,
        },
        signal_tx,
    ));
    let commands = Arc::new(CommandRouter::new(
        "/",
        runtime.clone(),
        relay.clone(),
        Duration::from_secs(2),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (stop_tx, stop_rx) = watch::channel(false);
    let resume = Arc::new(AtomicI64::new(if initial_cursor > 0 {
        initial_cursor
    } else {
        -1
    }));

    let (listener, state_rx) = StreamListener::new(
        "marvin",
        "acme",
        client,
        resume.clone(),
        stream_config,
    );

    let ctx = Arc::new(RouterContext {
        agent: "marvin".into(),
        org: "acme".into(),
        relay,
        commands,
        mapper,
        sub_agents,
        store: store.clone(),
        resume,
        metrics: Arc::new(Metrics::new().unwrap()),
        stop_tx: Arc::new(stop_tx),
        last_event: Arc::new(RwLock::new(None)),
        shutdown: shutdown_rx.clone(),
        worker_queue: 16,
        unavailable_alert_threshold: 3,
        runtime_retry_delay: Duration::from_millis(10),
        fallback: None,
    });

    let (events_tx, events_rx) = mpsc::channel(64);

    let listener_handle = {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { listener.run(events_tx, shutdown_rx, stop_rx).await })
    };
    let router_handle = tokio::spawn(async move { EventRouter::new(ctx).run(events_rx).await });

    Pipeline {
        runtime,
        store,
        shutdown_tx,
        state_rx,
        listener_handle,
        router_handle,
    }
}

async fn wait_until(check: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn fast_stream_config() -> StreamConfig {
    StreamConfig {
        read_timeout: Duration::from_secs(5),
        stability_threshold: Duration::from_millis(50),
        degraded_after: Duration::from_secs(300),
        poll_interval: Duration::from_millis(50),
        poll_limit: 100,
    }
}

fn event_line(id: i64, sender: &str, content: &str) -> String {
    json!({
        "id": id,
        "type": "message.created",
        "org": "acme",
        "actor": sender,
        "channel": {"id": "ch_general", "kind": "channel"},
        "data": {
            "message_id": format!("m{id}"),
            "sender": sender,
            "content": content,
            "mentions": ["marvin"]
        }
    })
    .to_string()
}

fn mount_empty_history() -> Mock {
    Mock::given(method("GET"))
        .and(path("/api/orgs/acme/channels/ch_general/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"messages": []})))
}

#[tokio::test]
async fn message_round_trip_through_the_stream() {
    let server = MockServer::start().await;
    mount_empty_history().mount(&server).await;

    // The stream delivers a keep-alive and one message, then closes;
    // reconnects replay the same window and are deduplicated.
    let body = format!(
        "{}\n{}\n",
        json!({"type": "ping"}),
        event_line(1, "sam", "Can you review the PR?")
    );
    Mock::given(method("GET"))
        .and(path("/api/events/stream"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let pipeline = start_pipeline(&server, 0, fast_stream_config()).await;

    let runtime = pipeline.runtime.clone();
    wait_until(move || runtime.injected_count() == 1).await;

    let injected = pipeline.runtime.injected.lock().unwrap().clone();
    assert_eq!(injected[0].0, "marvin/acme/channel/ch_general");
    assert_eq!(injected[0].1.content, "Can you review the PR?");

    pipeline.shutdown_tx.send(true).unwrap();
    pipeline.router_handle.await.unwrap();
    pipeline.listener_handle.await.unwrap().unwrap();

    assert_eq!(
        pipeline.store.cursor("marvin", "acme").await.unwrap(),
        Some(1)
    );
}

#[tokio::test]
async fn reconnect_resumes_from_the_committed_cursor() {
    let server = MockServer::start().await;
    mount_empty_history().mount(&server).await;

    // Resuming from the persisted cursor 10, the first connection
    // replays 9..=12 (overlap included), then drops.
    let first_window = [9, 10, 11, 12]
        .iter()
        .map(|id| event_line(*id, "sam", &format!("event {id}")))
        .collect::<Vec<_>>()
        .join("\n");
    Mock::given(method("GET"))
        .and(path("/api/events/stream"))
        .and(query_param("after", "10"))
        .respond_with(ResponseTemplate::new(200).set_body_string(first_window))
        .mount(&server)
        .await;

    // Reconnects must pass the newly committed cursor.
    Mock::given(method("GET"))
        .and(path("/api/events/stream"))
        .and(query_param("after", "12"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(format!("{}\n", event_line(13, "sam", "event 13"))),
        )
        .expect(1..)
        .mount(&server)
        .await;

    let pipeline = start_pipeline(&server, 10, fast_stream_config()).await;

    let runtime = pipeline.runtime.clone();
    wait_until(move || runtime.injected_count() >= 3).await;

    let injected = pipeline.runtime.injected.lock().unwrap().clone();
    let contents: Vec<&str> = injected
        .iter()
        .take(3)
        .map(|(_, m)| m.content.as_str())
        .collect();
    assert_eq!(contents, vec!["event 11", "event 12", "event 13"]);

    pipeline.shutdown_tx.send(true).unwrap();
    pipeline.router_handle.await.unwrap();
    pipeline.listener_handle.await.unwrap().unwrap();

    assert_eq!(
        pipeline.store.cursor("marvin", "acme").await.unwrap(),
        Some(13)
    );
}

#[tokio::test]
async fn credential_revocation_parks_the_listener() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/events/stream"))
        .respond_with(ResponseTemplate::new(401).set_body_string("token revoked"))
        .mount(&server)
        .await;

    let pipeline = start_pipeline(&server, 0, fast_stream_config()).await;

    // Terminal stopped state, no reconnect loop.
    let mut state_rx = pipeline.state_rx.clone();
    tokio::time::timeout(Duration::from_secs(10), async {
        while *state_rx.borrow() != ConnectionState::Stopped {
            state_rx.changed().await.unwrap();
        }
    })
    .await
    .expect("listener did not stop");

    let err = pipeline.listener_handle.await.unwrap().unwrap_err();
    assert!(err.is_auth());

    pipeline.shutdown_tx.send(true).unwrap();
    pipeline.router_handle.await.unwrap();
    assert_eq!(pipeline.runtime.injected_count(), 0);
}

#[tokio::test]
async fn degraded_mode_polls_the_list_endpoint() {
    let server = MockServer::start().await;
    mount_empty_history().mount(&server).await;

    // The stream is down for good; events only exist on the poll
    // endpoint.
    Mock::given(method("GET"))
        .and(path("/api/events/stream"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/events"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "events": [
                {
                    "id": 1,
                    "type": "message.created",
                    "org": "acme",
                    "actor": "sam",
                    "channel": {"id": "ch_general", "kind": "channel"},
                    "data": {"message_id": "m1", "sender": "sam", "content": "still there?"}
                }
            ]
        })))
        .mount(&server)
        .await;

    let config = StreamConfig {
        read_timeout: Duration::from_secs(5),
        stability_threshold: Duration::from_millis(50),
        // Degrade almost immediately so the test exercises the fallback.
        degraded_after: Duration::from_millis(100),
        poll_interval: Duration::from_millis(50),
        poll_limit: 100,
    };
    let pipeline = start_pipeline(&server, 0, config).await;

    let runtime = pipeline.runtime.clone();
    wait_until(move || runtime.injected_count() >= 1).await;
    assert_eq!(*pipeline.state_rx.borrow(), ConnectionState::Degraded);

    let injected = pipeline.runtime.injected.lock().unwrap().clone();
    assert_eq!(injected[0].1.content, "still there?");

    pipeline.shutdown_tx.send(true).unwrap();
    pipeline.router_handle.await.unwrap();
    pipeline.listener_handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn config_loads_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
            platform_url = "https://platform.example.com"

            [[agents]]
            name = "marvin"
            org = "acme"
            credential = "MARVIN_TOKEN"
        "#,
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.agents.len(), 1);
    assert_eq!(config.agents[0].name, "marvin");

    let missing = Config::load(&dir.path().join("absent.toml"));
    assert!(missing.is_err());
}
