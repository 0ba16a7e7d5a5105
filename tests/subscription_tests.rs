mod common;

use common::{MockConnector, MockServers, query_of};
use graphql_autoclient::subscription_multiplexer::{MultiplexerConfig, ReconnectPolicy};
use graphql_autoclient::{ChannelState, ClientError, StreamEvent, SubscriptionMultiplexer};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const ROOM_A: &str = r#"subscription messageAdded { messageAdded(room: "a") { id body } }"#;
const ROOM_B: &str = r#"subscription messageAdded { messageAdded(room: "b") { id body } }"#;

// Test fixture owning the multiplexer and the mock transport
struct TestFixture {
    connector: Arc<MockConnector>,
    servers: MockServers,
    mux: SubscriptionMultiplexer,
}

impl TestFixture {
    fn setup() -> Self {
        Self::with_policy(ReconnectPolicy::default())
    }

    fn with_policy(reconnect: ReconnectPolicy) -> Self {
        let (connector, servers) = MockConnector::new();
        let mux = SubscriptionMultiplexer::new(
            MultiplexerConfig {
                endpoint: "ws://mock/socket/websocket".into(),
                reconnect,
                heartbeat_interval: None,
            },
            connector.clone(),
        );
        TestFixture {
            connector,
            servers,
            mux,
        }
    }
}

async fn next_event(events: &mut graphql_autoclient::event_stream::EventReceiver) -> StreamEvent {
    tokio::time::timeout(Duration::from_secs(60), events.next())
        .await
        .expect("no event")
        .expect("stream closed")
}

#[tokio::test]
async fn identical_subscribes_share_one_push_and_one_stream() {
    let TestFixture {
        connector,
        mut servers,
        mux,
    } = TestFixture::setup();

    let (first, mut server) = tokio::join!(mux.subscribe(ROOM_A), async {
        let mut server = servers.accept().await;
        server.accept_join().await;
        assert_eq!(server.establish("sub-a").await, ROOM_A);
        server
    });
    let first = first.unwrap();
    assert_eq!(mux.state(), ChannelState::Joined);

    let second = mux.subscribe(ROOM_A).await.unwrap();
    assert!(first.same_stream(&second));
    server.assert_silent().await;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(mux.subscription_count().await.unwrap(), 1);

    let mut events = second.listen();
    server.push_data("sub-a", json!({ "messageAdded": { "id": "1", "body": "hi" } }));
    assert_eq!(
        next_event(&mut events).await,
        StreamEvent::Data(json!({ "messageAdded": { "id": "1", "body": "hi" } }))
    );
}

#[tokio::test]
async fn different_arguments_get_separate_subscriptions() {
    let TestFixture { mut servers, mux, .. } = TestFixture::setup();

    let (a, server) = tokio::join!(mux.subscribe(ROOM_A), async {
        let mut server = servers.accept().await;
        server.accept_join().await;
        server.establish("sub-a").await;
        server
    });
    let mut server = server;
    let (b, _) = tokio::join!(mux.subscribe(ROOM_B), server.establish("sub-b"));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(!a.same_stream(&b));
    assert_ne!(a.query_id(), b.query_id());

    let mut a_events = a.listen();
    let mut b_events = b.listen();
    server.push_data("sub-b", json!({ "n": 2 }));
    server.push_data("sub-a", json!({ "n": 1 }));
    assert_eq!(next_event(&mut a_events).await, StreamEvent::Data(json!({ "n": 1 })));
    assert_eq!(next_event(&mut b_events).await, StreamEvent::Data(json!({ "n": 2 })));
    assert!(a_events.try_next().is_none());
}

#[tokio::test]
async fn concurrent_first_subscribes_converge_on_one_connection() {
    let TestFixture {
        connector,
        mut servers,
        mux,
    } = TestFixture::setup();

    let (a1, a2, b, mut server) = tokio::join!(
        mux.subscribe(ROOM_A),
        mux.subscribe(ROOM_A),
        mux.subscribe(ROOM_B),
        async {
            let mut server = servers.accept().await;
            server.accept_join().await;
            for _ in 0..2 {
                let doc = server.expect_doc().await;
                let id = if query_of(&doc) == ROOM_A { "sub-a" } else { "sub-b" };
                server.reply_ok(&doc, id);
            }
            server
        }
    );

    let (a1, a2, b) = (a1.unwrap(), a2.unwrap(), b.unwrap());
    assert!(a1.same_stream(&a2));
    assert!(!a1.same_stream(&b));
    server.assert_silent().await;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(mux.subscription_count().await.unwrap(), 2);
}

#[tokio::test]
async fn data_for_unknown_ids_is_dropped() {
    let TestFixture { mut servers, mux, .. } = TestFixture::setup();

    let (stream, server) = tokio::join!(mux.subscribe(ROOM_A), async {
        let mut server = servers.accept().await;
        server.accept_join().await;
        server.establish("sub-a").await;
        server
    });
    let mut events = stream.unwrap().listen();

    server.push_data("sub-unknown", json!({ "n": 0 }));
    server.push_data("sub-a", json!({ "n": 1 }));
    assert_eq!(next_event(&mut events).await, StreamEvent::Data(json!({ "n": 1 })));
}

#[tokio::test]
async fn result_errors_without_data_are_reported_on_the_stream() {
    let TestFixture { mut servers, mux, .. } = TestFixture::setup();

    let (stream, server) = tokio::join!(mux.subscribe(ROOM_A), async {
        let mut server = servers.accept().await;
        server.accept_join().await;
        server.establish("sub-a").await;
        server
    });
    let mut events = stream.unwrap().listen();

    server.send(graphql_autoclient::channel::ChannelMessage::new(
        "sub-a",
        "subscription:data",
        json!({ "subscriptionId": "sub-a", "result": { "data": null, "errors": [{ "message": "denied" }] } }),
    ));
    assert_eq!(
        next_event(&mut events).await,
        StreamEvent::Error(ClientError::RequestFailed("denied".to_string()))
    );
}

#[tokio::test]
async fn rejected_subscribe_leaves_no_record() {
    let TestFixture { mut servers, mux, .. } = TestFixture::setup();

    let (rejected, server) = tokio::join!(mux.subscribe(ROOM_A), async {
        let mut server = servers.accept().await;
        server.accept_join().await;
        let doc = server.expect_doc().await;
        server.reply_error(&doc, "unknown field");
        server
    });
    assert_eq!(
        rejected.unwrap_err(),
        ClientError::SubscriptionRejected("unknown field".to_string())
    );
    assert_eq!(mux.subscription_count().await.unwrap(), 0);

    // A later subscribe for the same query pushes again.
    let mut server = server;
    let (retried, _) = tokio::join!(mux.subscribe(ROOM_A), server.establish("sub-a"));
    assert!(retried.is_ok());
    assert_eq!(mux.subscription_count().await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn transport_error_reaches_every_stream_and_reconnects() {
    let TestFixture {
        connector,
        mut servers,
        mux,
    } = TestFixture::setup();

    let (a, b, server) = tokio::join!(mux.subscribe(ROOM_A), mux.subscribe(ROOM_B), async {
        let mut server = servers.accept().await;
        server.accept_join().await;
        for _ in 0..2 {
            let doc = server.expect_doc().await;
            let id = if query_of(&doc) == ROOM_A { "sub-a" } else { "sub-b" };
            server.reply_ok(&doc, id);
        }
        server
    });
    let (a, b) = (a.unwrap(), b.unwrap());
    let mut a_events = a.listen();
    let mut b_events = b.listen();

    server.fail();
    let reset = StreamEvent::Error(ClientError::Channel("socket reset".to_string()));
    assert_eq!(next_event(&mut a_events).await, reset);
    assert_eq!(next_event(&mut b_events).await, reset);
    assert_eq!(mux.state(), ChannelState::Disconnected);
    assert_eq!(connector.attempts(), 1);

    // The retry timer fires after the policy delay and live records are pushed again.
    let started = tokio::time::Instant::now();
    let mut server = servers.accept().await;
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(connector.attempts(), 2);
    server.accept_join().await;
    for _ in 0..2 {
        let doc = server.expect_doc().await;
        let id = if query_of(&doc) == ROOM_A { "sub-a2" } else { "sub-b2" };
        server.reply_ok(&doc, id);
    }

    server.push_data("sub-a", json!({ "stale": true }));
    server.push_data("sub-a2", json!({ "n": 1 }));
    assert_eq!(next_event(&mut a_events).await, StreamEvent::Data(json!({ "n": 1 })));
    assert_eq!(mux.subscription_count().await.unwrap(), 2);
    assert_eq!(mux.state(), ChannelState::Joined);
}

#[tokio::test(start_paused = true)]
async fn in_flight_subscribes_fail_when_the_connection_is_refused() {
    let TestFixture {
        connector,
        mut servers,
        mux,
    } = TestFixture::setup();

    connector.refuse(true);
    let err = mux.subscribe(ROOM_A).await.unwrap_err();
    assert!(matches!(err, ClientError::Channel(_)));
    assert_eq!(mux.subscription_count().await.unwrap(), 0);

    // A new subscribe connects right away instead of waiting for the retry timer.
    connector.refuse(false);
    let (stream, _server) = tokio::join!(mux.subscribe(ROOM_A), async {
        let mut server = servers.accept().await;
        server.accept_join().await;
        server.establish("sub-a").await;
        server
    });
    assert!(stream.is_ok());
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn retries_stop_after_max_attempts() {
    let TestFixture { connector, mux, .. } = TestFixture::with_policy(ReconnectPolicy {
        max_attempts: Some(2),
        ..ReconnectPolicy::default()
    });

    connector.refuse(true);
    assert!(mux.subscribe(ROOM_A).await.is_err());
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(connector.attempts(), 3);
    assert_eq!(mux.state(), ChannelState::Disconnected);
}

#[tokio::test]
async fn unsubscribe_completes_the_stream_and_tells_the_server() {
    let TestFixture { mut servers, mux, .. } = TestFixture::setup();

    let (stream, server) = tokio::join!(mux.subscribe(ROOM_A), async {
        let mut server = servers.accept().await;
        server.accept_join().await;
        server.establish("sub-a").await;
        server
    });
    let mut server = server;
    let stream = stream.unwrap();
    let mut events = stream.listen();

    assert!(mux.unsubscribe(stream.query_id()).await.unwrap());
    assert_eq!(next_event(&mut events).await, StreamEvent::Complete);

    let frame = server.recv().await;
    assert_eq!(frame.event, "unsubscribe");
    assert_eq!(frame.payload, json!({ "subscriptionId": "sub-a" }));

    assert!(!mux.unsubscribe(stream.query_id()).await.unwrap());
    assert_eq!(mux.subscription_count().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn heartbeats_are_sent_while_joined() {
    let (connector, mut servers) = MockConnector::new();
    let mux = SubscriptionMultiplexer::new(
        MultiplexerConfig {
            heartbeat_interval: Some(Duration::from_secs(30)),
            ..MultiplexerConfig::new("ws://mock/socket/websocket")
        },
        connector,
    );

    let (stream, server) = tokio::join!(mux.subscribe(ROOM_A), async {
        let mut server = servers.accept().await;
        server.accept_join().await;
        server.establish("sub-a").await;
        server
    });
    assert!(stream.is_ok());

    let mut server = server;
    let started = tokio::time::Instant::now();
    let frame = server.next_frame().await;
    assert!(frame.is_heartbeat());
    assert!(started.elapsed() >= Duration::from_secs(29));
}

#[tokio::test(start_paused = true)]
async fn shutdown_completes_streams_and_cancels_the_retry() {
    let TestFixture {
        connector,
        mut servers,
        mux,
    } = TestFixture::setup();

    let (stream, server) = tokio::join!(mux.subscribe(ROOM_A), async {
        let mut server = servers.accept().await;
        server.accept_join().await;
        server.establish("sub-a").await;
        server
    });
    let mut events = stream.unwrap().listen();

    server.fail();
    assert!(matches!(next_event(&mut events).await, StreamEvent::Error(_)));

    mux.shutdown().await;
    assert_eq!(next_event(&mut events).await, StreamEvent::Complete);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(mux.subscribe(ROOM_A).await.unwrap_err(), ClientError::ChannelClosed);
}

#[tokio::test]
async fn data_pushed_with_the_acknowledgement_is_delivered() {
    let TestFixture { mut servers, mux, .. } = TestFixture::setup();

    let (stream, _server) = tokio::join!(mux.subscribe(ROOM_A), async {
        let mut server = servers.accept().await;
        server.accept_join().await;
        let doc = server.expect_doc().await;
        server.reply_ok(&doc, "sub-a");
        server.push_data("sub-a", json!({ "n": 1 }));
        server.push_data("sub-a", json!({ "n": 2 }));
        server
    });

    // Give the driver time to route both pushes before anyone listens.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut events = stream.unwrap().listen();
    assert_eq!(next_event(&mut events).await, StreamEvent::Data(json!({ "n": 1 })));
    assert_eq!(next_event(&mut events).await, StreamEvent::Data(json!({ "n": 2 })));
}

#[tokio::test]
async fn shutdown_before_first_use_refuses_subscribes() {
    let TestFixture { connector, mux, .. } = TestFixture::setup();

    mux.shutdown().await;
    assert_eq!(mux.subscribe(ROOM_A).await.unwrap_err(), ClientError::ChannelClosed);
    assert_eq!(mux.subscription_count().await.unwrap_err(), ClientError::ChannelClosed);
    assert_eq!(connector.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn new_subscribe_after_exhausted_retries_gets_retries_again() {
    let TestFixture { connector, mux, .. } = TestFixture::with_policy(ReconnectPolicy {
        max_attempts: Some(1),
        ..ReconnectPolicy::default()
    });

    connector.refuse(true);
    assert!(mux.subscribe(ROOM_A).await.is_err());
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(connector.attempts(), 2);

    assert!(mux.subscribe(ROOM_A).await.is_err());
    assert_eq!(connector.attempts(), 3);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(connector.attempts(), 4);
}

#[tokio::test]
async fn bursts_reach_a_listener_that_reads_late() {
    let TestFixture { mut servers, mux, .. } = TestFixture::setup();

    let (stream, server) = tokio::join!(mux.subscribe(ROOM_A), async {
        let mut server = servers.accept().await;
        server.accept_join().await;
        server.establish("sub-a").await;
        server
    });
    let mut events = stream.unwrap().listen();

    for n in 0..300 {
        server.push_data("sub-a", json!({ "n": n }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    for n in 0..300 {
        assert_eq!(next_event(&mut events).await, StreamEvent::Data(json!({ "n": n })));
    }
}
