#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use graphql_autoclient::channel::{ChannelConnection, ChannelConnector, ChannelMessage};
use graphql_autoclient::{ClientError, Result};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const FRAME_TIMEOUT: Duration = Duration::from_secs(60);

/// In-memory channel transport. Every successful connect hands a [`MockServer`]
/// to the test through [`MockServers`].
pub struct MockConnector {
    attempts: AtomicUsize,
    refuse: AtomicBool,
    servers: tokio::sync::mpsc::UnboundedSender<MockServer>,
}

pub struct MockServers {
    receiver: tokio::sync::mpsc::UnboundedReceiver<MockServer>,
}

impl MockConnector {
    pub fn new() -> (Arc<MockConnector>, MockServers) {
        let (servers, receiver) = tokio::sync::mpsc::unbounded_channel();
        let connector = MockConnector {
            attempts: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
            servers,
        };
        (Arc::new(connector), MockServers { receiver })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChannelConnector for MockConnector {
    async fn connect(&self, _url: &str) -> Result<ChannelConnection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ClientError::Channel("connection refused".to_string()));
        }

        let (client_tx, server_rx) = mpsc::unbounded::<ChannelMessage>();
        let (server_tx, client_rx) = mpsc::unbounded::<Result<ChannelMessage>>();
        self.servers
            .send(MockServer {
                outbound: server_rx,
                inbound: server_tx,
            })
            .map_err(|_| ClientError::Channel("test harness gone".to_string()))?;

        Ok(ChannelConnection {
            sink: Box::pin(client_tx.sink_map_err(|e| ClientError::Channel(e.to_string()))),
            stream: client_rx.boxed(),
        })
    }
}

impl MockServers {
    /// Waits for the next connection the multiplexer opens.
    pub async fn accept(&mut self) -> MockServer {
        tokio::time::timeout(FRAME_TIMEOUT, self.receiver.recv())
            .await
            .expect("no connection attempt")
            .expect("connector dropped")
    }
}

/// Server side of one mock connection.
pub struct MockServer {
    outbound: mpsc::UnboundedReceiver<ChannelMessage>,
    inbound: mpsc::UnboundedSender<Result<ChannelMessage>>,
}

impl MockServer {
    /// Next frame from the client, heartbeats included.
    pub async fn next_frame(&mut self) -> ChannelMessage {
        tokio::time::timeout(FRAME_TIMEOUT, self.outbound.next())
            .await
            .expect("client sent nothing")
            .expect("client closed the connection")
    }

    /// Next non-heartbeat frame from the client.
    pub async fn recv(&mut self) -> ChannelMessage {
        loop {
            let frame = self.next_frame().await;
            if !frame.is_heartbeat() {
                return frame;
            }
        }
    }

    pub async fn assert_silent(&mut self) {
        match tokio::time::timeout(Duration::from_millis(100), self.outbound.next()).await {
            Err(_) | Ok(None) => {}
            Ok(Some(frame)) => panic!("unexpected frame {:?}", frame),
        }
    }

    pub fn send(&self, message: ChannelMessage) {
        self.inbound
            .unbounded_send(Ok(message))
            .expect("client is gone");
    }

    pub async fn accept_join(&mut self) -> ChannelMessage {
        let join = self.recv().await;
        assert_eq!(join.event, "phx_join");
        assert_eq!(join.topic, "__absinthe__:control");
        self.send(ChannelMessage::reply(&join, true, json!({})));
        join
    }

    pub async fn expect_doc(&mut self) -> ChannelMessage {
        let doc = self.recv().await;
        assert_eq!(doc.event, "doc", "expected a doc push, got {:?}", doc);
        doc
    }

    /// Acknowledges the next doc push with `subscription_id`; returns its query.
    pub async fn establish(&mut self, subscription_id: &str) -> String {
        let doc = self.expect_doc().await;
        self.reply_ok(&doc, subscription_id);
        query_of(&doc)
    }

    pub fn reply_ok(&self, request: &ChannelMessage, subscription_id: &str) {
        self.send(ChannelMessage::reply(
            request,
            true,
            json!({ "subscriptionId": subscription_id }),
        ));
    }

    pub fn reply_error(&self, request: &ChannelMessage, reason: &str) {
        self.send(ChannelMessage::reply(request, false, json!({ "reason": reason })));
    }

    pub fn push_data(&self, subscription_id: &str, data: Value) {
        self.send(ChannelMessage::data(subscription_id, data));
    }

    /// Simulates a socket failure.
    pub fn fail(&self) {
        self.inbound
            .unbounded_send(Err(ClientError::Channel("socket reset".to_string())))
            .expect("client is gone");
    }
}

pub fn query_of(doc: &ChannelMessage) -> String {
    doc.payload["query"].as_str().unwrap_or_default().to_string()
}

type Responder = dyn Fn(&Value) -> (StatusCode, Value) + Send + Sync;

/// In-process GraphQL endpoint recording every request body.
pub struct MockGraphQLServer {
    pub url: String,
    requests: Arc<Mutex<Vec<Value>>>,
    handle: JoinHandle<()>,
}

impl MockGraphQLServer {
    pub async fn start<F>(responder: F) -> MockGraphQLServer
    where
        F: Fn(&Value) -> (StatusCode, Value) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let responder: Arc<Responder> = Arc::new(responder);

        let recorded = Arc::clone(&requests);
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let io = TokioIo::new(stream);
                let recorded = Arc::clone(&recorded);
                let responder = Arc::clone(&responder);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let recorded = Arc::clone(&recorded);
                        let responder = Arc::clone(&responder);
                        async move {
                            let body = req.collect().await?.to_bytes();
                            let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
                            let (status, reply) = responder(&request);
                            recorded.lock().push(request);
                            Ok::<_, hyper::Error>(
                                Response::builder()
                                    .status(status)
                                    .header("Content-Type", "application/json")
                                    .body(Full::new(Bytes::from(reply.to_string())))
                                    .unwrap(),
                            )
                        }
                    });
                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await;
                });
            }
        });

        MockGraphQLServer {
            url: format!("http://{}/graphql", addr),
            requests,
            handle,
        }
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().clone()
    }

    pub fn queries(&self) -> Vec<String> {
        self.requests()
            .iter()
            .map(|request| request["query"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

impl Drop for MockGraphQLServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
