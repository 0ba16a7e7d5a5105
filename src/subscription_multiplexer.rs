//! One shared channel for every subscription of a client.
//!
//! A single driver task owns the connection, the subscription records and the
//! retry timer. Handles talk to it through a command queue, so concurrent
//! subscribers converge on one connection attempt and one join.

use futures::future::{self, BoxFuture};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tracing::{debug, error, info, trace, warn};

use crate::channel::{
    CLOSE_EVENT, CONTROL_TOPIC, ChannelConnection, ChannelConnector, ChannelMessage, DATA_EVENT,
    ERROR_EVENT, FrameSink, FrameStream, Reply,
};
use crate::error::{ClientError, Result};
use crate::event_stream::{EventStream, QueryId, StreamEvent};
use crate::request_dispatcher::extract_data;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Joining,
    Joined,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Connecting => "connecting",
            ChannelState::Joining => "joining",
            ChannelState::Joined => "joined",
        };
        f.write_str(name)
    }
}

/// How the channel recovers from transport errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Fixed delay between a failure and the next connection attempt.
    pub delay: Duration,
    /// Consecutive failed attempts after which retries stop. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Re-push live subscriptions after a successful rejoin.
    pub resubscribe: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            delay: Duration::from_secs(1),
            max_attempts: None,
            resubscribe: true,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay_after(&self, failures: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if failures > max => None,
            _ => Some(self.delay),
        }
    }
}

/// Where the channel connects; a dynamic endpoint is evaluated on every attempt.
#[derive(Clone)]
pub enum ChannelEndpoint {
    Url(String),
    Dynamic(Arc<dyn Fn() -> String + Send + Sync>),
}

impl ChannelEndpoint {
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        ChannelEndpoint::Dynamic(Arc::new(f))
    }

    pub fn resolve(&self) -> String {
        match self {
            ChannelEndpoint::Url(url) => url.clone(),
            ChannelEndpoint::Dynamic(f) => f(),
        }
    }
}

impl fmt::Debug for ChannelEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelEndpoint::Url(url) => f.debug_tuple("Url").field(url).finish(),
            ChannelEndpoint::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl From<String> for ChannelEndpoint {
    fn from(url: String) -> Self {
        ChannelEndpoint::Url(url)
    }
}

impl From<&str> for ChannelEndpoint {
    fn from(url: &str) -> Self {
        ChannelEndpoint::Url(url.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    pub endpoint: ChannelEndpoint,
    pub reconnect: ReconnectPolicy,
    /// Interval of `phoenix` heartbeats while joined; `None` disables them.
    pub heartbeat_interval: Option<Duration>,
}

impl MultiplexerConfig {
    pub fn new(endpoint: impl Into<ChannelEndpoint>) -> Self {
        MultiplexerConfig {
            endpoint: endpoint.into(),
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: Some(Duration::from_secs(30)),
        }
    }
}

enum Command {
    Subscribe {
        operation: String,
        reply: oneshot::Sender<Result<EventStream>>,
    },
    Unsubscribe {
        query_id: QueryId,
        reply: oneshot::Sender<bool>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

struct DriverHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

enum DriverSlot {
    Idle,
    Running(DriverHandle),
    Closed,
}

pub struct SubscriptionMultiplexer {
    config: MultiplexerConfig,
    connector: Arc<dyn ChannelConnector>,
    state: Arc<watch::Sender<ChannelState>>,
    driver: Mutex<DriverSlot>,
}

impl SubscriptionMultiplexer {
    /// Creates an idle multiplexer. Nothing connects until the first subscribe.
    pub fn new(config: MultiplexerConfig, connector: Arc<dyn ChannelConnector>) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        SubscriptionMultiplexer {
            config,
            connector,
            state: Arc::new(state),
            driver: Mutex::new(DriverSlot::Idle),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    /// Subscribes to a fully rendered operation.
    ///
    /// Identical operations share one server subscription and one [`EventStream`].
    pub async fn subscribe(&self, operation: impl Into<String>) -> Result<EventStream> {
        let (reply, response) = oneshot::channel();
        self.send_command(Command::Subscribe {
            operation: operation.into(),
            reply,
        })?;
        response.await.map_err(|_| ClientError::ChannelClosed)?
    }

    /// Removes the subscription; returns whether it existed.
    pub async fn unsubscribe(&self, query_id: &QueryId) -> Result<bool> {
        let (reply, response) = oneshot::channel();
        self.send_command(Command::Unsubscribe {
            query_id: query_id.clone(),
            reply,
        })?;
        response.await.map_err(|_| ClientError::ChannelClosed)
    }

    pub async fn subscription_count(&self) -> Result<usize> {
        let (reply, response) = oneshot::channel();
        self.send_command(Command::Count { reply })?;
        response.await.map_err(|_| ClientError::ChannelClosed)
    }

    /// Closes the channel, cancels any pending reconnect and completes every stream.
    pub async fn shutdown(&self) {
        let slot = mem::replace(&mut *self.driver.lock(), DriverSlot::Closed);
        if let DriverSlot::Running(handle) = slot {
            let _ = handle.commands.send(Command::Shutdown);
            if let Err(e) = handle.task.await {
                warn!(error = %e, "subscription driver ended abnormally");
            }
        }
    }

    fn send_command(&self, command: Command) -> Result<()> {
        let mut slot = self.driver.lock();
        if let DriverSlot::Idle = *slot {
            *slot = DriverSlot::Running(self.spawn_driver());
        }
        match &*slot {
            DriverSlot::Running(handle) => handle
                .commands
                .send(command)
                .map_err(|_| ClientError::ChannelClosed),
            DriverSlot::Idle | DriverSlot::Closed => Err(ClientError::ChannelClosed),
        }
    }

    fn spawn_driver(&self) -> DriverHandle {
        let (commands, receiver) = mpsc::unbounded_channel();
        let driver = Driver {
            config: self.config.clone(),
            connector: Arc::clone(&self.connector),
            state: Arc::clone(&self.state),
            commands: receiver,
            connecting: None,
            sink: None,
            inbound: None,
            retry_at: None,
            heartbeat: None,
            failures: 0,
            next_ref: 0,
            replies: HashMap::new(),
            pending: HashMap::new(),
            records: HashMap::new(),
            by_server_id: HashMap::new(),
        };
        DriverHandle {
            commands,
            task: tokio::spawn(driver.run()),
        }
    }
}

impl Drop for SubscriptionMultiplexer {
    fn drop(&mut self) {
        let slot = mem::replace(self.driver.get_mut(), DriverSlot::Closed);
        if let DriverSlot::Running(handle) = slot {
            let _ = handle.commands.send(Command::Shutdown);
        }
    }
}

enum PendingReply {
    Join,
    Doc(QueryId),
    Resubscribe(QueryId),
}

struct PendingSubscription {
    operation: String,
    waiters: Vec<oneshot::Sender<Result<EventStream>>>,
}

struct SubscriptionRecord {
    query_id: QueryId,
    operation: String,
    /// Absent while the channel is down.
    server_subscription_id: Option<String>,
    stream: EventStream,
}

struct Driver {
    config: MultiplexerConfig,
    connector: Arc<dyn ChannelConnector>,
    state: Arc<watch::Sender<ChannelState>>,
    commands: mpsc::UnboundedReceiver<Command>,
    connecting: Option<BoxFuture<'static, Result<ChannelConnection>>>,
    sink: Option<FrameSink>,
    inbound: Option<FrameStream>,
    retry_at: Option<Instant>,
    heartbeat: Option<Interval>,
    failures: u32,
    next_ref: u64,
    replies: HashMap<String, PendingReply>,
    /// Subscribes waiting for a join or for their acknowledgement.
    pending: HashMap<QueryId, PendingSubscription>,
    records: HashMap<QueryId, SubscriptionRecord>,
    by_server_id: HashMap<String, QueryId>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                connected = poll_connecting(&mut self.connecting) => {
                    self.connecting = None;
                    match connected {
                        Ok(connection) => self.on_connected(connection).await,
                        Err(err) => self.on_transport_error(err),
                    }
                }
                frame = next_frame(&mut self.inbound) => match frame {
                    Some(Ok(message)) => self.handle_frame(message).await,
                    Some(Err(err)) => self.on_transport_error(err),
                    None => self.on_transport_error(ClientError::Channel("connection closed".to_string())),
                },
                () = retry_timer(self.retry_at) => {
                    self.retry_at = None;
                    info!(attempt = self.failures + 1, "reconnecting subscription channel");
                    self.start_connecting();
                }
                () = heartbeat_tick(&mut self.heartbeat) => self.send_heartbeat().await,
            }
        }
        self.teardown().await;
    }

    fn current_state(&self) -> ChannelState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ChannelState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!(state = %next, "channel state changed");
        }
    }

    fn next_ref(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe { operation, reply } => self.subscribe(operation, reply).await,
            Command::Unsubscribe { query_id, reply } => {
                let removed = self.unsubscribe(&query_id).await;
                let _ = reply.send(removed);
            }
            Command::Count { reply } => {
                let _ = reply.send(self.records.len());
            }
            Command::Shutdown => {}
        }
    }

    async fn subscribe(&mut self, operation: String, reply: oneshot::Sender<Result<EventStream>>) {
        let query_id = QueryId::for_operation(&operation);
        if let Some(record) = self.records.get(&query_id) {
            trace!(%query_id, "reusing live subscription");
            let _ = reply.send(Ok(record.stream.clone()));
            return;
        }
        if let Some(pending) = self.pending.get_mut(&query_id) {
            trace!(%query_id, "joining in-flight subscribe");
            pending.waiters.push(reply);
            return;
        }

        self.pending.insert(
            query_id.clone(),
            PendingSubscription {
                operation,
                waiters: vec![reply],
            },
        );
        match self.current_state() {
            ChannelState::Joined => self.push_doc(query_id).await,
            ChannelState::Disconnected => {
                // A new subscribe restarts the retry count.
                self.failures = 0;
                self.start_connecting();
            }
            ChannelState::Connecting | ChannelState::Joining => {}
        }
    }

    async fn unsubscribe(&mut self, query_id: &QueryId) -> bool {
        let Some(record) = self.records.remove(query_id) else {
            return false;
        };
        debug!(query_id = %record.query_id, "unsubscribing");
        if let Some(server_id) = &record.server_subscription_id {
            self.by_server_id.remove(server_id);
            if self.current_state() == ChannelState::Joined {
                let msg_ref = self.next_ref();
                self.send(ChannelMessage::unsubscribe(msg_ref, server_id)).await;
            }
        }
        record.stream.emit(StreamEvent::Complete);
        true
    }

    fn start_connecting(&mut self) {
        if self.connecting.is_some() || self.sink.is_some() {
            return;
        }
        self.retry_at = None;
        let url = self.config.endpoint.resolve();
        let connector = Arc::clone(&self.connector);
        debug!(%url, "opening subscription channel");
        self.set_state(ChannelState::Connecting);
        self.connecting = Some(Box::pin(async move { connector.connect(&url).await }));
    }

    async fn on_connected(&mut self, connection: ChannelConnection) {
        self.sink = Some(connection.sink);
        self.inbound = Some(connection.stream);
        self.set_state(ChannelState::Joining);

        let msg_ref = self.next_ref();
        self.replies.insert(msg_ref.clone(), PendingReply::Join);
        self.send(ChannelMessage::join(msg_ref)).await;
    }

    async fn send(&mut self, message: ChannelMessage) {
        let Some(sink) = self.sink.as_mut() else {
            trace!(event = %message.event, "no connection, frame dropped");
            return;
        };
        let sent = sink.send(message).await;
        if let Err(err) = sent {
            self.on_transport_error(err);
        }
    }

    async fn push_doc(&mut self, query_id: QueryId) {
        if self.sink.is_none() {
            return;
        }
        let msg_ref = self.next_ref();
        let Some(pending) = self.pending.get(&query_id) else {
            return;
        };
        let message = ChannelMessage::doc(msg_ref.clone(), &pending.operation);
        self.replies.insert(msg_ref, PendingReply::Doc(query_id));
        self.send(message).await;
    }

    async fn push_resubscribe(&mut self, query_id: QueryId) {
        if self.sink.is_none() {
            return;
        }
        let msg_ref = self.next_ref();
        let Some(record) = self.records.get(&query_id) else {
            return;
        };
        let message = ChannelMessage::doc(msg_ref.clone(), &record.operation);
        self.replies.insert(msg_ref, PendingReply::Resubscribe(query_id));
        self.send(message).await;
    }

    async fn send_heartbeat(&mut self) {
        if self.current_state() == ChannelState::Joined {
            let msg_ref = self.next_ref();
            self.send(ChannelMessage::heartbeat(msg_ref)).await;
        }
    }

    async fn handle_frame(&mut self, message: ChannelMessage) {
        if let Some(reply) = message.reply_status() {
            let pending = message
                .msg_ref
                .as_ref()
                .and_then(|msg_ref| self.replies.remove(msg_ref));
            match pending {
                Some(PendingReply::Join) => self.on_join_reply(reply).await,
                Some(PendingReply::Doc(query_id)) => self.on_doc_reply(query_id, reply),
                Some(PendingReply::Resubscribe(query_id)) => {
                    self.on_resubscribe_reply(query_id, reply).await
                }
                None => trace!(msg_ref = ?message.msg_ref, "unmatched reply"),
            }
            return;
        }

        match message.event.as_str() {
            DATA_EVENT => self.dispatch_data(&message.payload),
            ERROR_EVENT | CLOSE_EVENT if message.topic == CONTROL_TOPIC => {
                self.on_transport_error(ClientError::Channel(format!(
                    "control channel reported {}",
                    message.event
                )))
            }
            _ => trace!(topic = %message.topic, event = %message.event, "ignoring frame"),
        }
    }

    async fn on_join_reply(&mut self, reply: Reply) {
        match reply {
            Reply::Ok(_) => {
                info!("subscription channel joined");
                self.failures = 0;
                self.set_state(ChannelState::Joined);
                if let Some(period) = self.config.heartbeat_interval {
                    self.heartbeat = Some(tokio::time::interval_at(Instant::now() + period, period));
                }

                let queued: Vec<QueryId> = self.pending.keys().cloned().collect();
                for query_id in queued {
                    self.push_doc(query_id).await;
                }
                if self.config.reconnect.resubscribe {
                    let live: Vec<QueryId> = self.records.keys().cloned().collect();
                    for query_id in live {
                        self.push_resubscribe(query_id).await;
                    }
                }
            }
            Reply::Error(response) => self.on_transport_error(ClientError::Channel(format!(
                "join rejected: {}",
                Reply::reason(&response)
            ))),
        }
    }

    fn on_doc_reply(&mut self, query_id: QueryId, reply: Reply) {
        let Some(pending) = self.pending.remove(&query_id) else {
            return;
        };
        let outcome = match reply {
            Reply::Ok(response) => match response.get("subscriptionId").and_then(Value::as_str) {
                Some(server_id) => {
                    debug!(%query_id, subscription_id = server_id, "subscription established");
                    let stream = EventStream::new(query_id.clone());
                    self.by_server_id
                        .insert(server_id.to_string(), query_id.clone());
                    self.records.insert(
                        query_id.clone(),
                        SubscriptionRecord {
                            query_id,
                            operation: pending.operation,
                            server_subscription_id: Some(server_id.to_string()),
                            stream: stream.clone(),
                        },
                    );
                    Ok(stream)
                }
                None => Err(ClientError::SubscriptionRejected(
                    "reply carried no subscriptionId".to_string(),
                )),
            },
            Reply::Error(response) => Err(ClientError::SubscriptionRejected(Reply::reason(&response))),
        };
        if let Err(err) = &outcome {
            warn!(error = %err, "subscribe rejected");
        }
        for waiter in pending.waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    async fn on_resubscribe_reply(&mut self, query_id: QueryId, reply: Reply) {
        match reply {
            Reply::Ok(response) => {
                let Some(server_id) = response
                    .get("subscriptionId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                else {
                    warn!(%query_id, "resubscribe reply carried no subscriptionId");
                    return;
                };
                if let Some(record) = self.records.get_mut(&query_id) {
                    debug!(%query_id, subscription_id = %server_id, "resubscribed");
                    record.server_subscription_id = Some(server_id.clone());
                    self.by_server_id.insert(server_id, query_id);
                    return;
                }
                // Unsubscribed while the resubscribe was in flight.
                let msg_ref = self.next_ref();
                self.send(ChannelMessage::unsubscribe(msg_ref, &server_id)).await;
            }
            Reply::Error(response) => {
                if let Some(record) = self.records.get(&query_id) {
                    record.stream.emit(StreamEvent::Error(ClientError::SubscriptionRejected(
                        Reply::reason(&response),
                    )));
                }
            }
        }
    }

    fn dispatch_data(&self, payload: &Value) {
        let Some(server_id) = payload.get("subscriptionId").and_then(Value::as_str) else {
            trace!("data push without subscriptionId");
            return;
        };
        let Some(record) = self
            .by_server_id
            .get(server_id)
            .and_then(|query_id| self.records.get(query_id))
        else {
            trace!(subscription_id = server_id, "dropping data for unknown subscription");
            return;
        };
        let result = payload.get("result").cloned().unwrap_or(Value::Null);
        match extract_data(result) {
            Ok(data) => record.stream.emit(StreamEvent::Data(data)),
            Err(err) => record.stream.emit(StreamEvent::Error(err)),
        }
    }

    fn on_transport_error(&mut self, err: ClientError) {
        let err = match err {
            ClientError::Channel(_) => err,
            other => ClientError::Channel(other.to_string()),
        };
        warn!(error = %err, "subscription channel failed");

        self.connecting = None;
        self.sink = None;
        self.inbound = None;
        self.heartbeat = None;
        self.replies.clear();
        self.by_server_id.clear();
        self.set_state(ChannelState::Disconnected);

        for (_, pending) in self.pending.drain() {
            for waiter in pending.waiters {
                let _ = waiter.send(Err(err.clone()));
            }
        }
        for record in self.records.values_mut() {
            record.server_subscription_id = None;
            record.stream.emit(StreamEvent::Error(err.clone()));
        }

        self.failures += 1;
        match self.config.reconnect.delay_after(self.failures) {
            Some(delay) => {
                debug!(?delay, failures = self.failures, "reconnect scheduled");
                self.retry_at = Some(Instant::now() + delay);
            }
            None => error!(failures = self.failures, "giving up on subscription channel"),
        }
    }

    async fn teardown(&mut self) {
        self.retry_at = None;
        self.heartbeat = None;
        self.connecting = None;
        self.inbound = None;
        if let Some(mut sink) = self.sink.take() {
            let _ = tokio::time::timeout(Duration::from_secs(1), sink.close()).await;
        }

        for (_, pending) in self.pending.drain() {
            for waiter in pending.waiters {
                let _ = waiter.send(Err(ClientError::ChannelClosed));
            }
        }
        for (_, record) in self.records.drain() {
            record.stream.emit(StreamEvent::Complete);
        }
        self.by_server_id.clear();
        self.replies.clear();
        self.set_state(ChannelState::Disconnected);
        debug!("subscription driver stopped");
    }
}

async fn poll_connecting(
    slot: &mut Option<BoxFuture<'static, Result<ChannelConnection>>>,
) -> Result<ChannelConnection> {
    match slot {
        Some(connecting) => connecting.await,
        None => future::pending().await,
    }
}

async fn next_frame(stream: &mut Option<FrameStream>) -> Option<Result<ChannelMessage>> {
    match stream {
        Some(stream) => stream.next().await,
        None => future::pending().await,
    }
}

async fn retry_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

async fn heartbeat_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}
