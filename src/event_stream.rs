use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::ClientError;

/// Stable fingerprint of a fully rendered operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(String);

impl QueryId {
    pub fn for_operation(operation: &str) -> Self {
        QueryId(blake3::hash(operation.as_bytes()).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Data,
    Error,
    Complete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A `data` payload pushed by the server.
    Data(Value),
    Error(ClientError),
    /// The subscription was removed or the multiplexer shut down.
    Complete,
}

impl StreamEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StreamEvent::Data(_) => EventKind::Data,
            StreamEvent::Error(_) => EventKind::Error,
            StreamEvent::Complete => EventKind::Complete,
        }
    }
}

type Callback = Box<dyn Fn(&StreamEvent) + Send + Sync>;

struct Consumers {
    /// Events emitted before anyone listened; handed to the first consumer.
    backlog: Option<Vec<StreamEvent>>,
    listeners: Vec<mpsc::UnboundedSender<StreamEvent>>,
    callbacks: Vec<(EventKind, Callback)>,
}

struct Shared {
    query_id: QueryId,
    consumers: Mutex<Consumers>,
}

/// Event handle for one subscription. Clones share the same underlying stream.
///
/// Events emitted before the first [`EventStream::listen`] or [`EventStream::on`]
/// are kept and delivered to that first consumer, in emission order.
#[derive(Clone)]
pub struct EventStream {
    shared: Arc<Shared>,
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let consumers = self.shared.consumers.lock();
        f.debug_struct("EventStream")
            .field("query_id", &self.shared.query_id)
            .field("listeners", &consumers.listeners.len())
            .field("callbacks", &consumers.callbacks.len())
            .finish()
    }
}

impl EventStream {
    pub fn new(query_id: QueryId) -> Self {
        EventStream {
            shared: Arc::new(Shared {
                query_id,
                consumers: Mutex::new(Consumers {
                    backlog: Some(Vec::new()),
                    listeners: Vec::new(),
                    callbacks: Vec::new(),
                }),
            }),
        }
    }

    pub fn query_id(&self) -> &QueryId {
        &self.shared.query_id
    }

    /// Registers `callback` for every future event of `kind`.
    ///
    /// Callbacks run on the emitting task and must not touch this stream.
    pub fn on<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        let mut consumers = self.shared.consumers.lock();
        for event in consumers.backlog.take().into_iter().flatten() {
            if event.kind() == kind {
                callback(&event);
            }
        }
        consumers.callbacks.push((kind, Box::new(callback)));
    }

    pub fn emit(&self, event: StreamEvent) {
        let mut consumers = self.shared.consumers.lock();
        if let Some(backlog) = consumers.backlog.as_mut() {
            trace!(query_id = %self.shared.query_id, "holding event until first consumer");
            backlog.push(event);
            return;
        }
        let kind = event.kind();
        for (wanted, callback) in consumers.callbacks.iter() {
            if *wanted == kind {
                callback(&event);
            }
        }
        consumers
            .listeners
            .retain(|listener| listener.send(event.clone()).is_ok());
    }

    /// A receiver for events emitted from now on, plus any held backlog.
    pub fn listen(&self) -> EventReceiver {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut consumers = self.shared.consumers.lock();
        for event in consumers.backlog.take().into_iter().flatten() {
            let _ = sender.send(event);
        }
        consumers.listeners.push(sender);
        EventReceiver { receiver }
    }

    pub fn same_stream(&self, other: &EventStream) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

pub struct EventReceiver {
    receiver: mpsc::UnboundedReceiver<StreamEvent>,
}

impl EventReceiver {
    /// Next event in emission order; `None` once every stream handle is gone.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`EventReceiver::next`].
    pub fn try_next(&mut self) -> Option<StreamEvent> {
        self.receiver.try_recv().ok()
    }
}
