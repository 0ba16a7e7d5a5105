//! Wire protocol and transport seam for the subscription channel.
//!
//! Frames follow the Phoenix v1 JSON serializer used by Absinthe:
//! `{"topic": .., "event": .., "payload": .., "ref": ..}`. The client joins
//! a single control topic and pushes `doc` messages to start subscriptions;
//! results arrive as `subscription:data` pushes.

use async_trait::async_trait;
use futures::future;
use futures::stream::BoxStream;
use futures::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::pin::Pin;
use std::sync::Once;
use std::time::Duration;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};

pub const CONTROL_TOPIC: &str = "__absinthe__:control";
pub const HEARTBEAT_TOPIC: &str = "phoenix";

pub const JOIN_EVENT: &str = "phx_join";
pub const REPLY_EVENT: &str = "phx_reply";
pub const ERROR_EVENT: &str = "phx_error";
pub const CLOSE_EVENT: &str = "phx_close";
pub const HEARTBEAT_EVENT: &str = "heartbeat";
pub const DOC_EVENT: &str = "doc";
pub const UNSUBSCRIBE_EVENT: &str = "unsubscribe";
pub const DATA_EVENT: &str = "subscription:data";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub msg_ref: Option<String>,
}

impl ChannelMessage {
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        ChannelMessage {
            topic: topic.into(),
            event: event.into(),
            payload,
            msg_ref: None,
        }
    }

    pub fn with_ref(mut self, msg_ref: impl Into<String>) -> Self {
        self.msg_ref = Some(msg_ref.into());
        self
    }

    pub fn join(msg_ref: impl Into<String>) -> Self {
        ChannelMessage::new(CONTROL_TOPIC, JOIN_EVENT, json!({})).with_ref(msg_ref)
    }

    pub fn doc(msg_ref: impl Into<String>, query: &str) -> Self {
        ChannelMessage::new(CONTROL_TOPIC, DOC_EVENT, json!({ "query": query })).with_ref(msg_ref)
    }

    pub fn unsubscribe(msg_ref: impl Into<String>, subscription_id: &str) -> Self {
        ChannelMessage::new(
            CONTROL_TOPIC,
            UNSUBSCRIBE_EVENT,
            json!({ "subscriptionId": subscription_id }),
        )
        .with_ref(msg_ref)
    }

    pub fn heartbeat(msg_ref: impl Into<String>) -> Self {
        ChannelMessage::new(HEARTBEAT_TOPIC, HEARTBEAT_EVENT, json!({})).with_ref(msg_ref)
    }

    /// Builds the server's reply to `request`.
    pub fn reply(request: &ChannelMessage, ok: bool, response: Value) -> Self {
        let status = if ok { "ok" } else { "error" };
        ChannelMessage {
            topic: request.topic.clone(),
            event: REPLY_EVENT.to_string(),
            payload: json!({ "status": status, "response": response }),
            msg_ref: request.msg_ref.clone(),
        }
    }

    /// Builds a `subscription:data` push.
    pub fn data(subscription_id: &str, data: Value) -> Self {
        ChannelMessage::new(
            subscription_id,
            DATA_EVENT,
            json!({ "subscriptionId": subscription_id, "result": { "data": data } }),
        )
    }

    pub fn is_heartbeat(&self) -> bool {
        self.topic == HEARTBEAT_TOPIC && self.event == HEARTBEAT_EVENT
    }

    /// Interprets a `phx_reply` payload; `None` for any other event.
    pub fn reply_status(&self) -> Option<Reply> {
        if self.event != REPLY_EVENT {
            return None;
        }
        let response = self.payload.get("response").cloned().unwrap_or(Value::Null);
        match self.payload.get("status").and_then(Value::as_str) {
            Some("ok") => Some(Reply::Ok(response)),
            _ => Some(Reply::Error(response)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok(Value),
    Error(Value),
}

impl Reply {
    /// Human readable reason carried by an error reply.
    pub fn reason(response: &Value) -> String {
        response
            .get("reason")
            .or_else(|| response.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| response.to_string())
    }
}

pub type FrameSink = Pin<Box<dyn Sink<ChannelMessage, Error = ClientError> + Send>>;
pub type FrameStream = BoxStream<'static, Result<ChannelMessage>>;

/// An open bidirectional connection carrying channel frames.
pub struct ChannelConnection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens connections for the multiplexer. The websocket implementation is the default.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<ChannelConnection>;
}

pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        WebSocketConnector {
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        WebSocketConnector { connect_timeout }
    }
}

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<ChannelConnection> {
        if url.starts_with("wss://") {
            install_crypto_provider();
        }
        let connecting = tokio_tungstenite::connect_async(url);
        let (socket, _) = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| ClientError::Channel(format!("timed out connecting to {}", url)))?
            .map_err(|e| ClientError::Channel(format!("failed to connect to {}: {}", url, e)))?;
        debug!(%url, "websocket connected");

        let (write, read) = socket.split();
        let sink = write
            .sink_map_err(|e| ClientError::Channel(e.to_string()))
            .with(|message: ChannelMessage| future::ready(encode_frame(&message)));
        let stream = read.filter_map(|frame| future::ready(decode_frame(frame)));

        Ok(ChannelConnection {
            sink: Box::pin(sink),
            stream: stream.boxed(),
        })
    }
}

/// Selects ring for TLS unless the process already installed a provider.
fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if rustls::crypto::ring::default_provider().install_default().is_err() {
            debug!("rustls crypto provider already installed");
        }
    });
}

fn encode_frame(message: &ChannelMessage) -> Result<Message> {
    let text = serde_json::to_string(message)
        .map_err(|e| ClientError::Channel(format!("failed to encode frame: {}", e)))?;
    Ok(Message::Text(text.into()))
}

fn decode_frame(
    frame: std::result::Result<Message, tungstenite::Error>,
) -> Option<Result<ChannelMessage>> {
    match frame {
        Ok(Message::Text(text)) => match serde_json::from_str(text.as_str()) {
            Ok(message) => Some(Ok(message)),
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                None
            }
        },
        Ok(Message::Close(close)) => Some(Err(ClientError::Channel(match close {
            Some(close) => format!("closed by server: {} {}", close.code, close.reason.as_str()),
            None => "closed by server".to_string(),
        }))),
        Ok(_) => None,
        Err(e) => Some(Err(ClientError::Channel(e.to_string()))),
    }
}
