pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod event_stream;
pub mod introspection;
pub mod operation_registry;
pub mod query_builder;
pub mod request_dispatcher;
pub mod subscription_multiplexer;
pub mod type_graph;

pub use channel::{ChannelConnector, WebSocketConnector};
pub use client::{Client, ClientBuilder};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use event_stream::{EventKind, EventStream, QueryId, StreamEvent};
pub use operation_registry::{GenerateFlags, OperationRegistry};
pub use query_builder::{BuildOptions, ExclusionPredicate, IgnoredFields, OperationDescriptor};
pub use request_dispatcher::{HttpRequestDispatcher, RequestDispatcher};
pub use subscription_multiplexer::{ChannelState, ReconnectPolicy, SubscriptionMultiplexer};
pub use type_graph::TypeGraph;

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    /// Lookup order used when an operation is addressed by name only.
    pub const ALL: [OperationKind; 3] = [
        OperationKind::Query,
        OperationKind::Mutation,
        OperationKind::Subscription,
    ];

    pub fn keyword(self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }

    /// Root type name assumed when the schema has no `schema { .. }` block.
    pub fn conventional_root(self) -> &'static str {
        match self {
            OperationKind::Query => "Query",
            OperationKind::Mutation => "Mutation",
            OperationKind::Subscription => "Subscription",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

impl std::str::FromStr for OperationKind {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "query" | "queries" => Ok(OperationKind::Query),
            "mutation" | "mutations" => Ok(OperationKind::Mutation),
            "subscription" | "subscriptions" => Ok(OperationKind::Subscription),
            other => Err(ClientError::Config(format!("unknown operation kind `{}`", other))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct GraphQLRequest {
    pub query: String,
}
