use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::OperationKind;
use crate::channel::{ChannelConnector, WebSocketConnector};
use crate::config::{ClientConfig, http_to_ws_url};
use crate::error::{ClientError, Result};
use crate::event_stream::EventStream;
use crate::introspection::fetch_type_graph;
use crate::operation_registry::{GenerateFlags, OperationRegistry};
use crate::query_builder::{BuildOptions, ExclusionPredicate, NoExclusions, OperationDescriptor};
use crate::request_dispatcher::{HttpRequestDispatcher, RequestDispatcher};
use crate::subscription_multiplexer::{
    ChannelEndpoint, ChannelState, MultiplexerConfig, ReconnectPolicy, SubscriptionMultiplexer,
};
use crate::type_graph::TypeGraph;

/// Assembles a [`Client`] from a type graph plus transport settings.
pub struct ClientBuilder {
    graph: TypeGraph,
    url: Option<String>,
    flags: GenerateFlags,
    exclusion: Box<dyn ExclusionPredicate>,
    options: BuildOptions,
    request_timeout: Option<Duration>,
    dispatcher: Option<Arc<dyn RequestDispatcher>>,
    connector: Option<Arc<dyn ChannelConnector>>,
    endpoint: Option<ChannelEndpoint>,
    reconnect: ReconnectPolicy,
    heartbeat_interval: Option<Duration>,
}

impl ClientBuilder {
    pub fn new(graph: TypeGraph) -> Self {
        ClientBuilder {
            graph,
            url: None,
            flags: GenerateFlags::default(),
            exclusion: Box::new(NoExclusions),
            options: BuildOptions::default(),
            request_timeout: None,
            dispatcher: None,
            connector: None,
            endpoint: None,
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: Some(Duration::from_secs(30)),
        }
    }

    /// Applies every setting of `config`; later builder calls override it.
    pub fn config(mut self, config: &ClientConfig) -> Self {
        self.url = Some(config.url.clone());
        self.flags = config.generate_flags();
        self.exclusion = Box::new(config.ignored_fields());
        self.options = config.build_options();
        self.request_timeout = config.request_timeout();
        self.endpoint = Some(ChannelEndpoint::Url(config.channel_url()));
        self.reconnect = config.reconnect_policy();
        self.heartbeat_interval = config.heartbeat_interval();
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn generate(mut self, flags: GenerateFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn exclude(mut self, exclusion: impl ExclusionPredicate + 'static) -> Self {
        self.exclusion = Box::new(exclusion);
        self
    }

    pub fn build_options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn RequestDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn ChannelConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn channel_endpoint(mut self, endpoint: impl Into<ChannelEndpoint>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Generates the registry. Fails on any schema inconsistency.
    pub fn build(self) -> Result<Client> {
        let registry = OperationRegistry::build(
            Arc::new(self.graph),
            self.flags,
            self.exclusion.as_ref(),
            self.options,
        )?;

        let dispatcher = match (self.dispatcher, &self.url) {
            (Some(dispatcher), _) => Some(dispatcher),
            (None, Some(url)) => Some(http_dispatcher(url, self.request_timeout)?),
            (None, None) => None,
        };

        let endpoint = self
            .endpoint
            .or_else(|| self.url.as_deref().map(|url| ChannelEndpoint::Url(http_to_ws_url(url))));
        let multiplexer = endpoint.map(|endpoint| {
            let connector: Arc<dyn ChannelConnector> = match self.connector {
                Some(connector) => connector,
                None => Arc::new(WebSocketConnector::default()),
            };
            SubscriptionMultiplexer::new(
                MultiplexerConfig {
                    endpoint,
                    reconnect: self.reconnect,
                    heartbeat_interval: self.heartbeat_interval,
                },
                connector,
            )
        });

        info!(
            queries = registry.queries().len(),
            mutations = registry.mutations().len(),
            subscriptions = registry.subscriptions().len(),
            "client ready"
        );
        Ok(Client {
            registry,
            dispatcher,
            multiplexer,
        })
    }
}

fn http_dispatcher(url: &str, timeout: Option<Duration>) -> Result<Arc<dyn RequestDispatcher>> {
    let dispatcher = match timeout {
        Some(timeout) => HttpRequestDispatcher::with_timeout(url, timeout)?,
        None => HttpRequestDispatcher::new(url),
    };
    Ok(Arc::new(dispatcher))
}

/// Generated GraphQL client: one builder per root field plus the transports to run them.
pub struct Client {
    registry: OperationRegistry,
    dispatcher: Option<Arc<dyn RequestDispatcher>>,
    multiplexer: Option<SubscriptionMultiplexer>,
}

impl Client {
    pub fn builder(graph: TypeGraph) -> ClientBuilder {
        ClientBuilder::new(graph)
    }

    /// Introspects `config.url` and builds a client for the returned schema.
    pub async fn connect(config: &ClientConfig) -> Result<Client> {
        let dispatcher = http_dispatcher(&config.url, config.request_timeout())?;
        let graph = fetch_type_graph(dispatcher.as_ref()).await?;
        ClientBuilder::new(graph)
            .config(config)
            .dispatcher(dispatcher)
            .build()
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn queries(&self) -> Vec<&str> {
        self.registry.queries()
    }

    pub fn mutations(&self) -> Vec<&str> {
        self.registry.mutations()
    }

    pub fn subscriptions(&self) -> Vec<&str> {
        self.registry.subscriptions()
    }

    pub fn operation(&self, kind: OperationKind, name: &str) -> Option<&OperationDescriptor> {
        self.registry.get(kind, name)
    }

    /// Renders `name` without sending it. Query names win over mutations and subscriptions.
    pub fn render(&self, name: &str, args: &Map<String, Value>) -> Result<String> {
        self.registry
            .find(name)
            .ok_or_else(|| ClientError::UnknownOperation(name.to_string()))?
            .build(args)
    }

    pub async fn query(&self, name: &str, args: &Map<String, Value>) -> Result<Value> {
        self.run(self.lookup(OperationKind::Query, name)?, args).await
    }

    pub async fn mutate(&self, name: &str, args: &Map<String, Value>) -> Result<Value> {
        self.run(self.lookup(OperationKind::Mutation, name)?, args).await
    }

    /// Runs the query or mutation called `name`.
    pub async fn execute(&self, name: &str, args: &Map<String, Value>) -> Result<Value> {
        let operation = self
            .registry
            .get(OperationKind::Query, name)
            .or_else(|| self.registry.get(OperationKind::Mutation, name))
            .ok_or_else(|| ClientError::UnknownOperation(name.to_string()))?;
        self.run(operation, args).await
    }

    pub async fn subscribe(&self, name: &str, args: &Map<String, Value>) -> Result<EventStream> {
        let operation = self.lookup(OperationKind::Subscription, name)?.build(args)?;
        self.multiplexer()?.subscribe(operation).await
    }

    pub async fn unsubscribe(&self, stream: &EventStream) -> Result<bool> {
        self.multiplexer()?.unsubscribe(stream.query_id()).await
    }

    pub fn channel_state(&self) -> ChannelState {
        self.multiplexer
            .as_ref()
            .map_or(ChannelState::Disconnected, SubscriptionMultiplexer::state)
    }

    pub async fn shutdown(&self) {
        if let Some(multiplexer) = &self.multiplexer {
            multiplexer.shutdown().await;
        }
    }

    fn lookup(&self, kind: OperationKind, name: &str) -> Result<&OperationDescriptor> {
        self.registry
            .get(kind, name)
            .ok_or_else(|| ClientError::UnknownOperation(format!("{} {}", kind, name)))
    }

    fn multiplexer(&self) -> Result<&SubscriptionMultiplexer> {
        self.multiplexer
            .as_ref()
            .ok_or_else(|| ClientError::Config("no subscription endpoint configured".to_string()))
    }

    async fn run(&self, operation: &OperationDescriptor, args: &Map<String, Value>) -> Result<Value> {
        // Argument errors surface before anything is sent.
        let rendered = operation.build(args)?;
        let dispatcher = self
            .dispatcher
            .as_ref()
            .ok_or_else(|| ClientError::Config("no GraphQL endpoint configured".to_string()))?;
        debug!(operation = operation.name(), kind = %operation.kind(), "executing");
        dispatcher.dispatch(&rendered).await
    }
}
