use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::OperationKind;
use crate::error::{ClientError, Result};
use crate::query_builder::{BuildOptions, ExclusionPredicate, OperationDescriptor, QueryBuilderEngine};
use crate::type_graph::TypeGraph;

/// Per-kind switches deciding which builders get generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerateFlags {
    pub queries: bool,
    pub mutations: bool,
    pub subscriptions: bool,
}

impl Default for GenerateFlags {
    fn default() -> Self {
        GenerateFlags {
            queries: true,
            mutations: true,
            subscriptions: true,
        }
    }
}

impl GenerateFlags {
    pub fn enabled(&self, kind: OperationKind) -> bool {
        match kind {
            OperationKind::Query => self.queries,
            OperationKind::Mutation => self.mutations,
            OperationKind::Subscription => self.subscriptions,
        }
    }
}

/// Immutable set of generated operations, keyed by kind and name.
#[derive(Debug, Clone, Default)]
pub struct OperationRegistry {
    operations: Vec<OperationDescriptor>,
    index: HashMap<(OperationKind, String), usize>,
}

impl OperationRegistry {
    /// Generates every enabled kind from `graph`. Any inconsistency aborts the whole build.
    pub fn build(
        graph: Arc<TypeGraph>,
        flags: GenerateFlags,
        exclusion: &dyn ExclusionPredicate,
        options: BuildOptions,
    ) -> Result<Self> {
        graph.validate()?;
        if flags.queries && graph.root(OperationKind::Query).is_none() {
            return Err(ClientError::SchemaInconsistency(
                "schema declares no query root type".to_string(),
            ));
        }

        let engine = QueryBuilderEngine::new(&graph, exclusion, options);
        let mut registry = OperationRegistry::default();
        for kind in OperationKind::ALL {
            if !flags.enabled(kind) {
                debug!(%kind, "generation disabled");
                continue;
            }
            let Some(root) = graph.root(kind) else {
                continue;
            };
            for descriptor in engine.build_operations(root, kind)? {
                registry.insert(descriptor);
            }
        }
        Ok(registry)
    }

    fn insert(&mut self, descriptor: OperationDescriptor) {
        let key = (descriptor.kind(), descriptor.name().to_string());
        self.index.insert(key, self.operations.len());
        self.operations.push(descriptor);
    }

    /// Operation names of `kind`, in schema declaration order.
    pub fn list_by_kind(&self, kind: OperationKind) -> Vec<&str> {
        self.operations
            .iter()
            .filter(|op| op.kind() == kind)
            .map(OperationDescriptor::name)
            .collect()
    }

    pub fn queries(&self) -> Vec<&str> {
        self.list_by_kind(OperationKind::Query)
    }

    pub fn mutations(&self) -> Vec<&str> {
        self.list_by_kind(OperationKind::Mutation)
    }

    pub fn subscriptions(&self) -> Vec<&str> {
        self.list_by_kind(OperationKind::Subscription)
    }

    pub fn get(&self, kind: OperationKind, name: &str) -> Option<&OperationDescriptor> {
        self.index
            .get(&(kind, name.to_string()))
            .map(|&i| &self.operations[i])
    }

    /// Looks `name` up among queries, then mutations, then subscriptions.
    pub fn find(&self, name: &str) -> Option<&OperationDescriptor> {
        OperationKind::ALL
            .into_iter()
            .find_map(|kind| self.get(kind, name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &OperationDescriptor> {
        self.operations.iter()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
