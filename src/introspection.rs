use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::OperationKind;
use crate::error::{ClientError, Result};
use crate::request_dispatcher::RequestDispatcher;
use crate::type_graph::{ArgumentDef, FieldDef, TypeDef, TypeGraph, TypeRef};

/// Standard introspection query, deep enough for seven levels of type wrapping.
pub const INTROSPECTION_QUERY: &str = r#"query IntrospectionQuery {
  __schema {
    queryType { name }
    mutationType { name }
    subscriptionType { name }
    types {
      kind
      name
      fields(includeDeprecated: true) {
        name
        args { name type { ...TypeRef } defaultValue }
        type { ...TypeRef }
      }
      inputFields { name type { ...TypeRef } defaultValue }
      enumValues(includeDeprecated: true) { name }
      possibleTypes { name }
    }
  }
}

fragment TypeRef on __Type {
  kind
  name
  ofType {
    kind
    name
    ofType {
      kind
      name
      ofType {
        kind
        name
        ofType {
          kind
          name
          ofType {
            kind
            name
            ofType {
              kind
              name
              ofType { kind name }
            }
          }
        }
      }
    }
  }
}"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntrospectionSchema {
    query_type: Option<NamedRef>,
    mutation_type: Option<NamedRef>,
    subscription_type: Option<NamedRef>,
    types: Vec<IntrospectionType>,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntrospectionType {
    kind: String,
    name: String,
    #[serde(default)]
    fields: Option<Vec<IntrospectionField>>,
    #[serde(default)]
    input_fields: Option<Vec<IntrospectionInputValue>>,
    #[serde(default)]
    enum_values: Option<Vec<NamedRef>>,
    #[serde(default)]
    possible_types: Option<Vec<NamedRef>>,
}

#[derive(Debug, Deserialize)]
struct IntrospectionField {
    name: String,
    #[serde(default)]
    args: Vec<IntrospectionInputValue>,
    #[serde(rename = "type")]
    ty: IntrospectionTypeRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntrospectionInputValue {
    name: String,
    #[serde(rename = "type")]
    ty: IntrospectionTypeRef,
    default_value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntrospectionTypeRef {
    kind: String,
    name: Option<String>,
    of_type: Option<Box<IntrospectionTypeRef>>,
}

impl IntrospectionTypeRef {
    fn convert(&self) -> Result<TypeRef> {
        let inner = || {
            self.of_type.as_deref().ok_or_else(|| {
                ClientError::SchemaInconsistency(format!("{} type reference without ofType", self.kind))
            })
        };
        match self.kind.as_str() {
            "NON_NULL" => Ok(TypeRef::non_null(inner()?.convert()?)),
            "LIST" => Ok(TypeRef::list(inner()?.convert()?)),
            _ => self.name.clone().map(TypeRef::Named).ok_or_else(|| {
                ClientError::SchemaInconsistency(format!("unnamed {} type reference", self.kind))
            }),
        }
    }
}

impl IntrospectionInputValue {
    fn convert(&self) -> Result<ArgumentDef> {
        let mut argument = ArgumentDef::new(self.name.clone(), self.ty.convert()?);
        // Defaults arrive as GraphQL literals; only their presence affects requiredness.
        if let Some(literal) = &self.default_value {
            argument.default_value =
                Some(serde_json::from_str(literal).unwrap_or_else(|_| Value::String(literal.clone())));
        }
        Ok(argument)
    }
}

impl TypeGraph {
    /// Builds a graph from an introspection result, with or without the `data` envelope.
    pub fn from_introspection(response: &Value) -> Result<Self> {
        let schema = response
            .get("data")
            .unwrap_or(response)
            .get("__schema")
            .ok_or_else(|| {
                ClientError::SchemaParse("introspection result has no __schema".to_string())
            })?;
        let schema: IntrospectionSchema = serde_json::from_value(schema.clone())
            .map_err(|e| ClientError::SchemaParse(e.to_string()))?;

        let mut graph = TypeGraph::new();
        for introspected in &schema.types {
            if introspected.name.starts_with("__") {
                continue;
            }
            graph.insert(convert_type(introspected)?);
        }

        let roots = [
            (OperationKind::Query, &schema.query_type),
            (OperationKind::Mutation, &schema.mutation_type),
            (OperationKind::Subscription, &schema.subscription_type),
        ];
        for (kind, root) in roots {
            if let Some(root) = root {
                graph.set_root(kind, root.name.clone());
            }
        }

        debug!(types = graph.len(), "loaded type graph from introspection");
        Ok(graph)
    }
}

fn convert_type(introspected: &IntrospectionType) -> Result<TypeDef> {
    let name = introspected.name.clone();
    let fields = || -> Result<Vec<FieldDef>> {
        introspected
            .fields
            .iter()
            .flatten()
            .map(|field| {
                Ok(FieldDef {
                    name: field.name.clone(),
                    ty: field.ty.convert()?,
                    arguments: field
                        .args
                        .iter()
                        .map(IntrospectionInputValue::convert)
                        .collect::<Result<_>>()?,
                })
            })
            .collect()
    };
    let names = |refs: &Option<Vec<NamedRef>>| -> Vec<String> {
        refs.iter().flatten().map(|r| r.name.clone()).collect()
    };

    let type_def = match introspected.kind.as_str() {
        "OBJECT" => TypeDef::object(name, fields()?),
        "INTERFACE" => {
            let mut iface = TypeDef::interface(name, fields()?);
            iface.possible_types = names(&introspected.possible_types);
            iface
        }
        "UNION" => TypeDef::union(name, names(&introspected.possible_types)),
        "ENUM" => TypeDef::enumeration(name, names(&introspected.enum_values)),
        "INPUT_OBJECT" => TypeDef::input_object(
            name,
            introspected
                .input_fields
                .iter()
                .flatten()
                .map(IntrospectionInputValue::convert)
                .collect::<Result<_>>()?,
        ),
        "SCALAR" => TypeDef::scalar(name),
        other => {
            return Err(ClientError::SchemaParse(format!(
                "unsupported type kind `{}` for `{}`",
                other, introspected.name
            )));
        }
    };
    Ok(type_def)
}

/// Runs the introspection query through `dispatcher` and converts the answer.
pub async fn fetch_type_graph(dispatcher: &dyn RequestDispatcher) -> Result<TypeGraph> {
    let data = dispatcher.dispatch(INTROSPECTION_QUERY).await?;
    TypeGraph::from_introspection(&data)
}
