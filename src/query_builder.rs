use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::OperationKind;
use crate::error::{ClientError, Result};
use crate::type_graph::{TypeDef, TypeGraph, TypeKind, TypeRef};

/// Decides whether a field is left out of generated selection sets.
pub trait ExclusionPredicate: Send + Sync {
    fn is_excluded(&self, type_name: &str, field_name: &str) -> bool;
}

impl<F> ExclusionPredicate for F
where
    F: Fn(&str, &str) -> bool + Send + Sync,
{
    fn is_excluded(&self, type_name: &str, field_name: &str) -> bool {
        self(type_name, field_name)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoExclusions;

impl ExclusionPredicate for NoExclusions {
    fn is_excluded(&self, _type_name: &str, _field_name: &str) -> bool {
        false
    }
}

/// Table of ignored fields per type, usually read from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoredFields {
    fields: HashMap<String, HashSet<String>>,
}

impl IgnoredFields {
    pub fn new() -> Self {
        IgnoredFields::default()
    }

    pub fn ignore(mut self, type_name: impl Into<String>, field_name: impl Into<String>) -> Self {
        self.fields
            .entry(type_name.into())
            .or_default()
            .insert(field_name.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.values().all(HashSet::is_empty)
    }
}

impl From<HashMap<String, Vec<String>>> for IgnoredFields {
    fn from(table: HashMap<String, Vec<String>>) -> Self {
        IgnoredFields {
            fields: table
                .into_iter()
                .map(|(type_name, fields)| (type_name, fields.into_iter().collect()))
                .collect(),
        }
    }
}

impl ExclusionPredicate for IgnoredFields {
    fn is_excluded(&self, type_name: &str, field_name: &str) -> bool {
        self.fields
            .get(type_name)
            .is_some_and(|fields| fields.contains(field_name))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// Maximum number of nested object levels below an operation field.
    pub max_depth: Option<usize>,
}

/// Declared shape of one operation argument.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgumentShape {
    pub name: String,
    pub ty: TypeRef,
    pub required: bool,
    pub default_value: Option<Value>,
}

/// A generated operation: its identity, argument shape and builder.
#[derive(Clone)]
pub struct OperationDescriptor {
    name: String,
    kind: OperationKind,
    args_shape: Vec<ArgumentShape>,
    selection: Option<String>,
    graph: Arc<TypeGraph>,
}

impl fmt::Debug for OperationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("args_shape", &self.args_shape)
            .field("selection", &self.selection)
            .finish()
    }
}

impl OperationDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn args_shape(&self) -> &[ArgumentShape] {
        &self.args_shape
    }

    pub fn argument(&self, name: &str) -> Option<&ArgumentShape> {
        self.args_shape.iter().find(|shape| shape.name == name)
    }

    /// The selection set rendered at generation time; `None` for leaf results.
    pub fn selection_set(&self) -> Option<&str> {
        self.selection.as_deref()
    }

    /// Renders the operation text for the given call-time arguments.
    pub fn build(&self, args: &Map<String, Value>) -> Result<String> {
        if let Some(unknown) = args.keys().find(|key| self.argument(key).is_none()) {
            return Err(ClientError::UnknownArgument {
                operation: self.name.clone(),
                argument: unknown.clone(),
            });
        }

        let mut rendered = Vec::new();
        for shape in &self.args_shape {
            let value = match args.get(&shape.name) {
                None | Some(Value::Null) if shape.required => {
                    return Err(ClientError::MissingArgument {
                        operation: self.name.clone(),
                        argument: shape.name.clone(),
                    });
                }
                None => continue,
                Some(value) => value,
            };
            let mut literal = String::new();
            render_literal(&self.graph, &shape.ty, value, &mut literal).map_err(|reason| {
                ClientError::InvalidArgument {
                    operation: self.name.clone(),
                    argument: shape.name.clone(),
                    reason,
                }
            })?;
            rendered.push(format!("{}: {}", shape.name, literal));
        }

        let mut operation = format!("{} {} {{ {}", self.kind.keyword(), self.name, self.name);
        if !rendered.is_empty() {
            operation.push('(');
            operation.push_str(&rendered.join(", "));
            operation.push(')');
        }
        if let Some(selection) = &self.selection {
            operation.push(' ');
            operation.push_str(selection);
        }
        operation.push_str(" }");
        Ok(operation)
    }
}

/// Walks a type graph from a root type and produces one builder per root field.
pub struct QueryBuilderEngine<'a> {
    graph: &'a Arc<TypeGraph>,
    exclusion: &'a dyn ExclusionPredicate,
    options: BuildOptions,
}

impl<'a> QueryBuilderEngine<'a> {
    pub fn new(
        graph: &'a Arc<TypeGraph>,
        exclusion: &'a dyn ExclusionPredicate,
        options: BuildOptions,
    ) -> Self {
        QueryBuilderEngine {
            graph,
            exclusion,
            options,
        }
    }

    /// Generates descriptors for every field of `root_type_name`, in declaration order.
    ///
    /// Any unresolvable type aborts the whole generation.
    pub fn build_operations(
        &self,
        root_type_name: &str,
        kind: OperationKind,
    ) -> Result<Vec<OperationDescriptor>> {
        let graph: &'a TypeGraph = self.graph;
        let root = graph.get(root_type_name).ok_or_else(|| {
            ClientError::SchemaInconsistency(format!(
                "{} root type `{}` is not defined",
                kind, root_type_name
            ))
        })?;
        if root.kind != TypeKind::Object {
            return Err(ClientError::SchemaInconsistency(format!(
                "{} root type `{}` is not an object type",
                kind, root_type_name
            )));
        }

        let mut operations = Vec::with_capacity(root.fields.len());
        for field in &root.fields {
            if self.exclusion.is_excluded(&root.name, &field.name) {
                debug!(operation = %field.name, %kind, "operation excluded");
                continue;
            }

            let mut args_shape = Vec::with_capacity(field.arguments.len());
            for argument in &field.arguments {
                let arg_type = graph.resolve(argument.ty.type_name())?;
                if !matches!(
                    arg_type.kind,
                    TypeKind::Scalar | TypeKind::Enum | TypeKind::InputObject
                ) {
                    return Err(ClientError::SchemaInconsistency(format!(
                        "argument `{}.{}({})` uses output type `{}`",
                        root.name, field.name, argument.name, arg_type.name
                    )));
                }
                args_shape.push(ArgumentShape {
                    name: argument.name.clone(),
                    ty: argument.ty.clone(),
                    required: argument.is_required(),
                    default_value: argument.default_value.clone(),
                });
            }

            let mut walker = SelectionWalker {
                graph,
                exclusion: self.exclusion,
                max_depth: self.options.max_depth,
                path: vec![root.name.as_str()],
            };
            let selection = match walker.select(field.ty.type_name())? {
                Selection::Leaf => None,
                Selection::Set(set) => Some(set),
                Selection::Empty => Some("{ __typename }".to_string()),
            };

            trace!(operation = %field.name, ?selection, "generated builder");
            operations.push(OperationDescriptor {
                name: field.name.clone(),
                kind,
                args_shape,
                selection,
                graph: Arc::clone(self.graph),
            });
        }

        debug!(
            root = root_type_name,
            %kind,
            count = operations.len(),
            "generated operations"
        );
        Ok(operations)
    }
}

/// Convenience wrapper around [`QueryBuilderEngine::build_operations`].
pub fn build_operations(
    graph: &Arc<TypeGraph>,
    root_type_name: &str,
    kind: OperationKind,
    exclusion: &dyn ExclusionPredicate,
    options: BuildOptions,
) -> Result<Vec<OperationDescriptor>> {
    QueryBuilderEngine::new(graph, exclusion, options).build_operations(root_type_name, kind)
}

enum Selection {
    Leaf,
    Empty,
    Set(String),
}

impl Selection {
    fn from_items(items: Vec<String>) -> Self {
        if items.is_empty() {
            Selection::Empty
        } else {
            Selection::Set(format!("{{ {} }}", items.join(" ")))
        }
    }
}

struct SelectionWalker<'a> {
    graph: &'a TypeGraph,
    exclusion: &'a dyn ExclusionPredicate,
    max_depth: Option<usize>,
    /// Types on the current recursion path, root first.
    path: Vec<&'a str>,
}

impl<'a> SelectionWalker<'a> {
    fn select(&mut self, type_name: &str) -> Result<Selection> {
        let graph = self.graph;
        let type_def = graph.resolve(type_name)?;
        match type_def.kind {
            TypeKind::Scalar | TypeKind::Enum => Ok(Selection::Leaf),
            TypeKind::InputObject => Err(ClientError::SchemaInconsistency(format!(
                "input type `{}` is used as an output type",
                type_name
            ))),
            TypeKind::Object | TypeKind::Interface => {
                self.path.push(&type_def.name);
                let items = self.select_fields(type_def);
                self.path.pop();
                Ok(Selection::from_items(items?))
            }
            TypeKind::Union => {
                self.path.push(&type_def.name);
                let items = self.select_members(type_def);
                self.path.pop();
                Ok(Selection::from_items(items?))
            }
        }
    }

    fn can_descend_into(&self, type_name: &str) -> bool {
        if self.path.iter().any(|seen| *seen == type_name) {
            trace!(type_name, path = ?self.path, "cycle truncated");
            return false;
        }
        // The root type does not count as a nesting level.
        self.max_depth
            .is_none_or(|max_depth| self.path.len() - 1 < max_depth)
    }

    fn select_fields(&mut self, type_def: &'a TypeDef) -> Result<Vec<String>> {
        let graph = self.graph;
        let mut items = Vec::new();
        for field in &type_def.fields {
            if self.exclusion.is_excluded(&type_def.name, &field.name) {
                continue;
            }
            let target = graph.resolve(field.ty.type_name())?;
            if field.has_required_arguments() {
                trace!(type_name = %type_def.name, field = %field.name, "skipping field with required arguments");
                continue;
            }
            if target.is_leaf() {
                items.push(field.name.clone());
                continue;
            }
            if !self.can_descend_into(&target.name) {
                continue;
            }
            match self.select(&target.name)? {
                Selection::Set(set) => items.push(format!("{} {}", field.name, set)),
                Selection::Leaf => items.push(field.name.clone()),
                Selection::Empty => {}
            }
        }
        Ok(items)
    }

    fn select_members(&mut self, type_def: &'a TypeDef) -> Result<Vec<String>> {
        let graph = self.graph;
        let mut items = vec!["__typename".to_string()];
        for member in &type_def.possible_types {
            let member_def = graph.resolve(member)?;
            if member_def.kind != TypeKind::Object {
                return Err(ClientError::SchemaInconsistency(format!(
                    "union `{}` member `{}` is not an object type",
                    type_def.name, member
                )));
            }
            if !self.can_descend_into(&member_def.name) {
                continue;
            }
            if let Selection::Set(set) = self.select(&member_def.name)? {
                items.push(format!("... on {} {}", member_def.name, set));
            }
        }
        Ok(items)
    }
}

fn render_literal(
    graph: &TypeGraph,
    ty: &TypeRef,
    value: &Value,
    out: &mut String,
) -> std::result::Result<(), String> {
    match ty {
        TypeRef::NonNull(inner) => {
            if value.is_null() {
                return Err(format!("null given for non-null type `{}`", ty));
            }
            render_literal(graph, inner, value, out)
        }
        TypeRef::List(inner) => match value {
            Value::Null => {
                out.push_str("null");
                Ok(())
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    render_literal(graph, inner, item, out)?;
                }
                out.push(']');
                Ok(())
            }
            // Input coercion: a single value stands for a one-element list.
            single => render_literal(graph, inner, single, out),
        },
        TypeRef::Named(name) => {
            if value.is_null() {
                out.push_str("null");
                return Ok(());
            }
            let type_def = graph
                .get(name)
                .ok_or_else(|| format!("type `{}` is not defined", name))?;
            match type_def.kind {
                TypeKind::Enum => render_enum(type_def, value, out),
                TypeKind::InputObject => render_input_object(graph, type_def, value, out),
                TypeKind::Scalar => render_scalar(value, out),
                TypeKind::Object | TypeKind::Interface | TypeKind::Union => {
                    Err(format!("`{}` is an output type", name))
                }
            }
        }
    }
}

fn render_enum(type_def: &TypeDef, value: &Value, out: &mut String) -> std::result::Result<(), String> {
    let Value::String(name) = value else {
        return Err(format!("enum `{}` expects a string value", type_def.name));
    };
    let known = if type_def.enum_values.is_empty() {
        is_name(name)
    } else {
        type_def.enum_values.contains(name)
    };
    if !known {
        return Err(format!("`{}` is not a value of enum `{}`", name, type_def.name));
    }
    out.push_str(name);
    Ok(())
}

fn render_input_object(
    graph: &TypeGraph,
    type_def: &TypeDef,
    value: &Value,
    out: &mut String,
) -> std::result::Result<(), String> {
    let Value::Object(fields) = value else {
        return Err(format!("input type `{}` expects an object value", type_def.name));
    };
    if let Some(unknown) = fields.keys().find(|key| type_def.input_field(key).is_none()) {
        return Err(format!("input type `{}` has no field `{}`", type_def.name, unknown));
    }

    out.push('{');
    let mut first = true;
    for field in &type_def.input_fields {
        let field_value = match fields.get(&field.name) {
            None | Some(Value::Null) if field.is_required() => {
                return Err(format!(
                    "input type `{}` requires field `{}`",
                    type_def.name, field.name
                ));
            }
            None => continue,
            Some(field_value) => field_value,
        };
        if !first {
            out.push_str(", ");
        }
        first = false;
        out.push_str(&field.name);
        out.push_str(": ");
        render_literal(graph, &field.ty, field_value, out)?;
    }
    out.push('}');
    Ok(())
}

/// Custom scalars may carry arbitrary JSON, rendered as the equivalent GraphQL literal.
fn render_scalar(value: &Value, out: &mut String) -> std::result::Result<(), String> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
        Value::Number(number) => out.push_str(&number.to_string()),
        Value::String(text) => {
            out.push_str(&serde_json::to_string(text).map_err(|e| e.to_string())?);
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                render_scalar(item, out)?;
            }
            out.push(']');
        }
        Value::Object(fields) => {
            out.push('{');
            for (i, (key, item)) in fields.iter().enumerate() {
                if !is_name(key) {
                    return Err(format!("`{}` is not a valid GraphQL name", key));
                }
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(key);
                out.push_str(": ");
                render_scalar(item, out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn is_name(text: &str) -> bool {
    let mut chars = text.chars();
    chars
        .next()
        .is_some_and(|first| first == '_' || first.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}
