use graphql_parser::parse_schema;
use graphql_parser::schema::{Definition, TypeDefinition, TypeExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use crate::OperationKind;
use crate::error::{ClientError, Result};

const BUILTIN_SCALARS: [&str; 5] = ["String", "Int", "Float", "Boolean", "ID"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Object,
    Interface,
    Union,
    Scalar,
    Enum,
    InputObject,
}

/// A reference to a named type, possibly wrapped in list and non-null modifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeRef {
    Named(String),
    List(Box<TypeRef>),
    NonNull(Box<TypeRef>),
}

impl TypeRef {
    pub fn named(name: impl Into<String>) -> Self {
        TypeRef::Named(name.into())
    }

    pub fn list(inner: TypeRef) -> Self {
        TypeRef::List(Box::new(inner))
    }

    pub fn non_null(inner: TypeRef) -> Self {
        TypeRef::NonNull(Box::new(inner))
    }

    /// The innermost named type.
    pub fn type_name(&self) -> &str {
        match self {
            TypeRef::Named(name) => name,
            TypeRef::List(inner) | TypeRef::NonNull(inner) => inner.type_name(),
        }
    }

    pub fn is_non_null(&self) -> bool {
        matches!(self, TypeRef::NonNull(_))
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Named(name) => write!(f, "{}", name),
            TypeRef::List(inner) => write!(f, "[{}]", inner),
            TypeRef::NonNull(inner) => write!(f, "{}!", inner),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArgumentDef {
    pub name: String,
    pub ty: TypeRef,
    pub default_value: Option<Value>,
}

impl ArgumentDef {
    pub fn new(name: impl Into<String>, ty: TypeRef) -> Self {
        ArgumentDef {
            name: name.into(),
            ty,
            default_value: None,
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    /// Required arguments are non-null and carry no default.
    pub fn is_required(&self) -> bool {
        self.ty.is_non_null() && self.default_value.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub ty: TypeRef,
    pub arguments: Vec<ArgumentDef>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, ty: TypeRef) -> Self {
        FieldDef {
            name: name.into(),
            ty,
            arguments: Vec::new(),
        }
    }

    pub fn with_argument(mut self, argument: ArgumentDef) -> Self {
        self.arguments.push(argument);
        self
    }

    pub fn has_required_arguments(&self) -> bool {
        self.arguments.iter().any(ArgumentDef::is_required)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeDef {
    pub name: String,
    pub kind: TypeKind,
    /// Output fields of objects and interfaces, in declaration order.
    pub fields: Vec<FieldDef>,
    pub input_fields: Vec<ArgumentDef>,
    pub enum_values: Vec<String>,
    /// Members of a union, or implementors of an interface.
    pub possible_types: Vec<String>,
}

impl TypeDef {
    fn empty(name: impl Into<String>, kind: TypeKind) -> Self {
        TypeDef {
            name: name.into(),
            kind,
            fields: Vec::new(),
            input_fields: Vec::new(),
            enum_values: Vec::new(),
            possible_types: Vec::new(),
        }
    }

    pub fn scalar(name: impl Into<String>) -> Self {
        TypeDef::empty(name, TypeKind::Scalar)
    }

    pub fn object(name: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        TypeDef {
            fields,
            ..TypeDef::empty(name, TypeKind::Object)
        }
    }

    pub fn interface(name: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        TypeDef {
            fields,
            ..TypeDef::empty(name, TypeKind::Interface)
        }
    }

    pub fn union(name: impl Into<String>, members: Vec<String>) -> Self {
        TypeDef {
            possible_types: members,
            ..TypeDef::empty(name, TypeKind::Union)
        }
    }

    pub fn enumeration(name: impl Into<String>, values: Vec<String>) -> Self {
        TypeDef {
            enum_values: values,
            ..TypeDef::empty(name, TypeKind::Enum)
        }
    }

    pub fn input_object(name: impl Into<String>, fields: Vec<ArgumentDef>) -> Self {
        TypeDef {
            input_fields: fields,
            ..TypeDef::empty(name, TypeKind::InputObject)
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, TypeKind::Scalar | TypeKind::Enum)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn input_field(&self, name: &str) -> Option<&ArgumentDef> {
        self.input_fields.iter().find(|field| field.name == name)
    }
}

/// Read-only in-memory view of a schema.
#[derive(Debug, Clone)]
pub struct TypeGraph {
    types: HashMap<String, TypeDef>,
    roots: HashMap<OperationKind, String>,
}

impl Default for TypeGraph {
    fn default() -> Self {
        TypeGraph::new()
    }
}

impl TypeGraph {
    /// An empty graph holding only the built-in scalars.
    pub fn new() -> Self {
        let types = BUILTIN_SCALARS
            .iter()
            .map(|name| (name.to_string(), TypeDef::scalar(*name)))
            .collect();
        TypeGraph {
            types,
            roots: HashMap::new(),
        }
    }

    pub fn insert(&mut self, type_def: TypeDef) {
        self.types.insert(type_def.name.clone(), type_def);
    }

    pub fn set_root(&mut self, kind: OperationKind, type_name: impl Into<String>) {
        self.roots.insert(kind, type_name.into());
    }

    pub fn with_type(mut self, type_def: TypeDef) -> Self {
        self.insert(type_def);
        self
    }

    pub fn with_root(mut self, kind: OperationKind, type_name: impl Into<String>) -> Self {
        self.set_root(kind, type_name);
        self
    }

    /// Name of the root type for `kind`, if the schema declares one.
    pub fn root(&self, kind: OperationKind) -> Option<&str> {
        self.roots.get(&kind).map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }

    /// Like [`TypeGraph::get`], but a missing type is a schema inconsistency.
    pub fn resolve(&self, name: &str) -> Result<&TypeDef> {
        self.types.get(name).ok_or_else(|| {
            ClientError::SchemaInconsistency(format!("type `{}` is not defined", name))
        })
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeDef> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Checks every type reference and root name in the graph.
    pub fn validate(&self) -> Result<()> {
        for kind in OperationKind::ALL {
            if let Some(root) = self.root(kind) {
                let root_def = self.resolve(root).map_err(|_| {
                    ClientError::SchemaInconsistency(format!(
                        "{} root type `{}` is not defined",
                        kind, root
                    ))
                })?;
                if root_def.kind != TypeKind::Object {
                    return Err(ClientError::SchemaInconsistency(format!(
                        "{} root type `{}` is not an object type",
                        kind, root
                    )));
                }
            }
        }

        let mut names: Vec<&String> = self.types.keys().collect();
        names.sort();
        for name in names {
            let type_def = &self.types[name];
            for field in &type_def.fields {
                self.check_reference(name, &field.name, &field.ty)?;
                for argument in &field.arguments {
                    self.check_reference(name, &argument.name, &argument.ty)?;
                }
            }
            for field in &type_def.input_fields {
                self.check_reference(name, &field.name, &field.ty)?;
            }
            for member in &type_def.possible_types {
                self.resolve(member)?;
            }
        }
        Ok(())
    }

    fn check_reference(&self, owner: &str, member: &str, ty: &TypeRef) -> Result<()> {
        if self.types.contains_key(ty.type_name()) {
            Ok(())
        } else {
            Err(ClientError::SchemaInconsistency(format!(
                "`{}.{}` references undefined type `{}`",
                owner,
                member,
                ty.type_name()
            )))
        }
    }

    /// Builds a graph from an SDL document.
    pub fn from_sdl(sdl: &str) -> Result<Self> {
        let document =
            parse_schema::<String>(sdl).map_err(|e| ClientError::SchemaParse(e.to_string()))?;

        let mut graph = TypeGraph::new();
        let mut declared_roots = false;
        let mut implementors: Vec<(String, String)> = Vec::new();

        for definition in &document.definitions {
            match definition {
                Definition::SchemaDefinition(schema) => {
                    declared_roots = true;
                    let roots = [
                        (OperationKind::Query, &schema.query),
                        (OperationKind::Mutation, &schema.mutation),
                        (OperationKind::Subscription, &schema.subscription),
                    ];
                    for (kind, name) in roots {
                        if let Some(name) = name {
                            graph.set_root(kind, name.clone());
                        }
                    }
                }
                Definition::TypeDefinition(typedef) => match typedef {
                    TypeDefinition::Object(obj) => {
                        for interface in &obj.implements_interfaces {
                            implementors.push((interface.clone(), obj.name.clone()));
                        }
                        graph.insert(TypeDef::object(
                            obj.name.clone(),
                            obj.fields.iter().map(convert_field).collect(),
                        ));
                    }
                    TypeDefinition::Interface(iface) => {
                        graph.insert(TypeDef::interface(
                            iface.name.clone(),
                            iface.fields.iter().map(convert_field).collect(),
                        ));
                    }
                    TypeDefinition::Union(union_type) => {
                        graph.insert(TypeDef::union(
                            union_type.name.clone(),
                            union_type.types.clone(),
                        ));
                    }
                    TypeDefinition::Enum(enum_type) => {
                        graph.insert(TypeDef::enumeration(
                            enum_type.name.clone(),
                            enum_type.values.iter().map(|v| v.name.clone()).collect(),
                        ));
                    }
                    TypeDefinition::InputObject(input) => {
                        graph.insert(TypeDef::input_object(
                            input.name.clone(),
                            input.fields.iter().map(convert_input_value).collect(),
                        ));
                    }
                    TypeDefinition::Scalar(scalar) => {
                        graph.insert(TypeDef::scalar(scalar.name.clone()));
                    }
                },
                Definition::TypeExtension(extension) => graph.apply_extension(extension)?,
                Definition::DirectiveDefinition(_) => {}
            }
        }

        for (interface, object) in implementors {
            if let Some(type_def) = graph.types.get_mut(&interface) {
                type_def.possible_types.push(object);
            }
        }

        if !declared_roots {
            for kind in OperationKind::ALL {
                let conventional = kind.conventional_root();
                if graph.types.contains_key(conventional) {
                    graph.set_root(kind, conventional);
                }
            }
        }

        Ok(graph)
    }

    fn apply_extension(&mut self, extension: &TypeExtension<'_, String>) -> Result<()> {
        let (name, target) = match extension {
            TypeExtension::Object(ext) => (&ext.name, TypeKind::Object),
            TypeExtension::Interface(ext) => (&ext.name, TypeKind::Interface),
            TypeExtension::Union(ext) => (&ext.name, TypeKind::Union),
            TypeExtension::Enum(ext) => (&ext.name, TypeKind::Enum),
            TypeExtension::InputObject(ext) => (&ext.name, TypeKind::InputObject),
            TypeExtension::Scalar(_) => return Ok(()),
        };
        let type_def = self.types.get_mut(name).ok_or_else(|| {
            ClientError::SchemaInconsistency(format!("extension of undefined type `{}`", name))
        })?;
        if type_def.kind != target {
            return Err(ClientError::SchemaInconsistency(format!(
                "extension of `{}` does not match its kind",
                name
            )));
        }
        match extension {
            TypeExtension::Object(ext) => type_def.fields.extend(ext.fields.iter().map(convert_field)),
            TypeExtension::Interface(ext) => {
                type_def.fields.extend(ext.fields.iter().map(convert_field))
            }
            TypeExtension::Union(ext) => type_def.possible_types.extend(ext.types.iter().cloned()),
            TypeExtension::Enum(ext) => type_def
                .enum_values
                .extend(ext.values.iter().map(|v| v.name.clone())),
            TypeExtension::InputObject(ext) => type_def
                .input_fields
                .extend(ext.fields.iter().map(convert_input_value)),
            TypeExtension::Scalar(_) => {}
        }
        Ok(())
    }
}

fn convert_field(field: &graphql_parser::schema::Field<'_, String>) -> FieldDef {
    FieldDef {
        name: field.name.clone(),
        ty: convert_type(&field.field_type),
        arguments: field.arguments.iter().map(convert_input_value).collect(),
    }
}

fn convert_input_value(input: &graphql_parser::schema::InputValue<'_, String>) -> ArgumentDef {
    ArgumentDef {
        name: input.name.clone(),
        ty: convert_type(&input.value_type),
        default_value: input.default_value.as_ref().map(convert_value),
    }
}

fn convert_type(ty: &graphql_parser::schema::Type<'_, String>) -> TypeRef {
    match ty {
        graphql_parser::schema::Type::NamedType(name) => TypeRef::Named(name.clone()),
        graphql_parser::schema::Type::ListType(inner) => TypeRef::list(convert_type(inner)),
        graphql_parser::schema::Type::NonNullType(inner) => TypeRef::non_null(convert_type(inner)),
    }
}

fn convert_value(value: &graphql_parser::schema::Value<'_, String>) -> Value {
    use graphql_parser::schema::Value as Gql;
    match value {
        Gql::Null | Gql::Variable(_) => Value::Null,
        Gql::Int(number) => number.as_i64().map(Value::from).unwrap_or(Value::Null),
        Gql::Float(float) => serde_json::Number::from_f64(*float)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Gql::String(text) => Value::String(text.clone()),
        Gql::Boolean(flag) => Value::Bool(*flag),
        Gql::Enum(name) => Value::String(name.clone()),
        Gql::List(items) => Value::Array(items.iter().map(convert_value).collect()),
        Gql::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, value)| (key.clone(), convert_value(value)))
                .collect(),
        ),
    }
}
