//! Patch operations and the slash-delimited path grammar.
//!
//! ```text
//! /elements/<id>                 whole element
//! /elements/<id>/<field>         single element field
//! /elements/-                    append: id comes from the value or is generated
//! /relationships/<id>[/<field>]  same shape for relationships
//! ```
//!
//! Id segments use JSON-pointer escaping (`~1` for `/`, `~0` for `~`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::model::now_millis;

/// Patch verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Add,
    Remove,
    Replace,
    Move,
    Copy,
    Test,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Add => "add",
            OpKind::Remove => "remove",
            OpKind::Replace => "replace",
            OpKind::Move => "move",
            OpKind::Copy => "copy",
            OpKind::Test => "test",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single mutation request as exchanged over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchOperation {
    pub op: OpKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Source path, `move` and `copy` only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub origin_timestamp: u64,
    /// Client-local counter, only used to correlate confirmations.
    #[serde(default)]
    pub client_sequence_number: u64,
    #[serde(default)]
    pub description: String,
}

impl PatchOperation {
    fn base(op: OpKind, path: impl Into<String>) -> Self {
        Self {
            op,
            path: path.into(),
            value: None,
            from: None,
            client_id: String::new(),
            origin_timestamp: now_millis(),
            client_sequence_number: 0,
            description: String::new(),
        }
    }

    pub fn add(path: impl Into<String>, value: Value) -> Self {
        let mut op = Self::base(OpKind::Add, path);
        op.value = Some(value);
        op
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self::base(OpKind::Remove, path)
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        let mut op = Self::base(OpKind::Replace, path);
        op.value = Some(value);
        op
    }

    pub fn move_from(from: impl Into<String>, path: impl Into<String>) -> Self {
        let mut op = Self::base(OpKind::Move, path);
        op.from = Some(from.into());
        op
    }

    pub fn copy_from(from: impl Into<String>, path: impl Into<String>) -> Self {
        let mut op = Self::base(OpKind::Copy, path);
        op.from = Some(from.into());
        op
    }

    pub fn test(path: impl Into<String>, value: Value) -> Self {
        let mut op = Self::base(OpKind::Test, path);
        op.value = Some(value);
        op
    }

    pub fn with_client(mut self, client_id: impl Into<String>, sequence: u64) -> Self {
        self.client_id = client_id.into();
        self.client_sequence_number = sequence;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Replace an append (`/<collection>/-`) target with a concrete id.
    ///
    /// For `add` the id is taken from `value.id` when present, otherwise from
    /// `generate`; the chosen id is written back into the value. Operations
    /// whose path is not an append, or does not parse, are returned as is.
    pub fn resolve_append(mut self, generate: impl FnOnce() -> String) -> Self {
        let Ok(path) = PatchPath::parse(&self.path) else {
            return self;
        };
        if path.target != PathTarget::Append {
            return self;
        }

        let from_value = match (&self.op, &self.value) {
            (OpKind::Add, Some(Value::Object(map))) => map
                .get("id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(str::to_owned),
            _ => None,
        };
        let id = from_value.unwrap_or_else(generate);

        if let (OpKind::Add, Some(Value::Object(map))) = (&self.op, &mut self.value) {
            map.insert("id".to_owned(), Value::String(id.clone()));
        }
        self.path = PatchPath::entity(path.collection, &id).to_string();
        self
    }
}

/// Top-level collection addressed by a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Elements,
    Relationships,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Elements => "elements",
            Collection::Relationships => "relationships",
        }
    }

    /// Singular noun for messages.
    pub fn noun(&self) -> &'static str {
        match self {
            Collection::Elements => "element",
            Collection::Relationships => "relationship",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Addressable element fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementField {
    DisplayName,
    Attributes,
    Behaviors,
    Position,
    Size,
    Stereotype,
    ParentContainerId,
    ContainedElementIds,
}

impl ElementField {
    pub const ALL: [ElementField; 8] = [
        ElementField::DisplayName,
        ElementField::Attributes,
        ElementField::Behaviors,
        ElementField::Position,
        ElementField::Size,
        ElementField::Stereotype,
        ElementField::ParentContainerId,
        ElementField::ContainedElementIds,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ElementField::DisplayName => "displayName",
            ElementField::Attributes => "attributes",
            ElementField::Behaviors => "behaviors",
            ElementField::Position => "position",
            ElementField::Size => "size",
            ElementField::Stereotype => "stereotype",
            ElementField::ParentContainerId => "parentContainerId",
            ElementField::ContainedElementIds => "containedElementIds",
        }
    }
}

/// Addressable relationship fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationshipField {
    SourceId,
    TargetId,
    Kind,
    SourceMultiplicity,
    TargetMultiplicity,
    SourceRole,
    TargetRole,
    Label,
}

impl RelationshipField {
    pub const ALL: [RelationshipField; 8] = [
        RelationshipField::SourceId,
        RelationshipField::TargetId,
        RelationshipField::Kind,
        RelationshipField::SourceMultiplicity,
        RelationshipField::TargetMultiplicity,
        RelationshipField::SourceRole,
        RelationshipField::TargetRole,
        RelationshipField::Label,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipField::SourceId => "sourceId",
            RelationshipField::TargetId => "targetId",
            RelationshipField::Kind => "kind",
            RelationshipField::SourceMultiplicity => "sourceMultiplicity",
            RelationshipField::TargetMultiplicity => "targetMultiplicity",
            RelationshipField::SourceRole => "sourceRole",
            RelationshipField::TargetRole => "targetRole",
            RelationshipField::Label => "label",
        }
    }
}

/// A field of either collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Element(ElementField),
    Relationship(RelationshipField),
}

impl Field {
    fn parse(collection: Collection, name: &str) -> Option<Self> {
        match collection {
            Collection::Elements => ElementField::ALL
                .into_iter()
                .find(|f| f.as_str() == name)
                .map(Field::Element),
            Collection::Relationships => RelationshipField::ALL
                .into_iter()
                .find(|f| f.as_str() == name)
                .map(Field::Relationship),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Element(f) => f.as_str(),
            Field::Relationship(f) => f.as_str(),
        }
    }

    /// JSON written when the field is removed, or `None` if it is required.
    pub fn cleared_value(&self) -> Option<Value> {
        match self {
            Field::Element(ElementField::DisplayName)
            | Field::Element(ElementField::Position)
            | Field::Element(ElementField::Size) => None,
            Field::Element(ElementField::Attributes)
            | Field::Element(ElementField::Behaviors)
            | Field::Element(ElementField::ContainedElementIds) => Some(Value::Array(Vec::new())),
            Field::Element(_) => Some(Value::Null),
            Field::Relationship(RelationshipField::SourceId)
            | Field::Relationship(RelationshipField::TargetId)
            | Field::Relationship(RelationshipField::Kind) => None,
            Field::Relationship(_) => Some(Value::Null),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity addressed by the second path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathTarget {
    Id(String),
    /// The `-` shorthand.
    Append,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path must start with '/': {0:?}")]
    MissingLeadingSlash(String),
    #[error("unknown collection '{segment}' in path {path}")]
    UnknownCollection { path: String, segment: String },
    #[error("path {0} does not name an entity id")]
    MissingId(String),
    #[error("path {0} has too many segments")]
    TooManySegments(String),
    #[error("unknown {collection} field '{field}'")]
    UnknownField { collection: Collection, field: String },
    #[error("append path {0} cannot address a field")]
    AppendWithField(String),
}

/// A parsed patch path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchPath {
    pub collection: Collection,
    pub target: PathTarget,
    pub field: Option<Field>,
}

impl PatchPath {
    /// Path to a whole entity.
    pub fn entity(collection: Collection, id: &str) -> Self {
        Self {
            collection,
            target: PathTarget::Id(id.to_owned()),
            field: None,
        }
    }

    pub fn parse(path: &str) -> Result<Self, PathError> {
        let rest = path
            .strip_prefix('/')
            .ok_or_else(|| PathError::MissingLeadingSlash(path.to_owned()))?;
        let segments: Vec<&str> = rest.split('/').collect();

        let collection = match segments[0] {
            "elements" => Collection::Elements,
            "relationships" => Collection::Relationships,
            other => {
                return Err(PathError::UnknownCollection {
                    path: path.to_owned(),
                    segment: other.to_owned(),
                })
            }
        };

        let target = match segments.get(1) {
            None | Some(&"") => return Err(PathError::MissingId(path.to_owned())),
            Some(&"-") => PathTarget::Append,
            Some(id) => PathTarget::Id(unescape(id)),
        };

        let field = match segments.len() {
            2 => None,
            3 => {
                if target == PathTarget::Append {
                    return Err(PathError::AppendWithField(path.to_owned()));
                }
                let name = segments[2];
                Some(
                    Field::parse(collection, name).ok_or_else(|| PathError::UnknownField {
                        collection,
                        field: name.to_owned(),
                    })?,
                )
            }
            _ => return Err(PathError::TooManySegments(path.to_owned())),
        };

        Ok(Self {
            collection,
            target,
            field,
        })
    }

    /// Concrete id, `None` for an append.
    pub fn id(&self) -> Option<&str> {
        match &self.target {
            PathTarget::Id(id) => Some(id),
            PathTarget::Append => None,
        }
    }

    pub fn is_entity(&self) -> bool {
        self.field.is_none()
    }

    /// The same path without its field segment.
    pub fn entity_path(&self) -> Self {
        Self {
            collection: self.collection,
            target: self.target.clone(),
            field: None,
        }
    }
}

impl fmt::Display for PatchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/", self.collection)?;
        match &self.target {
            PathTarget::Id(id) => f.write_str(&escape(id))?,
            PathTarget::Append => f.write_str("-")?,
        }
        if let Some(field) = &self.field {
            write!(f, "/{field}")?;
        }
        Ok(())
    }
}

fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

fn escape(id: &str) -> String {
    id.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_entity_path() {
        let path = PatchPath::parse("/elements/c1").unwrap();
        assert_eq!(path.collection, Collection::Elements);
        assert_eq!(path.id(), Some("c1"));
        assert!(path.is_entity());
    }

    #[test]
    fn test_parse_field_path() {
        let path = PatchPath::parse("/relationships/r1/targetMultiplicity").unwrap();
        assert_eq!(path.collection, Collection::Relationships);
        assert_eq!(
            path.field,
            Some(Field::Relationship(RelationshipField::TargetMultiplicity))
        );
    }

    #[test]
    fn test_parse_append() {
        let path = PatchPath::parse("/elements/-").unwrap();
        assert_eq!(path.target, PathTarget::Append);
        assert_eq!(
            PatchPath::parse("/elements/-/displayName"),
            Err(PathError::AppendWithField("/elements/-/displayName".into()))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            PatchPath::parse("elements/c1"),
            Err(PathError::MissingLeadingSlash(_))
        ));
        assert!(matches!(
            PatchPath::parse("/diagram/c1"),
            Err(PathError::UnknownCollection { .. })
        ));
        assert!(matches!(
            PatchPath::parse("/elements"),
            Err(PathError::MissingId(_))
        ));
        assert!(matches!(
            PatchPath::parse("/elements/"),
            Err(PathError::MissingId(_))
        ));
        assert!(matches!(
            PatchPath::parse("/elements/c1/position/x"),
            Err(PathError::TooManySegments(_))
        ));
        assert!(matches!(
            PatchPath::parse("/elements/c1/sourceId"),
            Err(PathError::UnknownField { .. })
        ));
    }

    #[test]
    fn test_escaped_ids_display_back() {
        let path = PatchPath::parse("/elements/a~1b~0c/displayName").unwrap();
        assert_eq!(path.id(), Some("a/b~c"));
        assert_eq!(path.to_string(), "/elements/a~1b~0c/displayName");
    }

    #[test]
    fn test_cleared_values() {
        assert_eq!(Field::Element(ElementField::DisplayName).cleared_value(), None);
        assert_eq!(
            Field::Element(ElementField::Attributes).cleared_value(),
            Some(json!([]))
        );
        assert_eq!(
            Field::Relationship(RelationshipField::Label).cleared_value(),
            Some(Value::Null)
        );
        assert_eq!(Field::Relationship(RelationshipField::Kind).cleared_value(), None);
    }

    #[test]
    fn test_resolve_append_uses_value_id() {
        let op = PatchOperation::add("/elements/-", json!({"id": "c9", "kind": "class"}))
            .resolve_append(|| "generated".into());
        assert_eq!(op.path, "/elements/c9");
    }

    #[test]
    fn test_resolve_append_generates_id() {
        let op = PatchOperation::add("/relationships/-", json!({"sourceId": "a", "targetId": "b", "kind": "dependency"}))
            .resolve_append(|| "gen-1".into());
        assert_eq!(op.path, "/relationships/gen-1");
        assert_eq!(op.value.unwrap()["id"], "gen-1");
    }

    #[test]
    fn test_resolve_append_leaves_concrete_paths() {
        let op = PatchOperation::remove("/elements/c1").resolve_append(|| unreachable!());
        assert_eq!(op.path, "/elements/c1");
    }

    #[test]
    fn test_operation_wire_shape() {
        let op = PatchOperation::replace("/elements/c1/displayName", json!("Customer"))
            .with_client("client-a", 7)
            .with_description("rename");
        let value = serde_json::to_value(&op).unwrap();

        assert_eq!(value["op"], "replace");
        assert_eq!(value["clientId"], "client-a");
        assert_eq!(value["clientSequenceNumber"], 7);
        assert!(value.get("from").is_none());

        let back: PatchOperation = serde_json::from_value(value).unwrap();
        assert_eq!(back, op);
    }
}
