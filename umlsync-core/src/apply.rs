//! Structural application of a [`PatchOperation`] to a [`DiagramState`].
//!
//! Application does no domain validation: it only enforces what is needed to
//! keep the maps well formed (targets exist, ids do not collide, values
//! deserialize). Every successful application returns a [`ChangeRecord`]
//! holding what was overwritten so the operation can be reversed exactly.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::{DiagramState, Element, Relationship};
use crate::patch::{Collection, Field, OpKind, PatchOperation, PatchPath, PathError, PathTarget};

/// What an applied operation replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Concrete path the operation was applied at.
    pub path: String,
    /// JSON previously at `path`, `None` if nothing was there.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Value>,
    /// Relationships removed along with an element.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub detached_relationships: Vec<Relationship>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl ChangeRecord {
    fn at(path: &PatchPath) -> Self {
        Self {
            path: path.to_string(),
            previous: None,
            detached_relationships: Vec::new(),
            from: None,
        }
    }

    fn with_previous(mut self, previous: Value) -> Self {
        self.previous = Some(previous);
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApplyError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("'{0}' requires a value")]
    MissingValue(OpKind),
    #[error("'{0}' requires a 'from' path")]
    MissingFrom(OpKind),
    #[error("append path {0} must be resolved to an id before it is applied")]
    UnresolvedAppend(String),
    #[error("invalid value for {path}: {reason}")]
    InvalidValue { path: String, reason: String },
    #[error("{collection} '{id}' not found")]
    NotFound { collection: &'static str, id: String },
    #[error("{collection} '{id}' already exists")]
    AlreadyExists { collection: &'static str, id: String },
    #[error("value id '{value_id}' does not match path id '{path_id}'")]
    IdMismatch { path_id: String, value_id: String },
    #[error("field '{0}' is required and cannot be removed")]
    RequiredField(Field),
    #[error("only whole entities can be moved, not {0}")]
    FieldMove(String),
    #[error("cannot {op} between collections ({from} -> {path})")]
    CrossCollection { op: OpKind, from: String, path: String },
    #[error("cannot copy {from} into {path}: fields differ")]
    FieldMismatch { from: String, path: String },
    #[error("test failed: value at {0} differs")]
    TestFailed(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl DiagramState {
    /// Apply `op` in place. The version and timestamp are left untouched.
    ///
    /// On error the state may be partially modified; callers apply to a copy.
    pub fn apply_patch(&mut self, op: &PatchOperation) -> Result<ChangeRecord, ApplyError> {
        let path = PatchPath::parse(&op.path)?;
        if path.target == PathTarget::Append {
            return Err(ApplyError::UnresolvedAppend(op.path.clone()));
        }

        match op.op {
            OpKind::Add => {
                let value = required_value(op)?;
                if path.is_entity() {
                    self.insert_entity(&path, value)?;
                    Ok(ChangeRecord::at(&path))
                } else {
                    let previous = self.set_field(&path, value.clone())?;
                    Ok(ChangeRecord::at(&path).with_previous(previous))
                }
            }
            OpKind::Remove => self.remove_at(&path),
            OpKind::Replace => {
                let value = required_value(op)?;
                let previous = if path.is_entity() {
                    self.replace_entity(&path, value)?
                } else {
                    self.set_field(&path, value.clone())?
                };
                Ok(ChangeRecord::at(&path).with_previous(previous))
            }
            OpKind::Move => {
                let from = from_path(op)?;
                self.move_entity(&from, &path)?;
                let mut record = ChangeRecord::at(&path);
                record.from = Some(from.to_string());
                Ok(record)
            }
            OpKind::Copy => {
                let from = from_path(op)?;
                let mut record = self.copy_at(&from, &path)?;
                record.from = Some(from.to_string());
                Ok(record)
            }
            OpKind::Test => {
                let expected = required_value(op)?;
                match self.value_at(&path) {
                    Some(actual) if &actual == expected => Ok(ChangeRecord::at(&path)),
                    _ => Err(ApplyError::TestFailed(path.to_string())),
                }
            }
        }
    }

    /// JSON currently at `path`. Absent optional fields read as `null`.
    pub fn value_at(&self, path: &PatchPath) -> Option<Value> {
        let id = path.id()?;
        let entity = match path.collection {
            Collection::Elements => serde_json::to_value(self.elements.get(id)?).ok()?,
            Collection::Relationships => serde_json::to_value(self.relationships.get(id)?).ok()?,
        };
        match path.field {
            None => Some(entity),
            Some(field) => Some(entity.get(field.as_str()).cloned().unwrap_or(Value::Null)),
        }
    }

    fn contains(&self, collection: Collection, id: &str) -> bool {
        match collection {
            Collection::Elements => self.elements.contains_key(id),
            Collection::Relationships => self.relationships.contains_key(id),
        }
    }

    fn insert_entity(&mut self, path: &PatchPath, value: &Value) -> Result<(), ApplyError> {
        let id = entity_id(path)?;
        if self.contains(path.collection, id) {
            return Err(ApplyError::AlreadyExists {
                collection: path.collection.noun(),
                id: id.to_owned(),
            });
        }
        match path.collection {
            Collection::Elements => {
                let element: Element = decode_entity(path, value)?;
                self.elements.insert(id.to_owned(), element);
            }
            Collection::Relationships => {
                let relationship: Relationship = decode_entity(path, value)?;
                self.relationships.insert(id.to_owned(), relationship);
            }
        }
        Ok(())
    }

    fn replace_entity(&mut self, path: &PatchPath, value: &Value) -> Result<Value, ApplyError> {
        let previous = self.existing(path)?;
        let id = entity_id(path)?;
        match path.collection {
            Collection::Elements => {
                let element: Element = decode_entity(path, value)?;
                self.elements.insert(id.to_owned(), element);
            }
            Collection::Relationships => {
                let relationship: Relationship = decode_entity(path, value)?;
                self.relationships.insert(id.to_owned(), relationship);
            }
        }
        Ok(previous)
    }

    /// Current JSON of the entity behind `path`, or `NotFound`.
    fn existing(&self, path: &PatchPath) -> Result<Value, ApplyError> {
        let entity = path.entity_path();
        self.value_at(&entity).ok_or_else(|| ApplyError::NotFound {
            collection: path.collection.noun(),
            id: path.id().unwrap_or_default().to_owned(),
        })
    }

    /// Overwrite one field, returning its previous JSON.
    fn set_field(&mut self, path: &PatchPath, value: Value) -> Result<Value, ApplyError> {
        let Some(field) = path.field else {
            return Err(ApplyError::InvalidValue {
                path: path.to_string(),
                reason: "expected a field path".into(),
            });
        };
        let Value::Object(mut object) = self.existing(path)? else {
            return Err(ApplyError::Serialization(format!(
                "{} did not serialize to an object",
                path.entity_path()
            )));
        };
        let previous = object
            .insert(field.as_str().to_owned(), value)
            .unwrap_or(Value::Null);

        let id = entity_id(path)?;
        let updated = Value::Object(object);
        match path.collection {
            Collection::Elements => {
                let element: Element = decode(path, updated)?;
                self.elements.insert(id.to_owned(), element);
            }
            Collection::Relationships => {
                let relationship: Relationship = decode(path, updated)?;
                self.relationships.insert(id.to_owned(), relationship);
            }
        }
        Ok(previous)
    }

    fn remove_at(&mut self, path: &PatchPath) -> Result<ChangeRecord, ApplyError> {
        let id = entity_id(path)?.to_owned();

        if let Some(field) = path.field {
            let cleared = field
                .cleared_value()
                .ok_or(ApplyError::RequiredField(field))?;
            let previous = self.set_field(path, cleared)?;
            return Ok(ChangeRecord::at(path).with_previous(previous));
        }

        let previous = self.existing(path)?;
        let mut record = ChangeRecord::at(path).with_previous(previous);
        match path.collection {
            Collection::Elements => {
                self.elements.remove(&id);
                let detached: Vec<String> = self
                    .relationships_touching(&id)
                    .map(|rel| rel.id.clone())
                    .collect();
                for rel_id in detached {
                    if let Some(rel) = self.relationships.remove(&rel_id) {
                        record.detached_relationships.push(rel);
                    }
                }
            }
            Collection::Relationships => {
                self.relationships.remove(&id);
            }
        }
        Ok(record)
    }

    fn move_entity(&mut self, from: &PatchPath, to: &PatchPath) -> Result<(), ApplyError> {
        if !from.is_entity() {
            return Err(ApplyError::FieldMove(from.to_string()));
        }
        if !to.is_entity() {
            return Err(ApplyError::FieldMove(to.to_string()));
        }
        if from.collection != to.collection {
            return Err(ApplyError::CrossCollection {
                op: OpKind::Move,
                from: from.to_string(),
                path: to.to_string(),
            });
        }
        let old_id = entity_id(from)?;
        let new_id = entity_id(to)?;
        if !self.contains(from.collection, old_id) {
            return Err(ApplyError::NotFound {
                collection: from.collection.noun(),
                id: old_id.to_owned(),
            });
        }
        if old_id == new_id {
            return Ok(());
        }
        if self.contains(to.collection, new_id) {
            return Err(ApplyError::AlreadyExists {
                collection: to.collection.noun(),
                id: new_id.to_owned(),
            });
        }

        match from.collection {
            Collection::Elements => {
                if let Some(mut element) = self.elements.remove(old_id) {
                    element.id = new_id.to_owned();
                    self.elements.insert(new_id.to_owned(), element);
                }
                self.rekey_element_references(old_id, new_id);
            }
            Collection::Relationships => {
                if let Some(mut rel) = self.relationships.remove(old_id) {
                    rel.id = new_id.to_owned();
                    self.relationships.insert(new_id.to_owned(), rel);
                }
            }
        }
        Ok(())
    }

    fn rekey_element_references(&mut self, old_id: &str, new_id: &str) {
        for rel in self.relationships.values_mut() {
            if rel.source_id == old_id {
                rel.source_id = new_id.to_owned();
            }
            if rel.target_id == old_id {
                rel.target_id = new_id.to_owned();
            }
        }
        for element in self.elements.values_mut() {
            if element.parent_container_id.as_deref() == Some(old_id) {
                element.parent_container_id = Some(new_id.to_owned());
            }
            if element.contained_element_ids.remove(old_id) {
                element.contained_element_ids.insert(new_id.to_owned());
            }
        }
    }

    fn copy_at(&mut self, from: &PatchPath, to: &PatchPath) -> Result<ChangeRecord, ApplyError> {
        if from.collection != to.collection {
            return Err(ApplyError::CrossCollection {
                op: OpKind::Copy,
                from: from.to_string(),
                path: to.to_string(),
            });
        }
        if from.field != to.field {
            return Err(ApplyError::FieldMismatch {
                from: from.to_string(),
                path: to.to_string(),
            });
        }

        let source = self.value_at(from).ok_or_else(|| ApplyError::NotFound {
            collection: from.collection.noun(),
            id: from.id().unwrap_or_default().to_owned(),
        })?;

        if to.is_entity() {
            let Value::Object(mut object) = source else {
                return Err(ApplyError::Serialization(format!(
                    "{from} did not serialize to an object"
                )));
            };
            object.insert("id".to_owned(), Value::String(entity_id(to)?.to_owned()));
            self.insert_entity(to, &Value::Object(object))?;
            Ok(ChangeRecord::at(to))
        } else {
            let previous = self.set_field(to, source)?;
            Ok(ChangeRecord::at(to).with_previous(previous))
        }
    }
}

fn required_value(op: &PatchOperation) -> Result<&Value, ApplyError> {
    op.value.as_ref().ok_or(ApplyError::MissingValue(op.op))
}

fn from_path(op: &PatchOperation) -> Result<PatchPath, ApplyError> {
    let from = op.from.as_deref().ok_or(ApplyError::MissingFrom(op.op))?;
    let path = PatchPath::parse(from)?;
    if path.target == PathTarget::Append {
        return Err(ApplyError::UnresolvedAppend(from.to_owned()));
    }
    Ok(path)
}

fn entity_id(path: &PatchPath) -> Result<&str, ApplyError> {
    path.id()
        .ok_or_else(|| ApplyError::UnresolvedAppend(path.to_string()))
}

/// Decode a whole-entity payload, reconciling its `id` with the path.
fn decode_entity<T: serde::de::DeserializeOwned>(
    path: &PatchPath,
    value: &Value,
) -> Result<T, ApplyError> {
    let id = entity_id(path)?;
    let Value::Object(object) = value else {
        return Err(ApplyError::InvalidValue {
            path: path.to_string(),
            reason: format!("expected an object, got {value}"),
        });
    };
    let mut object: Map<String, Value> = object.clone();
    match object.get("id").and_then(Value::as_str) {
        Some(value_id) if !value_id.is_empty() && value_id != id => {
            return Err(ApplyError::IdMismatch {
                path_id: id.to_owned(),
                value_id: value_id.to_owned(),
            })
        }
        _ => {
            object.insert("id".to_owned(), Value::String(id.to_owned()));
        }
    }
    decode(path, Value::Object(object))
}

fn decode<T: serde::de::DeserializeOwned>(path: &PatchPath, value: Value) -> Result<T, ApplyError> {
    serde_json::from_value(value).map_err(|e| ApplyError::InvalidValue {
        path: path.to_string(),
        reason: e.to_string(),
    })
}
