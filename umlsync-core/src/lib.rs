//! Diagram model, patch operations and the rule validator.
//!
//! Everything here is synchronous and free of I/O; the collaboration crate
//! builds the store, log and controller on top of it.

pub mod apply;
pub mod model;
pub mod patch;
pub mod validation;

pub use apply::{ApplyError, ChangeRecord};
pub use model::{
    now_millis, DiagramState, Element, ElementKind, Position, Relationship, RelationshipKind, Size,
};
pub use patch::{
    Collection, ElementField, Field, OpKind, PatchOperation, PatchPath, PathError, PathTarget,
    RelationshipField,
};
pub use validation::{validate_operation, ValidationResult};
