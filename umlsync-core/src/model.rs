//! Diagram data model: elements (nodes), relationships (edges) and the
//! aggregate [`DiagramState`].
//!
//! Field names serialize in camelCase so the JSON produced here is exactly
//! what travels inside patch values and state snapshots.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::SystemTime;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Kind of a diagram node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Class,
    Interface,
    Enumeration,
    Package,
    Note,
}

impl ElementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Class => "class",
            ElementKind::Interface => "interface",
            ElementKind::Enumeration => "enumeration",
            ElementKind::Package => "package",
            ElementKind::Note => "note",
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a diagram edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipKind {
    Association,
    Aggregation,
    Composition,
    Generalization,
    Dependency,
    Realization,
}

impl RelationshipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipKind::Association => "association",
            RelationshipKind::Aggregation => "aggregation",
            RelationshipKind::Composition => "composition",
            RelationshipKind::Generalization => "generalization",
            RelationshipKind::Dependency => "dependency",
            RelationshipKind::Realization => "realization",
        }
    }
}

impl fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Default for Size {
    fn default() -> Self {
        Self {
            width: 200.0,
            height: 120.0,
        }
    }
}

/// A diagram node.
///
/// `id` may be omitted in an `add` payload; the path supplies it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default)]
    pub behaviors: Vec<String>,
    pub kind: ElementKind,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub size: Size,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stereotype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_container_id: Option<String>,
    /// Only meaningful for packages.
    #[serde(default)]
    pub contained_element_ids: BTreeSet<String>,
}

impl Element {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, kind: ElementKind) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            attributes: Vec::new(),
            behaviors: Vec::new(),
            kind,
            position: Position::default(),
            size: Size::default(),
            stereotype: None,
            parent_container_id: None,
            contained_element_ids: BTreeSet::new(),
        }
    }

    pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_behaviors<I, S>(mut self, behaviors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.behaviors = behaviors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_stereotype(mut self, stereotype: impl Into<String>) -> Self {
        self.stereotype = Some(stereotype.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_container_id = Some(parent_id.into());
        self
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Position { x, y };
        self
    }

    pub fn containing<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.contained_element_ids = ids.into_iter().map(Into::into).collect();
        self
    }
}

/// A diagram edge between two elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    #[serde(default)]
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub kind: RelationshipKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_multiplicity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_multiplicity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Relationship {
    pub fn new(
        id: impl Into<String>,
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        kind: RelationshipKind,
    ) -> Self {
        Self {
            id: id.into(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            kind,
            source_multiplicity: None,
            target_multiplicity: None,
            source_role: None,
            target_role: None,
            label: None,
        }
    }

    pub fn with_multiplicities(
        mut self,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        self.source_multiplicity = Some(source.into());
        self.target_multiplicity = Some(target.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Whether either endpoint is `element_id`.
    pub fn touches(&self, element_id: &str) -> bool {
        self.source_id == element_id || self.target_id == element_id
    }
}

/// Canonical state of one diagram.
///
/// Maps are ordered so that iteration (and therefore validation output and
/// serialized snapshots) is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagramState {
    #[serde(default)]
    pub elements: BTreeMap<String, Element>,
    #[serde(default)]
    pub relationships: BTreeMap<String, Relationship>,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub last_modified_at: u64,
}

impl Default for DiagramState {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagramState {
    /// Empty diagram at version 0.
    pub fn new() -> Self {
        Self {
            elements: BTreeMap::new(),
            relationships: BTreeMap::new(),
            version: 0,
            last_modified_at: now_millis(),
        }
    }

    pub fn element(&self, id: &str) -> Option<&Element> {
        self.elements.get(id)
    }

    pub fn relationship(&self, id: &str) -> Option<&Relationship> {
        self.relationships.get(id)
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    /// Relationships with `element_id` at either end.
    pub fn relationships_touching<'a>(
        &'a self,
        element_id: &'a str,
    ) -> impl Iterator<Item = &'a Relationship> + 'a {
        self.relationships
            .values()
            .filter(move |rel| rel.touches(element_id))
    }

    pub fn has_packages(&self) -> bool {
        self.elements
            .values()
            .any(|e| e.kind == ElementKind::Package)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_element_deserialize_with_defaults() {
        let el: Element = serde_json::from_value(json!({
            "id": "c1",
            "displayName": "Person",
            "kind": "class"
        }))
        .unwrap();

        assert_eq!(el.id, "c1");
        assert_eq!(el.kind, ElementKind::Class);
        assert!(el.attributes.is_empty());
        assert_eq!(el.size, Size::default());
        assert!(el.parent_container_id.is_none());
    }

    #[test]
    fn test_element_serializes_camel_case() {
        let el = Element::new("p1", "Domain", ElementKind::Package)
            .with_parent("root")
            .containing(["c1"]);
        let value = serde_json::to_value(&el).unwrap();

        assert_eq!(value["displayName"], "Domain");
        assert_eq!(value["parentContainerId"], "root");
        assert_eq!(value["containedElementIds"], json!(["c1"]));
        assert!(value.get("stereotype").is_none());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let result: Result<Element, _> = serde_json::from_value(json!({
            "id": "x",
            "displayName": "X",
            "kind": "actor"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_relationship_touches() {
        let rel = Relationship::new("r1", "a", "b", RelationshipKind::Dependency);
        assert!(rel.touches("a"));
        assert!(rel.touches("b"));
        assert!(!rel.touches("c"));
    }

    #[test]
    fn test_state_relationships_touching() {
        let mut state = DiagramState::new();
        state
            .relationships
            .insert("r1".into(), Relationship::new("r1", "a", "b", RelationshipKind::Association));
        state
            .relationships
            .insert("r2".into(), Relationship::new("r2", "b", "c", RelationshipKind::Association));
        state
            .relationships
            .insert("r3".into(), Relationship::new("r3", "c", "d", RelationshipKind::Association));

        let ids: Vec<&str> = state
            .relationships_touching("b")
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["r1", "r2"]);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ElementKind::Enumeration.to_string(), "enumeration");
        assert_eq!(RelationshipKind::Realization.to_string(), "realization");
    }
}
