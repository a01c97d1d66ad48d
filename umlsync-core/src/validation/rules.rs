//! Per-entity rules: naming, stereotypes, kind-specific shape, relationship
//! endpoints, kind compatibility and multiplicities.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use super::Report;
use crate::model::{DiagramState, Element, ElementKind, Relationship, RelationshipKind};
use crate::patch::{Collection, OpKind, PatchOperation, PatchPath};

static STEREOTYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<<.*>>$").expect("valid stereotype pattern"));

static CARDINALITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\d+|(\d+)\.\.(\d+)|\d+\.\.\*|\*)$").expect("valid cardinality pattern")
});

/// `n`, `a..b` with `a <= b`, `a..*` or `*`.
fn valid_cardinality(multiplicity: &str) -> bool {
    let Some(caps) = CARDINALITY.captures(multiplicity) else {
        return false;
    };
    match (caps.get(1), caps.get(2)) {
        (Some(lower), Some(upper)) => {
            match (lower.as_str().parse::<u64>(), upper.as_str().parse::<u64>()) {
                (Ok(lower), Ok(upper)) => lower <= upper,
                _ => false,
            }
        }
        _ => true,
    }
}

static ATTRIBUTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^:]+:[^:]+$").expect("valid attribute pattern"));

static ATTRIBUTE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[+\-#~]?\s*(?:(?:static|final|abstract)\s+)*([^:\s{]+)")
        .expect("valid attribute name pattern")
});

/// Checks that need the snapshot as it was before the operation.
pub(super) fn check_preconditions(
    op: &PatchOperation,
    path: &PatchPath,
    snapshot: &DiagramState,
    report: &mut Report,
) {
    let Some(id) = path.id() else {
        return;
    };

    match (op.op, path.collection, path.is_entity()) {
        (OpKind::Add, Collection::Elements, true) if snapshot.element(id).is_some() => {
            report.error(format!("duplicate element id '{id}'"));
        }
        (OpKind::Add, Collection::Relationships, true) if snapshot.relationship(id).is_some() => {
            report.error(format!("duplicate relationship id '{id}'"));
        }
        (OpKind::Remove, Collection::Elements, true) => {
            let affected = snapshot.relationships_touching(id).count();
            if affected > 0 {
                report.warn(format!(
                    "removing element '{id}' affects {affected} relationship(s)"
                ));
            }
        }
        _ => {}
    }
}

pub(super) fn check_element(element: &Element, state: &DiagramState, report: &mut Report) {
    if name_taken(element, state) {
        report.error(format!(
            "name '{}' already exists in container {}",
            element.display_name,
            element.parent_container_id.as_deref().unwrap_or("<root>")
        ));
    }

    if let Some(stereotype) = &element.stereotype {
        if !STEREOTYPE.is_match(stereotype) {
            report.error(format!(
                "stereotype '{stereotype}' must have the form <<text>>"
            ));
        }
    }

    match element.kind {
        ElementKind::Class => check_class(element, report),
        ElementKind::Interface => check_interface(element, report),
        ElementKind::Enumeration => check_enumeration(element, report),
        ElementKind::Package | ElementKind::Note => {}
    }

    check_scope(element, state, report);
}

fn name_taken(element: &Element, state: &DiagramState) -> bool {
    if element.kind == ElementKind::Note {
        return false;
    }
    state.elements.values().any(|other| {
        other.id != element.id
            && other.kind != ElementKind::Note
            && other.display_name == element.display_name
            && other.parent_container_id == element.parent_container_id
    })
}

fn has_parameter_list(behavior: &str) -> bool {
    match (behavior.find('('), behavior.find(')')) {
        (Some(open), Some(close)) => open < close,
        _ => false,
    }
}

fn check_class(element: &Element, report: &mut Report) {
    let name = &element.display_name;

    for (index, behavior) in element.behaviors.iter().enumerate() {
        if !has_parameter_list(behavior) {
            report.error(format!(
                "class '{name}' behavior {} lacks a parameter list: {behavior}",
                index + 1
            ));
        }
    }

    for (index, attribute) in element.attributes.iter().enumerate() {
        if !ATTRIBUTE.is_match(attribute.trim()) {
            report.warn(format!(
                "class '{name}' attribute {} is not of the form 'name: Type': {attribute}",
                index + 1
            ));
        }
    }

    let abstract_stereotype = element
        .stereotype
        .as_deref()
        .is_some_and(|s| s.contains("abstract"));
    let has_abstract_behavior = element
        .behaviors
        .iter()
        .any(|b| b.contains("abstract ") || b.contains("{abstract}"));
    if has_abstract_behavior && !abstract_stereotype {
        report.warn(format!(
            "class '{name}' declares abstract behaviors but is not stereotyped abstract"
        ));
    }

    for attribute in element
        .attributes
        .iter()
        .filter(|a| a.contains("final ") || a.contains("{final}"))
    {
        let Some(attr_name) = ATTRIBUTE_NAME
            .captures(attribute.trim())
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_lowercase())
        else {
            continue;
        };
        let setter = format!("set{attr_name}");
        if element
            .behaviors
            .iter()
            .any(|b| has_parameter_list(b) && b.to_lowercase().contains(&setter))
        {
            report.warn(format!(
                "class '{name}' has a setter for final attribute '{attr_name}'"
            ));
        }
    }
}

fn check_interface(element: &Element, report: &mut Report) {
    let name = &element.display_name;
    for (index, behavior) in element.behaviors.iter().enumerate() {
        if !has_parameter_list(behavior) || behavior.contains("{}") {
            report.error(format!(
                "interface '{name}' behavior {} must be abstract: {behavior}",
                index + 1
            ));
        }
    }
    if !element.attributes.is_empty() {
        report.warn(format!(
            "interface '{name}' declares instance attributes"
        ));
    }
}

fn check_enumeration(element: &Element, report: &mut Report) {
    let name = &element.display_name;
    if element.attributes.is_empty() {
        report.error(format!("enumeration '{name}' needs at least one literal"));
        return;
    }
    let mut seen = HashSet::new();
    for literal in &element.attributes {
        if !seen.insert(literal.as_str()) {
            report.error(format!("enumeration '{name}' repeats literal '{literal}'"));
        }
    }
}

fn check_scope(element: &Element, state: &DiagramState, report: &mut Report) {
    match element.parent_container_id.as_deref() {
        Some(parent_id) => {
            let is_package = state
                .element(parent_id)
                .is_some_and(|p| p.kind == ElementKind::Package);
            if !is_package {
                report.warn(format!(
                    "element '{}' names '{parent_id}' as container, which is not a package",
                    element.display_name
                ));
            }
        }
        None if element.kind != ElementKind::Package && state.has_packages() => {
            report.warn(format!(
                "element '{}' has no parent package",
                element.display_name
            ));
        }
        None => {}
    }
}

pub(super) fn check_relationship(rel: &Relationship, state: &DiagramState, report: &mut Report) {
    let source = state.element(&rel.source_id);
    let target = state.element(&rel.target_id);

    if source.is_none() {
        report.error(format!(
            "relationship '{}' source element '{}' not found",
            rel.id, rel.source_id
        ));
    }
    if target.is_none() {
        report.error(format!(
            "relationship '{}' target element '{}' not found",
            rel.id, rel.target_id
        ));
    }

    if rel.source_id == rel.target_id {
        report.error(format!(
            "relationship '{}' cannot reference the same element on both ends",
            rel.id
        ));
    }

    for (end, multiplicity) in [
        ("source", &rel.source_multiplicity),
        ("target", &rel.target_multiplicity),
    ] {
        if let Some(m) = multiplicity {
            if !valid_cardinality(m) {
                report.error(format!(
                    "relationship '{}' {end} multiplicity '{m}' is not a valid cardinality",
                    rel.id
                ));
            }
        }
    }

    if let (Some(source), Some(target)) = (source, target) {
        if !kinds_compatible(rel.kind, source.kind, target.kind) {
            report.error(format!(
                "{} is not allowed between {} and {}",
                rel.kind, source.kind, target.kind
            ));
        }

        if rel.kind == RelationshipKind::Generalization && source.kind == ElementKind::Class {
            let parents = state
                .relationships
                .values()
                .filter(|r| r.kind == RelationshipKind::Generalization && r.source_id == source.id)
                .count();
            if parents > 1 {
                report.warn(format!(
                    "class '{}' has {parents} generalization parents",
                    source.display_name
                ));
            }
        }
    }
}

/// Relationship kind compatibility matrix.
pub(super) fn kinds_compatible(
    kind: RelationshipKind,
    source: ElementKind,
    target: ElementKind,
) -> bool {
    use ElementKind::*;
    match kind {
        RelationshipKind::Generalization => {
            matches!((source, target), (Class, Class) | (Interface, Interface))
        }
        RelationshipKind::Realization => source == Class && target == Interface,
        RelationshipKind::Association
        | RelationshipKind::Aggregation
        | RelationshipKind::Composition => source != Enumeration && target != Enumeration,
        RelationshipKind::Dependency => true,
    }
}
