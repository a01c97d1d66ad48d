//! Whole-diagram integrity sweep and the generalization cycle advisory.

use std::collections::{BTreeMap, BTreeSet};

use super::Report;
use crate::model::{DiagramState, ElementKind, RelationshipKind};

/// Checks that hold for the diagram as a whole, whatever the operation was.
pub(super) fn sweep(state: &DiagramState, report: &mut Report) {
    for rel in state.relationships.values() {
        if state.element(&rel.source_id).is_none() || state.element(&rel.target_id).is_none() {
            report.error(format!(
                "relationship '{}' references missing elements ({} -> {})",
                rel.id, rel.source_id, rel.target_id
            ));
        }
    }

    for package in state
        .elements
        .values()
        .filter(|e| e.kind == ElementKind::Package)
    {
        for contained_id in &package.contained_element_ids {
            if contained_id == &package.id {
                report.error(format!(
                    "package '{}' cannot contain itself",
                    package.display_name
                ));
                continue;
            }
            match state.element(contained_id) {
                None => report.warn(format!(
                    "package '{}' lists missing element '{contained_id}'",
                    package.display_name
                )),
                Some(child) if child.parent_container_id.as_deref() != Some(package.id.as_str()) => {
                    report.warn(format!(
                        "element '{}' is listed by package '{}' but not assigned to it",
                        child.display_name, package.display_name
                    ))
                }
                Some(_) => {}
            }
        }
    }

    let cycles = generalization_cycles(state);
    if !cycles.is_empty() {
        let ids: Vec<&str> = cycles.iter().map(String::as_str).collect();
        report.warn(format!("generalization cycle involving {}", ids.join(", ")));
    }
}

/// Ids of elements reachable from themselves over generalization edges.
pub fn generalization_cycles(state: &DiagramState) -> BTreeSet<String> {
    let mut graph: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for rel in state
        .relationships
        .values()
        .filter(|r| r.kind == RelationshipKind::Generalization)
    {
        graph
            .entry(rel.source_id.as_str())
            .or_default()
            .push(rel.target_id.as_str());
    }

    graph
        .keys()
        .filter(|start| reaches(&graph, start, start))
        .map(|id| (*id).to_owned())
        .collect()
}

/// Iterative DFS: is `goal` reachable from `start` by at least one edge?
fn reaches(graph: &BTreeMap<&str, Vec<&str>>, start: &str, goal: &str) -> bool {
    let mut stack: Vec<&str> = graph.get(start).cloned().unwrap_or_default();
    let mut visited = BTreeSet::new();
    while let Some(node) = stack.pop() {
        if node == goal {
            return true;
        }
        if visited.insert(node) {
            if let Some(next) = graph.get(node) {
                stack.extend(next.iter().copied());
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Element, Relationship};

    fn graph(edges: &[(&str, &str)]) -> DiagramState {
        let mut state = DiagramState::new();
        for (i, (s, t)) in edges.iter().enumerate() {
            for id in [s, t] {
                state
                    .elements
                    .entry(id.to_string())
                    .or_insert_with(|| Element::new(*id, id.to_uppercase(), ElementKind::Class));
            }
            let rel_id = format!("g{i}");
            state.relationships.insert(
                rel_id.clone(),
                Relationship::new(rel_id, *s, *t, RelationshipKind::Generalization),
            );
        }
        state
    }

    #[test]
    fn test_no_cycle_in_tree() {
        let state = graph(&[("b", "a"), ("c", "a"), ("d", "b")]);
        assert!(generalization_cycles(&state).is_empty());
    }

    #[test]
    fn test_cycle_members_only() {
        let state = graph(&[("a", "b"), ("b", "c"), ("c", "a"), ("d", "a")]);
        let cycles: Vec<String> = generalization_cycles(&state).into_iter().collect();
        assert_eq!(cycles, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_other_kinds_ignored() {
        let mut state = graph(&[("a", "b")]);
        state.relationships.insert(
            "d1".into(),
            Relationship::new("d1", "b", "a", RelationshipKind::Dependency),
        );
        assert!(generalization_cycles(&state).is_empty());
    }

    #[test]
    fn test_sweep_package_containment() {
        let mut state = DiagramState::new();
        for el in [
            Element::new("p", "Pkg", ElementKind::Package).containing(["p", "c", "ghost"]),
            Element::new("c", "C", ElementKind::Class),
        ] {
            state.elements.insert(el.id.clone(), el);
        }
        let mut report = Report::default();
        sweep(&state, &mut report);

        assert_eq!(report.errors, vec!["package 'Pkg' cannot contain itself"]);
        assert_eq!(report.warnings.len(), 2, "{:?}", report.warnings);
    }

    #[test]
    fn test_sweep_dangling_relationship() {
        let mut state = DiagramState::new();
        state.relationships.insert(
            "r".into(),
            Relationship::new("r", "x", "y", RelationshipKind::Association),
        );
        let mut report = Report::default();
        sweep(&state, &mut report);
        assert_eq!(report.errors.len(), 1);
    }
}
