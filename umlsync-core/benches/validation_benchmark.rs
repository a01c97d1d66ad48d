use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::hint::black_box;
use umlsync_core::{
    validate_operation, DiagramState, Element, ElementKind, PatchOperation, Relationship,
    RelationshipKind,
};

/// A chain of `n` classes, each generalizing the previous one.
fn chain_diagram(n: usize) -> DiagramState {
    let mut state = DiagramState::new();
    for i in 0..n {
        let id = format!("c{i}");
        state.elements.insert(
            id.clone(),
            Element::new(&id, format!("Class{i}"), ElementKind::Class)
                .with_attributes(["id: Long", "name: String"])
                .with_behaviors(["getName(): String"]),
        );
        if i > 0 {
            let rel_id = format!("g{i}");
            state.relationships.insert(
                rel_id.clone(),
                Relationship::new(rel_id, id, format!("c{}", i - 1), RelationshipKind::Generalization),
            );
        }
    }
    state
}

fn bench_validate_add(c: &mut Criterion) {
    for n in [10, 100, 500] {
        let state = chain_diagram(n);
        let op = PatchOperation::add(
            "/elements/new",
            json!({"displayName": "Fresh", "kind": "class", "behaviors": ["run()"]}),
        )
        .with_client("bench", 1);

        c.bench_function(&format!("validate_add_{n}_elements"), |b| {
            b.iter(|| black_box(validate_operation(black_box(&op), black_box(&state))))
        });
    }
}

fn bench_validate_relationship(c: &mut Criterion) {
    let state = chain_diagram(100);
    let op = PatchOperation::add(
        "/relationships/assoc",
        json!({"sourceId": "c1", "targetId": "c50", "kind": "association", "targetMultiplicity": "0..*"}),
    )
    .with_client("bench", 1);

    c.bench_function("validate_relationship_100_elements", |b| {
        b.iter(|| black_box(validate_operation(black_box(&op), black_box(&state))))
    });
}

fn bench_apply_patch(c: &mut Criterion) {
    let state = chain_diagram(100);
    let op = PatchOperation::replace("/elements/c42/position", json!({"x": 12.0, "y": 34.0}));

    c.bench_function("apply_field_replace_100_elements", |b| {
        b.iter(|| {
            let mut trial = state.clone();
            black_box(trial.apply_patch(black_box(&op)).ok());
        })
    });
}

criterion_group!(
    benches,
    bench_validate_add,
    bench_validate_relationship,
    bench_apply_patch,
);
criterion_main!(benches);
