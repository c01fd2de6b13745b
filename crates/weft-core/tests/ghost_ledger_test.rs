//! Ghost engine determinism and ledger audit trails.

use std::sync::Arc;

use weft_core::{Candidate, Error, GhostEngine};

const FNV_OFFSET_BASIS: u64 = 14_695_981_039_346_656_037;
const FNV_PRIME: u64 = 1_099_511_628_211;

/// Independent FNV-1a chain, written from the published formula rather than
/// the engine internals.
fn mix(prior: u64, bytes: &[u8]) -> u64 {
    let mut acc = FNV_OFFSET_BASIS ^ prior;
    for &b in bytes {
        acc ^= u64::from(b);
        acc = acc.wrapping_mul(FNV_PRIME);
    }
    acc
}

fn cand(tag: &str, value: u64) -> Candidate<u64> {
    Candidate::new(Arc::new(value), tag)
}

#[test]
fn identical_runs_collapse_identically() {
    let run = || {
        let mut engine: GhostEngine<u64> = GhostEngine::new();
        let alpha = engine.create("g-alpha", None).unwrap();
        engine
            .propose(alpha, vec![cand("A", 1), cand("B", 2)])
            .unwrap();
        let first = engine.collapse(alpha).unwrap();

        let beta = engine.create("g-beta", None).unwrap();
        engine
            .propose(beta, vec![cand("x", 1), cand("y", 2), cand("z", 3)])
            .unwrap();
        let second = engine.collapse(beta).unwrap();
        (first, second)
    };
    assert_eq!(run(), run());
}

/// The engine's fixed, documented collapse seed.
const COLLAPSE_SEED: u64 = 0x5745_4654_4C45_4447;

#[test]
fn collapse_mixes_the_ledger_position_at_propose_time() {
    // Same ghost id, same tags, but unrelated ledger activity before the
    // proposal shifts its append position; the selector must mix the
    // position that was recorded, not a recomputed one.
    let mut engine: GhostEngine<u64> = GhostEngine::new();
    let _noise = engine.create("noise", None).unwrap();
    let g = engine.create("g", None).unwrap();
    engine.propose(g, vec![cand("a", 1), cand("b", 2)]).unwrap();

    let expected = {
        let mut h = COLLAPSE_SEED;
        h = mix(h, &2u64.to_le_bytes()); // proposal entry sits at position 2
        h = mix(h, b"g");
        h = mix(h, &1u64.to_le_bytes()); // first proposal: step index 1
        h = mix(h, b"a");
        h = mix(h, b"b");
        (h % 2) as usize
    };
    assert_eq!(engine.collapse(g).unwrap(), expected);
}

#[test]
fn single_candidate_always_collapses_to_zero() {
    let mut engine: GhostEngine<u64> = GhostEngine::new();
    let g = engine.create("solo", None).unwrap();
    engine.propose(g, vec![cand("only", 9)]).unwrap();
    assert_eq!(engine.collapse(g).unwrap(), 0);
    assert_eq!(*engine.state(g).unwrap().unwrap(), 9);
}

#[test]
fn three_candidate_formula_matches_end_to_end() {
    let mut engine: GhostEngine<u64> = GhostEngine::new();
    let g = engine.create("x", None).unwrap();
    engine
        .propose(g, vec![cand("p", 1), cand("q", 2), cand("r", 3)])
        .unwrap();
    assert_eq!(engine.ledger_len(), 2);

    let mut h = COLLAPSE_SEED;
    h = mix(h, &1u64.to_le_bytes());
    h = mix(h, b"x");
    h = mix(h, &1u64.to_le_bytes());
    for tag in ["p", "q", "r"] {
        h = mix(h, tag.as_bytes());
    }
    assert_eq!(engine.collapse(g).unwrap(), (h % 3) as usize);
}

#[test]
fn ledger_records_survive_collapse_for_audit() {
    let mut engine: GhostEngine<u64> = GhostEngine::new();
    let g = engine.create("audited", None).unwrap();
    engine
        .propose(g, vec![cand("left", 1), cand("right", 2)])
        .unwrap();
    let chosen = engine.collapse(g).unwrap();

    let entry = engine.ledger_entry(1).unwrap();
    assert_eq!(entry.ghost_id(), "audited");
    assert_eq!(entry.step_index(), 1);
    assert_eq!(
        entry.proposal_tags(),
        Some(&["left".to_string(), "right".to_string()][..])
    );
    assert_eq!(entry.chosen(), Some(chosen));
    assert!(entry.state().is_some());
}

#[test]
fn tags_are_copied_not_borrowed() {
    let mut engine: GhostEngine<u64> = GhostEngine::new();
    let g = engine.create("copier", None).unwrap();
    let mut tag = String::from("mutable-tag");
    engine
        .propose(g, vec![Candidate::new(Arc::new(5), tag.clone())])
        .unwrap();
    // Caller mutates its own copy; the ledger's copy is unaffected.
    tag.push_str("-changed");
    assert_eq!(
        engine.ledger_entry(1).unwrap().proposal_tags(),
        Some(&["mutable-tag".to_string()][..])
    );
}

#[test]
fn mixed_step_and_speculation_interleave() {
    let mut engine: GhostEngine<u64> = GhostEngine::new();
    let mut tick = 0u64;
    let g = engine
        .create(
            "mixed",
            Some(Box::new(move || {
                tick += 1;
                Arc::new(tick * 100)
            })),
        )
        .unwrap();

    engine.step(g).unwrap();
    assert_eq!(*engine.state(g).unwrap().unwrap(), 100);

    engine.propose(g, vec![cand("keep", 7), cand("swap", 8)]).unwrap();
    assert_eq!(engine.step(g), Err(Error::Busy));
    engine.collapse(g).unwrap();

    engine.step(g).unwrap();
    assert_eq!(*engine.state(g).unwrap().unwrap(), 200);
    assert_eq!(engine.ledger_len(), 4);
}

#[test]
fn schedule_round_preserves_queue_order() {
    let mut engine: GhostEngine<u64> = GhostEngine::new();
    let order: Arc<parking_lot::Mutex<Vec<&'static str>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));

    let o1 = Arc::clone(&order);
    let first = engine
        .create(
            "first",
            Some(Box::new(move || {
                o1.lock().push("first");
                Arc::new(1)
            })),
        )
        .unwrap();
    let o2 = Arc::clone(&order);
    let second = engine
        .create(
            "second",
            Some(Box::new(move || {
                o2.lock().push("second");
                Arc::new(2)
            })),
        )
        .unwrap();

    engine.queue_add(first).unwrap();
    engine.queue_add(second).unwrap();
    engine.schedule().unwrap();

    assert_eq!(*order.lock(), vec!["first", "second"]);
}
