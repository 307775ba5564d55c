//! End-to-end behaviour of convergence → signature → families → patterns.

use resonance_core::reference::ScriptedSource;
use resonance_core::signature::l2_norm;
use resonance_core::{
    AssignmentKind, AuxiliarySignals, ConvergenceConfig, ConvergenceLoop, ConvergenceOutcome, CoActivation,
    CouplingConfig, CouplingLearner, FamilyClusterer, PatternLearner, Regime, RetrievalQuery, RetrievalSource,
    SignalAdapter, SignatureExtractor, SourceSpec, TerminationReason, TransformationSignature, TurnInput,
    SIGNATURE_DIM,
};

// ─── helpers ────────────────────────────────────────────────────────────────

fn run_with(config: ConvergenceConfig, sources: Vec<ScriptedSource>, turn: u64) -> ConvergenceOutcome {
    let mut adapters: Vec<SignalAdapter> = sources
        .into_iter()
        .map(|s| SignalAdapter::new(Box::new(s)))
        .collect();
    ConvergenceLoop::new(config)
        .run(&mut adapters, &TurnInput::new(turn, "turn"))
        .unwrap()
}

fn run(sources: Vec<ScriptedSource>, turn: u64) -> ConvergenceOutcome {
    run_with(ConvergenceConfig::default(), sources, turn)
}

fn signature_of(outcome: &ConvergenceOutcome) -> TransformationSignature {
    SignatureExtractor::new(&ConvergenceConfig::default()).extract(outcome, &AuxiliarySignals::default())
}

/// Falls from engaged to withdrawn: low energy, high distress.
fn withdrawing_turn() -> ConvergenceOutcome {
    run(
        vec![
            ScriptedSource::scripted("warmth", &[0.6, 0.4, 0.2])
                .with_regimes(&[Regime::Mobilized, Regime::Withdrawn]),
            ScriptedSource::scripted("focus", &[0.5, 0.35, 0.2])
                .with_regimes(&[Regime::Mobilized, Regime::Withdrawn]),
        ],
        1,
    )
}

/// Rises into engagement: high energy, low distress.
fn engaging_turn() -> ConvergenceOutcome {
    run(
        vec![
            ScriptedSource::scripted("warmth", &[0.4, 0.7, 0.9])
                .with_regimes(&[Regime::Mobilized, Regime::Engaged]),
            ScriptedSource::scripted("focus", &[0.5, 0.75, 0.9])
                .with_regimes(&[Regime::Mobilized, Regime::Engaged]),
        ],
        2,
    )
}

// ─── signature properties ───────────────────────────────────────────────────

#[test]
fn test_signatures_have_fixed_dim_and_unit_norm() {
    for outcome in [withdrawing_turn(), engaging_turn()] {
        let sig = signature_of(&outcome);
        assert_eq!(sig.as_slice().len(), SIGNATURE_DIM);
        assert!((l2_norm(sig.as_slice()) - 1.0).abs() < 1e-5);
        assert!((sig.similarity(&sig) - 1.0).abs() < 1e-5, "self-similarity must be 1.0");
    }
}

#[test]
fn test_identical_turns_give_bit_identical_signatures() {
    let a = signature_of(&engaging_turn());
    let b = signature_of(&engaging_turn());
    let bits_a: Vec<u32> = a.as_slice().iter().map(|x| x.to_bits()).collect();
    let bits_b: Vec<u32> = b.as_slice().iter().map(|x| x.to_bits()).collect();
    assert_eq!(bits_a, bits_b);
}

// ─── scenario A: homogeneous corpus ─────────────────────────────────────────

#[test]
fn test_homogeneous_corpus_collapses_into_one_family() {
    let mut families = FamilyClusterer::default();
    let mut seen: Vec<TransformationSignature> = Vec::new();
    for turn in 0..30_u64 {
        let c = 0.5 + turn as f32 * 1e-4;
        let outcome = run(
            vec![ScriptedSource::constant("warmth", c), ScriptedSource::constant("focus", c)],
            turn,
        );
        let sig = signature_of(&outcome);
        for prior in &seen {
            assert!(sig.similarity(prior) > 0.999, "near-identical turns must look alike");
        }
        families.assign(&sig, turn, None);
        seen.push(sig);
    }
    let d = families.diagnostics();
    assert_eq!(d.family_count, 1, "homogeneous input folds into one family");
    assert_eq!(d.max_family_share, 1.0);
    assert!(d.collapsed, "collapse must be observable");
}

// ─── scenario B: distinct categorical transitions ───────────────────────────

#[test]
fn test_distinct_regime_transitions_are_distinguishable() {
    let low = signature_of(&withdrawing_turn());
    let high = signature_of(&engaging_turn());
    let sim = low.similarity(&high);
    assert!(sim < 0.9, "similarity {sim} should be well below 0.9");
    assert!(sim < 0.55, "similarity {sim} should be below the base threshold");

    let mut families = FamilyClusterer::default();
    let a = families.assign(&low, 1, None);
    let b = families.assign(&high, 2, None);
    assert_ne!(a.family_id, b.family_id);
    assert_eq!(b.kind, AssignmentKind::Founded);
}

// ─── scenario C: cycle budget ───────────────────────────────────────────────

#[test]
fn test_cycle_budget_is_an_absolute_ceiling() {
    for max_cycles in 1..=8 {
        let config = ConvergenceConfig {
            max_cycles,
            initial_energy: 10.0,
            ..ConvergenceConfig::default()
        };
        // satisfaction plateaus at 0.6, energy descends 0.18 per cycle
        let outcome = run_with(
            config,
            vec![
                ScriptedSource::constant("a", 0.6),
                ScriptedSource::constant("b", 0.6),
                ScriptedSource::constant("c", 0.6),
            ],
            1,
        );
        assert_eq!(outcome.cycle_count(), max_cycles);
        assert_eq!(outcome.termination, TerminationReason::CycleBudget);
    }
}

// ─── scenario D: defaults on miss ───────────────────────────────────────────

#[test]
fn test_retrieval_without_matches_returns_defaults() {
    let defaults = vec!["I'm here.".to_string(), "Go on.".to_string()];
    let target = signature_of(&engaging_turn());

    let empty = PatternLearner::default();
    let r = empty.retrieve(&target, &RetrievalQuery::new(5, 10), &defaults);
    assert_eq!(r.source, RetrievalSource::Default);
    assert_eq!(r.candidates.len(), 2);

    let mut populated = PatternLearner::default();
    populated.observe(&signature_of(&withdrawing_turn()), "Take your time.", 1);
    let r = populated.retrieve(&target, &RetrievalQuery::new(5, 10), &defaults);
    assert_eq!(r.source, RetrievalSource::Default);
    assert_eq!(r.candidates[0].fragment, "I'm here.");
}

// ─── clustering properties ──────────────────────────────────────────────────

#[test]
fn test_assignment_is_idempotent_in_immediate_succession() {
    let mut families = FamilyClusterer::default();
    for (turn, outcome) in [withdrawing_turn(), engaging_turn(), withdrawing_turn()].iter().enumerate() {
        let sig = signature_of(outcome);
        let first = families.assign(&sig, turn as u64 * 2, None);
        let second = families.assign(&sig, turn as u64 * 2 + 1, None);
        assert_eq!(first.family_id, second.family_id);
    }
}

#[test]
fn test_adaptive_threshold_never_decreases() {
    let families = FamilyClusterer::default();
    let cfg = families.config();
    let thresholds: Vec<f32> = (0..100).map(|n| cfg.threshold_for(n)).collect();
    assert!(thresholds.windows(2).all(|w| w[1] >= w[0]));
}

// ─── coupling properties ────────────────────────────────────────────────────

#[test]
fn test_coupling_stays_bounded_under_maximal_co_activation() {
    let specs = vec![SourceSpec::new("a", &["level"]), SourceSpec::new("b", &["level"])];
    for co_activation in [CoActivation::Product, CoActivation::Min] {
        let mut coupling = CouplingLearner::new(
            CouplingConfig {
                learning_rate: 0.5,
                co_activation,
                ..CouplingConfig::default()
            },
            &specs,
        )
        .unwrap();
        for turn in 0..100 {
            let outcome = run(
                vec![ScriptedSource::constant("a", 1.0), ScriptedSource::constant("b", 1.0)],
                turn,
            );
            for cycle in &outcome.cycles {
                coupling.observe_cycle(cycle).unwrap();
            }
            let v = coupling.get(0, 1);
            assert!((0.0..=1.0).contains(&v), "coupling {v} left [0, 1]");
        }
    }
}
