//! Per-turn orchestration over shared learning stores.
//!
//! ```text
//!   feedback(N-1) ──► patterns.record_outcome / families.record_outcome
//!   input(N) ──► ConvergenceLoop ──► cycles ──► CouplingLearner (per cycle)
//!                        │
//!                        └──► SignatureExtractor ──► FamilyClusterer.assign
//!                                                 └─► PatternLearner.retrieve
//!   emit(fragment) ──► PatternLearner.observe, buffered for feedback(N)
//! ```
//!
//! [`SharedStores`] holds the three learning stores, one `parking_lot::Mutex`
//! each, behind `Arc`s. Independent [`Conversation`]s may run on separate
//! threads against the same stores; every lock is held for a single
//! read-modify-write. Turns of one conversation are sequential through
//! `&mut self`.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

use crate::config::EngineConfig;
use crate::convergence::{ConvergenceLoop, ConvergenceOutcome};
use crate::coupling::CouplingLearner;
use crate::error::{EngineError, EngineResult};
use crate::family::{Assignment, ClusterDiagnostics, FamilyClusterer, FamilyId};
use crate::pattern::{self, Candidate, PatternLearner, PatternState, Retrieval, RetrievalQuery};
use crate::signal::{SignalAdapter, SignalSource, SourceSpec, TurnInput};
use crate::signature::{AuxiliarySignals, SignatureExtractor, SignatureLayout, TransformationSignature, MAX_SOURCES};

// ─── SharedStores ───────────────────────────────────────────────────────────

/// The three learning stores, shareable across conversations and threads.
#[derive(Clone, Debug)]
pub struct SharedStores {
    /// Family clusterer.
    pub families: Arc<Mutex<FamilyClusterer>>,
    /// Coupling learner.
    pub coupling: Arc<Mutex<CouplingLearner>>,
    /// Pattern learner.
    pub patterns: Arc<Mutex<PatternLearner>>,
}

impl SharedStores {
    /// Fresh stores for `sources` under a validated `config`.
    pub fn new(config: &EngineConfig, sources: &[SourceSpec]) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self::from_parts(
            FamilyClusterer::new(config.clustering.clone()),
            CouplingLearner::new(config.coupling.clone(), sources)?,
            PatternLearner::new(config.patterns.clone()),
        ))
    }

    /// Wrap existing stores, e.g. loaded from disk.
    pub fn from_parts(families: FamilyClusterer, coupling: CouplingLearner, patterns: PatternLearner) -> Self {
        Self {
            families: Arc::new(Mutex::new(families)),
            coupling: Arc::new(Mutex::new(coupling)),
            patterns: Arc::new(Mutex::new(patterns)),
        }
    }

    /// Pull stale pattern qualities toward their floor. Returns how many moved.
    pub fn maintain(&self, current_turn: u64) -> usize {
        self.patterns.lock().decay_stale(current_turn)
    }

    /// Current clustering health.
    pub fn cluster_diagnostics(&self) -> ClusterDiagnostics {
        self.families.lock().diagnostics()
    }
}

// ─── Turn report ────────────────────────────────────────────────────────────

/// A fragment emitted on one turn, waiting for the next turn's feedback.
#[derive(Clone, Debug)]
pub struct PendingOutcome {
    /// Signature of the turn the fragment answered.
    pub signature: TransformationSignature,
    /// Emitted fragment.
    pub fragment: String,
    /// Turn it was emitted on.
    pub turn_id: u64,
    /// Family that turn was assigned to.
    pub family_id: Option<FamilyId>,
}

/// Everything one turn produced.
#[derive(Clone, Debug)]
pub struct TurnReport {
    /// Turn id.
    pub turn_id: u64,
    /// Convergence trajectory and termination.
    pub outcome: ConvergenceOutcome,
    /// Extracted signature.
    pub signature: TransformationSignature,
    /// Family assignment.
    pub assignment: Assignment,
    /// Ranked candidate fragments.
    pub retrieval: Retrieval,
    /// Updated quality of the previous turn's fragment, when feedback was applied.
    pub feedback_quality: Option<f32>,
    /// Clustering health after the assignment.
    pub diagnostics: ClusterDiagnostics,
}

#[derive(Clone, Debug)]
struct LastTurn {
    signature: TransformationSignature,
    turn_id: u64,
    family_id: Option<FamilyId>,
}

// ─── Conversation ───────────────────────────────────────────────────────────

/// One conversation: its signal sources and its delayed-feedback buffer.
pub struct Conversation {
    config: EngineConfig,
    adapters: Vec<SignalAdapter>,
    convergence: ConvergenceLoop,
    extractor: SignatureExtractor,
    stores: SharedStores,
    retrieval_k: usize,
    fuzzy_tolerance: f32,
    last: Option<LastTurn>,
    pending: Option<PendingOutcome>,
}

impl Conversation {
    /// Bind `sources` to `stores`.
    ///
    /// Fails if the config is invalid, the source count is outside
    /// `1..=MAX_SOURCES`, or the coupling store was built for other sources.
    pub fn new(config: EngineConfig, sources: Vec<Box<dyn SignalSource>>, stores: SharedStores) -> EngineResult<Self> {
        config.validate()?;
        if sources.is_empty() || sources.len() > MAX_SOURCES {
            return Err(EngineError::Config(format!(
                "between 1 and {MAX_SOURCES} signal sources required, got {}",
                sources.len()
            )));
        }
        let adapters: Vec<SignalAdapter> = sources.into_iter().map(SignalAdapter::new).collect();
        {
            let coupling = stores.coupling.lock();
            let names = coupling.matrix().names();
            if names.len() != adapters.len() || names.iter().zip(&adapters).any(|(n, a)| *n != a.spec().name) {
                return Err(EngineError::Config(format!(
                    "coupling store covers sources {names:?}, conversation has {:?}",
                    adapters.iter().map(|a| a.spec().name.as_str()).collect::<Vec<_>>()
                )));
            }
        }
        Ok(Self {
            convergence: ConvergenceLoop::new(config.convergence.clone()),
            extractor: SignatureExtractor::new(&config.convergence),
            config,
            adapters,
            stores,
            retrieval_k: 3,
            fuzzy_tolerance: 0.1,
            last: None,
            pending: None,
        })
    }

    /// Builder: candidates per retrieval and fuzzy tolerance. Defaults: 3 and 0.1.
    pub fn with_retrieval(mut self, k: usize, fuzzy_tolerance: f32) -> Self {
        self.retrieval_k = k.max(1);
        self.fuzzy_tolerance = fuzzy_tolerance.max(0.0);
        self
    }

    /// Shared stores this conversation writes to.
    pub fn stores(&self) -> &SharedStores {
        &self.stores
    }

    /// Signature layout in force.
    pub fn layout(&self) -> &SignatureLayout {
        self.extractor.layout()
    }

    /// Declared specs of the bound sources.
    pub fn source_specs(&self) -> Vec<SourceSpec> {
        self.adapters.iter().map(|a| a.spec().clone()).collect()
    }

    /// Fragment awaiting feedback, if any.
    pub fn pending(&self) -> Option<&PendingOutcome> {
        self.pending.as_ref()
    }

    /// Process one turn.
    ///
    /// `feedback` is the user's satisfaction with the fragment emitted on the
    /// previous turn. `None` means no update. The buffered fragment is
    /// consumed either way.
    pub fn process_turn(
        &mut self,
        input: &TurnInput,
        feedback: Option<f32>,
        aux: &AuxiliarySignals,
        defaults: &[String],
    ) -> EngineResult<TurnReport> {
        // a failed turn leaves nothing for `emit` to answer
        self.last = None;
        let feedback_quality = self.apply_feedback(feedback, input.turn_id);

        let outcome = self.convergence.run(&mut self.adapters, input)?;

        {
            let mut coupling = self.stores.coupling.lock();
            for cycle in &outcome.cycles {
                coupling.observe_cycle(cycle)?;
            }
        }

        let signature = self.extractor.extract(&outcome, aux);

        let (assignment, diagnostics) = {
            let mut families = self.stores.families.lock();
            let assignment = families.assign(&signature, input.turn_id, None);
            (assignment, families.diagnostics())
        };

        let query = RetrievalQuery::new(self.retrieval_k, input.turn_id).with_tolerance(self.fuzzy_tolerance);
        let retrieval = self.stores.patterns.lock().retrieve(&signature, &query, defaults);

        debug!(
            turn = input.turn_id,
            family = ?assignment.family_id,
            kind = ?assignment.kind,
            candidates = retrieval.candidates.len(),
            source = ?retrieval.source,
            "turn processed"
        );

        self.last = Some(LastTurn {
            signature: signature.clone(),
            turn_id: input.turn_id,
            family_id: assignment.family_id,
        });

        Ok(TurnReport {
            turn_id: input.turn_id,
            outcome,
            signature,
            assignment,
            retrieval,
            feedback_quality,
            diagnostics,
        })
    }

    /// Sample a candidate from `retrieval` at the configured temperature.
    pub fn select<'a, R: Rng>(&self, retrieval: &'a Retrieval, rng: &mut R) -> Option<&'a Candidate> {
        pattern::select(&retrieval.candidates, self.config.patterns.temperature, rng)
    }

    /// Record that `fragment` answered the last processed turn and buffer it
    /// for the next turn's feedback. `None` before the first turn and after a
    /// turn that failed.
    pub fn emit(&mut self, fragment: &str) -> Option<PatternState> {
        let last = self.last.as_ref()?;
        let state = self
            .stores
            .patterns
            .lock()
            .observe(&last.signature, fragment, last.turn_id);
        self.pending = Some(PendingOutcome {
            signature: last.signature.clone(),
            fragment: fragment.to_string(),
            turn_id: last.turn_id,
            family_id: last.family_id,
        });
        Some(state)
    }

    fn apply_feedback(&mut self, feedback: Option<f32>, current_turn: u64) -> Option<f32> {
        let pending = self.pending.take();
        let (pending, satisfaction) = match (pending, feedback) {
            (Some(p), Some(s)) => (p, s),
            (Some(p), None) => {
                debug!(turn = p.turn_id, fragment = %p.fragment, "no feedback, pending fragment dropped");
                return None;
            }
            (None, Some(_)) => {
                debug!(turn = current_turn, "feedback without an emitted fragment ignored");
                return None;
            }
            (None, None) => return None,
        };
        if !satisfaction.is_finite() {
            debug!(turn = current_turn, "non-finite feedback ignored");
            return None;
        }
        let quality = self
            .stores
            .patterns
            .lock()
            .record_outcome(&pending.signature, &pending.fragment, satisfaction, current_turn);
        if let Some(id) = pending.family_id {
            self.stores.families.lock().record_outcome(id, satisfaction);
        }
        Some(quality)
    }
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("sources", &self.adapters.len())
            .field("layout", &self.extractor.layout().tag())
            .field("pending", &self.pending.as_ref().map(|p| p.turn_id))
            .finish()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::AssignmentKind;
    use crate::pattern::RetrievalSource;
    use crate::reference::ScriptedSource;
    use crate::signal::{SignalError, SignalResult};

    fn sources() -> Vec<Box<dyn SignalSource>> {
        vec![
            Box::new(ScriptedSource::scripted("warmth", &[0.3, 0.6, 0.8])),
            Box::new(ScriptedSource::scripted("focus", &[0.4, 0.5, 0.7])),
        ]
    }

    fn conversation() -> Conversation {
        let config = EngineConfig::default();
        let specs: Vec<SourceSpec> = sources().iter().map(|s| s.spec().clone()).collect();
        let stores = SharedStores::new(&config, &specs).unwrap();
        Conversation::new(config, sources(), stores).unwrap()
    }

    fn defaults() -> Vec<String> {
        vec!["Go on.".to_string()]
    }

    #[test]
    fn test_first_turn_uses_defaults_and_founds_family() {
        let mut c = conversation();
        let r = c
            .process_turn(&TurnInput::new(1, "hi"), None, &AuxiliarySignals::default(), &defaults())
            .unwrap();
        assert_eq!(r.assignment.kind, AssignmentKind::Founded);
        assert_eq!(r.retrieval.source, RetrievalSource::Default);
        assert_eq!(r.retrieval.candidates[0].fragment, "Go on.");
        assert_eq!(r.feedback_quality, None);
        assert!(c.stores().coupling.lock().updates() >= 1);
    }

    #[test]
    fn test_emitted_fragment_learns_from_next_turn_feedback() {
        let mut c = conversation();
        let aux = AuxiliarySignals::default();
        c.process_turn(&TurnInput::new(1, "hi"), None, &aux, &defaults()).unwrap();
        assert_eq!(c.emit("Tell me more."), Some(PatternState::Observed));
        assert!(c.pending().is_some());

        let r = c.process_turn(&TurnInput::new(2, "ok"), Some(1.0), &aux, &defaults()).unwrap();
        assert!((r.feedback_quality.unwrap() - 0.6).abs() < 1e-6);
        assert!(c.pending().is_none());
        // identical scripts give an identical signature, so the fragment is found exactly
        assert_eq!(r.retrieval.source, RetrievalSource::Exact);
        assert_eq!(r.retrieval.candidates[0].fragment, "Tell me more.");
        let fam = c.stores().families.lock().family(0).unwrap().clone();
        assert_eq!(fam.outcome_count, 1);
    }

    #[test]
    fn test_missing_feedback_is_no_update() {
        let mut c = conversation();
        let aux = AuxiliarySignals::default();
        let first = c.process_turn(&TurnInput::new(1, "hi"), None, &aux, &defaults()).unwrap();
        c.emit("A");
        let r = c.process_turn(&TurnInput::new(2, "ok"), None, &aux, &defaults()).unwrap();
        assert_eq!(r.feedback_quality, None);
        let q = c.stores().patterns.lock().entry(&first.signature, "A").unwrap().quality;
        assert_eq!(q, 0.5);
    }

    #[test]
    fn test_emit_before_any_turn() {
        let mut c = conversation();
        assert_eq!(c.emit("nothing to answer"), None);
    }

    /// Fails every cycle on one exact text, scores 0.6 otherwise.
    struct FailsOn {
        spec: SourceSpec,
        text: &'static str,
    }

    impl SignalSource for FailsOn {
        fn spec(&self) -> &SourceSpec {
            &self.spec
        }
        fn evaluate(&mut self, input: &TurnInput, _cycle: usize) -> Result<SignalResult, SignalError> {
            if input.text == self.text {
                Err(SignalError::Failed(format!("cannot score `{}`", input.text)))
            } else {
                Ok(SignalResult::new(0.6))
            }
        }
    }

    #[test]
    fn test_emit_after_failed_turn_records_nothing() {
        let config = EngineConfig::default();
        let srcs: Vec<Box<dyn SignalSource>> = vec![
            Box::new(ScriptedSource::constant("steady", 0.7)),
            Box::new(FailsOn {
                spec: SourceSpec::new("fragile", &[]),
                text: "boom",
            }),
        ];
        let specs: Vec<SourceSpec> = srcs.iter().map(|s| s.spec().clone()).collect();
        let stores = SharedStores::new(&config, &specs).unwrap();
        let mut c = Conversation::new(config, srcs, stores).unwrap();
        let aux = AuxiliarySignals::default();

        let first = c.process_turn(&TurnInput::new(1, "fine"), None, &aux, &defaults()).unwrap();
        assert!(c.process_turn(&TurnInput::new(2, "boom"), None, &aux, &defaults()).is_err());

        assert_eq!(c.emit("reply to turn 2"), None);
        assert!(c.pending().is_none());
        assert!(c.stores().patterns.lock().entry(&first.signature, "reply to turn 2").is_none());
    }

    #[test]
    fn test_rejects_mismatched_coupling_store() {
        let config = EngineConfig::default();
        let stores = SharedStores::new(&config, &[SourceSpec::new("other", &["x"])]).unwrap();
        assert!(matches!(
            Conversation::new(config, sources(), stores),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_empty_source_list() {
        let config = EngineConfig::default();
        let stores = SharedStores::new(&config, &[]).unwrap();
        assert!(Conversation::new(config, Vec::new(), stores).is_err());
    }

    #[test]
    fn test_fatal_fault_surfaces_with_partial_trajectory() {
        let config = EngineConfig::default();
        let failing: Vec<Box<dyn SignalSource>> = vec![
            Box::new(ScriptedSource::constant("steady", 0.9)),
            Box::new(ScriptedSource::constant("broken", 0.5).failing_on(&[0, 1, 2, 3, 4])),
        ];
        let specs: Vec<SourceSpec> = failing.iter().map(|s| s.spec().clone()).collect();
        let stores = SharedStores::new(&config, &specs).unwrap();
        let mut c = Conversation::new(config, failing, stores).unwrap();
        let err = c
            .process_turn(&TurnInput::new(1, ""), None, &AuxiliarySignals::default(), &defaults())
            .unwrap_err();
        match err {
            EngineError::FatalSignal { source_name, partial, .. } => {
                assert_eq!(source_name, "broken");
                assert_eq!(partial.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
