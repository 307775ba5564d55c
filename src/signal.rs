/*
 * This source code is licensed under the Business Source License 1.1.
 * See LICENSE in the root directory for full details.
 */

//! Signal sources: the uniform contract every external feature extractor meets.
//!
//! A signal source (an "organ") scores one turn of conversation once per
//! convergence cycle. The engine is agnostic to what a source measures: it only
//! sees a scalar coherence, a fixed vocabulary of named sub-component scores,
//! and an optional [`Regime`] label.
//!
//! # Implementing a source
//!
//! ```rust
//! use resonance_core::signal::{SignalError, SignalResult, SignalSource, SourceSpec, TurnInput};
//!
//! struct Warmth { spec: SourceSpec }
//!
//! impl SignalSource for Warmth {
//!     fn spec(&self) -> &SourceSpec { &self.spec }
//!     fn evaluate(&mut self, input: &TurnInput, _cycle: usize) -> Result<SignalResult, SignalError> {
//!         let score = if input.text.contains("thanks") { 0.8 } else { 0.4 };
//!         Ok(SignalResult::new(score).with_component("gratitude", score))
//!     }
//! }
//!
//! let w = Warmth { spec: SourceSpec::new("warmth", &["gratitude"]) };
//! assert_eq!(w.spec().name, "warmth");
//! ```
//!
//! # Invariants
//!
//! - Every result reaching the convergence loop has `coherence ∈ [0, 1]`.
//! - Every declared component is present; undeclared names are rejected, not ignored.
//! - A fault is never silently converted into a neutral value by the source
//!   itself; the [`SignalAdapter`] reports it and the loop decides.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use thiserror::Error;

// ─── Regime ─────────────────────────────────────────────────────────────────

/// Three-way categorical state reported by some sources.
///
/// Ordered from lowest to highest activation so that transitions can be
/// encoded on a numeric scale:
///
/// ```text
/// Withdrawn (0.0) < Mobilized (0.5) < Engaged (1.0)
/// ```
///
/// `Withdrawn` is the low-energy / high-distress end, `Engaged` the
/// high-energy / low-distress end.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Regime {
    /// Low energy, high distress.
    Withdrawn,
    /// Activated but unsettled.
    Mobilized,
    /// High energy, low distress.
    Engaged,
}

impl Regime {
    /// Position of this regime on the ordered numeric scale.
    pub fn scale(self) -> f32 {
        match self {
            Regime::Withdrawn => 0.0,
            Regime::Mobilized => 0.5,
            Regime::Engaged => 1.0,
        }
    }

    /// Nearest regime for a scale value (values outside [0, 1] are clamped).
    pub fn from_scale(value: f32) -> Self {
        let v = value.clamp(0.0, 1.0);
        if v < 0.25 {
            Regime::Withdrawn
        } else if v < 0.75 {
            Regime::Mobilized
        } else {
            Regime::Engaged
        }
    }
}

// ─── SignalResult ───────────────────────────────────────────────────────────

/// One source's evaluation of one cycle.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SignalResult {
    /// Overall activation strength in [0.0, 1.0].
    pub coherence: f32,
    /// Named sub-scores, keyed by the source's declared component vocabulary.
    pub components: BTreeMap<String, f32>,
    /// Categorical state, when the source reports one.
    pub regime: Option<Regime>,
}

impl SignalResult {
    /// Coherence used in place of a faulted evaluation.
    pub const NEUTRAL_COHERENCE: f32 = 0.5;

    /// Result with the given coherence and no components.
    pub fn new(coherence: f32) -> Self {
        Self {
            coherence,
            components: BTreeMap::new(),
            regime: None,
        }
    }

    /// Neutral stand-in recorded for a faulted cycle: coherence 0.5, empty components.
    pub fn neutral() -> Self {
        Self::new(Self::NEUTRAL_COHERENCE)
    }

    /// Builder: attach a named component score.
    pub fn with_component(mut self, name: &str, value: f32) -> Self {
        self.components.insert(name.to_owned(), value);
        self
    }

    /// Builder: attach a categorical state.
    pub fn with_regime(mut self, regime: Regime) -> Self {
        self.regime = Some(regime);
        self
    }

    /// Score of a named component, if present.
    pub fn component(&self, name: &str) -> Option<f32> {
        self.components.get(name).copied()
    }
}

// ─── SourceSpec ─────────────────────────────────────────────────────────────

/// Static declaration of a source: its name, component vocabulary and defaults.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceSpec {
    /// Unique source name.
    pub name: String,
    /// Declared component names. Results may not carry any other name.
    pub components: Vec<String>,
    /// Value filled in for a declared component the source omitted.
    pub component_default: f32,
    /// Wall-clock budget for one evaluation. Overrun is a fault.
    pub cycle_budget: Option<Duration>,
}

impl SourceSpec {
    /// Declare a source with the given component vocabulary, default 0.0, no budget.
    pub fn new(name: &str, components: &[&str]) -> Self {
        Self {
            name: name.to_owned(),
            components: components.iter().map(|c| (*c).to_owned()).collect(),
            component_default: 0.0,
            cycle_budget: None,
        }
    }

    /// Builder: explicit default for omitted components.
    pub fn with_component_default(mut self, value: f32) -> Self {
        self.component_default = value;
        self
    }

    /// Builder: per-cycle evaluation budget.
    pub fn with_cycle_budget(mut self, budget: Duration) -> Self {
        self.cycle_budget = Some(budget);
        self
    }

    /// Whether `name` belongs to the declared vocabulary.
    pub fn declares(&self, name: &str) -> bool {
        self.components.iter().any(|c| c == name)
    }
}

// ─── TurnInput ──────────────────────────────────────────────────────────────

/// The turn being scored. Sources read it; they never mutate it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnInput {
    /// Monotonic turn number within the conversation.
    pub turn_id: u64,
    /// Raw user text for this turn.
    pub text: String,
}

impl TurnInput {
    /// Construct a turn input.
    pub fn new(turn_id: u64, text: impl Into<String>) -> Self {
        Self {
            turn_id,
            text: text.into(),
        }
    }
}

// ─── Errors ─────────────────────────────────────────────────────────────────

/// A single source's failure on a single cycle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignalError {
    /// The source reported a failure of its own.
    #[error("evaluation failed: {0}")]
    Failed(String),

    /// The evaluation overran its cycle budget.
    #[error("evaluation took {elapsed_ms}ms, budget {budget_ms}ms")]
    Timeout {
        /// Measured duration.
        elapsed_ms: u64,
        /// Declared budget.
        budget_ms: u64,
    },

    /// The result carried a component outside the declared vocabulary.
    #[error("source `{source_name}` reported undeclared component `{component}`")]
    UnknownComponent {
        /// Reporting source.
        source_name: String,
        /// Offending component name.
        component: String,
    },

    /// Coherence was non-finite or outside [0, 1].
    #[error("source `{source_name}` reported coherence {value} outside [0, 1]")]
    OutOfRange {
        /// Reporting source.
        source_name: String,
        /// Offending value.
        value: f32,
    },

    /// A component score was NaN or infinite.
    #[error("source `{source_name}` reported non-finite component `{component}`")]
    NonFinite {
        /// Reporting source.
        source_name: String,
        /// Offending component name.
        component: String,
    },
}

// ─── SignalSource ───────────────────────────────────────────────────────────

/// An external feature extractor.
///
/// `evaluate` must be deterministic for a given `(input, cycle)` and may keep
/// state across the cycles of one turn, but must not carry memory between
/// turns; [`SignalSource::reset`] is called before every turn.
pub trait SignalSource: Send {
    /// Static declaration of this source.
    fn spec(&self) -> &SourceSpec;

    /// Score `input` on convergence cycle `cycle` (0-based).
    fn evaluate(&mut self, input: &TurnInput, cycle: usize) -> Result<SignalResult, SignalError>;

    /// Drop any per-turn state. Default: no-op.
    fn reset(&mut self) {}
}

// ─── SignalAdapter ──────────────────────────────────────────────────────────

/// Wraps a [`SignalSource`] and enforces the typed result contract.
///
/// - times each evaluation against the declared budget;
/// - rejects undeclared components and out-of-range coherence;
/// - fills omitted declared components with the declared default;
/// - counts consecutive faults within the current turn.
pub struct SignalAdapter {
    source: Box<dyn SignalSource>,
    consecutive_faults: u32,
}

impl SignalAdapter {
    /// Wrap a boxed source.
    pub fn new(source: Box<dyn SignalSource>) -> Self {
        Self {
            source,
            consecutive_faults: 0,
        }
    }

    /// The wrapped source's declaration.
    pub fn spec(&self) -> &SourceSpec {
        self.source.spec()
    }

    /// Reset the source and the fault counter before a new turn.
    pub fn begin_turn(&mut self) {
        self.consecutive_faults = 0;
        self.source.reset();
    }

    /// Consecutive faults recorded since the last successful evaluation this turn.
    pub fn consecutive_faults(&self) -> u32 {
        self.consecutive_faults
    }

    /// Evaluate one cycle, validating the result.
    pub fn evaluate(&mut self, input: &TurnInput, cycle: usize) -> Result<SignalResult, SignalError> {
        let started = Instant::now();
        let raw = self.source.evaluate(input, cycle);
        let elapsed = started.elapsed();

        let outcome = raw.and_then(|result| {
            if let Some(budget) = self.source.spec().cycle_budget {
                if elapsed > budget {
                    return Err(SignalError::Timeout {
                        elapsed_ms: elapsed.as_millis() as u64,
                        budget_ms: budget.as_millis() as u64,
                    });
                }
            }
            validate(self.source.spec(), result)
        });

        match outcome {
            Ok(_) => self.consecutive_faults = 0,
            Err(_) => self.consecutive_faults = self.consecutive_faults.saturating_add(1),
        }
        outcome
    }
}

impl core::fmt::Debug for SignalAdapter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SignalAdapter")
            .field("source", &self.source.spec().name)
            .field("consecutive_faults", &self.consecutive_faults)
            .finish()
    }
}

fn validate(spec: &SourceSpec, mut result: SignalResult) -> Result<SignalResult, SignalError> {
    if !result.coherence.is_finite() || !(0.0..=1.0).contains(&result.coherence) {
        return Err(SignalError::OutOfRange {
            source_name: spec.name.clone(),
            value: result.coherence,
        });
    }
    for (name, value) in &result.components {
        if !spec.declares(name) {
            return Err(SignalError::UnknownComponent {
                source_name: spec.name.clone(),
                component: name.clone(),
            });
        }
        if !value.is_finite() {
            return Err(SignalError::NonFinite {
                source_name: spec.name.clone(),
                component: name.clone(),
            });
        }
    }
    for name in &spec.components {
        result
            .components
            .entry(name.clone())
            .or_insert(spec.component_default);
    }
    Ok(result)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        spec: SourceSpec,
        result: Result<SignalResult, SignalError>,
    }

    impl SignalSource for Fixed {
        fn spec(&self) -> &SourceSpec {
            &self.spec
        }
        fn evaluate(&mut self, _input: &TurnInput, _cycle: usize) -> Result<SignalResult, SignalError> {
            self.result.clone()
        }
    }

    /// Sleeps through every evaluation.
    struct Sleepy {
        spec: SourceSpec,
        nap: Duration,
    }

    impl SignalSource for Sleepy {
        fn spec(&self) -> &SourceSpec {
            &self.spec
        }
        fn evaluate(&mut self, _input: &TurnInput, _cycle: usize) -> Result<SignalResult, SignalError> {
            std::thread::sleep(self.nap);
            Ok(SignalResult::new(0.5))
        }
    }

    fn adapter(result: Result<SignalResult, SignalError>) -> SignalAdapter {
        SignalAdapter::new(Box::new(Fixed {
            spec: SourceSpec::new("sensor", &["alpha", "beta"]).with_component_default(0.25),
            result,
        }))
    }

    fn input() -> TurnInput {
        TurnInput::new(1, "hello")
    }

    #[test]
    fn test_regime_ordering_and_scale() {
        assert!(Regime::Withdrawn < Regime::Mobilized);
        assert!(Regime::Mobilized < Regime::Engaged);
        assert_eq!(Regime::Withdrawn.scale(), 0.0);
        assert_eq!(Regime::Engaged.scale(), 1.0);
        for r in [Regime::Withdrawn, Regime::Mobilized, Regime::Engaged] {
            assert_eq!(Regime::from_scale(r.scale()), r);
        }
        assert_eq!(Regime::from_scale(-3.0), Regime::Withdrawn);
        assert_eq!(Regime::from_scale(7.0), Regime::Engaged);
    }

    #[test]
    fn test_neutral_result() {
        let n = SignalResult::neutral();
        assert_eq!(n.coherence, 0.5);
        assert!(n.components.is_empty());
        assert!(n.regime.is_none());
    }

    #[test]
    fn test_adapter_fills_declared_defaults() {
        let mut a = adapter(Ok(SignalResult::new(0.7).with_component("alpha", 0.9)));
        let r = a.evaluate(&input(), 0).unwrap();
        assert_eq!(r.component("alpha"), Some(0.9));
        assert_eq!(r.component("beta"), Some(0.25));
        assert_eq!(a.consecutive_faults(), 0);
    }

    #[test]
    fn test_adapter_rejects_undeclared_component() {
        let mut a = adapter(Ok(SignalResult::new(0.7).with_component("alhpa", 0.9)));
        let err = a.evaluate(&input(), 0).unwrap_err();
        assert!(matches!(err, SignalError::UnknownComponent { ref component, .. } if component == "alhpa"));
        assert_eq!(a.consecutive_faults(), 1);
    }

    #[test]
    fn test_adapter_rejects_out_of_range_coherence() {
        for bad in [1.5_f32, -0.1, f32::NAN] {
            let mut a = adapter(Ok(SignalResult::new(bad)));
            assert!(matches!(
                a.evaluate(&input(), 0),
                Err(SignalError::OutOfRange { .. })
            ));
        }
    }

    #[test]
    fn test_adapter_rejects_non_finite_component() {
        let mut a = adapter(Ok(SignalResult::new(0.5).with_component("beta", f32::INFINITY)));
        assert!(matches!(
            a.evaluate(&input(), 0),
            Err(SignalError::NonFinite { .. })
        ));
    }

    #[test]
    fn test_adapter_counts_consecutive_faults_and_resets_per_turn() {
        let mut a = adapter(Err(SignalError::Failed("sensor offline".into())));
        for cycle in 0..3 {
            assert!(a.evaluate(&input(), cycle).is_err());
        }
        assert_eq!(a.consecutive_faults(), 3);
        a.begin_turn();
        assert_eq!(a.consecutive_faults(), 0);
    }

    #[test]
    fn test_overrunning_budget_is_a_timeout_fault() {
        let mut a = SignalAdapter::new(Box::new(Sleepy {
            spec: SourceSpec::new("slow", &[]).with_cycle_budget(Duration::from_millis(1)),
            nap: Duration::from_millis(20),
        }));
        match a.evaluate(&input(), 0) {
            Err(SignalError::Timeout { elapsed_ms, budget_ms }) => {
                assert_eq!(budget_ms, 1);
                assert!(elapsed_ms >= 20);
            }
            other => panic!("expected a timeout, got {other:?}"),
        }
        assert_eq!(a.consecutive_faults(), 1);
    }

    #[test]
    fn test_fast_source_within_budget_passes() {
        let mut a = SignalAdapter::new(Box::new(Fixed {
            spec: SourceSpec::new("quick", &[]).with_cycle_budget(Duration::from_secs(5)),
            result: Ok(SignalResult::new(0.5)),
        }));
        assert_eq!(a.evaluate(&input(), 0).unwrap().coherence, 0.5);
        assert_eq!(a.consecutive_faults(), 0);
    }
}
