/*
 * This source code is licensed under the Business Source License 1.1.
 * See LICENSE in the root directory for full details.
 */

//! Multi-cycle convergence of signal sources into energy and satisfaction.
//!
//! Each turn, every registered source is evaluated once per cycle. The cycle
//! aggregates drive two scalars:
//!
//! ```text
//! energy_t       = max(0, energy_{t-1} − mean(coherence_t) × energy_step)
//! goal_t         = mean(coherence_t) × agreement_t × stability_t
//! satisfaction_t = satisfaction_{t-1} + rate × (goal_t − satisfaction_{t-1})
//! ```
//!
//! where `agreement = 1 − 2·stddev(coherence)` across sources and
//! `stability = 1 − mean|coherence_t − coherence_{t-1}|` per source (1.0 on the
//! first cycle). `energy_{-1} = initial_energy`, `satisfaction_{-1} = 0`.
//!
//! The loop stops on the first of:
//!
//! 1. `energy_{t-1} − energy_t < convergence_threshold`
//! 2. `satisfaction_t > satisfaction_target`
//! 3. `max_cycles` evaluated
//!
//! # Kairos
//!
//! The kairos flag is an edge trigger: it latches on the first cycle where
//! satisfaction enters `kairos_window` from outside while energy is still
//! descending. Leaving the window and re-entering does not fire it again.
//!
//! # Faults
//!
//! A faulted evaluation is replaced by [`SignalResult::neutral`] and recorded
//! in [`CycleState::faulted`]. `max_consecutive_faults` faults in a row from
//! one source abort the turn with [`EngineError::FatalSignal`], carrying the
//! cycles completed so far.

use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::signal::{Regime, SignalAdapter, SignalResult, TurnInput};

// ─── Config ─────────────────────────────────────────────────────────────────

/// Convergence loop parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ConvergenceConfig {
    /// Absolute ceiling on cycles per turn. Default: 5.
    pub max_cycles: usize,
    /// Energy descent below which the loop is considered converged. Default: 0.1.
    pub convergence_threshold: f32,
    /// Satisfaction above which the loop stops early. Default: 0.9.
    pub satisfaction_target: f32,
    /// Energy before the first cycle. Default: 1.0.
    pub initial_energy: f32,
    /// Energy removed per unit of mean coherence. Default: 0.3.
    pub energy_step: f32,
    /// EMA rate pulling satisfaction toward the cycle goal. Default: 0.5.
    pub satisfaction_rate: f32,
    /// Inclusive satisfaction window `[low, high]` that raises kairos. Default: [0.30, 0.50].
    pub kairos_window: [f32; 2],
    /// Consecutive faults from one source that abort the turn. Default: 3.
    pub max_consecutive_faults: u32,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            max_cycles: 5,
            convergence_threshold: 0.1,
            satisfaction_target: 0.9,
            initial_energy: 1.0,
            energy_step: 0.3,
            satisfaction_rate: 0.5,
            kairos_window: [0.30, 0.50],
            max_consecutive_faults: 3,
        }
    }
}

impl ConvergenceConfig {
    /// Whether `satisfaction` lies inside the kairos window.
    pub fn in_kairos_window(&self, satisfaction: f32) -> bool {
        satisfaction >= self.kairos_window[0] && satisfaction <= self.kairos_window[1]
    }
}

// ─── CycleState ─────────────────────────────────────────────────────────────

/// Aggregate of all source results for one cycle.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CycleState {
    /// 0-based cycle index within the turn.
    pub index: usize,
    /// One result per source, in registration order.
    pub results: Vec<SignalResult>,
    /// Indices of sources whose result is a neutral stand-in for a fault.
    pub faulted: Vec<usize>,
    /// Energy after this cycle.
    pub energy: f32,
    /// Satisfaction after this cycle.
    pub satisfaction: f32,
}

impl CycleState {
    /// Coherence of every source, in registration order.
    pub fn coherences(&self) -> Vec<f32> {
        self.results.iter().map(|r| r.coherence).collect()
    }

    /// Mean coherence across sources (0.0 with no sources).
    pub fn mean_coherence(&self) -> f32 {
        mean(self.results.iter().map(|r| r.coherence))
    }

    /// Mean regime scale over the sources that report one; 0.5 when none do.
    pub fn regime_scale(&self) -> f32 {
        let (sum, n) = self
            .results
            .iter()
            .filter_map(|r| r.regime)
            .fold((0.0_f32, 0_u32), |(s, n), r| (s + r.scale(), n + 1));
        if n == 0 {
            Regime::Mobilized.scale()
        } else {
            sum / n as f32
        }
    }

    /// Regime nearest to [`CycleState::regime_scale`].
    pub fn regime(&self) -> Regime {
        Regime::from_scale(self.regime_scale())
    }
}

// ─── Outcome ────────────────────────────────────────────────────────────────

/// Why the loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TerminationReason {
    /// Energy descent fell below the convergence threshold.
    EnergyConverged,
    /// Satisfaction exceeded the target.
    Satisfied,
    /// The cycle budget ran out.
    CycleBudget,
}

/// The full trajectory of one turn.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConvergenceOutcome {
    /// Every completed cycle, in order. Never empty.
    pub cycles: Vec<CycleState>,
    /// Energy before the first cycle.
    pub initial_energy: f32,
    /// Why the loop stopped.
    pub termination: TerminationReason,
    /// Cycle on which kairos fired, if it did.
    pub kairos_cycle: Option<usize>,
}

impl ConvergenceOutcome {
    /// First cycle of the turn.
    pub fn initial(&self) -> &CycleState {
        &self.cycles[0]
    }

    /// Last cycle of the turn.
    pub fn final_state(&self) -> &CycleState {
        &self.cycles[self.cycles.len() - 1]
    }

    /// Number of cycles evaluated.
    pub fn cycle_count(&self) -> usize {
        self.cycles.len()
    }

    /// Whether kairos fired this turn.
    pub fn kairos(&self) -> bool {
        self.kairos_cycle.is_some()
    }

    /// Energy descent on the final cycle.
    pub fn final_descent(&self) -> f32 {
        let n = self.cycles.len();
        let prev = if n >= 2 {
            self.cycles[n - 2].energy
        } else {
            self.initial_energy
        };
        prev - self.cycles[n - 1].energy
    }

    /// Total number of faulted evaluations across the turn.
    pub fn fault_count(&self) -> usize {
        self.cycles.iter().map(|c| c.faulted.len()).sum()
    }
}

// ─── ConvergenceLoop ────────────────────────────────────────────────────────

/// Drives repeated evaluation of all sources until a termination criterion holds.
#[derive(Clone, Debug)]
pub struct ConvergenceLoop {
    config: ConvergenceConfig,
}

impl ConvergenceLoop {
    /// Build a loop with the given parameters.
    pub fn new(config: ConvergenceConfig) -> Self {
        Self { config }
    }

    /// Current parameters.
    pub fn config(&self) -> &ConvergenceConfig {
        &self.config
    }

    /// Run one turn against `sources`.
    ///
    /// Every adapter is reset first, so no per-turn state leaks between turns.
    pub fn run(
        &self,
        sources: &mut [SignalAdapter],
        input: &TurnInput,
    ) -> EngineResult<ConvergenceOutcome> {
        for source in sources.iter_mut() {
            source.begin_turn();
        }

        let cfg = &self.config;
        let max_cycles = cfg.max_cycles.max(1);
        let mut cycles: Vec<CycleState> = Vec::with_capacity(max_cycles);
        let mut energy = cfg.initial_energy;
        let mut satisfaction = 0.0_f32;
        let mut previous: Option<Vec<f32>> = None;
        let mut kairos_cycle: Option<usize> = None;
        let mut termination = TerminationReason::CycleBudget;

        for index in 0..max_cycles {
            let mut results = Vec::with_capacity(sources.len());
            let mut faulted = Vec::new();

            for (slot, source) in sources.iter_mut().enumerate() {
                match source.evaluate(input, index) {
                    Ok(result) => results.push(result),
                    Err(err) => {
                        let faults = source.consecutive_faults();
                        warn!(
                            source = %source.spec().name,
                            turn = input.turn_id,
                            cycle = index,
                            faults,
                            error = %err,
                            "signal fault, substituting neutral result"
                        );
                        if faults >= cfg.max_consecutive_faults {
                            return Err(EngineError::FatalSignal {
                                source_name: source.spec().name.clone(),
                                faults,
                                partial: cycles,
                            });
                        }
                        results.push(SignalResult::neutral());
                        faulted.push(slot);
                    }
                }
            }

            let coherences: Vec<f32> = results.iter().map(|r| r.coherence).collect();
            let mean_coh = mean(coherences.iter().copied());

            let next_energy = (energy - mean_coh * cfg.energy_step).max(0.0);
            let descent = energy - next_energy;

            let agreement = (1.0 - 2.0 * stddev(&coherences)).clamp(0.0, 1.0);
            let stability = match &previous {
                Some(prev) => (1.0
                    - mean(prev.iter().zip(&coherences).map(|(a, b)| (a - b).abs())))
                .clamp(0.0, 1.0),
                None => 1.0,
            };
            let goal = mean_coh * agreement * stability;
            let next_satisfaction =
                satisfaction + cfg.satisfaction_rate * (goal - satisfaction);

            if kairos_cycle.is_none()
                && descent > 0.0
                && !cfg.in_kairos_window(satisfaction)
                && cfg.in_kairos_window(next_satisfaction)
            {
                kairos_cycle = Some(index);
                debug!(turn = input.turn_id, cycle = index, satisfaction = next_satisfaction, "kairos");
            }

            energy = next_energy;
            satisfaction = next_satisfaction;
            previous = Some(coherences);
            cycles.push(CycleState {
                index,
                results,
                faulted,
                energy,
                satisfaction,
            });

            if descent < cfg.convergence_threshold {
                termination = TerminationReason::EnergyConverged;
                break;
            }
            if satisfaction > cfg.satisfaction_target {
                termination = TerminationReason::Satisfied;
                break;
            }
        }

        debug!(
            turn = input.turn_id,
            cycles = cycles.len(),
            reason = ?termination,
            energy,
            satisfaction,
            "convergence finished"
        );

        Ok(ConvergenceOutcome {
            cycles,
            initial_energy: cfg.initial_energy,
            termination,
            kairos_cycle,
        })
    }
}

impl Default for ConvergenceLoop {
    fn default() -> Self {
        Self::new(ConvergenceConfig::default())
    }
}

// ─── helpers ────────────────────────────────────────────────────────────────

pub(crate) fn mean<I: IntoIterator<Item = f32>>(values: I) -> f32 {
    let (sum, n) = values
        .into_iter()
        .fold((0.0_f32, 0_u32), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f32
    }
}

pub(crate) fn variance(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values.iter().copied());
    mean(values.iter().map(|v| (v - m) * (v - m)))
}

pub(crate) fn stddev(values: &[f32]) -> f32 {
    variance(values).sqrt()
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ScriptedSource;

    fn adapters(sources: Vec<ScriptedSource>) -> Vec<SignalAdapter> {
        sources
            .into_iter()
            .map(|s| SignalAdapter::new(Box::new(s)))
            .collect()
    }

    fn turn() -> TurnInput {
        TurnInput::new(7, "a turn")
    }

    #[test]
    fn test_energy_descends_and_is_clamped_at_zero() {
        let cfg = ConvergenceConfig {
            max_cycles: 10,
            convergence_threshold: 0.0,
            satisfaction_target: 2.0,
            ..ConvergenceConfig::default()
        };
        let mut srcs = adapters(vec![ScriptedSource::constant("a", 1.0)]);
        let out = ConvergenceLoop::new(cfg).run(&mut srcs, &turn()).unwrap();
        let energies: Vec<f32> = out.cycles.iter().map(|c| c.energy).collect();
        for w in energies.windows(2) {
            assert!(w[1] <= w[0], "energy must not rise: {:?}", energies);
        }
        assert!(energies.iter().all(|e| *e >= 0.0));
        assert_eq!(*energies.last().unwrap(), 0.0);
    }

    #[test]
    fn test_low_coherence_converges_on_first_cycle() {
        // mean 0.2 × step 0.3 = 0.06 < 0.1
        let mut srcs = adapters(vec![
            ScriptedSource::constant("a", 0.2),
            ScriptedSource::constant("b", 0.2),
        ]);
        let out = ConvergenceLoop::default().run(&mut srcs, &turn()).unwrap();
        assert_eq!(out.cycle_count(), 1);
        assert_eq!(out.termination, TerminationReason::EnergyConverged);
    }

    #[test]
    fn test_stable_agreeing_sources_reach_satisfaction() {
        let cfg = ConvergenceConfig {
            max_cycles: 10,
            initial_energy: 100.0,
            ..ConvergenceConfig::default()
        };
        let mut srcs = adapters(vec![
            ScriptedSource::constant("a", 1.0),
            ScriptedSource::constant("b", 1.0),
        ]);
        let out = ConvergenceLoop::new(cfg).run(&mut srcs, &turn()).unwrap();
        // 0.5, 0.75, 0.875, 0.9375
        assert_eq!(out.termination, TerminationReason::Satisfied);
        assert_eq!(out.cycle_count(), 4);
        assert!(out.final_state().satisfaction > 0.9);
    }

    #[test]
    fn test_cycle_budget_is_absolute_ceiling() {
        // Satisfaction plateaus near 0.6 and energy keeps descending by 0.18 per cycle.
        let cfg = ConvergenceConfig {
            initial_energy: 10.0,
            ..ConvergenceConfig::default()
        };
        let mut srcs = adapters(vec![
            ScriptedSource::constant("a", 0.6),
            ScriptedSource::constant("b", 0.6),
            ScriptedSource::constant("c", 0.6),
        ]);
        let out = ConvergenceLoop::new(cfg).run(&mut srcs, &turn()).unwrap();
        assert_eq!(out.cycle_count(), 5);
        assert_eq!(out.termination, TerminationReason::CycleBudget);
        assert!(out.cycles.iter().all(|c| c.satisfaction <= 0.9));
    }

    #[test]
    fn test_kairos_fires_once_on_entry() {
        let cfg = ConvergenceConfig {
            max_cycles: 10,
            initial_energy: 100.0,
            ..ConvergenceConfig::default()
        };
        // goal 0.8: satisfaction 0.4 (enters window), 0.6, 0.7, ... never re-enters
        let mut srcs = adapters(vec![
            ScriptedSource::constant("a", 0.8),
            ScriptedSource::constant("b", 0.8),
        ]);
        let out = ConvergenceLoop::new(cfg).run(&mut srcs, &turn()).unwrap();
        assert_eq!(out.kairos_cycle, Some(0));
        let inside = out
            .cycles
            .iter()
            .filter(|c| (0.30..=0.50).contains(&c.satisfaction))
            .count();
        assert_eq!(inside, 1);
    }

    #[test]
    fn test_kairos_not_refired_after_leaving_window() {
        let cfg = ConvergenceConfig {
            max_cycles: 6,
            initial_energy: 100.0,
            convergence_threshold: 0.0,
            satisfaction_target: 2.0,
            ..ConvergenceConfig::default()
        };
        // High, then a collapse that drags satisfaction back through the window.
        let mut srcs = adapters(vec![ScriptedSource::scripted(
            "a",
            &[0.8, 0.9, 0.9, 0.1, 0.1, 0.8],
        )]);
        let out = ConvergenceLoop::new(cfg).run(&mut srcs, &turn()).unwrap();
        assert_eq!(out.kairos_cycle, Some(0));
    }

    #[test]
    fn test_transient_fault_records_neutral() {
        let mut srcs = adapters(vec![
            ScriptedSource::constant("a", 0.9),
            ScriptedSource::constant("b", 0.9).failing_on(&[0]),
        ]);
        let cfg = ConvergenceConfig {
            initial_energy: 100.0,
            ..ConvergenceConfig::default()
        };
        let out = ConvergenceLoop::new(cfg).run(&mut srcs, &turn()).unwrap();
        assert_eq!(out.initial().faulted, vec![1]);
        assert_eq!(out.initial().results[1], SignalResult::neutral());
        assert!(out.cycles[1].faulted.is_empty());
        assert_eq!(out.fault_count(), 1);
    }

    #[test]
    fn test_three_consecutive_faults_are_fatal_with_partial_trajectory() {
        let cfg = ConvergenceConfig {
            initial_energy: 100.0,
            ..ConvergenceConfig::default()
        };
        let mut srcs = adapters(vec![
            ScriptedSource::constant("steady", 0.7),
            ScriptedSource::constant("flaky", 0.7).failing_on(&[0, 1, 2]),
        ]);
        let err = ConvergenceLoop::new(cfg).run(&mut srcs, &turn()).unwrap_err();
        match err {
            EngineError::FatalSignal {
                source_name,
                faults,
                partial,
            } => {
                assert_eq!(source_name, "flaky");
                assert_eq!(faults, 3);
                assert_eq!(partial.len(), 2);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    struct Sleepy {
        spec: crate::signal::SourceSpec,
    }

    impl crate::signal::SignalSource for Sleepy {
        fn spec(&self) -> &crate::signal::SourceSpec {
            &self.spec
        }
        fn evaluate(&mut self, _input: &TurnInput, _cycle: usize) -> Result<SignalResult, crate::signal::SignalError> {
            std::thread::sleep(std::time::Duration::from_millis(20));
            Ok(SignalResult::new(0.7))
        }
    }

    #[test]
    fn test_repeated_timeouts_are_fatal_like_faults() {
        let cfg = ConvergenceConfig {
            initial_energy: 100.0,
            ..ConvergenceConfig::default()
        };
        let slow = crate::signal::SourceSpec::new("slow", &[]).with_cycle_budget(std::time::Duration::from_millis(1));
        let mut srcs = vec![
            SignalAdapter::new(Box::new(ScriptedSource::constant("steady", 0.7))),
            SignalAdapter::new(Box::new(Sleepy { spec: slow })),
        ];
        match ConvergenceLoop::new(cfg).run(&mut srcs, &turn()).unwrap_err() {
            EngineError::FatalSignal {
                source_name,
                faults,
                partial,
            } => {
                assert_eq!(source_name, "slow");
                assert_eq!(faults, 3);
                assert_eq!(partial.len(), 2);
                assert!(partial.iter().all(|c| c.faulted == vec![1]));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_non_consecutive_faults_are_not_fatal() {
        let cfg = ConvergenceConfig {
            initial_energy: 100.0,
            ..ConvergenceConfig::default()
        };
        let mut srcs = adapters(vec![
            ScriptedSource::constant("flaky", 0.7).failing_on(&[0, 1, 3, 4]),
        ]);
        let out = ConvergenceLoop::new(cfg).run(&mut srcs, &turn()).unwrap();
        assert_eq!(out.fault_count(), 4);
    }

    #[test]
    fn test_regime_scale_defaults_to_mobilized() {
        let state = CycleState {
            index: 0,
            results: vec![SignalResult::new(0.5)],
            faulted: vec![],
            energy: 1.0,
            satisfaction: 0.0,
        };
        assert_eq!(state.regime_scale(), 0.5);
        assert_eq!(state.regime(), Regime::Mobilized);
    }

    #[test]
    fn test_helpers() {
        assert_eq!(mean(Vec::<f32>::new()), 0.0);
        assert!((mean(vec![1.0, 2.0, 3.0]) - 2.0).abs() < 1e-6);
        assert!((variance(&[1.0, 3.0]) - 1.0).abs() < 1e-6);
        assert_eq!(stddev(&[0.4, 0.4, 0.4]), 0.0);
    }
}
