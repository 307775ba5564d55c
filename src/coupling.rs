/*
 * This source code is licensed under the Business Source License 1.1.
 * See LICENSE in the root directory for full details.
 */

//! Pairwise association strengths between signal sources.
//!
//! After every convergence cycle, each unordered pair of sources `(i, j)` moves
//! its strength toward the instantaneous co-activation of the two coherences:
//!
//! ```text
//! M[i][j] = M[j][i] ← clamp(M[i][j] + lr × (co(c_i, c_j) − M[i][j]), 0, 1)
//! ```
//!
//! This is an EMA toward co-activation, not unconditional reinforcement, so a
//! pair that stops firing together loses strength again. With the default
//! `lr = 0.05` the matrix needs dozens of agreeing cycles to approach its
//! ceiling and keeps headroom to differentiate.
//!
//! Pairs involving a source that faulted in the cycle are not updated: the
//! neutral stand-in carries no co-activation evidence.
//!
//! # Invariants
//!
//! - The matrix is symmetric with a zero diagonal.
//! - Every entry stays in [0, 1] after any sequence of updates.

use std::collections::BTreeSet;

use tracing::trace;

use crate::convergence::CycleState;
use crate::error::{EngineError, EngineResult};
use crate::signal::SourceSpec;

/// Strength at or above which an entry counts toward [`CouplingLearner::saturation`].
pub const SATURATION_LEVEL: f32 = 0.95;

// ─── Config ─────────────────────────────────────────────────────────────────

/// Co-activation score of two coherences.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CoActivation {
    /// `a × b`.
    Product,
    /// `min(a, b)`.
    Min,
}

impl CoActivation {
    /// Score of two coherences, each clamped to [0, 1] first.
    pub fn score(self, a: f32, b: f32) -> f32 {
        let (a, b) = (a.clamp(0.0, 1.0), b.clamp(0.0, 1.0));
        match self {
            CoActivation::Product => a * b,
            CoActivation::Min => a.min(b),
        }
    }
}

/// Initial matrix.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CouplingInit {
    /// All zeros.
    Zero,
    /// Jaccard overlap of the two sources' component vocabularies, times `weight`.
    SemanticPrior {
        /// Scale in [0, 1].
        weight: f32,
    },
    /// Caller-supplied row-major N×N matrix. Must be symmetric with entries in [0, 1].
    Explicit(Vec<f32>),
}

/// Coupling learner parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CouplingConfig {
    /// EMA rate in (0, 1]. Default: 0.05.
    pub learning_rate: f32,
    /// Co-activation score. Default: [`CoActivation::Product`].
    pub co_activation: CoActivation,
    /// Initial matrix. Default: [`CouplingInit::Zero`].
    pub init: CouplingInit,
}

impl Default for CouplingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.05,
            co_activation: CoActivation::Product,
            init: CouplingInit::Zero,
        }
    }
}

// ─── CouplingMatrix ─────────────────────────────────────────────────────────

/// Symmetric N×N matrix with a zero diagonal, stored row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct CouplingMatrix {
    names: Vec<String>,
    values: Vec<f32>,
}

impl CouplingMatrix {
    /// Zero matrix over the named sources.
    pub fn zeros(names: Vec<String>) -> Self {
        let n = names.len();
        Self {
            names,
            values: vec![0.0; n * n],
        }
    }

    /// Build from row-major values, validating shape, symmetry and range.
    pub fn from_values(names: Vec<String>, values: Vec<f32>) -> EngineResult<Self> {
        let n = names.len();
        if values.len() != n * n {
            return Err(EngineError::Dimension {
                expected: n * n,
                got: values.len(),
            });
        }
        let mut m = Self::zeros(names);
        for i in 0..n {
            for j in (i + 1)..n {
                let a = values[i * n + j];
                let b = values[j * n + i];
                if !a.is_finite() || !(0.0..=1.0).contains(&a) {
                    return Err(EngineError::Config(format!(
                        "coupling entry ({i}, {j}) = {a} outside [0, 1]"
                    )));
                }
                if (a - b).abs() > 1e-6 {
                    return Err(EngineError::Config(format!(
                        "coupling matrix not symmetric at ({i}, {j}): {a} vs {b}"
                    )));
                }
                m.set(i, j, a);
            }
        }
        Ok(m)
    }

    /// Number of sources.
    pub fn size(&self) -> usize {
        self.names.len()
    }

    /// Source names, in registration order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Row-major values.
    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// Index of a source by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Strength between sources `i` and `j` (0.0 out of range or on the diagonal).
    pub fn get(&self, i: usize, j: usize) -> f32 {
        let n = self.size();
        if i >= n || j >= n {
            return 0.0;
        }
        self.values[i * n + j]
    }

    fn set(&mut self, i: usize, j: usize, value: f32) {
        if i == j {
            return;
        }
        let n = self.size();
        let v = value.clamp(0.0, 1.0);
        self.values[i * n + j] = v;
        self.values[j * n + i] = v;
    }

    fn off_diagonal(&self) -> impl Iterator<Item = f32> + '_ {
        let n = self.size();
        (0..n).flat_map(move |i| ((i + 1)..n).map(move |j| self.values[i * n + j]))
    }
}

// ─── CouplingLearner ────────────────────────────────────────────────────────

/// Online learner of the coupling matrix.
#[derive(Clone, Debug)]
pub struct CouplingLearner {
    config: CouplingConfig,
    matrix: CouplingMatrix,
    updates: u64,
}

impl CouplingLearner {
    /// Learner over `sources`, initialised per `config.init`.
    pub fn new(config: CouplingConfig, sources: &[SourceSpec]) -> EngineResult<Self> {
        let names: Vec<String> = sources.iter().map(|s| s.name.clone()).collect();
        let matrix = match &config.init {
            CouplingInit::Zero => CouplingMatrix::zeros(names),
            CouplingInit::SemanticPrior { weight } => {
                let w = weight.clamp(0.0, 1.0);
                let mut m = CouplingMatrix::zeros(names);
                for i in 0..sources.len() {
                    for j in (i + 1)..sources.len() {
                        m.set(i, j, w * jaccard(&sources[i].components, &sources[j].components));
                    }
                }
                m
            }
            CouplingInit::Explicit(values) => CouplingMatrix::from_values(names, values.clone())?,
        };
        Ok(Self {
            config,
            matrix,
            updates: 0,
        })
    }

    /// Rebuild from a persisted matrix.
    pub(crate) fn from_parts(config: CouplingConfig, matrix: CouplingMatrix, updates: u64) -> Self {
        Self {
            config,
            matrix,
            updates,
        }
    }

    /// Current parameters.
    pub fn config(&self) -> &CouplingConfig {
        &self.config
    }

    /// Current matrix.
    pub fn matrix(&self) -> &CouplingMatrix {
        &self.matrix
    }

    /// Cycles observed so far.
    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Strength between `i` and `j`.
    pub fn get(&self, i: usize, j: usize) -> f32 {
        self.matrix.get(i, j)
    }

    /// Strength between two sources by name.
    pub fn strength(&self, a: &str, b: &str) -> Option<f32> {
        let i = self.matrix.index_of(a)?;
        let j = self.matrix.index_of(b)?;
        Some(self.matrix.get(i, j))
    }

    /// Apply one cycle's co-activations.
    pub fn observe_cycle(&mut self, cycle: &CycleState) -> EngineResult<()> {
        self.update(&cycle.coherences(), &cycle.faulted)
    }

    /// Apply one set of coherences, one per source in registration order.
    pub fn observe_coherences(&mut self, coherences: &[f32]) -> EngineResult<()> {
        self.update(coherences, &[])
    }

    fn update(&mut self, coherences: &[f32], skip: &[usize]) -> EngineResult<()> {
        let n = self.matrix.size();
        if coherences.len() != n {
            return Err(EngineError::Dimension {
                expected: n,
                got: coherences.len(),
            });
        }
        let lr = self.config.learning_rate;
        for i in 0..n {
            if skip.contains(&i) || !coherences[i].is_finite() {
                continue;
            }
            for j in (i + 1)..n {
                if skip.contains(&j) || !coherences[j].is_finite() {
                    continue;
                }
                let co = self.config.co_activation.score(coherences[i], coherences[j]);
                let m = self.matrix.get(i, j);
                self.matrix.set(i, j, m + lr * (co - m));
            }
        }
        self.updates = self.updates.saturating_add(1);
        trace!(updates = self.updates, mean = self.mean_strength(), "coupling updated");
        Ok(())
    }

    /// Up to `k` partners of source `i`, strongest first. Ties keep registration order.
    pub fn strongest_partners(&self, i: usize, k: usize) -> Vec<(usize, f32)> {
        let n = self.matrix.size();
        if i >= n {
            return Vec::new();
        }
        let mut partners: Vec<(usize, f32)> = (0..n)
            .filter(|&j| j != i)
            .map(|j| (j, self.matrix.get(i, j)))
            .collect();
        partners.sort_by(|a, b| b.1.total_cmp(&a.1));
        partners.truncate(k);
        partners
    }

    /// Mean off-diagonal strength (0.0 with fewer than two sources).
    pub fn mean_strength(&self) -> f32 {
        let (sum, count) = self
            .matrix
            .off_diagonal()
            .fold((0.0_f32, 0_usize), |(s, c), v| (s + v, c + 1));
        if count == 0 {
            0.0
        } else {
            sum / count as f32
        }
    }

    /// Fraction of off-diagonal entries at or above [`SATURATION_LEVEL`].
    pub fn saturation(&self) -> f32 {
        let (hot, count) = self
            .matrix
            .off_diagonal()
            .fold((0_usize, 0_usize), |(h, c), v| (h + usize::from(v >= SATURATION_LEVEL), c + 1));
        if count == 0 {
            0.0
        } else {
            hot as f32 / count as f32
        }
    }
}

fn jaccard(a: &[String], b: &[String]) -> f32 {
    let a: BTreeSet<&str> = a.iter().map(String::as_str).collect();
    let b: BTreeSet<&str> = b.iter().map(String::as_str).collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f32 / union as f32
}

// ─── Tests ──────────────────────────────────────────────────────────────────
