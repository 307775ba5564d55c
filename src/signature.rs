/*
 * This source code is licensed under the Business Source License 1.1.
 * See LICENSE in the root directory for full details.
 */

//! Transformation signatures: a fixed 57-dimensional fingerprint of one turn.
//!
//! The extractor maps a turn's trajectory (initial state, final state, every
//! cycle in between) plus caller-declared auxiliary signals onto a stable
//! layout, then L2-normalises the result.
//!
//! # Layout (version 1)
//!
//! | Range | Block | Contents |
//! |-------|-------|----------|
//! | 0..6 | energy | initial, final, descent, descent ratio, termination deviation, kairos |
//! | 6..22 | shift | per-source coherence shift (final − initial), 16 source slots |
//! | 22..25 | regime | initial, final, shift on the ordered regime scale (weighted ×2) |
//! | 25..31 | satisfaction | initial, final, improvement, \|change\|, sign, variance |
//! | 31..35 | convergence | cycles / max, descent speed, late stability, micro-clusters / cycles |
//! | 35..43 | lexical | caller counts, squashed `x / (1 + x)` |
//! | 43..57 | category | caller category weights in [0, 1] |
//!
//! Changing any offset, weight or scale invalidates every stored family and
//! pattern. [`SignatureLayout::tag`] captures all of them so persisted stores
//! can refuse to load under a different encoder.
//!
//! # Invariants
//!
//! - Output length is always [`SIGNATURE_DIM`].
//! - Output has unit L2 norm, except the all-zero vector, which is returned
//!   unnormalised and flagged [`TransformationSignature::degenerate`].
//! - Extraction is a pure function of its inputs: no randomness, no clock.

use crate::convergence::{mean, variance, ConvergenceConfig, ConvergenceOutcome, CycleState};
use crate::error::{EngineError, EngineResult};

/// Encoding scheme version. Bump on any layout change.
pub const LAYOUT_VERSION: u16 = 1;

/// Total signature length.
pub const SIGNATURE_DIM: usize = 57;

/// Source slots in the shift block. Sources beyond this are not encoded.
pub const MAX_SOURCES: usize = 16;

/// Length of the lexical auxiliary block.
pub const LEXICAL_DIM: usize = 8;

/// Length of the category auxiliary block.
pub const CATEGORY_DIM: usize = 14;

const ENERGY_OFFSET: usize = 0;
const SHIFT_OFFSET: usize = 6;
const REGIME_OFFSET: usize = SHIFT_OFFSET + MAX_SOURCES;
const SATISFACTION_OFFSET: usize = REGIME_OFFSET + 3;
const CONVERGENCE_OFFSET: usize = SATISFACTION_OFFSET + 6;
const LEXICAL_OFFSET: usize = CONVERGENCE_OFFSET + 4;
const CATEGORY_OFFSET: usize = LEXICAL_OFFSET + LEXICAL_DIM;

const _: () = assert!(CATEGORY_OFFSET + CATEGORY_DIM == SIGNATURE_DIM);

/// Weight applied to the regime block.
const REGIME_WEIGHT: f32 = 2.0;

/// RMS coherence jump between consecutive cycles that starts a new micro-cluster.
const MICRO_CLUSTER_GAP: f32 = 0.15;

/// Norm below which a raw signature is treated as all-zero.
const ZERO_NORM: f32 = 1e-12;

/// Raw-vector variance below which a signature is flagged low-confidence.
const LOW_VARIANCE: f32 = 1e-9;

// ─── vector helpers ─────────────────────────────────────────────────────────

/// Dot product over the common prefix of `a` and `b`.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Euclidean norm.
pub fn l2_norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// Scale `v` to unit length in place. Returns `false` (leaving `v` untouched)
/// when the norm is effectively zero.
pub fn normalize(v: &mut [f32]) -> bool {
    let norm = l2_norm(v);
    if norm < ZERO_NORM || !norm.is_finite() {
        return false;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    true
}

/// Cosine similarity in [-1, 1]; 0.0 if either vector is all-zero.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let na = l2_norm(a);
    let nb = l2_norm(b);
    if na < ZERO_NORM || nb < ZERO_NORM {
        0.0
    } else {
        (dot(a, b) / (na * nb)).clamp(-1.0, 1.0)
    }
}

// ─── SignatureLayout ────────────────────────────────────────────────────────

/// Every constant the encoding depends on.
#[derive(Clone, Debug, PartialEq)]
pub struct SignatureLayout {
    /// Encoding scheme version.
    pub version: u16,
    /// Signature length.
    pub dim: usize,
    /// Source slots.
    pub max_sources: usize,
    /// Energy normaliser (the convergence loop's initial energy).
    pub energy_scale: f32,
    /// Cycle-count normaliser.
    pub max_cycles: usize,
    /// Convergence threshold used for the termination-deviation feature.
    pub convergence_threshold: f32,
}

impl SignatureLayout {
    /// Layout implied by a convergence configuration.
    pub fn from_config(config: &ConvergenceConfig) -> Self {
        Self {
            version: LAYOUT_VERSION,
            dim: SIGNATURE_DIM,
            max_sources: MAX_SOURCES,
            energy_scale: config.initial_energy,
            max_cycles: config.max_cycles.max(1),
            convergence_threshold: config.convergence_threshold,
        }
    }

    /// Stable identifier written into every persisted store.
    pub fn tag(&self) -> String {
        format!(
            "tsig-v{}-d{}-s{}-e{:.4}-c{}-t{:.4}",
            self.version,
            self.dim,
            self.max_sources,
            self.energy_scale,
            self.max_cycles,
            self.convergence_threshold
        )
    }
}

// ─── AuxiliarySignals ───────────────────────────────────────────────────────

/// Caller-declared lexical counts and category weights for one turn.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuxiliarySignals {
    /// Non-negative counts (see [`crate::reference::lexical_profile`]).
    pub lexical: [f32; LEXICAL_DIM],
    /// Category weights in [0, 1].
    pub categories: [f32; CATEGORY_DIM],
}

impl AuxiliarySignals {
    /// Builder: set the lexical block.
    pub fn with_lexical(mut self, counts: [f32; LEXICAL_DIM]) -> Self {
        self.lexical = counts;
        self
    }

    /// Builder: set one category weight. Out-of-range indices are ignored.
    pub fn with_category(mut self, index: usize, weight: f32) -> Self {
        if let Some(slot) = self.categories.get_mut(index) {
            *slot = weight;
        }
        self
    }
}

// ─── TransformationSignature ────────────────────────────────────────────────

/// A unit-normalised fingerprint of one turn's state transformation.
#[derive(Clone, Debug, PartialEq)]
pub struct TransformationSignature {
    values: [f32; SIGNATURE_DIM],
    degenerate: bool,
    low_confidence: bool,
}

impl TransformationSignature {
    /// Normalise a raw vector into a signature.
    ///
    /// Non-finite entries are zeroed. An all-zero vector is kept as-is and
    /// flagged degenerate.
    pub fn from_raw(mut raw: [f32; SIGNATURE_DIM]) -> Self {
        for x in raw.iter_mut() {
            if !x.is_finite() {
                *x = 0.0;
            }
        }
        let low_variance = variance(&raw) < LOW_VARIANCE;
        let normalized = normalize(&mut raw);
        if !normalized {
            raw = [0.0; SIGNATURE_DIM];
        }
        Self {
            values: raw,
            degenerate: !normalized,
            low_confidence: !normalized || low_variance,
        }
    }

    /// Build from a slice, checking its length.
    pub fn from_slice(values: &[f32]) -> EngineResult<Self> {
        let raw: [f32; SIGNATURE_DIM] = values.try_into().map_err(|_| EngineError::Dimension {
            expected: SIGNATURE_DIM,
            got: values.len(),
        })?;
        Ok(Self::from_raw(raw))
    }

    /// The normalised components.
    pub fn values(&self) -> &[f32; SIGNATURE_DIM] {
        &self.values
    }

    /// The normalised components as a slice.
    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// All-zero input; the vector is not unit length.
    pub fn is_degenerate(&self) -> bool {
        self.degenerate
    }

    /// Degenerate or near-zero-variance input; downstream results are weak.
    pub fn is_low_confidence(&self) -> bool {
        self.low_confidence
    }

    /// Cosine similarity with another signature (a dot product; both are unit length).
    pub fn similarity(&self, other: &Self) -> f32 {
        dot(&self.values, &other.values).clamp(-1.0, 1.0)
    }

    /// Similarity against a raw centroid slice.
    pub fn similarity_to(&self, centroid: &[f32]) -> f32 {
        dot(&self.values, centroid).clamp(-1.0, 1.0)
    }
}

// ─── SignatureExtractor ─────────────────────────────────────────────────────

/// Deterministic encoder from a converged turn to a [`TransformationSignature`].
#[derive(Clone, Debug)]
pub struct SignatureExtractor {
    layout: SignatureLayout,
}

impl SignatureExtractor {
    /// Extractor matching the given convergence configuration.
    pub fn new(config: &ConvergenceConfig) -> Self {
        Self {
            layout: SignatureLayout::from_config(config),
        }
    }

    /// The layout this extractor encodes with.
    pub fn layout(&self) -> &SignatureLayout {
        &self.layout
    }

    /// Encode one turn.
    pub fn extract(&self, outcome: &ConvergenceOutcome, aux: &AuxiliarySignals) -> TransformationSignature {
        TransformationSignature::from_raw(self.raw(outcome, aux))
    }

    /// The unnormalised feature vector.
    pub fn raw(&self, outcome: &ConvergenceOutcome, aux: &AuxiliarySignals) -> [f32; SIGNATURE_DIM] {
        let mut v = [0.0_f32; SIGNATURE_DIM];
        let initial = outcome.initial();
        let last = outcome.final_state();
        let trajectory = &outcome.cycles;
        let scale = if self.layout.energy_scale > ZERO_NORM {
            self.layout.energy_scale
        } else {
            1.0
        };

        // energy transformation
        let descent = initial.energy - last.energy;
        v[ENERGY_OFFSET] = initial.energy / scale;
        v[ENERGY_OFFSET + 1] = last.energy / scale;
        v[ENERGY_OFFSET + 2] = descent / scale;
        v[ENERGY_OFFSET + 3] = if initial.energy > ZERO_NORM {
            descent / initial.energy
        } else {
            0.0
        };
        v[ENERGY_OFFSET + 4] =
            (outcome.final_descent() - self.layout.convergence_threshold) / scale;
        v[ENERGY_OFFSET + 5] = if outcome.kairos() { 1.0 } else { 0.0 };

        // per-source coherence shift
        for (slot, (a, b)) in initial
            .results
            .iter()
            .zip(&last.results)
            .take(MAX_SOURCES)
            .enumerate()
        {
            v[SHIFT_OFFSET + slot] = b.coherence - a.coherence;
        }

        // categorical transition
        let r0 = initial.regime_scale();
        let r1 = last.regime_scale();
        v[REGIME_OFFSET] = r0 * REGIME_WEIGHT;
        v[REGIME_OFFSET + 1] = r1 * REGIME_WEIGHT;
        v[REGIME_OFFSET + 2] = (r1 - r0) * REGIME_WEIGHT;

        // satisfaction evolution
        let s0 = initial.satisfaction;
        let s1 = last.satisfaction;
        let improvement = s1 - s0;
        let satisfactions: Vec<f32> = trajectory.iter().map(|c| c.satisfaction).collect();
        v[SATISFACTION_OFFSET] = s0;
        v[SATISFACTION_OFFSET + 1] = s1;
        v[SATISFACTION_OFFSET + 2] = improvement;
        v[SATISFACTION_OFFSET + 3] = improvement.abs();
        v[SATISFACTION_OFFSET + 4] = if improvement > 1e-6 {
            1.0
        } else if improvement < -1e-6 {
            -1.0
        } else {
            0.0
        };
        v[SATISFACTION_OFFSET + 5] = variance(&satisfactions);

        // convergence characteristics
        let cycles = trajectory.len().max(1) as f32;
        v[CONVERGENCE_OFFSET] = cycles / self.layout.max_cycles as f32;
        v[CONVERGENCE_OFFSET + 1] = (outcome.initial_energy - last.energy) / cycles / scale;
        v[CONVERGENCE_OFFSET + 2] = late_stability(trajectory);
        v[CONVERGENCE_OFFSET + 3] = micro_clusters(trajectory) as f32 / cycles;

        // auxiliary blocks
        for (i, &count) in aux.lexical.iter().enumerate() {
            let c = if count.is_finite() { count.max(0.0) } else { 0.0 };
            v[LEXICAL_OFFSET + i] = c / (1.0 + c);
        }
        for (i, &w) in aux.categories.iter().enumerate() {
            v[CATEGORY_OFFSET + i] = if w.is_finite() { w.clamp(0.0, 1.0) } else { 0.0 };
        }

        v
    }
}

/// `1 − mean |Δ mean coherence|` over the second half of the trajectory.
fn late_stability(trajectory: &[CycleState]) -> f32 {
    let late = &trajectory[trajectory.len() / 2..];
    if late.len() < 2 {
        return 1.0;
    }
    let means: Vec<f32> = late.iter().map(CycleState::mean_coherence).collect();
    let drift = mean(means.windows(2).map(|w| (w[1] - w[0]).abs()));
    (1.0 - drift).clamp(0.0, 1.0)
}

/// Runs of consecutive cycles whose coherence vectors stay within
/// [`MICRO_CLUSTER_GAP`] RMS of their predecessor.
fn micro_clusters(trajectory: &[CycleState]) -> usize {
    if trajectory.is_empty() {
        return 0;
    }
    let breaks = trajectory
        .windows(2)
        .filter(|w| {
            let sq = mean(
                w[0].results
                    .iter()
                    .zip(&w[1].results)
                    .map(|(a, b)| (a.coherence - b.coherence).powi(2)),
            );
            sq.sqrt() > MICRO_CLUSTER_GAP
        })
        .count();
    1 + breaks
}

// ─── Tests ──────────────────────────────────────────────────────────────────
