//! Python FFI bindings via PyO3.
//!
//! Exposes the three learning stores to Python. Signatures cross the boundary
//! as plain lists of [`SIGNATURE_DIM`] floats, e.g. produced by the Rust
//! extractor and exported, or by an offline training driver.
//!
//! # Building the Python extension
//!
//! ```bash
//! pip install maturin
//! maturin develop --features python-ffi
//! ```
//!
//! # Usage
//!
//! ```python
//! from resonance_core import FamilyClusterer, PatternLearner, CouplingLearner
//!
//! families = FamilyClusterer()
//! family_id, similarity, kind = families.assign(signature, turn_id=1)
//!
//! patterns = PatternLearner()
//! patterns.observe(signature, "Tell me more.", turn=1)
//! patterns.record_outcome(signature, "Tell me more.", satisfaction=0.9, current_turn=2)
//! for fragment, score, confidence, kind in patterns.retrieve(signature, k=3, current_turn=2):
//!     print(fragment, score)
//!
//! coupling = CouplingLearner(["warmth", "focus", "distress"])
//! coupling.observe([0.8, 0.7, 0.1])
//! print(coupling.strength("warmth", "focus"))
//! ```

#![allow(non_snake_case)]

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::coupling::{CouplingConfig, CouplingLearner as RustCouplingLearner};
use crate::error::EngineError;
use crate::family::{ClusterConfig, FamilyClusterer as RustFamilyClusterer};
use crate::pattern::{PatternConfig, PatternLearner as RustPatternLearner, RetrievalQuery};
use crate::signal::SourceSpec;
use crate::signature::{TransformationSignature, SIGNATURE_DIM};

fn to_signature(values: &[f32]) -> PyResult<TransformationSignature> {
    TransformationSignature::from_slice(values).map_err(to_py_err)
}

fn to_py_err(e: EngineError) -> PyErr {
    PyValueError::new_err(e.to_string())
}

// ── FamilyClusterer ───────────────────────────────────────────────────────────

/// Online clusterer over transformation signatures.
///
/// The similarity threshold starts at `base_threshold` and rises by
/// `threshold_step` every `families_per_step` families, up to `max_threshold`.
#[pyclass(name = "FamilyClusterer")]
pub struct PyFamilyClusterer {
    inner: RustFamilyClusterer,
}

#[pymethods]
impl PyFamilyClusterer {
    /// Create an empty clusterer.
    #[new]
    #[pyo3(signature = (base_threshold=0.55, max_threshold=0.75, threshold_step=0.05, families_per_step=4))]
    pub fn new(base_threshold: f32, max_threshold: f32, threshold_step: f32, families_per_step: usize) -> Self {
        Self {
            inner: RustFamilyClusterer::new(ClusterConfig {
                base_threshold,
                max_threshold: max_threshold.max(base_threshold),
                threshold_step: threshold_step.max(0.0),
                families_per_step: families_per_step.max(1),
                ..ClusterConfig::default()
            }),
        }
    }

    /// Assign a signature. Returns `(family_id, similarity, kind)`; `family_id`
    /// is `None` for a degenerate signature.
    #[pyo3(signature = (signature, turn_id, outcome=None))]
    pub fn assign(&mut self, signature: Vec<f32>, turn_id: u64, outcome: Option<f32>) -> PyResult<(Option<u32>, f32, String)> {
        let sig = to_signature(&signature)?;
        let a = self.inner.assign(&sig, turn_id, outcome);
        Ok((a.family_id, a.similarity, format!("{:?}", a.kind)))
    }

    /// Best family and similarity, without updating anything.
    pub fn query(&self, signature: Vec<f32>) -> PyResult<Option<(u32, f32)>> {
        Ok(self.inner.query(&to_signature(&signature)?))
    }

    /// Fold an outcome in [0, 1] into a family's running mean.
    pub fn record_outcome(&mut self, family_id: u32, quality: f32) -> bool {
        self.inner.record_outcome(family_id, quality)
    }

    /// Number of families discovered.
    #[getter]
    pub fn family_count(&self) -> usize {
        self.inner.len()
    }

    /// Threshold the next assignment will use.
    #[getter]
    pub fn threshold(&self) -> f32 {
        self.inner.threshold()
    }

    /// `(family_count, total_assignments, max_family_share, collapsed)`.
    pub fn diagnostics(&self) -> (usize, u64, f32, bool) {
        let d = self.inner.diagnostics();
        (d.family_count, d.total_assignments, d.max_family_share, d.collapsed)
    }

    /// Python repr string.
    pub fn __repr__(&self) -> String {
        format!(
            "FamilyClusterer(families={}, threshold={:.2})",
            self.inner.len(),
            self.inner.threshold()
        )
    }
}

// ── PatternLearner ────────────────────────────────────────────────────────────

/// Fragment store with quality learned from delayed feedback.
#[pyclass(name = "PatternLearner")]
pub struct PyPatternLearner {
    inner: RustPatternLearner,
}

#[pymethods]
impl PyPatternLearner {
    /// Create an empty store.
    #[new]
    #[pyo3(signature = (alpha=0.2, initial_quality=0.5, resolution=0.1))]
    pub fn new(alpha: f32, initial_quality: f32, resolution: f32) -> PyResult<Self> {
        if !(resolution > 0.0) {
            return Err(PyValueError::new_err(format!("resolution must be > 0, got {resolution}")));
        }
        Ok(Self {
            inner: RustPatternLearner::new(PatternConfig {
                alpha: alpha.clamp(0.0, 1.0),
                initial_quality: initial_quality.clamp(0.0, 1.0),
                resolution,
                ..PatternConfig::default()
            }),
        })
    }

    /// Record that `fragment` was used for `signature`. Returns the lifecycle state.
    pub fn observe(&mut self, signature: Vec<f32>, fragment: &str, turn: u64) -> PyResult<String> {
        let sig = to_signature(&signature)?;
        Ok(format!("{:?}", self.inner.observe(&sig, fragment, turn)))
    }

    /// Apply delayed feedback. Returns the updated quality.
    pub fn record_outcome(&mut self, signature: Vec<f32>, fragment: &str, satisfaction: f32, current_turn: u64) -> PyResult<f32> {
        let sig = to_signature(&signature)?;
        Ok(self.inner.record_outcome(&sig, fragment, satisfaction, current_turn))
    }

    /// Ranked `(fragment, score, confidence, kind)` tuples. Falls back to `defaults`.
    #[pyo3(signature = (signature, k, current_turn, fuzzy_tolerance=0.1, defaults=Vec::new()))]
    pub fn retrieve(
        &self,
        signature: Vec<f32>,
        k: usize,
        current_turn: u64,
        fuzzy_tolerance: f32,
        defaults: Vec<String>,
    ) -> PyResult<Vec<(String, f32, f32, String)>> {
        let sig = to_signature(&signature)?;
        let query = RetrievalQuery::new(k, current_turn).with_tolerance(fuzzy_tolerance);
        Ok(self
            .inner
            .retrieve(&sig, &query, &defaults)
            .candidates
            .into_iter()
            .map(|c| (c.fragment, c.score, c.confidence, format!("{:?}", c.match_kind)))
            .collect())
    }

    /// Pull stale qualities toward the floor. Returns how many moved.
    pub fn decay_stale(&mut self, current_turn: u64) -> usize {
        self.inner.decay_stale(current_turn)
    }

    /// Number of stored entries.
    pub fn __len__(&self) -> usize {
        self.inner.len()
    }

    /// Python repr string.
    pub fn __repr__(&self) -> String {
        format!(
            "PatternLearner(entries={}, buckets={})",
            self.inner.len(),
            self.inner.bucket_count()
        )
    }
}

// ── CouplingLearner ───────────────────────────────────────────────────────────

/// Symmetric association strengths between named signal sources.
#[pyclass(name = "CouplingLearner")]
pub struct PyCouplingLearner {
    inner: RustCouplingLearner,
}

#[pymethods]
impl PyCouplingLearner {
    /// Create a zero-initialised learner over `sources`.
    #[new]
    #[pyo3(signature = (sources, learning_rate=0.05))]
    pub fn new(sources: Vec<String>, learning_rate: f32) -> PyResult<Self> {
        if !(learning_rate > 0.0 && learning_rate <= 1.0) {
            return Err(PyValueError::new_err(format!(
                "learning_rate must be in (0, 1], got {learning_rate}"
            )));
        }
        let specs: Vec<SourceSpec> = sources.iter().map(|s| SourceSpec::new(s, &[])).collect();
        let config = CouplingConfig {
            learning_rate,
            ..CouplingConfig::default()
        };
        Ok(Self {
            inner: RustCouplingLearner::new(config, &specs).map_err(to_py_err)?,
        })
    }

    /// Apply one cycle of coherences, one per source.
    pub fn observe(&mut self, coherences: Vec<f32>) -> PyResult<()> {
        self.inner.observe_coherences(&coherences).map_err(to_py_err)
    }

    /// Strength between sources `i` and `j`.
    pub fn get(&self, i: usize, j: usize) -> f32 {
        self.inner.get(i, j)
    }

    /// Strength between two sources by name.
    pub fn strength(&self, a: &str, b: &str) -> Option<f32> {
        self.inner.strength(a, b)
    }

    /// Mean off-diagonal strength.
    #[getter]
    pub fn mean_strength(&self) -> f32 {
        self.inner.mean_strength()
    }

    /// Fraction of off-diagonal entries near the ceiling.
    #[getter]
    pub fn saturation(&self) -> f32 {
        self.inner.saturation()
    }

    /// Python repr string.
    pub fn __repr__(&self) -> String {
        format!(
            "CouplingLearner(sources={}, updates={}, mean={:.3})",
            self.inner.matrix().size(),
            self.inner.updates(),
            self.inner.mean_strength()
        )
    }
}

// ── Module ────────────────────────────────────────────────────────────────────

/// Python module entry point.
#[pymodule]
pub fn resonance_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyFamilyClusterer>()?;
    m.add_class::<PyPatternLearner>()?;
    m.add_class::<PyCouplingLearner>()?;
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    m.add("SIGNATURE_DIM", SIGNATURE_DIM)?;
    Ok(())
}
