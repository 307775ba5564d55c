/*
 * This source code is licensed under the Business Source License 1.1.
 * See LICENSE in the root directory for full details.
 */

//! Quality-weighted response fragments keyed by signature neighbourhood.
//!
//! A signature is discretised per dimension (`cell = round(x / resolution)`)
//! and the cells are hashed with FNV-1a into a bucket key. A bucket holds every
//! fragment observed under that neighbourhood, each with a learned quality.
//!
//! # Retrieval
//!
//! The exact bucket is preferred. When it holds fewer than `k` entries, buckets
//! whose cells lie within `fuzzy_tolerance` (Chebyshev distance in signature
//! units) fill the remainder at a discount. Candidates rank by
//!
//! ```text
//! score = quality_weight × quality + recency_weight × 0.5^(turn_gap / half_life_turns)
//! ```
//!
//! With no match at all the caller's default fragments are returned.
//!
//! # Lifecycle
//!
//! ```text
//! Unseen ──observe──► Observed ──record_outcome──► Reinforced
//!                        │                              │
//!                        └──── no use for stale_after ──┴──► Stale
//! ```
//!
//! Entries are never deleted. Stale entries are recency-discounted and
//! [`PatternLearner::decay_stale`] pulls their quality toward a floor.
//!
//! # Invariants
//!
//! - Quality stays in [0, 1].
//! - Lookups never compare raw floats for equality; only integer cells.

use hashbrown::HashMap;
use rand::Rng;
use tracing::{debug, warn};

use crate::signature::TransformationSignature;

// ─── Config ─────────────────────────────────────────────────────────────────

/// Pattern learner parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PatternConfig {
    /// EMA rate for outcome updates. Default: 0.2.
    pub alpha: f32,
    /// Quality of a freshly observed fragment. Default: 0.5.
    pub initial_quality: f32,
    /// Discretisation step per dimension. Default: 0.1.
    pub resolution: f32,
    /// Turns for the recency term to halve. Default: 50.
    pub half_life_turns: u64,
    /// Turns without use after which an entry is stale. Default: 200.
    pub stale_after_turns: u64,
    /// Quality that stale decay approaches. Default: 0.1.
    pub quality_floor: f32,
    /// Fraction of the distance to the floor removed per decay pass. Default: 0.1.
    pub decay_rate: f32,
    /// Weight of learned quality in the ranking score. Default: 0.7.
    pub quality_weight: f32,
    /// Weight of recency in the ranking score. Default: 0.3.
    pub recency_weight: f32,
    /// Score multiplier for fuzzy matches. Default: 0.8.
    pub fuzzy_discount: f32,
    /// Softmax temperature for [`select`]. Default: 0.1.
    pub temperature: f32,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            alpha: 0.2,
            initial_quality: 0.5,
            resolution: 0.1,
            half_life_turns: 50,
            stale_after_turns: 200,
            quality_floor: 0.1,
            decay_rate: 0.1,
            quality_weight: 0.7,
            recency_weight: 0.3,
            fuzzy_discount: 0.8,
            temperature: 0.1,
        }
    }
}

impl PatternConfig {
    /// Recency term for a turn gap, in (0, 1].
    pub fn recency(&self, turn_gap: u64) -> f32 {
        if self.half_life_turns == 0 {
            return if turn_gap == 0 { 1.0 } else { 0.0 };
        }
        0.5_f32.powf(turn_gap as f32 / self.half_life_turns as f32)
    }
}

// ─── Entries ────────────────────────────────────────────────────────────────

/// Lifecycle of one (neighbourhood, fragment) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PatternState {
    /// Never observed.
    Unseen,
    /// Observed; quality still at its initial value.
    Observed,
    /// Quality updated by feedback at least once.
    Reinforced,
    /// Unused for at least `stale_after_turns`.
    Stale,
}

/// One fragment under one neighbourhood.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PatternEntry {
    /// The output fragment.
    pub fragment: String,
    /// Learned quality in [0, 1].
    pub quality: f32,
    /// Turn of first observation.
    pub first_seen_turn: u64,
    /// Turn of most recent use or feedback.
    pub last_used_turn: u64,
    /// Times observed.
    pub use_count: u32,
    /// Feedback updates applied.
    pub feedback_count: u32,
}

/// All fragments stored under one discretised signature.
#[derive(Clone, Debug, PartialEq)]
pub struct PatternBucket {
    /// Discretised signature.
    pub cells: Vec<i8>,
    /// Fragments, in first-seen order.
    pub entries: Vec<PatternEntry>,
}

// ─── Retrieval ──────────────────────────────────────────────────────────────

/// How a candidate was found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MatchKind {
    /// Same discretised signature.
    Exact,
    /// Neighbouring discretised signature within tolerance.
    Fuzzy,
    /// Caller-supplied default.
    Default,
}

/// A ranked fragment.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Candidate {
    /// The fragment.
    pub fragment: String,
    /// Learned quality (initial quality for defaults).
    pub quality: f32,
    /// Ranking score.
    pub score: f32,
    /// Quality scaled by match strength; 0.0 for defaults.
    pub confidence: f32,
    /// How it matched.
    pub match_kind: MatchKind,
}

/// Parameters of one retrieval.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetrievalQuery {
    /// Maximum candidates (at least one is always considered).
    pub k: usize,
    /// Turn the recency term is measured against.
    pub current_turn: u64,
    /// Maximum per-dimension distance for fuzzy matches, in signature units.
    pub fuzzy_tolerance: f32,
}

impl RetrievalQuery {
    /// Query for `k` candidates at `current_turn` with a tolerance of 0.1.
    pub fn new(k: usize, current_turn: u64) -> Self {
        Self {
            k,
            current_turn,
            fuzzy_tolerance: 0.1,
        }
    }

    /// Builder: fuzzy tolerance.
    pub fn with_tolerance(mut self, tolerance: f32) -> Self {
        self.fuzzy_tolerance = tolerance;
        self
    }
}

/// Where a retrieval's candidates came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RetrievalSource {
    /// Exact bucket only.
    Exact,
    /// At least one fuzzy neighbour contributed.
    Fuzzy,
    /// Nothing matched; caller defaults.
    Default,
}

/// Ranked candidates, best first.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Retrieval {
    /// Candidates, best first.
    pub candidates: Vec<Candidate>,
    /// Where they came from.
    pub source: RetrievalSource,
}

impl Retrieval {
    /// Highest-ranked candidate.
    pub fn best(&self) -> Option<&Candidate> {
        self.candidates.first()
    }
}

// ─── PatternLearner ─────────────────────────────────────────────────────────

/// Fragment store with online quality learning.
#[derive(Clone, Debug)]
pub struct PatternLearner {
    config: PatternConfig,
    buckets: HashMap<u64, Vec<PatternBucket>>,
    entry_count: usize,
}

impl PatternLearner {
    /// Empty store.
    pub fn new(config: PatternConfig) -> Self {
        Self {
            config,
            buckets: HashMap::new(),
            entry_count: 0,
        }
    }

    /// Rebuild from persisted buckets.
    pub(crate) fn from_buckets(config: PatternConfig, buckets: Vec<PatternBucket>) -> Self {
        let mut learner = Self::new(config);
        for bucket in buckets {
            learner.entry_count += bucket.entries.len();
            let key = bucket_key(&bucket.cells);
            learner.buckets.entry(key).or_default().push(bucket);
        }
        learner
    }

    /// Current parameters.
    pub fn config(&self) -> &PatternConfig {
        &self.config
    }

    /// Total entries across all buckets.
    pub fn len(&self) -> usize {
        self.entry_count
    }

    /// Whether nothing has been observed.
    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Number of distinct neighbourhoods.
    pub fn bucket_count(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    /// Every bucket, in unspecified order.
    pub fn buckets(&self) -> impl Iterator<Item = &PatternBucket> {
        self.buckets.values().flatten()
    }

    /// Discretise a signature into integer cells.
    pub fn cells(&self, signature: &TransformationSignature) -> Vec<i8> {
        let res = if self.config.resolution > 0.0 {
            self.config.resolution
        } else {
            PatternConfig::default().resolution
        };
        signature
            .as_slice()
            .iter()
            .map(|x| (x / res).round().clamp(i8::MIN as f32, i8::MAX as f32) as i8)
            .collect()
    }

    /// Entry for a fragment under a signature's exact neighbourhood.
    pub fn entry(&self, signature: &TransformationSignature, fragment: &str) -> Option<&PatternEntry> {
        let cells = self.cells(signature);
        self.bucket(&cells)?.entries.iter().find(|e| e.fragment == fragment)
    }

    /// Record that `fragment` was used for `signature` on `turn`.
    ///
    /// Creates the entry at `initial_quality` on first observation.
    pub fn observe(&mut self, signature: &TransformationSignature, fragment: &str, turn: u64) -> PatternState {
        let entry = self.entry_mut_or_insert(signature, fragment, turn);
        entry.use_count = entry.use_count.saturating_add(1);
        entry.last_used_turn = entry.last_used_turn.max(turn);
        if entry.feedback_count > 0 {
            PatternState::Reinforced
        } else {
            PatternState::Observed
        }
    }

    /// Apply delayed feedback: `quality ← quality + α × (satisfaction − quality)`.
    ///
    /// Returns the updated quality. A non-finite satisfaction is ignored.
    pub fn record_outcome(
        &mut self,
        signature: &TransformationSignature,
        fragment: &str,
        satisfaction: f32,
        current_turn: u64,
    ) -> f32 {
        if !satisfaction.is_finite() {
            warn!(fragment, turn = current_turn, "non-finite satisfaction ignored");
            return self
                .entry(signature, fragment)
                .map_or(self.config.initial_quality, |e| e.quality);
        }
        let alpha = self.config.alpha;
        let s = satisfaction.clamp(0.0, 1.0);
        let entry = self.entry_mut_or_insert(signature, fragment, current_turn);
        entry.quality = (entry.quality + alpha * (s - entry.quality)).clamp(0.0, 1.0);
        entry.feedback_count = entry.feedback_count.saturating_add(1);
        entry.last_used_turn = entry.last_used_turn.max(current_turn);
        debug!(fragment, satisfaction = s, quality = entry.quality, "pattern quality updated");
        entry.quality
    }

    /// Ranked candidates for `signature`. Falls back to `defaults`, never errors.
    pub fn retrieve(&self, signature: &TransformationSignature, query: &RetrievalQuery, defaults: &[String]) -> Retrieval {
        let k = query.k.max(1);
        let cells = self.cells(signature);
        let mut candidates: Vec<Candidate> = Vec::new();

        if let Some(bucket) = self.bucket(&cells) {
            for entry in &bucket.entries {
                candidates.push(self.candidate(entry, query.current_turn, MatchKind::Exact, 1.0));
            }
        }

        let mut used_fuzzy = false;
        if candidates.len() < k && query.fuzzy_tolerance.is_finite() && query.fuzzy_tolerance >= 0.0 {
            let max_steps = (query.fuzzy_tolerance / self.config.resolution.max(f32::EPSILON) + 1e-4).floor() as i32;
            for bucket in self.buckets.values().flatten() {
                if bucket.cells == cells || chebyshev(&bucket.cells, &cells) > max_steps {
                    continue;
                }
                for entry in &bucket.entries {
                    let c = self.candidate(entry, query.current_turn, MatchKind::Fuzzy, self.config.fuzzy_discount);
                    match candidates.iter_mut().find(|x| x.fragment == c.fragment) {
                        Some(existing) if existing.score >= c.score => {}
                        Some(existing) => *existing = c,
                        None => candidates.push(c),
                    }
                    used_fuzzy = true;
                }
            }
        }

        if candidates.is_empty() {
            let score = self.config.quality_weight * self.config.initial_quality;
            return Retrieval {
                candidates: defaults
                    .iter()
                    .take(k)
                    .map(|f| Candidate {
                        fragment: f.clone(),
                        quality: self.config.initial_quality,
                        score,
                        confidence: 0.0,
                        match_kind: MatchKind::Default,
                    })
                    .collect(),
                source: RetrievalSource::Default,
            };
        }

        candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.fragment.cmp(&b.fragment)));
        candidates.truncate(k);
        let source = if used_fuzzy && candidates.iter().any(|c| c.match_kind == MatchKind::Fuzzy) {
            RetrievalSource::Fuzzy
        } else {
            RetrievalSource::Exact
        };
        Retrieval { candidates, source }
    }

    /// Lifecycle state of `fragment` under `signature` at `current_turn`.
    pub fn state(&self, signature: &TransformationSignature, fragment: &str, current_turn: u64) -> PatternState {
        match self.entry(signature, fragment) {
            None => PatternState::Unseen,
            Some(e) if current_turn.saturating_sub(e.last_used_turn) >= self.config.stale_after_turns => {
                PatternState::Stale
            }
            Some(e) if e.feedback_count > 0 => PatternState::Reinforced,
            Some(_) => PatternState::Observed,
        }
    }

    /// Pull every stale entry's quality toward `quality_floor`. Returns how many moved.
    pub fn decay_stale(&mut self, current_turn: u64) -> usize {
        let floor = self.config.quality_floor;
        let rate = self.config.decay_rate.clamp(0.0, 1.0);
        let stale_after = self.config.stale_after_turns;
        let mut moved = 0;
        for entry in self.buckets.values_mut().flatten().flat_map(|b| b.entries.iter_mut()) {
            if current_turn.saturating_sub(entry.last_used_turn) < stale_after || entry.quality <= floor {
                continue;
            }
            entry.quality = (floor + (entry.quality - floor) * (1.0 - rate)).clamp(0.0, 1.0);
            moved += 1;
        }
        if moved > 0 {
            debug!(moved, turn = current_turn, "stale patterns decayed");
        }
        moved
    }

    // ── internal ───────────────────────────────────────────────────────────

    fn candidate(&self, entry: &PatternEntry, current_turn: u64, kind: MatchKind, strength: f32) -> Candidate {
        let recency = self.config.recency(current_turn.saturating_sub(entry.last_used_turn));
        let score = strength * (self.config.quality_weight * entry.quality + self.config.recency_weight * recency);
        Candidate {
            fragment: entry.fragment.clone(),
            quality: entry.quality,
            score,
            confidence: (strength * entry.quality).clamp(0.0, 1.0),
            match_kind: kind,
        }
    }

    fn bucket(&self, cells: &[i8]) -> Option<&PatternBucket> {
        self.buckets
            .get(&bucket_key(cells))?
            .iter()
            .find(|b| b.cells == cells)
    }

    fn entry_mut_or_insert(&mut self, signature: &TransformationSignature, fragment: &str, turn: u64) -> &mut PatternEntry {
        let cells = self.cells(signature);
        let initial = self.config.initial_quality.clamp(0.0, 1.0);
        let chain = self.buckets.entry(bucket_key(&cells)).or_default();
        let b = match chain.iter().position(|b| b.cells == cells) {
            Some(b) => b,
            None => {
                chain.push(PatternBucket {
                    cells,
                    entries: Vec::new(),
                });
                chain.len() - 1
            }
        };
        let bucket = &mut chain[b];
        let e = match bucket.entries.iter().position(|e| e.fragment == fragment) {
            Some(e) => e,
            None => {
                bucket.entries.push(PatternEntry {
                    fragment: fragment.to_string(),
                    quality: initial,
                    first_seen_turn: turn,
                    last_used_turn: turn,
                    use_count: 0,
                    feedback_count: 0,
                });
                self.entry_count += 1;
                bucket.entries.len() - 1
            }
        };
        &mut bucket.entries[e]
    }
}

impl Default for PatternLearner {
    fn default() -> Self {
        Self::new(PatternConfig::default())
    }
}

/// Sample one candidate with probability `softmax(quality / temperature)`.
///
/// A non-positive temperature picks the highest-scoring candidate. `None` only
/// for an empty slice.
pub fn select<'a, R: Rng>(candidates: &'a [Candidate], temperature: f32, rng: &mut R) -> Option<&'a Candidate> {
    if candidates.is_empty() {
        return None;
    }
    if !(temperature > 0.0) {
        return candidates.iter().max_by(|a, b| a.score.total_cmp(&b.score));
    }
    let max_q = candidates.iter().map(|c| c.quality).fold(f32::NEG_INFINITY, f32::max);
    let weights: Vec<f32> = candidates
        .iter()
        .map(|c| ((c.quality - max_q) / temperature).exp())
        .collect();
    let total: f32 = weights.iter().sum();
    let mut draw = rng.gen::<f32>() * total;
    for (candidate, w) in candidates.iter().zip(&weights) {
        if draw < *w {
            return Some(candidate);
        }
        draw -= w;
    }
    candidates.last()
}

/// 64-bit FNV-1a over the cell bytes.
fn bucket_key(cells: &[i8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for &c in cells {
        hash ^= c as u8 as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

fn chebyshev(a: &[i8], b: &[i8]) -> i32 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| (x as i32 - y as i32).abs())
        .max()
        .unwrap_or(0)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
