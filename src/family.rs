/*
 * This source code is licensed under the Business Source License 1.1.
 * See LICENSE in the root directory for full details.
 */

//! Self-discovered behavioural families in signature space.
//!
//! A [`FamilyClusterer`] keeps a growing list of unit-norm centroids. Each new
//! signature joins the most similar family when that similarity clears the
//! adaptive threshold, and founds a new family otherwise.
//!
//! # Adaptive threshold
//!
//! ```text
//! threshold(n) = min(max_threshold, base_threshold + threshold_step × ⌊n / families_per_step⌋)
//! ```
//!
//! With the defaults the threshold starts at 0.55, rises by 0.05 every four
//! families and stops at 0.75. It is monotone non-decreasing in the family count:
//! permissive early so a base taxonomy can differentiate, stricter later so
//! families do not proliferate.
//!
//! # Collapse
//!
//! A corpus of near-duplicate signatures saturates every similarity toward 1.0
//! and folds everything into one family. That is the clustering contract
//! working as specified; diversity has to come from upstream. The clusterer
//! does not special-case it away. It reports it through
//! [`ClusterDiagnostics`] and reacts per the configured [`CollapsePolicy`].
//!
//! # Invariants
//!
//! - Every centroid has unit L2 norm after every update.
//! - Families are never deleted; member history per family is capped at
//!   [`MAX_TRACKED_MEMBERS`] turn ids, oldest evicted first.

use heapless::Deque;
use tracing::{debug, warn};

use crate::signature::{normalize, TransformationSignature, SIGNATURE_DIM};

/// Identifier of a family, unique within one clusterer.
pub type FamilyId = u32;

/// Most recent member turn ids retained per family.
pub const MAX_TRACKED_MEMBERS: usize = 64;

// ─── Config ─────────────────────────────────────────────────────────────────

/// What the clusterer does when one family absorbs nearly all input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CollapsePolicy {
    /// Expose the diagnostic only.
    Observe,
    /// Log a warning when collapse begins.
    Warn,
    /// Log, and stop moving the dominant family's centroid while collapsed.
    Reject,
}

/// Clustering parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ClusterConfig {
    /// Threshold with no families. Default: 0.55.
    pub base_threshold: f32,
    /// Ceiling the threshold never exceeds. Default: 0.75.
    pub max_threshold: f32,
    /// Increment per step. Default: 0.05.
    pub threshold_step: f32,
    /// Families per step. Default: 4.
    pub families_per_step: usize,
    /// Share of all members held by one family that counts as collapse. Default: 0.9.
    pub collapse_share: f32,
    /// Assignments required before collapse is judged. Default: 20.
    pub collapse_min_assignments: u64,
    /// Reaction to collapse. Default: [`CollapsePolicy::Warn`].
    pub collapse_policy: CollapsePolicy,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            base_threshold: 0.55,
            max_threshold: 0.75,
            threshold_step: 0.05,
            families_per_step: 4,
            collapse_share: 0.9,
            collapse_min_assignments: 20,
            collapse_policy: CollapsePolicy::Warn,
        }
    }
}

impl ClusterConfig {
    /// Similarity threshold in force when `family_count` families exist.
    pub fn threshold_for(&self, family_count: usize) -> f32 {
        let steps = family_count / self.families_per_step.max(1);
        (self.base_threshold + self.threshold_step * steps as f32).min(self.max_threshold)
    }
}

// ─── Family ─────────────────────────────────────────────────────────────────

/// One cluster of signatures.
#[derive(Clone, Debug)]
pub struct Family {
    /// Stable identifier.
    pub id: FamilyId,
    /// Display name, `family-NNN`.
    pub name: String,
    /// Unit-norm running mean of member signatures.
    pub centroid: [f32; SIGNATURE_DIM],
    /// Signatures assigned since creation.
    pub member_count: u64,
    /// Outcome observations folded into `mean_outcome`.
    pub outcome_count: u64,
    /// Running mean of outcome quality in [0, 1].
    pub mean_outcome: f32,
    /// Most recent member turn ids, oldest first.
    pub recent_members: Deque<u64, MAX_TRACKED_MEMBERS>,
    /// Turn that founded the family.
    pub created_turn: u64,
    /// Turn of the most recent assignment.
    pub last_turn: u64,
}

impl Family {
    fn found(id: FamilyId, signature: &TransformationSignature, turn_id: u64) -> Self {
        let mut family = Self {
            id,
            name: format!("family-{id:03}"),
            centroid: *signature.values(),
            member_count: 1,
            outcome_count: 0,
            mean_outcome: 0.0,
            recent_members: Deque::new(),
            created_turn: turn_id,
            last_turn: turn_id,
        };
        family.remember(turn_id);
        family
    }

    /// `centroid ← normalize((centroid × n + signature) / (n + 1))`
    fn absorb(&mut self, signature: &TransformationSignature, turn_id: u64) {
        let n = self.member_count as f32;
        let mut next = self.centroid;
        for (c, s) in next.iter_mut().zip(signature.values()) {
            *c = (*c * n + s) / (n + 1.0);
        }
        if normalize(&mut next) {
            self.centroid = next;
        }
        self.member_count = self.member_count.saturating_add(1);
        self.last_turn = turn_id;
        self.remember(turn_id);
    }

    fn remember(&mut self, turn_id: u64) {
        if self.recent_members.is_full() {
            self.recent_members.pop_front();
        }
        // Capacity was just ensured.
        let _ = self.recent_members.push_back(turn_id);
    }

    /// Fold one outcome observation into the running mean. Non-finite values are ignored.
    pub fn record_outcome(&mut self, quality: f32) {
        if !quality.is_finite() {
            return;
        }
        let q = quality.clamp(0.0, 1.0);
        self.outcome_count = self.outcome_count.saturating_add(1);
        self.mean_outcome += (q - self.mean_outcome) / self.outcome_count as f32;
    }
}

// ─── Assignment ─────────────────────────────────────────────────────────────

/// What an assignment did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AssignmentKind {
    /// Joined an existing family; its centroid moved.
    Joined,
    /// Founded a new family.
    Founded,
    /// Matched the dominant family during collapse under [`CollapsePolicy::Reject`]; nothing moved.
    Rejected,
    /// Degenerate signature; not clustered.
    Skipped,
}

/// Result of [`FamilyClusterer::assign`].
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Assignment {
    /// Family the signature belongs to (`None` only for [`AssignmentKind::Skipped`]).
    pub family_id: Option<FamilyId>,
    /// Similarity to that family's centroid before the update (1.0 when founded).
    pub similarity: f32,
    /// Threshold in force for this assignment.
    pub threshold: f32,
    /// What happened.
    pub kind: AssignmentKind,
}

/// Observable clustering health.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClusterDiagnostics {
    /// Families discovered.
    pub family_count: usize,
    /// Signatures clustered (joined or founded).
    pub total_assignments: u64,
    /// Largest family's share of all members, in [0, 1].
    pub max_family_share: f32,
    /// Whether the collapse condition currently holds.
    pub collapsed: bool,
    /// Threshold that the next assignment would use.
    pub threshold: f32,
}

// ─── FamilyClusterer ────────────────────────────────────────────────────────

/// Online clusterer over transformation signatures.
#[derive(Clone, Debug)]
pub struct FamilyClusterer {
    config: ClusterConfig,
    families: Vec<Family>,
    next_id: FamilyId,
    total_assignments: u64,
    collapsed: bool,
}

impl FamilyClusterer {
    /// Empty clusterer.
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            families: Vec::new(),
            next_id: 0,
            total_assignments: 0,
            collapsed: false,
        }
    }

    /// Rebuild from persisted parts.
    pub(crate) fn from_parts(config: ClusterConfig, families: Vec<Family>, total_assignments: u64) -> Self {
        let next_id = families.iter().map(|f| f.id + 1).max().unwrap_or(0);
        let mut clusterer = Self {
            config,
            families,
            next_id,
            total_assignments,
            collapsed: false,
        };
        clusterer.collapsed = clusterer.diagnostics().collapsed;
        clusterer
    }

    /// Current parameters.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Threshold the next assignment will use.
    pub fn threshold(&self) -> f32 {
        self.config.threshold_for(self.families.len())
    }

    /// All families, in creation order.
    pub fn families(&self) -> &[Family] {
        &self.families
    }

    /// Look up a family by id.
    pub fn family(&self, id: FamilyId) -> Option<&Family> {
        self.families.iter().find(|f| f.id == id)
    }

    /// Number of families.
    pub fn len(&self) -> usize {
        self.families.len()
    }

    /// Whether no family exists yet.
    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    /// Signatures clustered so far.
    pub fn total_assignments(&self) -> u64 {
        self.total_assignments
    }

    /// Best-matching family and its similarity, without mutating anything.
    ///
    /// Ties resolve to the oldest family. `None` when no family exists or the
    /// signature is degenerate.
    pub fn query(&self, signature: &TransformationSignature) -> Option<(FamilyId, f32)> {
        if signature.is_degenerate() {
            return None;
        }
        self.best_match(signature)
            .map(|(idx, sim)| (self.families[idx].id, sim))
    }

    /// Assign `signature` (observed on `turn_id`) to a family.
    ///
    /// `outcome_quality`, when known, is folded into the family's running mean.
    ///
    /// Every call returns an [`Assignment`], but an all-zero signature has no
    /// direction to compare: it gets `family_id: None` with
    /// [`AssignmentKind::Skipped`] and leaves every family untouched. Callers
    /// that need an id must handle that case. The extractor only produces one
    /// when every block is zero, which the regime block rules out.
    pub fn assign(
        &mut self,
        signature: &TransformationSignature,
        turn_id: u64,
        outcome_quality: Option<f32>,
    ) -> Assignment {
        let threshold = self.threshold();
        if signature.is_degenerate() {
            debug!(turn = turn_id, "degenerate signature not clustered");
            return Assignment {
                family_id: None,
                similarity: 0.0,
                threshold,
                kind: AssignmentKind::Skipped,
            };
        }

        let assignment = match self.best_match(signature) {
            Some((idx, similarity)) if similarity >= threshold => {
                let id = self.families[idx].id;
                if self.collapsed
                    && self.config.collapse_policy == CollapsePolicy::Reject
                    && self.dominant_index() == Some(idx)
                {
                    debug!(turn = turn_id, family = id, similarity, "collapsed family update rejected");
                    return Assignment {
                        family_id: Some(id),
                        similarity,
                        threshold,
                        kind: AssignmentKind::Rejected,
                    };
                }
                self.families[idx].absorb(signature, turn_id);
                if let Some(q) = outcome_quality {
                    self.families[idx].record_outcome(q);
                }
                Assignment {
                    family_id: Some(id),
                    similarity,
                    threshold,
                    kind: AssignmentKind::Joined,
                }
            }
            best => {
                let id = self.next_id;
                self.next_id = self.next_id.saturating_add(1);
                let mut family = Family::found(id, signature, turn_id);
                if let Some(q) = outcome_quality {
                    family.record_outcome(q);
                }
                debug!(
                    turn = turn_id,
                    family = id,
                    nearest = best.map(|(_, s)| s),
                    threshold,
                    "new family"
                );
                self.families.push(family);
                Assignment {
                    family_id: Some(id),
                    similarity: 1.0,
                    threshold,
                    kind: AssignmentKind::Founded,
                }
            }
        };

        self.total_assignments = self.total_assignments.saturating_add(1);
        self.refresh_collapse();
        assignment
    }

    /// Fold a delayed outcome into a family's running mean. Returns `false` if the id is unknown.
    pub fn record_outcome(&mut self, id: FamilyId, quality: f32) -> bool {
        match self.families.iter_mut().find(|f| f.id == id) {
            Some(family) => {
                family.record_outcome(quality);
                true
            }
            None => false,
        }
    }

    /// Current clustering health.
    pub fn diagnostics(&self) -> ClusterDiagnostics {
        let members: u64 = self.families.iter().map(|f| f.member_count).sum();
        let largest = self.families.iter().map(|f| f.member_count).max().unwrap_or(0);
        let share = if members == 0 {
            0.0
        } else {
            largest as f32 / members as f32
        };
        ClusterDiagnostics {
            family_count: self.families.len(),
            total_assignments: self.total_assignments,
            max_family_share: share,
            collapsed: self.total_assignments >= self.config.collapse_min_assignments
                && share >= self.config.collapse_share,
            threshold: self.threshold(),
        }
    }

    // ── internal ───────────────────────────────────────────────────────────

    fn best_match(&self, signature: &TransformationSignature) -> Option<(usize, f32)> {
        let mut best: Option<(usize, f32)> = None;
        for (idx, family) in self.families.iter().enumerate() {
            let sim = signature.similarity_to(&family.centroid);
            if best.map_or(true, |(_, b)| sim > b) {
                best = Some((idx, sim));
            }
        }
        best
    }

    fn dominant_index(&self) -> Option<usize> {
        let mut best: Option<(usize, u64)> = None;
        for (idx, family) in self.families.iter().enumerate() {
            if best.map_or(true, |(_, c)| family.member_count > c) {
                best = Some((idx, family.member_count));
            }
        }
        best.map(|(idx, _)| idx)
    }

    fn refresh_collapse(&mut self) {
        let diag = self.diagnostics();
        if diag.collapsed && !self.collapsed {
            match self.config.collapse_policy {
                CollapsePolicy::Observe => debug!(
                    families = diag.family_count,
                    share = diag.max_family_share,
                    "clustering collapsed into one dominant family"
                ),
                CollapsePolicy::Warn | CollapsePolicy::Reject => warn!(
                    families = diag.family_count,
                    share = diag.max_family_share,
                    assignments = diag.total_assignments,
                    "clustering collapsed into one dominant family; input signatures lack diversity"
                ),
            }
        } else if !diag.collapsed && self.collapsed {
            debug!(families = diag.family_count, share = diag.max_family_share, "clustering recovered from collapse");
        }
        self.collapsed = diag.collapsed;
    }
}

impl Default for FamilyClusterer {
    fn default() -> Self {
        Self::new(ClusterConfig::default())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::l2_norm;

    fn basis(i: usize) -> TransformationSignature {
        let mut raw = [0.0; SIGNATURE_DIM];
        raw[i] = 1.0;
        TransformationSignature::from_raw(raw)
    }

    /// Unit vector `cos θ · e_i + sin θ · e_j` with similarity `cos θ` to `e_i`.
    fn tilted(i: usize, j: usize, cos: f32) -> TransformationSignature {
        let mut raw = [0.0; SIGNATURE_DIM];
        raw[i] = cos;
        raw[j] = (1.0 - cos * cos).sqrt();
        TransformationSignature::from_raw(raw)
    }

    #[test]
    fn test_threshold_is_monotone_non_decreasing() {
        let cfg = ClusterConfig::default();
        let mut prev = cfg.threshold_for(0);
        assert!((prev - 0.55).abs() < 1e-6);
        for n in 1..200 {
            let t = cfg.threshold_for(n);
            assert!(t >= prev, "threshold dropped at n={n}: {prev} → {t}");
            assert!(t <= cfg.max_threshold + 1e-6);
            prev = t;
        }
        assert!((cfg.threshold_for(1000) - 0.75).abs() < 1e-6);
        assert!((cfg.threshold_for(4) - 0.60).abs() < 1e-6);
    }

    #[test]
    fn test_first_signature_founds_family() {
        let mut c = FamilyClusterer::default();
        let a = c.assign(&basis(0), 1, None);
        assert_eq!(a.kind, AssignmentKind::Founded);
        assert_eq!(a.family_id, Some(0));
        assert_eq!(c.family(0).unwrap().name, "family-000");
    }

    #[test]
    fn test_assignment_is_idempotent_for_repeated_signature() {
        let mut c = FamilyClusterer::default();
        c.assign(&basis(0), 1, None);
        c.assign(&basis(5), 2, None);
        let s = tilted(0, 5, 0.8);
        let first = c.assign(&s, 3, None);
        let second = c.assign(&s, 4, None);
        assert_eq!(first.family_id, second.family_id);
        assert!(second.similarity >= first.similarity);
    }

    #[test]
    fn test_dissimilar_signature_founds_new_family() {
        let mut c = FamilyClusterer::default();
        c.assign(&basis(0), 1, None);
        let a = c.assign(&basis(1), 2, None);
        assert_eq!(a.kind, AssignmentKind::Founded);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_similar_signature_joins_and_centroid_stays_unit() {
        let mut c = FamilyClusterer::default();
        c.assign(&basis(0), 1, None);
        let a = c.assign(&tilted(0, 1, 0.9), 2, None);
        assert_eq!(a.kind, AssignmentKind::Joined);
        assert!((a.similarity - 0.9).abs() < 1e-5);
        let fam = c.family(0).unwrap();
        assert_eq!(fam.member_count, 2);
        assert!((l2_norm(&fam.centroid) - 1.0).abs() < 1e-5);
        // running mean of e0 and (0.9, 0.436): centroid leans toward e0
        assert!(fam.centroid[0] > fam.centroid[1]);
    }

    #[test]
    fn test_threshold_tightens_as_families_grow() {
        let mut c = FamilyClusterer::default();
        for i in 0..4 {
            c.assign(&basis(i), i as u64, None);
        }
        assert!((c.threshold() - 0.60).abs() < 1e-6);
        // similarity 0.58 to e0 would have joined at 0.55 but not at 0.60
        let a = c.assign(&tilted(0, 10, 0.58), 10, None);
        assert_eq!(a.kind, AssignmentKind::Founded);
    }

    #[test]
    fn test_member_history_is_capped() {
        let mut c = FamilyClusterer::default();
        for turn in 0..(MAX_TRACKED_MEMBERS as u64 + 10) {
            c.assign(&basis(0), turn, None);
        }
        let fam = c.family(0).unwrap();
        assert_eq!(fam.member_count, MAX_TRACKED_MEMBERS as u64 + 10);
        assert_eq!(fam.recent_members.len(), MAX_TRACKED_MEMBERS);
        assert_eq!(fam.recent_members.front().copied(), Some(10));
    }

    #[test]
    fn test_outcomes_fold_into_running_mean() {
        let mut c = FamilyClusterer::default();
        c.assign(&basis(0), 1, Some(1.0));
        assert!(c.record_outcome(0, 0.5));
        assert!(!c.record_outcome(42, 0.5));
        let fam = c.family(0).unwrap();
        assert_eq!(fam.outcome_count, 2);
        assert!((fam.mean_outcome - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_query_does_not_mutate() {
        let mut c = FamilyClusterer::default();
        assert_eq!(c.query(&basis(0)), None);
        c.assign(&basis(0), 1, None);
        let before = c.family(0).unwrap().member_count;
        let (id, sim) = c.query(&tilted(0, 2, 0.7)).unwrap();
        assert_eq!(id, 0);
        assert!((sim - 0.7).abs() < 1e-5);
        assert_eq!(c.family(0).unwrap().member_count, before);
    }

    #[test]
    fn test_degenerate_signature_is_skipped() {
        let mut c = FamilyClusterer::default();
        let zero = TransformationSignature::from_raw([0.0; SIGNATURE_DIM]);
        let a = c.assign(&zero, 1, None);
        assert_eq!(a.kind, AssignmentKind::Skipped);
        assert_eq!(a.family_id, None);
        assert!(c.is_empty());
        assert_eq!(c.total_assignments(), 0);
    }

    #[test]
    fn test_near_duplicates_collapse_and_are_reported() {
        let mut c = FamilyClusterer::default();
        for turn in 0..30 {
            let s = tilted(0, 1, 1.0 - turn as f32 * 1e-4);
            c.assign(&s, turn, None);
        }
        let d = c.diagnostics();
        assert_eq!(d.family_count, 1);
        assert_eq!(d.max_family_share, 1.0);
        assert!(d.collapsed);
    }

    #[test]
    fn test_reject_policy_freezes_dominant_centroid() {
        let mut c = FamilyClusterer::new(ClusterConfig {
            collapse_policy: CollapsePolicy::Reject,
            collapse_min_assignments: 5,
            ..ClusterConfig::default()
        });
        for turn in 0..5 {
            c.assign(&basis(0), turn, None);
        }
        assert!(c.diagnostics().collapsed);
        let before = c.family(0).unwrap().centroid;
        let a = c.assign(&tilted(0, 1, 0.9), 6, None);
        assert_eq!(a.kind, AssignmentKind::Rejected);
        assert_eq!(a.family_id, Some(0));
        assert_eq!(c.family(0).unwrap().centroid, before);
        // a genuinely different signature still founds a family
        let b = c.assign(&basis(7), 7, None);
        assert_eq!(b.kind, AssignmentKind::Founded);
    }

    #[test]
    fn test_from_parts_continues_ids() {
        let mut c = FamilyClusterer::default();
        c.assign(&basis(0), 1, None);
        c.assign(&basis(1), 2, None);
        let mut restored = FamilyClusterer::from_parts(ClusterConfig::default(), c.families().to_vec(), 2);
        let a = restored.assign(&basis(2), 3, None);
        assert_eq!(a.family_id, Some(2));
    }
}
