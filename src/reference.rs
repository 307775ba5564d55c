//! Reference signal sources.
//!
//! Real deployments plug in their own feature extractors. The sources here are
//! small, deterministic stand-ins that show what a production [`SignalSource`]
//! looks like and drive the demos and tests:
//!
//! - [`ScriptedSource`] replays a fixed coherence script, optionally faulting on
//!   chosen cycles.
//! - [`KeywordSource`] scores a turn by keyword hits and settles toward its
//!   target over the cycles of the turn.
//!
//! [`lexical_profile`] builds the lexical auxiliary block from raw text.
//!
//! ```rust
//! use resonance_core::reference::ScriptedSource;
//! use resonance_core::signal::{SignalSource, TurnInput};
//!
//! let mut s = ScriptedSource::scripted("calm", &[0.2, 0.5, 0.8]);
//! let r = s.evaluate(&TurnInput::new(0, ""), 5).unwrap();
//! assert_eq!(r.coherence, 0.8); // last value repeats
//! ```

use crate::signal::{Regime, SignalError, SignalResult, SignalSource, SourceSpec, TurnInput};
use crate::signature::LEXICAL_DIM;

// ─── ScriptedSource ─────────────────────────────────────────────────────────

/// Replays a per-cycle coherence script. The last entry repeats.
///
/// Components: `level` (the coherence itself) and `trend` (change since the
/// previous cycle of the same turn).
#[derive(Clone, Debug)]
pub struct ScriptedSource {
    spec: SourceSpec,
    script: Vec<f32>,
    regimes: Vec<Regime>,
    failing: Vec<usize>,
    previous: Option<f32>,
}

impl ScriptedSource {
    /// Component vocabulary shared by all scripted sources.
    pub const COMPONENTS: [&'static str; 2] = ["level", "trend"];

    /// Source reporting the same coherence every cycle.
    pub fn constant(name: &str, coherence: f32) -> Self {
        Self::scripted(name, &[coherence])
    }

    /// Source replaying `script`, one value per cycle.
    pub fn scripted(name: &str, script: &[f32]) -> Self {
        Self {
            spec: SourceSpec::new(name, &Self::COMPONENTS),
            script: script.to_vec(),
            regimes: Vec::new(),
            failing: Vec::new(),
            previous: None,
        }
    }

    /// Builder: report `regimes[cycle]` (last repeats) on every cycle.
    pub fn with_regimes(mut self, regimes: &[Regime]) -> Self {
        self.regimes = regimes.to_vec();
        self
    }

    /// Builder: fault on the listed cycles.
    pub fn failing_on(mut self, cycles: &[usize]) -> Self {
        self.failing = cycles.to_vec();
        self
    }

    fn at<T: Copy>(values: &[T], cycle: usize) -> Option<T> {
        values.get(cycle.min(values.len().saturating_sub(1))).copied()
    }
}

impl SignalSource for ScriptedSource {
    fn spec(&self) -> &SourceSpec {
        &self.spec
    }

    fn evaluate(&mut self, _input: &TurnInput, cycle: usize) -> Result<SignalResult, SignalError> {
        if self.failing.contains(&cycle) {
            return Err(SignalError::Failed(format!("scripted fault on cycle {cycle}")));
        }
        let coherence = Self::at(&self.script, cycle).unwrap_or(SignalResult::NEUTRAL_COHERENCE);
        let trend = coherence - self.previous.unwrap_or(coherence);
        self.previous = Some(coherence);

        let mut result = SignalResult::new(coherence)
            .with_component("level", coherence)
            .with_component("trend", trend);
        if let Some(regime) = Self::at(&self.regimes, cycle) {
            result = result.with_regime(regime);
        }
        Ok(result)
    }

    fn reset(&mut self) {
        self.previous = None;
    }
}

// ─── KeywordSource ──────────────────────────────────────────────────────────

/// Scores a turn by keyword hits.
///
/// The target coherence is `baseline + gain × hits`, clamped to [0, 1]; a
/// negative gain models a source that drops on its keywords. Over the cycles
/// of a turn the reported coherence settles geometrically from `baseline`
/// toward the target:
///
/// ```text
/// coherence_t = baseline + (target − baseline) × (1 − settle^(t+1))
/// ```
///
/// The regime follows the target: below 0.35 `Withdrawn`, above 0.65
/// `Engaged`, otherwise `Mobilized`.
#[derive(Clone, Debug)]
pub struct KeywordSource {
    spec: SourceSpec,
    keywords: Vec<String>,
    baseline: f32,
    gain: f32,
    settle: f32,
}

impl KeywordSource {
    /// Component vocabulary shared by all keyword sources.
    pub const COMPONENTS: [&'static str; 2] = ["hits", "density"];

    /// Keyword source with settle rate 0.5.
    pub fn new(name: &str, keywords: &[&str], baseline: f32, gain: f32) -> Self {
        Self {
            spec: SourceSpec::new(name, &Self::COMPONENTS),
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            baseline: baseline.clamp(0.0, 1.0),
            gain,
            settle: 0.5,
        }
    }

    /// Builder: geometric settle rate in [0, 1). Lower settles faster.
    pub fn with_settle(mut self, settle: f32) -> Self {
        self.settle = settle.clamp(0.0, 0.99);
        self
    }

    fn count_hits(&self, text: &str) -> (usize, usize) {
        let mut words = 0;
        let mut hits = 0;
        for word in text.split_whitespace() {
            words += 1;
            let w: String = word
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '\'')
                .collect::<String>()
                .to_lowercase();
            if self.keywords.iter().any(|k| *k == w) {
                hits += 1;
            }
        }
        (hits, words)
    }
}

impl SignalSource for KeywordSource {
    fn spec(&self) -> &SourceSpec {
        &self.spec
    }

    fn evaluate(&mut self, input: &TurnInput, cycle: usize) -> Result<SignalResult, SignalError> {
        let (hits, words) = self.count_hits(&input.text);
        let target = (self.baseline + self.gain * hits as f32).clamp(0.0, 1.0);
        let progress = 1.0 - self.settle.powi(cycle as i32 + 1);
        let coherence = (self.baseline + (target - self.baseline) * progress).clamp(0.0, 1.0);
        let density = if words == 0 { 0.0 } else { hits as f32 / words as f32 };

        let regime = if target < 0.35 {
            Regime::Withdrawn
        } else if target > 0.65 {
            Regime::Engaged
        } else {
            Regime::Mobilized
        };

        Ok(SignalResult::new(coherence)
            .with_component("hits", hits as f32)
            .with_component("density", density)
            .with_regime(regime))
    }
}

// ─── lexical profile ────────────────────────────────────────────────────────

/// Raw lexical counts for the auxiliary block of a signature.
///
/// Order: words, sentences, questions, exclamations, first-person pronouns,
/// second-person pronouns, negations, all-caps words.
pub fn lexical_profile(text: &str) -> [f32; LEXICAL_DIM] {
    const FIRST: [&str; 5] = ["i", "me", "my", "mine", "myself"];
    const SECOND: [&str; 4] = ["you", "your", "yours", "yourself"];
    const NEGATIONS: [&str; 6] = ["no", "not", "never", "nothing", "can't", "don't"];

    let mut out = [0.0_f32; LEXICAL_DIM];
    for raw in text.split_whitespace() {
        let word: String = raw
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '\'')
            .collect();
        if word.is_empty() {
            continue;
        }
        out[0] += 1.0;
        let lower = word.to_lowercase();
        if FIRST.contains(&lower.as_str()) {
            out[4] += 1.0;
        }
        if SECOND.contains(&lower.as_str()) {
            out[5] += 1.0;
        }
        if NEGATIONS.contains(&lower.as_str()) {
            out[6] += 1.0;
        }
        if word.len() > 1 && word.chars().all(|c| !c.is_lowercase()) && word.chars().any(char::is_alphabetic) {
            out[7] += 1.0;
        }
    }
    out[1] = text.matches(['.', '!', '?']).count() as f32;
    out[2] = text.matches('?').count() as f32;
    out[3] = text.matches('!').count() as f32;
    out
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_repeats_last_value_and_tracks_trend() {
        let mut s = ScriptedSource::scripted("s", &[0.2, 0.6]);
        let input = TurnInput::new(0, "");
        let r0 = s.evaluate(&input, 0).unwrap();
        let r1 = s.evaluate(&input, 1).unwrap();
        let r2 = s.evaluate(&input, 2).unwrap();
        assert_eq!(r0.component("trend"), Some(0.0));
        assert!((r1.component("trend").unwrap() - 0.4).abs() < 1e-6);
        assert_eq!(r2.coherence, 0.6);
        s.reset();
        assert_eq!(s.evaluate(&input, 0).unwrap().component("trend"), Some(0.0));
    }

    #[test]
    fn test_scripted_regimes_and_faults() {
        let mut s = ScriptedSource::constant("s", 0.5)
            .with_regimes(&[Regime::Mobilized, Regime::Withdrawn])
            .failing_on(&[1]);
        let input = TurnInput::new(0, "");
        assert_eq!(s.evaluate(&input, 0).unwrap().regime, Some(Regime::Mobilized));
        assert!(s.evaluate(&input, 1).is_err());
        assert_eq!(s.evaluate(&input, 4).unwrap().regime, Some(Regime::Withdrawn));
    }

    #[test]
    fn test_keyword_source_settles_toward_target() {
        let mut s = KeywordSource::new("warmth", &["thanks", "great"], 0.3, 0.25);
        let input = TurnInput::new(0, "Thanks, that was great!");
        let c: Vec<f32> = (0..4).map(|i| s.evaluate(&input, i).unwrap().coherence).collect();
        for w in c.windows(2) {
            assert!(w[1] > w[0], "should rise toward target: {:?}", c);
        }
        assert!(c[3] < 0.8 + 1e-6);
        let r = s.evaluate(&input, 0).unwrap();
        assert_eq!(r.component("hits"), Some(2.0));
        assert_eq!(r.regime, Some(Regime::Engaged));
    }

    #[test]
    fn test_keyword_source_negative_gain_withdraws() {
        let mut s = KeywordSource::new("distress", &["alone", "tired"], 0.5, -0.2);
        let r = s.evaluate(&TurnInput::new(0, "so tired and alone"), 3).unwrap();
        assert!(r.coherence < 0.5);
        assert_eq!(r.regime, Some(Regime::Withdrawn));
    }

    #[test]
    fn test_lexical_profile_counts() {
        let p = lexical_profile("I don't know. Do you? NO!");
        assert_eq!(p[0], 6.0); // I don't know Do you NO
        assert_eq!(p[1], 3.0);
        assert_eq!(p[2], 1.0);
        assert_eq!(p[3], 1.0);
        assert_eq!(p[4], 1.0);
        assert_eq!(p[5], 1.0);
        assert_eq!(p[6], 2.0); // don't, no
        assert_eq!(p[7], 1.0); // NO ("I" is a single letter)
    }
}
