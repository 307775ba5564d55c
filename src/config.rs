//! Aggregate engine configuration.
//!
//! Each component owns its parameter struct with documented defaults;
//! [`EngineConfig`] bundles them and checks cross-field constraints once, at
//! construction time, so the components themselves can assume sane values.

use crate::convergence::ConvergenceConfig;
use crate::coupling::{CouplingConfig, CouplingInit};
use crate::error::{EngineError, EngineResult};
use crate::family::ClusterConfig;
use crate::pattern::PatternConfig;

/// All engine parameters.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EngineConfig {
    /// Convergence loop.
    pub convergence: ConvergenceConfig,
    /// Family clusterer.
    pub clustering: ClusterConfig,
    /// Coupling learner.
    pub coupling: CouplingConfig,
    /// Pattern learner.
    pub patterns: PatternConfig,
}

fn unit(name: &str, value: f32) -> EngineResult<()> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(EngineError::Config(format!("{name} must be in [0, 1], got {value}")));
    }
    Ok(())
}

fn open_unit(name: &str, value: f32) -> EngineResult<()> {
    if !value.is_finite() || value <= 0.0 || value > 1.0 {
        return Err(EngineError::Config(format!("{name} must be in (0, 1], got {value}")));
    }
    Ok(())
}

impl EngineConfig {
    /// Parse from JSON. Missing fields take their defaults. The result is validated.
    #[cfg(feature = "serde")]
    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every parameter.
    pub fn validate(&self) -> EngineResult<()> {
        let c = &self.convergence;
        if c.max_cycles < 1 {
            return Err(EngineError::Config(format!(
                "max_cycles must be >= 1, got {}",
                c.max_cycles
            )));
        }
        if !c.convergence_threshold.is_finite() || c.convergence_threshold < 0.0 {
            return Err(EngineError::Config(format!(
                "convergence_threshold must be >= 0, got {}",
                c.convergence_threshold
            )));
        }
        unit("satisfaction_target", c.satisfaction_target)?;
        if !c.initial_energy.is_finite() || c.initial_energy <= 0.0 {
            return Err(EngineError::Config(format!(
                "initial_energy must be > 0, got {}",
                c.initial_energy
            )));
        }
        open_unit("energy_step", c.energy_step)?;
        open_unit("satisfaction_rate", c.satisfaction_rate)?;
        let [lo, hi] = c.kairos_window;
        unit("kairos_window[0]", lo)?;
        unit("kairos_window[1]", hi)?;
        if lo > hi {
            return Err(EngineError::Config(format!(
                "kairos_window must be ordered, got [{lo}, {hi}]"
            )));
        }
        if c.max_consecutive_faults < 1 {
            return Err(EngineError::Config(
                "max_consecutive_faults must be >= 1".to_string(),
            ));
        }

        let k = &self.clustering;
        unit("base_threshold", k.base_threshold)?;
        unit("max_threshold", k.max_threshold)?;
        if k.max_threshold < k.base_threshold {
            return Err(EngineError::Config(format!(
                "max_threshold {} below base_threshold {}",
                k.max_threshold, k.base_threshold
            )));
        }
        if !k.threshold_step.is_finite() || k.threshold_step < 0.0 {
            return Err(EngineError::Config(format!(
                "threshold_step must be >= 0, got {}",
                k.threshold_step
            )));
        }
        if k.families_per_step < 1 {
            return Err(EngineError::Config(
                "families_per_step must be >= 1".to_string(),
            ));
        }
        open_unit("collapse_share", k.collapse_share)?;

        let cp = &self.coupling;
        open_unit("coupling learning_rate", cp.learning_rate)?;
        if let CouplingInit::SemanticPrior { weight } = cp.init {
            unit("semantic prior weight", weight)?;
        }

        let p = &self.patterns;
        open_unit("pattern alpha", p.alpha)?;
        unit("initial_quality", p.initial_quality)?;
        unit("quality_floor", p.quality_floor)?;
        unit("decay_rate", p.decay_rate)?;
        unit("fuzzy_discount", p.fuzzy_discount)?;
        if !p.resolution.is_finite() || p.resolution <= 0.0 || p.resolution > 1.0 {
            return Err(EngineError::Config(format!(
                "resolution must be in (0, 1], got {}",
                p.resolution
            )));
        }
        unit("quality_weight", p.quality_weight)?;
        unit("recency_weight", p.recency_weight)?;
        if (p.quality_weight + p.recency_weight - 1.0).abs() > 1e-6 {
            return Err(EngineError::Config(format!(
                "quality_weight + recency_weight must equal 1.0, got {} + {}",
                p.quality_weight, p.recency_weight
            )));
        }
        if p.half_life_turns == 0 {
            return Err(EngineError::Config(
                "half_life_turns must be >= 1".to_string(),
            ));
        }
        if !p.temperature.is_finite() || p.temperature < 0.0 {
            return Err(EngineError::Config(format!(
                "temperature must be >= 0, got {}",
                p.temperature
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_cycles() {
        let mut c = EngineConfig::default();
        c.convergence.max_cycles = 0;
        assert!(matches!(c.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_rejects_inverted_kairos_window() {
        let mut c = EngineConfig::default();
        c.convergence.kairos_window = [0.6, 0.4];
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_rejects_threshold_ceiling_below_base() {
        let mut c = EngineConfig::default();
        c.clustering.max_threshold = 0.5;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_rejects_unbalanced_ranking_weights() {
        let mut c = EngineConfig::default();
        c.patterns.quality_weight = 0.9;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_learning_rate() {
        let mut c = EngineConfig::default();
        c.coupling.learning_rate = 0.0;
        assert!(c.validate().is_err());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_from_json_fills_defaults() {
        let c = EngineConfig::from_json_str(r#"{"convergence": {"max_cycles": 8}}"#).unwrap();
        assert_eq!(c.convergence.max_cycles, 8);
        assert_eq!(c.clustering, ClusterConfig::default());

        let bad = EngineConfig::from_json_str(r#"{"patterns": {"alpha": 2.0}}"#);
        assert!(matches!(bad, Err(EngineError::Config(_))));
    }
}
