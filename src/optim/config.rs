//! # AdamW Configuration

use super::OptimError;
use serde::{Deserialize, Serialize};

/// Hyperparameters of the AdamW optimizer.
///
/// Defaults: `lr = 1e-3`, `betas = (0.9, 0.999)`, `eps = 1e-6`,
/// `weight_decay = 0`, bias correction and gradient surgery enabled.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdamWConfig {
    /// Learning rate.
    pub lr: f64,
    /// Decay rates of the first and second moment estimates.
    pub betas: (f64, f64),
    /// Added to the denominator for numerical stability.
    pub eps: f64,
    /// Decoupled weight decay, applied after the gradient step.
    pub weight_decay: f64,
    /// Scale the step size by `sqrt(1 - beta2^t) / (1 - beta1^t)`.
    pub correct_bias: bool,
    /// Run the pairwise conflict-resolution pass before the update.
    pub gradient_surgery: bool,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        AdamWConfig {
            lr: 1e-3,
            betas: (0.9, 0.999),
            eps: 1e-6,
            weight_decay: 0.0,
            correct_bias: true,
            gradient_surgery: true,
        }
    }
}

fn invalid(name: &'static str, value: f64, reason: &'static str) -> OptimError {
    OptimError::InvalidHyperparameter {
        name,
        value,
        reason,
    }
}

impl AdamWConfig {
    /// Creates a configuration with the given learning rate and default values
    /// for everything else.
    ///
    /// # Arguments
    /// * `lr`: Learning rate, also scales the weight decay (default: 1e-3).
    ///
    /// Other fields: `betas` (0.9, 0.999), `eps` 1e-6, `weight_decay` 0,
    /// `correct_bias` true, `gradient_surgery` true. Values are checked when an
    /// optimizer is built, see [`AdamWConfig::validate`].
    pub fn new(lr: f64) -> Self {
        AdamWConfig {
            lr,
            ..Default::default()
        }
    }

    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    pub fn with_betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.betas = (beta1, beta2);
        self
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn with_correct_bias(mut self, correct_bias: bool) -> Self {
        self.correct_bias = correct_bias;
        self
    }

    pub fn with_gradient_surgery(mut self, gradient_surgery: bool) -> Self {
        self.gradient_surgery = gradient_surgery;
        self
    }

    /// Checks every hyperparameter. NaN fails every check.
    pub fn validate(&self) -> Result<(), OptimError> {
        if !(0.0 <= self.lr) {
            return Err(invalid("learning rate", self.lr, "should be >= 0.0"));
        }
        if !(0.0 <= self.betas.0 && self.betas.0 < 1.0) {
            return Err(invalid("beta1", self.betas.0, "should be in [0.0, 1.0)"));
        }
        if !(0.0 <= self.betas.1 && self.betas.1 < 1.0) {
            return Err(invalid("beta2", self.betas.1, "should be in [0.0, 1.0)"));
        }
        if !(0.0 <= self.eps) {
            return Err(invalid("epsilon", self.eps, "should be >= 0.0"));
        }
        if !(0.0 <= self.weight_decay) {
            return Err(invalid("weight_decay", self.weight_decay, "should be >= 0.0"));
        }
        Ok(())
    }
}

/// Per-group overrides. Unset fields fall back to the optimizer defaults.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamGroupOptions {
    pub lr: Option<f64>,
    pub betas: Option<(f64, f64)>,
    pub eps: Option<f64>,
    pub weight_decay: Option<f64>,
    pub correct_bias: Option<bool>,
    pub gradient_surgery: Option<bool>,
}

impl ParamGroupOptions {
    /// Applies the overrides on top of `defaults` and validates the result.
    pub fn resolve(&self, defaults: &AdamWConfig) -> Result<AdamWConfig, OptimError> {
        let config = AdamWConfig {
            lr: self.lr.unwrap_or(defaults.lr),
            betas: self.betas.unwrap_or(defaults.betas),
            eps: self.eps.unwrap_or(defaults.eps),
            weight_decay: self.weight_decay.unwrap_or(defaults.weight_decay),
            correct_bias: self.correct_bias.unwrap_or(defaults.correct_bias),
            gradient_surgery: self.gradient_surgery.unwrap_or(defaults.gradient_surgery),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AdamWConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.eps, 1e-6);
        assert!(config.correct_bias && config.gradient_surgery);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let cases = [
            AdamWConfig::new(-1e-3),
            AdamWConfig::default().with_betas(1.0, 0.999),
            AdamWConfig::default().with_betas(0.9, -0.1),
            AdamWConfig::default().with_eps(-1.0),
            AdamWConfig::default().with_weight_decay(-0.01),
            AdamWConfig::new(f64::NAN),
        ];
        for config in cases {
            assert!(
                matches!(
                    config.validate(),
                    Err(OptimError::InvalidHyperparameter { .. })
                ),
                "{:?} should be rejected",
                config
            );
        }
    }

    #[test]
    fn zero_lr_and_zero_betas_are_allowed() {
        let config = AdamWConfig::new(0.0).with_betas(0.0, 0.0).with_eps(0.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn group_options_override_only_set_fields() {
        let defaults = AdamWConfig::default().with_weight_decay(0.01);
        let options = ParamGroupOptions {
            lr: Some(0.5),
            gradient_surgery: Some(false),
            ..Default::default()
        };
        let resolved = options.resolve(&defaults).unwrap();
        assert_eq!(resolved.lr, 0.5);
        assert_eq!(resolved.weight_decay, 0.01);
        assert!(!resolved.gradient_surgery);
    }

    #[test]
    fn group_options_are_validated() {
        let options = ParamGroupOptions {
            betas: Some((0.9, 1.5)),
            ..Default::default()
        };
        assert!(options.resolve(&AdamWConfig::default()).is_err());
    }
}
