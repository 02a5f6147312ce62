//! Learning-rate policies advanced once per completed epoch.

use crate::error::{Result, TrainError};
use serde::{Deserialize, Serialize};
use wscd_core::{LrPolicyKind, TrainConfig};

/// Default exponent of polynomial decay.
pub const POLY_POWER: f64 = 0.9;
/// Multiplicative factor of step decay.
pub const STEP_GAMMA: f64 = 0.5;

/// Common interface of the interchangeable policies.
pub trait LearningRatePolicy {
    /// Move one step (one epoch) forward.
    fn advance(&mut self);

    fn current_rate(&self) -> f64;

    fn state(&self) -> SchedulerState;

    /// Adopt the progress recorded in `state`. Rate limits stay those of the
    /// current configuration so a resumed run can extend its budget.
    fn restore(&mut self, state: &SchedulerState) -> Result<()>;
}

/// Serialized scheduler progress stored in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum SchedulerState {
    Poly {
        t: u64,
        base_rate: f64,
        max_iters: u64,
        power: f64,
        min_rate: f64,
    },
    Step {
        epoch: u64,
        base_rate: f64,
        step_size: u64,
        gamma: f64,
    },
}

/// `rate(t) = base_rate * (1 - t / max_iters)^power`, floored at `min_rate`.
#[derive(Debug, Clone, PartialEq)]
pub struct PolyLr {
    base_rate: f64,
    max_iters: u64,
    power: f64,
    min_rate: f64,
    t: u64,
}

impl PolyLr {
    pub fn new(base_rate: f64, max_iters: u64, power: f64, min_rate: f64) -> Self {
        Self {
            base_rate,
            max_iters,
            power,
            min_rate,
            t: 0,
        }
    }

    pub fn t(&self) -> u64 {
        self.t
    }
}

impl LearningRatePolicy for PolyLr {
    fn advance(&mut self) {
        self.t = (self.t + 1).min(self.max_iters);
    }

    fn current_rate(&self) -> f64 {
        if self.max_iters == 0 {
            return self.base_rate.max(self.min_rate);
        }
        let progress = self.t.min(self.max_iters) as f64 / self.max_iters as f64;
        (self.base_rate * (1.0 - progress).powf(self.power)).max(self.min_rate)
    }

    fn state(&self) -> SchedulerState {
        SchedulerState::Poly {
            t: self.t,
            base_rate: self.base_rate,
            max_iters: self.max_iters,
            power: self.power,
            min_rate: self.min_rate,
        }
    }

    fn restore(&mut self, state: &SchedulerState) -> Result<()> {
        match state {
            SchedulerState::Poly { t, .. } => {
                self.t = (*t).min(self.max_iters);
                Ok(())
            }
            other => Err(mismatch("poly", other)),
        }
    }
}

/// `rate = base_rate * gamma^(epoch / step_size)`.
#[derive(Debug, Clone, PartialEq)]
pub struct StepLr {
    base_rate: f64,
    step_size: u64,
    gamma: f64,
    epoch: u64,
}

impl StepLr {
    pub fn new(base_rate: f64, step_size: u64, gamma: f64) -> Self {
        Self {
            base_rate,
            step_size,
            gamma,
            epoch: 0,
        }
    }
}

impl LearningRatePolicy for StepLr {
    fn advance(&mut self) {
        self.epoch += 1;
    }

    fn current_rate(&self) -> f64 {
        if self.step_size == 0 {
            return self.base_rate;
        }
        let decays = (self.epoch / self.step_size).min(i32::MAX as u64) as i32;
        self.base_rate * self.gamma.powi(decays)
    }

    fn state(&self) -> SchedulerState {
        SchedulerState::Step {
            epoch: self.epoch,
            base_rate: self.base_rate,
            step_size: self.step_size,
            gamma: self.gamma,
        }
    }

    fn restore(&mut self, state: &SchedulerState) -> Result<()> {
        match state {
            SchedulerState::Step { epoch, .. } => {
                self.epoch = *epoch;
                Ok(())
            }
            other => Err(mismatch("step", other)),
        }
    }
}

fn mismatch(expected: &str, found: &SchedulerState) -> TrainError {
    let found = match found {
        SchedulerState::Poly { .. } => "poly",
        SchedulerState::Step { .. } => "step",
    };
    TrainError::checkpoint(format!(
        "scheduler state is for the '{found}' policy, run is configured with '{expected}'"
    ))
}

/// The configured policy.
#[derive(Debug, Clone, PartialEq)]
pub enum LrPolicy {
    Poly(PolyLr),
    Step(StepLr),
}

impl LrPolicy {
    pub fn from_config(config: &TrainConfig) -> Self {
        match config.lr_policy {
            LrPolicyKind::Poly => Self::Poly(PolyLr::new(
                config.lr,
                config.total_itrs as u64,
                POLY_POWER,
                config.min_lr,
            )),
            LrPolicyKind::Step => {
                Self::Step(StepLr::new(config.lr, config.step_size as u64, STEP_GAMMA))
            }
        }
    }

    fn inner(&self) -> &dyn LearningRatePolicy {
        match self {
            Self::Poly(p) => p,
            Self::Step(s) => s,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn LearningRatePolicy {
        match self {
            Self::Poly(p) => p,
            Self::Step(s) => s,
        }
    }
}

impl LearningRatePolicy for LrPolicy {
    fn advance(&mut self) {
        self.inner_mut().advance();
    }

    fn current_rate(&self) -> f64 {
        self.inner().current_rate()
    }

    fn state(&self) -> SchedulerState {
        self.inner().state()
    }

    fn restore(&mut self, state: &SchedulerState) -> Result<()> {
        self.inner_mut().restore(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_poly_starts_at_base_rate() {
        let p = PolyLr::new(0.01, 100, POLY_POWER, 0.0);
        assert!((p.current_rate() - 0.01).abs() < 1e-15);
    }

    #[test]
    fn test_poly_formula() {
        let mut p = PolyLr::new(0.01, 10, POLY_POWER, 0.0);
        for _ in 0..4 {
            p.advance();
        }
        let expected = 0.01 * (1.0f64 - 0.4).powf(0.9);
        assert!((p.current_rate() - expected).abs() < 1e-15);
    }

    #[test]
    fn test_poly_floors_and_clamps() {
        let mut p = PolyLr::new(0.01, 3, POLY_POWER, 1e-6);
        for _ in 0..10 {
            p.advance();
        }
        assert_eq!(p.t(), 3);
        assert_eq!(p.current_rate(), 1e-6);
    }

    #[test]
    fn test_step_halves_every_step_size() {
        let mut s = StepLr::new(0.08, 2, STEP_GAMMA);
        let mut rates = vec![s.current_rate()];
        for _ in 0..4 {
            s.advance();
            rates.push(s.current_rate());
        }
        assert_eq!(rates, vec![0.08, 0.08, 0.04, 0.04, 0.02]);
    }

    #[test]
    fn test_restore_keeps_current_limits() {
        let mut old = PolyLr::new(0.1, 10, POLY_POWER, 0.0);
        for _ in 0..5 {
            old.advance();
        }
        let mut resumed = PolyLr::new(0.2, 100, POLY_POWER, 0.0);
        resumed.restore(&old.state()).unwrap();
        assert_eq!(resumed.t(), 5);
        let expected = 0.2 * (1.0f64 - 0.05).powf(0.9);
        assert!((resumed.current_rate() - expected).abs() < 1e-15);
    }

    #[test]
    fn test_restore_rejects_other_policy() {
        let step = StepLr::new(0.1, 1, STEP_GAMMA);
        let mut poly = LrPolicy::Poly(PolyLr::new(0.1, 10, POLY_POWER, 0.0));
        assert!(matches!(
            poly.restore(&step.state()),
            Err(TrainError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_state_serializes_with_policy_tag() {
        let json = serde_json::to_value(StepLr::new(0.1, 3, STEP_GAMMA).state()).unwrap();
        assert_eq!(json["policy"], "step");
        assert_eq!(json["step_size"], 3);
    }

    #[test]
    fn test_from_config_selects_policy() {
        let mut config = TrainConfig::default();
        config.lr_policy = LrPolicyKind::Step;
        assert!(matches!(LrPolicy::from_config(&config), LrPolicy::Step(_)));
        config.lr_policy = LrPolicyKind::Poly;
        let policy = LrPolicy::from_config(&config);
        assert!((policy.current_rate() - config.lr).abs() < 1e-15);
    }
}
