//! Epoch-boundary early stopping on the no-improvement counter.

use super::state::TrainingState;
use wscd_core::EarlyStopReset;

/// Validation events without improvement tolerated before stopping.
pub const EARLY_STOP_PATIENCE: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EarlyStopping {
    patience: u32,
    reset: EarlyStopReset,
}

impl EarlyStopping {
    pub fn new(patience: u32, reset: EarlyStopReset) -> Self {
        Self { patience, reset }
    }

    pub fn patience(&self) -> u32 {
        self.patience
    }

    /// Decide at an epoch boundary. Stops iff the counter exceeds the patience.
    ///
    /// With [`EarlyStopReset::Always`] the counter is cleared first, so the
    /// run only ends on its iteration budget.
    pub fn on_epoch_end(&self, state: &mut TrainingState) -> StopDecision {
        if self.reset == EarlyStopReset::Always {
            state.no_improve_count = 0;
        }
        if state.no_improve_count > self.patience {
            StopDecision::Stop
        } else {
            StopDecision::Continue
        }
    }
}

impl Default for EarlyStopping {
    fn default() -> Self {
        Self::new(EARLY_STOP_PATIENCE, EarlyStopReset::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(count: u32) -> TrainingState {
        TrainingState {
            no_improve_count: count,
            ..TrainingState::default()
        }
    }

    #[test]
    fn test_fires_only_above_patience() {
        let stopper = EarlyStopping::default();
        assert_eq!(stopper.on_epoch_end(&mut state_with(20)), StopDecision::Continue);
        assert_eq!(stopper.on_epoch_end(&mut state_with(21)), StopDecision::Stop);
    }

    #[test]
    fn test_on_improvement_keeps_counter() {
        let stopper = EarlyStopping::new(20, EarlyStopReset::OnImprovement);
        let mut state = state_with(7);
        stopper.on_epoch_end(&mut state);
        assert_eq!(state.no_improve_count, 7);
    }

    #[test]
    fn test_always_reset_never_fires() {
        let stopper = EarlyStopping::new(20, EarlyStopReset::Always);
        let mut state = state_with(100);
        assert_eq!(stopper.on_epoch_end(&mut state), StopDecision::Continue);
        assert_eq!(state.no_improve_count, 0);
    }
}
