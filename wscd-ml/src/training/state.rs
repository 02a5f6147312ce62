//! Training progress owned by the orchestrator.

use serde::{Deserialize, Serialize};

/// Counters and histories of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Optimizer steps taken in this process.
    pub cur_iteration: u64,
    /// Epochs started in this process.
    pub cur_epoch: u64,
    /// Epochs that ran through the whole training set.
    pub epochs_completed: u64,
    pub best_score: f64,
    pub best_epoch: Option<u64>,
    pub no_improve_count: u32,
    /// Mean loss of every print interval.
    pub loss_history: Vec<f64>,
    /// F-score of every validation event.
    pub score_history: Vec<f64>,
    /// Distinct learning rates in first-seen order.
    pub seen_learning_rates: Vec<f64>,
    /// Lowest cumulative loss of a completed epoch.
    pub best_epoch_loss: Option<f64>,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            cur_iteration: 0,
            cur_epoch: 0,
            epochs_completed: 0,
            best_score: 0.0,
            best_epoch: None,
            no_improve_count: 0,
            loss_history: Vec::new(),
            score_history: Vec::new(),
            seen_learning_rates: Vec::new(),
            best_epoch_loss: None,
        }
    }
}

impl TrainingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the next epoch and return its number.
    pub fn begin_epoch(&mut self) -> u64 {
        self.cur_epoch += 1;
        self.cur_epoch
    }

    /// Count one optimizer step and return the new iteration number.
    pub fn record_iteration(&mut self) -> u64 {
        self.cur_iteration += 1;
        self.cur_iteration
    }

    pub fn record_print(&mut self, mean_loss: f64, learning_rate: f64) {
        self.loss_history.push(mean_loss);
        if !self.seen_learning_rates.contains(&learning_rate) {
            self.seen_learning_rates.push(learning_rate);
        }
    }

    /// Score a validation event; returns whether it strictly improved.
    pub fn record_validation(&mut self, f_score: f64) -> bool {
        self.score_history.push(f_score);
        if f_score > self.best_score {
            self.best_score = f_score;
            self.best_epoch = Some(self.cur_epoch);
            self.no_improve_count = 0;
            true
        } else {
            self.no_improve_count += 1;
            false
        }
    }

    pub fn finish_epoch(&mut self, epoch_loss: f64) {
        self.epochs_completed += 1;
        if self.best_epoch_loss.is_none_or(|best| epoch_loss < best) {
            self.best_epoch_loss = Some(epoch_loss);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_strict_improvement_only() {
        let mut state = TrainingState::new();
        state.begin_epoch();
        assert!(!state.record_validation(0.0));
        assert!(state.record_validation(0.5));
        assert!(!state.record_validation(0.5));
        assert!(!state.record_validation(0.4));
        assert_eq!(state.best_score, 0.5);
        assert_eq!(state.no_improve_count, 2);
        assert!(state.record_validation(0.6));
        assert_eq!(state.no_improve_count, 0);
        assert_eq!(state.score_history, vec![0.0, 0.5, 0.5, 0.4, 0.6]);
        assert_eq!(state.best_epoch, Some(1));
    }

    #[test]
    fn test_learning_rates_keep_first_seen_order() {
        let mut state = TrainingState::new();
        state.record_print(1.0, 0.1);
        state.record_print(0.9, 0.05);
        state.record_print(0.8, 0.1);
        assert_eq!(state.seen_learning_rates, vec![0.1, 0.05]);
        assert_eq!(state.loss_history, vec![1.0, 0.9, 0.8]);
    }

    #[test]
    fn test_best_epoch_loss_tracks_minimum() {
        let mut state = TrainingState::new();
        state.finish_epoch(3.0);
        state.finish_epoch(4.0);
        state.finish_epoch(2.5);
        assert_eq!(state.best_epoch_loss, Some(2.5));
        assert_eq!(state.epochs_completed, 3);
    }
}
