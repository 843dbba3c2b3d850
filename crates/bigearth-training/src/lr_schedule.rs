//! Learning rate scheduling.
//!
//! Step decay applied at the start of an epoch: at epoch `e > 0` with
//! `e % step_size == 0` the rate is multiplied by `gamma`. The base rate is
//! linearly scaled by the number of workers.

/// Base learning rate scaled linearly with the worker count
pub fn linear_scaled_lr(base_lr: f64, num_workers: usize) -> f64 {
    base_lr * num_workers.max(1) as f64
}

/// Step decay: multiply LR by gamma every step_size epochs
#[derive(Debug, Clone)]
pub struct LearningRateScheduler {
    step_size: usize,
    gamma: f64,
    current_lr: f64,
}

impl LearningRateScheduler {
    /// A `step_size` of zero keeps the rate constant
    pub fn step_decay(initial_lr: f64, step_size: usize, gamma: f64) -> Self {
        Self {
            step_size,
            gamma,
            current_lr: initial_lr,
        }
    }

    /// Get the current learning rate
    pub fn get_lr(&self) -> f64 {
        self.current_lr
    }

    /// Call at the start of every epoch; returns the rate for that epoch
    pub fn on_epoch_start(&mut self, epoch: usize) -> f64 {
        if epoch > 0 && self.step_size > 0 && epoch % self.step_size == 0 {
            self.current_lr *= self.gamma;
        }
        self.current_lr
    }
}
