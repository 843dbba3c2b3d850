//! Multi-label binary cross-entropy on logits with label smoothing.
//!
//! Every class is an independent binary problem, so smoothing pulls each
//! target towards 0.5: `t = y * (1 - s) + s / 2`. The loss per element is
//! `(1 - t) * x - log_sigmoid(x)`, averaged over batch and classes.

use burn::tensor::{activation, backend::Backend, Int, Tensor};

#[derive(Debug, Clone, Copy, Default)]
pub struct SmoothedBceWithLogits {
    smoothing: f64,
}

impl SmoothedBceWithLogits {
    pub fn new(smoothing: f64) -> Self {
        Self { smoothing }
    }

    pub fn smoothing(&self) -> f64 {
        self.smoothing
    }

    /// Mean loss over `[batch, num_classes]` logits and multi-hot targets
    pub fn forward<B: Backend>(&self, logits: Tensor<B, 2>, targets: Tensor<B, 2, Int>) -> Tensor<B, 1> {
        let targets = self.smooth(targets.float());
        let loss = targets.neg().add_scalar(1.0).mul(logits.clone()) - activation::log_sigmoid(logits);
        loss.mean()
    }

    fn smooth<B: Backend>(&self, targets: Tensor<B, 2>) -> Tensor<B, 2> {
        if self.smoothing == 0.0 {
            return targets;
        }
        targets
            .mul_scalar(1.0 - self.smoothing)
            .add_scalar(self.smoothing / 2.0)
    }
}
