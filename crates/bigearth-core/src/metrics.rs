//! Streaming multi-label metrics.
//!
//! The accumulator keeps per-class confusion counts. Derived ratios are only
//! computed in [`MultiLabelMetrics::result`], after counts from every worker
//! have been summed, so the distributed result equals the pooled result.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Number of f64 slots a single class occupies in the flat representation
const SLOTS_PER_CLASS: usize = 4;

/// Confusion counts for a single class
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfusionCounts {
    pub true_positives: u64,
    pub false_positives: u64,
    pub false_negatives: u64,
    pub true_negatives: u64,
}

impl ConfusionCounts {
    pub fn total(&self) -> u64 {
        self.true_positives + self.false_positives + self.false_negatives + self.true_negatives
    }

    pub fn precision(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.true_positives + self.true_negatives, self.total())
    }

    pub fn fscore(&self) -> f64 {
        fscore(self.precision(), self.recall())
    }

    fn add(&mut self, other: &ConfusionCounts) {
        self.true_positives += other.true_positives;
        self.false_positives += other.false_positives;
        self.false_negatives += other.false_negatives;
        self.true_negatives += other.true_negatives;
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn fscore(precision: f64, recall: f64) -> f64 {
    if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    }
}

/// Derived metrics at a point in time
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub micro_precision: f64,
    pub micro_recall: f64,
    pub micro_accuracy: f64,
    pub micro_fscore: f64,
    pub macro_precision: f64,
    pub macro_recall: f64,
    pub macro_accuracy: f64,
    pub macro_fscore: f64,
    /// Number of samples the counts were accumulated over
    pub num_samples: u64,
}

impl MetricsSnapshot {
    /// Named scalar values, in a stable order, for summaries and reports
    pub fn scalars(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("micro_precision", self.micro_precision),
            ("micro_recall", self.micro_recall),
            ("micro_accuracy", self.micro_accuracy),
            ("micro_fscore", self.micro_fscore),
            ("macro_precision", self.macro_precision),
            ("macro_recall", self.macro_recall),
            ("macro_accuracy", self.macro_accuracy),
            ("macro_fscore", self.macro_fscore),
        ]
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "micro P={:.4} R={:.4} Acc={:.4} F={:.4} | macro P={:.4} R={:.4} Acc={:.4} F={:.4}",
            self.micro_precision,
            self.micro_recall,
            self.micro_accuracy,
            self.micro_fscore,
            self.macro_precision,
            self.macro_recall,
            self.macro_accuracy,
            self.macro_fscore,
        )
    }
}

/// Streaming accumulator of per-class confusion counts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiLabelMetrics {
    threshold: f64,
    counts: Vec<ConfusionCounts>,
    num_samples: u64,
}

impl MultiLabelMetrics {
    pub fn new(num_classes: usize, threshold: f64) -> Self {
        Self {
            threshold,
            counts: vec![ConfusionCounts::default(); num_classes],
            num_samples: 0,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.counts.len()
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn num_samples(&self) -> u64 {
        self.num_samples
    }

    pub fn class_counts(&self) -> &[ConfusionCounts] {
        &self.counts
    }

    /// Clears all counts
    pub fn reset(&mut self) {
        self.counts
            .iter_mut()
            .for_each(|c| *c = ConfusionCounts::default());
        self.num_samples = 0;
    }

    /// Accumulates a batch given row-major `[batch, num_classes]` slices.
    ///
    /// `y_true` is a multi-hot vector; `y_pred` holds probabilities which are
    /// positive when `p >= threshold`.
    pub fn update(&mut self, y_true: &[f32], y_pred: &[f32]) -> Result<()> {
        let num_classes = self.num_classes();
        if y_true.len() != y_pred.len() {
            return Err(Error::InvalidArgument(format!(
                "Label and prediction lengths differ: {} vs {}",
                y_true.len(),
                y_pred.len()
            )));
        }
        if num_classes == 0 || y_true.len() % num_classes != 0 {
            return Err(Error::InvalidArgument(format!(
                "Length {} is not a multiple of {} classes",
                y_true.len(),
                num_classes
            )));
        }

        for (truth_row, pred_row) in y_true
            .chunks_exact(num_classes)
            .zip(y_pred.chunks_exact(num_classes))
        {
            for (class, (&truth, &prob)) in truth_row.iter().zip(pred_row).enumerate() {
                let actual = truth >= 0.5;
                let predicted = f64::from(prob) >= self.threshold;
                let counts = &mut self.counts[class];
                match (actual, predicted) {
                    (true, true) => counts.true_positives += 1,
                    (false, true) => counts.false_positives += 1,
                    (true, false) => counts.false_negatives += 1,
                    (false, false) => counts.true_negatives += 1,
                }
            }
            self.num_samples += 1;
        }
        Ok(())
    }

    /// Adds the counts of another accumulator into this one
    pub fn merge(&mut self, other: &MultiLabelMetrics) -> Result<()> {
        if other.num_classes() != self.num_classes() {
            return Err(Error::InvalidArgument(format!(
                "Cannot merge metrics over {} classes into {} classes",
                other.num_classes(),
                self.num_classes()
            )));
        }
        for (mine, theirs) in self.counts.iter_mut().zip(&other.counts) {
            mine.add(theirs);
        }
        self.num_samples += other.num_samples;
        Ok(())
    }

    /// Flattens the counts for a sum all-reduce.
    ///
    /// Layout: `[tp, fp, fn, tn]` per class followed by the sample count.
    /// Counts are exact in f64 up to 2^53.
    pub fn to_flat(&self) -> Vec<f64> {
        let mut flat = Vec::with_capacity(self.num_classes() * SLOTS_PER_CLASS + 1);
        for c in &self.counts {
            flat.push(c.true_positives as f64);
            flat.push(c.false_positives as f64);
            flat.push(c.false_negatives as f64);
            flat.push(c.true_negatives as f64);
        }
        flat.push(self.num_samples as f64);
        flat
    }

    /// Replaces the counts with values produced by [`Self::to_flat`]
    pub fn load_flat(&mut self, flat: &[f64]) -> Result<()> {
        let expected = self.num_classes() * SLOTS_PER_CLASS + 1;
        if flat.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "Expected {} flat metric values, got {}",
                expected,
                flat.len()
            )));
        }
        for (counts, chunk) in self
            .counts
            .iter_mut()
            .zip(flat.chunks_exact(SLOTS_PER_CLASS))
        {
            counts.true_positives = chunk[0].round() as u64;
            counts.false_positives = chunk[1].round() as u64;
            counts.false_negatives = chunk[2].round() as u64;
            counts.true_negatives = chunk[3].round() as u64;
        }
        self.num_samples = flat[expected - 1].round() as u64;
        Ok(())
    }

    /// Derives micro and macro metrics from the accumulated counts
    pub fn result(&self) -> MetricsSnapshot {
        let mut pooled = ConfusionCounts::default();
        for c in &self.counts {
            pooled.add(c);
        }

        let n = self.num_classes();
        let mean = |f: fn(&ConfusionCounts) -> f64| -> f64 {
            if n == 0 {
                0.0
            } else {
                self.counts.iter().map(f).sum::<f64>() / n as f64
            }
        };

        MetricsSnapshot {
            micro_precision: pooled.precision(),
            micro_recall: pooled.recall(),
            micro_accuracy: pooled.accuracy(),
            micro_fscore: pooled.fscore(),
            macro_precision: mean(ConfusionCounts::precision),
            macro_recall: mean(ConfusionCounts::recall),
            macro_accuracy: mean(ConfusionCounts::accuracy),
            macro_fscore: mean(ConfusionCounts::fscore),
            num_samples: self.num_samples,
        }
    }
}

/// Per-epoch values recorded during training
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub learning_rate: f64,
    pub train: Option<MetricsSnapshot>,
    pub validation_loss: Option<f64>,
    pub validation: Option<MetricsSnapshot>,
}

/// Training history tracked during a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochRecord>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: EpochRecord) {
        self.epochs.push(record);
    }

    /// Best validation micro F-score seen so far
    pub fn best_val_fscore(&self) -> Option<f64> {
        self.epochs
            .iter()
            .filter_map(|r| r.validation.map(|m| m.micro_fscore))
            .fold(None, |best, f| match best {
                Some(b) if b >= f => Some(b),
                _ => Some(f),
            })
    }

    /// Epoch with the best validation micro F-score (first one on ties)
    pub fn best_epoch(&self) -> Option<usize> {
        let best = self.best_val_fscore()?;
        self.epochs
            .iter()
            .find(|r| r.validation.map(|m| m.micro_fscore) == Some(best))
            .map(|r| r.epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_all_correct_predictions() {
        let mut metrics = MultiLabelMetrics::new(3, 0.5);
        metrics
            .update(&[1.0, 0.0, 1.0, 0.0, 1.0, 1.0], &[0.9, 0.1, 0.8, 0.2, 0.7, 0.6])
            .unwrap();
        let r = metrics.result();
        assert_eq!(r.num_samples, 2);
        assert_eq!(r.micro_precision, 1.0);
        assert_eq!(r.micro_recall, 1.0);
        assert_eq!(r.micro_fscore, 1.0);
        assert_eq!(r.micro_accuracy, 1.0);
        assert_eq!(r.macro_precision, 1.0);
        assert_eq!(r.macro_recall, 1.0);
        assert_eq!(r.macro_fscore, 1.0);
    }

    #[test]
    fn test_all_wrong_predictions() {
        let mut metrics = MultiLabelMetrics::new(2, 0.5);
        metrics
            .update(&[1.0, 0.0, 0.0, 1.0], &[0.1, 0.9, 0.8, 0.2])
            .unwrap();
        let r = metrics.result();
        assert_eq!(r.micro_precision, 0.0);
        assert_eq!(r.micro_recall, 0.0);
        assert_eq!(r.micro_fscore, 0.0);
        assert_eq!(r.micro_accuracy, 0.0);
        assert_eq!(r.macro_precision, 0.0);
        assert_eq!(r.macro_recall, 0.0);
        assert_eq!(r.macro_fscore, 0.0);
        assert_eq!(r.macro_accuracy, 0.0);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let mut metrics = MultiLabelMetrics::new(1, 0.5);
        metrics.update(&[1.0], &[0.5]).unwrap();
        assert_eq!(metrics.class_counts()[0].true_positives, 1);
    }

    #[test]
    fn test_zero_denominators_contribute_zero() {
        // Class 1 is never present nor predicted: precision and recall are 0/0.
        let mut metrics = MultiLabelMetrics::new(2, 0.5);
        metrics.update(&[1.0, 0.0], &[0.9, 0.1]).unwrap();
        let r = metrics.result();
        assert_eq!(r.micro_fscore, 1.0);
        assert!(approx(r.macro_precision, 0.5));
        assert!(approx(r.macro_recall, 0.5));
        assert!(approx(r.macro_fscore, 0.5));
        assert_eq!(r.macro_accuracy, 1.0);
    }

    #[test]
    fn test_empty_accumulator() {
        let metrics = MultiLabelMetrics::new(4, 0.5);
        let r = metrics.result();
        assert_eq!(r, MetricsSnapshot::default());
    }

    #[test]
    fn test_reset() {
        let mut metrics = MultiLabelMetrics::new(1, 0.5);
        metrics.update(&[1.0], &[0.9]).unwrap();
        metrics.reset();
        assert_eq!(metrics.num_samples(), 0);
        assert_eq!(metrics.class_counts()[0], ConfusionCounts::default());
    }

    #[test]
    fn test_update_rejects_bad_lengths() {
        let mut metrics = MultiLabelMetrics::new(3, 0.5);
        assert!(metrics.update(&[1.0, 0.0], &[1.0, 0.0]).is_err());
        assert!(metrics.update(&[1.0, 0.0, 1.0], &[1.0, 0.0]).is_err());
    }

    #[test]
    fn test_summed_counts_match_pooled_not_averaged_ratios() {
        let truth_a = [1.0, 0.0, 1.0, 1.0, 1.0, 1.0];
        let pred_a = [0.9, 0.1, 0.9, 0.9, 0.9, 0.9];
        let truth_b = [1.0, 1.0, 0.0, 0.0, 1.0, 0.0];
        let pred_b = [0.2, 0.8, 0.7, 0.9, 0.1, 0.4];

        let mut worker_a = MultiLabelMetrics::new(2, 0.5);
        worker_a.update(&truth_a, &pred_a).unwrap();
        let mut worker_b = MultiLabelMetrics::new(2, 0.5);
        worker_b.update(&truth_b, &pred_b).unwrap();

        let mut pooled = MultiLabelMetrics::new(2, 0.5);
        pooled.update(&truth_a, &pred_a).unwrap();
        pooled.update(&truth_b, &pred_b).unwrap();

        // Sum the flat representations as an all-reduce would
        let summed: Vec<f64> = worker_a
            .to_flat()
            .iter()
            .zip(worker_b.to_flat())
            .map(|(a, b)| a + b)
            .collect();
        let mut reduced = MultiLabelMetrics::new(2, 0.5);
        reduced.load_flat(&summed).unwrap();

        assert_eq!(reduced.result(), pooled.result());

        let mut merged = worker_a.clone();
        merged.merge(&worker_b).unwrap();
        assert_eq!(merged.result(), pooled.result());

        let averaged = (worker_a.result().micro_fscore + worker_b.result().micro_fscore) / 2.0;
        assert!(!approx(averaged, pooled.result().micro_fscore));
    }

    #[test]
    fn test_load_flat_rejects_wrong_length() {
        let mut metrics = MultiLabelMetrics::new(2, 0.5);
        assert!(metrics.load_flat(&[0.0; 4]).is_err());
    }

    #[test]
    fn test_training_history_best() {
        let snapshot = |f: f64| MetricsSnapshot {
            micro_fscore: f,
            ..Default::default()
        };
        let record = |epoch, f: Option<f64>| EpochRecord {
            epoch,
            train_loss: 0.5,
            learning_rate: 0.001,
            train: None,
            validation_loss: f.map(|_| 0.4),
            validation: f.map(snapshot),
        };

        let mut history = TrainingHistory::new();
        history.push(record(0, Some(0.3)));
        history.push(record(1, None));
        history.push(record(2, Some(0.6)));
        history.push(record(3, Some(0.6)));

        assert_eq!(history.best_val_fscore(), Some(0.6));
        assert_eq!(history.best_epoch(), Some(2));
    }
}
