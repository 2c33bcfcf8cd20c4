use super::MetricError;
use burn::tensor::{backend::Backend, Int, Tensor};
use std::fmt::{self, Display};

/// Square table counting how often each true class was predicted as each class.
///
/// Rows are indexed by the true class, columns by the predicted class. The matrix is
/// created empty at the beginning of an epoch and only grows through
/// [accumulate](ConfusionMatrix::accumulate), so its total always equals the number of
/// label values seen so far.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfusionMatrix {
    num_classes: usize,
    counts: Vec<u64>,
}

/// Accuracy of every class along with their mean.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassAccuracy {
    /// Arithmetic mean of the per-class values.
    pub mean: f64,
    /// Accuracy of each true class, ordered by class index.
    pub per_class: Vec<f64>,
}

impl ConfusionMatrix {
    /// Creates a matrix of `num_classes` x `num_classes` zeros.
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            counts: vec![0; num_classes * num_classes],
        }
    }

    /// Builds a matrix from its rows.
    ///
    /// # Errors
    ///
    /// Fails with [MetricError::ClassCountMismatch] when a row length differs from the
    /// number of rows.
    pub fn from_rows<R: AsRef<[u64]>>(rows: &[R]) -> Result<Self, MetricError> {
        let num_classes = rows.len();
        let mut counts = Vec::with_capacity(num_classes * num_classes);

        for row in rows {
            let row = row.as_ref();
            if row.len() != num_classes {
                return Err(MetricError::ClassCountMismatch {
                    expected: num_classes,
                    found: row.len(),
                });
            }
            counts.extend_from_slice(row);
        }

        Ok(Self {
            num_classes,
            counts,
        })
    }

    /// The number of classes, which is also the side length of the matrix.
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Count of values with true class `target` predicted as `prediction`.
    ///
    /// # Panics
    ///
    /// If either index is not lower than [num_classes](Self::num_classes).
    pub fn get(&self, target: usize, prediction: usize) -> u64 {
        assert!(
            target < self.num_classes && prediction < self.num_classes,
            "Cell ({target}, {prediction}) is outside of a {n}x{n} confusion matrix",
            n = self.num_classes
        );
        self.counts[target * self.num_classes + prediction]
    }

    /// All predictions made for values of the true class `target`.
    pub fn row(&self, target: usize) -> &[u64] {
        let start = target * self.num_classes;
        &self.counts[start..start + self.num_classes]
    }

    /// Sum of the column of the predicted class `prediction`.
    pub fn column_sum(&self, prediction: usize) -> u64 {
        (0..self.num_classes)
            .map(|target| self.get(target, prediction))
            .sum()
    }

    /// Total number of label values accumulated.
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Number of values whose prediction matches their true class.
    pub fn correct(&self) -> u64 {
        (0..self.num_classes).map(|class| self.get(class, class)).sum()
    }

    /// Adds the counts of a batch of labels to the matrix.
    ///
    /// Every label must lie in `[0, num_classes)`. Labels are validated before anything is
    /// counted, so the matrix is left untouched when an error is returned.
    ///
    /// # Errors
    ///
    /// * [MetricError::ShapeMismatch] when both slices differ in length.
    /// * [MetricError::OutOfRangeLabel] when a label is negative or not lower than the
    ///   number of classes.
    pub fn accumulate(&mut self, targets: &[i64], predictions: &[i64]) -> Result<(), MetricError> {
        if targets.len() != predictions.len() {
            return Err(MetricError::ShapeMismatch {
                targets: vec![targets.len()],
                predictions: vec![predictions.len()],
            });
        }

        if let Some(&label) = targets
            .iter()
            .chain(predictions.iter())
            .find(|&&label| !self.contains(label))
        {
            return Err(MetricError::OutOfRangeLabel {
                label,
                num_classes: self.num_classes,
            });
        }

        for (&target, &prediction) in targets.iter().zip(predictions) {
            self.counts[target as usize * self.num_classes + prediction as usize] += 1;
        }

        Ok(())
    }

    /// Same as [accumulate](Self::accumulate), reading labels from integer tensors.
    ///
    /// Both tensors are flattened after checking that their shapes are equal, so any
    /// layout works as long as targets and predictions agree, e.g. `[batch, points]`.
    pub fn accumulate_tensors<B: Backend, const D: usize>(
        &mut self,
        targets: Tensor<B, D, Int>,
        predictions: Tensor<B, D, Int>,
    ) -> Result<(), MetricError> {
        let target_dims = targets.dims();
        let prediction_dims = predictions.dims();

        if target_dims != prediction_dims {
            return Err(MetricError::ShapeMismatch {
                targets: target_dims.to_vec(),
                predictions: prediction_dims.to_vec(),
            });
        }

        let targets = labels_from_tensor(targets)?;
        let predictions = labels_from_tensor(predictions)?;

        self.accumulate(&targets, &predictions)
    }

    /// Adds the counts of another matrix, e.g. one collected on another device.
    pub fn merge(&mut self, other: &ConfusionMatrix) -> Result<(), MetricError> {
        if other.num_classes != self.num_classes {
            return Err(MetricError::ClassCountMismatch {
                expected: self.num_classes,
                found: other.num_classes,
            });
        }

        self.counts
            .iter_mut()
            .zip(other.counts.iter())
            .for_each(|(count, other)| *count += other);

        Ok(())
    }

    /// Fraction of all predictions matching their true class.
    ///
    /// Returns `0.0` while nothing has been accumulated.
    pub fn overall_accuracy(&self) -> f64 {
        ratio(self.correct(), self.total())
    }

    /// Accuracy within each true class and its mean over classes.
    ///
    /// A class that never appeared as a target counts as `0.0` and still takes part in the
    /// mean.
    pub fn per_class_accuracy(&self) -> ClassAccuracy {
        let per_class: Vec<f64> = (0..self.num_classes)
            .map(|class| ratio(self.get(class, class), self.row(class).iter().sum()))
            .collect();

        let mean = if per_class.is_empty() {
            0.0
        } else {
            per_class.iter().sum::<f64>() / per_class.len() as f64
        };

        ClassAccuracy { mean, per_class }
    }

    /// Mean of the per-class accuracies, also called average accuracy.
    pub fn average_accuracy(&self) -> f64 {
        self.per_class_accuracy().mean
    }

    fn contains(&self, label: i64) -> bool {
        label >= 0 && (label as u64) < self.num_classes as u64
    }
}

impl Display for ConfusionMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for target in 0..self.num_classes {
            let row = self
                .row(target)
                .iter()
                .map(|count| count.to_string())
                .collect::<Vec<_>>()
                .join(" ");
            writeln!(f, "[{row}]")?;
        }
        Ok(())
    }
}

pub(crate) fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn labels_from_tensor<B: Backend, const D: usize>(
    tensor: Tensor<B, D, Int>,
) -> Result<Vec<i64>, MetricError> {
    tensor
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|err| MetricError::TensorData(format!("{err:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use rstest::rstest;

    const EPSILON: f64 = 1e-9;

    fn scenario() -> ConfusionMatrix {
        let mut matrix = ConfusionMatrix::new(3);
        matrix.accumulate(&[0, 1, 2, 0], &[0, 1, 1, 0]).unwrap();
        matrix
    }

    #[test]
    fn test_accumulate_counts_pairs() {
        let matrix = scenario();
        let expected = ConfusionMatrix::from_rows(&[[2u64, 0, 0], [0, 1, 0], [0, 1, 0]]).unwrap();

        assert_eq!(matrix, expected);
        assert_eq!(matrix.total(), 4);
        assert_eq!(matrix.correct(), 3);
    }

    #[test]
    fn test_accuracies_of_known_matrix() {
        let matrix = scenario();
        let accuracy = matrix.per_class_accuracy();

        assert!((matrix.overall_accuracy() - 0.75).abs() < EPSILON);
        assert_eq!(accuracy.per_class, vec![1.0, 1.0, 0.0]);
        assert!((accuracy.mean - 2.0 / 3.0).abs() < EPSILON);
        assert_eq!(format!("{:.3}", accuracy.mean), "0.667");
    }

    #[test]
    fn test_empty_matrix_has_zero_accuracies() {
        let matrix = ConfusionMatrix::new(4);
        let accuracy = matrix.per_class_accuracy();

        assert_eq!(matrix.overall_accuracy(), 0.0);
        assert_eq!(accuracy.mean, 0.0);
        assert_eq!(accuracy.per_class, vec![0.0; 4]);
    }

    #[test]
    fn test_empty_batch_leaves_matrix_unchanged() {
        let mut matrix = scenario();
        matrix.accumulate(&[], &[]).unwrap();

        assert_eq!(matrix, scenario());

        let mut empty = ConfusionMatrix::new(3);
        empty.accumulate(&[], &[]).unwrap();
        assert_eq!(empty.overall_accuracy(), 0.0);
    }

    #[test]
    fn test_length_mismatch_is_rejected_without_side_effect() {
        let mut matrix = scenario();
        let result = matrix.accumulate(&[0, 1, 2], &[0, 1]);

        assert!(matches!(result, Err(MetricError::ShapeMismatch { .. })));
        assert_eq!(matrix, scenario());
    }

    #[rstest]
    #[case::target_too_large(&[0, 3], &[0, 1], 3)]
    #[case::prediction_too_large(&[0, 1], &[7, 1], 7)]
    #[case::negative_target(&[-1, 1], &[0, 1], -1)]
    fn test_out_of_range_label_is_rejected(
        #[case] targets: &[i64],
        #[case] predictions: &[i64],
        #[case] label: i64,
    ) {
        let mut matrix = scenario();
        let result = matrix.accumulate(targets, predictions);

        assert_eq!(
            result,
            Err(MetricError::OutOfRangeLabel {
                label,
                num_classes: 3
            })
        );
        assert_eq!(matrix, scenario());
    }

    #[test]
    fn test_accumulate_is_independent_of_batch_grouping() {
        let a = ([0, 1, 1], [0, 0, 1]);
        let b = ([2, 2], [2, 1]);
        let c = ([1, 0, 2, 2], [1, 0, 0, 2]);

        let mut grouped_first = ConfusionMatrix::new(3);
        let ab_targets = [&a.0[..], &b.0[..]].concat();
        let ab_predictions = [&a.1[..], &b.1[..]].concat();
        grouped_first.accumulate(&ab_targets, &ab_predictions).unwrap();
        grouped_first.accumulate(&c.0, &c.1).unwrap();

        let mut grouped_last = ConfusionMatrix::new(3);
        let bc_targets = [&b.0[..], &c.0[..]].concat();
        let bc_predictions = [&b.1[..], &c.1[..]].concat();
        grouped_last.accumulate(&a.0, &a.1).unwrap();
        grouped_last.accumulate(&bc_targets, &bc_predictions).unwrap();
        grouped_last.accumulate(&[], &[]).unwrap();

        let mut reversed = ConfusionMatrix::new(3);
        reversed.accumulate(&c.0, &c.1).unwrap();
        reversed.accumulate(&b.0, &b.1).unwrap();
        reversed.accumulate(&a.0, &a.1).unwrap();

        assert_eq!(grouped_first, grouped_last);
        assert_eq!(grouped_first, reversed);
    }

    #[test]
    fn test_same_batch_twice_doubles_counts() {
        let mut matrix = scenario();
        matrix.accumulate(&[0, 1, 2, 0], &[0, 1, 1, 0]).unwrap();
        let expected = ConfusionMatrix::from_rows(&[[4u64, 0, 0], [0, 2, 0], [0, 2, 0]]).unwrap();

        assert_eq!(matrix, expected);
        assert!((matrix.overall_accuracy() - 0.75).abs() < EPSILON);
    }

    #[test]
    fn test_overall_accuracy_is_one_only_without_errors() {
        let mut perfect = ConfusionMatrix::new(2);
        perfect.accumulate(&[0, 1, 1], &[0, 1, 1]).unwrap();
        assert_eq!(perfect.overall_accuracy(), 1.0);

        let mut single_error = perfect.clone();
        single_error.accumulate(&[0], &[1]).unwrap();
        let accuracy = single_error.overall_accuracy();
        assert!(accuracy < 1.0 && accuracy >= 0.0);

        assert_eq!(ConfusionMatrix::new(2).overall_accuracy(), 0.0);
    }

    #[test]
    fn test_merge_adds_counts() {
        let mut matrix = scenario();
        matrix.merge(&scenario()).unwrap();

        assert_eq!(matrix.total(), 8);
        assert_eq!(matrix.get(0, 0), 4);
        assert_eq!(
            matrix.merge(&ConfusionMatrix::new(2)),
            Err(MetricError::ClassCountMismatch {
                expected: 3,
                found: 2
            })
        );
    }

    #[test]
    fn test_from_rows_rejects_non_square_input() {
        let result = ConfusionMatrix::from_rows(&[vec![1u64, 2], vec![3]]);
        assert!(matches!(
            result,
            Err(MetricError::ClassCountMismatch { .. })
        ));
    }

    #[test]
    fn test_accumulate_tensors() {
        let device = Default::default();
        let targets = Tensor::<TestBackend, 2, Int>::from_data([[0, 1], [2, 0]], &device);
        let predictions = Tensor::<TestBackend, 2, Int>::from_data([[0, 1], [1, 0]], &device);

        let mut matrix = ConfusionMatrix::new(3);
        matrix.accumulate_tensors(targets, predictions).unwrap();

        assert_eq!(matrix, scenario());
    }

    #[test]
    fn test_accumulate_tensors_shape_mismatch() {
        let device = Default::default();
        let targets = Tensor::<TestBackend, 2, Int>::from_data([[0, 1, 2, 0]], &device);
        let predictions = Tensor::<TestBackend, 2, Int>::from_data([[0, 1], [1, 0]], &device);

        let mut matrix = ConfusionMatrix::new(3);
        let result = matrix.accumulate_tensors(targets, predictions);

        assert_eq!(
            result,
            Err(MetricError::ShapeMismatch {
                targets: vec![1, 4],
                predictions: vec![2, 2],
            })
        );
        assert_eq!(matrix.total(), 0);
    }

    #[test]
    fn test_display_prints_rows() {
        assert_eq!(scenario().to_string(), "[2 0 0]\n[0 1 0]\n[0 1 0]\n");
    }
}
