/// Confusion matrix accumulated over an epoch with the accuracies derived from it.
pub mod confusion;
/// Precision, recall, Dice and IoU computed from a confusion matrix.
pub mod segmentation;

pub use confusion::*;
pub use segmentation::*;

/// Errors raised while accumulating labels into a [confusion matrix](ConfusionMatrix).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MetricError {
    /// Targets and predictions don't hold the same number of labels.
    #[error("Targets and predictions must have the same shape, got {targets:?} and {predictions:?}")]
    ShapeMismatch {
        /// Shape of the targets.
        targets: Vec<usize>,
        /// Shape of the predictions.
        predictions: Vec<usize>,
    },

    /// A label is negative or not lower than the number of classes.
    #[error("Label {label} is outside of the range [0, {num_classes})")]
    OutOfRangeLabel {
        /// The rejected label.
        label: i64,
        /// Number of classes of the matrix.
        num_classes: usize,
    },

    /// Two matrices, or a matrix and its rows, disagree on the number of classes.
    #[error("Expected a confusion matrix with {expected} classes, got {found}")]
    ClassCountMismatch {
        /// Number of classes expected.
        expected: usize,
        /// Number of classes found.
        found: usize,
    },

    /// Tensor data could not be converted to integer labels.
    #[error("Labels could not be read from the tensor: {0}")]
    TensorData(String),
}
