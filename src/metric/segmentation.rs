use super::{confusion::ratio, ConfusionMatrix};
use std::fmt::{self, Display};

/// Per-class segmentation metrics computed from a [confusion matrix](ConfusionMatrix).
///
/// Every class is evaluated one-vs-rest: pixels (or points) of class `c` are positives,
/// everything else is negative.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentationMetric {
    /// `(TP + TN) / total`
    Accuracy,
    /// `TP / (TP + FP)`
    Precision,
    /// `TP / (TP + FN)`
    Recall,
    /// Dice similarity coefficient, `2TP / (2TP + FP + FN)`.
    Dsc,
    /// Intersection over union, `TP / (TP + FP + FN)`.
    IoU,
}

impl SegmentationMetric {
    /// All metrics, in reporting order.
    pub const ALL: [SegmentationMetric; 5] = [
        SegmentationMetric::Accuracy,
        SegmentationMetric::Precision,
        SegmentationMetric::Recall,
        SegmentationMetric::Dsc,
        SegmentationMetric::IoU,
    ];

    /// Short name used in metric entries.
    pub fn name(&self) -> &'static str {
        match self {
            SegmentationMetric::Accuracy => "accuracy",
            SegmentationMetric::Precision => "precision",
            SegmentationMetric::Recall => "recall",
            SegmentationMetric::Dsc => "DSC",
            SegmentationMetric::IoU => "IoU",
        }
    }

    /// Value of the metric for a single class. Empty denominators give `0.0`.
    pub fn class_value(&self, matrix: &ConfusionMatrix, class: usize) -> f64 {
        let counts = ClassCounts::new(matrix, class);

        match self {
            SegmentationMetric::Accuracy => ratio(counts.tp + counts.tn, matrix.total()),
            SegmentationMetric::Precision => ratio(counts.tp, counts.tp + counts.fp),
            SegmentationMetric::Recall => ratio(counts.tp, counts.tp + counts.fn_),
            SegmentationMetric::Dsc => {
                ratio(2 * counts.tp, 2 * counts.tp + counts.fp + counts.fn_)
            }
            SegmentationMetric::IoU => ratio(counts.tp, counts.tp + counts.fp + counts.fn_),
        }
    }

    /// Mean of the metric over all classes.
    pub fn mean_value(&self, matrix: &ConfusionMatrix) -> f64 {
        let num_classes = matrix.num_classes();
        if num_classes == 0 {
            return 0.0;
        }

        (0..num_classes)
            .map(|class| self.class_value(matrix, class))
            .sum::<f64>()
            / num_classes as f64
    }
}

struct ClassCounts {
    tp: u64,
    fp: u64,
    fn_: u64,
    tn: u64,
}

impl ClassCounts {
    fn new(matrix: &ConfusionMatrix, class: usize) -> Self {
        let tp = matrix.get(class, class);
        let fp = matrix.column_sum(class) - tp;
        let fn_ = matrix.row(class).iter().sum::<u64>() - tp;
        let tn = matrix.total() - tp - fp - fn_;

        Self { tp, fp, fn_, tn }
    }
}

/// Snapshot of all [segmentation metrics](SegmentationMetric) for one evaluation.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentationReport {
    prefix: String,
    values: Vec<MetricValues>,
}

#[derive(Clone, Debug, PartialEq)]
struct MetricValues {
    metric: SegmentationMetric,
    mean: f64,
    per_class: Vec<f64>,
}

impl SegmentationReport {
    /// Evaluates every metric on the matrix. Entry names start with `prefix`, e.g. `val`.
    pub fn new(prefix: impl Into<String>, matrix: &ConfusionMatrix) -> Self {
        let values = SegmentationMetric::ALL
            .iter()
            .map(|metric| MetricValues {
                metric: *metric,
                mean: metric.mean_value(matrix),
                per_class: (0..matrix.num_classes())
                    .map(|class| metric.class_value(matrix, class))
                    .collect(),
            })
            .collect();

        Self {
            prefix: prefix.into(),
            values,
        }
    }

    /// Mean value of a metric over classes.
    pub fn mean(&self, metric: SegmentationMetric) -> f64 {
        self.find(metric).map(|values| values.mean).unwrap_or(0.0)
    }

    /// Value of a metric for one class, if the class exists.
    pub fn class(&self, metric: SegmentationMetric, class: usize) -> Option<f64> {
        self.find(metric)
            .and_then(|values| values.per_class.get(class).copied())
    }

    /// Named entries, `<prefix>_<metric>_mean` then `<prefix>_<metric>_c<class>` for each
    /// metric.
    pub fn entries(&self) -> Vec<(String, f64)> {
        let mut entries = Vec::new();

        for values in self.values.iter() {
            let name = values.metric.name();
            entries.push((format!("{}_{name}_mean", self.prefix), values.mean));

            for (class, value) in values.per_class.iter().enumerate() {
                entries.push((format!("{}_{name}_c{class}", self.prefix), *value));
            }
        }

        entries
    }

    fn find(&self, metric: SegmentationMetric) -> Option<&MetricValues> {
        self.values.iter().find(|values| values.metric == metric)
    }
}

impl Display for SegmentationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let means = self
            .values
            .iter()
            .map(|values| format!("{}={:.3}", values.metric.name(), values.mean))
            .collect::<Vec<_>>()
            .join(" ");

        f.write_str(&means)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn matrix() -> ConfusionMatrix {
        // Class 0: tp=2 fp=0 fn=0, class 1: tp=1 fp=1 fn=0, class 2: tp=0 fp=0 fn=1
        ConfusionMatrix::from_rows(&[[2u64, 0, 0], [0, 1, 0], [0, 1, 0]]).unwrap()
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "Expected {expected}, got {actual}"
        );
    }

    #[rstest]
    #[case::accuracy(SegmentationMetric::Accuracy, [1.0, 0.75, 0.75])]
    #[case::precision(SegmentationMetric::Precision, [1.0, 0.5, 0.0])]
    #[case::recall(SegmentationMetric::Recall, [1.0, 1.0, 0.0])]
    #[case::dsc(SegmentationMetric::Dsc, [1.0, 2.0 / 3.0, 0.0])]
    #[case::iou(SegmentationMetric::IoU, [1.0, 0.5, 0.0])]
    fn test_class_values(#[case] metric: SegmentationMetric, #[case] expected: [f64; 3]) {
        let matrix = matrix();

        for (class, expected) in expected.iter().enumerate() {
            assert_close(metric.class_value(&matrix, class), *expected);
        }
        assert_close(
            metric.mean_value(&matrix),
            expected.iter().sum::<f64>() / 3.0,
        );
    }

    #[test]
    fn test_recall_matches_per_class_accuracy() {
        let matrix = matrix();
        let accuracy = matrix.per_class_accuracy();

        for class in 0..3 {
            assert_close(
                SegmentationMetric::Recall.class_value(&matrix, class),
                accuracy.per_class[class],
            );
        }
    }

    #[test]
    fn test_empty_matrix_reports_zeros() {
        let report = SegmentationReport::new("val", &ConfusionMatrix::new(2));

        assert!(report.entries().iter().all(|(_, value)| *value == 0.0));
    }

    #[test]
    fn test_report_entries_names() {
        let report = SegmentationReport::new("val", &ConfusionMatrix::new(2));
        let names: Vec<String> = report.entries().into_iter().map(|(name, _)| name).collect();

        assert_eq!(names.len(), 5 * 3);
        assert_eq!(&names[..3], &["val_accuracy_mean", "val_accuracy_c0", "val_accuracy_c1"]);
        assert_eq!(names[12], "val_IoU_mean");
    }

    #[test]
    fn test_report_lookup() {
        let report = SegmentationReport::new("val", &matrix());

        assert_close(report.mean(SegmentationMetric::IoU), 0.5);
        assert_eq!(report.class(SegmentationMetric::Precision, 1), Some(0.5));
        assert_eq!(report.class(SegmentationMetric::Precision, 3), None);
    }
}
