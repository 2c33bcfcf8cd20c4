use crate::metric::MetricError;

/// Errors raised while preparing or running a training.
#[derive(thiserror::Error, Debug)]
pub enum TrainingError {
    /// Invalid labels or shapes given to a metric.
    #[error("Metric error: {0}")]
    Metric(#[from] MetricError),

    /// Filesystem error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed point cloud file.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Unreadable image file.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Model weights could not be saved or loaded.
    #[error("Recorder error: {0}")]
    Recorder(String),

    /// Training configuration could not be saved or is invalid.
    #[error("Config error: {0}")]
    Config(String),

    /// Training data is missing or inconsistent.
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Learning rate scheduler could not be created.
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl From<burn::record::RecorderError> for TrainingError {
    fn from(error: burn::record::RecorderError) -> Self {
        TrainingError::Recorder(format!("{error:?}"))
    }
}
