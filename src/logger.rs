use crate::metric::ConfusionMatrix;
use indicatif::{ProgressBar, ProgressStyle};
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing_subscriber::filter::{filter_fn, LevelFilter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{registry, Layer};

/// Name of the process log written in every experiment folder.
pub const EXPERIMENT_LOG: &str = "experiment.log";

/// Sends the process logs of a training to `<experiment_dir>/experiment.log`.
///
/// Records of the `log` facade are forwarded to the file, and a panic is reported there
/// before the process stops. Returns `false` without touching the panic hook when a global
/// subscriber is already installed.
pub fn install_file_logger(experiment_dir: &Path) -> bool {
    let writer = tracing_appender::rolling::never(experiment_dir, EXPERIMENT_LOG);
    let layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(LevelFilter::INFO)
        .with_filter(filter_fn(|metadata| {
            *metadata.level() < LevelFilter::INFO || !is_gpu_runtime(metadata.module_path())
        }));

    let installed = registry().with(layer).try_init().is_ok();
    if installed {
        report_panics(experiment_dir);
    }

    installed
}

/// Modules of the GPU runtime, whose info records would flood the experiment log.
fn is_gpu_runtime(module_path: Option<&str>) -> bool {
    module_path.is_some_and(|path| {
        ["wgpu", "cubecl"]
            .iter()
            .any(|crate_name| path.starts_with(crate_name))
    })
}

fn report_panics(experiment_dir: &Path) {
    let hook = std::panic::take_hook();
    let log_path = experiment_dir.join(EXPERIMENT_LOG);

    std::panic::set_hook(Box::new(move |info| {
        log::error!("Training stopped on a panic: {info}");
        eprintln!(
            "Training stopped on a panic, the experiment log is in '{}'",
            log_path.display()
        );
        hook(info);
    }));
}

/// Text log with one line per epoch: `<epoch> <overall accuracy> <average accuracy>`.
///
/// Accuracies are written with three decimals and the file is flushed after every line, so
/// it can be followed while the training runs.
pub struct EpochLogWriter {
    file: File,
    path: PathBuf,
}

impl EpochLogWriter {
    /// Creates the log file, truncating a previous one.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;

        Ok(Self { file, path })
    }

    /// Writes the line of an epoch.
    pub fn log(
        &mut self,
        epoch: usize,
        overall_accuracy: f64,
        average_accuracy: f64,
    ) -> io::Result<()> {
        writeln!(
            self.file,
            "{}",
            format_epoch_line(epoch, overall_accuracy, average_accuracy)
        )?;
        self.file.flush()
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Formats the accuracies of an epoch as written by the [EpochLogWriter].
pub fn format_epoch_line(epoch: usize, overall_accuracy: f64, average_accuracy: f64) -> String {
    format!("{epoch} {overall_accuracy:.3} {average_accuracy:.3}")
}

/// Text log of scalar values, one `<step> <name> <value>` line each.
///
/// Lines are appended to an existing file, so a resumed training continues its log.
pub struct MetricsLogWriter {
    file: File,
    path: PathBuf,
}

impl MetricsLogWriter {
    /// Opens the log file, creating it if needed.
    pub fn append(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self { file, path })
    }

    /// Writes the values of a step.
    pub fn log<'a, I>(&mut self, step: usize, entries: I) -> io::Result<()>
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        for (name, value) in entries {
            writeln!(self.file, "{step} {name} {value:.6}")?;
        }
        self.file.flush()
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Progress bar of an epoch showing running accuracies.
pub struct TrainingProgress {
    pb: ProgressBar,
}

impl TrainingProgress {
    /// A progress bar over `num_batches` batches, prefixed with `description`.
    pub fn new(description: String, num_batches: usize) -> Self {
        let pb = ProgressBar::new(num_batches as u64);
        let style = ProgressStyle::with_template(
            "{prefix} {wide_bar:.cyan/blue} {pos}/{len} [{elapsed_precise}<{eta_precise}] {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");

        pb.set_style(style);
        pb.set_prefix(description);

        Self { pb }
    }

    /// A progress bar that never draws, for tests and non-interactive runs.
    pub fn hidden() -> Self {
        Self {
            pb: ProgressBar::hidden(),
        }
    }

    /// Advances the bar by one batch and shows the running accuracies of the matrix.
    pub fn update(&self, matrix: &ConfusionMatrix) {
        self.pb.set_message(format!(
            "OA={:.3} AA={:.3}",
            matrix.overall_accuracy(),
            matrix.average_accuracy()
        ));
        self.pb.inc(1);
    }

    /// Shows a free-form message, e.g. the current loss.
    pub fn message(&self, message: String) {
        self.pb.set_message(message);
    }

    /// Advances the bar by one item without changing the message.
    pub fn inc(&self) {
        self.pb.inc(1);
    }

    /// Leaves the final state of the bar on screen.
    pub fn finish(&self) {
        self.pb.finish();
    }
}
