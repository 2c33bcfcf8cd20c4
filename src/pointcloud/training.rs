use super::{
    data::{ChunkSamplingConfig, PointCloudBatch, PointCloudBatcher, PointCloudDataset},
    model::{PointSegNet, PointSegNetConfig},
};
use crate::{
    logger::{EpochLogWriter, TrainingProgress},
    lr_scheduler::{MultiStepLrScheduler, MultiStepLrSchedulerConfig},
    metric::ConfusionMatrix,
    TrainingError,
};
use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    lr_scheduler::LrScheduler,
    nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig},
    optim::{adaptor::OptimizerAdaptor, Adam, AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Settings of a point cloud segmentation training.
#[derive(Config, Debug)]
pub struct PointCloudTrainingConfig {
    /// The network to train.
    pub model: PointSegNetConfig,
    /// The optimizer.
    pub optimizer: AdamConfig,
    /// How training chunks are drawn from the clouds.
    pub sampling: ChunkSamplingConfig,
    /// Number of epochs.
    #[config(default = 200)]
    pub num_epochs: usize,
    /// Number of chunks per batch.
    #[config(default = 16)]
    pub batch_size: usize,
    /// Number of data loading threads.
    #[config(default = 1)]
    pub num_workers: usize,
    /// Learning rate before the first milestone.
    #[config(default = 1e-3)]
    pub learning_rate: f64,
    /// Epochs at which the learning rate decays.
    #[config(default = "vec![60, 120]")]
    pub milestones: Vec<usize>,
    /// Learning rate decay applied at each milestone.
    #[config(default = 0.1)]
    pub gamma: f64,
    /// Seed of the backend and of the data loader shuffling.
    #[config(default = 42)]
    pub seed: u64,
}

impl PointCloudTrainingConfig {
    /// Name of the experiment folder, derived from the batch and chunk settings.
    pub fn experiment_name(&self) -> String {
        format!(
            "SegSmall_b{}_r{}_s{}",
            self.batch_size, self.sampling.radius, self.sampling.npoints
        )
    }

    /// Folder receiving the logs and checkpoints of the experiment.
    pub fn experiment_dir(&self, save_root: &Path) -> PathBuf {
        save_root.join(self.experiment_name())
    }
}

/// Loss and accuracies of a finished epoch.
#[derive(new, Clone, Debug, PartialEq)]
pub struct EpochSummary {
    /// Index of the epoch, starting at 0.
    pub epoch: usize,
    /// Learning rate used during the epoch.
    pub learning_rate: f64,
    /// Mean loss over the batches.
    pub loss: f64,
    /// Fraction of correctly classified points.
    pub overall_accuracy: f64,
    /// Mean of the per-class accuracies.
    pub average_accuracy: f64,
}

/// Manual training loop of a [point segmentation network](PointSegNet).
pub struct PointCloudTrainer<B: AutodiffBackend> {
    model: PointSegNet<B>,
    optim: OptimizerAdaptor<Adam, PointSegNet<B>, B>,
    scheduler: MultiStepLrScheduler,
    loss: CrossEntropyLoss<B>,
    num_classes: usize,
}

impl<B: AutodiffBackend> PointCloudTrainer<B> {
    /// Creates the network, the optimizer and the learning rate schedule.
    pub fn new(
        config: &PointCloudTrainingConfig,
        device: &B::Device,
    ) -> Result<Self, TrainingError> {
        let scheduler =
            MultiStepLrSchedulerConfig::new(config.learning_rate, config.milestones.clone())
                .with_gamma(config.gamma)
                .init()
                .map_err(TrainingError::Scheduler)?;

        Ok(Self {
            model: config.model.init(device),
            optim: config.optimizer.init(),
            scheduler,
            loss: CrossEntropyLossConfig::new().init(device),
            num_classes: config.model.output_channels,
        })
    }

    /// Optimizes the network on one batch and adds its predictions to the matrix.
    ///
    /// The loss is the sum over the chunks of their mean cross-entropy. Returns the loss.
    pub fn train_step(
        &mut self,
        batch: PointCloudBatch<B>,
        lr: f64,
        matrix: &mut ConfusionMatrix,
    ) -> Result<f64, TrainingError> {
        let [batch_size, npoints] = batch.labels.dims();
        let model = self.model.clone();

        let output = model.forward(batch.features, batch.points);
        let [_, _, num_classes] = output.dims();

        let loss = self
            .loss
            .forward(
                output.clone().reshape([batch_size * npoints, num_classes]),
                batch.labels.clone().reshape([batch_size * npoints]),
            )
            .mul_scalar(batch_size as f32);

        // Gradients linked to each parameter of the model.
        let grads = GradientsParams::from_grads(loss.backward(), &model);
        self.model = self.optim.step(lr, model, grads);

        let predictions = output.detach().argmax(2).reshape([batch_size, npoints]);
        matrix.accumulate_tensors(batch.labels, predictions)?;

        Ok(loss.into_scalar().elem::<f64>())
    }

    /// Runs one epoch over the batches with a fresh confusion matrix.
    pub fn train_epoch<I>(
        &mut self,
        epoch: usize,
        batches: I,
        progress: &TrainingProgress,
    ) -> Result<EpochSummary, TrainingError>
    where
        I: Iterator<Item = PointCloudBatch<B>>,
    {
        let lr = self.scheduler.step();
        let mut matrix = ConfusionMatrix::new(self.num_classes);
        let mut loss_sum = 0.0;
        let mut num_batches = 0;

        for batch in batches {
            loss_sum += self.train_step(batch, lr, &mut matrix)?;
            num_batches += 1;
            progress.update(&matrix);
        }

        log::debug!("Confusion matrix of epoch {epoch}:\n{matrix}");

        let loss = if num_batches == 0 {
            0.0
        } else {
            loss_sum / num_batches as f64
        };

        Ok(EpochSummary::new(
            epoch,
            lr,
            loss,
            matrix.overall_accuracy(),
            matrix.average_accuracy(),
        ))
    }

    /// Saves the weights of the network, `.mpk` is appended to the path.
    pub fn save(&self, path: &Path) -> Result<(), TrainingError> {
        self.model
            .clone()
            .save_file(path.to_path_buf(), &CompactRecorder::new())?;
        Ok(())
    }

    /// The network being trained.
    pub fn model(&self) -> &PointSegNet<B> {
        &self.model
    }
}

/// Trains a point segmentation network on the clouds of `train_path`.
///
/// The configuration, the weights after each epoch (`state_dict.mpk`) and the accuracy log
/// (`log.txt`) are written to the [experiment folder](PointCloudTrainingConfig::experiment_dir).
pub fn run<B: AutodiffBackend>(
    config: PointCloudTrainingConfig,
    train_path: &Path,
    save_root: &Path,
    device: B::Device,
    show_progress: bool,
) -> Result<Vec<EpochSummary>, TrainingError> {
    if config.batch_size == 0 {
        return Err(TrainingError::Config(
            "The batch size must be at least 1".to_string(),
        ));
    }

    let folder = config.experiment_dir(save_root);
    std::fs::create_dir_all(&folder)?;
    config.save(folder.join("config.json"))?;

    B::seed(&device, config.seed);

    let dataset = PointCloudDataset::load(
        train_path,
        config.sampling.clone(),
        config.model.output_channels,
    )?;
    let num_batches = dataset.len().div_ceil(config.batch_size);
    let epochs = dataset.epoch_counter();

    let dataloader: Arc<dyn DataLoader<B, PointCloudBatch<B>>> =
        DataLoaderBuilder::new(PointCloudBatcher::default())
            .batch_size(config.batch_size)
            .shuffle(config.seed)
            .num_workers(config.num_workers)
            .set_device(device.clone())
            .build(dataset);

    let mut trainer = PointCloudTrainer::<B>::new(&config, &device)?;
    let mut logs = EpochLogWriter::create(folder.join("log.txt"))?;
    let mut summaries = Vec::with_capacity(config.num_epochs);

    log::info!(
        "Training for {} epochs of {num_batches} batches in '{}'",
        config.num_epochs,
        folder.display()
    );

    for epoch in 0..config.num_epochs {
        let progress = if show_progress {
            TrainingProgress::new(format!("Epoch {epoch}"), num_batches)
        } else {
            TrainingProgress::hidden()
        };

        let summary = trainer.train_epoch(epoch, dataloader.iter(), &progress)?;
        progress.finish();
        epochs.advance();

        trainer.save(&folder.join("state_dict"))?;
        logs.log(epoch, summary.overall_accuracy, summary.average_accuracy)?;

        log::info!(
            "Epoch {epoch}: lr={:e} loss={:.4} OA={:.3} AA={:.3}",
            summary.learning_rate,
            summary.loss,
            summary.overall_accuracy,
            summary.average_accuracy
        );
        summaries.push(summary);
    }

    Ok(summaries)
}
