use super::{
    data::{ImageSegBatch, ImageSegBatcher, ImageSegDataset, NormalizationConfig},
    model::{UNet, UNetConfig},
};
use crate::{
    logger::{MetricsLogWriter, TrainingProgress},
    metric::{ConfusionMatrix, SegmentationReport},
    TrainingError,
};
use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    lr_scheduler::{
        step::{StepLrScheduler, StepLrSchedulerConfig},
        LrScheduler,
    },
    module::AutodiffModule,
    nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig},
    optim::{
        adaptor::OptimizerAdaptor, decay::WeightDecayConfig, Adam, AdamConfig, GradientsParams,
        Optimizer,
    },
    prelude::*,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
};
use std::{
    path::Path,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

/// Settings of a 2D segmentation training.
#[derive(Config, Debug)]
pub struct Simple2dTrainingConfig {
    /// The network to train.
    pub model: UNetConfig,
    /// The optimizer.
    pub optimizer: AdamConfig,
    /// Intensity standardization of the images.
    pub normalization: NormalizationConfig,
    /// Number of optimization steps.
    #[config(default = 500000)]
    pub max_steps: usize,
    /// Number of patches per batch.
    #[config(default = 1)]
    pub batch_size: usize,
    /// Number of data loading threads.
    #[config(default = 1)]
    pub num_workers: usize,
    /// Initial learning rate.
    #[config(default = 0.0004)]
    pub learning_rate: f64,
    /// Number of steps between two learning rate decays.
    #[config(default = 1000)]
    pub lr_stepsize: usize,
    /// Learning rate decay factor.
    #[config(default = 0.995)]
    pub lr_dec: f64,
    /// Size of the training patches.
    #[config(default = "[128, 128]")]
    pub train_patch: [usize; 2],
    /// Size of the validation patches.
    #[config(default = "[144, 144]")]
    pub valid_patch: [usize; 2],
    /// Number of training patches cropped from each image per pass.
    #[config(default = 16)]
    pub crops_per_image: usize,
    /// Number of steps between two validations.
    #[config(default = 1000)]
    pub valid_interval: usize,
    /// Seed of the backend, of the crops and of the shuffling.
    #[config(default = 0)]
    pub seed: u64,
    /// Restricts data loading to a single thread.
    #[config(default = false)]
    pub deterministic: bool,
}

impl Simple2dTrainingConfig {
    /// Adam with the weight decay used for the 2D training.
    pub fn default_optimizer() -> AdamConfig {
        AdamConfig::new().with_weight_decay(Some(WeightDecayConfig::new(0.5e-4)))
    }

    fn check_patches(&self) -> Result<(), TrainingError> {
        let divisor = self.model.size_divisor();

        for (name, patch) in [("train", self.train_patch), ("valid", self.valid_patch)] {
            if patch.iter().any(|size| *size == 0 || size % divisor != 0) {
                return Err(TrainingError::Config(format!(
                    "The {name} patch {patch:?} must be a non-empty multiple of {divisor} \
                     for a UNet with {} blocks",
                    self.model.n_blocks
                )));
            }
        }

        Ok(())
    }
}

/// Experiment name used when none is given: `UNet__<seconds since the epoch>`.
pub fn default_experiment_name() -> String {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default();

    format!("UNet__{seconds}")
}

/// Validation loss and metrics after a training step.
#[derive(new, Clone, Debug)]
pub struct ValidationRecord {
    /// Number of training steps done before the validation.
    pub step: usize,
    /// Mean cross-entropy over the validation batches.
    pub loss: f64,
    /// Segmentation metrics of the validation predictions.
    pub report: SegmentationReport,
}

/// Manual training loop of a [UNet].
pub struct Simple2dTrainer<B: AutodiffBackend> {
    model: UNet<B>,
    optim: OptimizerAdaptor<Adam, UNet<B>, B>,
    scheduler: StepLrScheduler,
    loss: CrossEntropyLoss<B>,
    valid_loss: CrossEntropyLoss<B::InnerBackend>,
    num_classes: usize,
}

impl<B: AutodiffBackend> Simple2dTrainer<B> {
    /// Creates the optimizer and the learning rate schedule around a network.
    pub fn new(
        config: &Simple2dTrainingConfig,
        model: UNet<B>,
        device: &B::Device,
    ) -> Result<Self, TrainingError> {
        let scheduler = StepLrSchedulerConfig::new(config.learning_rate, config.lr_stepsize)
            .with_gamma(config.lr_dec)
            .init()
            .map_err(TrainingError::Scheduler)?;

        Ok(Self {
            model,
            optim: config.optimizer.init(),
            scheduler,
            loss: CrossEntropyLossConfig::new().init(device),
            valid_loss: CrossEntropyLossConfig::new().init(device),
            num_classes: config.model.out_channels,
        })
    }

    /// Optimizes the network on one batch. Returns the loss.
    pub fn train_step(&mut self, batch: ImageSegBatch<B>) -> f64 {
        let lr = self.scheduler.step();
        let model = self.model.clone();

        let loss = pixel_loss(&self.loss, model.forward(batch.images), batch.targets);

        let grads = GradientsParams::from_grads(loss.backward(), &model);
        self.model = self.optim.step(lr, model, grads);

        loss.into_scalar().elem::<f64>()
    }

    /// Evaluates the network without gradients on the batches.
    pub fn validate<I>(&self, step: usize, batches: I) -> Result<ValidationRecord, TrainingError>
    where
        I: Iterator<Item = ImageSegBatch<B::InnerBackend>>,
    {
        let model = self.model.valid();
        let mut matrix = ConfusionMatrix::new(self.num_classes);
        let mut loss_sum = 0.0;
        let mut num_batches = 0;

        for batch in batches {
            let output = model.forward(batch.images);
            let predictions = output.clone().argmax(1).squeeze_dim::<3>(1);

            loss_sum += pixel_loss(&self.valid_loss, output, batch.targets.clone())
                .into_scalar()
                .elem::<f64>();
            num_batches += 1;

            matrix.accumulate_tensors(batch.targets, predictions)?;
        }

        let loss = if num_batches == 0 {
            0.0
        } else {
            loss_sum / num_batches as f64
        };

        Ok(ValidationRecord::new(
            step,
            loss,
            SegmentationReport::new("val", &matrix),
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
    pub fn model(&self) -> &UNet<B> {
        &self.model
    }
}

/// Mean cross-entropy over every pixel of the batch.
fn pixel_loss<B: Backend>(
    loss: &CrossEntropyLoss<B>,
    output: Tensor<B, 4>,
    targets: Tensor<B, 3, Int>,
) -> Tensor<B, 1> {
    let [batch_size, num_classes, height, width] = output.dims();
    let num_pixels = batch_size * height * width;

    loss.forward(
        output.permute([0, 2, 3, 1]).reshape([num_pixels, num_classes]),
        targets.reshape([num_pixels]),
    )
}

/// Trains a UNet on the images of `<data_root>/train`, validating on `<data_root>/valid`.
///
/// The configuration, the validation metrics (`metrics.txt`) and the `latest` and `best`
/// checkpoints are written to `experiment_dir`. When `resume` is given, the network starts
/// from the weights of that file.
pub fn run<B: AutodiffBackend>(
    config: Simple2dTrainingConfig,
    data_root: &Path,
    experiment_dir: &Path,
    resume: Option<&Path>,
    device: B::Device,
    show_progress: bool,
) -> Result<Vec<ValidationRecord>, TrainingError> {
    config.check_patches()?;
    if config.batch_size == 0 {
        return Err(TrainingError::Config(
            "The batch size must be at least 1".to_string(),
        ));
    }
    std::fs::create_dir_all(experiment_dir)?;
    config.save(experiment_dir.join("config.json"))?;

    B::seed(&device, config.seed);

    let num_classes = config.model.out_channels;
    let train_dataset = ImageSegDataset::load(
        &data_root.join("train"),
        config.train_patch,
        config.crops_per_image,
        num_classes,
        config.normalization.clone(),
        config.seed,
    )?;
    let valid_dataset = ImageSegDataset::load(
        &data_root.join("valid"),
        config.valid_patch,
        1,
        num_classes,
        config.normalization.clone(),
        config.seed,
    )?;

    let passes = train_dataset.epoch_counter();

    let num_workers = if config.deterministic {
        1
    } else {
        config.num_workers
    };

    let train_loader: Arc<dyn DataLoader<B, ImageSegBatch<B>>> =
        DataLoaderBuilder::new(ImageSegBatcher::default())
            .batch_size(config.batch_size)
            .shuffle(config.seed)
            .num_workers(num_workers)
            .set_device(device.clone())
            .build(train_dataset);
    let valid_loader: Arc<dyn DataLoader<B::InnerBackend, ImageSegBatch<B::InnerBackend>>> =
        DataLoaderBuilder::new(ImageSegBatcher::default())
            .batch_size(config.batch_size)
            .num_workers(num_workers)
            .set_device(device.clone())
            .build(valid_dataset);

    let mut model = config.model.init::<B>(&device);
    if let Some(path) = resume {
        log::info!("Resuming from the weights of '{}'", path.display());
        model = model.load_file(path.to_path_buf(), &CompactRecorder::new(), &device)?;
    }

    let mut trainer = Simple2dTrainer::new(&config, model, &device)?;
    let mut metrics = MetricsLogWriter::append(experiment_dir.join("metrics.txt"))?;
    let progress = if show_progress {
        TrainingProgress::new("Training".to_string(), config.max_steps)
    } else {
        TrainingProgress::hidden()
    };

    log::info!(
        "Training for {} steps in '{}'",
        config.max_steps,
        experiment_dir.display()
    );

    let mut step = 0;
    let mut best_loss = f64::INFINITY;
    let mut records = Vec::new();

    while step < config.max_steps {
        let mut num_batches = 0;

        for batch in train_loader.iter() {
            let loss = trainer.train_step(batch);
            step += 1;
            num_batches += 1;
            progress.message(format!("loss={loss:.4}"));
            progress.inc();

            if step % config.valid_interval.max(1) == 0 || step == config.max_steps {
                let record = trainer.validate(step, valid_loader.iter())?;

                let entries = record.report.entries();
                metrics.log(
                    step,
                    std::iter::once(("val_loss", record.loss))
                        .chain(entries.iter().map(|(name, value)| (name.as_str(), *value))),
                )?;

                trainer.save(&experiment_dir.join("latest"))?;
                if record.loss < best_loss {
                    best_loss = record.loss;
                    trainer.save(&experiment_dir.join("best"))?;
                }

                log::info!("Step {step}: val_loss={:.4} {}", record.loss, record.report);
                records.push(record);
            }

            if step >= config.max_steps {
                break;
            }
        }

        if num_batches == 0 {
            return Err(TrainingError::Dataset(
                "The training set yields no batch".to_string(),
            ));
        }
        passes.advance();
    }

    progress.finish();

    Ok(records)
}
