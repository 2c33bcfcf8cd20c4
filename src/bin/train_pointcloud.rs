use burn::{
    backend::{ndarray::NdArrayDevice, Autodiff, NdArray},
    optim::AdamConfig,
    tensor::backend::AutodiffBackend,
};
use clap::Parser;
use seg_training::{
    logger::install_file_logger,
    pointcloud::{
        ChunkSamplingConfig, PointCloudTrainingConfig, PointSegNetConfig, FEATURE_CHANNELS,
    },
    TrainingError,
};
use std::path::PathBuf;

/// Train a point cloud segmentation network on chunks of labelled clouds.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Folder of `x,y,z,label` CSV files.
    #[arg(long)]
    train_path: PathBuf,
    /// Folder receiving the experiment folders.
    #[arg(long, default_value = "training")]
    save_root: PathBuf,
    /// Number of epochs.
    #[arg(long, default_value_t = 200)]
    epochs: usize,
    /// Number of chunks drawn per epoch.
    #[arg(long, default_value_t = 4096)]
    epoch_size: usize,
    /// Number of chunks per batch.
    #[arg(long, default_value_t = 16)]
    batch_size: usize,
    /// Number of points per chunk.
    #[arg(long, default_value_t = 1000)]
    npoints: usize,
    /// Radius of the neighbourhood a chunk is drawn from.
    #[arg(long, default_value_t = 20000.0)]
    radius: f64,
    /// Initial learning rate.
    #[arg(long, default_value_t = 1e-3)]
    lr: f64,
    /// Epochs at which the learning rate is divided by 10.
    #[arg(long, value_delimiter = ',', default_values_t = [60, 120])]
    milestones: Vec<usize>,
    /// Number of classes.
    #[arg(long, default_value_t = 5)]
    num_classes: usize,
    /// Seed of the sampling, of the shuffling and of the backend.
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Number of data loading threads.
    #[arg(long, default_value_t = 1)]
    num_workers: usize,
    /// Train on the CPU even when a GPU backend is compiled in.
    #[arg(long)]
    disable_gpu: bool,
}

impl Args {
    fn config(&self) -> PointCloudTrainingConfig {
        PointCloudTrainingConfig::new(
            PointSegNetConfig::new(FEATURE_CHANNELS, self.num_classes),
            AdamConfig::new(),
            ChunkSamplingConfig::new()
                .with_radius(self.radius)
                .with_npoints(self.npoints)
                .with_epoch_size(self.epoch_size)
                .with_seed(self.seed),
        )
        .with_num_epochs(self.epochs)
        .with_batch_size(self.batch_size)
        .with_num_workers(self.num_workers)
        .with_learning_rate(self.lr)
        .with_milestones(self.milestones.clone())
        .with_seed(self.seed)
    }
}

fn train<B: AutodiffBackend>(
    args: &Args,
    config: PointCloudTrainingConfig,
    device: B::Device,
) -> Result<(), TrainingError> {
    println!("Running on device: {device:?}");
    seg_training::pointcloud::run::<B>(config, &args.train_path, &args.save_root, device, true)?;
    Ok(())
}

fn main() -> Result<(), TrainingError> {
    let args = Args::parse();
    let config = args.config();

    let folder = config.experiment_dir(&args.save_root);
    std::fs::create_dir_all(&folder)?;
    install_file_logger(&folder);

    #[cfg(feature = "wgpu")]
    if !args.disable_gpu {
        use burn::backend::{wgpu::WgpuDevice, Wgpu};

        return train::<Autodiff<Wgpu>>(&args, config, WgpuDevice::default());
    }

    #[cfg(not(feature = "wgpu"))]
    if !args.disable_gpu {
        log::warn!("Built without the `wgpu` feature, training on the CPU");
    }

    train::<Autodiff<NdArray>>(&args, config, NdArrayDevice::Cpu)
}
