use burn::{
    backend::{ndarray::NdArrayDevice, Autodiff, NdArray},
    tensor::backend::AutodiffBackend,
};
use clap::Parser;
use seg_training::{
    image2d::{default_experiment_name, NormalizationConfig, Simple2dTrainingConfig, UNetConfig},
    logger::install_file_logger,
    TrainingError,
};
use std::path::{Path, PathBuf};

/// Train a UNet on 2D grayscale images.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Train on the CPU even when a GPU backend is compiled in.
    #[arg(long)]
    disable_gpu: bool,
    /// Name of the experiment folder, `UNet__<timestamp>` by default.
    #[arg(short = 'n', long)]
    exp_name: Option<String>,
    /// Maximum number of training steps to perform.
    #[arg(short = 'm', long, default_value_t = 500000)]
    max_steps: usize,
    /// Checkpoint to resume the network weights from.
    #[arg(short = 'r', long, value_name = "PATH")]
    resume: Option<PathBuf>,
    /// Base seed for all random number generators.
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Load data on a single thread so runs can be repeated exactly.
    #[arg(long)]
    deterministic: bool,
    /// Folder holding the `train` and `valid` image folders.
    #[arg(long, default_value = "data/simple2d")]
    data_root: PathBuf,
    /// Folder receiving the experiment folders.
    #[arg(long, default_value = "training")]
    save_root: PathBuf,
}

fn train<B: AutodiffBackend>(
    args: &Args,
    config: Simple2dTrainingConfig,
    experiment_dir: &Path,
    device: B::Device,
) -> Result<(), TrainingError> {
    println!("Running on device: {device:?}");
    seg_training::image2d::run::<B>(
        config,
        &args.data_root,
        experiment_dir,
        args.resume.as_deref(),
        device,
        true,
    )?;
    Ok(())
}

fn main() -> Result<(), TrainingError> {
    let args = Args::parse();
    let config = Simple2dTrainingConfig::new(
        UNetConfig::new(),
        Simple2dTrainingConfig::default_optimizer(),
        NormalizationConfig::new(),
    )
    .with_max_steps(args.max_steps)
    .with_seed(args.seed)
    .with_deterministic(args.deterministic);

    let exp_name = args.exp_name.clone().unwrap_or_else(default_experiment_name);
    let experiment_dir = args.save_root.join(exp_name);
    std::fs::create_dir_all(&experiment_dir)?;
    install_file_logger(&experiment_dir);

    #[cfg(feature = "wgpu")]
    if !args.disable_gpu {
        use burn::backend::{wgpu::WgpuDevice, Wgpu};

        return train::<Autodiff<Wgpu>>(&args, config, &experiment_dir, WgpuDevice::default());
    }

    #[cfg(not(feature = "wgpu"))]
    if !args.disable_gpu {
        log::warn!("Built without the `wgpu` feature, training on the CPU");
    }

    train::<Autodiff<NdArray>>(&args, config, &experiment_dir, NdArrayDevice::Cpu)
}
