use crate::{
    sampling::{item_rng, EpochCounter},
    TrainingError,
};
use burn::{
    config::Config,
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    prelude::*,
};
use image::GrayImage;
use rand::Rng;
use std::path::Path;

/// Intensity statistics used to standardize the raw images.
#[derive(Config, Debug)]
pub struct NormalizationConfig {
    /// Mean raw intensity of the dataset.
    #[config(default = 143.97594)]
    pub mean: f32,
    /// Standard deviation of the raw intensities of the dataset.
    #[config(default = 44.264744)]
    pub std: f32,
}

impl NormalizationConfig {
    fn apply(&self, value: u8) -> f32 {
        (value as f32 - self.mean) / self.std
    }
}

/// Grayscale image with a class for every pixel.
#[derive(Clone, Debug)]
struct LabelledImage {
    height: usize,
    width: usize,
    pixels: Vec<u8>,
    labels: Vec<i64>,
}

impl LabelledImage {
    fn from_pair(raw: GrayImage, labels: GrayImage) -> Option<Self> {
        if raw.dimensions() != labels.dimensions() {
            return None;
        }

        Some(Self {
            height: raw.height() as usize,
            width: raw.width() as usize,
            pixels: raw.into_raw(),
            labels: labels.into_raw().into_iter().map(i64::from).collect(),
        })
    }
}

/// A normalized patch and the class of each of its pixels, stored row by row.
#[derive(Clone, Debug)]
pub struct ImageSegItem {
    /// Standardized intensities, `height * width` values.
    pub image: Vec<f32>,
    /// Class of every pixel.
    pub labels: Vec<i64>,
    /// Height of the patch.
    pub height: usize,
    /// Width of the patch.
    pub width: usize,
}

/// Dataset of patches cropped from labelled grayscale images.
///
/// Images are read from `<dir>/raw/*.png` and their labels from the file with the same name
/// in `<dir>/labels`, where the value of each label pixel is its class. Every image yields
/// `crops_per_image` items per pass, each one a crop at a position drawn from the seed, the
/// current [pass](ImageSegDataset::epoch_counter) and the item index.
pub struct ImageSegDataset {
    images: Vec<LabelledImage>,
    patch: [usize; 2],
    crops_per_image: usize,
    normalization: NormalizationConfig,
    seed: u64,
    epoch: EpochCounter,
}

impl ImageSegDataset {
    /// Loads the image/label pairs of a directory.
    ///
    /// # Errors
    ///
    /// Fails when no image is found, a label file is missing or doesn't match its image,
    /// an image is smaller than the patch, or a label is not lower than `num_classes`.
    pub fn load(
        directory: &Path,
        patch: [usize; 2],
        crops_per_image: usize,
        num_classes: usize,
        normalization: NormalizationConfig,
        seed: u64,
    ) -> Result<Self, TrainingError> {
        let raw_dir = directory.join("raw");
        let label_dir = directory.join("labels");

        let mut paths = std::fs::read_dir(&raw_dir)?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<Result<Vec<_>, _>>()?;
        paths.retain(|path| path.extension().is_some_and(|ext| ext == "png"));
        paths.sort();

        if paths.is_empty() {
            return Err(TrainingError::Dataset(format!(
                "No image found in '{}'",
                raw_dir.display()
            )));
        }

        let mut images = Vec::with_capacity(paths.len());

        for path in paths {
            let label_path = match path.file_name() {
                Some(name) => label_dir.join(name),
                None => continue,
            };
            if !label_path.exists() {
                return Err(TrainingError::Dataset(format!(
                    "Image '{}' has no label file '{}'",
                    path.display(),
                    label_path.display()
                )));
            }

            let raw = image::open(&path)?.into_luma8();
            let labels = image::open(&label_path)?.into_luma8();
            let image = LabelledImage::from_pair(raw, labels).ok_or_else(|| {
                TrainingError::Dataset(format!(
                    "Image '{}' and its labels have different sizes",
                    path.display()
                ))
            })?;

            if let Some(label) = image.labels.iter().find(|&&l| l as usize >= num_classes) {
                return Err(TrainingError::Dataset(format!(
                    "Labels of '{}' contain class {label} but only {num_classes} classes are trained",
                    path.display()
                )));
            }

            images.push(image);
        }

        log::info!(
            "Loaded {} labelled images from '{}'",
            images.len(),
            directory.display()
        );

        Self::new(images, patch, crops_per_image, normalization, seed)
    }

    fn new(
        images: Vec<LabelledImage>,
        patch: [usize; 2],
        crops_per_image: usize,
        normalization: NormalizationConfig,
        seed: u64,
    ) -> Result<Self, TrainingError> {
        if let Some(image) = images
            .iter()
            .find(|image| image.height < patch[0] || image.width < patch[1])
        {
            return Err(TrainingError::Dataset(format!(
                "Image of size {}x{} is smaller than the {}x{} patch",
                image.height, image.width, patch[0], patch[1]
            )));
        }

        Ok(Self {
            images,
            patch,
            crops_per_image,
            normalization,
            seed,
            epoch: EpochCounter::default(),
        })
    }

    /// Counter of the pass the crops are drawn for, to advance once a pass is over.
    pub fn epoch_counter(&self) -> EpochCounter {
        self.epoch.clone()
    }

    fn crop(&self, index: usize) -> ImageSegItem {
        let image = &self.images[index % self.images.len()];
        let mut rng = item_rng(self.seed, self.epoch.current(), index);

        let [height, width] = self.patch;
        let top = rng.random_range(0..=image.height - height);
        let left = rng.random_range(0..=image.width - width);

        let mut pixels = Vec::with_capacity(height * width);
        let mut labels = Vec::with_capacity(height * width);

        for row in top..top + height {
            let start = row * image.width + left;
            pixels.extend(
                image.pixels[start..start + width]
                    .iter()
                    .map(|value| self.normalization.apply(*value)),
            );
            labels.extend_from_slice(&image.labels[start..start + width]);
        }

        ImageSegItem {
            image: pixels,
            labels,
            height,
            width,
        }
    }
}

impl Dataset<ImageSegItem> for ImageSegDataset {
    fn get(&self, index: usize) -> Option<ImageSegItem> {
        if index >= self.len() {
            return None;
        }

        Some(self.crop(index))
    }

    fn len(&self) -> usize {
        self.images.len() * self.crops_per_image
    }
}

/// Stacks image patches into tensors.
#[derive(Clone, Default)]
pub struct ImageSegBatcher {}

/// A batch of image patches.
#[derive(Clone, Debug)]
pub struct ImageSegBatch<B: Backend> {
    /// Images, `[batch_size, 1, height, width]`.
    pub images: Tensor<B, 4>,
    /// Classes, `[batch_size, height, width]`.
    pub targets: Tensor<B, 3, Int>,
}

impl<B: Backend> Batcher<B, ImageSegItem, ImageSegBatch<B>> for ImageSegBatcher {
    fn batch(&self, items: Vec<ImageSegItem>, device: &B::Device) -> ImageSegBatch<B> {
        let batch_size = items.len();
        let (height, width) = items
            .first()
            .map(|item| (item.height, item.width))
            .unwrap_or((0, 0));
        assert!(
            items
                .iter()
                .all(|item| item.height == height && item.width == width),
            "All patches of a batch must have the same size"
        );

        let images: Vec<f32> = items
            .iter()
            .flat_map(|item| item.image.iter().copied())
            .collect();
        let targets: Vec<i64> = items
            .iter()
            .flat_map(|item| item.labels.iter().copied())
            .collect();

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(images, [batch_size, 1, height, width]).convert::<B::FloatElem>(),
            device,
        );
        let targets = Tensor::<B, 3, Int>::from_data(
            TensorData::new(targets, [batch_size, height, width]).convert::<B::IntElem>(),
            device,
        );

        ImageSegBatch { images, targets }
    }
}
