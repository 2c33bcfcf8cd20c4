use crate::{
    sampling::{item_rng, EpochCounter},
    TrainingError,
};
use burn::{
    config::Config,
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    prelude::*,
};
use rand::{seq::index::sample, Rng};
use std::path::Path;

/// Number of feature channels of every point. Points carry a constant feature of `1.0`.
pub const FEATURE_CHANNELS: usize = 1;

/// How chunks are cut out of the point clouds.
#[derive(Config, Debug)]
pub struct ChunkSamplingConfig {
    /// Radius of the sphere around the chunk center, in the unit of the coordinates.
    #[config(default = 20000.0)]
    pub radius: f64,
    /// Number of points of every chunk.
    #[config(default = 1000)]
    pub npoints: usize,
    /// Number of chunks making up one epoch.
    #[config(default = 4096)]
    pub epoch_size: usize,
    /// Seed of the chunk sampling.
    #[config(default = 42)]
    pub seed: u64,
}

#[derive(Debug, serde::Deserialize)]
struct PointRecord {
    x: f32,
    y: f32,
    z: f32,
    label: i64,
}

/// A labelled point cloud.
#[derive(Clone, Debug)]
pub struct PointCloud {
    /// Coordinates of the points.
    pub points: Vec<[f32; 3]>,
    /// Class of every point.
    pub labels: Vec<i64>,
}

impl PointCloud {
    /// Reads a cloud from a CSV file with the header `x,y,z,label`.
    ///
    /// # Errors
    ///
    /// Fails when the file is malformed, holds no point, or a label is outside of
    /// `[0, num_classes)`.
    pub fn from_csv(path: &Path, num_classes: usize) -> Result<Self, TrainingError> {
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
        let mut points = Vec::new();
        let mut labels = Vec::new();

        for record in reader.deserialize() {
            let record: PointRecord = record?;

            if ![record.x, record.y, record.z].iter().all(|value| value.is_finite()) {
                return Err(TrainingError::Dataset(format!(
                    "Point cloud '{}' has a non-finite point ({}, {}, {})",
                    path.display(),
                    record.x,
                    record.y,
                    record.z
                )));
            }

            if record.label < 0 || record.label as usize >= num_classes {
                return Err(TrainingError::Dataset(format!(
                    "Point cloud '{}' has label {} but only {num_classes} classes are trained",
                    path.display(),
                    record.label
                )));
            }

            points.push([record.x, record.y, record.z]);
            labels.push(record.label);
        }

        if points.is_empty() {
            return Err(TrainingError::Dataset(format!(
                "Point cloud '{}' has no points",
                path.display()
            )));
        }

        Ok(Self { points, labels })
    }
}

/// A chunk of a point cloud, centered on its centroid.
#[derive(Clone, Debug)]
pub struct PointCloudItem {
    /// Coordinates relative to the centroid of the chunk.
    pub points: Vec<[f32; 3]>,
    /// Point features, [FEATURE_CHANNELS] per point.
    pub features: Vec<f32>,
    /// Class of every point.
    pub labels: Vec<i64>,
}

/// Dataset of chunks sampled from a set of labelled point clouds.
///
/// Each item is drawn with a generator seeded from the sampling seed, the current
/// [epoch](PointCloudDataset::epoch_counter) and the item index: within an epoch the same
/// index always yields the same chunk, and every epoch draws new chunks.
pub struct PointCloudDataset {
    clouds: Vec<PointCloud>,
    sampling: ChunkSamplingConfig,
    epoch: EpochCounter,
}

impl PointCloudDataset {
    /// Creates the dataset from clouds already in memory.
    pub fn new(
        clouds: Vec<PointCloud>,
        sampling: ChunkSamplingConfig,
    ) -> Result<Self, TrainingError> {
        if clouds.is_empty() {
            return Err(TrainingError::Dataset(
                "At least one point cloud is required".to_string(),
            ));
        }
        if let Some(cloud) = clouds
            .iter()
            .find(|cloud| cloud.points.is_empty() || cloud.points.len() != cloud.labels.len())
        {
            return Err(TrainingError::Dataset(format!(
                "Point cloud with {} points and {} labels can't be sampled",
                cloud.points.len(),
                cloud.labels.len()
            )));
        }
        if let Some(point) = clouds
            .iter()
            .flat_map(|cloud| cloud.points.iter())
            .find(|point| !point.iter().all(|value| value.is_finite()))
        {
            return Err(TrainingError::Dataset(format!(
                "Point {point:?} has non-finite coordinates"
            )));
        }
        if !sampling.radius.is_finite() || sampling.radius < 0.0 {
            return Err(TrainingError::Dataset(format!(
                "Chunk radius must be finite and positive, got {}",
                sampling.radius
            )));
        }
        if sampling.npoints == 0 {
            return Err(TrainingError::Dataset(
                "Chunks must have at least one point".to_string(),
            ));
        }

        Ok(Self {
            clouds,
            sampling,
            epoch: EpochCounter::default(),
        })
    }

    /// Counter of the epoch the chunks are drawn for, to advance once an epoch is over.
    pub fn epoch_counter(&self) -> EpochCounter {
        self.epoch.clone()
    }

    /// Loads every `*.csv` file of a directory, see [PointCloud::from_csv].
    pub fn load(
        directory: &Path,
        sampling: ChunkSamplingConfig,
        num_classes: usize,
    ) -> Result<Self, TrainingError> {
        let mut paths = std::fs::read_dir(directory)?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<Result<Vec<_>, _>>()?;
        paths.retain(|path| path.extension().is_some_and(|ext| ext == "csv"));
        paths.sort();

        if paths.is_empty() {
            return Err(TrainingError::Dataset(format!(
                "No point cloud found in '{}'",
                directory.display()
            )));
        }

        let clouds = paths
            .iter()
            .map(|path| PointCloud::from_csv(path, num_classes))
            .collect::<Result<Vec<_>, _>>()?;

        log::info!(
            "Loaded {} point clouds from '{}'",
            clouds.len(),
            directory.display()
        );

        Self::new(clouds, sampling)
    }

    fn sample(&self, index: usize) -> PointCloudItem {
        let mut rng = item_rng(self.sampling.seed, self.epoch.current(), index);

        let cloud = &self.clouds[rng.random_range(0..self.clouds.len())];
        let center = cloud.points[rng.random_range(0..cloud.points.len())];
        let radius_sq = self.sampling.radius * self.sampling.radius;

        // Contains at least the center itself.
        let neighbours: Vec<usize> = cloud
            .points
            .iter()
            .enumerate()
            .filter(|(_, point)| distance_sq(point, &center) <= radius_sq)
            .map(|(i, _)| i)
            .collect();

        let npoints = self.sampling.npoints;
        let chosen: Vec<usize> = if neighbours.len() >= npoints {
            sample(&mut rng, neighbours.len(), npoints)
                .into_iter()
                .map(|i| neighbours[i])
                .collect()
        } else {
            (0..npoints)
                .map(|_| neighbours[rng.random_range(0..neighbours.len())])
                .collect()
        };

        let mut centroid = [0.0f64; 3];
        for &i in chosen.iter() {
            for (axis, value) in centroid.iter_mut().enumerate() {
                *value += cloud.points[i][axis] as f64;
            }
        }
        centroid.iter_mut().for_each(|value| *value /= npoints as f64);

        let points = chosen
            .iter()
            .map(|&i| {
                let point = cloud.points[i];
                [
                    (point[0] as f64 - centroid[0]) as f32,
                    (point[1] as f64 - centroid[1]) as f32,
                    (point[2] as f64 - centroid[2]) as f32,
                ]
            })
            .collect();
        let labels = chosen.iter().map(|&i| cloud.labels[i]).collect();

        PointCloudItem {
            points,
            features: vec![1.0; npoints * FEATURE_CHANNELS],
            labels,
        }
    }
}

fn distance_sq(a: &[f32; 3], b: &[f32; 3]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(a, b)| (*a as f64 - *b as f64).powi(2))
        .sum()
}

impl Dataset<PointCloudItem> for PointCloudDataset {
    fn get(&self, index: usize) -> Option<PointCloudItem> {
        if index >= self.len() {
            return None;
        }

        Some(self.sample(index))
    }

    fn len(&self) -> usize {
        self.sampling.epoch_size
    }
}

/// Stacks point cloud chunks into tensors.
#[derive(Clone, Default)]
pub struct PointCloudBatcher {}

/// A batch of point cloud chunks.
#[derive(Clone, Debug)]
pub struct PointCloudBatch<B: Backend> {
    /// Coordinates, `[batch_size, npoints, 3]`.
    pub points: Tensor<B, 3>,
    /// Features, `[batch_size, npoints, FEATURE_CHANNELS]`.
    pub features: Tensor<B, 3>,
    /// Classes, `[batch_size, npoints]`.
    pub labels: Tensor<B, 2, Int>,
}

impl<B: Backend> Batcher<B, PointCloudItem, PointCloudBatch<B>> for PointCloudBatcher {
    fn batch(&self, items: Vec<PointCloudItem>, device: &B::Device) -> PointCloudBatch<B> {
        let batch_size = items.len();
        let npoints = items.first().map(|item| item.labels.len()).unwrap_or(0);
        assert!(
            items.iter().all(|item| item.labels.len() == npoints),
            "All chunks of a batch must have the same number of points"
        );

        let points: Vec<f32> = items
            .iter()
            .flat_map(|item| item.points.iter().flatten().copied())
            .collect();
        let features: Vec<f32> = items
            .iter()
            .flat_map(|item| item.features.iter().copied())
            .collect();
        let labels: Vec<i64> = items
            .iter()
            .flat_map(|item| item.labels.iter().copied())
            .collect();

        let points = Tensor::<B, 3>::from_data(
            TensorData::new(points, [batch_size, npoints, 3]).convert::<B::FloatElem>(),
            device,
        );
        let features = Tensor::<B, 3>::from_data(
            TensorData::new(features, [batch_size, npoints, FEATURE_CHANNELS])
                .convert::<B::FloatElem>(),
            device,
        );
        let labels = Tensor::<B, 2, Int>::from_data(
            TensorData::new(labels, [batch_size, npoints]).convert::<B::IntElem>(),
            device,
        );

        PointCloudBatch {
            points,
            features,
            labels,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::TestBackend;
    use rstest::rstest;
    use std::fs;

    /// Two well separated clusters of points, labelled by cluster.
    pub(crate) fn two_clusters() -> PointCloud {
        let mut points = Vec::new();
        let mut labels = Vec::new();

        for i in 0..20 {
            let offset = i as f32 * 0.1;
            points.push([offset, 0.0, 0.0]);
            labels.push(0);
            points.push([100.0 + offset, 100.0, 100.0]);
            labels.push(1);
        }

        PointCloud { points, labels }
    }

    fn sampling(npoints: usize) -> ChunkSamplingConfig {
        ChunkSamplingConfig::new()
            .with_radius(10.0)
            .with_npoints(npoints)
            .with_epoch_size(8)
            .with_seed(7)
    }

    #[test]
    fn test_load_csv_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("cell_a.csv"),
            "x,y,z,label\n0.0,0.0,0.0,0\n1.0, 2.0, 3.0, 4\n",
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "not a cloud").unwrap();

        let dataset = PointCloudDataset::load(dir.path(), sampling(4), 5).unwrap();

        assert_eq!(dataset.clouds.len(), 1);
        assert_eq!(dataset.clouds[0].points[1], [1.0, 2.0, 3.0]);
        assert_eq!(dataset.clouds[0].labels, vec![0, 4]);
        assert_eq!(dataset.len(), 8);
    }

    #[test]
    fn test_load_rejects_out_of_range_label() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cell.csv"), "x,y,z,label\n0,0,0,5\n").unwrap();

        let result = PointCloudDataset::load(dir.path(), sampling(4), 5);
        assert!(matches!(result, Err(TrainingError::Dataset(_))));
    }

    #[test]
    fn test_load_rejects_empty_directory() {
        let dir = tempfile::tempdir().unwrap();

        let result = PointCloudDataset::load(dir.path(), sampling(4), 5);
        assert!(matches!(result, Err(TrainingError::Dataset(_))));
    }

    #[test]
    fn test_chunks_stay_within_radius_and_are_centered() {
        let dataset = PointCloudDataset::new(vec![two_clusters()], sampling(16)).unwrap();

        for index in 0..dataset.len() {
            let item = dataset.get(index).unwrap();

            assert_eq!(item.points.len(), 16);
            assert_eq!(item.features, vec![1.0; 16]);
            // A radius of 10 never reaches the other cluster.
            assert!(item.labels.iter().all(|label| *label == item.labels[0]));

            for axis in 0..3 {
                let mean: f32 = item.points.iter().map(|p| p[axis]).sum::<f32>() / 16.0;
                assert!(mean.abs() < 1e-3, "Chunk isn't centered: {mean}");
            }
        }
    }

    #[test]
    fn test_small_neighbourhood_is_sampled_with_replacement() {
        let dataset = PointCloudDataset::new(vec![two_clusters()], sampling(50)).unwrap();
        let item = dataset.get(0).unwrap();

        assert_eq!(item.points.len(), 50);
        assert_eq!(item.labels.len(), 50);
    }

    #[test]
    fn test_sampling_is_deterministic() {
        let dataset = PointCloudDataset::new(vec![two_clusters()], sampling(8)).unwrap();

        assert_eq!(
            dataset.get(3).unwrap().points,
            dataset.get(3).unwrap().points
        );
        assert!(dataset.get(8).is_none());
    }

    #[test]
    fn test_next_epoch_draws_new_chunks() {
        let dataset = PointCloudDataset::new(vec![two_clusters()], sampling(8)).unwrap();
        let chunks = |dataset: &PointCloudDataset| -> Vec<Vec<[f32; 3]>> {
            (0..dataset.len())
                .map(|index| dataset.get(index).unwrap().points)
                .collect()
        };

        let first = chunks(&dataset);
        dataset.epoch_counter().advance();
        let second = chunks(&dataset);
        assert_ne!(first, second);

        // The same seed replays the same epochs.
        let replay = PointCloudDataset::new(vec![two_clusters()], sampling(8)).unwrap();
        assert_eq!(chunks(&replay), first);
        replay.epoch_counter().advance();
        assert_eq!(chunks(&replay), second);
    }

    #[test]
    fn test_load_rejects_non_finite_coordinates() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cell.csv"), "x,y,z,label\n0,0,0,0\nNaN,0,0,0\n").unwrap();

        let result = PointCloudDataset::load(dir.path(), sampling(4), 5);
        assert!(matches!(result, Err(TrainingError::Dataset(_))));
    }

    #[rstest]
    #[case::nan(f64::NAN)]
    #[case::infinite(f64::INFINITY)]
    #[case::negative(-1.0)]
    fn test_new_rejects_invalid_radius(#[case] radius: f64) {
        let result = PointCloudDataset::new(vec![two_clusters()], sampling(4).with_radius(radius));

        assert!(matches!(result, Err(TrainingError::Dataset(_))));
    }

    #[test]
    fn test_new_rejects_non_finite_points() {
        let mut cloud = two_clusters();
        cloud.points[3] = [0.0, f32::INFINITY, 0.0];

        let result = PointCloudDataset::new(vec![cloud], sampling(4));
        assert!(matches!(result, Err(TrainingError::Dataset(_))));
    }

    #[test]
    fn test_batcher_shapes() {
        let device = Default::default();
        let dataset = PointCloudDataset::new(vec![two_clusters()], sampling(6)).unwrap();
        let items = (0..3).filter_map(|i| dataset.get(i)).collect();

        let batch: PointCloudBatch<TestBackend> = PointCloudBatcher::default().batch(items, &device);

        assert_eq!(batch.points.dims(), [3, 6, 3]);
        assert_eq!(batch.features.dims(), [3, 6, FEATURE_CHANNELS]);
        assert_eq!(batch.labels.dims(), [3, 6]);
    }
}
