/// Point cloud files, chunk sampling and batching.
pub mod data;
/// The point segmentation network.
pub mod model;
/// The epoch loop with running accuracies.
pub mod training;

pub use data::*;
pub use model::*;
pub use training::*;
