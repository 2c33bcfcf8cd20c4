#![warn(missing_docs)]

//! Semantic segmentation training for point clouds and 2D images.
//!
//! The crate provides a [confusion matrix](metric::ConfusionMatrix) accumulated batch after
//! batch during an epoch, segmentation metrics derived from it, and two training programs
//! built on burn: a point cloud segmentation loop ([pointcloud]) and a 2D UNet
//! ([image2d]).

#[macro_use]
extern crate derive_new;

mod error;

/// Logging of experiments: process logs, per-epoch accuracy log and progress bar.
pub mod logger;
/// Learning rate schedules.
pub mod lr_scheduler;
/// Accuracy and segmentation metrics.
pub mod metric;
/// Seeding of randomly drawn dataset items.
pub mod sampling;

/// 2D image segmentation with a UNet.
pub mod image2d;
/// Point cloud segmentation.
pub mod pointcloud;

pub use error::*;

#[cfg(test)]
pub(crate) type TestBackend = burn::backend::NdArray<f32>;

#[cfg(test)]
pub(crate) type TestAutodiffBackend = burn::backend::Autodiff<TestBackend>;
