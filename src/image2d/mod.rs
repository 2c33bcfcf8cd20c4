/// PNG image/label pairs, patch cropping and batching.
pub mod data;
/// The UNet.
pub mod model;
/// The step loop with periodic validation.
pub mod training;

pub use data::*;
pub use model::*;
pub use training::*;
