use rand::{rngs::StdRng, SeedableRng};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Index of the current pass over a randomly drawn dataset.
///
/// Clones share the same counter: the dataset keeps one, the training loop keeps another
/// and [advances](EpochCounter::advance) it once a pass is over, so the next pass draws new
/// items while a given seed still reproduces the whole run.
#[derive(Clone, Debug, Default)]
pub struct EpochCounter {
    epoch: Arc<AtomicU64>,
}

impl EpochCounter {
    /// The pass items are currently drawn for.
    pub fn current(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Moves to the next pass and returns its index.
    pub fn advance(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Generator of the item `index` drawn during pass `epoch`.
pub(crate) fn item_rng(seed: u64, epoch: u64, index: usize) -> StdRng {
    let stream =
        seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ epoch.wrapping_mul(0xBF58_476D_1CE4_E5B9);

    StdRng::seed_from_u64(stream.wrapping_add(index as u64))
}
