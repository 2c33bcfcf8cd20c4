use burn::{config::Config, lr_scheduler::LrScheduler, tensor::backend::Backend};

/// The configuration for creating a [multi-step learning rate scheduler](MultiStepLrScheduler).
///
/// This scheduler returns the learning rate `initial_lr` from the start and multiplies it by
/// `gamma` each time the number of steps reaches one of the `milestones`. It is stepped
/// once per epoch, the first step giving the learning rate of epoch `0`.
#[derive(Config, Debug)]
pub struct MultiStepLrSchedulerConfig {
    /// The learning rate before the first milestone.
    pub initial_lr: f64,
    /// Strictly increasing step indices at which the learning rate decays.
    pub milestones: Vec<usize>,
    /// The factor applied at each milestone. Default: 0.1.
    #[config(default = 0.1)]
    pub gamma: f64,
}

impl MultiStepLrSchedulerConfig {
    /// Initializes a [multi-step learning rate scheduler](MultiStepLrScheduler).
    ///
    /// # Errors
    ///
    /// An error is returned if the milestones are not strictly increasing.
    pub fn init(&self) -> Result<MultiStepLrScheduler, String> {
        if self.milestones.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(format!(
                "Milestones must be strictly increasing, got {:?}",
                self.milestones
            ));
        }

        Ok(MultiStepLrScheduler {
            init_lr: self.initial_lr,
            milestones: self.milestones.clone(),
            gamma: self.gamma,
            iter_idx: -1,
        })
    }
}

/// Multi-step learning rate scheduler.
#[derive(Clone, Debug)]
pub struct MultiStepLrScheduler {
    init_lr: f64,
    milestones: Vec<usize>,
    gamma: f64,
    // Index of the current step, -1 before the first one.
    iter_idx: i32,
}

impl MultiStepLrScheduler {
    fn decays(&self) -> i32 {
        self.milestones
            .iter()
            .take_while(|milestone| **milestone as i64 <= self.iter_idx as i64)
            .count() as i32
    }
}

impl LrScheduler for MultiStepLrScheduler {
    type Record<B: Backend> = i32;

    fn step(&mut self) -> f64 {
        self.iter_idx = self
            .iter_idx
            .checked_add(1)
            .expect("`.step()` should be called no more than `i32::MAX + 1` times");

        self.init_lr * self.gamma.powi(self.decays())
    }

    fn to_record<B: Backend>(&self) -> Self::Record<B> {
        self.iter_idx
    }

    fn load_record<B: Backend>(mut self, record: Self::Record<B>) -> Self {
        self.iter_idx = record;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;

    const LOOSE_EPSILON: f64 = 1e-10;

    fn check_lr_sequence<S: LrScheduler>(mut scheduler: S, expected_lrs: &[f64]) {
        for (i, expected) in expected_lrs.iter().enumerate() {
            let lr = scheduler.step();
            assert!(
                (lr - expected).abs() < LOOSE_EPSILON,
                "Scheduled learning rate {lr} is not approximately equal to the expected value \
                 {expected} at step {i}",
            );
        }
    }

    #[test]
    fn test_config_rejects_unordered_milestones() {
        assert!(MultiStepLrSchedulerConfig::new(1.0, vec![3, 2]).init().is_err());
        assert!(MultiStepLrSchedulerConfig::new(1.0, vec![2, 2]).init().is_err());
    }

    #[test]
    fn test_config_accepts_empty_milestones() {
        let scheduler = MultiStepLrSchedulerConfig::new(0.3, vec![]).init().unwrap();
        check_lr_sequence(scheduler, &[0.3, 0.3, 0.3]);
    }

    #[test]
    fn test_lr_decays_at_milestones() {
        let scheduler = MultiStepLrSchedulerConfig::new(1e-3, vec![2, 4])
            .init()
            .unwrap();
        check_lr_sequence(scheduler, &[1e-3, 1e-3, 1e-4, 1e-4, 1e-5, 1e-5, 1e-5]);
    }

    #[test]
    fn test_custom_gamma() {
        let scheduler = MultiStepLrSchedulerConfig::new(1.0, vec![1])
            .with_gamma(0.5)
            .init()
            .unwrap();
        check_lr_sequence(scheduler, &[1.0, 0.5, 0.5]);
    }

    #[test]
    fn test_save_and_load() {
        let mut scheduler = MultiStepLrSchedulerConfig::new(1.0, vec![3])
            .init()
            .unwrap();
        let mut truth = scheduler.clone();

        for _ in 0..3 {
            scheduler.step();
            truth.step();
        }

        let record = scheduler.to_record::<TestBackend>();
        let mut scheduler = MultiStepLrSchedulerConfig::new(1.0, vec![3])
            .init()
            .unwrap()
            .load_record::<TestBackend>(record);

        for _ in 0..3 {
            assert_eq!(scheduler.step(), truth.step());
        }
    }
}
