//! Learning rate schedule: linear warmup, then linear decay to zero.

/// Linear warmup followed by linear decay.
#[derive(Clone, Debug)]
pub struct LinearSchedule {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl LinearSchedule {
    /// `warmup_ratio` of `total_steps` (rounded up) is spent warming up.
    pub fn new(base_lr: f64, total_steps: usize, warmup_ratio: f64) -> Self {
        let warmup_steps = (total_steps as f64 * warmup_ratio).ceil() as usize;
        Self {
            base_lr,
            warmup_steps,
            total_steps,
        }
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }

    /// Learning rate for the update that follows `step` completed updates.
    pub fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps as f64;
        }
        let remaining = self.total_steps.saturating_sub(step) as f64;
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        self.base_lr * (remaining / decay_steps).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_then_decay() {
        let schedule = LinearSchedule::new(1e-3, 100, 0.1);
        assert_eq!(schedule.warmup_steps(), 10);
        assert_eq!(schedule.lr_at(0), 0.0);
        assert!((schedule.lr_at(5) - 5e-4).abs() < 1e-12);
        assert!((schedule.lr_at(10) - 1e-3).abs() < 1e-12);
        assert!((schedule.lr_at(55) - 5e-4).abs() < 1e-12);
        assert_eq!(schedule.lr_at(100), 0.0);
        assert_eq!(schedule.lr_at(150), 0.0);
    }

    #[test]
    fn test_no_warmup() {
        let schedule = LinearSchedule::new(2e-5, 4, 0.0);
        assert_eq!(schedule.warmup_steps(), 0);
        assert!((schedule.lr_at(0) - 2e-5).abs() < 1e-15);
        assert!((schedule.lr_at(2) - 1e-5).abs() < 1e-15);
    }

    #[test]
    fn test_warmup_rounds_up() {
        let schedule = LinearSchedule::new(1.0, 15, 0.1);
        assert_eq!(schedule.warmup_steps(), 2);
    }
}
