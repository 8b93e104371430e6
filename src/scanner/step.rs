//! Adaptive block-range width for `eth_getLogs`.
//!
//! The width grows by half after a run of successes and halves after a run
//! of failures, always staying within `[min_step, max_step]`.

/// Bounds and thresholds of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StepBounds {
    pub(crate) initial_step: u64,
    pub(crate) min_step: u64,
    pub(crate) max_step: u64,
    pub(crate) success_threshold: u32,
    pub(crate) failure_threshold: u32,
}

impl Default for StepBounds {
    fn default() -> Self {
        Self {
            initial_step: 200,
            min_step: 10,
            max_step: 2000,
            success_threshold: 5,
            failure_threshold: 1,
        }
    }
}

impl StepBounds {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.min_step == 0 {
            return Err("MIN_STEP must be at least 1".to_string());
        }
        if !(self.min_step <= self.initial_step && self.initial_step <= self.max_step) {
            return Err(format!(
                "expected MIN_STEP <= INITIAL_STEP <= MAX_STEP, got {} / {} / {}",
                self.min_step, self.initial_step, self.max_step
            ));
        }
        if self.success_threshold == 0 || self.failure_threshold == 0 {
            return Err("step thresholds must be at least 1".to_string());
        }
        Ok(())
    }
}

/// A change of width, reported so the caller can log it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StepChange {
    pub(crate) from: u64,
    pub(crate) to: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct StepController {
    bounds: StepBounds,
    step: u64,
    success_count: u32,
    failure_count: u32,
    /// Exclusive upper bound learned from permanent failures.
    ceiling: Option<u64>,
}

impl StepController {
    pub(crate) fn new(bounds: StepBounds) -> Self {
        let step = bounds.initial_step.clamp(bounds.min_step, bounds.max_step);
        Self {
            bounds,
            step,
            success_count: 0,
            failure_count: 0,
            ceiling: None,
        }
    }

    pub(crate) fn step(&self) -> u64 {
        self.step
    }

    fn widest(&self) -> u64 {
        match self.ceiling {
            Some(ceiling) => (ceiling - 1).clamp(self.bounds.min_step, self.bounds.max_step),
            None => self.bounds.max_step,
        }
    }

    fn change_to(&mut self, new_step: u64) -> Option<StepChange> {
        if new_step == self.step {
            return None;
        }
        let change = StepChange {
            from: self.step,
            to: new_step,
        };
        self.step = new_step;
        Some(change)
    }

    pub(crate) fn on_success(&mut self) -> Option<StepChange> {
        self.success_count += 1;
        self.failure_count = 0;
        if self.success_count < self.bounds.success_threshold {
            return None;
        }
        self.success_count = 0;

        let widened = (self.step.saturating_mul(3) / 2)
            .min(self.widest())
            .max(self.step);
        self.change_to(widened)
    }

    pub(crate) fn on_failure(&mut self) -> Option<StepChange> {
        self.failure_count += 1;
        self.success_count = 0;
        if self.failure_count < self.bounds.failure_threshold {
            return None;
        }
        self.failure_count = 0;

        let narrowed = (self.step / 2).max(self.bounds.min_step);
        self.change_to(narrowed)
    }

    /// A request of the current width failed in a way retrying will not fix.
    /// Narrows like [`Self::on_failure`] and never widens back to this width.
    pub(crate) fn on_permanent_failure(&mut self) -> Option<StepChange> {
        let failed_at = self.step;
        self.ceiling = Some(match self.ceiling {
            Some(ceiling) => ceiling.min(failed_at),
            None => failed_at,
        });
        self.on_failure()
    }
}
