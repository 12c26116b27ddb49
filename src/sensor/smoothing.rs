//! Moving-average activation for noisy digital inputs
//!
//! PIR and LDR inputs are sampled continuously; the sensor is active while
//! the mean of the last `queue_len` samples exceeds `threshold`.

use std::collections::VecDeque;

use super::BinaryState;

#[derive(Debug, Clone)]
pub struct SmoothedInput {
    window: VecDeque<f64>,
    queue_len: usize,
    threshold: f64,
    partial: bool,
    state: Option<BinaryState>,
}

impl SmoothedInput {
    pub fn new(queue_len: usize, threshold: f64, partial: bool) -> Self {
        let queue_len = queue_len.max(1);
        Self {
            window: VecDeque::with_capacity(queue_len),
            queue_len,
            threshold,
            partial,
            state: None,
        }
    }

    /// Adds a sample and reports the new state when it changed
    ///
    /// The first state ever computed only establishes the baseline and is
    /// not reported as a transition.
    pub fn push(&mut self, sample: f64) -> Option<BinaryState> {
        if self.window.len() == self.queue_len {
            self.window.pop_front();
        }
        self.window.push_back(sample);

        let next = BinaryState::from(self.value()? > self.threshold);
        match self.state.replace(next) {
            Some(previous) if previous != next => Some(next),
            _ => None,
        }
    }

    /// Mean of the window, `None` until the window is full (unless partial)
    pub fn value(&self) -> Option<f64> {
        if self.window.is_empty() || (!self.partial && self.window.len() < self.queue_len) {
            return None;
        }
        Some(self.window.iter().sum::<f64>() / self.window.len() as f64)
    }

    pub fn state(&self) -> Option<BinaryState> {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_withhold_value_until_window_is_full() {
        let mut input = SmoothedInput::new(3, 0.5, false);
        assert_eq!(input.push(1.0), None);
        assert_eq!(input.value(), None);
        input.push(1.0);
        input.push(0.0);
        let value = input.value().unwrap();
        assert!((value - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(input.state(), Some(BinaryState::Active));
    }

    #[test]
    fn should_report_value_early_when_partial() {
        let mut input = SmoothedInput::new(5, 0.1, true);
        input.push(0.4);
        assert_eq!(input.value(), Some(0.4));
    }

    #[test]
    fn should_report_only_threshold_crossings() {
        let mut input = SmoothedInput::new(1, 0.5, false);
        assert_eq!(input.push(0.0), None);
        assert_eq!(input.push(0.0), None);
        assert_eq!(input.push(1.0), Some(BinaryState::Active));
        assert_eq!(input.push(1.0), None);
        assert_eq!(input.push(0.0), Some(BinaryState::Inactive));
    }

    #[test]
    fn should_treat_threshold_itself_as_inactive() {
        let mut input = SmoothedInput::new(2, 0.5, false);
        input.push(1.0);
        input.push(0.0);
        assert_eq!(input.state(), Some(BinaryState::Inactive));
    }
}
