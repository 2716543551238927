use std::collections::VecDeque;
use std::time::{Duration, Instant};

use ndarray::{ArrayView3, Zip};

/// Rolling window of per-step loss values.
pub struct LossWindow {
    losses: VecDeque<f32>,
    capacity: usize,
    total_steps: usize, // lifetime count, never capped
}

impl LossWindow {
    pub fn with_capacity(capacity: usize) -> Self {
        LossWindow {
            losses: VecDeque::with_capacity(capacity),
            capacity,
            total_steps: 0,
        }
    }

    pub fn new() -> Self {
        Self::with_capacity(100)
    }

    pub fn record(&mut self, loss: f32) {
        self.total_steps += 1;
        self.losses.push_back(loss);
        if self.losses.len() > self.capacity {
            self.losses.pop_front();
        }
    }

    /// Average loss over the last N steps.
    pub fn average(&self, last_n: usize) -> f32 {
        let n = self.losses.len().min(last_n);
        if n == 0 {
            return 0.0;
        }
        let sum: f32 = self.losses.iter().rev().take(n).sum();
        sum / n as f32
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }
}

impl Default for LossWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Optimizer-step timing, with validation and checkpoint time excluded
/// from throughput.
pub struct StepTiming {
    step_micros: VecDeque<u32>,
    capacity: usize,
    window_start: Instant,
    window_count: usize,
    window_overhead_micros: u128,
}

impl StepTiming {
    pub fn new() -> Self {
        StepTiming {
            step_micros: VecDeque::with_capacity(100),
            capacity: 100,
            window_start: Instant::now(),
            window_count: 0,
            window_overhead_micros: 0,
        }
    }

    pub fn record_step(&mut self, d: Duration) {
        self.step_micros.push_back(d.as_micros() as u32);
        if self.step_micros.len() > self.capacity {
            self.step_micros.pop_front();
        }
        self.window_count += 1;
    }

    pub fn record_overhead(&mut self, d: Duration) {
        self.window_overhead_micros += d.as_micros();
    }

    /// Mean of the last `last_n` step times in milliseconds.
    pub fn avg_step_ms(&self, last_n: usize) -> f32 {
        let n = self.step_micros.len().min(last_n);
        if n == 0 {
            return 0.0;
        }
        let window = self.step_micros.iter().rev().take(n);
        let recent: f64 = window.map(|&v| v as f64).sum();
        let mean = recent / n as f64;
        (mean / 1000.0) as f32
    }

    pub fn steps_per_sec(&self) -> f32 {
        let total_micros = self.window_start.elapsed().as_micros();
        let net_micros = total_micros.saturating_sub(self.window_overhead_micros);
        if net_micros == 0 {
            return 0.0;
        }
        self.window_count as f32 / (net_micros as f32 / 1_000_000.0)
    }

    pub fn reset_window(&mut self) {
        self.window_start = Instant::now();
        self.window_count = 0;
        self.window_overhead_micros = 0;
    }
}

impl Default for StepTiming {
    fn default() -> Self {
        Self::new()
    }
}

/// Mean intersection-over-union over `classes`.
///
/// Classes absent from both volumes are skipped; with nothing left to score
/// the subject counts as a perfect 1.0.
pub fn mean_iou(
    prediction: ArrayView3<u8>,
    reference: ArrayView3<u8>,
    classes: &[u8],
) -> f64 {
    let mut scores = Vec::with_capacity(classes.len());
    for &class in classes {
        let mut intersection = 0usize;
        let mut union = 0usize;
        Zip::from(&prediction).and(&reference).for_each(|&p, &r| {
            let (p, r) = (p == class, r == class);
            intersection += usize::from(p && r);
            union += usize::from(p || r);
        });
        if union > 0 {
            scores.push(intersection as f64 / union as f64);
        }
    }
    if scores.is_empty() {
        1.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

/// Mean of per-subject scores; 0 for an empty partition.
pub fn partition_mean(scores: &[f64]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.iter().sum::<f64>() / scores.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr3, Array3};

    #[test]
    fn test_average_loss() {
        let mut m = LossWindow::new();
        m.record(1.0);
        m.record(3.0);
        assert!((m.average(10) - 2.0).abs() < 1e-6);
        assert!((m.average(1) - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_window_is_capped_but_total_is_not() {
        let mut m = LossWindow::with_capacity(2);
        for v in [10.0, 1.0, 3.0] {
            m.record(v);
        }
        assert_eq!(m.total_steps(), 3);
        assert!((m.average(100) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_timing_avg_step_ms_last_n() {
        let mut t = StepTiming::new();
        t.record_step(Duration::from_micros(1000));
        t.record_step(Duration::from_micros(9000));
        t.record_step(Duration::from_micros(5000));
        assert!((t.avg_step_ms(1) - 5.0).abs() < 1e-3);
        assert!((t.avg_step_ms(100) - 5.0).abs() < 1e-3);
    }

    #[test]
    fn test_overhead_excluded_from_throughput() {
        let mut t = StepTiming::new();
        for _ in 0..10 {
            t.record_step(Duration::from_micros(1000));
        }
        t.record_overhead(Duration::from_secs(9999));
        assert_eq!(t.steps_per_sec(), 0.0);

        t.reset_window();
        t.record_step(Duration::from_micros(1000));
        std::thread::sleep(Duration::from_millis(5));
        assert!(t.steps_per_sec() > 0.0);
    }

    #[test]
    fn test_iou_per_class_mean() {
        let reference = arr3(&[[[0u8, 1, 1, 2]]]);
        let prediction = arr3(&[[[0u8, 1, 0, 2]]]);
        // class 1: 1/2, class 2: 1/1
        let iou = mean_iou(prediction.view(), reference.view(), &[1, 2]);
        assert!((iou - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_iou_skips_absent_classes() {
        let reference = arr3(&[[[0u8, 1]]]);
        let iou = mean_iou(reference.view(), reference.view(), &[1, 3]);
        assert_eq!(iou, 1.0);

        let empty = Array3::<u8>::zeros((1, 1, 2));
        assert_eq!(mean_iou(empty.view(), empty.view(), &[1]), 1.0);
        assert_eq!(mean_iou(empty.view(), reference.view(), &[1]), 0.0);
    }

    #[test]
    fn test_partition_mean() {
        assert_eq!(partition_mean(&[]), 0.0);
        assert!((partition_mean(&[0.5, 1.0]) - 0.75).abs() < 1e-12);
    }
}
