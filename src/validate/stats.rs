//! Rolling windows for the statistical rule class.
//!
//! One window per `(table, column)` holding the last K committed values.
//! Windows live for the duration of a job only.

use std::collections::{HashMap, VecDeque};

/// Fewer samples than this never produce a z-score.
pub const MIN_SAMPLES: usize = 10;

#[derive(Debug, Clone)]
pub struct RollingWindow {
    values: VecDeque<f64>,
    capacity: usize,
    sum: f64,
    sum_sq: f64,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        if self.values.len() == self.capacity {
            if let Some(old) = self.values.pop_front() {
                self.sum -= old;
                self.sum_sq -= old * old;
            }
        }
        self.values.push_back(value);
        self.sum += value;
        self.sum_sq += value * value;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> Option<f64> {
        (!self.values.is_empty()).then(|| self.sum / self.values.len() as f64)
    }

    /// Sample standard deviation.
    pub fn std_dev(&self) -> Option<f64> {
        let n = self.values.len();
        if n < 2 {
            return None;
        }
        let mean = self.sum / n as f64;
        let var = (self.sum_sq - n as f64 * mean * mean) / (n as f64 - 1.0);
        Some(var.max(0.0).sqrt())
    }

    /// z-score of `value` against the window, once it has enough samples
    /// and non-zero spread.
    pub fn zscore(&self, value: f64) -> Option<f64> {
        if self.values.len() < MIN_SAMPLES {
            return None;
        }
        let mean = self.mean()?;
        let std = self.std_dev()?;
        if std <= f64::EPSILON {
            return None;
        }
        Some((value - mean) / std)
    }
}

/// Windows for the tracked columns of one table.
#[derive(Debug, Clone, Default)]
pub struct TableStats {
    capacity: usize,
    windows: HashMap<String, RollingWindow>,
}

impl TableStats {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            windows: HashMap::new(),
        }
    }

    pub fn observe(&mut self, column: &str, value: f64) {
        let capacity = self.capacity;
        self.windows
            .entry(column.to_string())
            .or_insert_with(|| RollingWindow::new(capacity))
            .push(value);
    }

    pub fn zscore(&self, column: &str, value: f64) -> Option<f64> {
        self.windows.get(column)?.zscore(value)
    }

    pub fn window(&self, column: &str) -> Option<&RollingWindow> {
        self.windows.get(column)
    }
}
