// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{collections::VecDeque, time::Duration};

use tokio::time::Instant;

/// Sliding-window throughput estimate over the last `window` writes.
#[derive(Debug, Clone)]
pub struct EtaEstimator {
    window:  usize,
    samples: VecDeque<(u64, Duration)>,
    last:    Option<Instant>,
}

impl EtaEstimator {
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self {
            window:  window.max(1),
            samples: VecDeque::with_capacity(window.max(1)),
            last:    None,
        }
    }

    /// Drop all samples; the next interval is measured from `now`.
    pub fn reset(&mut self, now: Instant) {
        self.samples.clear();
        self.last = Some(now);
    }

    pub fn record(&mut self, bytes: u64, now: Instant) {
        if let Some(last) = self.last {
            if self.samples.len() == self.window {
                self.samples.pop_front();
            }
            self.samples.push_back((bytes, now.saturating_duration_since(last)));
        }
        self.last = Some(now);
    }

    /// Bytes per second, `None` without measurable progress.
    #[must_use]
    pub fn speed(&self) -> Option<f64> {
        let bytes: u64 = self.samples.iter().map(|(b, _)| b).sum();
        let secs: f64 = self.samples.iter().map(|(_, d)| d.as_secs_f64()).sum();
        (bytes > 0 && secs > 0.0).then(|| bytes as f64 / secs)
    }

    #[must_use]
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let speed = self.speed()?;
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    }
}
