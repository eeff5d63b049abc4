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

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::LimiterConfig,
    error::{CancelledSnafu, Result},
};

#[derive(Debug)]
struct LimiterState {
    next_slot:       Instant,
    throttled_until: Option<Instant>,
    penalty:         Duration,
}

/// Spaces request starts for every task of one download manager.
#[derive(Debug)]
pub struct RateLimiter {
    config: LimiterConfig,
    state:  Mutex<LimiterState>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: LimiterConfig) -> Self {
        let first = Instant::now() + config.min_delay;
        Self {
            config,
            state: Mutex::new(LimiterState {
                next_slot:       first,
                throttled_until: None,
                penalty:         Duration::ZERO,
            }),
        }
    }

    /// Reserve the next start slot and sleep until it.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        let slot = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let mut slot = state.next_slot.max(now);
            if !state.penalty.is_zero() {
                slot += std::mem::take(&mut state.penalty);
            }
            let interval = if state.throttled_until.is_some_and(|until| until > now) {
                self.config.throttled_interval
            } else {
                state.throttled_until = None;
                self.config.min_interval
            };
            state.next_slot = slot + interval;
            slot
        };
        if slot > Instant::now() {
            debug!(wait = ?slot.saturating_duration_since(Instant::now()), "waiting for request slot");
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => CancelledSnafu.fail(),
            () = sleep_until(slot) => Ok(()),
        }
    }

    /// A 429 stretches the spacing for the cooldown window.
    pub fn throttle(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.throttled_until = Some(now + self.config.throttle_cooldown);
        state.next_slot = state.next_slot.max(now + self.config.throttled_interval);
        warn!(
            cooldown = ?self.config.throttle_cooldown,
            interval = ?self.config.throttled_interval,
            "throttled by remote, slowing down"
        );
    }

    /// A 5xx delays the next request once.
    pub fn penalize(&self) {
        let mut state = self.state.lock();
        state.penalty = self.config.server_error_delay;
        warn!(delay = ?self.config.server_error_delay, "server error, delaying next request");
    }

    #[must_use]
    pub fn is_throttled(&self) -> bool {
        self.state
            .lock()
            .throttled_until
            .is_some_and(|until| until > Instant::now())
    }
}
