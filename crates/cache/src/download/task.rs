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

use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use strum_macros::{Display, EnumString};
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

use super::eta::EtaEstimator;
use crate::{
    config::SchedulerConfig,
    error::{CancelledSnafu, Result},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(String);

impl TaskId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }

    #[must_use]
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self { Self::new(value) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum TaskState {
    Initial,
    /// Waiting for a priority below the parallelism limit
    Pending,
    Requesting,
    Downloading,
    Done,
    Failed,
    /// Backing off after a 429 or 5xx
    Cooling,
}

impl TaskState {
    #[must_use]
    pub const fn is_terminal(self) -> bool { matches!(self, Self::Done | Self::Failed) }
}

/// Why the stall checker restarted an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum StallReason {
    TooSlow,
    Deadline,
}

#[derive(Debug)]
struct Progress {
    eta:             EtaEstimator,
    attempt_started: Option<Instant>,
    position:        u64,
    deadline:        Option<Instant>,
    goal:            Option<u64>,
}

/// One in-flight download. Its priority is its index in the manager's queue,
/// delivered through a latest-value-wins mailbox.
#[derive(Debug)]
pub struct DownloadTask {
    id:           TaskId,
    max_parallel: usize,
    priority:     watch::Sender<usize>,
    state:        watch::Sender<TaskState>,
    progress:     Mutex<Progress>,
    cancel:       CancellationToken,
    attempt:      Mutex<CancellationToken>,
    started:      AtomicBool,
}

impl DownloadTask {
    pub(crate) fn new(
        id: TaskId,
        priority: usize,
        config: &SchedulerConfig,
        parent: &CancellationToken,
    ) -> Self {
        let (priority, _) = watch::channel(priority);
        let (state, _) = watch::channel(TaskState::Initial);
        let cancel = parent.child_token();
        Self {
            id,
            max_parallel: config.max_parallel,
            priority,
            state,
            progress: Mutex::new(Progress {
                eta:             EtaEstimator::new(config.eta_window),
                attempt_started: None,
                position:        0,
                deadline:        None,
                goal:            None,
            }),
            attempt: Mutex::new(cancel.child_token()),
            cancel,
            started: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &TaskId { &self.id }

    #[must_use]
    pub fn priority(&self) -> usize { *self.priority.borrow() }

    /// Deliver a new priority; only the latest value is ever observed.
    pub(crate) fn set_priority(&self, priority: usize) {
        self.priority.send_if_modified(|current| {
            let changed = *current != priority;
            *current = priority;
            changed
        });
    }

    #[must_use]
    pub fn can_run(&self) -> bool { self.priority() < self.max_parallel }

    #[must_use]
    pub fn state(&self) -> TaskState { *self.state.borrow() }

    pub fn subscribe(&self) -> watch::Receiver<TaskState> { self.state.subscribe() }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    /// Claim the right to run the transfer; true exactly once.
    pub(crate) fn try_start(&self) -> bool { !self.started.swap(true, Ordering::AcqRel) }

    pub fn cancel(&self) { self.cancel.cancel(); }

    #[must_use]
    pub fn is_cancelled(&self) -> bool { self.cancel.is_cancelled() }

    pub(crate) const fn cancel_token(&self) -> &CancellationToken { &self.cancel }

    /// Block until the task's priority allows transferring.
    pub async fn wait_for_slot(&self) -> Result<()> {
        if self.can_run() {
            return Ok(());
        }
        self.set_state(TaskState::Pending);
        let mut rx = self.priority.subscribe();
        let max_parallel = self.max_parallel;
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => CancelledSnafu.fail(),
            promoted = rx.wait_for(|p| *p < max_parallel) => {
                promoted.map(|_| ()).map_err(|_| crate::error::CacheError::Cancelled)
            }
        }
    }

    /// Start a new attempt at `position`; the returned token fires when the
    /// stall checker restarts it or the task is cancelled.
    pub(crate) fn begin_attempt(&self, position: u64) -> CancellationToken {
        let token = self.cancel.child_token();
        *self.attempt.lock() = token.clone();
        let now = Instant::now();
        let mut progress = self.progress.lock();
        progress.attempt_started = Some(now);
        progress.position = position;
        progress.eta.reset(now);
        drop(progress);
        self.set_state(TaskState::Requesting);
        token
    }

    /// Abort the running attempt so the transfer reissues its request.
    pub fn restart_attempt(&self) { self.attempt.lock().cancel(); }

    /// Account for `len` bytes about to be stored at `position`, yielding
    /// first if the task was pushed out of the parallel window.
    pub async fn write(&self, position: u64, len: u64) -> Result<()> {
        if !self.can_run() {
            self.progress.lock().eta.reset(Instant::now());
            self.wait_for_slot().await?;
            self.progress.lock().eta.reset(Instant::now());
            self.set_state(TaskState::Downloading);
        }
        let mut progress = self.progress.lock();
        progress.eta.record(len, Instant::now());
        progress.position = position + len;
        Ok(())
    }

    /// The content up to `goal` is needed by `deadline`.
    pub fn set_deadline(&self, deadline: Instant, goal: u64) {
        let mut progress = self.progress.lock();
        progress.deadline = Some(deadline);
        progress.goal = Some(goal);
    }

    #[must_use]
    pub fn position(&self) -> u64 { self.progress.lock().position }

    /// Projected time to reach the goal set by [`Self::set_deadline`].
    #[must_use]
    pub fn eta(&self) -> Option<Duration> {
        let progress = self.progress.lock();
        let goal = progress.goal?;
        progress.eta.eta(goal.saturating_sub(progress.position))
    }

    /// Decide whether the running attempt should be restarted.
    pub(crate) fn stall_check(
        &self,
        config: &SchedulerConfig,
        throttled: bool,
        now: Instant,
    ) -> Option<StallReason> {
        if throttled || self.state() != TaskState::Downloading {
            return None;
        }
        let progress = self.progress.lock();
        let running = now.saturating_duration_since(progress.attempt_started?);
        if running < config.min_run {
            return None;
        }
        if progress.goal.is_some_and(|goal| progress.position >= goal) {
            return None;
        }
        if running > config.too_slow {
            return Some(StallReason::TooSlow);
        }
        let (deadline, goal) = (progress.deadline?, progress.goal?);
        let remaining = goal.saturating_sub(progress.position);
        let finish = match progress.eta.eta(remaining) {
            Some(eta) => now + eta,
            // No measurable throughput at all.
            None => now + config.too_slow,
        };
        (finish > deadline + config.deadline_bias).then_some(StallReason::Deadline)
    }
}
