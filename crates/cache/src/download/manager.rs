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
    collections::{HashMap, HashSet},
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    limiter::RateLimiter,
    task::{DownloadTask, TaskId},
};
use crate::{
    config::{LimiterConfig, SchedulerConfig},
    metrics::TRANSFER_RESTARTS,
};

#[derive(Debug, Default)]
struct Queue {
    order: Vec<TaskId>,
    tasks: HashMap<TaskId, Arc<DownloadTask>>,
}

impl Queue {
    /// Push every task its index.
    fn publish(&self) {
        for (priority, id) in self.order.iter().enumerate() {
            if let Some(task) = self.tasks.get(id) {
                task.set_priority(priority);
            }
        }
    }
}

/// Priority queue of the downloads of one remote service. A task's index in
/// the queue is its priority; only the first `max_parallel` transfer.
#[derive(Debug)]
pub struct DownloadManager {
    client:  String,
    config:  SchedulerConfig,
    limiter: Arc<RateLimiter>,
    queue:   Mutex<Queue>,
    cancel:  CancellationToken,
}

impl DownloadManager {
    pub fn new(client: impl Into<String>, config: SchedulerConfig, limiter: LimiterConfig) -> Self {
        Self {
            client: client.into(),
            config,
            limiter: Arc::new(RateLimiter::new(limiter)),
            queue: Mutex::new(Queue::default()),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn client(&self) -> &str { &self.client }

    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig { &self.config }

    #[must_use]
    pub const fn limiter(&self) -> &Arc<RateLimiter> { &self.limiter }

    /// The task for `id`, appended at the back of the queue if new.
    pub fn register(&self, id: TaskId) -> Arc<DownloadTask> {
        let mut queue = self.queue.lock();
        if let Some(task) = queue.tasks.get(&id) {
            return Arc::clone(task);
        }
        let priority = queue.order.len();
        let task = Arc::new(DownloadTask::new(
            id.clone(),
            priority,
            &self.config,
            &self.cancel,
        ));
        queue.order.push(id.clone());
        queue.tasks.insert(id.clone(), Arc::clone(&task));
        debug!(client = %self.client, task = %id, priority, "registered download task");
        task
    }

    #[must_use]
    pub fn task(&self, id: &TaskId) -> Option<Arc<DownloadTask>> {
        self.queue.lock().tasks.get(id).cloned()
    }

    /// Move exactly `ids`, in order, to the front. Unknown ids are ignored;
    /// the rest keep their relative order.
    pub fn reprioritize(&self, ids: &[TaskId]) {
        let mut queue = self.queue.lock();
        let mut seen = HashSet::new();
        let front: Vec<TaskId> = ids
            .iter()
            .filter(|id| queue.tasks.contains_key(*id) && seen.insert(*id))
            .cloned()
            .collect();
        if queue.order.starts_with(&front) {
            return;
        }
        let rest = queue.order.iter().filter(|id| !front.contains(id)).cloned();
        let order: Vec<TaskId> = front.iter().cloned().chain(rest).collect();
        queue.order = order;
        queue.publish();
        debug!(client = %self.client, front = ?front, "reprioritized downloads");
    }

    #[must_use]
    pub const fn can_download(&self, priority: usize) -> bool { priority < self.config.max_parallel }

    #[must_use]
    pub fn priority_of(&self, id: &TaskId) -> Option<usize> {
        self.queue.lock().order.iter().position(|other| other == id)
    }

    #[must_use]
    pub fn queue(&self) -> Vec<TaskId> { self.queue.lock().order.clone() }

    pub fn remove(&self, id: &TaskId) -> Option<Arc<DownloadTask>> {
        let mut queue = self.queue.lock();
        let task = queue.tasks.remove(id)?;
        queue.order.retain(|other| other != id);
        queue.publish();
        Some(task)
    }

    /// Remove `task` only if it is still the one registered under its id.
    pub(crate) fn remove_task(&self, task: &Arc<DownloadTask>) {
        let mut queue = self.queue.lock();
        if queue
            .tasks
            .get(task.id())
            .is_some_and(|current| Arc::ptr_eq(current, task))
        {
            queue.tasks.remove(task.id());
            queue.order.retain(|other| other != task.id());
            queue.publish();
        }
    }

    /// Restart every attempt the stall rule flags; returns how many.
    pub fn check_stalls(&self) -> usize {
        let tasks: Vec<Arc<DownloadTask>> = self.queue.lock().tasks.values().cloned().collect();
        let throttled = self.limiter.is_throttled();
        let now = Instant::now();
        let mut restarted = 0;
        for task in tasks {
            if let Some(reason) = task.stall_check(&self.config, throttled, now) {
                warn!(
                    client = %self.client,
                    task = %task.id(),
                    %reason,
                    eta = ?task.eta(),
                    "restarting stalled transfer"
                );
                let reason = reason.to_string();
                TRANSFER_RESTARTS
                    .with_label_values(&[self.client.as_str(), reason.as_str()])
                    .inc();
                task.restart_attempt();
                restarted += 1;
            }
        }
        restarted
    }

    /// Periodic stall checks until shutdown or until the manager is dropped.
    pub fn spawn_stall_checker(self: &Arc<Self>) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let period = self.config.check_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        manager.check_stalls();
                    }
                    () = cancel.cancelled() => {
                        break;
                    }
                }
            }
            debug!("stall checker stopped");
        })
    }

    /// Cancel every task and the stall checker.
    pub fn shutdown(&self) {
        info!(client = %self.client, "shutting down download manager");
        self.cancel.cancel();
    }
}
