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

//! The transfer loop feeding one cache file from its remote.

use std::sync::Arc;

use backon::{ExponentialBuilder, Retryable};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::task::{DownloadTask, TaskState};
use crate::{
    entry::Entry,
    error::{CacheError, CancelledSnafu, Result},
    file::{AppendOutcome, CacheFile},
    metrics::{ACTIVE_TRANSFERS, THROTTLED, TRANSFER_RESTARTS},
    source::FetchRequest,
};

enum Step {
    /// Ask the file for the next position and issue a new request
    Restart,
    Finished,
}

/// Drive `task` until the file is complete, the task is cancelled or a
/// non-retryable error occurs.
pub(crate) async fn run(entry: Arc<Entry>, task: Arc<DownloadTask>) {
    let Ok(file) = entry.file() else {
        task.set_state(TaskState::Failed);
        entry.finish_transfer(&task);
        return;
    };
    let client = entry.manager().client().to_string();
    ACTIVE_TRANSFERS.with_label_values(&[client.as_str()]).inc();
    let result = drive(&entry, &task, &file).await;
    ACTIVE_TRANSFERS.with_label_values(&[client.as_str()]).dec();
    file.end_transfer();

    match result {
        Ok(()) => {
            info!(key = %entry.key(), size = file.full_size(), "download complete");
            if let Err(e) = on_complete(&entry).await {
                warn!(key = %entry.key(), error = %e, "post-download bookkeeping failed");
            }
            task.set_state(TaskState::Done);
        }
        Err(e) if e.is_quiet() => {
            debug!(key = %entry.key(), error = %e, "transfer stopped");
            task.set_state(TaskState::Failed);
        }
        Err(e) => {
            task.set_state(TaskState::Failed);
            entry.mark_failed(&e);
        }
    }
    entry.finish_transfer(&task);
}

async fn drive(entry: &Entry, task: &DownloadTask, file: &Arc<dyn CacheFile>) -> Result<()> {
    let manager = entry.manager();
    let client = manager.client();
    let limiter = manager.limiter();
    let config = manager.config();
    // A second 416 in a row after re-resolving is final.
    let mut re_resolved = false;
    loop {
        // Network errors, whether sending the request or reading the body,
        // resume from wherever the file got to.
        let backoff = ExponentialBuilder::default()
            .with_max_times(usize::MAX)
            .with_min_delay(config.retry_min_delay)
            .with_max_delay(config.retry_max_delay);
        let step = (|| attempt(entry, task, file.as_ref()))
            .retry(backoff)
            .when(|e| matches!(e, CacheError::Network { .. }) && !task.is_cancelled())
            .notify(|e, delay| {
                TRANSFER_RESTARTS.with_label_values(&[client, "network"]).inc();
                warn!(key = %entry.key(), error = %e, ?delay, "transfer interrupted, retrying");
            })
            .await;
        match step {
            Ok(Step::Finished) => return Ok(()),
            Ok(Step::Restart) => re_resolved = false,
            Err(CacheError::Cancelled) if !task.is_cancelled() => {
                debug!(key = %entry.key(), "attempt restarted");
            }
            Err(e @ CacheError::Throttled { .. }) => {
                THROTTLED.with_label_values(&[client]).inc();
                limiter.throttle();
                task.set_state(TaskState::Cooling);
                debug!(key = %entry.key(), error = %e, "cooling down");
            }
            Err(e @ CacheError::ResourceUnavailable { .. }) => {
                limiter.penalize();
                task.set_state(TaskState::Cooling);
                debug!(key = %entry.key(), error = %e, "cooling down");
            }
            Err(e @ CacheError::RangeNotSatisfiable { .. }) if !re_resolved => {
                warn!(key = %entry.key(), error = %e, "range rejected, re-resolving remote");
                re_resolved = true;
                entry.resolve(true).await?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// One request from the file's current resume point.
async fn attempt(entry: &Entry, task: &DownloadTask, file: &dyn CacheFile) -> Result<Step> {
    task.wait_for_slot().await?;
    let Some(position) = file.begin_transfer() else {
        return Ok(Step::Finished);
    };
    let token = task.begin_attempt(position);
    attempt_at(entry, task, file, position, &token).await
}

async fn attempt_at(
    entry: &Entry,
    task: &DownloadTask,
    file: &dyn CacheFile,
    mut position: u64,
    attempt: &CancellationToken,
) -> Result<Step> {
    let manager = entry.manager();
    manager.limiter().acquire(attempt).await?;

    let remote = match entry.remote() {
        Some(remote) => remote,
        None => entry.resolve(false).await?,
    };
    let request = FetchRequest::builder()
        .url(remote.url)
        .maybe_referer(remote.referer)
        .offset(position)
        .build();

    let mut body = tokio::select! {
        biased;
        () = attempt.cancelled() => return CancelledSnafu.fail(),
        body = entry.source().fetch(&request) => body?,
    };
    task.set_state(TaskState::Downloading);
    debug!(key = %entry.key(), position, offset = body.offset(), "receiving body");

    loop {
        let chunk = tokio::select! {
            biased;
            () = attempt.cancelled() => return CancelledSnafu.fail(),
            chunk = body.next_chunk() => chunk?,
        };
        let Some(chunk) = chunk else {
            debug!(key = %entry.key(), position, "response ended early");
            return Ok(Step::Restart);
        };
        let len = chunk.len() as u64;
        task.write(position, len).await?;
        match file.append(position, &chunk)? {
            AppendOutcome::Continue => position += len,
            AppendOutcome::Finished => return Ok(Step::Finished),
            AppendOutcome::RestartAt(next) => {
                debug!(key = %entry.key(), position, next, "transfer redirected");
                TRANSFER_RESTARTS
                    .with_label_values(&[manager.client(), "seek"])
                    .inc();
                return Ok(Step::Restart);
            }
        }
    }
}

async fn on_complete(entry: &Entry) -> Result<()> {
    let ctx = entry.context();
    ctx.meta.set_partial(entry.key(), false).await?;
    ctx.evictor
        .enforce(&entry.key().kind, |key| ctx.active.contains(key))
        .await?;
    Ok(())
}
