// Copyright (c) 2020-present, UMD Database Group.
//
// This program is free software: you can use, redistribute, and/or modify
// it under the terms of the GNU Affero General Public License, version 3
// or later ("AGPL"), as published by the Free Software Foundation.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

//! Executor contract and the drivers that pump a request to completion.
//!
//! An executor only knows how to run submitted tasks and post their
//! completions on a channel; everything stateful (the queue, the task-set
//! forest, callback dispatch) stays on the driving side. Two backends
//! implement the contract: a thread pool ([`threads::ThreadsExecutor`])
//! and a cooperative single-threaded one
//! ([`cooperative::CooperativeExecutor`]). Either way the queue observes
//! completions through the same channel, and the two drivers
//! ([`process_blocking`] and [`process`]) share all dispatch logic.

pub mod cooperative;
pub mod queue;
pub mod threads;

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use log::warn;
use tokio::sync::mpsc;

use crate::error::{Result, WeftError};
use crate::value::Value;

use self::queue::{Queue, TaskSetId, Workflow};

/// Identifier of one submitted task, unique per request.
pub type TaskId = usize;

/// What a completed task produced.
pub enum TaskValue {
    /// A materialized value.
    Data(Value),
    /// A lazily-produced value. Deprecated: the completion callback
    /// materializes it and logs a warning; resolvers should return
    /// materialized data.
    Deferred(Box<dyn FnOnce() -> Result<Value> + Send>),
}

impl TaskValue {
    /// Materializes the value, logging the deprecation warning for the
    /// deferred form.
    pub fn materialize(self) -> Result<Value> {
        match self {
            TaskValue::Data(value) => Ok(value),
            TaskValue::Deferred(thunk) => {
                warn!(
                    "resolver returned a deferred value; data loading functions \
                     should return materialized data"
                );
                thunk()
            }
        }
    }
}

impl std::fmt::Debug for TaskValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskValue::Data(v) => f.debug_tuple("Data").field(v).finish(),
            TaskValue::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// A unit of work handed to an executor.
pub enum Task {
    /// A closure that may block; runs on a worker thread under the
    /// thread-pool backend.
    Blocking(Box<dyn FnOnce() -> Result<TaskValue> + Send>),
    /// A future; awaited as a task under the cooperative backend, driven
    /// to completion on a worker under the thread-pool backend.
    Future(BoxFuture<'static, Result<TaskValue>>),
}

/// Shared slot an executor writes a task's output into before posting the
/// completion.
pub type ResultSlot = Arc<Mutex<Option<Result<TaskValue>>>>;

/// Sending side of the completion channel.
pub type CompletionSender = mpsc::UnboundedSender<TaskId>;

/// Handle to one submitted task.
#[derive(Clone)]
pub struct Submission {
    /// Task identifier, usable as a callback dependency.
    pub id: TaskId,
    slot: ResultSlot,
}

impl Submission {
    pub(crate) fn new(id: TaskId) -> (Self, ResultSlot) {
        let slot: ResultSlot = Arc::new(Mutex::new(None));
        (
            Submission {
                id,
                slot: slot.clone(),
            },
            slot,
        )
    }

    /// Takes the completed output. Must only be called after the queue
    /// observed the completion; the output can be taken once.
    pub fn result(&self) -> Result<TaskValue> {
        self.slot
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| {
                Err(WeftError::Internal(format!(
                    "result of task {} is not ready or was already taken",
                    self.id
                )))
            })
    }
}

impl std::fmt::Debug for Submission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submission").field("id", &self.id).finish()
    }
}

/// How an executor runs its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Tasks run on worker threads; the caller thread drives dispatch.
    Blocking,
    /// Tasks run on the ambient event loop; driving must be awaited.
    Cooperative,
}

/// Abstracts how resolver callables run.
pub trait Executor: Send + Sync {
    /// Runs `task`, stores its output in `slot` and posts `id` on `done`.
    fn submit(&self, id: TaskId, task: Task, slot: ResultSlot, done: CompletionSender);

    /// The execution mode of this backend.
    fn mode(&self) -> ExecutionMode;
}

/// Drives a workflow to completion on the calling thread.
///
/// Pulls completions off the queue, fires ready callbacks in order and
/// returns the workflow's output once the root task set drains. Intended
/// for [`ExecutionMode::Blocking`] executors.
pub fn process_blocking<W: Workflow>(
    mut queue: Queue<W::Step>,
    mut workflow: W,
    root: TaskSetId,
) -> Result<W::Output> {
    queue.settle();
    loop {
        while let Some(step) = queue.pop_ready() {
            workflow.run_step(step, &mut queue)?;
            queue.settle();
        }
        if queue.is_complete(root) {
            break;
        }
        let id = queue
            .recv_blocking()
            .ok_or_else(|| WeftError::Internal("completion channel closed".to_owned()))?;
        queue.task_done(id);
        while let Some(id) = queue.try_recv() {
            queue.task_done(id);
        }
        queue.settle();
    }
    workflow.finish()
}

/// Drives a workflow to completion cooperatively.
///
/// Identical dispatch logic to [`process_blocking`], suspending instead of
/// blocking while waiting for completions.
pub async fn process<W: Workflow>(
    mut queue: Queue<W::Step>,
    mut workflow: W,
    root: TaskSetId,
) -> Result<W::Output> {
    queue.settle();
    loop {
        while let Some(step) = queue.pop_ready() {
            workflow.run_step(step, &mut queue)?;
            queue.settle();
        }
        if queue.is_complete(root) {
            break;
        }
        let id = queue
            .recv()
            .await
            .ok_or_else(|| WeftError::Internal("completion channel closed".to_owned()))?;
        queue.task_done(id);
        while let Some(id) = queue.try_recv() {
            queue.task_done(id);
        }
        queue.settle();
    }
    workflow.finish()
}
