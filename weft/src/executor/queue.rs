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

//! Submission tracking: the queue, the task-set forest and the callback
//! registry.
//!
//! The queue is manipulated only from the driving thread. Executors post
//! completions through a channel; the drivers feed them back in via
//! [`Queue::task_done`] and fire the callbacks that became ready.
//! Callbacks attached to one dependency fire in registration order;
//! callbacks attached to different dependencies fire in completion order.
//! A callback may submit new tasks and register further callbacks, which
//! are serviced in the same draining pass.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::Result;

use super::{Executor, Submission, Task, TaskId};

/// Identifier of one task set in the forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskSetId(usize);

/// A callback dependency: a single submission or a whole task set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dep {
    /// Completion of one submitted task.
    Task(TaskId),
    /// Completion of a task set: all of its tasks and all of its forks.
    Set(TaskSetId),
}

struct TaskSetState {
    parent: Option<TaskSetId>,
    pending_tasks: usize,
    pending_forks: usize,
    done: bool,
}

/// Narrow submission capability handed to subquery resolvers: submit into
/// one task set, nothing else.
pub trait SubmitTasks {
    /// Submits a task into the bound task set.
    fn submit(&mut self, task: Task) -> Submission;
}

/// A workflow drivable by the executor drivers: interprets its own step
/// type and produces the final output when the queue drains.
pub trait Workflow: Sized {
    /// Callback payload interpreted by this workflow.
    type Step;
    /// What driving yields.
    type Output;

    /// Interprets one ready step. May write results, submit tasks and
    /// register callbacks.
    fn run_step(&mut self, step: Self::Step, queue: &mut Queue<Self::Step>) -> Result<()>;

    /// Consumes the workflow once the queue drained.
    fn finish(self) -> Result<Self::Output>;
}

/// Tracks submissions and fires callbacks when dependencies complete.
pub struct Queue<C> {
    executor: Arc<dyn Executor>,
    tx: mpsc::UnboundedSender<TaskId>,
    rx: mpsc::UnboundedReceiver<TaskId>,
    next_task: TaskId,
    sets: Vec<TaskSetState>,
    owner: HashMap<TaskId, TaskSetId>,
    callbacks: HashMap<Dep, Vec<C>>,
    completed: HashSet<Dep>,
    ready: VecDeque<C>,
}

impl<C> Queue<C> {
    /// A fresh queue bound to an executor.
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Queue {
            executor,
            tx,
            rx,
            next_task: 0,
            sets: Vec::new(),
            owner: HashMap::new(),
            callbacks: HashMap::new(),
            completed: HashSet::new(),
            ready: VecDeque::new(),
        }
    }

    /// Creates a task set, optionally nested under a parent. The parent
    /// completes only after the child does.
    pub fn fork(&mut self, parent: Option<TaskSetId>) -> TaskSetId {
        let id = TaskSetId(self.sets.len());
        if let Some(parent) = parent {
            self.sets[parent.0].pending_forks += 1;
        }
        self.sets.push(TaskSetState {
            parent,
            pending_tasks: 0,
            pending_forks: 0,
            done: false,
        });
        id
    }

    /// Submits a task into a task set and hands it to the executor.
    pub fn submit(&mut self, set: TaskSetId, task: Task) -> Submission {
        let id = self.next_task;
        self.next_task += 1;
        let (submission, slot) = Submission::new(id);
        self.sets[set.0].pending_tasks += 1;
        self.owner.insert(id, set);
        self.executor.submit(id, task, slot, self.tx.clone());
        submission
    }

    /// A [`SubmitTasks`] scope bound to one task set.
    pub fn scope(&mut self, set: TaskSetId) -> TaskScope<'_, C> {
        TaskScope { queue: self, set }
    }

    /// Registers `callback` to fire once `dep` completes. Fires in the
    /// current draining pass when the dependency already completed.
    pub fn add_callback(&mut self, dep: Dep, callback: C) {
        if self.completed.contains(&dep) {
            self.ready.push_back(callback);
        } else {
            self.callbacks.entry(dep).or_default().push(callback);
        }
    }

    /// Records a task completion reported by the executor.
    pub fn task_done(&mut self, id: TaskId) {
        let dep = Dep::Task(id);
        self.completed.insert(dep.clone());
        if let Some(callbacks) = self.callbacks.remove(&dep) {
            self.ready.extend(callbacks);
        }
        if let Some(set) = self.owner.remove(&id) {
            self.sets[set.0].pending_tasks -= 1;
        }
    }

    /// Completes every task set whose tasks and forks have drained,
    /// cascading to parents. Runs after each serviced step so that sets
    /// populated within one step are judged only once the step finished.
    pub fn settle(&mut self) {
        loop {
            let next = self.sets.iter().position(|s| {
                !s.done && s.pending_tasks == 0 && s.pending_forks == 0
            });
            let idx = match next {
                Some(idx) => idx,
                None => break,
            };
            self.sets[idx].done = true;
            if let Some(parent) = self.sets[idx].parent {
                self.sets[parent.0].pending_forks -= 1;
            }
            let dep = Dep::Set(TaskSetId(idx));
            self.completed.insert(dep.clone());
            if let Some(callbacks) = self.callbacks.remove(&dep) {
                self.ready.extend(callbacks);
            }
        }
    }

    /// True once the task set completed.
    pub fn is_complete(&self, set: TaskSetId) -> bool {
        self.sets[set.0].done
    }

    /// Next ready callback, in firing order.
    pub fn pop_ready(&mut self) -> Option<C> {
        self.ready.pop_front()
    }

    /// Blocks until an executor posts a completion.
    pub fn recv_blocking(&mut self) -> Option<TaskId> {
        self.rx.blocking_recv()
    }

    /// Waits until an executor posts a completion.
    pub async fn recv(&mut self) -> Option<TaskId> {
        self.rx.recv().await
    }

    /// Non-blocking completion poll, used to drain bursts.
    pub fn try_recv(&mut self) -> Option<TaskId> {
        self.rx.try_recv().ok()
    }
}

/// See [`Queue::scope`].
pub struct TaskScope<'a, C> {
    queue: &'a mut Queue<C>,
    set: TaskSetId,
}

impl<C> SubmitTasks for TaskScope<'_, C> {
    fn submit(&mut self, task: Task) -> Submission {
        self.queue.submit(self.set, task)
    }
}
