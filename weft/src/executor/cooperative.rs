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

//! Cooperative executor: resolvers become tasks on the ambient tokio
//! runtime. Suspension happens only inside resolver futures; callback
//! dispatch stays on the driving task, so no locking is needed beyond the
//! completion channel.

use log::debug;

use super::{CompletionSender, ExecutionMode, Executor, ResultSlot, Task, TaskId};

/// Executor that spawns every task on the current tokio runtime.
///
/// Must be used from within a runtime; pair it with `Engine::execute`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CooperativeExecutor;

impl CooperativeExecutor {
    /// A new cooperative executor.
    pub fn new() -> Self {
        CooperativeExecutor
    }
}

impl Executor for CooperativeExecutor {
    fn submit(&self, id: TaskId, task: Task, slot: ResultSlot, done: CompletionSender) {
        tokio::spawn(async move {
            let output = match task {
                Task::Blocking(f) => f(),
                Task::Future(fut) => fut.await,
            };
            *slot.lock().unwrap() = Some(output);
            if done.send(id).is_err() {
                debug!("task {} completed after its workflow was dropped", id);
            }
        });
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Cooperative
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TaskValue;
    use crate::value::Value;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn spawns_tasks_on_the_runtime() {
        let executor = CooperativeExecutor::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let slot: ResultSlot = Arc::new(Mutex::new(None));
        executor.submit(
            0,
            Task::Future(Box::pin(async { Ok(TaskValue::Data(Value::from("hi"))) })),
            slot.clone(),
            tx,
        );
        assert_eq!(rx.recv().await, Some(0));
        assert!(matches!(
            slot.lock().unwrap().take().unwrap().unwrap(),
            TaskValue::Data(Value::String(_))
        ));
    }
}
