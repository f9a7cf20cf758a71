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

//! Thread-pool executor: resolvers run on rayon workers and may block.

use log::debug;
use rayon::ThreadPool;

use crate::config::WEFT_CONF;
use crate::error::{Result, WeftError};

use super::{CompletionSender, ExecutionMode, Executor, ResultSlot, Task, TaskId};

/// Executor backed by a rayon thread pool.
pub struct ThreadsExecutor {
    pool: ThreadPool,
}

impl ThreadsExecutor {
    /// A pool of `threads` workers.
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("weft-worker-{}", i))
            .build()
            .map_err(|e| WeftError::Execution(e.to_string()))?;
        Ok(ThreadsExecutor { pool })
    }

    /// A pool sized from [`WEFT_CONF`].
    pub fn with_default_pool() -> Result<Self> {
        ThreadsExecutor::new(WEFT_CONF.worker_threads)
    }
}

impl Executor for ThreadsExecutor {
    fn submit(&self, id: TaskId, task: Task, slot: ResultSlot, done: CompletionSender) {
        self.pool.spawn(move || {
            let output = match task {
                Task::Blocking(f) => f(),
                // a future submitted to the pool is driven on the worker
                Task::Future(fut) => futures::executor::block_on(fut),
            };
            *slot.lock().unwrap() = Some(output);
            if done.send(id).is_err() {
                debug!("task {} completed after its workflow was dropped", id);
            }
        });
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Blocking
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TaskValue;
    use crate::value::Value;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    #[test]
    fn runs_blocking_and_future_tasks() {
        let executor = ThreadsExecutor::new(2).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let slot_a: ResultSlot = Arc::new(Mutex::new(None));
        executor.submit(
            0,
            Task::Blocking(Box::new(|| Ok(TaskValue::Data(Value::Int(1))))),
            slot_a.clone(),
            tx.clone(),
        );
        let slot_b: ResultSlot = Arc::new(Mutex::new(None));
        executor.submit(
            1,
            Task::Future(Box::pin(async { Ok(TaskValue::Data(Value::Int(2))) })),
            slot_b.clone(),
            tx,
        );

        let mut seen = vec![rx.blocking_recv().unwrap(), rx.blocking_recv().unwrap()];
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1]);
        assert!(matches!(
            slot_a.lock().unwrap().take().unwrap().unwrap(),
            TaskValue::Data(Value::Int(1))
        ));
        assert!(matches!(
            slot_b.lock().unwrap().take().unwrap().unwrap(),
            TaskValue::Data(Value::Int(2))
        ));
    }
}
