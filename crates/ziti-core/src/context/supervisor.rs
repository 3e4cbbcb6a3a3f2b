//! Per-context task supervisor.

use std::future::Future;
use std::sync::Mutex;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Owns every background task of one context. Cancelling it aborts them all.
#[derive(Debug, Default)]
pub(crate) struct Supervisor {
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Supervisor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Spawn `fut` on `handle` under this supervisor.
    pub(crate) fn spawn<F>(&self, handle: &Handle, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = handle.spawn(fut);
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        tasks.retain(|(_, t)| !t.is_finished());
        tasks.push((name, task));
    }

    /// Abort all running tasks.
    pub(crate) fn cancel_all(&self) {
        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for (name, task) in tasks {
            if !task.is_finished() {
                tracing::trace!("Cancelling {}", name);
                task.abort();
            }
        }
    }

    /// Number of tasks still running.
    pub(crate) fn running(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .filter(|(_, t)| !t.is_finished())
            .count()
    }
}
