//! Trailing-edge debouncer safe for concurrent callers
//!
//! Calls arriving within the window collapse into a single run of the task,
//! started when the window after the last call expires. Every coalesced
//! caller receives the result of that run. An immediate call runs the task
//! right away and absorbs all pending callers.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::oneshot;

type Task<T> = Arc<dyn Fn() -> BoxFuture<'static, T> + Send + Sync>;

struct DebounceState<T> {
    generation: u64,
    waiters: Vec<oneshot::Sender<T>>,
}

pub struct Debouncer<T> {
    delay: Duration,
    task: Task<T>,
    state: Arc<Mutex<DebounceState<T>>>,
}

impl<T: Clone + Send + 'static> Debouncer<T> {
    pub fn new<F, Fut>(delay: Duration, task: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        Self {
            delay,
            task: Arc::new(move || Box::pin(task())),
            state: Arc::new(Mutex::new(DebounceState {
                generation: 0,
                waiters: Vec::new(),
            })),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Schedule a run; the receiver yields the result of the run that absorbs this call
    pub fn trigger(&self, immediate: bool) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        let generation = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.generation += 1;
            state.waiters.push(tx);
            state.generation
        };

        let state = self.state.clone();
        let task = self.task.clone();
        let delay = if immediate { Duration::ZERO } else { self.delay };
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let waiters = {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.generation != generation {
                    // a later call owns the pending waiters
                    return;
                }
                std::mem::take(&mut state.waiters)
            };
            let result = task().await;
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        });
        rx
    }

    /// Trigger and wait; `None` if the pending run was cancelled
    pub async fn call(&self, immediate: bool) -> Option<T> {
        self.trigger(immediate).await.ok()
    }

    /// Drop pending callers without running the task
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.generation += 1;
        state.waiters.clear();
    }
}
