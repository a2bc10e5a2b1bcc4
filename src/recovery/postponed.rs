/// Postponed Work Queue
///
/// Recovery flows defer non-critical side effects (detaching lost replicas,
/// relocating subtrees, moving binlog-relay nodes) until after the primary
/// promotion has landed. Each deferred task is a side-effect-only future
/// captured at enqueue time, drained in enqueue order at a single point per
/// recovery.

use crate::error::Result;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, warn};

pub type PostponedFuture = BoxFuture<'static, Result<()>>;

pub struct PostponedWork {
    pending: Mutex<Vec<(String, PostponedFuture)>>,
    executed: Mutex<Vec<String>>,
}

impl std::fmt::Debug for PostponedWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostponedWork")
            .field("pending", &self.pending.lock().len())
            .field("executed", &self.executed.lock().len())
            .finish()
    }
}

impl Default for PostponedWork {
    fn default() -> Self {
        Self::new()
    }
}

impl PostponedWork {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, description: impl Into<String>, future: PostponedFuture) {
        let description = description.into();
        debug!("postponing: {}", description);
        self.pending.lock().push((description, future));
    }

    /// Total number of tasks ever queued.
    pub fn len(&self) -> usize {
        self.pending.lock().len() + self.executed.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Descriptions of tasks that have already run, in execution order.
    pub fn executed_descriptions(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    /// Runs all queued tasks in enqueue order. Task errors are logged and do
    /// not stop the drain. Tasks enqueued while draining run after the
    /// current batch, in their own enqueue order.
    pub async fn drain(&self) {
        loop {
            let batch = {
                let mut pending = self.pending.lock();
                if pending.is_empty() {
                    break;
                }
                std::mem::take(&mut *pending)
            };
            for (description, future) in batch {
                debug!("running postponed task: {}", description);
                if let Err(err) = future.await {
                    warn!("postponed task '{}' failed: {}", description, err);
                }
                self.executed.lock().push(description);
            }
        }
    }
}
