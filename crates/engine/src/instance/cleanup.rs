use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

/// Cleanups still running after the run that started them was dropped.
///
/// A run that is cancelled cannot await its own teardown, so it hands the
/// work to the runtime and records the handle here. `Instance::close` waits
/// on every recorded handle, which keeps the process alive until the
/// environment is actually gone.
#[derive(Clone, Default)]
pub struct PendingCleanups {
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl PendingCleanups {
    pub fn spawn<F>(&self, cleanup: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => self.track(runtime.spawn(cleanup)),
            Err(_) => tracing::warn!("No runtime left to run a pending cleanup"),
        }
    }

    pub fn track(&self, handle: JoinHandle<()>) {
        self.handles().push(handle);
    }

    /// Waits for every cleanup recorded so far, including ones recorded
    /// while waiting.
    pub async fn wait(&self) {
        loop {
            let handles = self.take_handles();
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::warn!("Cleanup task failed: {}", e);
                }
            }
        }
    }

    fn take_handles(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.handles())
    }

    fn handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }
}
