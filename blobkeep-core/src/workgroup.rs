/*!
Bounded-concurrency task group used by buckets for multipart transfers.

Tasks run on the tokio runtime under a child of the caller's [`Context`].
The first task to fail cancels that child context and aborts the rest of the
group, so `wait` returns promptly with the original error.
*/

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::context::Context;
use crate::{BackupError, Result};

pub struct WorkerGroup<T> {
    ctx: Context,
    tasks: JoinSet<(usize, Result<T>)>,
    permits: Arc<Semaphore>,
    spawned: usize,
}

impl<T: Send + 'static> WorkerGroup<T> {
    /// Create a group that runs at most `limit` tasks at a time (minimum 1).
    pub fn new(parent: &Context, limit: usize) -> Self {
        Self {
            ctx: parent.child(),
            tasks: JoinSet::new(),
            permits: Arc::new(Semaphore::new(limit.max(1))),
            spawned: 0,
        }
    }

    /// The group's context; cancelled as soon as any task fails.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn spawn<F>(&mut self, fut: F)
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let index = self.spawned;
        self.spawned += 1;

        let ctx = self.ctx.clone();
        let permits = Arc::clone(&self.permits);
        self.tasks.spawn(async move {
            let result = async {
                let _permit = ctx
                    .run(async {
                        permits
                            .acquire_owned()
                            .await
                            .map_err(|_| BackupError::Cancelled)
                    })
                    .await?;
                ctx.run(fut).await
            }
            .await;
            (index, result)
        });
    }

    /// Wait for every task and return their outputs in spawn order.
    pub async fn wait(mut self) -> Result<Vec<T>> {
        let mut outputs = Vec::with_capacity(self.spawned);
        let mut first_error = None;

        while let Some(joined) = self.tasks.join_next().await {
            let (index, result) = match joined {
                Ok(done) => done,
                Err(e) if e.is_panic() => (
                    usize::MAX,
                    Err(BackupError::storage(format!("worker task panicked: {e}"))),
                ),
                // Aborted after an earlier failure.
                Err(_) => continue,
            };

            match result {
                Ok(value) => outputs.push((index, value)),
                Err(e) => {
                    if first_error.is_none() {
                        debug!(error = %e, "Worker task failed, cancelling group");
                        self.ctx.cancel();
                        self.tasks.abort_all();
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        outputs.sort_by_key(|(index, _)| *index);
        Ok(outputs.into_iter().map(|(_, value)| value).collect())
    }
}
