/*!
Cancellation and deadline context for storage operations.

Every network-bound operation (session setup, opening a read stream, delete,
copy) runs under a caller-supplied [`Context`]. Cancelling the context or
letting its deadline pass makes the in-flight operation return
[`BackupError::Cancelled`] or [`BackupError::DeadlineExceeded`] instead of
hanging on the backend.

Contexts form a tree: a child observes its ancestors' cancellation and
deadline, while cancelling a child leaves the parent untouched.
*/

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::{BackupError, Result};

#[derive(Debug, Clone)]
pub struct Context {
    cancel_tx: Arc<watch::Sender<bool>>,
    ancestors: Vec<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            cancel_tx: Arc::new(cancel_tx),
            ancestors: Vec::new(),
            deadline: None,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        let mut ctx = Self::background();
        ctx.deadline = Some(deadline);
        ctx
    }

    /// Derive a context that is cancelled whenever `self` is.
    pub fn child(&self) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        let mut ancestors = self.ancestors.clone();
        ancestors.push(self.cancel_tx.subscribe());
        Self {
            cancel_tx: Arc::new(cancel_tx),
            ancestors,
            deadline: self.deadline,
        }
    }

    /// Derive a child whose deadline is the earlier of the parent's and `now + timeout`.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let mut child = self.child();
        let candidate = Instant::now() + timeout;
        child.deadline = Some(match self.deadline {
            Some(parent) if parent < candidate => parent,
            _ => candidate,
        });
        child
    }

    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow() || self.ancestors.iter().any(|rx| *rx.borrow())
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// `Ok(())` while the context is live, otherwise the reason it is not.
    pub fn err(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(BackupError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(BackupError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Resolves once this context or any ancestor is cancelled.
    pub async fn cancelled(&self) {
        let mut receivers = self.ancestors.clone();
        receivers.push(self.cancel_tx.subscribe());

        let waits = receivers.into_iter().map(|mut rx| {
            Box::pin(async move {
                // A dropped sender can never cancel us.
                let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
                if closed {
                    std::future::pending::<()>().await;
                }
            })
        });
        select_all(waits).await;
    }

    /// Run `fut` bound to this context.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.err()?;

        tokio::select! {
            biased;
            _ = self.cancelled() => Err(BackupError::Cancelled),
            _ = sleep_until_deadline(self.deadline) => Err(BackupError::DeadlineExceeded),
            result = fut => result,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_runs_to_completion() {
        let ctx = Context::background();
        let value = ctx.run(async { Ok::<_, BackupError>(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert!(ctx.err().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pending_operation() {
        let ctx = Context::background();
        let canceller = ctx.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result: Result<()> = ctx.run(std::future::pending()).await;
        assert!(matches!(result, Err(BackupError::Cancelled)));
        assert!(ctx.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_interrupts_pending_operation() {
        let ctx = Context::with_timeout(Duration::from_secs(5));

        let result: Result<()> = ctx.run(std::future::pending()).await;
        assert!(matches!(result, Err(BackupError::DeadlineExceeded)));
        assert!(matches!(ctx.err(), Err(BackupError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_already_cancelled_context_fails_fast() {
        let ctx = Context::background();
        ctx.cancel();

        let result = ctx.run(async { Ok::<_, BackupError>(1) }).await;
        assert!(matches!(result, Err(BackupError::Cancelled)));
    }

    #[tokio::test]
    async fn test_child_follows_parent_but_not_the_reverse() {
        let parent = Context::background();
        let child = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let other_child = parent.child();
        parent.cancel();
        assert!(other_child.is_cancelled());
        let result = other_child.run(async { Ok::<_, BackupError>(()) }).await;
        assert!(matches!(result, Err(BackupError::Cancelled)));
    }

    #[tokio::test]
    async fn test_grandchild_wakes_on_root_cancel() {
        let root = Context::background();
        let grandchild = root.child().child();
        let canceller = root.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result: Result<()> = grandchild.run(std::future::pending()).await;
        assert!(matches!(result, Err(BackupError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_with_timeout_keeps_earlier_deadline() {
        let parent = Context::with_timeout(Duration::from_secs(1));
        let child = parent.child_with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());

        let tighter = parent.child_with_timeout(Duration::from_millis(10));
        assert!(tighter.deadline().unwrap() < parent.deadline().unwrap());
    }
}
