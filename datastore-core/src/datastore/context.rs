/*
    context.rs - Cancellable execution context

    Every store operation takes a Context. Cancelling a context, or letting
    its deadline pass, aborts the in-flight operation with
    StoreError::Cancelled. Children observe their parent's cancellation.
*/

use super::errors::{StoreError, StoreResult};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

struct Inner {
    cancelled: watch::Sender<bool>,
    deadline: Option<Instant>,
    parent: Option<Context>,
}

/// Cancellation and deadline scope for store operations
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// A root context that is never cancelled unless asked to
    pub fn background() -> Self {
        Self::build(None, None)
    }

    fn build(parent: Option<Context>, deadline: Option<Instant>) -> Self {
        let (cancelled, _) = watch::channel(false);
        Context {
            inner: Arc::new(Inner {
                cancelled,
                deadline,
                parent,
            }),
        }
    }

    /// A child that is cancelled with this context or on its own
    pub fn child(&self) -> Self {
        Self::build(Some(self.clone()), None)
    }

    /// A child that is additionally cancelled once `timeout` elapses
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self::build(Some(self.clone()), Some(Instant::now() + timeout))
    }

    pub fn cancel(&self) {
        self.inner.cancelled.send_replace(true);
    }

    /// The earliest deadline along the parent chain
    pub fn deadline(&self) -> Option<Instant> {
        let parent = self.inner.parent.as_ref().and_then(Context::deadline);
        match (self.inner.deadline, parent) {
            (Some(own), Some(parent)) => Some(own.min(parent)),
            (own, parent) => own.or(parent),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        if *self.inner.cancelled.borrow() {
            return true;
        }
        if matches!(self.inner.deadline, Some(deadline) if Instant::now() >= deadline) {
            return true;
        }
        self.inner
            .parent
            .as_ref()
            .map(Context::is_cancelled)
            .unwrap_or(false)
    }

    /// Fail fast if the context is already done
    pub fn check(&self) -> StoreResult<()> {
        if self.is_cancelled() {
            Err(StoreError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once this context is cancelled or its deadline passes
    pub fn cancelled(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut rx = self.inner.cancelled.subscribe();
            let own = async move {
                if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                    std::future::pending::<()>().await;
                }
            };
            let deadline = async {
                match self.inner.deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };
            let parent = async {
                match &self.inner.parent {
                    Some(parent) => parent.cancelled().await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = own => {}
                _ = deadline => {}
                _ = parent => {}
            }
        })
    }

    /// Drive `fut` to completion unless this context fires first
    pub async fn run<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(StoreError::Cancelled),
            result = fut => result,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_runs_to_completion() {
        let ctx = Context::background();
        let value = ctx.run(async { Ok::<_, StoreError>(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_parent_cancel_reaches_child() {
        let parent = Context::background();
        let child = parent.child();
        let grandchild = child.child();

        parent.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        grandchild.cancelled().await;
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent() {
        let parent = Context::background();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_aborts_pending_future() {
        let ctx = Context::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result: StoreResult<()> = ctx
            .run(async {
                std::future::pending::<()>().await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(StoreError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires() {
        let ctx = Context::background().with_timeout(Duration::from_secs(5));
        assert!(!ctx.is_cancelled());

        let result: StoreResult<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(StoreError::Cancelled)));
        assert!(ctx.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_earliest_in_chain() {
        let outer = Context::background().with_timeout(Duration::from_secs(1));
        let inner = outer.with_timeout(Duration::from_secs(30));
        assert_eq!(inner.deadline(), outer.deadline());
    }

    #[tokio::test]
    async fn test_run_on_cancelled_context_does_not_poll() {
        let ctx = Context::background();
        ctx.cancel();
        let polled = std::sync::atomic::AtomicBool::new(false);
        let result = ctx
            .run(async {
                polled.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(result.is_err());
        assert!(!polled.load(std::sync::atomic::Ordering::SeqCst));
    }
}
