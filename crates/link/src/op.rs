use futures::future::{FutureExt, Shared};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Build a connected AsyncOperation resolver and its observing OpFuture.
pub fn async_op() -> (AsyncOperation, OpFuture) {
    let (tx, rx) = oneshot::channel();
    (AsyncOperation { tx }, OpFuture { rx: rx.shared() })
}

/// AsyncOperation is the single-assignment resolver of an asynchronous
/// operation, such as an in-flight recovery-log or driver-store commit.
#[derive(Debug)]
pub struct AsyncOperation {
    tx: oneshot::Sender<Result<(), Arc<anyhow::Error>>>,
}

impl AsyncOperation {
    /// Resolve the operation. Consumes the resolver: resolution can
    /// happen at most once, and is observed by every OpFuture clone.
    pub fn resolve(self, result: anyhow::Result<()>) {
        let _ = self.tx.send(result.map_err(Arc::new));
    }
}

/// OpError is the failure of an observed operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OpError {
    #[error("{0:#}")]
    Failed(Arc<anyhow::Error>),
    #[error("operation was dropped without being resolved")]
    Dropped,
}

/// OpFuture observes the resolution of an AsyncOperation.
/// Clones observe the same single assignment.
#[derive(Debug, Clone)]
pub struct OpFuture {
    rx: Shared<oneshot::Receiver<Result<(), Arc<anyhow::Error>>>>,
}

impl OpFuture {
    /// An OpFuture which is already resolved as successful.
    pub fn resolved() -> Self {
        let (op, fut) = async_op();
        op.resolve(Ok(()));
        fut
    }
}

impl Future for OpFuture {
    type Output = Result<(), OpError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match futures::ready!(self.rx.poll_unpin(cx)) {
            Ok(Ok(())) => Poll::Ready(Ok(())),
            Ok(Err(err)) => Poll::Ready(Err(OpError::Failed(err))),
            Err(_dropped) => Poll::Ready(Err(OpError::Dropped)),
        }
    }
}
