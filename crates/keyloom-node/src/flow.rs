//! Cancellable background activities.
//!
//! A [`Flow`] is a spawned task that performs a sequence of steps (deliver an
//! envelope, run a maintenance pass). Cancellation is cooperative: the body
//! checks its [`CancelToken`] between steps, so a step that has started always
//! runs to commit or failure.

use std::future::Future;

use tokio::{sync::watch, task::JoinHandle};
use tracing::debug;

use crate::NodeError;

/// Cancellation signal observed by a flow body.
///
/// Dropping the owning [`Flow`] without joining counts as cancellation.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// True once the flow was asked to stop.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves when the flow is asked to stop.
    ///
    /// Only await this between steps, typically in a `select!` against the
    /// wait for the next unit of work.
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Handle to a running background activity.
pub struct Flow<T> {
    name: &'static str,
    cancel: watch::Sender<bool>,
    task: JoinHandle<Result<T, NodeError>>,
}

impl<T: Send + 'static> Flow<T> {
    /// Spawn `body` on the current runtime.
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = Result<T, NodeError>> + Send + 'static,
    {
        let (cancel, rx) = watch::channel(false);
        let task = tokio::spawn(body(CancelToken { rx }));
        debug!(flow = name, "flow started");
        Self { name, cancel, task }
    }

    /// Flow name, for logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Ask the flow to stop at its next step boundary.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// True once the body has returned.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the body to return on its own.
    pub async fn join(self) -> Result<T, NodeError> {
        let Self { name, cancel, task } = self;
        let result = task.await.map_err(|e| NodeError::Flow(format!("{name}: {e}")));
        drop(cancel);
        debug!(flow = name, "flow finished");
        result?
    }

    /// Cancel, then wait for the step in progress to finish.
    pub async fn stop(self) -> Result<T, NodeError> {
        self.cancel();
        self.join().await
    }
}
