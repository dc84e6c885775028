use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;

use crate::error::{CacheError, TaskResult};
use crate::utils::DropHook;

/// A single-outcome handle on a task execution.
///
/// The handle resolves exactly once, with the produced value or with an
/// error. Dropping an unresolved handle gives up the subscription; when the
/// last subscriber of an execution goes away, the producer itself is
/// cancelled and the execution is dropped without delivering an outcome.
pub struct TaskHandle<V> {
    state: HandleState<V>,
}

enum HandleState<V> {
    /// The outcome was already known when the task was submitted.
    Ready(Option<TaskResult<V>>),
    /// The outcome will be delivered by an in-flight execution.
    Subscribed {
        receiver: oneshot::Receiver<TaskResult<V>>,
        /// Disposes the subscription once the handle goes away.
        _dispose: DropHook,
    },
}

impl<V> TaskHandle<V> {
    pub(crate) fn ready(result: TaskResult<V>) -> Self {
        TaskHandle {
            state: HandleState::Ready(Some(result)),
        }
    }

    pub(crate) fn subscribed(
        receiver: oneshot::Receiver<TaskResult<V>>,
        dispose: DropHook,
    ) -> Self {
        TaskHandle {
            state: HandleState::Subscribed {
                receiver,
                _dispose: dispose,
            },
        }
    }
}

// The handle never pins the value it yields.
impl<V> Unpin for TaskHandle<V> {}

impl<V> Future for TaskHandle<V> {
    type Output = TaskResult<V>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            HandleState::Ready(result) => {
                Poll::Ready(result.take().expect("task handle polled after completion"))
            }
            HandleState::Subscribed { receiver, .. } => {
                // The cache keeps the sender alive until the outcome is
                // broadcast, so a dropped sender means the runtime tore the
                // execution down mid-flight.
                Pin::new(receiver).poll(cx).map(|received| match received {
                    Ok(outcome) => outcome,
                    Err(oneshot::Canceled) => {
                        Err(CacheError::Cancelled("execution channel dropped".into()))
                    }
                })
            }
        }
    }
}

/// A completion handle that resolves once the cache has fully shut down.
///
/// Dropping the handle before it resolves deregisters the waiter.
pub struct TerminationHandle {
    state: TerminationState,
}

enum TerminationState {
    Ready,
    Waiting {
        receiver: oneshot::Receiver<()>,
        /// Deregisters the waiter once the handle goes away.
        _deregister: DropHook,
    },
}

impl TerminationHandle {
    pub(crate) fn ready() -> Self {
        TerminationHandle {
            state: TerminationState::Ready,
        }
    }

    pub(crate) fn waiting(receiver: oneshot::Receiver<()>, deregister: DropHook) -> Self {
        TerminationHandle {
            state: TerminationState::Waiting {
                receiver,
                _deregister: deregister,
            },
        }
    }
}

impl Future for TerminationHandle {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            TerminationState::Ready => Poll::Ready(()),
            // If the cache itself goes away while we wait, the sender is
            // dropped; treat that as terminated as well.
            TerminationState::Waiting { receiver, .. } => {
                Pin::new(receiver).poll(cx).map(|_| ())
            }
        }
    }
}
