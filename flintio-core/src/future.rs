//! One-shot completion channel used to hand results between tasks.
//!
//! Every storage-backend call and every queued append resolves through a
//! `Promise`/`AsyncResult` pair. The producer side resolves exactly once,
//! with a value or an error; dropping an unresolved `Promise` resolves the
//! consumer with an internal error so a waiter can never hang on an
//! abandoned producer.

use crate::error::{FlintError, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

enum State<T> {
    Pending(Option<Waker>),
    Ready(Result<T>),
    Consumed,
}

struct Shared<T> {
    state: Mutex<State<T>>,
}

impl<T> Shared<T> {
    fn resolve(&self, result: Result<T>) {
        let waker = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match &mut *state {
                State::Pending(waker) => {
                    let waker = waker.take();
                    *state = State::Ready(result);
                    waker
                }
                // One-shot: a second resolution is a producer bug, but the
                // consumer already has its outcome so the late value is
                // dropped rather than racing it.
                State::Ready(_) | State::Consumed => None,
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Producer half. Resolves the channel exactly once via [`Promise::set_value`]
/// or [`Promise::set_error`]; both consume the promise.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Promise<T> {
    /// Create a connected producer/consumer pair.
    pub fn pair() -> (Promise<T>, AsyncResult<T>) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::Pending(None)),
        });
        (
            Promise {
                shared: shared.clone(),
            },
            AsyncResult { shared },
        )
    }

    pub fn set_value(self, value: T) {
        self.shared.resolve(Ok(value));
    }

    pub fn set_error(self, error: FlintError) {
        self.shared.resolve(Err(error));
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        // `set_value`/`set_error` already resolved the state, so this is a
        // no-op after a normal resolution.
        self.shared.resolve(Err(FlintError::Internal(
            "promise dropped before resolution".to_string(),
        )));
    }
}

/// Consumer half: a one-shot future yielding `Result<T>`.
pub struct AsyncResult<T> {
    shared: Arc<Shared<T>>,
}

impl<T> AsyncResult<T> {
    /// An already-resolved result, for operations that complete synchronously.
    pub fn ready(value: T) -> AsyncResult<T> {
        AsyncResult {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Ready(Ok(value))),
            }),
        }
    }

    /// An already-failed result.
    pub fn error(error: FlintError) -> AsyncResult<T> {
        AsyncResult {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Ready(Err(error))),
            }),
        }
    }

    /// Non-blocking readiness check.
    pub fn is_ready(&self) -> bool {
        let state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        matches!(*state, State::Ready(_))
    }
}

impl<T> Future for AsyncResult<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match &mut *state {
            State::Pending(waker) => {
                *waker = Some(cx.waker().clone());
                Poll::Pending
            }
            State::Ready(_) => {
                let State::Ready(result) = std::mem::replace(&mut *state, State::Consumed) else {
                    unreachable!()
                };
                Poll::Ready(result)
            }
            State::Consumed => panic!("AsyncResult polled after completion"),
        }
    }
}
