//! Settle-once deferred values.
//!
//! A `Deferred` is the promise-like value exchanged by async calls. It can
//! be settled from anywhere (a reply handler, a tokio task, a host
//! function), observed through completion callbacks, or awaited as a
//! `Future`. Clones share state.

use crate::error::{Result, TetherError};
use crate::value::Value;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

type Callback = Box<dyn FnOnce(&Result<Value>) + Send>;

#[derive(Default)]
struct DeferredState {
    outcome: Option<Result<Value>>,
    callbacks: Vec<Callback>,
    wakers: Vec<Waker>,
}

/// A value that settles exactly once, with a result or an error.
#[derive(Clone, Default)]
pub struct Deferred {
    state: Arc<Mutex<DeferredState>>,
}

impl Deferred {
    /// Create a pending deferred.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a deferred already resolved with `value`.
    pub fn resolved(value: Value) -> Self {
        let d = Self::new();
        d.resolve(value);
        d
    }

    /// Create a deferred already rejected with `error`.
    pub fn rejected(error: TetherError) -> Self {
        let d = Self::new();
        d.reject(error);
        d
    }

    pub fn from_result(result: Result<Value>) -> Self {
        let d = Self::new();
        d.settle(result);
        d
    }

    pub fn resolve(&self, value: Value) -> bool {
        self.settle(Ok(value))
    }

    pub fn reject(&self, error: TetherError) -> bool {
        self.settle(Err(error))
    }

    /// Settle with `outcome`. Returns false if already settled.
    ///
    /// Callbacks run on the settling thread after the internal lock is
    /// released, so they may freely touch this deferred again.
    pub fn settle(&self, outcome: Result<Value>) -> bool {
        let (callbacks, wakers) = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome.clone());
            (
                std::mem::take(&mut state.callbacks),
                std::mem::take(&mut state.wakers),
            )
        };

        for callback in callbacks {
            callback(&outcome);
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }

    pub fn is_settled(&self) -> bool {
        self.state.lock().outcome.is_some()
    }

    /// The outcome, if settled.
    pub fn outcome(&self) -> Option<Result<Value>> {
        self.state.lock().outcome.clone()
    }

    /// Run `callback` once settled; immediately if already settled.
    pub fn on_settled<F>(&self, callback: F)
    where
        F: FnOnce(&Result<Value>) + Send + 'static,
    {
        let outcome = {
            let mut state = self.state.lock();
            match &state.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&outcome);
    }

    /// Handle identity.
    pub fn ptr_eq(&self, other: &Deferred) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl Future for Deferred {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.lock();
        match &state.outcome {
            Some(outcome) => Poll::Ready(outcome.clone()),
            None => {
                if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    state.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        match &state.outcome {
            None => write!(f, "Deferred(pending)"),
            Some(Ok(_)) => write!(f, "Deferred(resolved)"),
            Some(Err(e)) => write!(f, "Deferred(rejected: {})", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_settles_only_once() {
        let d = Deferred::new();
        assert!(!d.is_settled());
        assert!(d.resolve(Value::from(1)));
        assert!(!d.reject(TetherError::failed("late")));
        assert_eq!(d.outcome().unwrap().unwrap(), Value::from(1));
    }

    #[test]
    fn test_callbacks_run_on_settle_and_after() {
        let d = Deferred::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        d.on_settled(move |r| {
            assert!(r.is_err());
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        d.reject(TetherError::failed("nope"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let h = hits.clone();
        d.on_settled(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_await_resolution_from_task() {
        let d = Deferred::new();
        let setter = d.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            setter.resolve(Value::from("done"));
        });
        assert_eq!(d.await.unwrap(), Value::from("done"));
    }

    #[tokio::test]
    async fn test_await_already_rejected() {
        let err = Deferred::rejected(TetherError::failed("bad")).await.unwrap_err();
        assert_eq!(err.to_string(), "bad");
    }
}
