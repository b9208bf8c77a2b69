//! One-shot cancellation signals.
//!
//! An [`AbortController`] owns the right to fire; any number of cloned
//! [`AbortSignal`]s observe it. Firing is monotonic: the first `abort` wins,
//! every listener registered before that point runs exactly once, and
//! listeners registered afterwards never run.

use crate::streams::{error::StreamError, state::WakerSet};
use futures::future::poll_fn;
use std::{
    cell::RefCell,
    fmt,
    pin::pin,
    rc::Rc,
    task::Poll,
};

type StreamResult<T> = Result<T, StreamError>;
type Listener = Box<dyn FnOnce(Option<String>)>;

#[derive(Default)]
struct SignalInner {
    aborted: bool,
    reason: Option<String>,
    listeners: Vec<Listener>,
}

#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Rc<RefCell<SignalInner>>,
    wakers: Rc<WakerSet>,
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("AbortSignal")
            .field("aborted", &inner.aborted)
            .field("reason", &inner.reason)
            .finish()
    }
}

impl AbortSignal {
    pub fn aborted(&self) -> bool {
        self.inner.borrow().aborted
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.borrow().reason.clone()
    }

    /// The error an operation interrupted by this signal fails with.
    pub fn error(&self) -> StreamError {
        StreamError::Aborted(self.reason())
    }

    /// Registers `listener` to run when the signal fires.
    ///
    /// Has no effect once the signal has already fired; check [`aborted`](Self::aborted)
    /// first when late registration matters.
    pub fn add_event_listener<F>(&self, listener: F)
    where
        F: FnOnce(Option<String>) + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        if !inner.aborted {
            inner.listeners.push(Box::new(listener));
        }
    }

    pub(crate) fn fire(&self, reason: Option<String>) -> bool {
        let listeners = {
            let mut inner = self.inner.borrow_mut();
            if inner.aborted {
                return false;
            }
            inner.aborted = true;
            inner.reason = reason.clone();
            std::mem::take(&mut inner.listeners)
        };
        tracing::debug!(reason = ?reason, listeners = listeners.len(), "abort signal fired");
        for listener in listeners {
            listener(reason.clone());
        }
        self.wakers.wake_all();
        true
    }

    /// Resolves with the abort reason once the signal fires.
    pub async fn wait(&self) -> Option<String> {
        poll_fn(|cx| {
            if self.aborted() {
                return Poll::Ready(self.reason());
            }
            self.wakers.register(cx.waker());
            Poll::Pending
        })
        .await
    }

    /// Runs `fut` until it completes or the signal fires, whichever comes first.
    ///
    /// An already-fired signal wins without polling `fut`.
    pub async fn race<F: Future>(&self, fut: F) -> StreamResult<F::Output> {
        let mut fut = pin!(fut);
        poll_fn(|cx| {
            if self.aborted() {
                return Poll::Ready(Err(self.error()));
            }
            if let Poll::Ready(output) = fut.as_mut().poll(cx) {
                return Poll::Ready(Ok(output));
            }
            self.wakers.register(cx.waker());
            Poll::Pending
        })
        .await
    }
}

#[derive(Debug, Default)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Fires the signal. Later calls are no-ops and keep the first reason.
    pub fn abort(&self, reason: Option<String>) {
        self.signal.fire(reason);
    }
}
