//! Completion hand-off between host work and guest code.
//!
//! Guest-side state ([`GuestPromise`], stream tasks) lives on one owning
//! scheduling context and is `!Send`. Host work may run on any thread; it only
//! ever touches a [`Completer`], whose result crosses back over a one-shot
//! channel and is applied by a small task spawned on the owning context.
//!
//! ```no_run
//! use bridged_streams::bridge::FutureBridge;
//!
//! # async fn demo() {
//! let bridge = FutureBridge::new(tokio::task::spawn_local);
//! let promise = bridge.start(|completer| {
//!     std::thread::spawn(move || {
//!         completer.resolve(42u32);
//!     });
//! });
//! assert_eq!(promise.await.unwrap(), 42);
//! # }
//! ```

use crate::streams::{
    error::StreamError,
    readable::{ReadableSource, ReadableStreamDefaultController},
};
use futures::{channel::oneshot, future::LocalBoxFuture};
use parking_lot::Mutex;
use pin_project::pin_project;
use std::{
    cell::RefCell,
    fmt,
    marker::PhantomData,
    pin::Pin,
    rc::Rc,
    sync::Arc,
    task::{Context, Poll, Waker},
};

type StreamResult<T> = Result<T, StreamError>;

pub type OnFulfilled<T> = Box<dyn FnOnce(T)>;
pub type OnRejected = Box<dyn FnOnce(StreamError)>;

// ----------- Guest promise -----------
enum PromiseState<T> {
    Pending,
    Fulfilled(T),
    Rejected(StreamError),
}

struct PromiseInner<T> {
    state: PromiseState<T>,
    reactions: Vec<Box<dyn FnOnce(StreamResult<T>)>>,
    wakers: Vec<Waker>,
}

impl<T: Clone> PromiseInner<T> {
    fn result(&self) -> Option<StreamResult<T>> {
        match &self.state {
            PromiseState::Pending => None,
            PromiseState::Fulfilled(value) => Some(Ok(value.clone())),
            PromiseState::Rejected(err) => Some(Err(err.clone())),
        }
    }
}

/// Single-assignment completion visible to guest code.
///
/// Reactions and wakers run on whichever context settles the promise, which
/// for bridged promises is always the owning context. Awaiting the promise
/// yields a clone of its result, so it may be awaited any number of times.
pub struct GuestPromise<T: 'static> {
    inner: Rc<RefCell<PromiseInner<T>>>,
}

impl<T: 'static> Clone for GuestPromise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> fmt::Debug for GuestPromise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.borrow().state {
            PromiseState::Pending => "pending",
            PromiseState::Fulfilled(_) => "fulfilled",
            PromiseState::Rejected(_) => "rejected",
        };
        f.debug_struct("GuestPromise").field("state", &state).finish()
    }
}

impl<T: Clone + 'static> GuestPromise<T> {
    pub fn pending() -> (Self, PromiseResolver<T>) {
        let inner = Rc::new(RefCell::new(PromiseInner {
            state: PromiseState::Pending,
            reactions: Vec::new(),
            wakers: Vec::new(),
        }));
        (
            Self {
                inner: inner.clone(),
            },
            PromiseResolver { inner },
        )
    }

    pub fn resolved(value: T) -> Self {
        let (promise, resolver) = Self::pending();
        resolver.resolve(value);
        promise
    }

    pub fn rejected(err: StreamError) -> Self {
        let (promise, resolver) = Self::pending();
        resolver.reject(err);
        promise
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self.inner.borrow().state, PromiseState::Pending)
    }

    /// The settled result, without waiting.
    pub fn result(&self) -> Option<StreamResult<T>> {
        self.inner.borrow().result()
    }

    /// Registers a reaction. A promise that already settled runs it right away.
    pub fn on_settled<F>(&self, reaction: F)
    where
        F: FnOnce(StreamResult<T>) + 'static,
    {
        let result = {
            let mut inner = self.inner.borrow_mut();
            match inner.result() {
                Some(result) => result,
                None => {
                    inner.reactions.push(Box::new(reaction));
                    return;
                }
            }
        };
        reaction(result);
    }
}

impl<T: Clone + 'static> Future for GuestPromise<T> {
    type Output = StreamResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.borrow_mut();
        if let Some(result) = inner.result() {
            return Poll::Ready(result);
        }
        if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            inner.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

/// Settles one [`GuestPromise`]. Dropping it unsettled rejects the promise
/// with [`StreamError::TaskDropped`].
pub struct PromiseResolver<T: Clone + 'static> {
    inner: Rc<RefCell<PromiseInner<T>>>,
}

impl<T: Clone + 'static> PromiseResolver<T> {
    pub fn resolve(self, value: T) -> bool {
        self.settle(Ok(value))
    }

    pub fn reject(self, err: StreamError) -> bool {
        self.settle(Err(err))
    }

    /// Returns false if the promise had already settled.
    pub fn settle(self, result: StreamResult<T>) -> bool {
        settle_promise(&self.inner, result)
    }
}

impl<T: Clone + 'static> Drop for PromiseResolver<T> {
    fn drop(&mut self) {
        settle_promise(&self.inner, Err(StreamError::TaskDropped));
    }
}

fn settle_promise<T: Clone>(inner: &RefCell<PromiseInner<T>>, result: StreamResult<T>) -> bool {
    let (reactions, wakers) = {
        let mut inner = inner.borrow_mut();
        if !matches!(inner.state, PromiseState::Pending) {
            return false;
        }
        inner.state = match &result {
            Ok(value) => PromiseState::Fulfilled(value.clone()),
            Err(err) => PromiseState::Rejected(err.clone()),
        };
        (
            std::mem::take(&mut inner.reactions),
            std::mem::take(&mut inner.wakers),
        )
    };
    tracing::trace!(ok = result.is_ok(), reactions = reactions.len(), "promise settled");
    for reaction in reactions {
        reaction(result.clone());
    }
    for waker in wakers {
        waker.wake();
    }
    true
}

// ----------- Thenable -----------
/// The capability to register fulfillment and rejection handlers.
pub trait Thenable<T> {
    fn then(&self, on_fulfilled: OnFulfilled<T>, on_rejected: OnRejected);
}

/// A value handed over from guest code. Only values that expose a
/// [`Thenable`] can be awaited from the host.
pub trait GuestValue<T> {
    fn as_thenable(&self) -> Option<&dyn Thenable<T>> {
        None
    }
}

impl<T: Clone + 'static> Thenable<T> for GuestPromise<T> {
    fn then(&self, on_fulfilled: OnFulfilled<T>, on_rejected: OnRejected) {
        self.on_settled(move |result| match result {
            Ok(value) => on_fulfilled(value),
            Err(err) => on_rejected(err),
        });
    }
}

impl<T: Clone + 'static> GuestValue<T> for GuestPromise<T> {
    fn as_thenable(&self) -> Option<&dyn Thenable<T>> {
        Some(self)
    }
}

/// Adapts a `then`-shaped closure into a [`Thenable`] guest value.
pub struct ThenFn<F>(pub F);

impl<T, F> Thenable<T> for ThenFn<F>
where
    F: Fn(OnFulfilled<T>, OnRejected),
{
    fn then(&self, on_fulfilled: OnFulfilled<T>, on_rejected: OnRejected) {
        (self.0)(on_fulfilled, on_rejected)
    }
}

impl<T, F> GuestValue<T> for ThenFn<F>
where
    F: Fn(OnFulfilled<T>, OnRejected),
{
    fn as_thenable(&self) -> Option<&dyn Thenable<T>> {
        Some(self)
    }
}

// ----------- Host side -----------
/// Thread-safe handle that completes one bridged operation.
///
/// Clones share the same slot: the first completion wins and every later one
/// returns `false`. Dropping every clone without completing rejects the
/// promise with [`StreamError::TaskDropped`].
pub struct Completer<T> {
    slot: Arc<Mutex<Option<oneshot::Sender<StreamResult<T>>>>>,
}

impl<T> Clone for Completer<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl<T> Completer<T> {
    fn new(tx: oneshot::Sender<StreamResult<T>>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(tx))),
        }
    }

    pub fn complete(&self, result: StreamResult<T>) -> bool {
        let Some(tx) = self.slot.lock().take() else {
            tracing::debug!("duplicate completion dropped");
            return false;
        };
        // A dropped receiver means the owning context is gone; nothing to settle.
        let _ = tx.send(result);
        true
    }

    pub fn resolve(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    pub fn reject(&self, err: StreamError) -> bool {
        self.complete(Err(err))
    }

    pub fn is_completed(&self) -> bool {
        self.slot.lock().is_none()
    }
}

/// Host-awaitable view of a guest thenable. Settles exactly once, with
/// [`StreamError::TaskDropped`] if the thenable drops its handlers unused.
#[pin_project]
pub struct HostFuture<T> {
    #[pin]
    receiver: oneshot::Receiver<StreamResult<T>>,
}

impl<T> Future for HostFuture<T> {
    type Output = StreamResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().receiver.poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_canceled)) => Poll::Ready(Err(StreamError::TaskDropped)),
            Poll::Pending => Poll::Pending,
        }
    }
}

// ----------- Bridge -----------
/// Starts host operations on behalf of the owning context.
///
/// Built from the same kind of spawner the stream builders take, typically
/// `tokio::task::spawn_local`.
#[derive(Clone)]
pub struct FutureBridge {
    spawner: Rc<dyn Fn(LocalBoxFuture<'static, ()>)>,
}

impl fmt::Debug for FutureBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureBridge").finish_non_exhaustive()
    }
}

impl FutureBridge {
    pub fn new<F, R>(spawn_fn: F) -> Self
    where
        F: Fn(LocalBoxFuture<'static, ()>) -> R + 'static,
    {
        Self {
            spawner: Rc::new(move |fut| {
                let _ = spawn_fn(fut);
            }),
        }
    }

    /// Runs `op` with a [`Completer`] and returns the promise it settles.
    ///
    /// The promise is returned before `op` has necessarily completed; it
    /// settles on the owning context once the completer fires from any thread.
    pub fn start<T, Op>(&self, op: Op) -> GuestPromise<T>
    where
        T: Clone + Send + 'static,
        Op: FnOnce(Completer<T>),
    {
        let (promise, resolver) = GuestPromise::pending();
        let (tx, rx) = oneshot::channel();

        (self.spawner)(Box::pin(async move {
            let result = rx.await.unwrap_or_else(|_| Err(StreamError::TaskDropped));
            if let Err(err) = &result {
                tracing::debug!(error = %err, "bridged operation rejected");
            }
            resolver.settle(result);
        }));

        op(Completer::new(tx));
        promise
    }

    /// Runs `work` on a host runtime and settles a guest promise with its output.
    pub fn spawn_host<T, Fut>(&self, runtime: &tokio::runtime::Handle, work: Fut) -> GuestPromise<T>
    where
        T: Clone + Send + 'static,
        Fut: Future<Output = StreamResult<T>> + Send + 'static,
    {
        self.start(|completer| {
            runtime.spawn(async move {
                completer.complete(work.await);
            });
        })
    }

    /// Converts a guest value into a host future.
    ///
    /// Fails with [`StreamError::Type`] when the value is not thenable.
    pub fn to_host<T, V>(value: &V) -> StreamResult<HostFuture<T>>
    where
        T: 'static,
        V: GuestValue<T> + ?Sized,
    {
        let thenable = value
            .as_thenable()
            .ok_or_else(|| StreamError::Type("value is not a thenable".into()))?;

        let (tx, rx) = oneshot::channel();
        let fulfilled_slot = Rc::new(RefCell::new(Some(tx)));
        let rejected_slot = fulfilled_slot.clone();

        thenable.then(
            Box::new(move |value| {
                if let Some(tx) = fulfilled_slot.borrow_mut().take() {
                    let _ = tx.send(Ok(value));
                }
            }),
            Box::new(move |err| {
                if let Some(tx) = rejected_slot.borrow_mut().take() {
                    let _ = tx.send(Err(err));
                }
            }),
        );

        Ok(HostFuture { receiver: rx })
    }
}

// ----------- Host-backed readable source -----------
/// A [`ReadableSource`] that starts one host operation per pull.
///
/// The operation completes with `Some(chunk)` to enqueue or `None` to close.
pub struct HostPullSource<T, Op> {
    bridge: FutureBridge,
    op: Op,
    _phantom: PhantomData<T>,
}

impl<T, Op> HostPullSource<T, Op>
where
    T: Clone + Send + 'static,
    Op: FnMut(Completer<Option<T>>) + 'static,
{
    pub fn new(bridge: &FutureBridge, op: Op) -> Self {
        Self {
            bridge: bridge.clone(),
            op,
            _phantom: PhantomData,
        }
    }
}

impl<T, Op> ReadableSource<T> for HostPullSource<T, Op>
where
    T: Clone + Send + 'static,
    Op: FnMut(Completer<Option<T>>) + 'static,
{
    async fn pull(&mut self, controller: &mut ReadableStreamDefaultController<T>) -> StreamResult<()> {
        match self.bridge.start(&mut self.op).await? {
            Some(chunk) => controller.enqueue(chunk),
            None => controller.close(),
        }
    }
}
