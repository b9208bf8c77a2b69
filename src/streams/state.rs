//! Per-stream state records.
//!
//! A record is owned by exactly one stream task. Handles and controllers only
//! ever see the [`Mirror`], a read-only reflection of the lifecycle, the stored
//! error and the lock flag that lets them reject calls synchronously.

use super::error::StreamError;
use futures::channel::oneshot;
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
    task::{Context, Poll, Waker},
};

type StreamResult<T> = Result<T, StreamError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadableState {
    Readable,
    Closed,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritableState {
    Writable,
    Closed,
    Errored,
}

pub(crate) trait Lifecycle: Copy + PartialEq + 'static {
    fn is_active(self) -> bool;
    fn is_errored(self) -> bool;
}

impl Lifecycle for ReadableState {
    fn is_active(self) -> bool {
        self == ReadableState::Readable
    }

    fn is_errored(self) -> bool {
        self == ReadableState::Errored
    }
}

impl Lifecycle for WritableState {
    fn is_active(self) -> bool {
        self == WritableState::Writable
    }

    fn is_errored(self) -> bool {
        self == WritableState::Errored
    }
}

// ----------- WakerSet -----------
#[derive(Default, Debug)]
pub(crate) struct WakerSet(RefCell<Vec<Waker>>);

impl WakerSet {
    pub(crate) fn register(&self, waker: &Waker) {
        let mut wakers = self.0.borrow_mut();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    pub(crate) fn wake_all(&self) {
        let wakers = std::mem::take(&mut *self.0.borrow_mut());
        for waker in wakers {
            waker.wake();
        }
    }
}

// ----------- Requester -----------
/// One outstanding read, write, close or cancel request.
///
/// Settling consumes the requester, so each one settles exactly once. A
/// requester whose receiver is gone settles into the void.
pub(crate) struct Requester<T>(oneshot::Sender<StreamResult<T>>);

impl<T> Requester<T> {
    pub(crate) fn new() -> (Self, oneshot::Receiver<StreamResult<T>>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    pub(crate) fn resolve(self, value: T) {
        let _ = self.0.send(Ok(value));
    }

    pub(crate) fn reject(self, err: StreamError) {
        let _ = self.0.send(Err(err));
    }

    pub(crate) fn settle(self, result: StreamResult<T>) {
        let _ = self.0.send(result);
    }

    /// The caller stopped waiting for this request.
    pub(crate) fn is_canceled(&self) -> bool {
        self.0.is_canceled()
    }
}

/// Awaits a requester's receiver, mapping a vanished task to `TaskDropped`.
pub(crate) async fn settled<T>(rx: oneshot::Receiver<StreamResult<T>>) -> StreamResult<T> {
    rx.await.unwrap_or_else(|_| Err(StreamError::TaskDropped))
}

// ----------- Mirror -----------
pub(crate) struct Mirror<S: Lifecycle> {
    state: Cell<S>,
    stored_error: RefCell<Option<StreamError>>,
    locked: Cell<bool>,
    shutting_down: Cell<bool>,
    closed_wakers: WakerSet,
    queued: Cell<usize>,
    drained_wakers: WakerSet,
}

impl<S: Lifecycle> Mirror<S> {
    pub(crate) fn new(initial: S) -> Rc<Self> {
        Rc::new(Self {
            state: Cell::new(initial),
            stored_error: RefCell::new(None),
            locked: Cell::new(false),
            shutting_down: Cell::new(false),
            closed_wakers: WakerSet::default(),
            queued: Cell::new(0),
            drained_wakers: WakerSet::default(),
        })
    }

    pub(crate) fn state(&self) -> S {
        self.state.get()
    }

    pub(crate) fn stored_error(&self) -> Option<StreamError> {
        self.stored_error.borrow().clone()
    }

    /// The error a caller sees when the stream is no longer usable.
    pub(crate) fn terminal_error(&self, fallback: StreamError) -> StreamError {
        if self.state().is_errored() {
            self.stored_error().unwrap_or(fallback)
        } else {
            fallback
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.locked.get()
    }

    pub(crate) fn try_lock(&self) -> StreamResult<()> {
        if self.locked.replace(true) {
            return Err(StreamError::Locked);
        }
        Ok(())
    }

    pub(crate) fn unlock(&self) {
        self.locked.set(false);
    }

    /// Set once a controller has asked for close or error, ahead of the task
    /// processing the request.
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.get()
    }

    pub(crate) fn begin_shutdown(&self) -> bool {
        !self.shutting_down.replace(true)
    }

    fn transition(&self, next: S, err: Option<StreamError>) {
        self.state.set(next);
        if let Some(err) = err {
            *self.stored_error.borrow_mut() = Some(err);
        }
        self.shutting_down.set(true);
        self.closed_wakers.wake_all();
        self.drained_wakers.wake_all();
    }

    /// Counts a chunk handed to the stream but not yet taken by a reader.
    pub(crate) fn note_enqueued(&self) {
        self.queued.set(self.queued.get() + 1);
    }

    pub(crate) fn note_consumed(&self, count: usize) {
        let left = self.queued.get().saturating_sub(count);
        self.queued.set(left);
        if left == 0 {
            self.drained_wakers.wake_all();
        }
    }

    /// Ready once no chunk waits for a reader, or the stream left its active state.
    pub(crate) fn poll_drained(&self, cx: &mut Context<'_>) -> Poll<()> {
        if self.queued.get() == 0 || !self.state().is_active() {
            return Poll::Ready(());
        }
        self.drained_wakers.register(cx.waker());
        Poll::Pending
    }

    /// Ready once the stream has left its active state.
    pub(crate) fn poll_closed(&self, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        let state = self.state();
        if state.is_errored() {
            return Poll::Ready(Err(self.terminal_error(StreamError::TaskDropped)));
        }
        if !state.is_active() {
            return Poll::Ready(Ok(()));
        }
        self.closed_wakers.register(cx.waker());
        Poll::Pending
    }
}

// ----------- Readable record -----------
pub(crate) struct ReadableRecord<T> {
    mirror: Rc<Mirror<ReadableState>>,
    queue: VecDeque<T>,
    pending_reads: VecDeque<Requester<Option<T>>>,
    close_requested: bool,
    pulling: bool,
    pull_requested: bool,
}

impl<T> ReadableRecord<T> {
    pub(crate) fn new(mirror: Rc<Mirror<ReadableState>>) -> Self {
        Self {
            mirror,
            queue: VecDeque::new(),
            pending_reads: VecDeque::new(),
            close_requested: false,
            pulling: false,
            pull_requested: false,
        }
    }

    pub(crate) fn state(&self) -> ReadableState {
        self.mirror.state()
    }

    pub(crate) fn enqueue(&mut self, chunk: T) -> StreamResult<()> {
        if self.state() != ReadableState::Readable || self.close_requested {
            self.mirror.note_consumed(1);
            return Err(self.mirror.terminal_error(StreamError::Closed));
        }
        self.prune_reads();
        match self.pending_reads.pop_front() {
            Some(read) => {
                read.resolve(Some(chunk));
                self.mirror.note_consumed(1);
            }
            None => self.queue.push_back(chunk),
        }
        if !self.pending_reads.is_empty() {
            self.pull_requested = true;
        }
        Ok(())
    }

    /// Drops reads whose callers stopped waiting.
    fn prune_reads(&mut self) {
        self.pending_reads.retain(|read| !read.is_canceled());
    }

    /// Fails every outstanding read; their reader let go of the stream.
    pub(crate) fn release_reads(&mut self) {
        while let Some(read) = self.pending_reads.pop_front() {
            read.reject(StreamError::Released);
        }
        self.pull_requested = false;
    }

    /// Returns false when the stream already left the readable state.
    pub(crate) fn close(&mut self) -> bool {
        if self.state() != ReadableState::Readable || self.close_requested {
            return false;
        }
        self.close_requested = true;
        if self.queue.is_empty() {
            self.finish_close();
        }
        true
    }

    fn finish_close(&mut self) {
        self.mirror.transition(ReadableState::Closed, None);
        while let Some(read) = self.pending_reads.pop_front() {
            read.resolve(None);
        }
    }

    pub(crate) fn error(&mut self, err: StreamError) -> bool {
        if self.state() != ReadableState::Readable {
            return false;
        }
        self.queue.clear();
        self.mirror.note_consumed(usize::MAX);
        self.mirror
            .transition(ReadableState::Errored, Some(err.clone()));
        while let Some(read) = self.pending_reads.pop_front() {
            read.reject(err.clone());
        }
        true
    }

    pub(crate) fn cancel(&mut self, reason: Option<String>) -> bool {
        if self.state() != ReadableState::Readable {
            return false;
        }
        self.queue.clear();
        self.mirror.note_consumed(usize::MAX);
        self.mirror.transition(ReadableState::Closed, None);
        while let Some(read) = self.pending_reads.pop_front() {
            read.reject(StreamError::Canceled(reason.clone()));
        }
        true
    }

    pub(crate) fn read(&mut self, read: Requester<Option<T>>) {
        if let Some(chunk) = self.queue.pop_front() {
            read.resolve(Some(chunk));
            self.mirror.note_consumed(1);
            if self.close_requested && self.queue.is_empty() {
                self.finish_close();
            }
            return;
        }
        match self.state() {
            ReadableState::Closed => read.resolve(None),
            ReadableState::Errored => {
                read.reject(self.mirror.terminal_error(StreamError::Closed));
            }
            ReadableState::Readable => {
                self.pending_reads.push_back(read);
                self.pull_requested = true;
            }
        }
    }

    /// Demand exists and no pull is outstanding. Abandoned reads are no demand.
    pub(crate) fn should_pull(&mut self) -> bool {
        self.prune_reads();
        self.state() == ReadableState::Readable
            && !self.close_requested
            && !self.pulling
            && self.pull_requested
            && !self.pending_reads.is_empty()
    }

    pub(crate) fn begin_pull(&mut self) {
        self.pulling = true;
        self.pull_requested = false;
    }

    pub(crate) fn end_pull(&mut self) {
        self.pulling = false;
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub(crate) fn pending_reads(&self) -> usize {
        self.pending_reads.len()
    }
}

// ----------- Writable record -----------
pub(crate) struct PendingWrite<T> {
    pub(crate) chunk: T,
    pub(crate) requester: Requester<()>,
}

pub(crate) struct WritableRecord<T> {
    mirror: Rc<Mirror<WritableState>>,
    queue: VecDeque<PendingWrite<T>>,
    writing: bool,
    close_requested: bool,
    closing: bool,
    close_waiters: Vec<Requester<()>>,
    abort: AbortPhase,
    abort_waiters: Vec<Requester<()>>,
}

enum AbortPhase {
    Idle,
    Requested(Option<String>),
    Dispatched,
    Done,
}

impl<T> WritableRecord<T> {
    pub(crate) fn new(mirror: Rc<Mirror<WritableState>>) -> Self {
        Self {
            mirror,
            queue: VecDeque::new(),
            writing: false,
            close_requested: false,
            closing: false,
            close_waiters: Vec::new(),
            abort: AbortPhase::Idle,
            abort_waiters: Vec::new(),
        }
    }

    pub(crate) fn state(&self) -> WritableState {
        self.mirror.state()
    }

    pub(crate) fn write(&mut self, chunk: T, requester: Requester<()>) {
        if self.state() != WritableState::Writable {
            requester.reject(self.mirror.terminal_error(StreamError::Closed));
            return;
        }
        if self.close_requested {
            requester.reject(StreamError::Closing);
            return;
        }
        self.queue.push_back(PendingWrite { chunk, requester });
    }

    /// Dequeues the next write if nothing is in flight.
    pub(crate) fn next_write(&mut self) -> Option<PendingWrite<T>> {
        if self.state() != WritableState::Writable || self.writing {
            return None;
        }
        let next = self.queue.pop_front()?;
        self.writing = true;
        Some(next)
    }

    pub(crate) fn finish_write(&mut self, requester: Requester<()>, result: StreamResult<()>) {
        self.writing = false;
        match result {
            Ok(()) => requester.resolve(()),
            Err(err) => {
                requester.reject(err.clone());
                self.error(err);
            }
        }
    }

    pub(crate) fn close(&mut self, requester: Requester<()>) {
        match self.state() {
            WritableState::Closed => requester.resolve(()),
            WritableState::Errored => {
                requester.reject(self.mirror.terminal_error(StreamError::Closed));
            }
            WritableState::Writable => {
                self.close_requested = true;
                self.close_waiters.push(requester);
            }
        }
    }

    /// Queue drained, nothing in flight and a close is waiting.
    pub(crate) fn ready_to_close(&self) -> bool {
        self.state() == WritableState::Writable
            && self.close_requested
            && !self.closing
            && !self.writing
            && self.queue.is_empty()
    }

    pub(crate) fn begin_close(&mut self) {
        self.closing = true;
    }

    pub(crate) fn finish_close(&mut self, result: StreamResult<()>) {
        self.closing = false;
        match result {
            Ok(()) => {
                if self.state() == WritableState::Writable {
                    self.mirror.transition(WritableState::Closed, None);
                }
                for waiter in self.close_waiters.drain(..) {
                    waiter.resolve(());
                }
            }
            Err(err) => {
                self.error(err.clone());
                for waiter in self.close_waiters.drain(..) {
                    waiter.reject(err.clone());
                }
            }
        }
    }

    pub(crate) fn error(&mut self, err: StreamError) -> bool {
        if self.state() != WritableState::Writable {
            return false;
        }
        self.mirror
            .transition(WritableState::Errored, Some(err.clone()));
        for pending in self.queue.drain(..) {
            pending.requester.reject(err.clone());
        }
        if !self.closing {
            for waiter in self.close_waiters.drain(..) {
                waiter.reject(err.clone());
            }
        }
        true
    }

    /// Returns true when the sink's abort hook must run for this request.
    pub(crate) fn abort(&mut self, reason: Option<String>, requester: Requester<()>) -> bool {
        if self.closing {
            // The sink is already consumed by close; the abort settles with it.
            self.close_waiters.push(requester);
            return false;
        }
        match self.abort {
            AbortPhase::Requested(_) | AbortPhase::Dispatched => {
                self.abort_waiters.push(requester);
                return false;
            }
            AbortPhase::Done => {
                requester.resolve(());
                return false;
            }
            AbortPhase::Idle => {}
        }
        if self.state() != WritableState::Writable {
            requester.resolve(());
            return false;
        }
        self.error(StreamError::Aborted(reason.clone()));
        self.abort = AbortPhase::Requested(reason);
        self.abort_waiters.push(requester);
        true
    }

    /// Hands out the abort reason once no write is in flight.
    pub(crate) fn take_abort(&mut self) -> Option<Option<String>> {
        if self.writing || !matches!(self.abort, AbortPhase::Requested(_)) {
            return None;
        }
        match std::mem::replace(&mut self.abort, AbortPhase::Dispatched) {
            AbortPhase::Requested(reason) => Some(reason),
            _ => None,
        }
    }

    pub(crate) fn finish_abort(&mut self, result: StreamResult<()>) {
        self.abort = AbortPhase::Done;
        for waiter in self.abort_waiters.drain(..) {
            waiter.settle(result.clone());
        }
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }
}
