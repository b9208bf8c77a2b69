//! Forking one readable into two branches.
//!
//! Branch pulls only signal a shared coordinator, which reads the source once
//! per round and hands every chunk to each branch that has not been canceled.
//! Pull signals that arrive while a read is outstanding are folded into that
//! read. The source is canceled only once both branches are canceled or gone.

use super::{
    error::StreamError,
    readable::{
        ReadableSource, ReadableStream, ReadableStreamDefaultController,
        ReadableStreamDefaultReader,
    },
};
use futures::{
    channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
    future::LocalBoxFuture,
    stream::StreamExt,
};
use std::{
    cell::{Cell, OnceCell, RefCell},
    rc::Rc,
};

type StreamResult<T> = Result<T, StreamError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TeeSourceId {
    Branch1,
    Branch2,
}

impl TeeSourceId {
    fn index(self) -> usize {
        match self {
            TeeSourceId::Branch1 => 0,
            TeeSourceId::Branch2 => 1,
        }
    }
}

struct TeeBranch<T: 'static> {
    canceled: Cell<bool>,
    reason: RefCell<Option<String>>,
    controller: OnceCell<ReadableStreamDefaultController<T>>,
}

impl<T: 'static> TeeBranch<T> {
    fn new() -> Self {
        Self {
            canceled: Cell::new(false),
            reason: RefCell::new(None),
            controller: OnceCell::new(),
        }
    }

    fn controller(&self) -> Option<&ReadableStreamDefaultController<T>> {
        self.controller.get()
    }
}

struct TeeState<T: 'static> {
    reader: ReadableStreamDefaultReader<T>,
    source_canceled: Cell<bool>,
    branches: [TeeBranch<T>; 2],
}

impl<T: Clone + 'static> TeeState<T> {
    fn distribute(&self, chunk: T) {
        let live: Vec<&TeeBranch<T>> =
            self.branches.iter().filter(|b| !b.canceled.get()).collect();
        let Some((last, rest)) = live.split_last() else {
            return;
        };
        for branch in rest {
            Self::enqueue(branch, chunk.clone());
        }
        Self::enqueue(last, chunk);
    }

    fn enqueue(branch: &TeeBranch<T>, chunk: T) {
        let Some(controller) = branch.controller() else {
            return;
        };
        if let Err(err) = controller.enqueue(chunk) {
            // A branch whose stream is gone can no longer observe anything.
            tracing::warn!(error = %err, "tee branch rejected chunk");
            if matches!(err, StreamError::TaskDropped) {
                branch.canceled.set(true);
            }
        }
    }

    fn close_branches(&self) {
        for branch in self.branches.iter().filter(|b| !b.canceled.get()) {
            if let Some(controller) = branch.controller() {
                let _ = controller.close();
            }
        }
    }

    fn error_branches(&self, err: StreamError) {
        for branch in &self.branches {
            if let Some(controller) = branch.controller() {
                let _ = controller.error(err.clone());
            }
        }
    }

    /// Cancels the source unless a branch cancel already did.
    async fn cancel_source(&self, why: &str) {
        if self.source_canceled.replace(true) {
            return;
        }
        let reason = self.combined_reason();
        tracing::debug!(reason = ?reason, "{why}; canceling source");
        if let Err(err) = self.reader.cancel(reason).await {
            tracing::debug!(error = %err, "tee source cancel failed");
        }
    }

    fn combined_reason(&self) -> Option<String> {
        let reasons: Vec<Option<String>> =
            self.branches.iter().map(|b| b.reason.borrow().clone()).collect();
        if reasons.iter().all(Option::is_none) {
            return None;
        }
        let parts: Vec<&str> = reasons
            .iter()
            .map(|r| r.as_deref().unwrap_or("no reason"))
            .collect();
        Some(format!("[{}]", parts.join(", ")))
    }
}

/// Readable source backing one tee branch
pub struct TeeSource<T: 'static> {
    state: Rc<TeeState<T>>,
    pull_tx: UnboundedSender<()>,
    branch_id: TeeSourceId,
}

impl<T: Clone + 'static> ReadableSource<T> for TeeSource<T> {
    async fn pull(&mut self, _controller: &mut ReadableStreamDefaultController<T>) -> StreamResult<()> {
        // The coordinator may already be gone after the source finished.
        let _ = self.pull_tx.unbounded_send(());
        Ok(())
    }

    async fn cancel(&mut self, reason: Option<String>) -> StreamResult<()> {
        let branch = &self.state.branches[self.branch_id.index()];
        branch.canceled.set(true);
        *branch.reason.borrow_mut() = reason;

        let both_canceled = self.state.branches.iter().all(|b| b.canceled.get());
        if !both_canceled || self.state.source_canceled.replace(true) {
            return Ok(());
        }
        let reason = self.state.combined_reason();
        tracing::debug!(reason = ?reason, "both tee branches canceled; canceling source");
        self.state.reader.cancel(reason).await
    }
}

async fn run_coordinator<T: Clone + 'static>(
    state: Rc<TeeState<T>>,
    mut pull_rx: UnboundedReceiver<()>,
) {
    loop {
        if pull_rx.next().await.is_none() {
            // Both branch tasks ended without canceling.
            state.cancel_source("tee branches dropped").await;
            break;
        }
        if state.source_canceled.get() {
            break;
        }
        let result = state.reader.read().await;
        // Pull signals raised during the read were served by it.
        while let Ok(Some(())) = pull_rx.try_next() {}

        match result {
            Ok(Some(chunk)) => {
                state.distribute(chunk);
                if state.branches.iter().all(|b| b.canceled.get()) {
                    state.cancel_source("no tee branch left").await;
                    break;
                }
            }
            Ok(None) => {
                state.close_branches();
                break;
            }
            Err(err) => {
                tracing::debug!(error = %err, "tee source errored");
                state.error_branches(err);
                break;
            }
        }
    }
    tracing::trace!("tee coordinator finished");
}

pub struct TeeBuilder<T: Clone + 'static> {
    stream: ReadableStream<T>,
}

impl<T: Clone + 'static> TeeBuilder<T> {
    pub(crate) fn new(stream: ReadableStream<T>) -> Self {
        Self { stream }
    }

    /// Prepare without spawning: returns streams + futures for coordinator and branches
    pub fn prepare(
        self,
    ) -> StreamResult<(
        ReadableStream<T>,
        ReadableStream<T>,
        impl Future<Output = ()>, // coordinator future
        impl Future<Output = ()>, // branch1 future
        impl Future<Output = ()>, // branch2 future
    )> {
        let reader = self.stream.get_reader()?;
        let (pull_tx, pull_rx) = unbounded();
        let state = Rc::new(TeeState {
            reader,
            source_canceled: Cell::new(false),
            branches: [TeeBranch::new(), TeeBranch::new()],
        });

        let (stream1, rfut1) = ReadableStream::new_inner(TeeSource {
            state: state.clone(),
            pull_tx: pull_tx.clone(),
            branch_id: TeeSourceId::Branch1,
        });
        let (stream2, rfut2) = ReadableStream::new_inner(TeeSource {
            state: state.clone(),
            pull_tx,
            branch_id: TeeSourceId::Branch2,
        });
        let _ = state.branches[0].controller.set(stream1.controller.clone());
        let _ = state.branches[1].controller.set(stream2.controller.clone());

        let coordinator = run_coordinator(state, pull_rx);
        Ok((stream1, stream2, coordinator, rfut1, rfut2))
    }

    /// Spawn the coordinator and both branches in a single task
    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<(ReadableStream<T>, ReadableStream<T>)>
    where
        F: FnOnce(LocalBoxFuture<'static, ()>) -> R,
    {
        let (stream1, stream2, coord_fut, rfut1, rfut2) = self.prepare()?;
        let fut = async move {
            futures::join!(coord_fut, rfut1, rfut2);
        };
        spawn_fn(Box::pin(fut));
        Ok((stream1, stream2))
    }

    /// Spawn each part separately
    pub fn spawn_parts<R1, R2, R3, F1, F2, F3>(
        self,
        coordinator_spawn: F1,
        branch1_spawn: F2,
        branch2_spawn: F3,
    ) -> StreamResult<(ReadableStream<T>, ReadableStream<T>)>
    where
        F1: FnOnce(LocalBoxFuture<'static, ()>) -> R1,
        F2: FnOnce(LocalBoxFuture<'static, ()>) -> R2,
        F3: FnOnce(LocalBoxFuture<'static, ()>) -> R3,
    {
        let (stream1, stream2, coord_fut, rfut1, rfut2) = self.prepare()?;
        coordinator_spawn(Box::pin(coord_fut));
        branch1_spawn(Box::pin(rfut1));
        branch2_spawn(Box::pin(rfut2));
        Ok((stream1, stream2))
    }
}
