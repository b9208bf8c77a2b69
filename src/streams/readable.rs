use super::{
    error::StreamError,
    pipe::{PipeThroughBuilder, StreamPipeOptions},
    state::{Mirror, ReadableRecord, ReadableState, Requester, settled},
    tee::TeeBuilder,
    transform::TransformStream,
};
use futures::{
    channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
    future::{LocalBoxFuture, poll_fn},
    stream::{self, Stream, StreamExt},
};
use std::{marker::PhantomData, rc::Rc, task::Poll};

type StreamResult<T> = Result<T, StreamError>;

// ----------- Source Trait -----------
/// Producer side of a [`ReadableStream`].
///
/// `pull` is only invoked when a reader is waiting and no other pull is
/// outstanding; a pull that enqueues nothing is not retried until the next
/// read arrives.
pub trait ReadableSource<T: 'static>: 'static {
    fn start(
        &mut self,
        _controller: &mut ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> {
        async { Ok(()) }
    }

    fn pull(
        &mut self,
        _controller: &mut ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> {
        async { Ok(()) }
    }

    fn cancel(&mut self, _reason: Option<String>) -> impl Future<Output = StreamResult<()>> {
        async { Ok(()) }
    }
}

// ----------- Stream Commands -----------
pub(crate) enum StreamCommand<T> {
    Read {
        completion: Requester<Option<T>>,
    },
    Cancel {
        reason: Option<String>,
        completion: Requester<()>,
    },
    /// The reader holding the lock let go; its reads no longer count.
    Release,
}

// ----------- Controller Messages -----------
enum ControllerMsg<T> {
    Enqueue { chunk: T },
    Close,
    Error(StreamError),
}

// ----------- Controller -----------
pub struct ReadableStreamDefaultController<T: 'static> {
    tx: UnboundedSender<ControllerMsg<T>>,
    mirror: Rc<Mirror<ReadableState>>,
}

impl<T: 'static> Clone for ReadableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            mirror: self.mirror.clone(),
        }
    }
}

impl<T: 'static> ReadableStreamDefaultController<T> {
    /// Hands `chunk` to the oldest waiting reader, or queues it.
    ///
    /// Fails once `close` or `error` has been requested.
    pub fn enqueue(&self, chunk: T) -> StreamResult<()> {
        if self.mirror.state() != ReadableState::Readable || self.mirror.is_shutting_down() {
            return Err(self.mirror.terminal_error(StreamError::Closed));
        }
        self.tx
            .unbounded_send(ControllerMsg::Enqueue { chunk })
            .map_err(|_| StreamError::TaskDropped)?;
        self.mirror.note_enqueued();
        Ok(())
    }

    /// Resolves once every enqueued chunk has reached a reader, or the stream
    /// stopped being readable.
    pub(crate) async fn drained(&self) {
        poll_fn(|cx| self.mirror.poll_drained(cx)).await
    }

    /// Closes the stream once queued chunks are consumed. Repeated calls are no-ops.
    pub fn close(&self) -> StreamResult<()> {
        if self.mirror.state() != ReadableState::Readable || !self.mirror.begin_shutdown() {
            return Ok(());
        }
        self.tx
            .unbounded_send(ControllerMsg::Close)
            .map_err(|_| StreamError::TaskDropped)
    }

    pub fn error(&self, error: StreamError) -> StreamResult<()> {
        if self.mirror.state() != ReadableState::Readable {
            return Ok(());
        }
        self.mirror.begin_shutdown();
        self.tx
            .unbounded_send(ControllerMsg::Error(error))
            .map_err(|_| StreamError::TaskDropped)
    }

    pub fn state(&self) -> ReadableState {
        self.mirror.state()
    }
}

// ----------- ReadableStream -----------
pub struct ReadableStream<T: 'static> {
    command_tx: UnboundedSender<StreamCommand<T>>,
    mirror: Rc<Mirror<ReadableState>>,
    pub(crate) controller: ReadableStreamDefaultController<T>,
}

impl<T: 'static> ReadableStream<T> {
    pub fn builder<Source: ReadableSource<T>>(source: Source) -> ReadableStreamBuilder<T, Source> {
        ReadableStreamBuilder::new(source)
    }

    pub(crate) fn new_inner<Source: ReadableSource<T>>(
        source: Source,
    ) -> (Self, impl Future<Output = ()>) {
        let (command_tx, command_rx) = unbounded();
        let (ctrl_tx, ctrl_rx) = unbounded();
        let mirror = Mirror::new(ReadableState::Readable);
        let controller = ReadableStreamDefaultController {
            tx: ctrl_tx,
            mirror: mirror.clone(),
        };

        let task = readable_stream_task(
            command_rx,
            ctrl_rx,
            ReadableRecord::new(mirror.clone()),
            source,
            controller.clone(),
        );

        let stream = Self {
            command_tx,
            mirror,
            controller,
        };
        (stream, task)
    }

    pub fn locked(&self) -> bool {
        self.mirror.is_locked()
    }

    pub fn state(&self) -> ReadableState {
        self.mirror.state()
    }

    /// Cancels the stream without taking a reader. Fails while locked.
    pub async fn cancel(&self, reason: Option<String>) -> StreamResult<()> {
        if self.locked() {
            return Err(StreamError::Locked);
        }
        send_cancel(&self.command_tx, reason).await
    }

    pub fn get_reader(&self) -> StreamResult<ReadableStreamDefaultReader<T>> {
        self.mirror.try_lock()?;
        Ok(ReadableStreamDefaultReader {
            command_tx: self.command_tx.clone(),
            mirror: self.mirror.clone(),
        })
    }

    /// Pipes this stream through `transform`, returning the transform's
    /// readable side once spawned.
    pub fn pipe_through<O: 'static>(
        self,
        transform: TransformStream<T, O>,
        options: Option<StreamPipeOptions>,
    ) -> PipeThroughBuilder<T, O> {
        PipeThroughBuilder::new(self, transform, options)
    }
}

impl<T: Clone + 'static> ReadableStream<T> {
    pub fn tee(self) -> TeeBuilder<T> {
        TeeBuilder::new(self)
    }
}

impl<T: 'static> ReadableStream<T> {
    pub fn from_vec(vec: Vec<T>) -> ReadableStreamBuilder<T, IteratorSource<std::vec::IntoIter<T>>> {
        ReadableStreamBuilder::from_iterator(vec.into_iter())
    }

    pub fn from_iterator<I>(iter: I) -> ReadableStreamBuilder<T, IteratorSource<I>>
    where
        I: Iterator<Item = T> + 'static,
    {
        ReadableStreamBuilder::from_iterator(iter)
    }

    pub fn from_stream<S>(stream: S) -> ReadableStreamBuilder<T, AsyncStreamSource<S>>
    where
        S: Stream<Item = T> + Unpin + 'static,
    {
        ReadableStreamBuilder::new(AsyncStreamSource { stream })
    }
}

async fn send_cancel<T>(
    command_tx: &UnboundedSender<StreamCommand<T>>,
    reason: Option<String>,
) -> StreamResult<()> {
    let (completion, rx) = Requester::new();
    command_tx
        .unbounded_send(StreamCommand::Cancel { reason, completion })
        .map_err(|_| StreamError::TaskDropped)?;
    settled(rx).await
}

// ----------- Default Reader -----------
pub struct ReadableStreamDefaultReader<T: 'static> {
    command_tx: UnboundedSender<StreamCommand<T>>,
    mirror: Rc<Mirror<ReadableState>>,
}

impl<T: 'static> ReadableStreamDefaultReader<T> {
    /// Next chunk, or `None` once the stream is closed and drained.
    pub async fn read(&self) -> StreamResult<Option<T>> {
        let (completion, rx) = Requester::new();
        self.command_tx
            .unbounded_send(StreamCommand::Read { completion })
            .map_err(|_| StreamError::TaskDropped)?;
        settled(rx).await
    }

    pub async fn cancel(&self, reason: Option<String>) -> StreamResult<()> {
        send_cancel(&self.command_tx, reason).await
    }

    pub async fn closed(&self) -> StreamResult<()> {
        poll_fn(|cx| self.mirror.poll_closed(cx)).await
    }

    pub fn release_lock(self) {
        drop(self);
    }

    /// Adapts the reader into a `futures::Stream`. The stream ends after the
    /// first error.
    pub fn into_stream(self) -> impl Stream<Item = StreamResult<T>> {
        stream::unfold(Some(self), |reader| async move {
            let reader = reader?;
            match reader.read().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(reader))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}

impl<T: 'static> Drop for ReadableStreamDefaultReader<T> {
    fn drop(&mut self) {
        // Ordered ahead of any read from the next reader.
        let _ = self.command_tx.unbounded_send(StreamCommand::Release);
        self.mirror.unlock();
    }
}

// ----------- Built-in Sources -----------
pub struct IteratorSource<I> {
    iter: I,
}

impl<T: 'static, I> ReadableSource<T> for IteratorSource<I>
where
    I: Iterator<Item = T> + 'static,
{
    async fn pull(&mut self, controller: &mut ReadableStreamDefaultController<T>) -> StreamResult<()> {
        match self.iter.next() {
            Some(item) => controller.enqueue(item),
            None => controller.close(),
        }
    }
}

pub struct AsyncStreamSource<S> {
    stream: S,
}

impl<T: 'static, S> ReadableSource<T> for AsyncStreamSource<S>
where
    S: Stream<Item = T> + Unpin + 'static,
{
    async fn pull(&mut self, controller: &mut ReadableStreamDefaultController<T>) -> StreamResult<()> {
        match self.stream.next().await {
            Some(item) => controller.enqueue(item),
            None => controller.close(),
        }
    }
}

// ----------- Builder -----------
pub struct ReadableStreamBuilder<T: 'static, Source> {
    source: Source,
    _phantom: PhantomData<T>,
}

impl<T: 'static, Source: ReadableSource<T>> ReadableStreamBuilder<T, Source> {
    fn new(source: Source) -> Self {
        Self {
            source,
            _phantom: PhantomData,
        }
    }

    /// Return stream + future without spawning
    pub fn prepare(self) -> (ReadableStream<T>, impl Future<Output = ()>) {
        ReadableStream::new_inner(self.source)
    }

    pub fn spawn<F, R>(self, spawn_fn: F) -> ReadableStream<T>
    where
        F: FnOnce(LocalBoxFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }
}

impl<T: 'static, I> ReadableStreamBuilder<T, IteratorSource<I>>
where
    I: Iterator<Item = T> + 'static,
{
    pub fn from_iterator(iter: I) -> Self {
        Self::new(IteratorSource { iter })
    }
}

// ----------- Stream Task -----------
async fn readable_stream_task<T: 'static, Source: ReadableSource<T>>(
    mut command_rx: UnboundedReceiver<StreamCommand<T>>,
    mut ctrl_rx: UnboundedReceiver<ControllerMsg<T>>,
    mut record: ReadableRecord<T>,
    mut source: Source,
    mut controller: ReadableStreamDefaultController<T>,
) {
    // Nothing is served until start settles.
    if let Err(err) = source.start(&mut controller).await {
        tracing::warn!(error = %err, "readable source failed to start");
        record.error(err);
    }

    let mut source = Some(source);
    let mut pull_future: Option<LocalBoxFuture<'static, (Source, StreamResult<()>)>> = None;
    let mut cancel_future: Option<LocalBoxFuture<'static, StreamResult<()>>> = None;
    let mut cancel_request: Option<Option<String>> = None;
    let mut cancel_waiters: Vec<Requester<()>> = Vec::new();
    let mut commands_closed = false;

    poll_fn(|cx| {
        while let Poll::Ready(Some(msg)) = ctrl_rx.poll_next_unpin(cx) {
            match msg {
                ControllerMsg::Enqueue { chunk } => {
                    if record.enqueue(chunk).is_err() {
                        tracing::trace!("dropping chunk enqueued after shutdown");
                    }
                }
                ControllerMsg::Close => {
                    if record.close() {
                        tracing::debug!("readable stream close requested");
                    }
                }
                ControllerMsg::Error(err) => {
                    if record.error(err.clone()) {
                        tracing::debug!(error = %err, "readable stream errored by controller");
                    }
                }
            }
        }

        while !commands_closed {
            match command_rx.poll_next_unpin(cx) {
                Poll::Ready(Some(StreamCommand::Read { completion })) => record.read(completion),
                Poll::Ready(Some(StreamCommand::Release)) => {
                    tracing::trace!("reader released");
                    record.release_reads();
                }
                Poll::Ready(Some(StreamCommand::Cancel { reason, completion })) => {
                    if cancel_request.is_some() || cancel_future.is_some() {
                        cancel_waiters.push(completion);
                    } else if record.cancel(reason.clone()) {
                        tracing::debug!(reason = ?reason, "readable stream canceled");
                        cancel_request = Some(reason);
                        cancel_waiters.push(completion);
                    } else {
                        completion.resolve(());
                    }
                }
                Poll::Ready(None) => commands_closed = true,
                Poll::Pending => break,
            }
        }

        // A cancel waits for any in-flight pull to hand the source back.
        if cancel_request.is_some() && cancel_future.is_none() {
            if let Some(mut src) = source.take() {
                let reason = cancel_request.take().flatten();
                cancel_future = Some(Box::pin(async move { src.cancel(reason).await }));
            }
        }

        if let Some(fut) = cancel_future.as_mut() {
            if let Poll::Ready(result) = fut.as_mut().poll(cx) {
                cancel_future = None;
                if let Err(err) = &result {
                    tracing::debug!(error = %err, "readable source cancel failed");
                }
                for waiter in cancel_waiters.drain(..) {
                    waiter.settle(result.clone());
                }
                cx.waker().wake_by_ref();
            }
        }

        if !commands_closed && pull_future.is_none() && record.should_pull() {
            if let Some(mut src) = source.take() {
                record.begin_pull();
                tracing::trace!("pulling from readable source");
                let mut controller = controller.clone();
                pull_future = Some(Box::pin(async move {
                    let result = src.pull(&mut controller).await;
                    (src, result)
                }));
            }
        }

        if let Some(fut) = pull_future.as_mut() {
            if let Poll::Ready((src, result)) = fut.as_mut().poll(cx) {
                pull_future = None;
                record.end_pull();
                source = Some(src);
                if let Err(err) = result {
                    if record.error(err.clone()) {
                        tracing::debug!(error = %err, "readable source pull failed");
                    }
                }
                cx.waker().wake_by_ref();
            }
        }

        if commands_closed
            && pull_future.is_none()
            && cancel_future.is_none()
            && cancel_request.is_none()
        {
            return Poll::Ready(());
        }
        Poll::Pending
    })
    .await;

    tracing::trace!("readable stream task finished");
}
