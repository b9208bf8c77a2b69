use super::{
    error::StreamError,
    state::{Mirror, Requester, WritableRecord, WritableState, settled},
};
use crate::abort::{AbortController, AbortSignal};
use futures::{
    channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
    future::{self, LocalBoxFuture, poll_fn},
    stream::StreamExt,
};
use std::{marker::PhantomData, rc::Rc, task::Poll};

type StreamResult<T> = Result<T, StreamError>;

// ----------- Sink Trait -----------
pub trait WritableSink<T: 'static>: Sized + 'static {
    /// Start the sink
    fn start(
        &mut self,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> {
        let _ = controller;
        future::ready(Ok(())) // default no-op
    }

    /// Write a chunk to the sink. Never called while another write is in flight.
    fn write(
        &mut self,
        chunk: T,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>>;

    /// Close the sink
    fn close(self) -> impl Future<Output = StreamResult<()>> {
        future::ready(Ok(())) // default no-op
    }

    /// Abort the sink
    fn abort(&mut self, reason: Option<String>) -> impl Future<Output = StreamResult<()>> {
        let _ = reason;
        future::ready(Ok(())) // default no-op
    }
}

// ----------- Stream Commands -----------
enum StreamCommand<T> {
    Write {
        chunk: T,
        completion: Requester<()>,
    },
    Close {
        completion: Requester<()>,
    },
    Abort {
        reason: Option<String>,
        completion: Requester<()>,
    },
}

enum ControllerMsg {
    Error(StreamError),
}

enum InFlight<Sink> {
    Write {
        sink: Sink,
        completion: Requester<()>,
        result: StreamResult<()>,
    },
    Close {
        result: StreamResult<()>,
    },
    Abort {
        sink: Sink,
        result: StreamResult<()>,
    },
}

// ----------- Controller -----------
#[derive(Clone)]
pub struct WritableStreamDefaultController {
    tx: UnboundedSender<ControllerMsg>,
    mirror: Rc<Mirror<WritableState>>,
    signal: AbortSignal,
}

impl WritableStreamDefaultController {
    /// Signal an error on the stream. No-op once the stream is closed or errored.
    pub fn error(&self, error: StreamError) {
        if self.mirror.state() != WritableState::Writable {
            return;
        }
        // ignore send failure if the task is gone
        let _ = self.tx.unbounded_send(ControllerMsg::Error(error));
    }

    /// Fires when the stream is aborted, including while a write is in flight.
    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.signal.aborted()
    }

    /// Races a future against the abort signal.
    ///
    /// If the abort fires first, returns `Err(StreamError::Aborted)`.
    ///
    /// ```no_run
    /// # use bridged_streams::{StreamError, WritableSink, WritableStreamDefaultController};
    /// # struct Slow;
    /// impl WritableSink<Vec<u8>> for Slow {
    ///     async fn write(
    ///         &mut self,
    ///         _chunk: Vec<u8>,
    ///         controller: &mut WritableStreamDefaultController,
    ///     ) -> Result<(), StreamError> {
    ///         controller
    ///             .with_abort(tokio::time::sleep(std::time::Duration::from_millis(200)))
    ///             .await
    ///     }
    /// }
    /// ```
    pub async fn with_abort<F: Future>(&self, fut: F) -> StreamResult<F::Output> {
        self.signal.race(fut).await
    }
}

// ----------- WritableStream -----------
pub struct WritableStream<T: 'static> {
    command_tx: UnboundedSender<StreamCommand<T>>,
    mirror: Rc<Mirror<WritableState>>,
}

impl<T: 'static> WritableStream<T> {
    pub fn builder<Sink: WritableSink<T>>(sink: Sink) -> WritableStreamBuilder<T, Sink> {
        WritableStreamBuilder::new(sink)
    }

    pub(crate) fn new_inner<Sink: WritableSink<T>>(sink: Sink) -> (Self, impl Future<Output = ()>) {
        let (command_tx, command_rx) = unbounded();
        let (ctrl_tx, ctrl_rx) = unbounded();
        let mirror = Mirror::new(WritableState::Writable);
        let abort_controller = AbortController::new();
        let controller = WritableStreamDefaultController {
            tx: ctrl_tx,
            mirror: mirror.clone(),
            signal: abort_controller.signal(),
        };

        let task = writable_stream_task(
            command_rx,
            ctrl_rx,
            WritableRecord::new(mirror.clone()),
            sink,
            controller,
            abort_controller,
        );
        (Self { command_tx, mirror }, task)
    }

    pub fn locked(&self) -> bool {
        self.mirror.is_locked()
    }

    pub fn state(&self) -> WritableState {
        self.mirror.state()
    }

    pub fn get_writer(&self) -> StreamResult<WritableStreamDefaultWriter<T>> {
        self.mirror.try_lock()?;
        Ok(WritableStreamDefaultWriter {
            command_tx: self.command_tx.clone(),
            mirror: self.mirror.clone(),
        })
    }

    /// Aborts the stream without taking a writer. Fails while locked.
    pub async fn abort(&self, reason: Option<String>) -> StreamResult<()> {
        if self.locked() {
            return Err(StreamError::Locked);
        }
        send_abort(&self.command_tx, reason).await
    }

    /// Closes the stream without taking a writer. Fails while locked.
    pub async fn close(&self) -> StreamResult<()> {
        if self.locked() {
            return Err(StreamError::Locked);
        }
        send_close(&self.command_tx).await
    }
}

async fn send_close<T>(command_tx: &UnboundedSender<StreamCommand<T>>) -> StreamResult<()> {
    let (completion, rx) = Requester::new();
    command_tx
        .unbounded_send(StreamCommand::Close { completion })
        .map_err(|_| StreamError::TaskDropped)?;
    settled(rx).await
}

async fn send_abort<T>(
    command_tx: &UnboundedSender<StreamCommand<T>>,
    reason: Option<String>,
) -> StreamResult<()> {
    let (completion, rx) = Requester::new();
    command_tx
        .unbounded_send(StreamCommand::Abort { reason, completion })
        .map_err(|_| StreamError::TaskDropped)?;
    settled(rx).await
}

// ----------- Default Writer -----------
pub struct WritableStreamDefaultWriter<T: 'static> {
    command_tx: UnboundedSender<StreamCommand<T>>,
    mirror: Rc<Mirror<WritableState>>,
}

impl<T: 'static> WritableStreamDefaultWriter<T> {
    /// Queues `chunk` immediately and returns a future for its completion.
    ///
    /// The chunk takes its place in the queue at call time, so writes issued
    /// back to back reach the sink in call order even if their futures are
    /// awaited later or together.
    pub fn write(&self, chunk: T) -> impl Future<Output = StreamResult<()>> + use<T> {
        let queued = if self.mirror.state() != WritableState::Writable {
            Err(self.mirror.terminal_error(StreamError::Closed))
        } else {
            let (completion, rx) = Requester::new();
            self.command_tx
                .unbounded_send(StreamCommand::Write { chunk, completion })
                .map(|()| rx)
                .map_err(|_| StreamError::TaskDropped)
        };

        async move { settled(queued?).await }
    }

    /// Resolves once every queued write has reached the sink and the sink closed.
    pub async fn close(&self) -> StreamResult<()> {
        send_close(&self.command_tx).await
    }

    pub async fn abort(&self, reason: Option<String>) -> StreamResult<()> {
        send_abort(&self.command_tx, reason).await
    }

    pub async fn closed(&self) -> StreamResult<()> {
        poll_fn(|cx| self.mirror.poll_closed(cx)).await
    }

    pub fn release_lock(self) {
        drop(self);
    }
}

impl<T: 'static> Drop for WritableStreamDefaultWriter<T> {
    fn drop(&mut self) {
        self.mirror.unlock();
    }
}

// ----------- Builder -----------
pub struct WritableStreamBuilder<T: 'static, Sink> {
    sink: Sink,
    _phantom: PhantomData<T>,
}

impl<T: 'static, Sink: WritableSink<T>> WritableStreamBuilder<T, Sink> {
    fn new(sink: Sink) -> Self {
        Self {
            sink,
            _phantom: PhantomData,
        }
    }

    /// Return stream + future without spawning
    pub fn prepare(self) -> (WritableStream<T>, impl Future<Output = ()>) {
        WritableStream::new_inner(self.sink)
    }

    pub fn spawn<F, R>(self, spawn_fn: F) -> WritableStream<T>
    where
        F: FnOnce(LocalBoxFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }
}

// ----------- Stream Task -----------
async fn writable_stream_task<T: 'static, Sink: WritableSink<T>>(
    mut command_rx: UnboundedReceiver<StreamCommand<T>>,
    mut ctrl_rx: UnboundedReceiver<ControllerMsg>,
    mut record: WritableRecord<T>,
    mut sink: Sink,
    mut controller: WritableStreamDefaultController,
    abort_controller: AbortController,
) {
    if let Err(err) = sink.start(&mut controller).await {
        tracing::warn!(error = %err, "writable sink failed to start");
        record.error(err);
    }

    let mut sink = Some(sink);
    let mut in_flight: Option<LocalBoxFuture<'static, InFlight<Sink>>> = None;
    let mut commands_closed = false;

    poll_fn(|cx| {
        while let Poll::Ready(Some(ControllerMsg::Error(err))) = ctrl_rx.poll_next_unpin(cx) {
            if record.error(err.clone()) {
                tracing::debug!(error = %err, "writable stream errored by controller");
            }
        }

        while !commands_closed {
            match command_rx.poll_next_unpin(cx) {
                Poll::Ready(Some(StreamCommand::Write { chunk, completion })) => {
                    record.write(chunk, completion);
                }
                Poll::Ready(Some(StreamCommand::Close { completion })) => record.close(completion),
                Poll::Ready(Some(StreamCommand::Abort { reason, completion })) => {
                    if record.abort(reason.clone(), completion) {
                        tracing::debug!(reason = ?reason, "writable stream aborted");
                        abort_controller.abort(reason);
                    }
                }
                Poll::Ready(None) => commands_closed = true,
                Poll::Pending => break,
            }
        }

        if in_flight.is_none() {
            if let Some(mut current) = sink.take() {
                if let Some(reason) = record.take_abort() {
                    in_flight = Some(Box::pin(async move {
                        let result = current.abort(reason).await;
                        InFlight::Abort {
                            sink: current,
                            result,
                        }
                    }));
                } else if let Some(pending) = record.next_write() {
                    tracing::trace!("dispatching write to sink");
                    let mut controller = controller.clone();
                    in_flight = Some(Box::pin(async move {
                        let result = current.write(pending.chunk, &mut controller).await;
                        InFlight::Write {
                            sink: current,
                            completion: pending.requester,
                            result,
                        }
                    }));
                } else if record.ready_to_close() {
                    record.begin_close();
                    in_flight = Some(Box::pin(async move {
                        InFlight::Close {
                            result: current.close().await,
                        }
                    }));
                } else {
                    sink = Some(current);
                }
            }
        }

        if let Some(fut) = in_flight.as_mut() {
            if let Poll::Ready(done) = fut.as_mut().poll(cx) {
                in_flight = None;
                match done {
                    InFlight::Write {
                        sink: returned,
                        completion,
                        result,
                    } => {
                        sink = Some(returned);
                        if let Err(err) = &result {
                            tracing::debug!(error = %err, "sink write failed");
                        }
                        record.finish_write(completion, result);
                    }
                    InFlight::Close { result } => {
                        tracing::debug!(ok = result.is_ok(), "writable stream closed");
                        record.finish_close(result);
                    }
                    InFlight::Abort {
                        sink: returned,
                        result,
                    } => {
                        sink = Some(returned);
                        record.finish_abort(result);
                    }
                }
                cx.waker().wake_by_ref();
            }
        }

        if commands_closed && in_flight.is_none() {
            return Poll::Ready(());
        }
        Poll::Pending
    })
    .await;

    tracing::trace!("writable stream task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        cell::{Cell, RefCell},
        time::Duration,
    };
    use tokio::{task::LocalSet, time::timeout};

    #[derive(Default, Clone)]
    struct Log {
        chunks: Rc<RefCell<Vec<i32>>>,
        active: Rc<Cell<usize>>,
        max_active: Rc<Cell<usize>>,
        closed: Rc<Cell<usize>>,
        aborted: Rc<RefCell<Vec<Option<String>>>>,
    }

    struct RecordingSink {
        log: Log,
        delay: Duration,
        fail_on: Option<i32>,
    }

    impl RecordingSink {
        fn new(log: &Log) -> Self {
            Self {
                log: log.clone(),
                delay: Duration::ZERO,
                fail_on: None,
            }
        }
    }

    impl WritableSink<i32> for RecordingSink {
        async fn write(
            &mut self,
            chunk: i32,
            _controller: &mut WritableStreamDefaultController,
        ) -> StreamResult<()> {
            let log = &self.log;
            log.active.set(log.active.get() + 1);
            log.max_active.set(log.max_active.get().max(log.active.get()));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            log.active.set(log.active.get() - 1);
            if self.fail_on == Some(chunk) {
                return Err(format!("refused {chunk}").into());
            }
            log.chunks.borrow_mut().push(chunk);
            Ok(())
        }

        async fn close(self) -> StreamResult<()> {
            self.log.closed.set(self.log.closed.get() + 1);
            Ok(())
        }

        async fn abort(&mut self, reason: Option<String>) -> StreamResult<()> {
            self.log.aborted.borrow_mut().push(reason);
            Ok(())
        }
    }

    #[tokio::test]
    async fn writes_reach_sink_in_order_one_at_a_time() {
        LocalSet::new()
            .run_until(async {
                let log = Log::default();
                let mut sink = RecordingSink::new(&log);
                sink.delay = Duration::from_millis(2);
                let stream = WritableStream::builder(sink).spawn(tokio::task::spawn_local);
                let writer = stream.get_writer().unwrap();

                let writes: Vec<_> = (0..5).map(|i| writer.write(i)).collect();
                for result in futures::future::join_all(writes).await {
                    result.unwrap();
                }

                assert_eq!(*log.chunks.borrow(), vec![0, 1, 2, 3, 4]);
                assert_eq!(log.max_active.get(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn close_waits_for_queued_writes() {
        LocalSet::new()
            .run_until(async {
                let log = Log::default();
                let mut sink = RecordingSink::new(&log);
                sink.delay = Duration::from_millis(2);
                let stream = WritableStream::builder(sink).spawn(tokio::task::spawn_local);
                let writer = stream.get_writer().unwrap();

                let first = writer.write(1);
                let second = writer.write(2);
                writer.close().await.unwrap();

                assert_eq!(*log.chunks.borrow(), vec![1, 2]);
                assert_eq!(log.closed.get(), 1);
                first.await.unwrap();
                second.await.unwrap();
                writer.closed().await.unwrap();
                assert_eq!(stream.state(), WritableState::Closed);

                // Repeated close on a closed stream resolves immediately.
                writer.close().await.unwrap();
                assert_eq!(log.closed.get(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn write_after_close_is_rejected() {
        LocalSet::new()
            .run_until(async {
                let log = Log::default();
                let stream =
                    WritableStream::builder(RecordingSink::new(&log)).spawn(tokio::task::spawn_local);
                let writer = stream.get_writer().unwrap();

                let close = writer.close();
                futures::pin_mut!(close);
                assert!(futures::poll!(&mut close).is_pending());

                let late = writer.write(9).await;
                assert!(matches!(late, Err(StreamError::Closing)));
                close.await.unwrap();

                let after = writer.write(10).await;
                assert!(matches!(after, Err(StreamError::Closed)));
                assert!(log.chunks.borrow().is_empty());
            })
            .await;
    }

    #[tokio::test]
    async fn failed_write_errors_stream_and_rejects_queue() {
        LocalSet::new()
            .run_until(async {
                let log = Log::default();
                let mut sink = RecordingSink::new(&log);
                sink.fail_on = Some(2);
                let stream = WritableStream::builder(sink).spawn(tokio::task::spawn_local);
                let writer = stream.get_writer().unwrap();

                let writes = vec![writer.write(1), writer.write(2), writer.write(3)];
                let results = futures::future::join_all(writes).await;

                assert!(results[0].is_ok());
                assert_eq!(results[1].as_ref().unwrap_err().to_string(), "refused 2");
                assert_eq!(results[2].as_ref().unwrap_err().to_string(), "refused 2");
                assert_eq!(*log.chunks.borrow(), vec![1]);
                assert_eq!(stream.state(), WritableState::Errored);
                assert_eq!(writer.closed().await.unwrap_err().to_string(), "refused 2");
                assert!(writer.close().await.is_err());
            })
            .await;
    }

    #[tokio::test]
    async fn abort_rejects_queue_and_calls_sink_abort_once() {
        LocalSet::new()
            .run_until(async {
                let log = Log::default();
                let mut sink = RecordingSink::new(&log);
                sink.delay = Duration::from_millis(5);
                let stream = WritableStream::builder(sink).spawn(tokio::task::spawn_local);
                let writer = stream.get_writer().unwrap();

                let first = writer.write(1);
                let second = writer.write(2);
                tokio::time::sleep(Duration::from_millis(1)).await;

                writer.abort(Some("user".into())).await.unwrap();
                writer.abort(Some("again".into())).await.unwrap();

                assert!(first.await.is_ok(), "in-flight write settles on its own");
                assert!(second.await.unwrap_err().is_abort());
                assert_eq!(*log.aborted.borrow(), vec![Some("user".to_string())]);
                assert!(matches!(
                    writer.closed().await,
                    Err(StreamError::Aborted(Some(ref r))) if r == "user"
                ));
            })
            .await;
    }

    #[tokio::test]
    async fn abort_signal_interrupts_long_write() {
        struct SlowSink;

        impl WritableSink<i32> for SlowSink {
            async fn write(
                &mut self,
                _chunk: i32,
                controller: &mut WritableStreamDefaultController,
            ) -> StreamResult<()> {
                controller
                    .with_abort(tokio::time::sleep(Duration::from_secs(30)))
                    .await
            }
        }

        LocalSet::new()
            .run_until(async {
                let stream = WritableStream::builder(SlowSink).spawn(tokio::task::spawn_local);
                let writer = stream.get_writer().unwrap();

                let pending = writer.write(1);
                tokio::time::sleep(Duration::from_millis(1)).await;
                writer.abort(None).await.unwrap();

                let result = timeout(Duration::from_secs(1), pending)
                    .await
                    .expect("write should be interrupted");
                assert!(result.unwrap_err().is_abort());
            })
            .await;
    }

    #[tokio::test]
    async fn abort_after_close_is_a_no_op() {
        LocalSet::new()
            .run_until(async {
                let log = Log::default();
                let stream =
                    WritableStream::builder(RecordingSink::new(&log)).spawn(tokio::task::spawn_local);
                let writer = stream.get_writer().unwrap();
                writer.close().await.unwrap();
                writer.abort(Some("late".into())).await.unwrap();
                assert!(log.aborted.borrow().is_empty());
                assert_eq!(stream.state(), WritableState::Closed);
            })
            .await;
    }

    #[tokio::test]
    async fn controller_error_rejects_later_writes() {
        struct ErrorOnStart;

        impl WritableSink<i32> for ErrorOnStart {
            async fn start(
                &mut self,
                controller: &mut WritableStreamDefaultController,
            ) -> StreamResult<()> {
                controller.error("sink unavailable".into());
                Ok(())
            }

            async fn write(
                &mut self,
                _chunk: i32,
                _controller: &mut WritableStreamDefaultController,
            ) -> StreamResult<()> {
                panic!("write must not be reached");
            }
        }

        LocalSet::new()
            .run_until(async {
                let stream = WritableStream::builder(ErrorOnStart).spawn(tokio::task::spawn_local);
                let writer = stream.get_writer().unwrap();
                let err = writer.write(1).await.unwrap_err();
                assert_eq!(err.to_string(), "sink unavailable");
            })
            .await;
    }

    #[tokio::test]
    async fn start_failure_errors_stream() {
        struct FailingStart;

        impl WritableSink<i32> for FailingStart {
            async fn start(
                &mut self,
                _controller: &mut WritableStreamDefaultController,
            ) -> StreamResult<()> {
                Err("no device".into())
            }

            async fn write(
                &mut self,
                _chunk: i32,
                _controller: &mut WritableStreamDefaultController,
            ) -> StreamResult<()> {
                Ok(())
            }
        }

        LocalSet::new()
            .run_until(async {
                let stream = WritableStream::builder(FailingStart).spawn(tokio::task::spawn_local);
                let writer = stream.get_writer().unwrap();
                assert_eq!(writer.closed().await.unwrap_err().to_string(), "no device");
                assert_eq!(writer.write(1).await.unwrap_err().to_string(), "no device");
            })
            .await;
    }

    #[tokio::test]
    async fn enforces_writer_locking() {
        LocalSet::new()
            .run_until(async {
                let log = Log::default();
                let stream =
                    WritableStream::builder(RecordingSink::new(&log)).spawn(tokio::task::spawn_local);

                let writer = stream.get_writer().unwrap();
                assert!(stream.locked());
                assert!(matches!(stream.get_writer(), Err(StreamError::Locked)));
                assert!(matches!(stream.abort(None).await, Err(StreamError::Locked)));
                assert!(matches!(stream.close().await, Err(StreamError::Locked)));

                writer.release_lock();
                assert!(!stream.locked());
                stream.close().await.unwrap();
                assert_eq!(log.closed.get(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn queued_writes_drain_after_handles_drop() {
        LocalSet::new()
            .run_until(async {
                let log = Log::default();
                let (stream, task) = WritableStream::builder(RecordingSink::new(&log)).prepare();
                let handle = tokio::task::spawn_local(task);

                let writer = stream.get_writer().unwrap();
                let write = writer.write(5);
                drop(writer);
                drop(stream);

                write.await.unwrap();
                timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
                assert_eq!(*log.chunks.borrow(), vec![5]);
            })
            .await;
    }
}
