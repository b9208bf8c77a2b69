use super::{
    error::StreamError,
    readable::{ReadableStream, ReadableStreamDefaultReader},
    transform::TransformStream,
    writable::{WritableStream, WritableStreamDefaultWriter},
};
use crate::abort::AbortSignal;
use futures::future::LocalBoxFuture;

type StreamResult<T> = Result<T, StreamError>;

#[derive(Debug, Clone, Default)]
pub struct StreamPipeOptions {
    pub prevent_close: bool,
    pub prevent_abort: bool,
    pub prevent_cancel: bool,
    pub signal: Option<AbortSignal>,
}

impl StreamPipeOptions {
    pub fn prevent_close(mut self, value: bool) -> Self {
        self.prevent_close = value;
        self
    }

    pub fn prevent_abort(mut self, value: bool) -> Self {
        self.prevent_abort = value;
        self
    }

    pub fn prevent_cancel(mut self, value: bool) -> Self {
        self.prevent_cancel = value;
        self
    }

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

enum PipeExit {
    SourceDone,
    SourceError(StreamError),
    DestinationError(StreamError),
    Aborted(StreamError),
}

impl<T: 'static> ReadableStream<T> {
    /// Moves every chunk of this stream into `destination`, one write at a time.
    ///
    /// Both streams stay locked until the pipe settles. Errors propagate
    /// across the pipe unless the matching `prevent_*` option is set; an
    /// abort signal cancels the source and aborts the destination.
    pub async fn pipe_to(
        &self,
        destination: &WritableStream<T>,
        options: Option<StreamPipeOptions>,
    ) -> StreamResult<()> {
        let options = options.unwrap_or_default();
        let writer = destination.get_writer()?;
        let reader = self.get_reader()?;

        let exit = pipe_loop(&reader, &writer, options.signal.as_ref()).await;
        finish_pipe(exit, &reader, &writer, &options).await
        // reader and writer drop here, releasing both locks
    }
}

async fn race<F: Future>(signal: Option<&AbortSignal>, fut: F) -> StreamResult<F::Output> {
    match signal {
        Some(signal) => signal.race(fut).await,
        None => Ok(fut.await),
    }
}

async fn pipe_loop<T: 'static>(
    reader: &ReadableStreamDefaultReader<T>,
    writer: &WritableStreamDefaultWriter<T>,
    signal: Option<&AbortSignal>,
) -> PipeExit {
    loop {
        let chunk = match race(signal, reader.read()).await {
            Err(aborted) => return PipeExit::Aborted(aborted),
            Ok(Ok(Some(chunk))) => chunk,
            Ok(Ok(None)) => return PipeExit::SourceDone,
            Ok(Err(err)) => return PipeExit::SourceError(err),
        };

        match race(signal, writer.write(chunk)).await {
            Err(aborted) => return PipeExit::Aborted(aborted),
            Ok(Ok(())) => {}
            Ok(Err(err)) => return PipeExit::DestinationError(err),
        }
    }
}

async fn finish_pipe<T: 'static>(
    exit: PipeExit,
    reader: &ReadableStreamDefaultReader<T>,
    writer: &WritableStreamDefaultWriter<T>,
    options: &StreamPipeOptions,
) -> StreamResult<()> {
    match exit {
        PipeExit::SourceDone => {
            tracing::debug!(prevent_close = options.prevent_close, "pipe source done");
            if !options.prevent_close {
                writer.close().await?;
            }
            Ok(())
        }
        PipeExit::SourceError(err) => {
            tracing::debug!(error = %err, "pipe source errored");
            if !options.prevent_abort {
                let _ = writer.abort(err.reason()).await;
            }
            Err(err)
        }
        PipeExit::DestinationError(err) => {
            tracing::debug!(error = %err, "pipe destination errored");
            if !options.prevent_cancel {
                let _ = reader.cancel(err.reason()).await;
            }
            Err(err)
        }
        PipeExit::Aborted(err) => {
            tracing::debug!(error = %err, "pipe aborted by signal");
            let reason = err.reason();
            if !options.prevent_cancel {
                let _ = reader.cancel(reason.clone()).await;
            }
            if !options.prevent_abort {
                let _ = writer.abort(reason).await;
            }
            Err(err)
        }
    }
}

pub struct PipeThroughBuilder<T: 'static, O: 'static> {
    source_stream: ReadableStream<T>,
    transform: TransformStream<T, O>,
    options: Option<StreamPipeOptions>,
}

impl<T: 'static, O: 'static> PipeThroughBuilder<T, O> {
    pub fn new(
        source_stream: ReadableStream<T>,
        transform: TransformStream<T, O>,
        options: Option<StreamPipeOptions>,
    ) -> Self {
        Self {
            source_stream,
            transform,
            options,
        }
    }

    /// Prepare without spawning: returns the readable and the unspawned pipe future
    pub fn prepare(self) -> (ReadableStream<O>, impl Future<Output = StreamResult<()>>) {
        let (readable, writable) = self.transform.split();
        let source_stream = self.source_stream;
        let options = self.options;

        let pipe_future = async move {
            let result = source_stream.pipe_to(&writable, options).await;
            if let Err(StreamError::Locked) = &result {
                // Nothing was piped; surface the failure on the readable side.
                let _ = writable.abort(Some(StreamError::Locked.to_string())).await;
            }
            result
        };

        (readable, pipe_future)
    }

    /// Spawn the pipeline with an owned spawner closure
    pub fn spawn<SpawnFn, R>(self, spawn_fn: SpawnFn) -> ReadableStream<O>
    where
        SpawnFn: FnOnce(LocalBoxFuture<'static, ()>) -> R,
    {
        let (readable, pipe_future) = self.prepare();
        let fut = Box::pin(async move {
            if let Err(err) = pipe_future.await {
                tracing::debug!(error = %err, "pipe_through ended with error");
            }
        });
        spawn_fn(fut);
        readable
    }
}
