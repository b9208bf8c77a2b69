use super::{
    error::StreamError,
    readable::{ReadableSource, ReadableStream, ReadableStreamDefaultController},
    writable::{WritableSink, WritableStream, WritableStreamDefaultController},
};
use futures::future::{self, LocalBoxFuture};
use std::{cell::OnceCell, marker::PhantomData, rc::Rc};

type StreamResult<T> = Result<T, StreamError>;

/// TransformStream connecting readable and writable sides
pub struct TransformStream<I: 'static, O: 'static> {
    readable: ReadableStream<O>,
    writable: WritableStream<I>,
}

impl<I: 'static, O: 'static> TransformStream<I, O> {
    pub fn builder<Tr: Transformer<I, O>>(transformer: Tr) -> TransformStreamBuilder<I, O, Tr> {
        TransformStreamBuilder::new(transformer)
    }

    /// Get the readable side
    pub fn readable(&self) -> &ReadableStream<O> {
        &self.readable
    }

    /// Get the writable side
    pub fn writable(&self) -> &WritableStream<I> {
        &self.writable
    }

    /// Split into both sides
    pub fn split(self) -> (ReadableStream<O>, WritableStream<I>) {
        (self.readable, self.writable)
    }
}

impl<T: 'static> TransformStream<T, T> {
    /// Passes chunks from the writable side to the readable side unchanged.
    pub fn identity() -> TransformStreamBuilder<T, T, IdentityTransformer<T>> {
        TransformStreamBuilder::new(IdentityTransformer::new())
    }
}

/// Controller for transform operations
pub struct TransformStreamDefaultController<O: 'static> {
    readable: ReadableStreamDefaultController<O>,
    writable: Rc<OnceCell<WritableStreamDefaultController>>,
}

impl<O: 'static> Clone for TransformStreamDefaultController<O> {
    fn clone(&self) -> Self {
        Self {
            readable: self.readable.clone(),
            writable: self.writable.clone(),
        }
    }
}

impl<O: 'static> TransformStreamDefaultController<O> {
    /// Enqueue to readable side
    pub fn enqueue(&self, chunk: O) -> StreamResult<()> {
        self.readable.enqueue(chunk)
    }

    /// Errors both the readable and writable side of the transform stream
    pub fn error(&self, error: StreamError) -> StreamResult<()> {
        self.readable.error(error.clone())?;
        if let Some(writable) = self.writable.get() {
            writable.error(error);
        }
        Ok(())
    }

    /// Closes the readable side and errors the writable side of the stream
    pub fn terminate(&self) -> StreamResult<()> {
        self.readable.close()?;
        if let Some(writable) = self.writable.get() {
            writable.error(StreamError::Type("TransformStream terminated".into()));
        }
        Ok(())
    }
}

/// Transformer trait
pub trait Transformer<I: 'static, O: 'static>: 'static {
    /// Called once before the first chunk is transformed
    fn start(
        &mut self,
        controller: &mut TransformStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> {
        let _ = controller;
        future::ready(Ok(()))
    }

    /// Called for each chunk written to the writable side; may enqueue any
    /// number of outputs.
    fn transform(
        &mut self,
        chunk: I,
        controller: &mut TransformStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>>;

    /// Called when the writable side is closed
    fn flush(
        &mut self,
        controller: &mut TransformStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> {
        let _ = controller;
        future::ready(Ok(()))
    }
}

/// Readable source for the transform stream. Data only arrives through the
/// writable side, so pulling is a no-op; canceling errors the writable side.
pub struct TransformReadableSource {
    writable: Rc<OnceCell<WritableStreamDefaultController>>,
}

impl<O: 'static> ReadableSource<O> for TransformReadableSource {
    async fn cancel(&mut self, reason: Option<String>) -> StreamResult<()> {
        if let Some(writable) = self.writable.get() {
            writable.error(StreamError::Canceled(reason));
        }
        Ok(())
    }
}

/// Writable sink routing every chunk through the transformer.
pub struct TransformWritableSink<I, O: 'static, Tr> {
    transformer: Tr,
    controller: TransformStreamDefaultController<O>,
    _phantom: PhantomData<I>,
}

impl<I: 'static, O: 'static, Tr: Transformer<I, O>> WritableSink<I>
    for TransformWritableSink<I, O, Tr>
{
    async fn start(&mut self, controller: &mut WritableStreamDefaultController) -> StreamResult<()> {
        let _ = self.controller.writable.set(controller.clone());
        if let Err(err) = self.transformer.start(&mut self.controller).await {
            let _ = self.controller.readable.error(err.clone());
            return Err(err);
        }
        Ok(())
    }

    async fn write(
        &mut self,
        chunk: I,
        controller: &mut WritableStreamDefaultController,
    ) -> StreamResult<()> {
        // One transformed chunk may wait for a reader; the next write holds
        // until it is taken.
        controller
            .with_abort(self.controller.readable.drained())
            .await?;
        if let Err(err) = self.transformer.transform(chunk, &mut self.controller).await {
            tracing::debug!(error = %err, "transform failed");
            let _ = self.controller.readable.error(err.clone());
            return Err(err);
        }
        Ok(())
    }

    async fn close(mut self) -> StreamResult<()> {
        match self.transformer.flush(&mut self.controller).await {
            Ok(()) => {
                // Nobody may be reading anymore; that is not a close failure.
                let _ = self.controller.readable.close();
                Ok(())
            }
            Err(err) => {
                let _ = self.controller.readable.error(err.clone());
                Err(err)
            }
        }
    }

    async fn abort(&mut self, reason: Option<String>) -> StreamResult<()> {
        let _ = self.controller.readable.error(StreamError::Aborted(reason));
        Ok(())
    }
}

pub struct TransformStreamBuilder<I, O, Tr> {
    transformer: Tr,
    _phantom: PhantomData<(I, O)>,
}

impl<I: 'static, O: 'static, Tr: Transformer<I, O>> TransformStreamBuilder<I, O, Tr> {
    fn new(transformer: Tr) -> Self {
        Self {
            transformer,
            _phantom: PhantomData,
        }
    }

    /// Prepare without spawning: returns the stream pair and one future
    /// driving both sides
    pub fn prepare(self) -> (TransformStream<I, O>, impl Future<Output = ()>) {
        let writable_slot = Rc::new(OnceCell::new());
        let (readable, readable_fut) = ReadableStream::new_inner(TransformReadableSource {
            writable: writable_slot.clone(),
        });

        let sink = TransformWritableSink {
            transformer: self.transformer,
            controller: TransformStreamDefaultController {
                readable: readable.controller.clone(),
                writable: writable_slot,
            },
            _phantom: PhantomData,
        };
        let (writable, writable_fut) = WritableStream::new_inner(sink);

        let fut = async move {
            futures::join!(readable_fut, writable_fut);
        };
        (TransformStream { readable, writable }, fut)
    }

    pub fn spawn<F, R>(self, spawn_fn: F) -> TransformStream<I, O>
    where
        F: FnOnce(LocalBoxFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }
}

pub struct IdentityTransformer<T> {
    _phantom: PhantomData<T>,
}

impl<T> IdentityTransformer<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for IdentityTransformer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Transformer<T, T> for IdentityTransformer<T> {
    fn transform(
        &mut self,
        chunk: T,
        controller: &mut TransformStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> {
        future::ready(controller.enqueue(chunk))
    }
}
