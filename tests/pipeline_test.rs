use bridged_streams::{
    ReadableSource, ReadableState, ReadableStream, ReadableStreamDefaultController, StreamError,
    StreamPipeOptions, TransformStream, TransformStreamDefaultController, Transformer,
    WritableSink, WritableStream, WritableStreamDefaultController,
};
use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};
use tokio::{task::LocalSet, time::timeout};

type StreamResult<T> = Result<T, StreamError>;

const GUARD: Duration = Duration::from_secs(5);

/// Records every chunk and flags overlapping writes.
#[derive(Default, Clone)]
struct Recorder {
    chunks: Rc<RefCell<Vec<String>>>,
    in_flight: Rc<Cell<bool>>,
    overlapped: Rc<Cell<bool>>,
    closes: Rc<Cell<usize>>,
}

impl WritableSink<String> for Recorder {
    async fn write(
        &mut self,
        chunk: String,
        _controller: &mut WritableStreamDefaultController,
    ) -> StreamResult<()> {
        if self.in_flight.replace(true) {
            self.overlapped.set(true);
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.chunks.borrow_mut().push(chunk);
        self.in_flight.set(false);
        Ok(())
    }

    async fn close(self) -> StreamResult<()> {
        self.closes.set(self.closes.get() + 1);
        Ok(())
    }
}

struct Upper;

impl Transformer<String, String> for Upper {
    async fn transform(
        &mut self,
        chunk: String,
        controller: &mut TransformStreamDefaultController<String>,
    ) -> StreamResult<()> {
        controller.enqueue(chunk.to_uppercase())
    }

    async fn flush(
        &mut self,
        controller: &mut TransformStreamDefaultController<String>,
    ) -> StreamResult<()> {
        controller.enqueue("END".to_string())
    }
}

fn words(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

async fn drain<T: 'static>(stream: &ReadableStream<T>) -> StreamResult<Vec<T>> {
    let reader = stream.get_reader()?;
    let mut out = Vec::new();
    while let Some(chunk) = reader.read().await? {
        out.push(chunk);
    }
    Ok(out)
}

#[tokio::test]
async fn enqueue_and_read_interleave_in_fifo_order() {
    struct Captured(Rc<RefCell<Option<ReadableStreamDefaultController<u32>>>>);

    impl ReadableSource<u32> for Captured {
        async fn start(
            &mut self,
            controller: &mut ReadableStreamDefaultController<u32>,
        ) -> StreamResult<()> {
            *self.0.borrow_mut() = Some(controller.clone());
            Ok(())
        }
    }

    LocalSet::new()
        .run_until(async {
            let slot = Rc::new(RefCell::new(None));
            let stream = ReadableStream::builder(Captured(slot.clone())).spawn(tokio::task::spawn_local);
            let reader = stream.get_reader().unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
            let controller = slot.borrow().clone().unwrap();

            for i in 0..10 {
                controller.enqueue(i).unwrap();
            }
            let mut seen = Vec::new();
            for _ in 0..5 {
                seen.push(reader.read().await.unwrap().unwrap());
            }
            for i in 10..20 {
                controller.enqueue(i).unwrap();
            }
            controller.close().unwrap();
            while let Some(v) = timeout(GUARD, reader.read()).await.unwrap().unwrap() {
                seen.push(v);
            }

            assert_eq!(seen, (0..20).collect::<Vec<_>>());
            assert_eq!(stream.state(), ReadableState::Closed);
        })
        .await;
}

#[tokio::test]
async fn pull_runs_once_per_outstanding_read() {
    struct Counting {
        pulls: Rc<Cell<u32>>,
    }

    impl ReadableSource<u32> for Counting {
        async fn pull(
            &mut self,
            controller: &mut ReadableStreamDefaultController<u32>,
        ) -> StreamResult<()> {
            let n = self.pulls.get() + 1;
            self.pulls.set(n);
            if n <= 3 {
                controller.enqueue(n)
            } else {
                controller.close()
            }
        }
    }

    LocalSet::new()
        .run_until(async {
            let pulls = Rc::new(Cell::new(0));
            let stream = ReadableStream::builder(Counting {
                pulls: pulls.clone(),
            })
            .spawn(tokio::task::spawn_local);

            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(pulls.get(), 0, "no pull without demand");

            let reader = stream.get_reader().unwrap();
            assert_eq!(reader.read().await.unwrap(), Some(1));
            assert_eq!(reader.read().await.unwrap(), Some(2));
            assert_eq!(reader.read().await.unwrap(), Some(3));
            assert_eq!(reader.read().await.unwrap(), None);
            assert_eq!(pulls.get(), 4);
        })
        .await;
}

#[tokio::test]
async fn source_through_transform_into_sink() {
    LocalSet::new()
        .run_until(async {
            let recorder = Recorder::default();
            let sink = WritableStream::builder(recorder.clone()).spawn(tokio::task::spawn_local);
            let source = ReadableStream::from_vec(words(&["alpha", "beta", "gamma"]))
                .spawn(tokio::task::spawn_local);
            let transform = TransformStream::builder(Upper).spawn(tokio::task::spawn_local);

            let upper = source
                .pipe_through(transform, None)
                .spawn(tokio::task::spawn_local);
            timeout(GUARD, upper.pipe_to(&sink, None))
                .await
                .unwrap()
                .unwrap();

            assert_eq!(
                *recorder.chunks.borrow(),
                words(&["ALPHA", "BETA", "GAMMA", "END"])
            );
            assert_eq!(recorder.closes.get(), 1);
            assert!(!recorder.overlapped.get());
        })
        .await;
}

#[tokio::test]
async fn tee_branches_see_everything_even_when_one_lags() {
    LocalSet::new()
        .run_until(async {
            let source = ReadableStream::from_vec(words(&["a", "b", "c"])).spawn(tokio::task::spawn_local);
            let (fast, slow) = source.tee().spawn(tokio::task::spawn_local).unwrap();

            let fast_chunks = timeout(GUARD, drain(&fast)).await.unwrap().unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            let slow_chunks = timeout(GUARD, drain(&slow)).await.unwrap().unwrap();

            assert_eq!(fast_chunks, words(&["a", "b", "c"]));
            assert_eq!(slow_chunks, words(&["a", "b", "c"]));
        })
        .await;
}

#[tokio::test]
async fn tee_branches_pipe_to_separate_sinks() {
    LocalSet::new()
        .run_until(async {
            let left = Recorder::default();
            let right = Recorder::default();
            let left_sink = WritableStream::builder(left.clone()).spawn(tokio::task::spawn_local);
            let right_sink = WritableStream::builder(right.clone()).spawn(tokio::task::spawn_local);

            let source = ReadableStream::from_vec(words(&["x", "y", "z"])).spawn(tokio::task::spawn_local);
            let (one, two) = source.tee().spawn(tokio::task::spawn_local).unwrap();

            let (a, b) = timeout(
                GUARD,
                futures::future::join(
                    one.pipe_to(&left_sink, None),
                    two.pipe_to(&right_sink, None),
                ),
            )
            .await
            .unwrap();
            a.unwrap();
            b.unwrap();

            assert_eq!(*left.chunks.borrow(), words(&["x", "y", "z"]));
            assert_eq!(*right.chunks.borrow(), words(&["x", "y", "z"]));
            assert_eq!(left.closes.get(), 1);
            assert_eq!(right.closes.get(), 1);
        })
        .await;
}

#[tokio::test]
async fn queued_writes_reach_sink_one_at_a_time() {
    LocalSet::new()
        .run_until(async {
            let recorder = Recorder::default();
            let stream = WritableStream::builder(recorder.clone()).spawn(tokio::task::spawn_local);
            let writer = stream.get_writer().unwrap();

            let writes: Vec<_> = (0..8).map(|i| writer.write(format!("w{i}"))).collect();
            for result in timeout(GUARD, futures::future::join_all(writes)).await.unwrap() {
                result.unwrap();
            }
            writer.close().await.unwrap();

            let expected: Vec<String> = (0..8).map(|i| format!("w{i}")).collect();
            assert_eq!(*recorder.chunks.borrow(), expected);
            assert!(!recorder.overlapped.get());
            assert_eq!(recorder.closes.get(), 1);
        })
        .await;
}

#[tokio::test]
async fn prevent_close_lets_two_sources_share_one_sink() {
    LocalSet::new()
        .run_until(async {
            let recorder = Recorder::default();
            let sink = WritableStream::builder(recorder.clone()).spawn(tokio::task::spawn_local);

            let first = ReadableStream::from_vec(words(&["1", "2"])).spawn(tokio::task::spawn_local);
            let second = ReadableStream::from_vec(words(&["3"])).spawn(tokio::task::spawn_local);

            let keep_open = StreamPipeOptions::default().prevent_close(true);
            first.pipe_to(&sink, Some(keep_open)).await.unwrap();
            assert_eq!(recorder.closes.get(), 0);
            second.pipe_to(&sink, None).await.unwrap();

            assert_eq!(*recorder.chunks.borrow(), words(&["1", "2", "3"]));
            assert_eq!(recorder.closes.get(), 1);
        })
        .await;
}
