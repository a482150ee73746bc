use crate::document::Document;
use crate::error::{BodyError, FillError};
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, Stream, StreamExt};
use futures::task::{waker_ref, ArcWake};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub type BodyStream = BoxStream<'static, Result<Bytes, BodyError>>;

type Chunk = Result<Bytes, BodyError>;

/// A response body: nothing, a buffer, or a lazily pulled byte stream.
pub enum Body {
    Empty,
    Full(Bytes),
    Stream {
        stream: BodyStream,
        /// Announced length, if known up front.
        length: Option<u64>,
    },
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Full(bytes) => write!(f, "Body::Full({} bytes)", bytes.len()),
            Body::Stream { length, .. } => write!(f, "Body::Stream(length={length:?})"),
        }
    }
}

impl Body {
    pub fn from_stream<S>(stream: S, length: Option<u64>) -> Self
    where
        S: Stream<Item = Result<Bytes, BodyError>> + Send + 'static,
    {
        Body::Stream {
            stream: stream.boxed(),
            length,
        }
    }

    /// Stream a stored document's body.
    ///
    /// The stream holds the document until it ends or is dropped, so an
    /// evicted document stays alive for readers that are still streaming it.
    pub fn from_document(document: Arc<Document>) -> Self {
        let Some(length) = document.body.as_ref().map(|b| b.len() as u64) else {
            return Body::Empty;
        };
        Body::from_stream(DocumentStream::new(document), Some(length))
    }

    /// Body length, if it is known without reading the body.
    pub fn size_hint(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Full(bytes) => Some(bytes.len() as u64),
            Body::Stream { length, .. } => *length,
        }
    }

    pub fn into_stream(self) -> BodyStream {
        match self {
            Body::Empty => futures::stream::empty().boxed(),
            Body::Full(bytes) => futures::stream::once(async move { Ok(bytes) }).boxed(),
            Body::Stream { stream, .. } => stream,
        }
    }

    /// Read the whole body into memory.
    pub async fn collect(self, limit: usize) -> Result<Bytes, FillError> {
        Ok(accumulate(self, limit).await?.unwrap_or_default())
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::Full(bytes)
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Body::Full(Bytes::from_static(s.as_bytes()))
    }
}

struct DocumentStream {
    document: Option<Arc<Document>>,
    sent: bool,
}

impl DocumentStream {
    fn new(document: Arc<Document>) -> Self {
        Self {
            document: Some(document),
            sent: false,
        }
    }
}

impl Stream for DocumentStream {
    type Item = Chunk;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Chunk>> {
        if self.sent {
            // release the borrow at end of stream
            self.document = None;
            return Poll::Ready(None);
        }
        self.sent = true;
        let chunk = self.document.as_ref().and_then(|d| d.body.clone());
        Poll::Ready(chunk.map(Ok))
    }
}

/// Collect a body for storage, aborting once more than `limit` bytes
/// arrived. `Body::Empty` yields `None`.
///
/// A stream that announced its length must deliver exactly that many bytes.
pub async fn accumulate(body: Body, limit: usize) -> Result<Option<Bytes>, FillError> {
    match body {
        Body::Empty => Ok(None),
        Body::Full(bytes) if bytes.len() > limit => Err(FillError::TooLarge { limit }),
        Body::Full(bytes) => Ok(Some(bytes)),
        Body::Stream { mut stream, length } => {
            let capacity = length.map_or(0, |l| l.min(limit as u64) as usize);
            let mut buffer = BytesMut::with_capacity(capacity);
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                if buffer.len() + chunk.len() > limit {
                    return Err(FillError::TooLarge { limit });
                }
                buffer.extend_from_slice(&chunk);
            }
            if let Some(announced) = length {
                let actual = buffer.len() as u64;
                if actual != announced {
                    return Err(FillError::LengthMismatch { announced, actual });
                }
            }
            Ok(Some(buffer.freeze()))
        }
    }
}

/// Collect the fill branch of a teed body, giving up after `timeout` or
/// once `cancel` fires.
pub async fn fill(
    body: Body,
    limit: usize,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Option<Bytes>, FillError> {
    let collect = async {
        tokio::time::timeout(timeout, accumulate(body, limit))
            .await
            .map_err(|_| FillError::Timeout)?
    };
    tokio::select! {
        _ = cancel.cancelled() => Err(FillError::Cancelled),
        result = collect => result,
    }
}

/// Duplicate a body into two independently consumed bodies.
///
/// Whichever branch is polled first pulls from the source and queues the
/// chunk for the other one, so a slow consumer never holds back a fast one.
/// Dropping a branch does not affect the other; the source is dropped once
/// both branches are gone.
pub fn tee(body: Body) -> (Body, Body) {
    match body {
        Body::Empty => (Body::Empty, Body::Empty),
        Body::Full(bytes) => (Body::Full(bytes.clone()), Body::Full(bytes)),
        Body::Stream { stream, length } => {
            let shared = Arc::new(Tee {
                state: Mutex::new(TeeState {
                    source: Some(stream),
                    queues: [VecDeque::new(), VecDeque::new()],
                    open: [true, true],
                }),
                waker: Arc::new(TeeWaker::default()),
            });
            let first = TeeBranch {
                shared: Arc::clone(&shared),
                side: 0,
            };
            let second = TeeBranch { shared, side: 1 };
            (
                Body::from_stream(first, length),
                Body::from_stream(second, length),
            )
        }
    }
}

struct TeeState {
    /// `None` after end of stream or error.
    source: Option<BodyStream>,
    queues: [VecDeque<Chunk>; 2],
    open: [bool; 2],
}

struct Tee {
    state: Mutex<TeeState>,
    waker: Arc<TeeWaker>,
}

/// Wakes both branches when the source becomes ready, whichever branch
/// polled it last.
#[derive(Default)]
struct TeeWaker {
    wakers: Mutex<[Option<Waker>; 2]>,
}

impl TeeWaker {
    fn register(&self, side: usize, waker: &Waker) {
        let mut wakers = self.wakers.lock();
        match &wakers[side] {
            Some(current) if current.will_wake(waker) => {}
            _ => wakers[side] = Some(waker.clone()),
        }
    }

    fn wake_side(&self, side: usize) {
        let waker = self.wakers.lock()[side].take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl ArcWake for TeeWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let wakers = std::mem::take(&mut *arc_self.wakers.lock());
        for waker in wakers.into_iter().flatten() {
            waker.wake();
        }
    }
}

struct TeeBranch {
    shared: Arc<Tee>,
    side: usize,
}

impl Stream for TeeBranch {
    type Item = Chunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Chunk>> {
        let side = self.side;
        let other = 1 - side;
        let tee = &self.shared;
        let mut state = tee.state.lock();

        if let Some(chunk) = state.queues[side].pop_front() {
            return Poll::Ready(Some(chunk));
        }

        let Some(source) = state.source.as_mut() else {
            return Poll::Ready(None);
        };

        tee.waker.register(side, cx.waker());
        let waker = waker_ref(&tee.waker);
        let mut source_cx = Context::from_waker(&waker);

        match source.as_mut().poll_next(&mut source_cx) {
            Poll::Ready(Some(chunk)) => {
                if chunk.is_err() {
                    state.source = None;
                }
                if state.open[other] {
                    state.queues[other].push_back(chunk.clone());
                    drop(state);
                    tee.waker.wake_side(other);
                }
                Poll::Ready(Some(chunk))
            }
            Poll::Ready(None) => {
                state.source = None;
                drop(state);
                tee.waker.wake_side(other);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TeeBranch {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.open[self.side] = false;
        state.queues[self.side].clear();
        if !state.open[1 - self.side] {
            state.source = None;
        }
        drop(state);
        self.shared.waker.wake_side(1 - self.side);
    }
}
