// ── Response queues ──
//
// The receiving end of a request. Each element pairs the raw record with
// the supplement its device parsed from it. The queue is closed when the
// request resolves (terminal status, expected count reached, timeout,
// device close): buffered elements are still handed out, then `recv`
// yields `None`.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use reachlink_api::DeviceDataRecord;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// One element of a response queue: the record plus its parsed supplement.
pub type Response<T> = (Arc<DeviceDataRecord>, Option<Arc<T>>);

pub(crate) type ResponseSender<T> = mpsc::UnboundedSender<Response<T>>;

/// Ordered, closable stream of replies to one request.
#[derive(Debug)]
pub struct ResponseQueue<T> {
    rx: mpsc::UnboundedReceiver<Response<T>>,
}

impl<T> ResponseQueue<T> {
    pub(crate) fn channel() -> (ResponseSender<T>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// A queue that is already closed and empty.
    pub(crate) fn closed() -> Self {
        let (_, queue) = Self::channel();
        queue
    }

    /// Wait for the next element. `None` once the queue is closed and drained.
    pub async fn recv(&mut self) -> Option<Response<T>> {
        self.rx.recv().await
    }

    /// Blocking variant of [`recv`](Self::recv) for synchronous callers.
    ///
    /// Panics if called from within an async execution context.
    pub fn blocking_recv(&mut self) -> Option<Response<T>> {
        self.rx.blocking_recv()
    }

    /// Take the next element if one is buffered.
    pub fn try_recv(&mut self) -> Result<Response<T>, TryRecvError> {
        self.rx.try_recv()
    }

    /// Collect every element until the queue closes.
    pub async fn drain(mut self) -> Vec<Response<T>> {
        let mut out = Vec::new();
        while let Some(item) = self.rx.recv().await {
            out.push(item);
        }
        out
    }

    /// Blocking variant of [`drain`](Self::drain).
    pub fn blocking_drain(mut self) -> Vec<Response<T>> {
        let mut out = Vec::new();
        while let Some(item) = self.rx.blocking_recv() {
            out.push(item);
        }
        out
    }

    /// True once the request resolved and nothing is left to read.
    pub fn is_finished(&self) -> bool {
        self.rx.is_closed() && self.rx.is_empty()
    }

    /// Convert into a `Stream` for use with `StreamExt` combinators.
    pub fn into_stream(self) -> ResponseStream<T> {
        ResponseStream {
            inner: UnboundedReceiverStream::new(self.rx),
        }
    }
}

/// `Stream` adapter over a [`ResponseQueue`].
#[derive(Debug)]
pub struct ResponseStream<T> {
    inner: UnboundedReceiverStream<Response<T>>,
}

impl<T> Stream for ResponseStream<T> {
    type Item = Response<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
