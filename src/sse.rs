//! SSE event framing
//!
//! Backends emit `data: <json>` records over a byte stream with no respect
//! for packet boundaries; a single JSON record routinely arrives split
//! across several chunks. [`SseEventStream`] reassembles the raw chunks into
//! whole `\n\n`-terminated events so the response transformer only ever sees
//! complete records.

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Wraps a byte stream and yields one complete SSE event per item.
///
/// Whatever is left in the buffer when the inner stream ends is flushed
/// as-is; an incomplete trailing event is the upstream's bug, not ours to
/// swallow.
pub struct SseEventStream<S> {
    inner: S,
    buffer: BytesMut,
}

impl<S> SseEventStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
        }
    }
}

impl<S, E> Stream for SseEventStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        loop {
            if let Some(end) = event_boundary(&this.buffer) {
                let event = this.buffer.split_to(end + 2);
                return Poll::Ready(Some(Ok(event.freeze())));
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buffer.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    if this.buffer.is_empty() {
                        return Poll::Ready(None);
                    }
                    return Poll::Ready(Some(Ok(this.buffer.split().freeze())));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Index of the first `\n` of the terminating `\n\n`, if a full event is
/// buffered.
fn event_boundary(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}
