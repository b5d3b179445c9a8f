//! A reader that fails once a cumulative byte ceiling is crossed.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

/// Enforces an inclusive ceiling on the total number of bytes read through
/// the wrapped stream.
///
/// The running total is never reset. The first read that pushes the total
/// past `max` fails, and the bytes from that read are discarded.
pub struct BoundedReader<R> {
    inner: R,
    pos: u64,
    max: u64,
}

impl<R> BoundedReader<R> {
    pub fn new(inner: R, max: u64) -> Self {
        Self { inner, pos: 0, max }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for BoundedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        let read = (buf.filled().len() - before) as u64;
        self.pos += read;
        if self.pos > self.max {
            return Poll::Ready(Err(io::Error::other(format!(
                "data exceeded limit {}",
                self.max
            ))));
        }
        Poll::Ready(Ok(()))
    }
}
