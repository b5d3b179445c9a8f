//! Byte-stream adapters between russh channels and tokio I/O traits.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// The SSH extended-data stream id carrying stderr.
pub const STDERR_ID: u32 = 1;

/// Client-to-server channel data surfaced as an [`AsyncRead`].
///
/// The session handler feeds `data` packets into the sender half; dropping
/// the sender (on channel EOF or close) ends the stream.
pub struct ChannelInput {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
}

impl ChannelInput {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            pending: Vec::new(),
            offset: 0,
        }
    }
}

impl AsyncRead for ChannelInput {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if self.offset < self.pending.len() {
                let n = (self.pending.len() - self.offset).min(buf.remaining());
                let start = self.offset;
                buf.put_slice(&self.pending[start..start + n]);
                self.offset += n;
                return Poll::Ready(Ok(()));
            }
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(data)) => {
                    self.pending = data;
                    self.offset = 0;
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Server-to-client writer over a russh [`Handle`], targeting either the
/// main data stream (stdout) or extended data (stderr).
pub struct ChannelWriter {
    handle: Handle,
    id: ChannelId,
    ext: Option<u32>,
    in_flight: Option<(usize, BoxFuture<'static, Result<(), ()>>)>,
}

impl ChannelWriter {
    pub fn stdout(handle: Handle, id: ChannelId) -> Self {
        Self {
            handle,
            id,
            ext: None,
            in_flight: None,
        }
    }

    pub fn stderr(handle: Handle, id: ChannelId) -> Self {
        Self {
            handle,
            id,
            ext: Some(STDERR_ID),
            in_flight: None,
        }
    }
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            if let Some((len, fut)) = self.in_flight.as_mut() {
                let len = *len;
                return match fut.as_mut().poll(cx) {
                    Poll::Ready(Ok(())) => {
                        self.in_flight = None;
                        Poll::Ready(Ok(len))
                    }
                    Poll::Ready(Err(())) => {
                        self.in_flight = None;
                        Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            "ssh channel closed",
                        )))
                    }
                    Poll::Pending => Poll::Pending,
                };
            }
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            let data = CryptoVec::from_slice(buf);
            let handle = self.handle.clone();
            let id = self.id;
            let ext = self.ext;
            let send: BoxFuture<'static, Result<(), ()>> = Box::pin(async move {
                match ext {
                    Some(stream) => handle.extended_data(id, stream, data).await.map_err(|_| ()),
                    None => handle.data(id, data).await.map_err(|_| ()),
                }
            });
            self.in_flight = Some((buf.len(), send));
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn channel_input_yields_queued_packets_then_eof() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(b"hello ".to_vec()).await.unwrap();
        tx.send(b"world".to_vec()).await.unwrap();
        drop(tx);

        let mut input = ChannelInput::new(rx);
        let mut out = Vec::new();
        input.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn channel_input_handles_partial_reads() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(b"abcdef".to_vec()).await.unwrap();
        drop(tx);

        let mut input = ChannelInput::new(rx);
        let mut buf = [0u8; 4];
        input.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcd");
        let mut rest = Vec::new();
        input.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"ef");
    }

    #[tokio::test]
    async fn channel_input_skips_empty_packets() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Vec::new()).await.unwrap();
        tx.send(b"data".to_vec()).await.unwrap();
        drop(tx);

        let mut input = ChannelInput::new(rx);
        let mut out = Vec::new();
        input.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"data");
    }
}
