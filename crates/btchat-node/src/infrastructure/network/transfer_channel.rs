//! Transfer channel: one stream, read as chat frames, written as raw bytes.
//!
//! There is no length prefix on the wire.  Each call to
//! [`MessageReader::next_message`] issues exactly one read of up to the
//! buffer size and decodes whatever that read returned as one message.  A
//! sender that writes two frames back-to-back, or one frame larger than the
//! reader's buffer, will be mis-framed; the codec enforces the size limit on
//! the sending side.

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use btchat_core::{decode_message, ChatMessage, Origin, MAX_FRAME_LEN};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, warn};

use crate::infrastructure::radio::BoxedStream;

/// Default bytes requested per read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = MAX_FRAME_LEN;

/// Errors raised by the receive sequence.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The stream failed mid-read; the sequence is over.
    #[error("transfer failed: {0}")]
    TransferFailed(#[source] io::Error),
}

/// The stream shared by the reader and every sender.
///
/// `stream` is `None` once closed.  The lock is only taken inside a single
/// poll, never across an await, so `close` can always take the stream out
/// and drop it on the spot.
struct StreamCell {
    stream: Option<BoxedStream>,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

type SharedCell = Arc<Mutex<StreamCell>>;

fn lock(cell: &SharedCell) -> MutexGuard<'_, StreamCell> {
    cell.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns one stream and splits it into a receive sequence and a sender.
pub struct TransferChannel {
    reader: MessageReader,
    sender: MessageSender,
}

impl TransferChannel {
    pub fn new(stream: BoxedStream) -> Self {
        Self::with_buffer_size(stream, DEFAULT_READ_BUFFER_SIZE)
    }

    /// Wraps `stream`, reading at most `buffer_size` bytes per frame.
    pub fn with_buffer_size(stream: BoxedStream, buffer_size: usize) -> Self {
        let cell = Arc::new(Mutex::new(StreamCell {
            stream: Some(stream),
            read_waker: None,
            write_waker: None,
        }));
        Self {
            reader: MessageReader {
                cell: Arc::clone(&cell),
                buf: vec![0u8; buffer_size.max(1)],
                finished: false,
            },
            sender: MessageSender {
                cell,
                turn: Arc::new(tokio::sync::Mutex::new(())),
            },
        }
    }

    pub fn sender(&self) -> MessageSender {
        self.sender.clone()
    }

    /// Splits the channel.  The stream closes when [`MessageSender::close`]
    /// is called or once every part has been dropped.
    pub fn into_parts(self) -> (MessageReader, MessageSender) {
        (self.reader, self.sender)
    }
}

/// The inbound message sequence of one stream.
///
/// Lazy (nothing is read until polled), unbounded, and not restartable: once
/// it has returned `Ok(None)` or an error it only ever returns `Ok(None)`.
pub struct MessageReader {
    cell: SharedCell,
    buf: Vec<u8>,
    finished: bool,
}

impl MessageReader {
    /// Reads the next message.
    ///
    /// Returns `Ok(None)` when the peer is no longer connected or the stream
    /// was closed locally.  Frames that do not decode are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::TransferFailed`] when the read itself fails.
    pub async fn next_message(&mut self) -> Result<Option<ChatMessage>, TransferError> {
        loop {
            if self.finished {
                return Ok(None);
            }

            let n = match self.read_once().await {
                Ok(Some(n)) => n,
                Ok(None) => {
                    debug!("stream closed locally");
                    self.finished = true;
                    return Ok(None);
                }
                Err(e) => {
                    self.finished = true;
                    return Err(TransferError::TransferFailed(e));
                }
            };

            if n == 0 {
                debug!("stream closed by peer");
                self.finished = true;
                return Ok(None);
            }

            match decode_message(&self.buf[..n], Origin::Remote) {
                Ok(msg) => return Ok(Some(msg)),
                Err(e) => warn!("discarding undecodable frame: {e}"),
            }
        }
    }

    /// `true` once the sequence has ended.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// One read into the buffer; `None` when the stream has been closed.
    async fn read_once(&mut self) -> io::Result<Option<usize>> {
        let cell = &self.cell;
        let buf = &mut self.buf;
        poll_fn(|cx| {
            let mut guard = lock(cell);
            let Some(stream) = guard.stream.as_mut() else {
                return Poll::Ready(Ok(None));
            };
            let mut read_buf = ReadBuf::new(buf.as_mut_slice());
            let polled = Pin::new(stream).poll_read(cx, &mut read_buf);
            match polled {
                Poll::Ready(Ok(())) => Poll::Ready(Ok(Some(read_buf.filled().len()))),
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                Poll::Pending => {
                    guard.read_waker = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
        })
        .await
    }
}

/// Cloneable write side of a [`TransferChannel`].
#[derive(Clone)]
pub struct MessageSender {
    cell: SharedCell,
    /// Serializes concurrent sends so frames never interleave.
    turn: Arc<tokio::sync::Mutex<()>>,
}

impl MessageSender {
    /// Writes all of `bytes` and flushes.
    ///
    /// Returns `false` on any I/O failure: the message was not delivered and
    /// the session may be unhealthy.  Never returns an error.
    pub async fn send(&self, bytes: &[u8]) -> bool {
        let _turn = self.turn.lock().await;
        match self.write_all(bytes).await {
            Ok(()) => true,
            Err(e) => {
                warn!("send of {} bytes failed: {e}", bytes.len());
                false
            }
        }
    }

    /// Closes the stream immediately.
    ///
    /// The stream is dropped before this returns, so the peer sees
    /// end-of-stream.  A pending read returns `Ok(None)` and a pending send
    /// returns `false`.  Returns whether the stream was still open.
    pub fn close(&self) -> bool {
        let (stream, wakers) = {
            let mut cell = lock(&self.cell);
            (
                cell.stream.take(),
                [cell.read_waker.take(), cell.write_waker.take()],
            )
        };
        let was_open = stream.is_some();
        drop(stream);
        for waker in wakers.into_iter().flatten() {
            waker.wake();
        }
        was_open
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.cell).stream.is_none()
    }

    async fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < bytes.len() {
            let rest = &bytes[written..];
            let n = poll_fn(|cx| self.poll_stream(cx, |s, cx| s.poll_write(cx, rest))).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            written += n;
        }
        poll_fn(|cx| self.poll_stream(cx, |s, cx| s.poll_flush(cx))).await
    }

    fn poll_stream<R>(
        &self,
        cx: &mut Context<'_>,
        op: impl FnOnce(Pin<&mut BoxedStream>, &mut Context<'_>) -> Poll<io::Result<R>>,
    ) -> Poll<io::Result<R>> {
        let mut cell = lock(&self.cell);
        let Some(stream) = cell.stream.as_mut() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "stream closed",
            )));
        };
        let polled = op(Pin::new(stream), cx);
        if polled.is_pending() {
            cell.write_waker = Some(cx.waker().clone());
        }
        polled
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
