use core::{
    pin::Pin,
    task::{Context, Poll, ready},
};
use std::io::{ErrorKind, Read, Write};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::tunnel::Tunnel;

pin_project! {
    /// Asynchronous SSR stream based on `Tokio` runtime.
    ///
    /// [`SsrStream`] implements the [`AsyncRead`] and [`AsyncWrite`] traits,
    /// allowing it to be used similarly to a [`TcpStream`]. It is usually
    /// obtained from [`dial`], which also sends the destination address.
    ///
    /// Frames the obfs layer sends back on its own, such as the second half
    /// of a TLS handshake, are flushed from `poll_read`, so the stream must
    /// be readable and writable at once.
    ///
    /// [`TcpStream`]: tokio::net::TcpStream
    /// [`dial`]: fn@crate::dial
    #[derive(Debug)]
    pub struct SsrStream<IO> {
        stream: IO,
        tunnel: Tunnel,
        write_state: WriteState,
    }
}

/// State Transition Diagram
/// ```text
///
///    |
///    V
///  WaitData <---+
///    |          |
///    V          |
///   Write ------+
/// ```
#[derive(Copy, Clone, Debug)]
enum WriteState {
    WaitData,
    Write { written: usize },
}

impl<IO> SsrStream<IO> {
    /// Wraps an established connection to the relay.
    ///
    /// Nothing is sent until the first write, which should carry the SOCKS5
    /// address record of the destination.
    pub fn new(tunnel: Tunnel, stream: IO) -> Self {
        Self {
            stream,
            tunnel,
            write_state: WriteState::WaitData,
        }
    }

    /// Returns a reference to the internal stream.
    pub fn inner_stream(&self) -> &IO {
        &self.stream
    }

    /// Returns a mutable reference to the inner stream.
    pub fn inner_stream_mut(&mut self) -> &mut IO {
        &mut self.stream
    }

    /// Returns the state machine driving this stream.
    pub fn tunnel(&self) -> &Tunnel {
        &self.tunnel
    }
}

/// Drains queued wire bytes into `io`.
fn poll_drain<IO>(tunnel: &mut Tunnel, io: &mut IO, cx: &mut Context<'_>) -> Poll<std::io::Result<()>>
where
    IO: AsyncWrite + Unpin,
{
    let mut writer = SyncWriteAdapter { io, cx };
    match tunnel.write_wire(&mut writer) {
        Ok(_) => Poll::Ready(Ok(())),
        Err(e) if e.kind() == ErrorKind::WouldBlock => Poll::Pending,
        Err(e) => Poll::Ready(Err(e)),
    }
}

impl<IO> AsyncRead for SsrStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = self.project();
        loop {
            // Obfs send-back frames go out before more is read.
            if me.tunnel.wants_write() {
                ready!(poll_drain(me.tunnel, me.stream, cx))?;
            }
            match me.tunnel.reader().read(buf.initialize_unfilled()) {
                Ok(n) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Poll::Ready(Err(e)),
            }
            let mut reader = SyncReadAdapter {
                io: &mut *me.stream,
                cx,
            };
            match me.tunnel.read_wire(&mut reader) {
                // New bytes or EOF, either way the reader has an answer or
                // needs another round.
                Ok(_) => continue,

                // Wait for more data, pending.
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Poll::Pending,

                // Short IV, malformed framing or a general I/O error.
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
    }
}

impl<IO> AsyncWrite for SsrStream<IO>
where
    IO: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        let me = self.project();
        loop {
            match me.write_state {
                WriteState::WaitData => match me.tunnel.writer().write(buf) {
                    Ok(written) => {
                        *me.write_state = WriteState::Write { written };
                    }
                    // Too much queued, drain first.
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        ready!(poll_drain(me.tunnel, me.stream, cx))?;
                    }
                    Err(e) => {
                        return Poll::Ready(Err(e));
                    }
                },
                WriteState::Write { written } => {
                    let written = *written;
                    ready!(poll_drain(me.tunnel, me.stream, cx))?;
                    *me.write_state = WriteState::WaitData;
                    return Poll::Ready(Ok(written));
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        let me = self.project();
        ready!(poll_drain(me.tunnel, me.stream, cx))?;
        *me.write_state = WriteState::WaitData;
        Pin::new(me.stream).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        ready!(self.as_mut().poll_flush(cx))?;
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// An adapter that implements a [`Read`] interface for [`AsyncRead`] types and an
/// associated [`Context`].
///
/// Turns `Poll::Pending` into `WouldBlock`.
struct SyncReadAdapter<'a, 'b, T> {
    io: &'a mut T,
    cx: &'a mut Context<'b>,
}

impl<T: AsyncRead + Unpin> Read for SyncReadAdapter<'_, '_, T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut buf = ReadBuf::new(buf);
        match Pin::new(&mut *self.io).poll_read(self.cx, &mut buf) {
            Poll::Ready(Ok(())) => Ok(buf.filled().len()),
            Poll::Ready(Err(err)) => Err(err),
            Poll::Pending => Err(ErrorKind::WouldBlock.into()),
        }
    }
}

/// An adapter that implements a [`Write`] interface for [`AsyncWrite`] types and an
/// associated [`Context`].
///
/// Turns `Poll::Pending` into `WouldBlock`.
struct SyncWriteAdapter<'a, 'b, T> {
    io: &'a mut T,
    cx: &'a mut Context<'b>,
}

impl<T: AsyncWrite + Unpin> Write for SyncWriteAdapter<'_, '_, T> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match Pin::new(&mut *self.io).poll_write(self.cx, buf) {
            Poll::Ready(result) => result,
            Poll::Pending => Err(ErrorKind::WouldBlock.into()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match Pin::new(&mut *self.io).poll_flush(self.cx) {
            Poll::Ready(result) => result,
            Poll::Pending => Err(ErrorKind::WouldBlock.into()),
        }
    }
}
