use std::{io, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, split},
    select,
    time::timeout,
};

use crate::config::PipeConfig;

/// Copies `src` into `dst` until `src` ends, then shuts `dst` down.
///
/// Each read has its own deadline, [`PipeConfig::with_read_timeout`]. Read
/// errors and deadlines end the copy quietly since they are almost always a
/// closed connection; only write errors are returned. `dst` is shut down on
/// every exit path.
pub async fn pipe<R, W>(mut src: R, mut dst: W, config: &PipeConfig) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = config.leaky_buf.get();
    let result = copy(&mut src, &mut dst, &mut buf, config.read_timeout).await;
    config.leaky_buf.put(buf);
    if let Err(e) = dst.shutdown().await {
        tracing::debug!(error = %e, "pipe: shutdown failed");
    }
    result
}

async fn copy<R, W>(src: &mut R, dst: &mut W, buf: &mut [u8], read_timeout: Duration) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let n = match timeout(read_timeout, src.read(buf)).await {
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "pipe: read ended");
                return Ok(());
            }
            Err(_) => {
                tracing::debug!(?read_timeout, "pipe: read timed out");
                return Ok(());
            }
        };
        dst.write_all(&buf[..n]).await?;
    }
}

/// Pipes `a` and `b` into each other until either direction ends.
///
/// The first direction to finish stops the other one, and both write halves
/// are shut down without waiting for the idle side's read deadline. Returns
/// the write error of the direction that ended first, if any.
pub async fn relay<A, B>(a: A, b: B, config: &PipeConfig) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = split(a);
    let (mut b_read, mut b_write) = split(b);
    let (a_to_b_ended, result) = select! {
        r = pipe(&mut a_read, &mut b_write, config) => (true, r),
        r = pipe(&mut b_read, &mut a_write, config) => (false, r),
    };
    // The stopped direction never reached its own shutdown.
    let stopped = if a_to_b_ended {
        a_write.shutdown().await
    } else {
        b_write.shutdown().await
    };
    if let Err(e) = stopped {
        tracing::debug!(error = %e, "relay: shutdown failed");
    }
    result
}
