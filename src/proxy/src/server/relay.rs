use crate::backend::now_ms;
use crate::server::{DisconnectSide, MAX_PROXY_INPUT, PROXY_MAX_OUTBUF};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Why one relay direction stopped. The relay reports the first direction to
/// finish; the other one is torn down with the connection.
#[derive(Debug)]
pub enum RelayStatus {
    /// The named side closed its sending half.
    InputEof,
    /// Reading from the named side failed.
    InputError(String),
    /// The named side stopped accepting writes.
    OtherSideOutputError(String),
}

#[derive(Debug)]
pub struct RelayOutcome {
    pub side: DisconnectSide,
    pub status: RelayStatus,
}

impl RelayOutcome {
    pub fn error_str(&self) -> &str {
        match &self.status {
            RelayStatus::InputEof => "",
            RelayStatus::InputError(err) | RelayStatus::OtherSideOutputError(err) => err,
        }
    }
}

/// Byte/activity accounting shared between the relay, the idle reaper and
/// the final session log line.
#[derive(Debug, Default)]
pub struct RelayStats {
    pub last_io_ms: AtomicI64,
    /// Bytes written towards the backend.
    pub net_in_bytes: AtomicU64,
    /// Bytes written towards the client.
    pub net_out_bytes: AtomicU64,
    /// Set while a write into the respective output is stalled.
    pub client_output_blocked: AtomicBool,
    pub server_output_blocked: AtomicBool,
}

impl RelayStats {
    pub fn touch(&self) {
        self.last_io_ms.store(now_ms(), Ordering::Release);
    }
}

async fn pump<R, W>(
    r: &mut R,
    w: &mut W,
    chunk: usize,
    reader_side: DisconnectSide,
    writer_side: DisconnectSide,
    bytes: &AtomicU64,
    blocked: &AtomicBool,
    stats: &RelayStats,
) -> RelayOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk];
    loop {
        let read = match r.read(&mut buf).await {
            Ok(0) => {
                return RelayOutcome {
                    side: reader_side,
                    status: RelayStatus::InputEof,
                }
            }
            Ok(read) => read,
            Err(err) => {
                return RelayOutcome {
                    side: reader_side,
                    status: RelayStatus::InputError(err.to_string()),
                }
            }
        };
        stats.touch();

        blocked.store(true, Ordering::Release);
        let written = async {
            w.write_all(&buf[..read]).await?;
            w.flush().await
        }
        .await;
        blocked.store(false, Ordering::Release);
        if let Err(err) = written {
            return RelayOutcome {
                side: writer_side,
                status: RelayStatus::OtherSideOutputError(err.to_string()),
            };
        }
        bytes.fetch_add(read as u64, Ordering::AcqRel);
        stats.touch();
    }
}

/// Bidirectional verbatim byte pump between the client and the backend,
/// used once authentication handed the connection over. FIFO per direction;
/// completes with the first direction to close or fail.
pub struct StreamRelay;

impl StreamRelay {
    pub async fn run<CR, CW, SR, SW>(
        client_r: &mut CR,
        client_w: &mut CW,
        server_r: &mut SR,
        server_w: &mut SW,
        server_leftover: Vec<u8>,
        stats: Arc<RelayStats>,
    ) -> RelayOutcome
    where
        CR: AsyncRead + Unpin,
        CW: AsyncWrite + Unpin,
        SR: AsyncRead + Unpin,
        SW: AsyncWrite + Unpin,
    {
        // bytes the login phase read past the final reply line belong to the
        // client
        if !server_leftover.is_empty() {
            let flushed = async {
                client_w.write_all(&server_leftover).await?;
                client_w.flush().await
            }
            .await;
            match flushed {
                Ok(()) => {
                    stats
                        .net_out_bytes
                        .fetch_add(server_leftover.len() as u64, Ordering::AcqRel);
                    stats.touch();
                }
                Err(err) => {
                    return RelayOutcome {
                        side: DisconnectSide::Client,
                        status: RelayStatus::OtherSideOutputError(err.to_string()),
                    }
                }
            }
        }

        let client_to_server = pump(
            client_r,
            server_w,
            MAX_PROXY_INPUT,
            DisconnectSide::Client,
            DisconnectSide::Server,
            &stats.net_in_bytes,
            &stats.server_output_blocked,
            &stats,
        );
        let server_to_client = pump(
            server_r,
            client_w,
            PROXY_MAX_OUTBUF,
            DisconnectSide::Server,
            DisconnectSide::Client,
            &stats.net_out_bytes,
            &stats.client_output_blocked,
            &stats,
        );
        tokio::pin!(client_to_server);
        tokio::pin!(server_to_client);

        tokio::select! {
            outcome = &mut client_to_server => outcome,
            outcome = &mut server_to_client => outcome,
        }
    }
}

/// Replays a fixed prefix before reading from the inner stream; writes pass
/// straight through. Used when buffered plaintext has to survive a stream
/// upgrade.
pub(crate) struct PrependedStream<T> {
    prefix: Vec<u8>,
    pos: usize,
    inner: T,
}

impl<T> PrependedStream<T> {
    pub(crate) fn new(prefix: Vec<u8>, inner: T) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for PrependedStream<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pos < self.prefix.len() {
            let n = (self.prefix.len() - self.pos).min(buf.remaining());
            let pos = self.pos;
            buf.put_slice(&self.prefix[pos..pos + n]);
            self.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for PrependedStream<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
