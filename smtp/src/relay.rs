//! Bidirectional byte pump between the client-facing and the upstream stream.
//!
//! The relay has no protocol knowledge. Bytes read from one leg are queued for
//! the other and written as soon as that leg accepts them. Client bytes pass
//! through a [`Tap`] first, which may rewrite them and may ask the relay to stop.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Reads from a leg pause while this many bytes are still queued for its peer.
const MAX_PENDING: usize = 1024 * 1024;

/// What the relay should do after the tap saw a client chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Stop relaying immediately. Bytes still queued are discarded.
    Intercept,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// One of the legs closed; pending bytes were flushed where possible.
    Closed,
    /// The tap requested the session to be cut short.
    Intercepted,
}

/// Observer of the relayed traffic.
#[async_trait]
pub trait Tap: Send {
    type Error: From<std::io::Error> + Send;

    /// Called with every chunk read from the client. The bytes to forward
    /// upstream must be appended to `forward`.
    async fn client_chunk(&mut self, chunk: &[u8], forward: &mut BytesMut)
        -> Result<Flow, Self::Error>;

    /// Called with every chunk read from upstream, before it is queued for the
    /// client.
    fn upstream_chunk(&mut self, _chunk: &[u8]) {}
}

#[derive(Debug, Default)]
struct Leg {
    pending: BytesMut,
    read_closed: bool,
    send_closed: bool,
}

impl Leg {
    fn open(&self) -> bool {
        !self.read_closed && !self.send_closed
    }

    fn wants_write(&self) -> bool {
        !self.send_closed && !self.pending.is_empty()
    }

    /// Records the outcome of a write toward this leg.
    fn wrote(&mut self, result: std::io::Result<usize>) {
        match result {
            Ok(0) => self.send_closed = true,
            Ok(n) => self.pending.advance(n),
            Err(e) => {
                debug!(error = %e, "write to client failed, closing send side");
                self.send_closed = true;
            }
        }
    }
}

enum Event {
    ClientRead(std::io::Result<usize>),
    UpstreamRead(std::io::Result<usize>),
    ClientWrote(std::io::Result<usize>),
    UpstreamWrote(std::io::Result<usize>),
}

/// Relays bytes between `client` and `upstream` until either side closes or the
/// tap intercepts. A read error, or a failed write toward upstream, aborts the
/// relay with that error.
pub async fn pump<C, U, T>(client: &mut C, upstream: &mut U, tap: &mut T) -> Result<RelayEnd, T::Error>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
    T: Tap,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);

    // `to_client.pending` holds bytes waiting to be written to the client, and
    // likewise for `to_upstream`.
    let mut to_client = Leg::default();
    let mut to_upstream = Leg::default();
    let mut client_buf = vec![0u8; READ_BUFFER_SIZE];
    let mut upstream_buf = vec![0u8; READ_BUFFER_SIZE];

    while to_client.open() && to_upstream.open() {
        let event = tokio::select! {
            r = client_rd.read(&mut client_buf), if to_upstream.pending.len() < MAX_PENDING => {
                Event::ClientRead(r)
            }
            r = upstream_rd.read(&mut upstream_buf), if to_client.pending.len() < MAX_PENDING => {
                Event::UpstreamRead(r)
            }
            r = client_wr.write(&to_client.pending), if to_client.wants_write() => Event::ClientWrote(r),
            r = upstream_wr.write(&to_upstream.pending), if to_upstream.wants_write() => {
                Event::UpstreamWrote(r)
            }
            else => break,
        };

        match event {
            Event::ClientRead(r) => match r? {
                0 => to_client.read_closed = true,
                n => {
                    let flow = tap.client_chunk(&client_buf[..n], &mut to_upstream.pending).await?;
                    if flow == Flow::Intercept {
                        return Ok(RelayEnd::Intercepted);
                    }
                }
            },
            Event::UpstreamRead(r) => match r? {
                0 => to_upstream.read_closed = true,
                n => {
                    tap.upstream_chunk(&upstream_buf[..n]);
                    to_client.pending.extend_from_slice(&upstream_buf[..n]);
                }
            },
            Event::ClientWrote(r) => to_client.wrote(r),
            // The client still has a reply channel, so this is reported to the caller.
            Event::UpstreamWrote(r) => match r {
                Ok(0) => return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into()),
                Ok(n) => to_upstream.pending.advance(n),
                Err(e) => return Err(e.into()),
            },
        }
    }

    // Whatever the surviving leg still has queued is attempted once.
    if to_client.wants_write() {
        if let Err(e) = client_wr.write_all(&to_client.pending).await {
            debug!(error = %e, "failed to flush pending bytes to client");
        }
    }
    if to_upstream.wants_write() {
        if let Err(e) = upstream_wr.write_all(&to_upstream.pending).await {
            debug!(error = %e, "failed to flush pending bytes to upstream");
        }
    }
    let _ = client_wr.shutdown().await;
    let _ = upstream_wr.shutdown().await;

    Ok(RelayEnd::Closed)
}
