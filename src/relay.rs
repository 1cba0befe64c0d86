//! Flow-controlled bidirectional relay.
//!
//! Each proxied connection owns two fixed-capacity buffers, one per
//! direction. A direction only reads from its source while at least half the
//! buffer is free, so a lagging consumer pauses production instead of growing
//! memory without bound.

use std::{io, pin::pin};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Client-to-destination buffer capacity, shared by all connections.
pub const REQUEST_BUFFER_SIZE: usize = 512;
/// Destination-to-client buffer capacity, shared by all connections.
pub const RESPONSE_BUFFER_SIZE: usize = 2048;

/// Fixed-capacity byte window with fill/consume cursors.
pub struct RelayBuffer {
    data: Box<[u8]>,
    start: usize,
    end: usize,
}

impl RelayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn pending(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.pending()
    }

    /// Reading is allowed only while at least half the buffer is free.
    pub fn has_read_room(&self) -> bool {
        self.free() * 2 >= self.capacity()
    }

    /// Moves unconsumed bytes to the front, making all free space contiguous.
    pub fn compact(&mut self) {
        if self.start > 0 {
            self.data.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
    }

    /// Unconsumed bytes and the writable tail, as disjoint slices.
    fn parts(&mut self) -> (&[u8], &mut [u8]) {
        let (filled, tail) = self.data.split_at_mut(self.end);
        (&filled[self.start..], tail)
    }

    fn fill(&mut self, n: usize) {
        self.end += n;
    }

    fn consume(&mut self, n: usize) {
        self.start += n;
        if self.is_empty() {
            self.start = 0;
            self.end = 0;
        }
    }
}

/// Which half of the proxied pair a pipe moves bytes for; selects the
/// half-close and error policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    fn source(self) -> &'static str {
        match self {
            Direction::ClientToServer => "client",
            Direction::ServerToClient => "server",
        }
    }
}

enum Step {
    Read(io::Result<usize>),
    Write(io::Result<usize>),
    Done,
}

/// Moves bytes from `src` to `dst` through `buf` until end of stream.
///
/// On source EOF the remaining buffered bytes are drained and the
/// destination's write side is shut down. A read error from the destination
/// socket (server role) is treated like the remote side finishing; every
/// other error is fatal for the pipe. Returns the bytes delivered to `dst`.
async fn pipe<R, W>(dir: Direction, mut src: R, mut dst: W, mut buf: RelayBuffer) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut eof = false;

    loop {
        buf.compact();
        let capacity = buf.capacity();
        let (pending, tail) = buf.parts();
        let want_read = !eof && tail.len() * 2 >= capacity;
        let want_write = !pending.is_empty();

        let step = tokio::select! {
            res = src.read(tail), if want_read => Step::Read(res),
            res = dst.write(pending), if want_write => Step::Write(res),
            else => Step::Done,
        };

        match step {
            Step::Read(Ok(0)) => {
                tracing::debug!("{} finished sending", dir.source());
                eof = true;
            }
            Step::Read(Ok(n)) => buf.fill(n),
            Step::Read(Err(err)) => match dir {
                // A reset from the destination counts as the remote side
                // finishing; bytes already buffered still reach the client.
                Direction::ServerToClient => {
                    tracing::debug!("server finished sending: {err}");
                    eof = true;
                }
                Direction::ClientToServer => return Err(err),
            },
            Step::Write(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
            Step::Write(Ok(n)) => {
                buf.consume(n);
                total += n as u64;
            }
            Step::Write(Err(err)) => return Err(err),
            Step::Done => {
                // eof with an empty buffer: half-close the destination.
                let _ = dst.shutdown().await;
                return Ok(total);
            }
        }
    }
}

/// Relays bytes between the client and the destination until the destination
/// side finishes or either direction fails. Client EOF only half-closes: the
/// destination-to-client direction keeps delivering buffered bytes.
///
/// Returns `(client_to_server, server_to_client)` byte counts.
pub async fn relay<C, S>(client: C, server: S) -> io::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite,
    S: AsyncRead + AsyncWrite,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, server_write) = tokio::io::split(server);

    let mut upload = pin!(pipe(
        Direction::ClientToServer,
        client_read,
        server_write,
        RelayBuffer::new(REQUEST_BUFFER_SIZE),
    ));
    let mut download = pin!(pipe(
        Direction::ServerToClient,
        server_read,
        client_write,
        RelayBuffer::new(RESPONSE_BUFFER_SIZE),
    ));

    let mut sent = None;
    loop {
        tokio::select! {
            res = &mut upload, if sent.is_none() => sent = Some(res?),
            res = &mut download => {
                // Once the destination side finishes the relay is over; an
                // upload still in flight is torn down with the sockets.
                let received = res?;
                return Ok((sent.unwrap_or(0), received));
            }
        }
    }
}
