//! Per-connection state and I/O.
//!
//! Owns the socket for one client: buffered reads, request and response
//! orchestration, and the two-segment vectored write (headers from the
//! write buffer, body straight from the response's file mapping) with
//! partial-write resumption.

use std::io::{self, IoSlice, Write};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use mio::net::TcpStream;
use mio::{Interest, Token};
use tracing::debug;

use crate::buffer::Buffer;
use crate::http::request::{HttpRequest, ParseError};
use crate::http::response::HttpResponse;
use crate::server::ServerContext;

/// Keep draining a level-triggered write until fewer than this many
/// bytes remain, so one large response does not monopolize a worker.
const WRITE_HIGH_WATER: usize = 10240;

/// Progress through the two outgoing segments.
///
/// Segment 0 is the readable window of the write buffer, segment 1 the
/// mapped file. `advance` applies write progress and reports how much of
/// the head segment to drop from the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WriteCursor {
    head_len: usize,
    file_off: usize,
    file_len: usize,
}

#[derive(Debug, PartialEq, Eq)]
enum HeadConsumed {
    None,
    Partial(usize),
    All,
}

impl WriteCursor {
    fn empty() -> Self {
        Self {
            head_len: 0,
            file_off: 0,
            file_len: 0,
        }
    }

    fn new(head_len: usize, file_len: usize) -> Self {
        Self {
            head_len,
            file_off: 0,
            file_len,
        }
    }

    fn remaining(&self) -> usize {
        self.head_len + self.file_len
    }

    fn is_done(&self) -> bool {
        self.remaining() == 0
    }

    /// Apply `n` written bytes across the two segments.
    fn advance(&mut self, n: usize) -> HeadConsumed {
        if n > self.head_len {
            let excess = n - self.head_len;
            self.file_off += excess;
            self.file_len -= excess;
            if self.head_len > 0 {
                self.head_len = 0;
                return HeadConsumed::All;
            }
            HeadConsumed::None
        } else {
            self.head_len -= n;
            HeadConsumed::Partial(n)
        }
    }
}

/// One client connection.
pub struct HttpConn {
    stream: Option<TcpStream>,
    addr: SocketAddr,
    token: Token,
    read_buf: Buffer,
    write_buf: Buffer,
    request: HttpRequest,
    response: HttpResponse,
    cursor: WriteCursor,
    keep_alive: bool,
    closed: bool,
    ctx: Arc<ServerContext>,
}

impl HttpConn {
    pub fn new(stream: TcpStream, addr: SocketAddr, token: Token, ctx: Arc<ServerContext>) -> Self {
        ctx.live_connections.fetch_add(1, Ordering::Relaxed);
        Self {
            stream: Some(stream),
            addr,
            token,
            read_buf: Buffer::new(),
            write_buf: Buffer::new(),
            request: HttpRequest::new(),
            response: HttpResponse::new(),
            cursor: WriteCursor::empty(),
            keep_alive: false,
            closed: false,
            ctx,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether the connection outlives the staged response.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Bytes still queued for the peer.
    pub fn to_write_bytes(&self) -> usize {
        self.cursor.remaining()
    }

    /// Drain the socket into the read buffer.
    ///
    /// Edge-triggered connections keep reading until the socket would
    /// block; one pass is enough under level triggering because the
    /// poller re-reports leftover data. EOF surfaces as `ConnectionReset`
    /// so every disconnect reason lands on the same error path.
    pub fn read(&mut self) -> io::Result<usize> {
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "connection closed",
                ))
            }
        };
        let mut total = 0;
        loop {
            match self.read_buf.read_from(stream) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::ConnectionReset, "EOF")),
                Ok(n) => {
                    total += n;
                    if !self.ctx.edge_triggered {
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Parse whatever is buffered and stage the response for it.
    ///
    /// Returns false when there is nothing to respond to yet. Parse
    /// failures stage a 400 and store failures a 500, both with
    /// keep-alive forced off so the connection closes after the flush.
    pub fn process(&mut self) -> bool {
        self.request.reset();
        if self.read_buf.readable_bytes() == 0 {
            return false;
        }
        let (code, keep_alive) = match self
            .request
            .parse(&mut self.read_buf, self.ctx.store.as_ref())
        {
            Ok(()) => (200, self.request.is_keep_alive()),
            Err(ParseError::BadRequest) => (400, false),
            Err(ParseError::StoreUnavailable) => (500, false),
        };
        self.keep_alive = keep_alive;
        self.response
            .init(&self.ctx.root, self.request.path().to_string(), keep_alive, code);
        self.response.make_response(&mut self.write_buf);
        self.cursor = WriteCursor::new(self.write_buf.readable_bytes(), self.response.file_len());
        debug!(
            token = self.token.0,
            method = %self.request.method(),
            path = %self.request.path(),
            version = %self.request.version(),
            code,
            to_write = self.to_write_bytes(),
            "response staged"
        );
        true
    }

    /// Flush staged bytes with vectored writes.
    ///
    /// Stops once the socket would block, or once a level-triggered
    /// connection is under the high-water mark. Returning `Ok` with
    /// bytes still queued means "re-arm and come back when writable".
    pub fn write(&mut self) -> io::Result<()> {
        loop {
            if self.cursor.is_done() {
                return Ok(());
            }
            let stream = match self.stream.as_mut() {
                Some(s) => s,
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "connection closed",
                    ))
                }
            };
            let head = self.write_buf.peek();
            let file = self.response.file().unwrap_or(&[]);
            let segments = [
                IoSlice::new(head),
                IoSlice::new(&file[self.cursor.file_off..self.cursor.file_off + self.cursor.file_len]),
            ];
            let count = if self.cursor.file_len > 0 { 2 } else { 1 };
            let n = match stream.write_vectored(&segments[..count]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"))
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            match self.cursor.advance(n) {
                HeadConsumed::Partial(len) => self.write_buf.retrieve(len),
                HeadConsumed::All => self.write_buf.retrieve_all(),
                HeadConsumed::None => {}
            }
            if !(self.ctx.edge_triggered || self.cursor.remaining() > WRITE_HIGH_WATER) {
                return Ok(());
            }
        }
    }

    /// Re-register interest so the poller reports this connection again.
    pub fn rearm(&mut self, interest: Interest) -> io::Result<()> {
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Ok(()),
        };
        self.ctx.registry.reregister(stream, self.token, interest)
    }

    /// Release the descriptor and file mapping. Safe to call repeatedly;
    /// the counter is decremented and the slab slot queued exactly once.
    pub fn close(&mut self) {
        self.response.unmap();
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut stream) = self.stream.take() {
            let _ = self.ctx.registry.deregister(&mut stream);
        }
        let live = self.ctx.live_connections.fetch_sub(1, Ordering::Relaxed) - 1;
        self.ctx.push_closed(self.token);
        debug!(token = self.token.0, addr = %self.addr, live, "connection closed");
    }
}

impl Drop for HttpConn {
    fn drop(&mut self) {
        self.close();
    }
}
