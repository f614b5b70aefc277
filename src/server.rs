//! Event loop and connection dispatch.
//!
//! A single poller thread owns the listener, the connection slab, and
//! the idle timers; request handling runs on the worker pool. Handlers
//! re-arm their connection through a shared registry handle, which
//! delivers a fresh edge for any descriptor that still has pending
//! readiness.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::http::conn::HttpConn;
use crate::pool::WorkerPool;
use crate::timer::TimerHeap;
use crate::users::UserStore;

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// State shared between the event loop and every connection handler.
pub struct ServerContext {
    pub(crate) registry: Registry,
    pub(crate) root: PathBuf,
    pub(crate) edge_triggered: bool,
    pub(crate) live_connections: AtomicUsize,
    pub(crate) store: Arc<dyn UserStore>,
    closed: Mutex<Vec<Token>>,
}

impl ServerContext {
    pub(crate) fn new(
        registry: Registry,
        root: PathBuf,
        edge_triggered: bool,
        store: Arc<dyn UserStore>,
    ) -> Self {
        Self {
            registry,
            root,
            edge_triggered,
            live_connections: AtomicUsize::new(0),
            store,
            closed: Mutex::new(Vec::new()),
        }
    }

    /// Queue a token for the event loop to release its slab slot.
    pub(crate) fn push_closed(&self, token: Token) {
        self.closed.lock().unwrap().push(token);
    }

    pub(crate) fn take_closed(&self) -> Vec<Token> {
        std::mem::take(&mut *self.closed.lock().unwrap())
    }
}

/// The HTTP server: listener, poller, timers, and worker pool.
pub struct Server {
    poll: Poll,
    listener: TcpListener,
    conns: Slab<Arc<Mutex<HttpConn>>>,
    timer: TimerHeap,
    pool: WorkerPool,
    ctx: Arc<ServerContext>,
    timeout: Duration,
    max_connections: usize,
    local_addr: SocketAddr,
}

impl Server {
    pub fn new(config: &Config, store: Arc<dyn UserStore>) -> io::Result<Server> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut listener = TcpListener::from_std(create_listener(addr)?);
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let ctx = Arc::new(ServerContext::new(
            poll.registry().try_clone()?,
            config.root.clone(),
            config.edge_triggered,
            store,
        ));
        let pool = WorkerPool::new(config.workers)?;

        Ok(Server {
            poll,
            listener,
            conns: Slab::with_capacity(config.max_connections),
            timer: TimerHeap::new(),
            pool,
            ctx,
            timeout: Duration::from_millis(config.timeout_ms),
            max_connections: config.max_connections,
            local_addr,
        })
    }

    /// Address the listener actually bound, useful with port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Drive the event loop until a poll error.
    pub fn run(mut self) -> io::Result<()> {
        info!(address = %self.local_addr(), "Server listening");
        let mut events = Events::with_capacity(1024);
        loop {
            // fires due evictions and tells us how long we may sleep
            let next = self.timer.next_tick();
            self.reap_closed();
            let timeout = if self.timer.is_empty() {
                None
            } else {
                Some(Duration::from_millis(next))
            };

            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    _ => self.dispatch(event),
                }
            }
        }
    }

    /// Release slab slots and timers of connections closed by handlers.
    fn reap_closed(&mut self) {
        for token in self.ctx.take_closed() {
            self.timer.cancel(token.0);
            if self.conns.contains(token.0) {
                self.conns.remove(token.0);
                debug!(token = token.0, "connection slot released");
            }
        }
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    if self.conns.len() >= self.max_connections {
                        warn!(%addr, "connection limit reached, rejecting");
                        continue;
                    }
                    let entry = self.conns.vacant_entry();
                    let token = Token(entry.key());
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        error!(error = %e, "failed to register connection");
                        continue;
                    }
                    let conn = Arc::new(Mutex::new(HttpConn::new(
                        stream,
                        addr,
                        token,
                        Arc::clone(&self.ctx),
                    )));
                    if !self.timeout.is_zero() {
                        let evicted = Arc::clone(&conn);
                        self.timer.add(token.0, self.timeout, move || {
                            debug!(token = token.0, "idle connection evicted");
                            evicted.lock().unwrap().close();
                        });
                    }
                    entry.insert(conn);
                    debug!(
                        token = token.0,
                        peer = %addr,
                        live = self.ctx.live_connections.load(Ordering::Relaxed),
                        "accepted connection"
                    );
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Refresh the idle timer and hand the ready connection to a worker.
    fn dispatch(&mut self, event: &mio::event::Event) {
        let token = event.token();
        let conn = match self.conns.get(token.0) {
            Some(conn) => Arc::clone(conn),
            None => return,
        };
        if !self.timeout.is_zero() {
            self.timer.adjust(token.0, self.timeout);
        }
        if event.is_writable() {
            self.pool.add_task(move || handle_write(&conn));
        } else {
            self.pool.add_task(move || handle_read(&conn));
        }
    }
}

fn handle_read(conn: &Arc<Mutex<HttpConn>>) {
    let mut conn = conn.lock().unwrap();
    if conn.is_closed() {
        return;
    }
    if let Err(e) = conn.read() {
        debug!(token = conn.token().0, error = %e, "read failed");
        conn.close();
        return;
    }
    // A readable edge can land while a response is still staged. The
    // flush must finish first; whatever was just read stays buffered
    // and is processed from handle_write once the flush completes.
    if conn.to_write_bytes() > 0 {
        if let Err(e) = conn.rearm(Interest::WRITABLE) {
            debug!(token = conn.token().0, error = %e, "rearm failed");
            conn.close();
        }
        return;
    }
    let interest = if conn.process() {
        Interest::WRITABLE
    } else {
        Interest::READABLE
    };
    if let Err(e) = conn.rearm(interest) {
        debug!(token = conn.token().0, error = %e, "rearm failed");
        conn.close();
    }
}

fn handle_write(conn: &Arc<Mutex<HttpConn>>) {
    let mut conn = conn.lock().unwrap();
    if conn.is_closed() {
        return;
    }
    if let Err(e) = conn.write() {
        debug!(token = conn.token().0, error = %e, "write failed");
        conn.close();
        return;
    }
    if conn.to_write_bytes() > 0 {
        // socket backpressure, wait for the next writable edge
        if conn.rearm(Interest::WRITABLE).is_err() {
            conn.close();
        }
        return;
    }
    if !conn.is_keep_alive() {
        conn.close();
        return;
    }
    // Response flushed on a keep-alive connection. A pipelined request
    // may already be buffered, so try to process before re-arming.
    let interest = if conn.process() {
        Interest::WRITABLE
    } else {
        Interest::READABLE
    };
    if conn.rearm(interest).is_err() {
        conn.close();
    }
}

/// Build the non-blocking listener socket.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}
