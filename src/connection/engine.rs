//! Connection Engine
//!
//! The single-threaded event loop. One [`ConnectionEngine`] owns the
//! listening socket, every client connection, the [`Keyspace`] and (through
//! it) the disposal pool. Nothing here is shared with another thread except
//! the shutdown flag and the poll waker.
//!
//! ## Connection Lifecycle
//!
//! ```text
//!                 partial frame
//!                 ┌──────────┐
//!                 ▼          │
//!        ┌──────────────────┐│   complete frame    ┌──────────────────┐
//! accept │ AwaitingRequest  │├───────────────────► │ SendingResponse  │◄─┐
//! ─────► │ (read interest)  │                      │ (write interest) │  │ partial
//!        └──────────────────┘ ◄─────────────────── └────────┬─────────┘──┘ write
//!                 │             buffer flushed               │
//!                 │  EOF / I/O error / bad frame / idle      │
//!                 ▼                                          ▼
//!        ┌─────────────────────────────────────────────────────────┐
//!        │ Terminating: unlinked, deregistered, socket closed      │
//!        └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## One Iteration
//!
//! 1. Wait for readiness, bounded by the next TTL or idle deadline
//! 2. Drive every ready connection until it would block
//! 3. Expire due keys (at most `expire_work_limit`)
//! 4. Evict idle connections from the head of the [`IdleList`]
//! 5. Accept at most one new connection
//!
//! Readiness is edge-triggered, so each connection is driven until the
//! socket reports `WouldBlock`, and the listener is polled with a zero
//! timeout for as long as it may still hold pending connections.

use crate::commands::CommandHandler;
use crate::connection::idle::IdleList;
use crate::pool::DisposalPool;
use crate::protocol::{parse_request, write_response, FrameError, HEADER_LEN, MAX_MSG};
use crate::storage::{Entry, HashIndex, Keyspace};
use bytes::{Buf, BytesMut};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Token of the listening socket.
const LISTENER: Token = Token(usize::MAX - 1);

/// Token of the shutdown waker.
const WAKER: Token = Token(usize::MAX);

/// A read buffer never holds more than one maximum-size frame.
const READ_BUFFER_CAP: usize = HEADER_LEN + MAX_MSG;

/// Bytes pulled from a socket per `read` call.
const READ_CHUNK: usize = 4096;

/// Tunables for the event loop.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Connections with no activity for this long are evicted.
    pub idle_timeout: Duration,
    /// Capacity of the readiness event buffer.
    pub max_events: usize,
    /// Most keys expired per iteration.
    pub expire_work_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(5),
            max_events: 1024,
            expire_work_limit: 2000,
        }
    }
}

/// Counters kept by the event loop.
#[derive(Debug, Default, Clone)]
pub struct EngineStats {
    /// Total number of connections accepted
    pub connections_accepted: u64,
    /// Total number of connections closed, for any reason
    pub connections_closed: u64,
    /// Connections closed by the idle timer
    pub idle_evictions: u64,
    /// Total commands processed
    pub commands_processed: u64,
    /// Keys removed by expiration
    pub keys_expired: u64,
    /// Total bytes read
    pub bytes_read: u64,
    /// Total bytes written
    pub bytes_written: u64,
    /// Accept calls that failed with something other than WouldBlock
    pub accept_errors: u64,
}

/// Failures of the event loop itself.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),
}

/// Why a connection was terminated.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Frame(#[from] FrameError),

    #[error("idle for more than {0:?}")]
    IdleTimeout(Duration),

    #[error("server shutting down")]
    Shutdown,
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    AwaitingRequest,
    SendingResponse,
    Terminating,
}

/// One client connection.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    state: ConnState,
    rbuf: BytesMut,
    wbuf: BytesMut,
    last_active: u64,
    interest: Interest,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr, now: u64) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::AwaitingRequest,
            rbuf: BytesMut::with_capacity(READ_BUFFER_CAP),
            wbuf: BytesMut::with_capacity(READ_BUFFER_CAP),
            last_active: now,
            interest: Interest::READABLE,
        }
    }

    /// Interest matching the current state.
    fn desired_interest(&self) -> Interest {
        match self.state {
            ConnState::SendingResponse => Interest::WRITABLE,
            _ => Interest::READABLE,
        }
    }

    /// Performs all I/O currently possible. On error the connection is left
    /// in `Terminating`.
    fn drive(
        &mut self,
        keyspace: &mut Keyspace,
        stats: &mut EngineStats,
        now: u64,
    ) -> Result<(), ConnectionError> {
        self.last_active = now;
        let result = self.drive_inner(keyspace, stats, now);
        if result.is_err() {
            self.state = ConnState::Terminating;
        }
        result
    }

    fn drive_inner(
        &mut self,
        keyspace: &mut Keyspace,
        stats: &mut EngineStats,
        now: u64,
    ) -> Result<(), ConnectionError> {
        loop {
            match self.state {
                ConnState::AwaitingRequest => {
                    if self.try_one_request(keyspace, stats, now)? {
                        continue;
                    }
                    if !self.fill_read_buffer(stats)? {
                        return Ok(());
                    }
                }
                ConnState::SendingResponse => {
                    if !self.flush(stats)? {
                        return Ok(());
                    }
                }
                ConnState::Terminating => return Ok(()),
            }
        }
    }

    /// Executes one buffered request, if a whole one is available.
    fn try_one_request(
        &mut self,
        keyspace: &mut Keyspace,
        stats: &mut EngineStats,
        now: u64,
    ) -> Result<bool, ConnectionError> {
        let Some(args) = parse_request(&mut self.rbuf)? else {
            return Ok(false);
        };

        let response = CommandHandler::new(keyspace, now).execute(&args);
        write_response(&response, &mut self.wbuf);
        stats.commands_processed += 1;
        trace!(peer = %self.peer, args = args.len(), pending = self.wbuf.len(), "Staged response");

        self.state = ConnState::SendingResponse;
        Ok(true)
    }

    /// Reads until the socket would block or at least one chunk arrived.
    /// Returns false on `WouldBlock`.
    fn fill_read_buffer(&mut self, stats: &mut EngineStats) -> Result<bool, ConnectionError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let room = READ_BUFFER_CAP.saturating_sub(self.rbuf.len()).min(READ_CHUNK);
            // A full buffer always holds a complete frame or a bad header.
            if room == 0 {
                return Ok(true);
            }

            match self.stream.read(&mut chunk[..room]) {
                Ok(0) => return Err(ConnectionError::PeerClosed),
                Ok(n) => {
                    self.rbuf.extend_from_slice(&chunk[..n]);
                    stats.bytes_read += n as u64;
                    trace!(peer = %self.peer, bytes = n, "Read data");
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Writes the staged response. Returns false on `WouldBlock`.
    fn flush(&mut self, stats: &mut EngineStats) -> Result<bool, ConnectionError> {
        while self.wbuf.has_remaining() {
            match self.stream.write(&self.wbuf) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    self.wbuf.advance(n);
                    stats.bytes_written += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        self.wbuf.clear();
        self.state = ConnState::AwaitingRequest;
        Ok(true)
    }
}

/// Stops a running engine from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Asks the loop to stop after the current iteration.
    pub fn shutdown(&self) -> io::Result<()> {
        self.flag.store(true, Ordering::Release);
        self.waker.wake()
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// The event loop and everything it owns.
pub struct ConnectionEngine {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    conns: Slab<Connection>,
    idle: IdleList,
    keyspace: Keyspace,
    config: EngineConfig,
    stats: EngineStats,
    shutdown: ShutdownHandle,
    started: Instant,
    accept_pending: bool,
    accept_failing: bool,
}

impl ConnectionEngine {
    /// Takes ownership of a bound listener, the primary index and the pool.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use tidekv::connection::{ConnectionEngine, EngineConfig};
    /// use tidekv::pool::DisposalPool;
    /// use tidekv::storage::HashIndex;
    ///
    /// let listener = std::net::TcpListener::bind("127.0.0.1:1234").unwrap();
    /// let engine = ConnectionEngine::new(
    ///     listener,
    ///     HashIndex::new(),
    ///     DisposalPool::new(4).unwrap(),
    ///     EngineConfig::default(),
    /// )
    /// .unwrap();
    /// engine.run().unwrap();
    /// ```
    pub fn new(
        listener: std::net::TcpListener,
        db: HashIndex<Entry>,
        disposal: DisposalPool,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER)?;

        Ok(Self {
            events: Events::with_capacity(config.max_events.max(1)),
            poll,
            listener,
            conns: Slab::new(),
            idle: IdleList::new(),
            keyspace: Keyspace::new(db, disposal),
            config,
            stats: EngineStats::default(),
            shutdown: ShutdownHandle {
                flag: Arc::new(AtomicBool::new(false)),
                waker: Arc::new(waker),
            },
            started: Instant::now(),
            accept_pending: false,
            accept_failing: false,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Milliseconds since the engine was created.
    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Runs until the shutdown handle fires.
    pub fn run(mut self) -> Result<(), EngineError> {
        info!(addr = ?self.local_addr().ok(), "Event loop started");

        while !self.shutdown.is_shutdown() {
            self.run_once()?;
        }

        info!(
            accepted = self.stats.connections_accepted,
            commands = self.stats.commands_processed,
            expired = self.stats.keys_expired,
            "Event loop stopped"
        );
        Ok(())
    }

    /// Runs a single iteration of the loop.
    pub fn run_once(&mut self) -> Result<(), EngineError> {
        let timeout = self.poll_timeout();
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            error!(error = %e, "Poll failed");
            return Err(EngineError::Poll(e));
        }

        let mut ready = Vec::new();
        for event in self.events.iter() {
            match event.token() {
                LISTENER => self.accept_pending = true,
                WAKER => {}
                Token(slot) => ready.push((slot, event.is_error())),
            }
        }

        let now = self.now_ms();
        for (slot, errored) in ready {
            self.service(slot, errored, now);
        }

        let expired = self
            .keyspace
            .expire_due(now, self.config.expire_work_limit);
        if expired > 0 {
            self.stats.keys_expired += expired as u64;
            debug!(expired = expired, remaining = self.keyspace.ttl_len(), "Expired keys");
        }

        self.evict_idle(now);

        if self.accept_pending {
            self.accept_one(now);
        }
        Ok(())
    }

    /// Time until the earliest TTL or idle deadline, or zero when work is
    /// already waiting.
    fn poll_timeout(&self) -> Option<Duration> {
        if self.accept_pending {
            return Some(Duration::ZERO);
        }

        let idle_ms = self.config.idle_timeout.as_millis() as u64;
        let idle_deadline = self
            .idle
            .front()
            .and_then(|slot| self.conns.get(slot))
            .map(|conn| conn.last_active.saturating_add(idle_ms));

        let deadline = match (self.keyspace.next_expiry(), idle_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }?;
        Some(Duration::from_millis(deadline.saturating_sub(self.now_ms())))
    }

    fn service(&mut self, slot: usize, errored: bool, now: u64) {
        let Some(conn) = self.conns.get_mut(slot) else {
            return;
        };

        if errored {
            let err = match conn.stream.take_error() {
                Ok(Some(e)) | Err(e) => e,
                Ok(None) => io::Error::other("socket error"),
            };
            self.close(slot, ConnectionError::Io(err));
            return;
        }

        if let Err(reason) = conn.drive(&mut self.keyspace, &mut self.stats, now) {
            self.close(slot, reason);
            return;
        }

        let desired = conn.desired_interest();
        if desired != conn.interest {
            if let Err(e) = self
                .poll
                .registry()
                .reregister(&mut conn.stream, Token(slot), desired)
            {
                self.close(slot, ConnectionError::Io(e));
                return;
            }
            conn.interest = desired;
        }
        self.idle.touch(slot);
    }

    /// Closes connections idle for longer than the timeout, oldest first.
    fn evict_idle(&mut self, now: u64) {
        let idle_ms = self.config.idle_timeout.as_millis() as u64;

        while let Some(slot) = self.idle.front() {
            let Some(conn) = self.conns.get(slot) else {
                self.idle.remove(slot);
                continue;
            };
            if now.saturating_sub(conn.last_active) < idle_ms {
                break;
            }
            self.stats.idle_evictions += 1;
            self.close(slot, ConnectionError::IdleTimeout(self.config.idle_timeout));
        }
    }

    fn accept_one(&mut self, now: u64) {
        match self.listener.accept() {
            Ok((mut stream, peer)) => {
                let entry = self.conns.vacant_entry();
                let slot = entry.key();
                if let Err(e) =
                    self.poll
                        .registry()
                        .register(&mut stream, Token(slot), Interest::READABLE)
                {
                    error!(peer = %peer, error = %e, "Failed to register connection");
                    return;
                }

                self.accept_failing = false;
                entry.insert(Connection::new(stream, peer, now));
                self.idle.push_back(slot);
                self.stats.connections_accepted += 1;
                info!(conn = slot, peer = %peer, "Client connected");
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.accept_pending = false;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => self.accept_failed(e),
        }
    }

    /// Records a failed accept. The backlog may still hold connections that
    /// will get no further readiness edge, so the listener stays pending.
    fn accept_failed(&mut self, e: io::Error) {
        self.stats.accept_errors += 1;
        if self.accept_failing {
            debug!(error = %e, "Accept still failing");
        } else {
            error!(error = %e, "Accept failed, retrying");
            self.accept_failing = true;
        }
    }

    /// Releases every resource held by `slot`.
    fn close(&mut self, slot: usize, reason: ConnectionError) {
        if !self.conns.contains(slot) {
            return;
        }
        let mut conn = self.conns.remove(slot);
        conn.state = ConnState::Terminating;
        self.idle.remove(slot);

        if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
            debug!(conn = slot, error = %e, "Deregister failed");
        }
        self.stats.connections_closed += 1;

        match reason {
            ConnectionError::PeerClosed => {
                debug!(conn = slot, peer = %conn.peer, "Client disconnected")
            }
            ConnectionError::IdleTimeout(_) => {
                info!(conn = slot, peer = %conn.peer, "Evicted idle connection")
            }
            ConnectionError::Shutdown => {
                debug!(conn = slot, peer = %conn.peer, "Closed connection on shutdown")
            }
            ConnectionError::Frame(ref e) => {
                warn!(conn = slot, peer = %conn.peer, error = %e, "Protocol violation")
            }
            ConnectionError::Io(ref e) if e.kind() == io::ErrorKind::ConnectionReset => {
                debug!(conn = slot, peer = %conn.peer, "Connection reset by client")
            }
            ConnectionError::Io(ref e) => {
                warn!(conn = slot, peer = %conn.peer, error = %e, "Connection error")
            }
        }
    }
}

impl Drop for ConnectionEngine {
    fn drop(&mut self) {
        let open: Vec<usize> = self.conns.iter().map(|(slot, _)| slot).collect();
        for slot in open {
            self.close(slot, ConnectionError::Shutdown);
        }
        debug!(keys = self.keyspace.len(), "Engine dropped");
    }
}
