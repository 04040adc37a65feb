//! Event-loop benchmark worker.
//!
//! Each worker runs alone on its own thread: one readiness multiplexer over
//! all of its sockets, two monotonic deadlines (next scheduled send, next
//! request timeout) folded into the poll timeout, a private keep-alive pool,
//! and its own slice of the execution plan. Nothing on the send or receive
//! path crosses threads.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};

use crate::payload::RequestPayload;
use crate::plan::WorkerPlan;
use crate::pool::ConnPool;
use crate::response::ResponseReader;
use crate::stats::{ErrorClass, WorkerStats};

const READ_BUF_BYTES: usize = 32 * 1024;
/// Upper bound on one multiplexer wait; also how fast the done flag is seen.
const POLL_TICK: Duration = Duration::from_millis(100);

/// State shared between the coordinator and every worker for one run.
pub(crate) struct RunShared {
    pub payload: RequestPayload,
    pub addr: SocketAddr,
    pub timeout: Duration,
    pub start: Instant,
    pub done: AtomicBool,
}

impl RunShared {
    fn done(&self) -> bool {
        self.done.load(Relaxed)
    }
}

pub(crate) struct Worker {
    worker_id: usize,
    shared: Arc<RunShared>,
    stats: Arc<WorkerStats>,
    plan: WorkerPlan,
    poll: Poll,
    /// Every live connection this worker owns, idle or bound.
    conns: HashMap<usize, TcpStream>,
    /// Connections currently bound to a request, by plan position.
    in_flight: HashMap<usize, usize>,
    pool: ConnPool,
    next_token: usize,
    buf: Vec<u8>,
    /// When the next scheduled request is due, if any.
    send_at: Option<Instant>,
    /// When the armed request times out; `None` means nothing is armed.
    timeout_at: Option<Instant>,
}

impl Worker {
    pub fn new(
        worker_id: usize,
        shared: Arc<RunShared>,
        stats: Arc<WorkerStats>,
        plan: WorkerPlan,
    ) -> anyhow::Result<Self> {
        let poll = Poll::new().context("create readiness multiplexer")?;
        Ok(Self {
            worker_id,
            shared,
            stats,
            plan,
            poll,
            conns: HashMap::new(),
            in_flight: HashMap::new(),
            pool: ConnPool::new(),
            next_token: 0,
            buf: vec![0u8; READ_BUF_BYTES],
            send_at: None,
            timeout_at: None,
        })
    }

    /// Runs the event loop to completion and hands the plan slice back for
    /// aggregation. A reactor failure aborts the whole process: a run that
    /// lost a worker has no valid result.
    pub fn run(mut self) -> WorkerPlan {
        let result = self.run_inner();
        self.close_all();
        if let Err(err) = result {
            tracing::error!(worker = self.worker_id, %err, "worker failed");
            std::process::exit(1);
        }
        self.plan
    }

    fn run_inner(&mut self) -> anyhow::Result<()> {
        self.schedule_next_request();
        let mut events = Events::with_capacity(256);
        loop {
            let timeout = self.poll_timeout();
            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("multiplexer wait failed"),
            }

            for event in events.iter() {
                self.dispatch(event)?;
            }

            let now = Instant::now();
            if self.send_at.is_some_and(|at| at <= now) {
                self.handle_send_due()?;
            }
            if self.timeout_at.is_some_and(|at| at <= now) {
                self.handle_timeout_due()?;
            }

            if self.shared.done() && self.in_flight.is_empty() {
                return Ok(());
            }
        }
    }

    fn poll_timeout(&self) -> Duration {
        let now = Instant::now();
        let mut timeout = POLL_TICK;
        for at in [self.send_at, self.timeout_at].into_iter().flatten() {
            timeout = timeout.min(at.saturating_duration_since(now));
        }
        timeout
    }

    fn dispatch(&mut self, event: &Event) -> anyhow::Result<()> {
        let token = event.token().0;
        if !self.conns.contains_key(&token) {
            // Closed earlier in this same batch of events.
            return Ok(());
        }

        if let Some(&pos) = self.in_flight.get(&token) {
            if event.is_error() {
                self.fail_request(pos, ErrorClass::SocketWrite);
                self.untrack(token);
                return self.close_conn(token);
            }
            if event.is_readable() || event.is_read_closed() {
                return self.handle_readable(token);
            }
            if event.is_writable() {
                return self.continue_write(token, pos);
            }
            return Ok(());
        }

        // Idle pooled connection: a hangup, or stray bytes the server left
        // behind. Either way it is not safe to reuse.
        self.pool.remove(token);
        self.stats.pooled.store(self.pool.len(), Relaxed);
        self.close_conn(token)
    }

    // ---------------- request scheduling ----------------

    fn handle_send_due(&mut self) -> anyhow::Result<()> {
        if self.shared.done() {
            self.schedule_next_request();
            return Ok(());
        }

        if let Some(pos) = self.plan.take_next() {
            self.stats.reqs_started.fetch_add(1, Relaxed);
            self.issue_request(pos)?;
            if self.timeout_at.is_none() {
                self.schedule_next_timeout()?;
            }
        }

        self.schedule_next_request();
        Ok(())
    }

    fn schedule_next_request(&mut self) {
        if self.shared.done() {
            self.send_at = None;
            return;
        }
        self.send_at = self.plan.peek_next().map(|r| self.shared.start + r.when);
    }

    // ---------------- issuing & writing ----------------

    fn issue_request(&mut self, pos: usize) -> anyhow::Result<()> {
        let token = match self.pool.get() {
            Some(token) => {
                self.stats.pooled.store(self.pool.len(), Relaxed);
                token
            }
            None => match self.open_conn(pos)? {
                Some(token) => token,
                None => return Ok(()),
            },
        };

        self.plan.req_mut(pos).token = Some(token);
        self.track(token, pos);
        self.write_request(token, pos)
    }

    /// Opens a fresh non-blocking connection toward the target. Per-request
    /// failures are recorded against `pos` and yield `Ok(None)`; running out
    /// of file descriptors is fatal.
    fn open_conn(&mut self, pos: usize) -> anyhow::Result<Option<usize>> {
        let mut stream = match TcpStream::connect(self.shared.addr) {
            Ok(stream) => stream,
            Err(e) if is_fd_limit(&e) => {
                anyhow::bail!("out of file descriptors ({e}); raise the open-files limit");
            }
            Err(e) => {
                let class = match e.kind() {
                    ErrorKind::ConnectionRefused
                    | ErrorKind::AddrNotAvailable
                    | ErrorKind::AddrInUse
                    | ErrorKind::TimedOut => ErrorClass::SocketConnect,
                    _ => ErrorClass::SocketCreate,
                };
                tracing::debug!(worker = self.worker_id, %e, "connect failed");
                self.fail_request(pos, class);
                return Ok(None);
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(worker = self.worker_id, %e, "set_nodelay failed");
            self.fail_request(pos, ErrorClass::SocketSetSockOpt);
            return Ok(None);
        }

        let token = self.next_token;
        self.next_token += 1;
        self.poll
            .registry()
            .register(&mut stream, Token(token), Interest::WRITABLE)
            .context("register client socket")?;
        self.conns.insert(token, stream);
        Ok(Some(token))
    }

    fn continue_write(&mut self, token: usize, pos: usize) -> anyhow::Result<()> {
        if self.plan.req(pos).write_done {
            return Ok(());
        }
        self.write_request(token, pos)
    }

    fn write_request(&mut self, token: usize, pos: usize) -> anyhow::Result<()> {
        enum Outcome {
            Complete,
            Blocked,
            Failed,
        }

        let outcome = {
            let payload: &[u8] = &self.shared.payload.bytes;
            let Some(stream) = self.conns.get_mut(&token) else {
                return Ok(());
            };
            let req = self.plan.req_mut(pos);
            loop {
                match stream.write(&payload[req.written_bytes..]) {
                    Ok(n) if n > 0 => {
                        req.written_bytes += n;
                        if req.written_bytes == payload.len() {
                            req.write_done = true;
                            break Outcome::Complete;
                        }
                    }
                    Ok(_) => break Outcome::Failed,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break Outcome::Blocked,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::debug!(worker = self.worker_id, %e, "request write failed");
                        break Outcome::Failed;
                    }
                }
            }
        };

        match outcome {
            Outcome::Complete => {
                self.stats.reqs_written.fetch_add(1, Relaxed);
                self.reregister(token, Interest::READABLE)
            }
            // Not writable yet; the socket may still be connecting.
            Outcome::Blocked => self.reregister(token, Interest::WRITABLE),
            Outcome::Failed => {
                self.fail_request(pos, ErrorClass::SocketWrite);
                self.untrack(token);
                self.close_conn(token)
            }
        }
    }

    // ---------------- reading & completion ----------------

    fn handle_readable(&mut self, token: usize) -> anyhow::Result<()> {
        loop {
            let n = {
                let Some(stream) = self.conns.get_mut(&token) else {
                    return Ok(());
                };
                match stream.read(&mut self.buf) {
                    Ok(n) => n,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::debug!(worker = self.worker_id, %e, "read failed; treating as remote close");
                        return self.handle_conn_closed(token);
                    }
                }
            };
            if n == 0 {
                return self.handle_conn_closed(token);
            }

            let Some(&pos) = self.in_flight.get(&token) else {
                return Ok(());
            };
            let fed = self.plan.req_mut(pos).parser.feed(&self.buf[..n]);
            match fed {
                Ok(true) => return self.complete_request(token, pos),
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!(worker = self.worker_id, %e, "response parse failed");
                    let elapsed = self.shared.start.elapsed();
                    let req = self.plan.req_mut(pos);
                    req.errored = true;
                    req.token = None;
                    req.response_time = elapsed.saturating_sub(req.when);
                    self.stats.record_error(ErrorClass::ResponseReader);
                    self.untrack(token);
                    return self.close_conn(token);
                }
            }
        }
    }

    fn complete_request(&mut self, token: usize, pos: usize) -> anyhow::Result<()> {
        let elapsed = self.shared.start.elapsed();
        let (code, response_time) = {
            let req = self.plan.req_mut(pos);
            req.http_code = req.parser.response_code;
            req.response_time = elapsed.saturating_sub(req.when);
            req.token = None;
            if req.http_code == 200 {
                req.completed = true;
            } else {
                req.errored = true;
            }
            (req.http_code, req.response_time)
        };

        if code != 200 {
            self.stats.record_error(ErrorClass::UnexpectedHttpCode);
        }
        self.stats.record_http_code(code);
        self.stats.record_value(response_time);
        self.untrack(token);

        if self.shared.payload.keep_alive {
            self.pool.put(token);
            self.stats.pooled.store(self.pool.len(), Relaxed);
            // Watch the idle socket so a server-side close evicts it.
            self.reregister(token, Interest::READABLE)
        } else {
            self.close_conn(token)
        }
    }

    /// The server closed the connection. For an in-flight request that is
    /// allowed at any time, so the request is reissued on a fresh
    /// connection rather than counted as an error.
    fn handle_conn_closed(&mut self, token: usize) -> anyhow::Result<()> {
        match self.in_flight.get(&token).copied() {
            Some(pos) => {
                self.untrack(token);
                self.close_conn(token)?;
                self.reissue_request(pos)
            }
            None => {
                self.pool.remove(token);
                self.stats.pooled.store(self.pool.len(), Relaxed);
                self.close_conn(token)
            }
        }
    }

    fn reissue_request(&mut self, pos: usize) -> anyhow::Result<()> {
        {
            let req = self.plan.req_mut(pos);
            if req.is_terminal() {
                return Ok(());
            }
            req.written_bytes = 0;
            if req.write_done {
                req.write_done = false;
                self.stats.reqs_written.fetch_sub(1, Relaxed);
            }
            req.parser = ResponseReader::new();
        }
        // Latency still counts from the original schedule slot.
        self.issue_request(pos)
    }

    // ---------------- timeouts ----------------

    fn handle_timeout_due(&mut self) -> anyhow::Result<()> {
        self.timeout_at = None;
        if let Some(pos) = self.plan.latest_timeout() {
            self.timeout_request(pos)?;
        }
        self.schedule_next_timeout()
    }

    fn timeout_request(&mut self, pos: usize) -> anyhow::Result<()> {
        if self.plan.req(pos).is_terminal() {
            return Ok(());
        }
        if let Some(token) = self.plan.req(pos).token {
            // A timed-out socket never goes back to the pool.
            self.untrack(token);
            self.close_conn(token)?;
        }

        let elapsed = self.shared.start.elapsed();
        let req = self.plan.req_mut(pos);
        req.token = None;
        req.parser = ResponseReader::new();
        req.errored = true;
        req.response_time = elapsed.saturating_sub(req.when);
        self.stats.record_error(ErrorClass::Timeout);
        // The max tracker sees the configured timeout; the request keeps
        // its measured duration for the sample file.
        self.stats.record_value(self.shared.timeout);
        Ok(())
    }

    fn schedule_next_timeout(&mut self) -> anyhow::Result<()> {
        let elapsed = self.shared.start.elapsed();
        loop {
            let Some(pos) = self.plan.next_potential_timeout() else {
                self.timeout_at = None;
                return Ok(());
            };
            let due = self.plan.req(pos).when + self.shared.timeout;
            if due <= elapsed {
                // Already past due; deal with it now and keep scanning.
                self.timeout_request(pos)?;
                continue;
            }
            self.timeout_at = Some(self.shared.start + due);
            return Ok(());
        }
    }

    // ---------------- bookkeeping ----------------

    fn fail_request(&mut self, pos: usize, class: ErrorClass) {
        let req = self.plan.req_mut(pos);
        req.errored = true;
        req.token = None;
        self.stats.record_error(class);
    }

    fn track(&mut self, token: usize, pos: usize) {
        self.in_flight.insert(token, pos);
        self.stats.in_flight.store(self.in_flight.len(), Relaxed);
    }

    fn untrack(&mut self, token: usize) {
        self.in_flight.remove(&token);
        self.stats.in_flight.store(self.in_flight.len(), Relaxed);
    }

    fn reregister(&mut self, token: usize, interest: Interest) -> anyhow::Result<()> {
        let Some(stream) = self.conns.get_mut(&token) else {
            return Ok(());
        };
        self.poll
            .registry()
            .reregister(stream, Token(token), interest)
            .context("reregister client socket")
    }

    fn close_conn(&mut self, token: usize) -> anyhow::Result<()> {
        if let Some(mut stream) = self.conns.remove(&token) {
            self.poll
                .registry()
                .deregister(&mut stream)
                .context("deregister client socket")?;
        }
        Ok(())
    }

    fn close_all(&mut self) {
        // Anything still bound at shutdown never produced a response; the
        // timeout path should have caught it first.
        let leftover: Vec<(usize, usize)> =
            self.in_flight.iter().map(|(&t, &p)| (t, p)).collect();
        for (token, pos) in leftover {
            let req = self.plan.req_mut(pos);
            if !req.is_terminal() {
                req.errored = true;
                self.stats.record_error(ErrorClass::NoResponse);
            }
            let _ = self.close_conn(token);
        }
        self.in_flight.clear();
        self.stats.in_flight.store(0, Relaxed);

        while let Some(token) = self.pool.get() {
            let _ = self.close_conn(token);
        }
        self.stats.pooled.store(0, Relaxed);
    }
}

fn is_fd_limit(e: &std::io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}
