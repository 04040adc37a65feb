//! Precomputed open-loop request schedule.
//!
//! Every request's send time is fixed before the run starts and never moves
//! in response to earlier latency; a slow response delays nothing. That is
//! what makes the measured tail honest (no coordinated omission).

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use crate::response::ResponseReader;

/// One scheduled request and everything recorded about its attempt(s).
#[derive(Debug, Default)]
pub struct Request {
    /// Global position in the schedule.
    pub index: usize,
    /// Offset from run start at which this request must be issued.
    pub when: Duration,
    pub written_bytes: usize,
    pub write_done: bool,
    pub completed: bool,
    pub errored: bool,
    pub http_code: u16,
    /// Time from `when` until the terminal transition; zero means the
    /// request never produced a sample.
    pub response_time: Duration,
    /// Reactor token of the currently bound connection, if any.
    pub token: Option<usize>,
    pub parser: ResponseReader,
}

impl Request {
    pub fn is_terminal(&self) -> bool {
        self.completed || self.errored
    }
}

/// The slice of the schedule owned by one worker, in send order, plus that
/// worker's send and timeout cursors.
#[derive(Debug, Default)]
pub struct WorkerPlan {
    reqs: Vec<Request>,
    next_send: usize,
    next_timeout: usize,
    latest_timeout: Option<usize>,
}

impl WorkerPlan {
    pub fn len(&self) -> usize {
        self.reqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }

    pub fn reqs(&self) -> &[Request] {
        &self.reqs
    }

    pub fn req(&self, pos: usize) -> &Request {
        &self.reqs[pos]
    }

    pub fn req_mut(&mut self, pos: usize) -> &mut Request {
        &mut self.reqs[pos]
    }

    /// The next request this worker is scheduled to send, if any remain.
    pub fn peek_next(&self) -> Option<&Request> {
        self.reqs.get(self.next_send)
    }

    /// Returns the position of the next request to send and advances the
    /// send cursor past it.
    pub fn take_next(&mut self) -> Option<usize> {
        if self.next_send == self.reqs.len() {
            return None;
        }
        let pos = self.next_send;
        self.next_send += 1;
        Some(pos)
    }

    /// Advances the timeout cursor to the next sent request that is still
    /// not terminal and returns its position. The cursor never runs ahead
    /// of the send cursor: unsent requests cannot time out.
    pub fn next_potential_timeout(&mut self) -> Option<usize> {
        self.latest_timeout = None;
        while self.next_timeout < self.next_send {
            let pos = self.next_timeout;
            self.next_timeout += 1;
            if self.reqs[pos].is_terminal() {
                continue;
            }
            self.latest_timeout = Some(pos);
            return Some(pos);
        }
        None
    }

    /// The request currently armed on the timeout deadline.
    pub fn latest_timeout(&self) -> Option<usize> {
        self.latest_timeout
    }
}

/// The full schedule: `rps × seconds` requests at fixed intervals, dealt
/// round-robin to workers so no cross-worker coordination is needed on the
/// send path.
#[derive(Debug)]
pub struct ExecutionPlan {
    workers: Vec<WorkerPlan>,
}

impl ExecutionPlan {
    pub fn new(rps: usize, seconds: u64, worker_count: usize) -> Self {
        let total = rps * seconds as usize;
        let step_ns = if rps > 0 {
            (1_000_000_000f64 / rps as f64) as u64
        } else {
            0
        };

        let mut workers: Vec<WorkerPlan> =
            (0..worker_count).map(|_| WorkerPlan::default()).collect();
        for i in 0..total {
            workers[i % worker_count].reqs.push(Request {
                index: i,
                when: Duration::from_nanos(step_ns * i as u64),
                ..Default::default()
            });
        }
        Self { workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn total_len(&self) -> usize {
        self.workers.iter().map(|w| w.len()).sum()
    }

    pub fn worker(&self, worker_id: usize) -> &WorkerPlan {
        &self.workers[worker_id]
    }

    pub fn worker_mut(&mut self, worker_id: usize) -> &mut WorkerPlan {
        &mut self.workers[worker_id]
    }

    /// Hands each worker its owned slice of the schedule.
    pub fn into_workers(self) -> Vec<WorkerPlan> {
        self.workers
    }
}

/// Writes one CSV row per planned request, in global schedule order. The
/// latency column is left empty for requests that produced no sample.
pub fn write_latencies_csv(workers: &[WorkerPlan], path: &Path) -> io::Result<()> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    writeln!(out, "whenNs,written,completed,error,httpCode,latencyMs")?;

    let mut rows: Vec<&Request> = workers.iter().flat_map(|w| w.reqs.iter()).collect();
    rows.sort_by_key(|r| r.index);
    for r in rows {
        write!(
            out,
            "{},{},{},{},{}",
            r.when.as_nanos(),
            r.write_done as u8,
            r.completed as u8,
            r.errored as u8,
            r.http_code
        )?;
        if r.response_time != Duration::ZERO {
            writeln!(out, ",{:7.6}", r.response_time.as_secs_f64() * 1000.0)?;
        } else {
            writeln!(out, ",")?;
        }
    }
    out.flush()
}
