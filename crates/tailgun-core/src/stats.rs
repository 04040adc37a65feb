//! Per-worker counters and gauges.
//!
//! Each counter has exactly one writer (its worker); relaxed atomics let the
//! coordinator print a live status line without any locking. Authoritative
//! totals are read only after the workers have been joined.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering::Relaxed};
use std::time::Duration;

/// Completed responses are bucketed by status code below this bound.
pub const HTTP_CODE_BUCKETS: usize = 1000;

/// Per-request failure classes. None of these stop the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    SocketCreate,
    SocketConnect,
    SocketSetSockOpt,
    SocketWrite,
    ResponseReader,
    UnexpectedHttpCode,
    Timeout,
    NoResponse,
}

#[derive(Debug)]
pub struct WorkerStats {
    pub reqs_started: AtomicU64,
    pub reqs_written: AtomicU64,
    pub resp_recvd: AtomicU64,

    pub errors_socket_create: AtomicU64,
    pub errors_socket_connect: AtomicU64,
    pub errors_socket_setsockopt: AtomicU64,
    pub errors_socket_write: AtomicU64,
    pub errors_response_reader: AtomicU64,
    pub errors_unexpected_http_code: AtomicU64,
    pub errors_timeout: AtomicU64,
    pub errors_no_response: AtomicU64,

    pub http_codes: Vec<AtomicU64>,
    pub max_ns: AtomicU64,

    /// Requests currently bound to a socket and awaiting a response.
    pub in_flight: AtomicUsize,
    /// Idle keep-alive connections parked in the worker's pool.
    pub pooled: AtomicUsize,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self {
            reqs_started: AtomicU64::new(0),
            reqs_written: AtomicU64::new(0),
            resp_recvd: AtomicU64::new(0),
            errors_socket_create: AtomicU64::new(0),
            errors_socket_connect: AtomicU64::new(0),
            errors_socket_setsockopt: AtomicU64::new(0),
            errors_socket_write: AtomicU64::new(0),
            errors_response_reader: AtomicU64::new(0),
            errors_unexpected_http_code: AtomicU64::new(0),
            errors_timeout: AtomicU64::new(0),
            errors_no_response: AtomicU64::new(0),
            http_codes: (0..HTTP_CODE_BUCKETS).map(|_| AtomicU64::new(0)).collect(),
            max_ns: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            pooled: AtomicUsize::new(0),
        }
    }

    pub fn record_error(&self, class: ErrorClass) {
        let counter = match class {
            ErrorClass::SocketCreate => &self.errors_socket_create,
            ErrorClass::SocketConnect => &self.errors_socket_connect,
            ErrorClass::SocketSetSockOpt => &self.errors_socket_setsockopt,
            ErrorClass::SocketWrite => &self.errors_socket_write,
            ErrorClass::ResponseReader => &self.errors_response_reader,
            ErrorClass::UnexpectedHttpCode => &self.errors_unexpected_http_code,
            ErrorClass::Timeout => &self.errors_timeout,
            ErrorClass::NoResponse => &self.errors_no_response,
        };
        counter.fetch_add(1, Relaxed);
    }

    /// Folds a finished response time into the received count and the
    /// running maximum.
    pub fn record_value(&self, d: Duration) {
        self.max_ns.fetch_max(d.as_nanos() as u64, Relaxed);
        self.resp_recvd.fetch_add(1, Relaxed);
    }

    pub fn record_http_code(&self, code: u16) {
        if let Some(bucket) = self.http_codes.get(code as usize) {
            bucket.fetch_add(1, Relaxed);
        }
    }

    pub fn max(&self) -> Duration {
        Duration::from_nanos(self.max_ns.load(Relaxed))
    }

    pub fn errors_total(&self) -> u64 {
        self.errors_socket_create.load(Relaxed)
            + self.errors_socket_connect.load(Relaxed)
            + self.errors_socket_setsockopt.load(Relaxed)
            + self.errors_socket_write.load(Relaxed)
            + self.errors_response_reader.load(Relaxed)
            + self.errors_unexpected_http_code.load(Relaxed)
            + self.errors_timeout.load(Relaxed)
            + self.errors_no_response.load(Relaxed)
    }
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_value_tracks_max_and_count() {
        let stats = WorkerStats::new();
        stats.record_value(Duration::from_millis(5));
        stats.record_value(Duration::from_millis(2));
        assert_eq!(stats.max(), Duration::from_millis(5));
        assert_eq!(stats.resp_recvd.load(Relaxed), 2);
    }

    #[test]
    fn test_out_of_range_http_code_is_ignored() {
        let stats = WorkerStats::new();
        stats.record_http_code(200);
        stats.record_http_code(1000);
        assert_eq!(stats.http_codes[200].load(Relaxed), 1);
        assert_eq!(stats.errors_total(), 0);
    }
}
