//! Benchmark coordinator: builds the plan, runs the workers, reports.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context as _;

use crate::payload::RequestPayload;
use crate::plan::{self, ExecutionPlan, WorkerPlan};
use crate::stats::{WorkerStats, HTTP_CODE_BUCKETS};
use crate::worker::{RunShared, Worker};

#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Resolved IPv4 target.
    pub addr: SocketAddr,
    pub rps: usize,
    pub seconds: u64,
    pub timeout: Duration,
    /// Advisory concurrency cap, carried through but not enforced.
    pub max_concurrent: usize,
    pub verbose: bool,
    /// Where to write the per-request latency rows; `None` skips the file.
    pub latencies_csv: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BenchResult {
    pub started_rate: f64,
    pub errors: u64,
    pub recvd: u64,
    pub p99d9: Duration,
    pub p99d99: Duration,
    pub p99d999: Duration,
    pub max: Duration,
}

pub struct Benchmark {
    cfg: BenchConfig,
    payload: RequestPayload,
}

impl Benchmark {
    pub fn new(payload: RequestPayload, cfg: BenchConfig) -> Self {
        Self { cfg, payload }
    }

    /// Runs the full benchmark: spawn one worker per core, let the plan
    /// play out for the configured wall-clock budget, drain, aggregate.
    pub fn run(self) -> anyhow::Result<BenchResult> {
        let worker_count = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let plan = ExecutionPlan::new(self.cfg.rps, self.cfg.seconds, worker_count);

        let shared = Arc::new(RunShared {
            payload: self.payload.clone(),
            addr: self.cfg.addr,
            timeout: self.cfg.timeout,
            start: Instant::now(),
            done: AtomicBool::new(false),
        });
        let all_stats: Vec<Arc<WorkerStats>> = (0..worker_count)
            .map(|_| Arc::new(WorkerStats::new()))
            .collect();

        let mut handles = Vec::with_capacity(worker_count);
        for (worker_id, worker_plan) in plan.into_workers().into_iter().enumerate() {
            let shared = Arc::clone(&shared);
            let stats = Arc::clone(&all_stats[worker_id]);
            let handle = thread::Builder::new()
                .name(format!("tailgun-worker-{worker_id}"))
                .spawn(move || match Worker::new(worker_id, shared, stats, worker_plan) {
                    Ok(worker) => worker.run(),
                    Err(err) => {
                        tracing::error!(worker = worker_id, %err, "failed to start worker");
                        std::process::exit(1);
                    }
                })
                .context("spawn worker thread")?;
            handles.push(handle);
        }

        // Let the plan play out.
        let budget = Duration::from_secs(self.cfg.seconds);
        loop {
            thread::sleep(Duration::from_secs(1));
            if shared.start.elapsed() > budget {
                break;
            }
            if self.cfg.verbose {
                print_status(&all_stats, shared.start.elapsed());
            }
        }
        shared.done.store(true, Relaxed);
        let run_elapsed = shared.start.elapsed();

        // Wait until the final in-flight requests completed or timed out.
        let mut ticks = 0u32;
        while all_stats.iter().map(|s| s.in_flight.load(Relaxed)).sum::<usize>() > 0 {
            thread::sleep(Duration::from_millis(100));
            if ticks % 10 == 0 && self.cfg.verbose {
                print_status(&all_stats, run_elapsed);
            }
            ticks += 1;
        }

        let mut worker_plans: Vec<WorkerPlan> = Vec::with_capacity(worker_count);
        for handle in handles {
            let worker_plan = handle
                .join()
                .map_err(|_| anyhow::anyhow!("worker thread panicked"))?;
            worker_plans.push(worker_plan);
        }

        if let Some(path) = &self.cfg.latencies_csv {
            plan::write_latencies_csv(&worker_plans, path).context("write latencies file")?;
        }

        let result = calculate_result(&worker_plans, &all_stats, run_elapsed);
        if self.cfg.verbose {
            print_summary(&result, &all_stats);
        }
        Ok(result)
    }
}

fn calculate_result(
    worker_plans: &[WorkerPlan],
    all_stats: &[Arc<WorkerStats>],
    elapsed: Duration,
) -> BenchResult {
    let mut result = BenchResult::default();

    let mut latencies: Vec<Duration> = worker_plans
        .iter()
        .flat_map(|w| w.reqs().iter())
        .filter(|r| r.response_time != Duration::ZERO)
        .map(|r| r.response_time)
        .collect();
    latencies.sort_unstable();
    result.p99d9 = percentile(&latencies, 0.999);
    result.p99d99 = percentile(&latencies, 0.9999);
    result.p99d999 = percentile(&latencies, 0.99999);

    let mut started = 0u64;
    for stats in all_stats {
        result.max = result.max.max(stats.max());
        started += stats.reqs_started.load(Relaxed);
        result.recvd += stats.resp_recvd.load(Relaxed);
        result.errors += stats.errors_total();
    }
    result.started_rate = started as f64 / elapsed.as_secs_f64();

    result
}

/// Picks the sample at `floor((n − 1) × p)` of the ascending-sorted slice.
fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    sorted[((sorted.len() - 1) as f64 * p) as usize]
}

fn print_status(all_stats: &[Arc<WorkerStats>], elapsed: Duration) {
    let mut alive = 0usize;
    let mut concurrent = 0usize;
    let mut started = 0u64;
    let mut written = 0u64;
    let mut recvd = 0u64;
    let mut errors = 0u64;
    let mut max = Duration::ZERO;

    for stats in all_stats {
        let in_flight = stats.in_flight.load(Relaxed);
        concurrent += in_flight;
        alive += in_flight + stats.pooled.load(Relaxed);
        started += stats.reqs_started.load(Relaxed);
        written += stats.reqs_written.load(Relaxed);
        recvd += stats.resp_recvd.load(Relaxed);
        errors += stats.errors_total();
        max = max.max(stats.max());
    }

    let secs = elapsed.as_secs_f64();
    println!(
        "alive: {:4}, concurrent: {:4}, startedRate: {:9.2} , writtenRate: {:9.2} ,  started: {:6} , recvd:  {:6} , errors: {:6}, maxMs: {:9.2}",
        alive,
        concurrent,
        started as f64 / secs,
        written as f64 / secs,
        started,
        recvd,
        errors,
        max.as_secs_f64() * 1000.0,
    );
}

fn print_summary(result: &BenchResult, all_stats: &[Arc<WorkerStats>]) {
    println!("startedRate rps           {:11.2}", result.started_rate);
    println!("recvd                     {:8}", result.recvd);
    println!("p99d9 ms                  {:11.2}", result.p99d9.as_secs_f64() * 1000.0);
    println!("p99d99 ms                 {:11.2}", result.p99d99.as_secs_f64() * 1000.0);
    println!("p99d999 ms                {:11.2}", result.p99d999.as_secs_f64() * 1000.0);
    println!("max ms                    {:11.2}", result.max.as_secs_f64() * 1000.0);

    let sum = |f: fn(&WorkerStats) -> u64| all_stats.iter().map(|s| f(s)).sum::<u64>();
    println!("errorsResponseReader      {:8}", sum(|s| s.errors_response_reader.load(Relaxed)));
    println!("errorsNoResponse          {:8}", sum(|s| s.errors_no_response.load(Relaxed)));
    println!("errorsTimeout             {:8}", sum(|s| s.errors_timeout.load(Relaxed)));
    println!("errorsSocketCreate        {:8}", sum(|s| s.errors_socket_create.load(Relaxed)));
    println!("errorsSocketConnect       {:8}", sum(|s| s.errors_socket_connect.load(Relaxed)));
    println!("errorsSocketSetSockOpt    {:8}", sum(|s| s.errors_socket_setsockopt.load(Relaxed)));
    println!("errorsSocketWrite         {:8}", sum(|s| s.errors_socket_write.load(Relaxed)));
    println!("errorsUnexpectedHttpCode  {:8}", sum(|s| s.errors_unexpected_http_code.load(Relaxed)));

    for code in 0..HTTP_CODE_BUCKETS {
        let count: u64 = all_stats.iter().map(|s| s.http_codes[code].load(Relaxed)).sum();
        if count > 0 {
            println!("completedWithCode{code:03}      {count:8}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_picks_floor_index() {
        let samples: Vec<Duration> = (1..=1000).map(Duration::from_millis).collect();
        // floor(999 * 0.999) = 998 -> the 999th sample.
        assert_eq!(percentile(&samples, 0.999), Duration::from_millis(999));
        assert_eq!(percentile(&samples, 0.9999), Duration::from_millis(999));
        assert_eq!(percentile(&samples, 1.0), Duration::from_millis(1000));
    }

    #[test]
    fn test_percentile_of_empty_set_is_zero() {
        assert_eq!(percentile(&[], 0.999), Duration::ZERO);
    }

    #[test]
    fn test_percentile_of_single_sample() {
        let one = [Duration::from_millis(7)];
        assert_eq!(percentile(&one, 0.999), Duration::from_millis(7));
        assert_eq!(percentile(&one, 1.0), Duration::from_millis(7));
    }
}
