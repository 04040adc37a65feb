use std::fs;
use std::io::Write as _;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use clap::Parser;
use tailgun_core::bench::{BenchConfig, Benchmark};
use tailgun_core::payload::RequestPayload;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Open-loop HTTP/1.1 load generator focused on tail latency.
///
/// With --rps set, runs once at that fixed rate. With --rps 0 (the default)
/// it hill-climbs: repeated fixed-rate runs, raising the rate while the
/// percentile SLOs hold and backing off when they break.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Target host, optionally with port. Example: 127.0.0.1:8080
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Path to a file containing a full HTTP request in raw form, used as
    /// the request payload for the benchmark.
    #[arg(long)]
    requestfile: Option<PathBuf>,

    /// Run at a single constant rate of requests per second instead of
    /// varying the rps.
    #[arg(long, default_value_t = 0)]
    rps: usize,

    /// Duration of each run in seconds.
    #[arg(long, default_value_t = 60)]
    seconds: u64,

    /// Max time in milliseconds to wait for each request to finish before
    /// marking it as an error, recording the timeout as the time it took.
    #[arg(long, default_value_t = 8000)]
    timeoutms: u64,

    /// Max number of concurrent requests to allow.
    #[arg(long, default_value_t = 45_000)]
    maxconcurrent: usize,

    /// Vary rps until the 99.99th percentile reaches this number of
    /// milliseconds.
    #[arg(long, default_value_t = 100)]
    maxp99d99ms: u64,

    /// Vary rps until the 99.999th percentile reaches this number of
    /// milliseconds.
    #[arg(long, default_value_t = 200)]
    maxp99d999ms: u64,

    /// Vary rps until the 100th percentile reaches this number of
    /// milliseconds.
    #[arg(long, default_value_t = 500)]
    maxp100ms: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let addr = resolve_target(&args.host)?;
    let payload = match &args.requestfile {
        Some(path) => {
            let raw = fs::read(path)
                .with_context(|| format!("read request file {}", path.display()))?;
            RequestPayload::parse(&raw).context("parse request file")?
        }
        None => RequestPayload::default_get(),
    };

    if args.rps != 0 {
        println!("Running with {} requests/sec", args.rps);
        Benchmark::new(payload, bench_config(&args, addr, args.rps, true)).run()?;
        return Ok(());
    }

    hill_climb(&args, addr, payload)
}

/// Splits an optional `:port` suffix off the host (default port 80) and
/// resolves it to an IPv4 address.
fn resolve_target(host: &str) -> anyhow::Result<SocketAddr> {
    if host.matches(':').count() > 1 {
        anyhow::bail!("invalid host and port: {host}");
    }
    let (name, port) = match host.split_once(':') {
        Some((name, port)) => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid port: {host}"))?;
            (name, port)
        }
        None => (host, 80),
    };

    (name, port)
        .to_socket_addrs()
        .with_context(|| format!("failed to look up address for {name}"))?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| anyhow!("no IPv4 address for {name}"))
}

fn bench_config(args: &Args, addr: SocketAddr, rps: usize, verbose: bool) -> BenchConfig {
    BenchConfig {
        addr,
        rps,
        seconds: args.seconds,
        timeout: Duration::from_millis(args.timeoutms),
        max_concurrent: args.maxconcurrent,
        verbose,
        latencies_csv: Some(PathBuf::from("latencies.csv")),
    }
}

/// Repeats fixed-rate runs forever, raising the rate while the SLOs hold
/// and backing off (with a shrinking step) when they break.
fn hill_climb(args: &Args, addr: SocketAddr, payload: RequestPayload) -> anyhow::Result<()> {
    println!("Starting...");
    fs::write("hillclimb.csv", "rps,errors,p99d99\n").context("write hillclimb.csv")?;

    let maxp99d99 = Duration::from_millis(args.maxp99d99ms);
    let maxp99d999 = Duration::from_millis(args.maxp99d999ms);
    let maxp100 = Duration::from_millis(args.maxp100ms);

    let mut rps: usize = 1000;
    let mut step = 0.5f64;
    loop {
        let cfg = bench_config(args, addr, rps, false);
        let result = Benchmark::new(payload.clone(), cfg).run()?;

        let p99d99ms = result.p99d99.as_secs_f64() * 1000.0;
        let p99d999ms = result.p99d999.as_secs_f64() * 1000.0;
        let p100ms = result.max.as_secs_f64() * 1000.0;
        println!(
            "rps: {rps:6}, errors: {:6}, p99d99ms: {p99d99ms:9.2}, p99d999ms: {p99d999ms:9.2}, p100ms: {p100ms:9.2}",
            result.errors
        );

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open("hillclimb.csv")
            .context("open hillclimb.csv")?;
        writeln!(file, "{rps},{},{p99d99ms:.6}", result.errors)?;

        let within_slo = result.errors == 0
            && result.p99d99 <= maxp99d99
            && result.p99d999 <= maxp99d999
            && result.max <= maxp100;
        if within_slo {
            rps = (rps as f64 + rps as f64 * step) as usize;
        } else {
            rps = (rps as f64 - rps as f64 * step) as usize;
            step *= 0.9;
        }

        if result.errors > 0 {
            // Give the target a breather before probing again.
            std::thread::sleep(Duration::from_secs(10));
        }
    }
}
