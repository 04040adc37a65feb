//! Drives a full fixed-rate run against a throwaway local HTTP server.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use tailgun_core::bench::{BenchConfig, Benchmark};
use tailgun_core::payload::RequestPayload;

/// Minimal keep-alive HTTP server: one thread per connection, answers every
/// request with `200 OK` and a two-byte body.
fn serve(listener: TcpListener) {
    for stream in listener.incoming() {
        let Ok(stream) = stream else { continue };
        thread::spawn(move || handle_client(stream));
    }
}

fn handle_client(mut stream: TcpStream) {
    let mut stash: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        while !contains_header_end(&stash) {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => stash.extend_from_slice(&buf[..n]),
            }
        }
        let end = stash.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        stash.drain(..end);

        let resp = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: keep-alive\r\n\r\nok";
        if stream.write_all(resp).is_err() {
            return;
        }
    }
}

fn contains_header_end(stash: &[u8]) -> bool {
    stash.windows(4).any(|w| w == b"\r\n\r\n")
}

#[test]
fn fixed_rate_run_completes_every_request() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || serve(listener));

    let csv = std::env::temp_dir().join(format!("tailgun-e2e-{}.csv", std::process::id()));

    let cfg = BenchConfig {
        addr,
        rps: 50,
        seconds: 1,
        timeout: Duration::from_millis(2000),
        max_concurrent: 45_000,
        verbose: false,
        latencies_csv: Some(csv.clone()),
    };
    let result = Benchmark::new(RequestPayload::default_get(), cfg)
        .run()
        .unwrap();

    assert_eq!(result.errors, 0, "local run should be clean");
    assert_eq!(result.recvd, 50);
    assert!(result.max > Duration::ZERO);
    assert!(result.p99d9 > Duration::ZERO);

    let contents = std::fs::read_to_string(&csv).unwrap();
    std::fs::remove_file(&csv).ok();
    let mut lines = contents.lines();
    assert_eq!(
        lines.next(),
        Some("whenNs,written,completed,error,httpCode,latencyMs")
    );
    let rows: Vec<&str> = lines.collect();
    assert_eq!(rows.len(), 50);
    for row in rows {
        // whenNs,written,completed,error,httpCode,latencyMs
        let cols: Vec<&str> = row.split(',').collect();
        assert_eq!(cols.len(), 6);
        assert_eq!(cols[1], "1", "request should have been written: {row}");
        assert_eq!(cols[2], "1", "request should have completed: {row}");
        assert_eq!(cols[3], "0", "request should not have errored: {row}");
        assert_eq!(cols[4], "200");
        assert!(!cols[5].is_empty(), "completed request must carry a sample");
    }
}
