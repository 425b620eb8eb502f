//! Process-wide counters, log ring, and response-time window backing the
//! admin endpoint.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

const LOG_RING_CAPACITY: usize = 100;
const RESPONSE_TIME_RING_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

pub struct Telemetry {
    total_connections: AtomicU64,
    active_connections: AtomicI64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    logs: Mutex<VecDeque<LogEntry>>,
    response_times_ms: Mutex<VecDeque<u64>>,
}

#[derive(Debug, Serialize)]
pub struct ResponseTimeSummary {
    pub min_ms: u64,
    pub avg_ms: u64,
    pub max_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct Snapshot {
    pub total_connections: u64,
    pub active_connections: i64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub response_time: ResponseTimeSummary,
    pub recent_logs: Vec<LogEntry>,
}

impl Telemetry {
    fn new() -> Self {
        Telemetry {
            total_connections: AtomicU64::new(0),
            active_connections: AtomicI64::new(0),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            logs: Mutex::new(VecDeque::with_capacity(LOG_RING_CAPACITY)),
            response_times_ms: Mutex::new(VecDeque::with_capacity(RESPONSE_TIME_RING_CAPACITY)),
        }
    }

    /// Admission passed: one accepted connection enters service.
    pub fn on_accept(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// A handler has finished, one way or another.
    pub fn on_close(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, up: u64, down: u64) {
        self.bytes_up.fetch_add(up, Ordering::Relaxed);
        self.bytes_down.fetch_add(down, Ordering::Relaxed);
    }

    pub fn record_response_time_ms(&self, millis: u64) {
        if let Ok(mut ring) = self.response_times_ms.lock() {
            if ring.len() >= RESPONSE_TIME_RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(millis);
        }
    }

    pub fn log(&self, message: impl Into<String>) {
        if let Ok(mut ring) = self.logs.lock() {
            if ring.len() >= LOG_RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(LogEntry { timestamp: Utc::now(), message: message.into() });
        }
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Snapshot {
        let response_time = self
            .response_times_ms
            .lock()
            .map(|ring| summarize(&ring))
            .unwrap_or(ResponseTimeSummary { min_ms: 0, avg_ms: 0, max_ms: 0 });

        let recent_logs = self
            .logs
            .lock()
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default();

        Snapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            response_time,
            recent_logs,
        }
    }
}

fn summarize(ring: &VecDeque<u64>) -> ResponseTimeSummary {
    if ring.is_empty() {
        return ResponseTimeSummary { min_ms: 0, avg_ms: 0, max_ms: 0 };
    }
    let min = *ring.iter().min().unwrap();
    let max = *ring.iter().max().unwrap();
    let sum: u64 = ring.iter().sum();
    let avg = sum / ring.len() as u64;
    ResponseTimeSummary { min_ms: min, avg_ms: avg, max_ms: max }
}

lazy_static::lazy_static! {
    pub static ref TELEMETRY: Telemetry = Telemetry::new();
}

pub fn get() -> &'static Telemetry {
    &TELEMETRY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_and_close_balance_active_connections() {
        let t = Telemetry::new();
        t.on_accept();
        t.on_accept();
        assert_eq!(t.active_connections(), 2);
        t.on_close();
        assert_eq!(t.active_connections(), 1);
        t.on_close();
        assert_eq!(t.active_connections(), 0);
    }

    #[test]
    fn snapshot_reflects_real_counters() {
        let t = Telemetry::new();
        t.on_accept();
        t.add_bytes(100, 200);
        t.record_response_time_ms(10);
        t.record_response_time_ms(30);
        let snap = t.snapshot();
        assert_eq!(snap.total_connections, 1);
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.bytes_up, 100);
        assert_eq!(snap.bytes_down, 200);
        assert_eq!(snap.response_time.min_ms, 10);
        assert_eq!(snap.response_time.max_ms, 30);
        assert_eq!(snap.response_time.avg_ms, 20);
    }

    #[test]
    fn snapshot_includes_recent_logs() {
        let t = Telemetry::new();
        t.log("blocked example.test (ads)");
        t.log("rate limited 10.0.0.1");
        let snap = t.snapshot();
        assert_eq!(snap.recent_logs.len(), 2);
        assert_eq!(snap.recent_logs[0].message, "blocked example.test (ads)");
        assert_eq!(snap.recent_logs[1].message, "rate limited 10.0.0.1");
    }

    #[test]
    fn log_ring_is_bounded() {
        let t = Telemetry::new();
        for i in 0..(LOG_RING_CAPACITY + 10) {
            t.log(format!("entry {i}"));
        }
        let logs = t.logs.lock().unwrap();
        assert_eq!(logs.len(), LOG_RING_CAPACITY);
    }
}
