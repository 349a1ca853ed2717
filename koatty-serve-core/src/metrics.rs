//! Performance metrics: per-server snapshots, counters, ring-buffer history,
//! and the Prometheus exporter backing the admin `/metrics` route.

use crate::pool::PoolMetricsSnapshot;
use prometheus::{Encoder, GaugeVec, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

/// Connection-level metrics of one server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: usize,
    pub total: u64,
    pub per_second: f64,
    pub average_latency_ms: f64,
    /// `errors / max(requests, 1)` clamped to [0, 1].
    pub error_rate: f64,
}

/// Request-level metrics of one server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMetrics {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub average_response_time_ms: f64,
}

/// One sampled metrics snapshot, keyed by server id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub server_id: String,
    pub protocol: String,
    pub uptime_ms: u64,
    pub memory_usage_bytes: u64,
    pub cpu_usage_seconds: f64,
    pub connections: ConnectionMetrics,
    pub requests: RequestMetrics,
    #[serde(default)]
    pub custom: serde_json::Map<String, serde_json::Value>,
}

/// Lock-free request accounting shared with the serving tasks.
#[derive(Debug, Default)]
pub struct RequestCounters {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    response_time_total_ms: AtomicU64,
}

impl RequestCounters {
    pub fn record(&self, success: bool, elapsed_ms: u64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.response_time_total_ms
            .fetch_add(elapsed_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RequestMetrics {
        let total = self.total.load(Ordering::Relaxed);
        let time_total = self.response_time_total_ms.load(Ordering::Relaxed);
        RequestMetrics {
            total,
            successful: self.successful.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            average_response_time_ms: if total == 0 {
                0.0
            } else {
                time_total as f64 / total as f64
            },
        }
    }

    pub fn error_rate(&self) -> f64 {
        let total = self.total.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        (failed as f64 / (total.max(1)) as f64).clamp(0.0, 1.0)
    }
}

/// Builds the connection section from a pool snapshot plus the previous
/// sample (for the per-second rate).
pub fn connection_metrics(
    pool: &PoolMetricsSnapshot,
    previous: Option<&PerformanceMetrics>,
    average_latency_ms: f64,
    error_rate: f64,
) -> ConnectionMetrics {
    let per_second = match previous {
        Some(prev) if pool.uptime_ms > prev.uptime_ms => {
            let delta = pool.total_connections.saturating_sub(prev.connections.total);
            let seconds = (pool.uptime_ms - prev.uptime_ms) as f64 / 1_000.0;
            if seconds > 0.0 {
                delta as f64 / seconds
            } else {
                0.0
            }
        }
        _ => 0.0,
    };
    ConnectionMetrics {
        active: pool.active_connections,
        total: pool.total_connections,
        per_second,
        average_latency_ms,
        error_rate,
    }
}

/// Resident set size of this process, in bytes. Zero when unavailable.
#[cfg(target_os = "linux")]
pub fn memory_rss_bytes() -> u64 {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0;
    };
    statm
        .split_whitespace()
        .nth(1)
        .and_then(|pages| pages.parse::<u64>().ok())
        .map(|pages| pages * 4096)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
pub fn memory_rss_bytes() -> u64 {
    0
}

/// Cumulative CPU seconds consumed by this process. Zero when unavailable.
#[cfg(target_os = "linux")]
pub fn cpu_seconds() -> f64 {
    let Ok(stat) = std::fs::read_to_string("/proc/self/stat") else {
        return 0.0;
    };
    // utime and stime are fields 14 and 15; the command field may contain
    // spaces, so parse after the closing parenthesis.
    let Some(rest) = stat.rsplit(')').next() else {
        return 0.0;
    };
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11).and_then(|f| f.parse().ok()).unwrap_or(0);
    let stime: u64 = fields.get(12).and_then(|f| f.parse().ok()).unwrap_or(0);
    (utime + stime) as f64 / 100.0
}

#[cfg(not(target_os = "linux"))]
pub fn cpu_seconds() -> f64 {
    0.0
}

/// Ring buffer of the most recent metrics samples.
pub struct MetricsHistory {
    samples: StdMutex<VecDeque<PerformanceMetrics>>,
    capacity: usize,
}

impl MetricsHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: StdMutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, sample: PerformanceMetrics) {
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    pub fn latest(&self) -> Option<PerformanceMetrics> {
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .back()
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<PerformanceMetrics> {
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Prometheus gauges for the `/metrics` text exposition.
pub struct PrometheusExporter {
    registry: Registry,
    uptime_seconds: GaugeVec,
    connections_active: IntGaugeVec,
    memory_usage_bytes: IntGaugeVec,
    requests_total: IntGaugeVec,
}

impl PrometheusExporter {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let labels = ["server", "protocol"];
        let uptime_seconds = GaugeVec::new(
            Opts::new("koatty_uptime_seconds", "Server uptime in seconds"),
            &labels,
        )?;
        let connections_active = IntGaugeVec::new(
            Opts::new("koatty_connections_active", "Active pooled connections"),
            &labels,
        )?;
        let memory_usage_bytes = IntGaugeVec::new(
            Opts::new("koatty_memory_usage_bytes", "Process resident set size"),
            &labels,
        )?;
        let requests_total = IntGaugeVec::new(
            Opts::new("koatty_requests_total", "Total requests handled"),
            &labels,
        )?;

        registry.register(Box::new(uptime_seconds.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(memory_usage_bytes.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;

        Ok(Self {
            registry,
            uptime_seconds,
            connections_active,
            memory_usage_bytes,
            requests_total,
        })
    }

    /// Folds one server snapshot into the gauges.
    pub fn record(&self, metrics: &PerformanceMetrics) {
        let labels = [metrics.server_id.as_str(), metrics.protocol.as_str()];
        self.uptime_seconds
            .with_label_values(&labels)
            .set(metrics.uptime_ms as f64 / 1_000.0);
        self.connections_active
            .with_label_values(&labels)
            .set(metrics.connections.active as i64);
        self.memory_usage_bytes
            .with_label_values(&labels)
            .set(metrics.memory_usage_bytes as i64);
        self.requests_total
            .with_label_values(&labels)
            .set(metrics.requests.total as i64);
    }

    /// Prometheus text exposition format 0.0.4, UTF-8.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(server_id: &str, uptime_ms: u64, total: u64) -> PerformanceMetrics {
        PerformanceMetrics {
            server_id: server_id.to_string(),
            protocol: "https".to_string(),
            uptime_ms,
            memory_usage_bytes: 1024,
            cpu_usage_seconds: 0.5,
            connections: ConnectionMetrics {
                active: 3,
                total,
                per_second: 0.0,
                average_latency_ms: 1.5,
                error_rate: 0.0,
            },
            requests: RequestMetrics {
                total: 10,
                successful: 9,
                failed: 1,
                average_response_time_ms: 2.0,
            },
            custom: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_request_counters() {
        let counters = RequestCounters::default();
        counters.record(true, 10);
        counters.record(true, 20);
        counters.record(false, 30);
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.successful, 2);
        assert_eq!(snapshot.failed, 1);
        assert!((snapshot.average_response_time_ms - 20.0).abs() < f64::EPSILON);
        assert!((counters.error_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_error_rate_empty_counters() {
        let counters = RequestCounters::default();
        assert_eq!(counters.error_rate(), 0.0);
    }

    #[test]
    fn test_history_ring_buffer() {
        let history = MetricsHistory::new(3);
        for i in 0..5 {
            history.push(sample("s", i * 1000, i));
        }
        assert_eq!(history.len(), 3);
        let snapshot = history.snapshot();
        assert_eq!(snapshot[0].connections.total, 2);
        assert_eq!(snapshot[2].connections.total, 4);
        assert_eq!(history.latest().unwrap().connections.total, 4);
    }

    #[test]
    fn test_metrics_json_round_trip() {
        let original = sample("srv_1", 9000, 42);
        let serialized = serde_json::to_string(&original).unwrap();
        let parsed: PerformanceMetrics = serde_json::from_str(&serialized).unwrap();
        assert_eq!(parsed.server_id, original.server_id);
        assert_eq!(parsed.uptime_ms, original.uptime_ms);
        assert_eq!(parsed.connections.total, original.connections.total);
        assert_eq!(parsed.requests.failed, original.requests.failed);
    }

    #[test]
    fn test_prometheus_exposition() {
        let exporter = PrometheusExporter::new().unwrap();
        exporter.record(&sample("srv_1", 9000, 42));
        let body = exporter.encode().unwrap();
        assert!(body.contains("koatty_uptime_seconds"));
        assert!(body.contains(r#"koatty_connections_active{protocol="https",server="srv_1"} 3"#));
        assert!(body.contains("koatty_memory_usage_bytes"));
        assert!(body.contains("koatty_requests_total"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_memory_reading() {
        assert!(memory_rss_bytes() > 0);
    }
}
