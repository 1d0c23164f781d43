//! Controller metrics with Prometheus text export.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Value that can go up and down
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Everything the control loop counts. Shared by `Arc`; all updates are
/// lock-free.
#[derive(Debug)]
pub struct ControllerMetrics {
    pub reports_received: Counter,
    pub reports_stale: Counter,
    pub publications: Counter,
    pub rejected_candidates: Counter,
    pub throttled: Counter,
    pub policy_violations: Counter,
    pub pending_transitions: Gauge,
    pub deliveries_acked: Counter,
    pub deliveries_failed: Counter,
    pub synthetic_down_reports: Counter,
    pub lease_acquisitions: Counter,
    pub lease_losses: Counter,
    pub is_leader: Gauge,
    pub current_version: Gauge,
    start_time: Instant,
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMetrics {
    pub fn new() -> Self {
        Self {
            reports_received: Counter::new(),
            reports_stale: Counter::new(),
            publications: Counter::new(),
            rejected_candidates: Counter::new(),
            throttled: Counter::new(),
            policy_violations: Counter::new(),
            pending_transitions: Gauge::new(),
            deliveries_acked: Counter::new(),
            deliveries_failed: Counter::new(),
            synthetic_down_reports: Counter::new(),
            lease_acquisitions: Counter::new(),
            lease_losses: Counter::new(),
            is_leader: Gauge::new(),
            current_version: Gauge::new(),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();
        let entries: [(&str, &str, &str, u64); 15] = [
            ("uptime_seconds", "gauge", "Controller uptime in seconds", self.uptime_seconds()),
            ("health_reports_total", "counter", "Health reports received", self.reports_received.get()),
            ("health_reports_stale_total", "counter", "Health reports older than the stored one", self.reports_stale.get()),
            ("publications_total", "counter", "Cluster state versions published", self.publications.get()),
            ("rejected_candidates_total", "counter", "Candidates rejected by validation", self.rejected_candidates.get()),
            ("throttled_total", "counter", "Publications delayed by the minimum interval", self.throttled.get()),
            ("policy_violations_total", "counter", "Wanted state requests rejected by policy", self.policy_violations.get()),
            ("pending_transitions", "gauge", "Transitions waiting for stabilization", self.pending_transitions.get()),
            ("deliveries_acked_total", "counter", "Acknowledged state deliveries", self.deliveries_acked.get()),
            ("deliveries_failed_total", "counter", "State deliveries that exhausted their retries", self.deliveries_failed.get()),
            ("synthetic_down_total", "counter", "Nodes marked down after delivery failures", self.synthetic_down_reports.get()),
            ("lease_acquisitions_total", "counter", "Leadership lease acquisitions", self.lease_acquisitions.get()),
            ("lease_losses_total", "counter", "Leadership lease losses", self.lease_losses.get()),
            ("is_leader", "gauge", "1 if this instance holds the leadership lease", self.is_leader.get()),
            ("cluster_state_version", "gauge", "Latest published cluster state version", self.current_version.get()),
        ];
        for (name, kind, help, value) in entries {
            // Writing to a String cannot fail
            let _ = writeln!(output, "# HELP clusterctl_{} {}", name, help);
            let _ = writeln!(output, "# TYPE clusterctl_{} {}", name, kind);
            let _ = writeln!(output, "clusterctl_{} {}", name, value);
        }
        output
    }
}
