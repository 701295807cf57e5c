//! Lightweight Prometheus-compatible metrics using atomic counters.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::policy::ResourceClass;

const CLASS_COUNT: usize = ResourceClass::ALL.len();

/// How a relayed stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed,
    Cancelled,
    UpstreamError,
}

impl RelayOutcome {
    pub const ALL: [RelayOutcome; 3] = [Self::Completed, Self::Cancelled, Self::UpstreamError];

    pub fn label(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::UpstreamError => "upstream_error",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Application-wide metrics collected via atomic counters.
pub struct Metrics {
    admissions: [AtomicU64; CLASS_COUNT],
    rejections: [AtomicU64; CLASS_COUNT],
    streams: [AtomicU64; 3],
    upstream_failures: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            admissions: [const { AtomicU64::new(0) }; CLASS_COUNT],
            rejections: [const { AtomicU64::new(0) }; CLASS_COUNT],
            streams: [const { AtomicU64::new(0) }; 3],
            upstream_failures: AtomicU64::new(0),
        }
    }

    /// Record a passed check for `class`.
    pub fn record_admission(&self, class: ResourceClass) {
        self.admissions[class.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a rejected check for `class`.
    pub fn record_rejection(&self, class: ResourceClass) {
        self.rejections[class.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a generator that failed before its first fragment.
    pub fn record_upstream_failure(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream(&self, outcome: RelayOutcome) {
        self.streams[outcome.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn admissions(&self, class: ResourceClass) -> u64 {
        self.admissions[class.index()].load(Ordering::Relaxed)
    }

    pub fn rejections(&self, class: ResourceClass) -> u64 {
        self.rejections[class.index()].load(Ordering::Relaxed)
    }

    pub fn streams(&self, outcome: RelayOutcome) -> u64 {
        self.streams[outcome.index()].load(Ordering::Relaxed)
    }

    pub fn upstream_failures(&self) -> u64 {
        self.upstream_failures.load(Ordering::Relaxed)
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self, uptime_seconds: u64) -> String {
        let mut out = String::with_capacity(1024);

        gauge(
            &mut out,
            "codegate_uptime_seconds",
            "Server uptime in seconds",
            uptime_seconds,
        );

        writeln!(out, "# HELP codegate_admissions_total Quota checks passed.").unwrap();
        writeln!(out, "# TYPE codegate_admissions_total counter").unwrap();
        for class in ResourceClass::ALL {
            let label = class.label();
            let total = self.admissions(class);
            writeln!(out, "codegate_admissions_total{{resource_class=\"{label}\"}} {total}").unwrap();
        }

        writeln!(out, "# HELP codegate_rejections_total Quota checks rejected.").unwrap();
        writeln!(out, "# TYPE codegate_rejections_total counter").unwrap();
        for class in ResourceClass::ALL {
            let label = class.label();
            let total = self.rejections(class);
            writeln!(out, "codegate_rejections_total{{resource_class=\"{label}\"}} {total}").unwrap();
        }

        writeln!(out, "# HELP codegate_streams_total Relayed streams by outcome.").unwrap();
        writeln!(out, "# TYPE codegate_streams_total counter").unwrap();
        for outcome in RelayOutcome::ALL {
            let label = outcome.label();
            let total = self.streams(outcome);
            writeln!(out, "codegate_streams_total{{outcome=\"{label}\"}} {total}").unwrap();
        }

        writeln!(
            out,
            "# HELP codegate_upstream_failures_total Generators that failed before streaming."
        )
        .unwrap();
        writeln!(out, "# TYPE codegate_upstream_failures_total counter").unwrap();
        writeln!(out, "codegate_upstream_failures_total {}", self.upstream_failures()).unwrap();

        out
    }
}

fn gauge(out: &mut String, name: &str, help: &str, value: impl std::fmt::Display) {
    writeln!(out, "# HELP {name} {help}").unwrap();
    writeln!(out, "# TYPE {name} gauge").unwrap();
    writeln!(out, "{name} {value}").unwrap();
}
