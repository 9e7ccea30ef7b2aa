//! Error-rate governor.
//!
//! Occasional line errors are normal on a hardware link and must not flood
//! the log, while a sustained error rate usually indicates a real fault and
//! must stay visible. The governor keeps one record per error kind with an
//! integer-only exponentially weighted average of the inter-arrival
//! interval; reports are throttled to a minimum interval and escalate from
//! warning to error when the rate crosses the kind's threshold.

use std::sync::Mutex;
use std::time::Instant;

/// Minimum time between two reports of the same error kind.
pub const MIN_REPORT_INTERVAL_MS: u64 = 10_000;

/// Time over which the rate estimate decays by half.
const DECAY_HALF_MS: u64 = 2_000;

/// Decay floor applied even for back-to-back events, in percent.
const DECAY_MIN_PCT: u64 = 3;

/// Error kinds tracked by the governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An allocation for a package, message or channel record failed.
    OutOfMemory,
    /// The underlying transport signaled an xfer failure.
    Transport,
}

impl ErrorKind {
    fn index(self) -> usize {
        match self {
            ErrorKind::OutOfMemory => 0,
            ErrorKind::Transport => 1,
        }
    }

    /// Events per second from which this kind is reported as an error
    /// rather than a warning.
    fn threshold_per_sec(self) -> u64 {
        match self {
            ErrorKind::OutOfMemory => 0,
            ErrorKind::Transport => 5,
        }
    }

    /// Log message for the kind.
    pub fn message(self) -> &'static str {
        match self {
            ErrorKind::OutOfMemory => "no memory available",
            ErrorKind::Transport => "xfer failed on transport layer, restarting frame",
        }
    }
}

/// Report severity, decided by the current rate against the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// An emitted (non-throttled) report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub kind: ErrorKind,
    pub severity: Severity,
    /// Current estimated events per second.
    pub rate_per_sec: u64,
    /// Events swallowed by throttling since the previous report.
    pub suppressed: u64,
    /// Total events of this kind since engine start.
    pub total: u64,
}

#[derive(Debug, Default)]
struct Record {
    total: u64,
    unreported: u64,
    last_report_ms: Option<u64>,
    last_event_ms: u64,
    exp_avg_interval_ms: u64,
}

/// Per-engine error history. No global state; the clock origin is the
/// governor's construction time.
#[derive(Debug)]
pub struct ErrorRateGovernor {
    records: Mutex<[Record; 2]>,
    origin: Instant,
}

impl ErrorRateGovernor {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Default::default()),
            origin: Instant::now(),
        }
    }

    /// Record one event; returns a report when it should be logged now.
    pub fn record(&self, kind: ErrorKind) -> Option<Report> {
        let now_ms = self.origin.elapsed().as_millis() as u64;
        self.record_at(kind, now_ms)
    }

    /// Clock-injected variant of [`Self::record`].
    pub fn record_at(&self, kind: ErrorKind, now_ms: u64) -> Option<Report> {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let record = &mut records[kind.index()];

        record.total += 1;
        let since_event = now_ms.abs_diff(record.last_event_ms);
        record.last_event_ms = now_ms;

        let decay_pct = (50 * since_event / DECAY_HALF_MS).clamp(DECAY_MIN_PCT, 100);
        let prev_rate = 1000 / record.exp_avg_interval_ms.max(1);
        record.exp_avg_interval_ms = (((100 - decay_pct) * record.exp_avg_interval_ms
            + decay_pct * since_event)
            / 100)
            .max(1);
        let rate = 1000 / record.exp_avg_interval_ms;

        let threshold = kind.threshold_per_sec();
        let crossed_up = prev_rate < threshold && rate >= threshold;
        let throttled = match record.last_report_ms {
            Some(last) => now_ms.abs_diff(last) < MIN_REPORT_INTERVAL_MS && !crossed_up,
            None => false,
        };
        if throttled {
            record.unreported += 1;
            return None;
        }

        record.last_report_ms = Some(now_ms);
        Some(Report {
            kind,
            severity: if rate >= threshold {
                Severity::Error
            } else {
                Severity::Warning
            },
            rate_per_sec: rate,
            suppressed: std::mem::take(&mut record.unreported),
            total: record.total,
        })
    }

    /// Total events seen for a kind.
    pub fn total(&self, kind: ErrorKind) -> u64 {
        let records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        records[kind.index()].total
    }
}

impl Default for ErrorRateGovernor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_event_reports_immediately() {
        let governor = ErrorRateGovernor::new();
        let report = governor.record_at(ErrorKind::Transport, 0).unwrap();
        assert_eq!(report.total, 1);
        assert_eq!(report.suppressed, 0);
    }

    #[test]
    fn burst_is_throttled_and_summarized() {
        let governor = ErrorRateGovernor::new();
        assert!(governor.record_at(ErrorKind::Transport, 0).is_some());

        // a burst within the report interval stays silent
        for ms in 1..100u64 {
            assert!(governor.record_at(ErrorKind::Transport, ms).is_none());
        }

        // after the interval, one report summarizes the suppressed events
        let report = governor
            .record_at(ErrorKind::Transport, MIN_REPORT_INTERVAL_MS + 50)
            .unwrap();
        assert_eq!(report.suppressed, 99);
        assert_eq!(report.total, 101);
    }

    #[test]
    fn sparse_events_stay_warnings() {
        let governor = ErrorRateGovernor::new();
        let mut now = 0u64;
        let mut last = None;
        for _ in 0..5 {
            if let Some(report) = governor.record_at(ErrorKind::Transport, now) {
                last = Some(report);
            }
            now += 60_000;
        }
        assert_eq!(last.unwrap().severity, Severity::Warning);
    }

    #[test]
    fn threshold_crossing_escalates_and_bypasses_throttle() {
        let governor = ErrorRateGovernor::new();
        // two slow events establish a low rate and a fresh report time
        governor.record_at(ErrorKind::Transport, 0);
        let slow = governor.record_at(ErrorKind::Transport, 60_000).unwrap();
        assert_eq!(slow.severity, Severity::Warning);
        assert_eq!(slow.rate_per_sec, 0);

        // hammer the governor: the upward crossing must be reported even
        // though the minimum report interval has not passed
        let mut escalated = None;
        for ms in 1..2_000u64 {
            if let Some(report) = governor.record_at(ErrorKind::Transport, 60_000 + ms) {
                escalated = Some(report);
                break;
            }
        }
        let report = escalated.expect("crossing the threshold should report");
        assert_eq!(report.severity, Severity::Error);
        assert!(report.rate_per_sec >= 5);
        assert!(report.suppressed > 0);
    }

    #[test]
    fn out_of_memory_always_error_severity() {
        let governor = ErrorRateGovernor::new();
        let report = governor.record_at(ErrorKind::OutOfMemory, 0).unwrap();
        assert_eq!(report.severity, Severity::Error);
    }

    #[test]
    fn totals_accumulate_per_kind() {
        let governor = ErrorRateGovernor::new();
        governor.record_at(ErrorKind::Transport, 0);
        governor.record_at(ErrorKind::Transport, 1);
        governor.record_at(ErrorKind::OutOfMemory, 2);
        assert_eq!(governor.total(ErrorKind::Transport), 2);
        assert_eq!(governor.total(ErrorKind::OutOfMemory), 1);
    }
}
