//! Production instrumentation for the ordering core.
//!
//! Counters are process-wide atomics shared by every chain instance:
//!
//! - **Traffic**: messages received and sent, decode failures
//! - **Faults**: protocol violations, equivocations
//! - **Progress**: commits, view changes, catch-up fetches
//! - **Storage**: persist failures
//!
//! ## Usage
//!
//! ```ignore
//! use lbft_consensus::instrumentation::METRICS;
//!
//! METRICS.increment_commits();
//! let snapshot = METRICS.snapshot();
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use crate::message::MessageType;

// ============================================================================
// Production Metrics (Always Available)
// ============================================================================

/// Global metrics instance for the ordering core.
pub static METRICS: Metrics = Metrics::new();

/// Counters for the ordering core.
///
/// All counters use relaxed atomics; values are monotonic and only
/// meaningful as deltas or rates.
#[derive(Debug)]
pub struct Metrics {
    // === Traffic ===
    messages_received_total: AtomicU64,
    messages_sent_request: AtomicU64,
    messages_sent_pre_prepare: AtomicU64,
    messages_sent_prepare: AtomicU64,
    messages_sent_commit: AtomicU64,
    messages_sent_committed: AtomicU64,
    messages_sent_fetch_committed: AtomicU64,
    messages_sent_view_change: AtomicU64,
    decode_failures_total: AtomicU64,

    // === Faults ===
    protocol_violations_total: AtomicU64,
    equivocations_total: AtomicU64,
    replays_served_total: AtomicU64,

    // === Progress ===
    commits_total: AtomicU64,
    view_changes_started_total: AtomicU64,
    view_changes_completed_total: AtomicU64,
    fetches_issued_total: AtomicU64,
    fetches_served_total: AtomicU64,

    // === Storage ===
    persist_failures_total: AtomicU64,
}

impl Metrics {
    /// Creates a new metrics instance.
    ///
    /// This is a const function for static initialization.
    pub const fn new() -> Self {
        Self {
            messages_received_total: AtomicU64::new(0),
            messages_sent_request: AtomicU64::new(0),
            messages_sent_pre_prepare: AtomicU64::new(0),
            messages_sent_prepare: AtomicU64::new(0),
            messages_sent_commit: AtomicU64::new(0),
            messages_sent_committed: AtomicU64::new(0),
            messages_sent_fetch_committed: AtomicU64::new(0),
            messages_sent_view_change: AtomicU64::new(0),
            decode_failures_total: AtomicU64::new(0),
            protocol_violations_total: AtomicU64::new(0),
            equivocations_total: AtomicU64::new(0),
            replays_served_total: AtomicU64::new(0),
            commits_total: AtomicU64::new(0),
            view_changes_started_total: AtomicU64::new(0),
            view_changes_completed_total: AtomicU64::new(0),
            fetches_issued_total: AtomicU64::new(0),
            fetches_served_total: AtomicU64::new(0),
            persist_failures_total: AtomicU64::new(0),
        }
    }

    // ========================================================================
    // Traffic
    // ========================================================================

    /// Increments messages received.
    pub fn increment_messages_received(&self) {
        self.messages_received_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments message sent counter (by type).
    pub fn increment_messages_sent(&self, kind: MessageType) {
        let counter = match kind {
            MessageType::Request => &self.messages_sent_request,
            MessageType::PrePrepare => &self.messages_sent_pre_prepare,
            MessageType::Prepare => &self.messages_sent_prepare,
            MessageType::Commit => &self.messages_sent_commit,
            MessageType::Committed => &self.messages_sent_committed,
            MessageType::FetchCommitted => &self.messages_sent_fetch_committed,
            MessageType::ViewChange => &self.messages_sent_view_change,
            MessageType::Undefined => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments undecodable inbound messages.
    pub fn increment_decode_failures(&self) {
        self.decode_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Faults
    // ========================================================================

    /// Increments messages dropped for breaking protocol rules.
    ///
    /// Covers spoofed senders, understated quorums, inadmissible batches and
    /// proposals from a replica that is not the recognized primary.
    pub fn increment_protocol_violations(&self) {
        self.protocol_violations_total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Increments conflicting votes from one replica for one sequence slot.
    pub fn increment_equivocations(&self) {
        self.equivocations_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments Committed replies sent in answer to stale traffic.
    pub fn increment_replays_served(&self) {
        self.replays_served_total.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Progress
    // ========================================================================

    /// Increments durably committed sequence entries.
    pub fn increment_commits(&self) {
        self.commits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_view_changes_started(&self) {
        self.view_changes_started_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_view_changes_completed(&self) {
        self.view_changes_completed_total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Adds FetchCommitted requests issued while catching up.
    pub fn add_fetches_issued(&self, count: u64) {
        self.fetches_issued_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_fetches_served(&self) {
        self.fetches_served_total.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Storage
    // ========================================================================

    pub fn increment_persist_failures(&self) {
        self.persist_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Metric Export
    // ========================================================================

    /// Exports the counters in Prometheus exposition format.
    pub fn export_prometheus(&self) -> String {
        use std::fmt::Write;

        let snapshot = self.snapshot();
        let counters = [
            ("lbft_messages_received_total", "Messages received", snapshot.messages_received_total),
            ("lbft_messages_sent_total", "Messages sent", snapshot.messages_sent_total),
            ("lbft_decode_failures_total", "Undecodable messages", snapshot.decode_failures_total),
            ("lbft_protocol_violations_total", "Messages rejected for protocol violations", snapshot.protocol_violations_total),
            ("lbft_equivocations_total", "Conflicting votes observed", snapshot.equivocations_total),
            ("lbft_commits_total", "Durably committed entries", snapshot.commits_total),
            ("lbft_view_changes_started_total", "View changes started", snapshot.view_changes_started_total),
            ("lbft_view_changes_completed_total", "View changes completed", snapshot.view_changes_completed_total),
            ("lbft_fetches_issued_total", "FetchCommitted requests issued", snapshot.fetches_issued_total),
            ("lbft_fetches_served_total", "FetchCommitted requests served", snapshot.fetches_served_total),
            ("lbft_persist_failures_total", "Commit log append failures", snapshot.persist_failures_total),
        ];

        let mut output = String::new();
        for (name, help, value) in counters {
            let _ = write!(
                output,
                "# HELP {name} {help}\n\
                 # TYPE {name} counter\n\
                 {name} {value}\n",
            );
        }
        output
    }

    /// Returns snapshot of all metrics for testing/debugging.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let sent = [
            &self.messages_sent_request,
            &self.messages_sent_pre_prepare,
            &self.messages_sent_prepare,
            &self.messages_sent_commit,
            &self.messages_sent_committed,
            &self.messages_sent_fetch_committed,
            &self.messages_sent_view_change,
        ]
        .iter()
        .map(|counter| counter.load(Ordering::Relaxed))
        .sum();

        MetricsSnapshot {
            messages_received_total: self.messages_received_total.load(Ordering::Relaxed),
            messages_sent_total: sent,
            decode_failures_total: self.decode_failures_total.load(Ordering::Relaxed),
            protocol_violations_total: self.protocol_violations_total.load(Ordering::Relaxed),
            equivocations_total: self.equivocations_total.load(Ordering::Relaxed),
            replays_served_total: self.replays_served_total.load(Ordering::Relaxed),
            commits_total: self.commits_total.load(Ordering::Relaxed),
            view_changes_started_total: self.view_changes_started_total.load(Ordering::Relaxed),
            view_changes_completed_total: self
                .view_changes_completed_total
                .load(Ordering::Relaxed),
            fetches_issued_total: self.fetches_issued_total.load(Ordering::Relaxed),
            fetches_served_total: self.fetches_served_total.load(Ordering::Relaxed),
            persist_failures_total: self.persist_failures_total.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub messages_received_total: u64,
    pub messages_sent_total: u64,
    pub decode_failures_total: u64,
    pub protocol_violations_total: u64,
    pub equivocations_total: u64,
    pub replays_served_total: u64,
    pub commits_total: u64,
    pub view_changes_started_total: u64,
    pub view_changes_completed_total: u64,
    pub fetches_issued_total: u64,
    pub fetches_served_total: u64,
    pub persist_failures_total: u64,
}
