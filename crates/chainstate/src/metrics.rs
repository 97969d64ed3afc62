//! Connect/disconnect timing counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct ConnectMetrics {
    connect_us: AtomicU64,
    connect_blocks: AtomicU64,
    inputs_us: AtomicU64,
    script_us: AtomicU64,
    script_checks: AtomicU64,
    undo_us: AtomicU64,
    undo_bytes: AtomicU64,
    disconnect_us: AtomicU64,
    disconnect_blocks: AtomicU64,
    flush_us: AtomicU64,
    flushes: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectMetricsSnapshot {
    pub connect_us: u64,
    pub connect_blocks: u64,
    pub inputs_us: u64,
    pub script_us: u64,
    pub script_checks: u64,
    pub undo_us: u64,
    pub undo_bytes: u64,
    pub disconnect_us: u64,
    pub disconnect_blocks: u64,
    pub flush_us: u64,
    pub flushes: u64,
}

/// Per-block timings gathered during one `connect_block`.
#[derive(Clone, Debug, Default)]
pub struct ConnectMetricsDelta {
    pub inputs_us: u64,
    pub script_us: u64,
    pub script_checks: u64,
    pub undo_us: u64,
    pub undo_bytes: u64,
}

fn micros(elapsed: Duration) -> u64 {
    elapsed.as_micros().try_into().unwrap_or(u64::MAX)
}

impl ConnectMetrics {
    pub fn record_connect(&self, elapsed: Duration, delta: &ConnectMetricsDelta) {
        self.connect_us.fetch_add(micros(elapsed), Ordering::Relaxed);
        self.connect_blocks.fetch_add(1, Ordering::Relaxed);
        self.inputs_us.fetch_add(delta.inputs_us, Ordering::Relaxed);
        self.script_us.fetch_add(delta.script_us, Ordering::Relaxed);
        self.script_checks
            .fetch_add(delta.script_checks, Ordering::Relaxed);
        self.undo_us.fetch_add(delta.undo_us, Ordering::Relaxed);
        self.undo_bytes.fetch_add(delta.undo_bytes, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self, elapsed: Duration) {
        self.disconnect_us
            .fetch_add(micros(elapsed), Ordering::Relaxed);
        self.disconnect_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self, elapsed: Duration) {
        self.flush_us.fetch_add(micros(elapsed), Ordering::Relaxed);
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectMetricsSnapshot {
        ConnectMetricsSnapshot {
            connect_us: self.connect_us.load(Ordering::Relaxed),
            connect_blocks: self.connect_blocks.load(Ordering::Relaxed),
            inputs_us: self.inputs_us.load(Ordering::Relaxed),
            script_us: self.script_us.load(Ordering::Relaxed),
            script_checks: self.script_checks.load(Ordering::Relaxed),
            undo_us: self.undo_us.load(Ordering::Relaxed),
            undo_bytes: self.undo_bytes.load(Ordering::Relaxed),
            disconnect_us: self.disconnect_us.load(Ordering::Relaxed),
            disconnect_blocks: self.disconnect_blocks.load(Ordering::Relaxed),
            flush_us: self.flush_us.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn elapsed_us(elapsed: Duration) -> u64 {
    micros(elapsed)
}
