use crate::IoType;
use metrics::{counter, histogram};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
struct Stat {
    count: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
    total_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl Stat {
    fn observe(&self, bytes: usize, dur: Duration, ok: bool) {
        let ns = dur.as_nanos().min(u64::MAX as u128) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        if !ok {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StatSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let bytes = self.bytes.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let total_ns = self.total_ns.load(Ordering::Relaxed);
        let max_ns = self.max_ns.load(Ordering::Relaxed);
        let avg_ns = if count == 0 {
            0.0
        } else {
            total_ns as f64 / count as f64
        };
        StatSnapshot {
            count,
            bytes,
            errors,
            avg_ns,
            max_ns,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct StatSnapshot {
    pub count: u64,
    pub bytes: u64,
    pub errors: u64,
    pub avg_ns: f64,
    pub max_ns: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct DeviceStatsSnapshot {
    pub read: StatSnapshot,
    pub write: StatSnapshot,
    pub other: StatSnapshot,
}

/// Per-device I/O counters maintained by the registry channel wrapper.
#[derive(Default)]
pub struct DeviceStats {
    read: Stat,
    write: Stat,
    other: Stat,
}

impl DeviceStats {
    pub fn observe(&self, io_type: IoType, bytes: usize, dur: Duration, ok: bool) {
        let ns = dur.as_nanos().min(u64::MAX as u128) as u64;
        match io_type {
            IoType::Read => {
                counter!("vblk_read_count").increment(1);
                counter!("vblk_read_bytes").increment(bytes as u64);
                histogram!("vblk_read_latency_ns").record(ns as f64);
                self.read.observe(bytes, dur, ok);
            }
            IoType::Write | IoType::WriteZeroes => {
                counter!("vblk_write_count").increment(1);
                counter!("vblk_write_bytes").increment(bytes as u64);
                histogram!("vblk_write_latency_ns").record(ns as f64);
                self.write.observe(bytes, dur, ok);
            }
            _ => {
                counter!("vblk_admin_count").increment(1);
                self.other.observe(bytes, dur, ok);
            }
        }
        if !ok {
            counter!("vblk_io_errors").increment(1);
        }
    }

    pub fn snapshot(&self) -> DeviceStatsSnapshot {
        DeviceStatsSnapshot {
            read: self.read.snapshot(),
            write: self.write.snapshot(),
            other: self.other.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_tracks_observations() {
        let stats = DeviceStats::default();
        stats.observe(IoType::Read, 4096, Duration::from_micros(10), true);
        stats.observe(IoType::Read, 4096, Duration::from_micros(30), true);
        stats.observe(IoType::Write, 512, Duration::from_micros(5), false);
        let snap = stats.snapshot();
        assert_eq!(snap.read.count, 2);
        assert_eq!(snap.read.bytes, 8192);
        assert_eq!(snap.write.errors, 1);
        assert!(snap.read.avg_ns > 0.0);
        assert!(snap.read.max_ns >= snap.read.avg_ns as u64);
    }
}
