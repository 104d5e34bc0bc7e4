//! Per-operation counters, timings and data volumes, with optional
//! latency/bandwidth emulation.
//!
//! Every public store operation is forwarded through a measurement shim
//! here. If `BORGSTORE_LATENCY` (microseconds per call) is set, each
//! operation is slowed down to at least that duration; if
//! `BORGSTORE_BANDWIDTH` (bits per second) is set, data-bearing operations
//! are additionally slowed down according to the bytes moved. Emulated
//! waits count into the timing stats.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::Result;

/// The measured store operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Info,
    Load,
    Store,
    Delete,
    Move,
    List,
}

const OP_COUNT: usize = 6;

impl Op {
    fn name(self) -> &'static str {
        match self {
            Op::Info => "info",
            Op::Load => "load",
            Op::Store => "store",
            Op::Delete => "delete",
            Op::Move => "move",
            Op::List => "list",
        }
    }
}

#[derive(Default)]
struct OpCounters {
    calls: AtomicU64,
    time_ns: AtomicU64,
    volume: AtomicU64,
}

/// Counters for one operation kind, as captured by [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OpStats {
    /// Number of completed calls.
    pub calls: u64,
    /// Cumulative wall time in seconds, emulated waits included.
    pub time: f64,
    /// Cumulative bytes moved (only meaningful for load/store).
    pub volume: u64,
    /// volume/time in bytes per second; 0.0 when nothing was moved.
    pub throughput: f64,
}

/// A snapshot of the store's statistics.
///
/// The values only consider what is seen on the store API: time spent by
/// the caller outside of the store is not included, and write buffering or
/// cached reads of the OS/backend may give a wrong impression.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    /// `info` calls.
    pub info: OpStats,
    /// `load`/`load_range` calls.
    pub load: OpStats,
    /// `store` calls.
    pub store: OpStats,
    /// `delete` calls.
    pub delete: OpStats,
    /// Move-family calls (`rename`, `soft_delete`, `undelete`,
    /// `change_level`).
    pub moves: OpStats,
    /// `list` calls.
    pub list: OpStats,
    /// Completed `open()` calls.
    pub open_cycles: u64,
}

/// Shared recorder owned by a store; interiorly mutable so measurement
/// works from `&self` operations and streaming iterators.
pub(crate) struct StatsRecorder {
    ops: [OpCounters; OP_COUNT],
    open_cycles: AtomicU64,
    /// Emulated seconds per call.
    latency: f64,
    /// Emulated bytes per second; 0.0 means unlimited.
    bandwidth: f64,
}

fn env_f64(var: &str) -> f64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(0.0)
}

impl StatsRecorder {
    /// Builds a recorder, reading the emulation knobs from the
    /// environment.
    pub(crate) fn from_env() -> Self {
        Self {
            ops: Default::default(),
            open_cycles: AtomicU64::new(0),
            latency: env_f64("BORGSTORE_LATENCY") / 1e6, // [us] -> [s]
            bandwidth: env_f64("BORGSTORE_BANDWIDTH") / 8.0, // [bit/s] -> [byte/s]
        }
    }

    /// Runs `f`, then records timing/volume for `op` and applies the
    /// configured latency/bandwidth emulation.
    ///
    /// `f` returns the operation result plus the number of bytes moved.
    pub(crate) fn measure<T>(
        &self,
        op: Op,
        name: &str,
        f: impl FnOnce() -> Result<(T, u64)>,
    ) -> Result<T> {
        let start = Instant::now();
        let (value, volume) = f()?;
        self.throttle(volume, start);
        let elapsed = start.elapsed();
        let counters = &self.ops[op as usize];
        counters.calls.fetch_add(1, Ordering::Relaxed);
        counters
            .time_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        counters.volume.fetch_add(volume, Ordering::Relaxed);
        tracing::debug!(
            op = op.name(),
            name,
            bytes = volume,
            seconds = elapsed.as_secs_f64(),
            "store operation"
        );
        Ok(value)
    }

    /// Counts one call of `op` without timing it (used by the streaming
    /// list, which times its backend fetches individually).
    pub(crate) fn count_call(&self, op: Op) {
        self.ops[op as usize].calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds elapsed time to `op` after applying latency emulation once.
    ///
    /// The latency is emulated per backend fetch, not per yielded element.
    pub(crate) fn add_fetch_time(&self, op: Op, name: &str, start: Instant) {
        self.throttle(0, start);
        let elapsed = start.elapsed();
        self.ops[op as usize]
            .time_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        tracing::debug!(
            op = op.name(),
            name,
            seconds = elapsed.as_secs_f64(),
            "store operation (partial)"
        );
    }

    pub(crate) fn count_open(&self) {
        self.open_cycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Sleeps until the operation has cost at least what the emulated
    /// latency/bandwidth dictate. No-op when emulation is off.
    fn throttle(&self, volume: u64, start: Instant) {
        let mut emulated = self.latency;
        if self.bandwidth > 0.0 {
            emulated += volume as f64 / self.bandwidth;
        }
        let remaining = emulated - start.elapsed().as_secs_f64();
        if remaining > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(remaining));
        }
    }

    /// Captures a consistent-enough snapshot of all counters.
    pub(crate) fn snapshot(&self) -> Stats {
        let op = |op: Op| {
            let counters = &self.ops[op as usize];
            let calls = counters.calls.load(Ordering::Relaxed);
            let time = counters.time_ns.load(Ordering::Relaxed) as f64 / 1e9;
            let volume = counters.volume.load(Ordering::Relaxed);
            let throughput = if time > 0.0 { volume as f64 / time } else { 0.0 };
            OpStats {
                calls,
                time,
                volume,
                throughput,
            }
        };
        Stats {
            info: op(Op::Info),
            load: op(Op::Load),
            store: op(Op::Store),
            delete: op(Op::Delete),
            moves: op(Op::Move),
            list: op(Op::List),
            open_cycles: self.open_cycles.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> StatsRecorder {
        StatsRecorder {
            ops: Default::default(),
            open_cycles: AtomicU64::new(0),
            latency: 0.0,
            bandwidth: 0.0,
        }
    }

    #[test]
    fn measure_accumulates_calls_and_volume() {
        let rec = recorder();
        rec.measure(Op::Store, "k", || Ok(((), 10))).unwrap();
        rec.measure(Op::Store, "k", || Ok(((), 32))).unwrap();
        let stats = rec.snapshot();
        assert_eq!(stats.store.calls, 2);
        assert_eq!(stats.store.volume, 42);
        assert!(stats.store.time >= 0.0);
    }

    #[test]
    fn failures_are_not_counted() {
        let rec = recorder();
        let result: Result<()> = rec.measure(Op::Load, "k", || {
            Err(crate::Error::ObjectNotFound("k".into()))
        });
        assert!(result.is_err());
        assert_eq!(rec.snapshot().load.calls, 0);
    }

    #[test]
    fn throughput_derivation() {
        let rec = recorder();
        rec.ops[Op::Load as usize].calls.store(1, Ordering::Relaxed);
        rec.ops[Op::Load as usize]
            .time_ns
            .store(2_000_000_000, Ordering::Relaxed);
        rec.ops[Op::Load as usize]
            .volume
            .store(1000, Ordering::Relaxed);
        let stats = rec.snapshot();
        assert!((stats.load.throughput - 500.0).abs() < f64::EPSILON);
        // untouched ops report zeroes instead of dividing by zero
        assert_eq!(stats.info.throughput, 0.0);
    }

    #[test]
    fn latency_emulation_slows_calls_down() {
        let rec = StatsRecorder {
            ops: Default::default(),
            open_cycles: AtomicU64::new(0),
            latency: 0.01,
            bandwidth: 0.0,
        };
        let start = Instant::now();
        rec.measure(Op::Info, "k", || Ok(((), 0))).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
        // the emulated wait counts into the timing stats
        assert!(rec.snapshot().info.time >= 0.01);
    }
}
