//! Periodic progress lines for the long phases.
//!
//! A `Progress` is shared by every worker in a phase; workers bump the
//! atomic counters and the producer loop calls [`Progress::tick`] between
//! submissions. At most one line per second is emitted, carrying speed,
//! percent complete, ETA, and data throughput. None of this affects
//! correctness — it exists so multi-hour library scans are observable.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const EMIT_INTERVAL: Duration = Duration::from_secs(1);

pub struct Progress {
    phase: &'static str,
    total: u64,
    done: AtomicU64,
    bytes: AtomicU64,
    started: Instant,
    last_emit: Mutex<Instant>,
}

impl Progress {
    pub fn new(phase: &'static str, total: u64) -> Self {
        Self {
            phase,
            total,
            done: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            started: Instant::now(),
            last_emit: Mutex::new(Instant::now()),
        }
    }

    /// One item finished (successfully or not).
    pub fn item_done(&self) {
        self.done.fetch_add(1, Ordering::Relaxed);
    }

    /// Account raw bytes read from disk, for MB/s reporting.
    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }

    /// Emit a progress line if at least a second has passed since the
    /// last one. Cheap enough to call on every producer iteration.
    pub fn tick(&self) {
        {
            let mut last = self.last_emit.lock().unwrap();
            if last.elapsed() < EMIT_INTERVAL {
                return;
            }
            *last = Instant::now();
        }
        self.emit();
    }

    /// Final summary line for the phase.
    pub fn finish(&self) {
        self.emit();
        log::info!(
            "{}: done, {}/{} in {}",
            self.phase,
            self.done(),
            self.total,
            fmt_duration(self.started.elapsed())
        );
    }

    fn emit(&self) {
        let done = self.done();
        let elapsed = self.started.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 { done as f64 / elapsed } else { 0.0 };
        let percent = if self.total > 0 {
            done * 100 / self.total
        } else {
            100
        };
        let eta = if speed > 0.0 && done < self.total {
            fmt_duration(Duration::from_secs_f64(
                (self.total - done) as f64 / speed,
            ))
        } else {
            "-".to_string()
        };
        let mb = self.bytes.load(Ordering::Relaxed) / (1024 * 1024);
        let mb_per_s = if elapsed > 0.0 { mb as f64 / elapsed } else { 0.0 };
        log::info!(
            "{}: speed={speed:.2}/s percent={percent}% eta={eta} progress={done}/{} data={mb}M dataspeed={mb_per_s:.1}M/s",
            self.phase,
            self.total,
        );
    }
}

fn fmt_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m{:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}
