//! Live-updating latency HUD, grounded on `app/common/hud.hpp`/`.cpp`: an HDR histogram fed
//! one `Sample` at a time, periodically rendered as a one-line summary (p50/p99/p999/max) and
//! a throughput figure derived from the counters snapshot delta since the last render.

use hdrhistogram::Histogram;
use std::time::{Duration, Instant};
use tcpbench_core::{CounterSnapshot, Sample};

/// 1ns floor, 1s ceiling, 3 significant figures — matches the source's histogram
/// construction constants (`hdr_init(1, 1_000_000_000, 3, ...)`).
const LOWEST_NS: u64 = 1;
const HIGHEST_NS: u64 = 1_000_000_000;
const SIG_FIGS: u8 = 3;

pub struct Hud {
    histogram: Histogram<u64>,
    last_render: Instant,
    last_counters: CounterSnapshot,
    render_interval: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct HudLine {
    pub p50_ns: u64,
    pub p99_ns: u64,
    pub p999_ns: u64,
    pub max_ns: u64,
    pub ops_per_sec: f64,
    pub bytes_per_sec: f64,
}

impl Hud {
    pub fn new(render_interval: Duration) -> Self {
        Self {
            histogram: Histogram::new_with_bounds(LOWEST_NS, HIGHEST_NS, SIG_FIGS)
                .expect("valid HDR histogram bounds"),
            last_render: Instant::now(),
            last_counters: CounterSnapshot::default(),
            render_interval,
        }
    }

    pub fn record(&mut self, sample: Sample) {
        let ns = sample.latency_ns().min(HIGHEST_NS);
        // Saturate rather than drop: a pathological outlier should show up as max, not vanish.
        let _ = self.histogram.record(ns.max(LOWEST_NS));
    }

    /// Returns a render line if at least `render_interval` has elapsed since the last one.
    pub fn tick(&mut self, counters: CounterSnapshot) -> Option<HudLine> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_render);
        if elapsed < self.render_interval {
            return None;
        }

        let delta_ops = counters.ops.saturating_sub(self.last_counters.ops);
        let delta_bytes = counters.bytes.saturating_sub(self.last_counters.bytes);
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);

        let line = HudLine {
            p50_ns: self.histogram.value_at_quantile(0.50),
            p99_ns: self.histogram.value_at_quantile(0.99),
            p999_ns: self.histogram.value_at_quantile(0.999),
            max_ns: self.histogram.max(),
            ops_per_sec: delta_ops as f64 / secs,
            bytes_per_sec: delta_bytes as f64 / secs,
        };

        self.last_render = now;
        self.last_counters = counters;
        Some(line)
    }

    pub fn histogram(&self) -> &Histogram<u64> {
        &self.histogram
    }

    pub fn reset(&mut self) {
        self.histogram.reset();
    }
}

impl HudLine {
    pub fn format(&self) -> String {
        format!(
            "p50={:>7}ns p99={:>7}ns p999={:>8}ns max={:>9}ns  {:.0} ops/s  {:.2} MB/s",
            self.p50_ns,
            self.p99_ns,
            self.p999_ns,
            self.max_ns,
            self.ops_per_sec,
            self.bytes_per_sec / (1024.0 * 1024.0)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantiles_track_recorded_samples() {
        let mut hud = Hud::new(Duration::from_millis(0));
        for ns in [100u64, 200, 300, 400, 500] {
            hud.record(Sample {
                send_ts: 0,
                recv_ts: ns,
            });
        }
        let line = hud.tick(CounterSnapshot::default()).unwrap();
        assert!(line.max_ns >= 500);
        assert!(line.p50_ns > 0);
    }

    #[test]
    fn tick_respects_render_interval() {
        let mut hud = Hud::new(Duration::from_secs(3600));
        hud.record(Sample {
            send_ts: 0,
            recv_ts: 100,
        });
        assert!(hud.tick(CounterSnapshot::default()).is_none());
    }
}
