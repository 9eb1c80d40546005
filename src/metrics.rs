//! Prometheus-style counters for the relay and the simulation tick
//!
//! Counters are plain atomics so the relay threads and the tick loop can
//! update them without coordination. `render()` produces the text exposition
//! format.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

const TICK_HISTORY: usize = 1000;

fn metric(output: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    let _ = write!(
        output,
        "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n"
    );
}

/// Traffic through one `ProcessRelay`
#[derive(Debug, Default)]
pub struct RelayStats {
    pub frames_in: AtomicU64,
    pub frames_out: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub heartbeats_in: AtomicU64,
    pub heartbeats_out: AtomicU64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self, bytes: usize) {
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Count a complete inbound frame
    pub fn record_frame_in(&self, payload_len: usize) {
        if payload_len == 0 {
            self.heartbeats_in.fetch_add(1, Ordering::Relaxed);
        } else {
            self.frames_in.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count a written frame, length prefix included in the byte total
    pub fn record_frame_out(&self, payload_len: usize, wire_len: usize) {
        if payload_len == 0 {
            self.heartbeats_out.fetch_add(1, Ordering::Relaxed);
        } else {
            self.frames_out.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_out.fetch_add(wire_len as u64, Ordering::Relaxed);
    }

    pub fn render(&self) -> String {
        let mut output = String::with_capacity(1024);
        metric(
            &mut output,
            "abyss_relay_frames_in_total",
            "Data frames received",
            "counter",
            self.frames_in.load(Ordering::Relaxed),
        );
        metric(
            &mut output,
            "abyss_relay_frames_out_total",
            "Data frames sent",
            "counter",
            self.frames_out.load(Ordering::Relaxed),
        );
        metric(
            &mut output,
            "abyss_relay_bytes_in_total",
            "Bytes read from the relay stream",
            "counter",
            self.bytes_in.load(Ordering::Relaxed),
        );
        metric(
            &mut output,
            "abyss_relay_bytes_out_total",
            "Bytes written to the relay stream",
            "counter",
            self.bytes_out.load(Ordering::Relaxed),
        );
        metric(
            &mut output,
            "abyss_relay_heartbeats_in_total",
            "Heartbeat frames received",
            "counter",
            self.heartbeats_in.load(Ordering::Relaxed),
        );
        metric(
            &mut output,
            "abyss_relay_heartbeats_out_total",
            "Heartbeat frames sent",
            "counter",
            self.heartbeats_out.load(Ordering::Relaxed),
        );
        output
    }
}

/// Simulation step counters
#[derive(Debug)]
pub struct TickStats {
    pub ticks: AtomicU64,
    pub spawns: AtomicU64,
    pub removals: AtomicU64,
    pub corrections_applied: AtomicU64,
    pub corrections_dropped: AtomicU64,

    pub tick_time_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,

    start_time: Instant,

    // Rolling tick times for percentile calculation
    tick_history: RwLock<VecDeque<u64>>,
}

impl TickStats {
    pub fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            spawns: AtomicU64::new(0),
            removals: AtomicU64::new(0),
            corrections_applied: AtomicU64::new(0),
            corrections_dropped: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(TICK_HISTORY)),
        }
    }

    pub fn record_mutations(&self, spawns: usize, removals: usize) {
        self.spawns.fetch_add(spawns as u64, Ordering::Relaxed);
        self.removals.fetch_add(removals as u64, Ordering::Relaxed);
    }

    pub fn record_corrections(&self, applied: usize, dropped: usize) {
        self.corrections_applied.fetch_add(applied as u64, Ordering::Relaxed);
        self.corrections_dropped.fetch_add(dropped as u64, Ordering::Relaxed);
    }

    /// Record a tick duration and update percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.ticks.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > TICK_HISTORY {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;
            self.tick_time_p99_us
                .store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us
                .store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn render(&self) -> String {
        let mut output = String::with_capacity(1024);
        metric(
            &mut output,
            "abyss_sim_ticks_total",
            "Simulation ticks processed",
            "counter",
            self.ticks.load(Ordering::Relaxed),
        );
        metric(
            &mut output,
            "abyss_sim_spawns_total",
            "Entities spawned by the mutation queue",
            "counter",
            self.spawns.load(Ordering::Relaxed),
        );
        metric(
            &mut output,
            "abyss_sim_removals_total",
            "Entities removed by the mutation queue",
            "counter",
            self.removals.load(Ordering::Relaxed),
        );
        metric(
            &mut output,
            "abyss_sim_corrections_applied_total",
            "Authoritative corrections applied",
            "counter",
            self.corrections_applied.load(Ordering::Relaxed),
        );
        metric(
            &mut output,
            "abyss_sim_corrections_dropped_total",
            "Corrections dropped as stale or malformed",
            "counter",
            self.corrections_dropped.load(Ordering::Relaxed),
        );
        metric(
            &mut output,
            "abyss_sim_tick_time_microseconds",
            "Last tick time",
            "gauge",
            self.tick_time_us.load(Ordering::Relaxed),
        );
        metric(
            &mut output,
            "abyss_sim_tick_time_p99_microseconds",
            "99th percentile tick time",
            "gauge",
            self.tick_time_p99_us.load(Ordering::Relaxed),
        );
        metric(
            &mut output,
            "abyss_sim_tick_time_max_microseconds",
            "Maximum tick time",
            "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed),
        );
        metric(
            &mut output,
            "abyss_sim_uptime_seconds",
            "Simulation uptime",
            "counter",
            self.uptime_seconds(),
        );
        output
    }
}

impl Default for TickStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_stats_split_heartbeats() {
        let stats = RelayStats::new();
        stats.record_frame_in(0);
        stats.record_frame_in(12);
        stats.record_frame_out(0, 2);
        stats.record_frame_out(5, 7);

        assert_eq!(stats.heartbeats_in.load(Ordering::Relaxed), 1);
        assert_eq!(stats.frames_in.load(Ordering::Relaxed), 1);
        assert_eq!(stats.heartbeats_out.load(Ordering::Relaxed), 1);
        assert_eq!(stats.bytes_out.load(Ordering::Relaxed), 9);
    }

    #[test]
    fn test_tick_percentiles() {
        let stats = TickStats::new();
        for us in 1..=100u64 {
            stats.record_tick_time(Duration::from_micros(us));
        }
        assert_eq!(stats.ticks.load(Ordering::Relaxed), 100);
        assert_eq!(stats.tick_time_max_us.load(Ordering::Relaxed), 100);
        assert!(stats.tick_time_p99_us.load(Ordering::Relaxed) >= 99);
    }

    #[test]
    fn test_render_format() {
        let stats = TickStats::new();
        stats.record_mutations(3, 1);
        let text = stats.render();
        assert!(text.contains("# TYPE abyss_sim_spawns_total counter\nabyss_sim_spawns_total 3\n"));
        assert!(text.contains("abyss_sim_removals_total 1\n"));

        assert!(RelayStats::new().render().contains("abyss_relay_frames_in_total 0"));
    }
}
