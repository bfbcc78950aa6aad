//! Session statistics shared between capture threads, the mux worker and readers

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Drop rate over the window above which a warning is logged
pub const DROP_RATE_THRESHOLD: f64 = 0.05;
pub const DROP_RATE_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct Clock {
    started: Option<Instant>,
    /// Elapsed time frozen at stop
    frozen: Option<Duration>,
}

/// Live counters for one capture session
#[derive(Debug, Default)]
pub struct Statistics {
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    audio_units_written: AtomicU64,
    audio_units_dropped: AtomicU64,
    file_size_bytes: AtomicU64,
    clock: Mutex<Clock>,
}

/// Point-in-time copy of [`Statistics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub audio_units_written: u64,
    pub audio_units_dropped: u64,
    pub average_fps: f64,
    pub file_size_bytes: u64,
    pub elapsed_secs: f64,
}

impl StatsSnapshot {
    pub fn file_size_mb(&self) -> f64 {
        self.file_size_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Frames per second over `elapsed`; zero before any time has passed
pub fn average_fps(frames: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        frames as f64 / secs
    } else {
        0.0
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero every counter and restart the clock
    pub fn reset(&self) {
        for counter in [
            &self.frames_captured,
            &self.frames_dropped,
            &self.audio_units_written,
            &self.audio_units_dropped,
            &self.file_size_bytes,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
        let mut clock = self.clock.lock().unwrap_or_else(|e| e.into_inner());
        clock.started = Some(Instant::now());
        clock.frozen = None;
    }

    /// Stop the clock; `average_fps` stays fixed from here on
    pub fn freeze(&self) {
        let mut clock = self.clock.lock().unwrap_or_else(|e| e.into_inner());
        if clock.frozen.is_none() {
            clock.frozen = Some(clock.started.map(|s| s.elapsed()).unwrap_or_default());
        }
    }

    pub fn elapsed(&self) -> Duration {
        let clock = self.clock.lock().unwrap_or_else(|e| e.into_inner());
        match (clock.frozen, clock.started) {
            (Some(frozen), _) => frozen,
            (None, Some(started)) => started.elapsed(),
            (None, None) => Duration::ZERO,
        }
    }

    pub fn record_frame_written(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_audio_written(&self) {
        self.audio_units_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_audio_dropped(&self) {
        self.audio_units_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_file_size(&self, bytes: u64) {
        self.file_size_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let elapsed = self.elapsed();
        let frames_captured = self.frames_captured.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_captured,
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            audio_units_written: self.audio_units_written.load(Ordering::Relaxed),
            audio_units_dropped: self.audio_units_dropped.load(Ordering::Relaxed),
            average_fps: average_fps(frames_captured, elapsed),
            file_size_bytes: self.file_size_bytes.load(Ordering::Relaxed),
            elapsed_secs: elapsed.as_secs_f64(),
        }
    }
}

/// Sliding-window video drop rate
#[derive(Debug)]
pub struct DropRateMonitor {
    window: Duration,
    threshold: f64,
    samples: VecDeque<(Instant, u64, u64)>,
}

impl Default for DropRateMonitor {
    fn default() -> Self {
        Self::new(DROP_RATE_WINDOW, DROP_RATE_THRESHOLD)
    }
}

impl DropRateMonitor {
    pub fn new(window: Duration, threshold: f64) -> Self {
        Self {
            window,
            threshold,
            samples: VecDeque::new(),
        }
    }

    /// Record cumulative counters at `now`; returns the windowed drop rate
    /// when it exceeds the threshold
    pub fn observe(&mut self, now: Instant, captured: u64, dropped: u64) -> Option<f64> {
        self.samples.push_back((now, captured, dropped));
        while self.samples.len() > 1 {
            match self.samples.front() {
                Some(&(at, _, _)) if now.duration_since(at) > self.window => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }

        let &(_, first_captured, first_dropped) = self.samples.front()?;
        let captured = captured.saturating_sub(first_captured);
        let dropped = dropped.saturating_sub(first_dropped);
        let total = captured + dropped;
        if total == 0 {
            return None;
        }
        let rate = dropped as f64 / total as f64;
        (rate > self.threshold).then_some(rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_fps() {
        assert!((average_fps(300, Duration::from_secs(10)) - 30.0).abs() < 1e-9);
        assert!((average_fps(1001, Duration::from_millis(33_367)) - 1001.0 / 33.367).abs() < 1e-9);
        assert_eq!(average_fps(10, Duration::ZERO), 0.0);
    }

    #[test]
    fn test_reset_and_freeze() {
        let stats = Statistics::new();
        stats.record_frame_written();
        stats.record_frame_dropped();
        stats.record_audio_written();
        stats.set_file_size(3 * 1024 * 1024);
        let snap = stats.snapshot();
        assert_eq!(snap.frames_captured, 1);
        assert_eq!(snap.frames_dropped, 1);
        assert_eq!(snap.audio_units_written, 1);
        assert!((snap.file_size_mb() - 3.0).abs() < 1e-9);
        // clock never started
        assert_eq!(snap.elapsed_secs, 0.0);

        stats.reset();
        assert_eq!(stats.snapshot().frames_captured, 0);
        std::thread::sleep(Duration::from_millis(5));
        stats.freeze();
        let frozen = stats.elapsed();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(stats.elapsed(), frozen);
        assert!(frozen >= Duration::from_millis(5));
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(StatsSnapshot {
            frames_captured: 60,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(json["frames_captured"], 60);
        assert_eq!(json["average_fps"], 0.0);
    }

    #[test]
    fn test_drop_rate_window() {
        let mut monitor = DropRateMonitor::default();
        let t0 = Instant::now();
        assert_eq!(monitor.observe(t0, 0, 0), None);
        assert_eq!(monitor.observe(t0 + Duration::from_secs(1), 30, 0), None);
        // 10 of 70 units dropped inside the window
        let rate = monitor.observe(t0 + Duration::from_secs(2), 60, 10).unwrap();
        assert!((rate - 0.1428571).abs() < 1e-6);

        // the burst ages out of the 5 s window
        for s in 3..=8u64 {
            monitor.observe(t0 + Duration::from_secs(s), 60 + (s - 2) * 30, 10);
        }
        assert_eq!(monitor.observe(t0 + Duration::from_secs(9), 270, 10), None);
    }
}
