//! Per-business latency tracking.
//!
//! Each business gets a [`LatencyTimeWindow`] holding an exponential moving
//! average of recent call latencies. The average is kept in fixed point,
//! scaled by 1024, so small latencies still move it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

const FIXED_POINT_SHIFT: u32 = 10;

/// Marker for a window that has not seen a sample yet. A real average is
/// clamped below it.
const UNSEEDED: u64 = u64::MAX;

/// Exponential moving average of latency for one business.
///
/// `push` computes `ema' = ((latency << 10) + ema * (window - 1)) / window`
/// as a single atomic update. The first sample seeds the average directly.
#[derive(Debug)]
pub struct LatencyTimeWindow {
    /// EMA scaled by 1024 (`UNSEEDED` until the first sample)
    ema: AtomicU64,
    window_size: AtomicU64,
}

impl LatencyTimeWindow {
    /// Creates a window of the given size (clamped to at least 1).
    pub fn new(window_size: u64) -> Self {
        Self {
            ema: AtomicU64::new(UNSEEDED),
            window_size: AtomicU64::new(window_size.max(1)),
        }
    }

    /// Feeds one latency sample and returns the new average.
    pub fn push(&self, latency: u64) -> u64 {
        let window = self.window_size.load(Ordering::Relaxed).max(1) as u128;
        let scaled = (latency as u128) << FIXED_POINT_SHIFT;

        let previous = self
            .ema
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |ema| {
                Some(Self::next_ema(ema, scaled, window))
            })
            .unwrap_or_else(|ema| ema);

        Self::next_ema(previous, scaled, window) as u64 >> FIXED_POINT_SHIFT
    }

    fn next_ema(ema: u64, scaled: u128, window: u128) -> u64 {
        let next = if ema == UNSEEDED {
            scaled
        } else {
            (scaled + ema as u128 * (window - 1)) / window
        };
        next.min((UNSEEDED - 1) as u128) as u64
    }

    /// Current average latency (integer part), 0 before the first sample.
    pub fn get_avg_latency(&self) -> u64 {
        match self.ema.load(Ordering::Acquire) {
            UNSEEDED => 0,
            ema => ema >> FIXED_POINT_SHIFT,
        }
    }

    /// Changes the window size. Zero is ignored.
    pub fn set_window_size(&self, window_size: u64) {
        if window_size == 0 {
            return;
        }
        self.window_size.store(window_size, Ordering::Relaxed);
    }

    pub fn window_size(&self) -> u64 {
        self.window_size.load(Ordering::Relaxed)
    }
}

/// Business name to latency window map.
///
/// Only businesses with a configured window are tracked; samples for others
/// are ignored. The map lock is taken for writing only when whole windows are
/// added or removed.
#[derive(Debug, Default)]
pub struct LatencyTimeSnapshot {
    windows: RwLock<HashMap<String, Arc<LatencyTimeWindow>>>,
}

impl LatencyTimeSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates, resizes or (with size 0) removes the window for `biz_name`.
    pub fn update_latency_time_window(&self, biz_name: &str, window_size: u64) {
        if window_size == 0 {
            self.windows.write().unwrap().remove(biz_name);
            return;
        }

        if let Some(window) = self.windows.read().unwrap().get(biz_name) {
            window.set_window_size(window_size);
            return;
        }

        self.windows
            .write()
            .unwrap()
            .entry(biz_name.to_string())
            .or_insert_with(|| Arc::new(LatencyTimeWindow::new(window_size)))
            .set_window_size(window_size);
    }

    /// Feeds a sample for `biz_name`; returns the new average if tracked.
    pub fn push(&self, biz_name: &str, latency: u64) -> Option<u64> {
        let window = self.windows.read().unwrap().get(biz_name).cloned()?;
        Some(window.push(latency))
    }

    /// Average latency for `biz_name`, if tracked.
    pub fn get_avg_latency(&self, biz_name: &str) -> Option<u64> {
        self.windows
            .read()
            .unwrap()
            .get(biz_name)
            .map(|window| window.get_avg_latency())
    }

    pub fn window(&self, biz_name: &str) -> Option<Arc<LatencyTimeWindow>> {
        self.windows.read().unwrap().get(biz_name).cloned()
    }

    pub fn tracked_biz_count(&self) -> usize {
        self.windows.read().unwrap().len()
    }
}
