use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::debug;

/// Count and volume inside one window at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub count: usize,
    pub volume: f64,
}

/// Bounded, time-ordered event buffer for one `(entity, rule)` pair.
#[derive(Debug)]
struct SlidingWindow {
    events: VecDeque<(DateTime<Utc>, f64)>,
    length: Duration,
    capacity: usize,
    /// Wall-clock time of the last record, independent of event timestamps.
    touched: DateTime<Utc>,
}

impl SlidingWindow {
    fn new(length: Duration, capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(64)),
            length,
            capacity,
            touched: Utc::now(),
        }
    }

    fn insert(&mut self, at: DateTime<Utc>, amount: f64) {
        // Late arrivals are placed in order so eviction stays a front pop.
        let pos = self.events.partition_point(|(t, _)| *t <= at);
        self.events.insert(pos, (at, amount));
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
    }

    fn evict_before(&mut self, cutoff: DateTime<Utc>) {
        while self.events.front().is_some_and(|(t, _)| *t < cutoff) {
            self.events.pop_front();
        }
    }

    fn stats_at(&self, at: DateTime<Utc>) -> WindowStats {
        let cutoff = at - self.length;
        let mut count = 0;
        let mut volume = 0.0;
        for (t, amount) in &self.events {
            if *t >= cutoff && *t <= at {
                count += 1;
                volume += amount;
            }
        }
        WindowStats { count, volume }
    }

    fn newest(&self) -> Option<DateTime<Utc>> {
        self.events.back().map(|(t, _)| *t)
    }
}

/// Per-entity sliding-window counters for velocity rules.
///
/// Each `(entity_id, rule_id)` key is its own map entry, so record-and-read
/// is one atomic step under that entry's shard lock. Different entities do
/// not contend on a common lock.
pub struct VelocityTracker {
    windows: DashMap<(String, String), SlidingWindow>,
    capacity: usize,
}

impl VelocityTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            windows: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record one transaction and return the window totals including it.
    pub fn record(
        &self,
        entity_id: &str,
        rule_id: &str,
        at: DateTime<Utc>,
        amount: f64,
        window: Duration,
    ) -> WindowStats {
        let key = (entity_id.to_string(), rule_id.to_string());
        let mut entry = self
            .windows
            .entry(key)
            .or_insert_with(|| SlidingWindow::new(window, self.capacity));
        let slot = entry.value_mut();
        // A rule edit may change the window length.
        slot.length = window;
        slot.touched = Utc::now();
        slot.insert(at, amount);
        if let Some(newest) = slot.newest() {
            slot.evict_before(newest - window);
        }
        slot.stats_at(at)
    }

    /// Current totals without recording anything.
    pub fn peek(&self, entity_id: &str, rule_id: &str, at: DateTime<Utc>) -> WindowStats {
        self.windows
            .get(&(entity_id.to_string(), rule_id.to_string()))
            .map(|w| w.stats_at(at))
            .unwrap_or(WindowStats {
                count: 0,
                volume: 0.0,
            })
    }

    /// Scheduled sweep. Events are trimmed against each window's newest
    /// event, since windows run on transaction time. A window is dropped once
    /// nothing has been recorded in it for longer than its length of wall
    /// clock, so a stream that lags `now` keeps its live windows.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| {
            if let Some(newest) = w.newest() {
                let length = w.length;
                w.evict_before(newest - length);
            }
            !w.events.is_empty() && now - w.touched <= w.length
        });
        let dropped = before.saturating_sub(self.windows.len());
        if dropped > 0 {
            debug!("Velocity sweep dropped {dropped} idle windows");
        }
        dropped
    }

    /// Most events one window keeps.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn tracked_windows(&self) -> usize {
        self.windows.len()
    }
}
