//! Hang detection over the Agent's log.
//!
//! Every supervisor tick records the latest log line into a ring buffer sized
//! to `limit_minutes * 60` ticks. Once the ring has been filled at least once
//! and every slot holds the same value, nothing distinguishable reached the
//! log for a whole window and the run is considered stuck. A slow Agent that
//! writes anything new within the window never trips it.

/// Value recorded for ticks where the window has no lines yet.
pub const EMPTY_WINDOW: &str = "<empty>";

#[derive(Debug)]
pub struct StagnationTimeout {
    limit_minutes: u32,
    slots: Vec<String>,
    next: usize,
    filled: bool,
}

impl StagnationTimeout {
    /// One slot per one-second tick for `limit_minutes` minutes.
    pub fn new(limit_minutes: u32) -> Self {
        Self::with_capacity(limit_minutes, limit_minutes as usize * 60)
    }

    /// Explicit capacity, for tick periods other than one second.
    pub fn with_capacity(limit_minutes: u32, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            limit_minutes,
            slots: vec![String::new(); capacity],
            next: 0,
            filled: false,
        }
    }

    /// Record this tick's latest line. `None` records the empty placeholder.
    pub fn record(&mut self, latest: Option<&str>) {
        let value = latest.unwrap_or(EMPTY_WINDOW);
        let slot = &mut self.slots[self.next];
        slot.clear();
        slot.push_str(value);
        self.next += 1;
        if self.next == self.slots.len() {
            self.next = 0;
            self.filled = true;
        }
    }

    /// True when the ring is full and holds a single distinct value.
    pub fn fired(&self) -> bool {
        self.filled && self.slots.windows(2).all(|pair| pair[0] == pair[1])
    }

    pub fn limit_minutes(&self) -> u32 {
        self.limit_minutes
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
