//! Adaptive readahead window sizing.
//!
//! The window grows aggressively (x4, then x2 past a midpoint) while reads
//! look sequential, and halves after a run of random-looking offsets. A
//! short rolling history of request sizes estimates throughput, which in
//! turn bounds the window: there is no point reading ahead further than the
//! link can deliver within one timeout.

use std::collections::VecDeque;
use std::time::Instant;

const INIT_WINDOW_SIZE: u32 = 1 << 16;
const DEFAULT_WINDOW_SIZE_LIMIT: u32 = 1 << 22;
const RANDOM_THRESHOLD: u32 = 3;
const HISTORY_ENTRY_LIFESPAN_US: i64 = (1 << 20) / 1000;
const HISTORY_CAPACITY: usize = 64;
const HISTORY_VALIDITY_THRESHOLD: usize = 3;

struct HistoryEntry {
    timestamp_us: i64,
    request_size: u32,
}

pub struct ReadaheadAdviser {
    current_offset: u64,
    window: u32,
    random_candidates: u32,
    max_window_size: u32,
    window_size_limit: u32,
    history: VecDeque<HistoryEntry>,
    requested_bytes: u64,
    started: Instant,
    timeout_ms: u32,
}

impl ReadaheadAdviser {
    pub fn new(timeout_ms: u32) -> Self {
        Self::with_limit(timeout_ms, DEFAULT_WINDOW_SIZE_LIMIT)
    }

    pub fn with_limit(timeout_ms: u32, window_size_limit: u32) -> Self {
        Self {
            current_offset: 0,
            window: INIT_WINDOW_SIZE,
            random_candidates: 0,
            max_window_size: window_size_limit,
            window_size_limit,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            requested_bytes: 0,
            started: Instant::now(),
            timeout_ms,
        }
    }

    /// Acknowledge a read and judge whether the stream still looks
    /// sequential.
    pub fn feed(&mut self, offset: u64, size: u32) {
        if self.timeout_ms == 0 {
            self.window = 0;
            return;
        }
        self.add_to_history(size);
        if offset == self.current_offset {
            self.random_candidates = 0;
            self.expand();
            self.current_offset = offset + size as u64;
        } else {
            self.random_candidates += 1;
            if self.random_candidates > RANDOM_THRESHOLD {
                self.reduce();
                self.current_offset = offset + size as u64;
            }
        }
    }

    /// Suggested readahead window, in bytes.
    pub fn window(&self) -> u32 {
        std::cmp::min(self.window, self.max_window_size)
    }

    fn add_to_history(&mut self, size: u32) {
        let timestamp = self.started.elapsed().as_micros() as i64;
        while self.history.len() >= HISTORY_CAPACITY
            || self
                .history
                .front()
                .map_or(false, |entry| entry.timestamp_us + HISTORY_ENTRY_LIFESPAN_US < timestamp)
        {
            match self.history.pop_front() {
                Some(entry) => self.requested_bytes -= entry.request_size as u64,
                None => break,
            }
        }

        self.history.push_back(HistoryEntry { timestamp_us: timestamp, request_size: size });
        self.requested_bytes += size as u64;

        let oldest = match self.history.front() {
            Some(entry) => entry.timestamp_us,
            None => return,
        };
        if self.history.len() >= HISTORY_VALIDITY_THRESHOLD && timestamp != oldest {
            self.adjust_max_window_size(timestamp, oldest);
        }
    }

    fn adjust_max_window_size(&mut self, timestamp_us: i64, oldest_us: i64) {
        let throughput_bytes_per_us =
            self.requested_bytes as f64 / (timestamp_us - oldest_us) as f64;
        let derived = 2.0 * throughput_bytes_per_us * self.timeout_ms as f64 * 1024.0;
        self.max_window_size =
            std::cmp::min(self.window_size_limit as u64, derived as u64) as u32;
        self.max_window_size = std::cmp::max(self.max_window_size, INIT_WINDOW_SIZE);
    }

    fn expand(&mut self) {
        if self.window >= self.max_window_size {
            return;
        }
        if self.window < self.max_window_size / 16 {
            self.window *= 4;
        } else {
            self.window *= 2;
        }
    }

    fn reduce(&mut self) {
        if self.window >= 2 * INIT_WINDOW_SIZE {
            self.window /= 2;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_reads_grow_the_window() {
        let mut adviser = ReadaheadAdviser::new(1024);
        let mut window = 0;
        for i in 0..32u64 {
            adviser.feed(i * 65536, 65536);
            assert!(adviser.window() >= window);
            window = adviser.window();
        }
        assert!(window > INIT_WINDOW_SIZE);
    }

    #[test]
    fn reads_with_holes_shrink_the_window() {
        let mut adviser = ReadaheadAdviser::new(1024);
        let mut i = 0u64;
        while i < 8 {
            adviser.feed(i * 65536, 65536 - 1000 * i as u32);
            i += 1;
        }
        let mut window = adviser.window();
        while i < 16 {
            adviser.feed(i * 65536, 65536 - 1000 * i as u32);
            assert!(adviser.window() <= window);
            window = adviser.window();
            i += 1;
        }
    }

    #[test]
    fn window_respects_limit() {
        let limit = 1 << 18;
        let mut adviser = ReadaheadAdviser::with_limit(1024, limit);
        for i in 0..256u64 {
            adviser.feed(i * 65536, 65536);
            assert!(adviser.window() <= limit);
        }
    }

    #[test]
    fn random_run_settles_near_initial_window() {
        let mut adviser = ReadaheadAdviser::new(1024);
        for i in 0..16u64 {
            adviser.feed(i * 65536, 65536);
        }
        // long random run: offsets never line up
        for i in 0..64u64 {
            adviser.feed(i * 1_000_003, 4096);
        }
        assert!(adviser.window() <= 2 * INIT_WINDOW_SIZE);
    }

    #[test]
    fn zero_timeout_disables_readahead() {
        let mut adviser = ReadaheadAdviser::new(0);
        adviser.feed(0, 65536);
        assert_eq!(adviser.window(), 0);
    }
}
