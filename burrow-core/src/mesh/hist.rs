//! Reply-latency histogram with power-of-two millisecond buckets
use std::time::Duration;

const NUM_BUCKETS: usize = 16;

/// Counts reply wait times. Bucket `i` covers waits below `1ms << i`; the
/// last bucket is a catch-all.
#[derive(Debug, Clone)]
pub struct Timehist {
    buckets: [u64; NUM_BUCKETS],
    count: u64,
}

impl Default for Timehist {
    fn default() -> Self {
        Self::new()
    }
}

impl Timehist {
    /// Empty histogram
    pub fn new() -> Self {
        Self {
            buckets: [0; NUM_BUCKETS],
            count: 0,
        }
    }

    fn bucket_for(wait: Duration) -> usize {
        let ms = wait.as_millis() as u64;
        for i in 0..NUM_BUCKETS - 1 {
            if ms < (1u64 << i) {
                return i;
            }
        }
        NUM_BUCKETS - 1
    }

    /// upper bound of bucket `i` in milliseconds
    fn upper_ms(i: usize) -> u64 {
        1u64 << i
    }

    /// Count one wait time
    pub fn add(&mut self, wait: Duration) {
        self.buckets[Self::bucket_for(wait)] += 1;
        self.count += 1;
    }

    /// Total number of samples
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Upper bound in milliseconds of the bucket holding the median sample,
    /// or 0 when empty
    pub fn median_ms(&self) -> u64 {
        if self.count == 0 {
            return 0;
        }
        let half = self.count.div_ceil(2);
        let mut seen = 0;
        for (i, n) in self.buckets.iter().enumerate() {
            seen += n;
            if seen >= half {
                return Self::upper_ms(i);
            }
        }
        Self::upper_ms(NUM_BUCKETS - 1)
    }

    /// Non-empty buckets as (upper bound ms, count), for stats logging
    pub fn filled(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, n)| **n > 0)
            .map(|(i, n)| (Self::upper_ms(i), *n))
    }
}
