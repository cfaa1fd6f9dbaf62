//! 漏桶计数器：按固定速率排水，判断一次写入是否还能放进桶里。

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct LeakyBucket {
    rate: f64,
    capacity: f64,
    last_leak_at: Instant,
    remaining: f64,
}

impl LeakyBucket {
    /// 创建空桶，`rate` 为每秒排出的字节数，`capacity` 为桶容量（字节）。
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self::new_at(rate, capacity, Instant::now())
    }

    pub fn new_at(rate: f64, capacity: f64, now: Instant) -> Self {
        Self {
            rate,
            capacity,
            last_leak_at: now,
            remaining: 0.0,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    #[cfg(test)]
    pub fn remaining(&self) -> f64 {
        self.remaining
    }

    /// 先排水再尝试加水；放不下时返回 false 且水量不变。
    pub fn allow(&mut self, amount: f64) -> bool {
        self.allow_at(amount, Instant::now())
    }

    pub fn allow_at(&mut self, amount: f64, now: Instant) -> bool {
        self.leak(now);
        if amount <= 0.0 {
            return true;
        }
        if self.remaining + amount <= self.capacity {
            self.remaining += amount;
            true
        } else {
            false
        }
    }

    /// 距离能放下 `amount` 还需等待的时间；超过容量的写入永远放不下，返回 None。
    pub fn retry_after_at(&mut self, amount: f64, now: Instant) -> Option<Duration> {
        self.leak(now);
        if amount > self.capacity || self.rate <= 0.0 {
            return None;
        }
        let overflow = self.remaining + amount - self.capacity;
        if overflow <= 0.0 {
            return Some(Duration::ZERO);
        }
        Some(Duration::from_secs_f64(overflow / self.rate))
    }

    fn leak(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_leak_at).as_secs_f64();
        self.remaining = (self.remaining - elapsed * self.rate).max(0.0);
        self.last_leak_at = now;
    }
}
