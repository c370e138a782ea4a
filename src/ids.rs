//! Time-ordered identifiers
//!
//! Ids look like `dlv_20261017143005_001`: a prefix, the wall-clock second and
//! a counter that restarts each second. Uniqueness holds within one generator.
//! A restarted process can hand out an id again within the same second, so
//! callers check against what is already stored with [`IdGenerator::next_unused`].

use chrono::{DateTime, Utc};
use std::sync::Mutex;

pub const DELIVERY_PREFIX: &str = "dlv";
pub const FEEDBACK_PREFIX: &str = "fb";
pub const DRAFT_PREFIX: &str = "dft";
pub const EVENT_PREFIX: &str = "evt";

#[derive(Debug, Default)]
pub struct IdGenerator {
    state: Mutex<Counter>,
}

#[derive(Debug, Default)]
struct Counter {
    second: i64,
    seq: u32,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, prefix: &str) -> String {
        self.next_at(prefix, Utc::now())
    }

    /// Next id for which `taken` is false
    pub fn next_unused(&self, prefix: &str, taken: impl Fn(&str) -> bool) -> String {
        loop {
            let id = self.next(prefix);
            if !taken(&id) {
                return id;
            }
            tracing::debug!(id = %id, "Skipping id already in use");
        }
    }

    fn next_at(&self, prefix: &str, now: DateTime<Utc>) -> String {
        let second = now.timestamp();
        let seq = {
            let mut counter = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if counter.second == second {
                counter.seq += 1;
            } else {
                counter.second = second;
                counter.seq = 1;
            }
            counter.seq
        };

        format!("{}_{}_{:03}", prefix, now.format("%Y%m%d%H%M%S"), seq)
    }
}
