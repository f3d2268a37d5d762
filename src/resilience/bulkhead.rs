//! Per-provider in-flight caps.
//!
//! The bulkhead bounds how many operations run concurrently against one
//! bucket id. Rejection is immediate (no queueing); release happens
//! through an RAII guard so every exit path decrements the counter.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{LlmError, Result};

/// Process-wide in-flight counters, one per bucket id.
#[derive(Debug, Default)]
pub struct Bulkhead {
    slots: Mutex<HashMap<String, usize>>,
}

impl Bulkhead {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a slot for `bucket_id`.
    ///
    /// With `max = None` the bulkhead is disabled for this operation and
    /// the returned guard is a no-op. Otherwise fails with
    /// [`LlmError::ConcurrencyExceeded`] when `max` operations are
    /// already in flight.
    pub fn acquire(&self, bucket_id: &str, max: Option<usize>) -> Result<BulkheadGuard<'_>> {
        let Some(max) = max else {
            return Ok(BulkheadGuard {
                bulkhead: self,
                bucket_id: None,
            });
        };

        let mut slots = self.slots.lock().unwrap();
        let count = slots.entry(bucket_id.to_string()).or_insert(0);
        if *count >= max {
            return Err(LlmError::ConcurrencyExceeded(bucket_id.to_string()));
        }
        *count += 1;
        Ok(BulkheadGuard {
            bulkhead: self,
            bucket_id: Some(bucket_id.to_string()),
        })
    }

    /// Current in-flight count for a bucket id.
    pub fn in_flight(&self, bucket_id: &str) -> usize {
        self.slots
            .lock()
            .unwrap()
            .get(bucket_id)
            .copied()
            .unwrap_or(0)
    }

    fn release(&self, bucket_id: &str) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(count) = slots.get_mut(bucket_id) {
            *count = count.saturating_sub(1);
        }
    }
}

/// Releases its slot on drop.
#[derive(Debug)]
pub struct BulkheadGuard<'a> {
    bulkhead: &'a Bulkhead,
    /// `None` for the unlimited no-op guard.
    bucket_id: Option<String>,
}

impl Drop for BulkheadGuard<'_> {
    fn drop(&mut self) {
        if let Some(bucket_id) = &self.bucket_id {
            self.bulkhead.release(bucket_id);
        }
    }
}
